//! Run observers
//!
//! A [`Monitor`] is notified synchronously from the thread that executed the
//! unit, so implementations must be cheap and thread-safe.

use crate::branch::Branch;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Observer of branch and unit lifecycle events
#[allow(unused_variables)]
pub trait Monitor: Send + Sync {
    /// Branch was created and is about to run
    fn branch_started(&self, branch: &Branch) {}

    /// Branch finished; its results are about to be flushed
    fn branch_finished(&self, branch: &Branch) {}

    /// Unit fired and returned normally
    fn unit_executed(&self, unit: &str, branch: &Branch) {}

    /// Unit failed with a formatted trace
    fn unit_failed(&self, unit: &str, branch: &Branch, message: &str) {}

    /// Unit's stream ended, which stops the branch
    fn iteration_stopped(&self, unit: &str, branch: &Branch) {}
}

/// Event captured by [`RecordingMonitor`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// Branch started
    BranchStarted {
        /// Branch id
        branch: String,
    },
    /// Branch finished
    BranchFinished {
        /// Branch id
        branch: String,
    },
    /// Unit executed
    UnitExecuted {
        /// Unit name
        unit: String,
        /// Branch id
        branch: String,
        /// Iteration
        iteration: usize,
    },
    /// Unit failed
    UnitFailed {
        /// Unit name
        unit: String,
        /// Branch id
        branch: String,
        /// Iteration
        iteration: usize,
        /// Formatted trace
        message: String,
    },
    /// Stream ended
    IterationStopped {
        /// Unit name
        unit: String,
        /// Branch id
        branch: String,
        /// Iteration
        iteration: usize,
    },
}

/// Event with its capture time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Capture time
    pub at: DateTime<Utc>,
    /// Event
    pub event: MonitorEvent,
}

/// Monitor that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    inner: Mutex<Vec<RecordedEvent>>,
}

impl RecordingMonitor {
    /// Empty recorder
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: MonitorEvent) {
        self.inner.lock().push(RecordedEvent {
            at: Utc::now(),
            event,
        });
    }

    /// Recorded events with timestamps
    #[must_use]
    pub fn recorded(&self) -> Vec<RecordedEvent> {
        self.inner.lock().clone()
    }

    /// Recorded events in capture order
    #[must_use]
    pub fn events(&self) -> Vec<MonitorEvent> {
        self.inner.lock().iter().map(|r| r.event.clone()).collect()
    }

    /// Count of events matching `predicate`
    #[must_use]
    pub fn count(&self, predicate: impl Fn(&MonitorEvent) -> bool) -> usize {
        self.inner.lock().iter().filter(|r| predicate(&r.event)).count()
    }
}

impl Monitor for RecordingMonitor {
    fn branch_started(&self, branch: &Branch) {
        self.record(MonitorEvent::BranchStarted {
            branch: branch.id().to_string(),
        });
    }

    fn branch_finished(&self, branch: &Branch) {
        self.record(MonitorEvent::BranchFinished {
            branch: branch.id().to_string(),
        });
    }

    fn unit_executed(&self, unit: &str, branch: &Branch) {
        self.record(MonitorEvent::UnitExecuted {
            unit: unit.to_string(),
            branch: branch.id().to_string(),
            iteration: branch.iteration(),
        });
    }

    fn unit_failed(&self, unit: &str, branch: &Branch, message: &str) {
        self.record(MonitorEvent::UnitFailed {
            unit: unit.to_string(),
            branch: branch.id().to_string(),
            iteration: branch.iteration(),
            message: message.to_string(),
        });
    }

    fn iteration_stopped(&self, unit: &str, branch: &Branch) {
        self.record(MonitorEvent::IterationStopped {
            unit: unit.to_string(),
            branch: branch.id().to_string(),
            iteration: branch.iteration(),
        });
    }
}
