//! Results sinks
//!
//! Branch results are series keyed by iteration. A sink receives them
//! either value by value from dump units during the run, or all at once
//! when the branch finishes.

use crate::config::ConfigAlias;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rex_expr::Value;
use std::collections::BTreeMap;

/// Values of one result name keyed by iteration
pub type Series = BTreeMap<usize, Value>;

/// All result series of a branch, by result name
pub type Results = IndexMap<String, Series>;

/// Destination of branch results
pub trait ResultsSink: Send + Sync {
    /// Receive the remaining results of a finished branch
    fn put(&self, branch: &str, results: Results, alias: &ConfigAlias);

    /// Receive one dumped value during the run
    fn record_value(&self, branch: &str, name: &str, iteration: usize, value: &Value);
}

/// Results stored for one branch by [`MemorySink`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BranchResults {
    /// Config alias given at `put`, empty until then
    pub alias: ConfigAlias,
    /// Result series
    pub results: Results,
}

/// In-memory sink merging dumped and final results per branch
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: Mutex<IndexMap<String, BranchResults>>,
}

impl MemorySink {
    /// Empty sink
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored results of one branch
    #[must_use]
    pub fn branch(&self, id: &str) -> Option<BranchResults> {
        self.inner.lock().get(id).cloned()
    }

    /// One series of one branch
    #[must_use]
    pub fn series(&self, id: &str, name: &str) -> Option<Series> {
        self.inner
            .lock()
            .get(id)
            .and_then(|branch| branch.results.get(name).cloned())
    }

    /// Ids of branches seen so far, in arrival order
    #[must_use]
    pub fn branch_ids(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    /// Export everything as JSON
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        let branches = inner
            .iter()
            .map(|(id, branch)| {
                let results = branch
                    .results
                    .iter()
                    .map(|(name, series)| {
                        let points = series
                            .iter()
                            .map(|(it, v)| (it.to_string(), v.to_json()))
                            .collect::<serde_json::Map<_, _>>();
                        (name.clone(), serde_json::Value::Object(points))
                    })
                    .collect::<serde_json::Map<_, _>>();
                let entry = serde_json::json!({
                    "config": branch.alias,
                    "results": results,
                });
                (id.clone(), entry)
            })
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(branches)
    }
}

impl ResultsSink for MemorySink {
    fn put(&self, branch: &str, results: Results, alias: &ConfigAlias) {
        let mut inner = self.inner.lock();
        let entry = inner.entry(branch.to_string()).or_default();
        entry.alias = alias.clone();
        for (name, series) in results {
            entry.results.entry(name).or_default().extend(series);
        }
    }

    fn record_value(&self, branch: &str, name: &str, iteration: usize, value: &Value) {
        self.inner
            .lock()
            .entry(branch.to_string())
            .or_default()
            .results
            .entry(name.to_string())
            .or_default()
            .insert(iteration, value.clone());
    }
}
