//! Unit schedules
//!
//! A [`Schedule`] decides whether a unit fires at a given iteration. It only
//! looks at the iteration counters, never at branch data, so every branch
//! agrees on it.
//!
//! Literal forms, usable in config files:
//!
//! | literal        | meaning                                  |
//! |----------------|------------------------------------------|
//! | `3`            | every 3 iterations: 0, 3, 6, ...         |
//! | `0`            | iteration 0 only                         |
//! | `"last"`       | the last iteration only                  |
//! | `"#5"`, `"%5"` | iteration 5 only                         |
//! | `[...]`        | any of the listed triggers               |

use crate::error::ExperimentError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Single schedule predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Fires when `iteration % period == 0`; period 0 fires at iteration 0 only
    Every(usize),
    /// Fires at exactly this iteration
    At(usize),
    /// Fires on the last iteration
    Last,
}

impl Trigger {
    /// Periodic trigger; a zero period means iteration 0 only
    #[inline]
    #[must_use]
    pub fn every(period: usize) -> Self {
        if period == 0 {
            Self::At(0)
        } else {
            Self::Every(period)
        }
    }

    /// Check the trigger for one iteration
    #[inline]
    #[must_use]
    pub fn fires(self, iteration: usize, last: bool) -> bool {
        match self {
            Self::Every(0) => iteration == 0,
            Self::Every(period) => iteration % period == 0,
            Self::At(index) => iteration == index,
            Self::Last => last,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Every(period) => write!(f, "{period}"),
            Self::At(index) => write!(f, "#{index}"),
            Self::Last => f.write_str("last"),
        }
    }
}

impl FromStr for Trigger {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "last" {
            return Ok(Self::Last);
        }
        let invalid = || ExperimentError::InvalidSchedule(s.to_string());
        if let Some(index) = s.strip_prefix('#').or_else(|| s.strip_prefix('%')) {
            return index.parse().map(Self::At).map_err(|_| invalid());
        }
        s.parse().map(Self::every).map_err(|_| invalid())
    }
}

/// Set of triggers; fires when any of them fires
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Schedule(Vec<Trigger>);

impl Schedule {
    /// Fire every iteration
    #[inline]
    #[must_use]
    pub fn always() -> Self {
        Self(vec![Trigger::Every(1)])
    }

    /// Fire every `period` iterations; zero means iteration 0 only
    #[inline]
    #[must_use]
    pub fn every(period: usize) -> Self {
        Self(vec![Trigger::every(period)])
    }

    /// Fire at one iteration
    #[inline]
    #[must_use]
    pub fn at(index: usize) -> Self {
        Self(vec![Trigger::At(index)])
    }

    /// Fire at the last iteration only
    #[inline]
    #[must_use]
    pub fn last() -> Self {
        Self(vec![Trigger::Last])
    }

    /// Fire on any of `triggers`
    #[inline]
    #[must_use]
    pub fn any(triggers: impl IntoIterator<Item = Trigger>) -> Self {
        Self(triggers.into_iter().collect())
    }

    /// Add a trigger
    #[inline]
    #[must_use]
    pub fn or(mut self, trigger: Trigger) -> Self {
        self.0.push(trigger);
        self
    }

    /// Triggers of this schedule
    #[inline]
    #[must_use]
    pub fn triggers(&self) -> &[Trigger] {
        &self.0
    }

    /// Decide whether the unit fires
    ///
    /// `last` is the branch's sticky last-iteration flag; reaching
    /// `iteration + 1 == n_iters` also counts as last.
    #[must_use]
    pub fn fires(&self, iteration: usize, n_iters: Option<usize>, last: bool) -> bool {
        let last = last || n_iters.is_some_and(|n| iteration + 1 == n);
        self.0.iter().any(|trigger| trigger.fires(iteration, last))
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::always()
    }
}

impl From<Trigger> for Schedule {
    fn from(trigger: Trigger) -> Self {
        Self(vec![trigger])
    }
}

impl From<usize> for Schedule {
    fn from(period: usize) -> Self {
        Self::every(period)
    }
}

impl FromStr for Schedule {
    type Err = ExperimentError;

    /// Parse one trigger or a comma separated list of triggers
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let triggers = s
            .split(',')
            .map(Trigger::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(triggers))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TriggerLiteral {
    Period(usize),
    Text(String),
}

impl TriggerLiteral {
    fn into_trigger(self) -> Result<Trigger, ExperimentError> {
        match self {
            Self::Period(period) => Ok(Trigger::every(period)),
            Self::Text(text) => text.parse(),
        }
    }

    fn from_trigger(trigger: Trigger) -> Self {
        match trigger {
            Trigger::Every(period) => Self::Period(period),
            other => Self::Text(other.to_string()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScheduleLiteral {
    One(TriggerLiteral),
    Many(Vec<TriggerLiteral>),
}

impl<'de> Deserialize<'de> for Schedule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let literals = match ScheduleLiteral::deserialize(deserializer)? {
            ScheduleLiteral::One(one) => vec![one],
            ScheduleLiteral::Many(many) => many,
        };
        literals
            .into_iter()
            .map(TriggerLiteral::into_trigger)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

impl Serialize for Schedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let literals: Vec<TriggerLiteral> =
            self.0.iter().copied().map(TriggerLiteral::from_trigger).collect();
        match literals.as_slice() {
            [single] => single.serialize(serializer),
            _ => literals.serialize(serializer),
        }
    }
}
