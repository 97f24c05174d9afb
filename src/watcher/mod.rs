//! Function health watching: observation, rating, trust-state derivation

mod period;
mod rating;
mod recorder;
mod service;
mod state;

pub use period::{InvocationOutcome, ObservationPeriod, merge_observations, period_start};
pub use rating::{RatingPeriod, average_rating, calculate_rating};
pub use recorder::ObservationRecorder;
pub use service::{CycleSummary, Evaluation, FunctionReport, Watcher, spawn_evaluation_loop};
pub use state::{CurrentState, StateDeriver, StatePeriod, TrustState};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a user-authored function
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(String);

impl FunctionId {
    /// Wrap an identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FunctionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for FunctionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for FunctionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
