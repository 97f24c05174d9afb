//! Shared history store.
//!
//! Per function the store keeps three pruned collections:
//!
//! | key                            | entries             | capped by                  |
//! |--------------------------------|---------------------|----------------------------|
//! | `<ns>/<function>/observations` | `ObservationPeriod` | `max_recorded_observations` |
//! | `<ns>/<function>/ratings`      | `RatingPeriod`      | `max_recorded_ratings`     |
//! | `<ns>/<function>/states`       | `StatePeriod`       | `max_recorded_states`      |
//!
//! plus the set `<ns>/functions` of every function that ever reported.
//! Observations and states are lists; ratings are scored by period start so
//! each period holds at most one rating. Everything is pruned by count on
//! write and never deleted explicitly.

mod guard;
mod memory;
mod pool;
mod shared;

pub use guard::{PooledConnection, StoreGuard};
pub use memory::{MemoryConnection, MemoryPool};
pub use pool::{ConnectionPool, ListConnection};
pub use shared::SharedHistoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::watcher::{FunctionId, ObservationPeriod, RatingPeriod, StatePeriod};

/// Everything the store holds for one function, oldest entries first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionHistory {
    /// Function the history belongs to
    pub function_id: FunctionId,
    /// Raw (unmerged) observation records
    #[serde(default)]
    pub observations: Vec<ObservationPeriod>,
    /// Ratings, one per rated period
    #[serde(default)]
    pub ratings: Vec<RatingPeriod>,
    /// State transitions
    #[serde(default)]
    pub states: Vec<StatePeriod>,
}

impl FunctionHistory {
    /// History of a function nothing is known about
    #[must_use]
    pub fn empty(function_id: FunctionId) -> Self {
        Self {
            function_id,
            observations: Vec::new(),
            ratings: Vec::new(),
            states: Vec::new(),
        }
    }
}

/// Narrow interface to the externally owned history store.
///
/// Implementations must be `Send + Sync` because one store is shared by the
/// recorder, the evaluation loop and dispatch checks.
#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    /// Read a function's full history
    async fn load(&self, function: &FunctionId) -> Result<FunctionHistory>;

    /// Append raw observation records
    async fn append_observations(
        &self,
        function: &FunctionId,
        observations: &[ObservationPeriod],
    ) -> Result<()>;

    /// Record ratings for newly closed periods.
    ///
    /// A period that already has a rating keeps it. Returns how many of
    /// `ratings` were accepted.
    async fn append_ratings(
        &self,
        function: &FunctionId,
        ratings: &[RatingPeriod],
    ) -> Result<usize>;

    /// Append a state transition
    async fn append_state(&self, function: &FunctionId, state: StatePeriod) -> Result<()>;

    /// Every function that has reported observations
    async fn tracked_functions(&self) -> Result<Vec<FunctionId>>;
}

/// Builds namespaced store keys
#[derive(Debug, Clone)]
pub struct StoreKeys {
    namespace: String,
}

impl StoreKeys {
    /// Keys under `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Raw observations list
    #[must_use]
    pub fn observations(&self, function: &FunctionId) -> String {
        format!("{}/{function}/observations", self.namespace)
    }

    /// Ratings list
    #[must_use]
    pub fn ratings(&self, function: &FunctionId) -> String {
        format!("{}/{function}/ratings", self.namespace)
    }

    /// States list
    #[must_use]
    pub fn states(&self, function: &FunctionId) -> String {
        format!("{}/{function}/states", self.namespace)
    }

    /// Set of tracked functions
    #[must_use]
    pub fn functions(&self) -> String {
        format!("{}/functions", self.namespace)
    }
}
