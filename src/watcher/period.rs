//! Observation periods: fixed-length buckets of invocation outcomes.
//!
//! Every worker records its own partial counts for a `(function, period)`
//! bucket. Delivery to the shared store is at-least-once, so the same bucket
//! shows up many times; [`merge_observations`] folds them into one aggregate
//! per period by summing each counter independently.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::FunctionId;

/// Align a timestamp to the start of the period that contains it.
///
/// A zero-length period leaves the timestamp untouched.
#[must_use]
pub fn period_start(timestamp_ms: u64, period: Duration) -> u64 {
    let period_ms = period.as_millis() as u64;
    if period_ms == 0 {
        return timestamp_ms;
    }
    (timestamp_ms / period_ms) * period_ms
}

/// Outcome counts for one function within one period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ObservationPeriod {
    /// Period start (millis since epoch, period-aligned once merged)
    pub period_start: u64,
    /// Successful invocations
    pub successes: u64,
    /// Failed invocations
    pub failures: u64,
    /// Successful asynchronous sub-operations
    #[serde(default)]
    pub async_successes: u64,
    /// Failed asynchronous sub-operations
    #[serde(default)]
    pub async_failures: u64,
}

impl ObservationPeriod {
    /// Empty bucket starting at `period_start`
    #[must_use]
    pub fn new(period_start: u64) -> Self {
        Self {
            period_start,
            ..Default::default()
        }
    }

    /// Add another record's counts into this one
    pub fn absorb(&mut self, other: &Self) {
        self.successes = self.successes.saturating_add(other.successes);
        self.failures = self.failures.saturating_add(other.failures);
        self.async_successes = self.async_successes.saturating_add(other.async_successes);
        self.async_failures = self.async_failures.saturating_add(other.async_failures);
    }

    /// Synchronous invocations in this period
    #[must_use]
    pub fn total(&self) -> u64 {
        self.successes.saturating_add(self.failures)
    }

    /// Asynchronous sub-operations in this period
    #[must_use]
    pub fn async_total(&self) -> u64 {
        self.async_successes.saturating_add(self.async_failures)
    }

    /// No outcomes recorded at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0 && self.async_total() == 0
    }
}

/// One invocation outcome as reported by the execution pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationOutcome {
    /// Function that ran
    pub function_id: FunctionId,
    /// When it ran (millis since epoch)
    pub timestamp_ms: u64,
    /// Whether the invocation itself succeeded
    pub succeeded: bool,
    /// Asynchronous sub-operations (e.g. fetches) that succeeded
    #[serde(default)]
    pub async_successes: u64,
    /// Asynchronous sub-operations that failed
    #[serde(default)]
    pub async_failures: u64,
}

impl InvocationOutcome {
    /// Successful invocation with no async work
    #[must_use]
    pub fn success(function_id: impl Into<FunctionId>, timestamp_ms: u64) -> Self {
        Self {
            function_id: function_id.into(),
            timestamp_ms,
            succeeded: true,
            async_successes: 0,
            async_failures: 0,
        }
    }

    /// Failed invocation with no async work
    #[must_use]
    pub fn failure(function_id: impl Into<FunctionId>, timestamp_ms: u64) -> Self {
        Self {
            succeeded: false,
            ..Self::success(function_id, timestamp_ms)
        }
    }

    /// Attach async sub-operation counts
    #[must_use]
    pub fn with_async(mut self, successes: u64, failures: u64) -> Self {
        self.async_successes = successes;
        self.async_failures = failures;
        self
    }

    /// The single-outcome observation this represents, bucketed by `period`
    #[must_use]
    pub fn to_observation(&self, period: Duration) -> ObservationPeriod {
        let (successes, failures) = if self.succeeded { (1, 0) } else { (0, 1) };
        ObservationPeriod {
            period_start: period_start(self.timestamp_ms, period),
            successes,
            failures,
            async_successes: self.async_successes,
            async_failures: self.async_failures,
        }
    }
}

/// Merge raw observation records into one aggregate per period.
///
/// Records are re-bucketed by `period` first, so unaligned timestamps from
/// older writers land in the right bucket. The output is sorted by period
/// start and contains each period once.
#[must_use]
pub fn merge_observations(
    observations: &[ObservationPeriod],
    period: Duration,
) -> Vec<ObservationPeriod> {
    let mut merged: BTreeMap<u64, ObservationPeriod> = BTreeMap::new();

    for observation in observations {
        let start = period_start(observation.period_start, period);
        merged
            .entry(start)
            .or_insert_with(|| ObservationPeriod::new(start))
            .absorb(observation);
    }

    merged.into_values().collect()
}
