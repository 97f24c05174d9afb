//! In-process buffer of invocation outcomes awaiting flush to the shared store.
//!
//! `observe` is on the invocation hot path: it only touches a `DashMap`
//! shard and never waits on the store. `flush` runs on the evaluation cadence
//! and hands each buffered bucket to the store. Buckets whose write fails are
//! folded back into the buffer and retried on the next flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use super::FunctionId;
use super::period::{InvocationOutcome, ObservationPeriod, period_start};
use crate::store::HistoryStore;

/// Buffers outcome counts per `(function, period)` bucket
pub struct ObservationRecorder {
    period: Duration,
    max_buffered: usize,
    pending: DashMap<(FunctionId, u64), ObservationPeriod>,
    dropped: AtomicU64,
}

impl ObservationRecorder {
    /// Create a recorder bucketing by `period`, holding at most
    /// `max_buffered` distinct buckets between flushes
    #[must_use]
    pub fn new(period: Duration, max_buffered: usize) -> Self {
        Self {
            period,
            max_buffered,
            pending: DashMap::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Record one invocation outcome
    pub fn observe(&self, outcome: &InvocationOutcome) {
        let observation = outcome.to_observation(self.period);
        self.add(&outcome.function_id, &observation);
    }

    /// Record pre-aggregated counts for a function
    pub fn observe_counts(&self, function: &FunctionId, counts: &ObservationPeriod) {
        let mut observation = *counts;
        observation.period_start = period_start(counts.period_start, self.period);
        self.add(function, &observation);
    }

    fn add(&self, function: &FunctionId, observation: &ObservationPeriod) {
        let key = (function.clone(), observation.period_start);
        if let Some(mut existing) = self.pending.get_mut(&key) {
            existing.absorb(observation);
            return;
        }
        if self.pending.len() >= self.max_buffered {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                function = %function,
                buffered = self.pending.len(),
                dropped,
                "Observation buffer full, dropping outcome"
            );
            telemetry_metrics::counter!("function_watcher_observations_dropped_total").increment(1);
            return;
        }
        self.pending
            .entry(key)
            .or_insert_with(|| ObservationPeriod::new(observation.period_start))
            .absorb(observation);
    }

    /// Buckets waiting to be flushed
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Outcomes dropped because the buffer was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Take every buffered bucket, grouped by function
    pub fn drain(&self) -> HashMap<FunctionId, Vec<ObservationPeriod>> {
        let keys: Vec<(FunctionId, u64)> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut drained: HashMap<FunctionId, Vec<ObservationPeriod>> = HashMap::new();
        for key in keys {
            if let Some(((function, _), observation)) = self.pending.remove(&key) {
                drained.entry(function).or_default().push(observation);
            }
        }
        for observations in drained.values_mut() {
            observations.sort_by_key(|o| o.period_start);
        }
        drained
    }

    /// Put buckets back after a failed write
    pub fn requeue(&self, function: &FunctionId, observations: &[ObservationPeriod]) {
        for observation in observations {
            self.pending
                .entry((function.clone(), observation.period_start))
                .or_insert_with(|| ObservationPeriod::new(observation.period_start))
                .absorb(observation);
        }
    }

    /// Write every buffered bucket to the store.
    ///
    /// Returns the number of buckets written. Store failures are logged and
    /// the affected buckets requeued; they never propagate.
    pub async fn flush(&self, store: &dyn HistoryStore) -> usize {
        let mut written = 0;
        for (function, observations) in self.drain() {
            match store.append_observations(&function, &observations).await {
                Ok(()) => {
                    written += observations.len();
                }
                Err(e) => {
                    warn!(
                        function = %function,
                        periods = observations.len(),
                        error = %e,
                        "Failed to flush observations, requeueing"
                    );
                    self.requeue(&function, &observations);
                }
            }
        }
        if written > 0 {
            debug!(periods = written, "Flushed observations");
        }
        written
    }
}
