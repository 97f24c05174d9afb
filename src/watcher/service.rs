//! The watcher control loop.
//!
//! [`Watcher`] ties the recorder, the shared store and the state deriver
//! together:
//!
//! - `observe` buffers outcomes in process (hot path, never touches the store)
//! - `flush` + `run_cycle` run on the evaluation cadence: buffered buckets are
//!   written, newly closed periods are rated, and derived states that differ
//!   from the recorded one are appended
//! - `current_state` / `is_allowed` answer dispatch questions from the stored
//!   history, falling back to the last known state when the store is down

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::FunctionId;
use super::period::{InvocationOutcome, ObservationPeriod, merge_observations};
use super::rating::{RatingPeriod, average_rating};
use super::recorder::ObservationRecorder;
use super::state::{CurrentState, StateDeriver, StatePeriod, TrustState};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, PolicyConfig};
use crate::store::{FunctionHistory, HistoryStore};
use crate::Result;

/// Outcome of evaluating one function
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    /// Function evaluated
    pub function_id: FunctionId,
    /// State before this evaluation
    pub previous: TrustState,
    /// State after this evaluation
    pub state: TrustState,
    /// Ratings the store accepted for newly closed periods
    pub ratings_written: usize,
}

impl Evaluation {
    /// Whether a new state period was recorded
    #[must_use]
    pub fn changed(&self) -> bool {
        self.previous != self.state
    }
}

/// Totals of one evaluation cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    /// Functions evaluated successfully
    pub evaluated: usize,
    /// State transitions recorded
    pub transitions: usize,
    /// Functions whose evaluation failed
    pub failures: usize,
}

/// Point-in-time view of one function's reliability
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionReport {
    /// Function described
    pub function_id: FunctionId,
    /// Derived trust state
    pub state: TrustState,
    /// When the recorded state was entered, `None` if never recorded
    pub state_since: Option<u64>,
    /// Mean of the ratings the decision is based on
    pub average_rating: Option<f64>,
    /// Ratings the decision is based on
    pub ratings_considered: usize,
    /// Temporary disables within the retained state window
    pub temporary_disables: usize,
    /// Merged observation periods on record
    pub observation_periods: Vec<ObservationPeriod>,
    /// Ratings on record
    pub ratings: Vec<RatingPeriod>,
}

/// Reliability watcher for a fleet of functions
pub struct Watcher {
    store: Arc<dyn HistoryStore>,
    recorder: ObservationRecorder,
    deriver: StateDeriver,
    policy: PolicyConfig,
    clock: Arc<dyn Clock>,
    known_states: DashMap<FunctionId, TrustState>,
}

impl Watcher {
    /// Create a watcher on the system clock
    #[must_use]
    pub fn new(config: &Config, store: Arc<dyn HistoryStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a watcher on an explicit clock
    #[must_use]
    pub fn with_clock(
        config: &Config,
        store: Arc<dyn HistoryStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            recorder: ObservationRecorder::new(
                config.policy.observation_period,
                config.evaluation.max_buffered_periods,
            ),
            deriver: StateDeriver::new(&config.policy),
            policy: config.policy.clone(),
            clock,
            known_states: DashMap::new(),
        }
    }

    /// The outcome buffer
    #[must_use]
    pub fn recorder(&self) -> &ObservationRecorder {
        &self.recorder
    }

    /// Buffer one invocation outcome
    pub fn observe(&self, outcome: &InvocationOutcome) {
        self.recorder.observe(outcome);
    }

    /// Write buffered outcomes to the store
    pub async fn flush(&self) -> usize {
        self.recorder.flush(self.store.as_ref()).await
    }

    /// Last state this process derived or recorded, without touching the store
    #[must_use]
    pub fn known_state(&self, function: &FunctionId) -> TrustState {
        self.known_states
            .get(function)
            .map_or(TrustState::Healthy, |s| *s)
    }

    /// Ratings a state decision is based on.
    ///
    /// With `judge_since_transition`, a recorded state is judged only on
    /// periods that started after it was entered.
    fn ratings_for_decision<'a>(
        &self,
        ratings: &'a [RatingPeriod],
        current: &CurrentState,
    ) -> &'a [RatingPeriod] {
        let start = match current {
            CurrentState::Recorded(p) if self.policy.judge_since_transition => {
                ratings.partition_point(|r| r.period_start < p.timestamp)
            }
            _ => 0,
        };
        &ratings[start..]
    }

    fn derive(
        &self,
        ratings: &[RatingPeriod],
        states: &[StatePeriod],
        now: u64,
    ) -> Result<TrustState> {
        let current = CurrentState::from_history(states, now);
        let considered = self.ratings_for_decision(ratings, &current);
        self.deriver.derive(considered, states, now)
    }

    /// Derive the current trust state from stored history.
    ///
    /// Never fails: when the history cannot be read the last known state is
    /// returned (healthy if none), so a store outage neither disables nor
    /// enables anything.
    pub async fn current_state(&self, function: &FunctionId) -> TrustState {
        let now = self.clock.now_millis();
        let derived = match self.store.load(function).await {
            Ok(history) => self.derive(&history.ratings, &history.states, now),
            Err(e) => Err(e),
        };
        match derived {
            Ok(state) => {
                self.known_states.insert(function.clone(), state);
                state
            }
            Err(e) if e.is_transient() => {
                let fallback = self.known_state(function);
                debug!(
                    function = %function,
                    error = %e,
                    state = %fallback,
                    "History unavailable, using last known state"
                );
                fallback
            }
            Err(e) => {
                let fallback = self.known_state(function);
                error!(
                    function = %function,
                    error = %e,
                    state = %fallback,
                    "State derivation failed"
                );
                fallback
            }
        }
    }

    /// Whether the pipeline may dispatch to `function`
    pub async fn is_allowed(&self, function: &FunctionId) -> bool {
        !self.current_state(function).await.is_disabled()
    }

    /// Rate newly closed periods, derive the state and record it if it changed.
    pub async fn evaluate(&self, function: &FunctionId) -> Result<Evaluation> {
        let now = self.clock.now_millis();
        let history = self.store.load(function).await?;

        let new_ratings = self.closed_unrated_periods(&history, now);
        let written = self.store.append_ratings(function, &new_ratings).await?;
        let ratings = if written == new_ratings.len() {
            let mut ratings = history.ratings;
            ratings.extend_from_slice(&new_ratings);
            ratings
        } else {
            // Another evaluator rated some of these periods first
            self.store.load(function).await?.ratings
        };

        let previous = CurrentState::from_history(&history.states, now).state();
        let state = self.derive(&ratings, &history.states, now).inspect_err(|e| {
            error!(function = %function, error = %e, "State derivation failed");
        })?;

        if state != previous {
            self.store
                .append_state(function, StatePeriod { timestamp: now, state })
                .await?;
            telemetry_metrics::counter!(
                "function_watcher_state_transitions_total",
                "state" => state.as_str()
            )
            .increment(1);
            if state.is_disabled() {
                warn!(function = %function, from = %previous, to = %state, "Function disabled");
            } else {
                info!(
                    function = %function,
                    from = %previous,
                    to = %state,
                    "Function trust state changed"
                );
            }
        }
        self.known_states.insert(function.clone(), state);

        Ok(Evaluation {
            function_id: function.clone(),
            previous,
            state,
            ratings_written: written,
        })
    }

    /// Periods old enough to trust and newer than the latest rating
    fn closed_unrated_periods(&self, history: &FunctionHistory, now: u64) -> Vec<RatingPeriod> {
        let watermark = history.ratings.last().map(|r| r.period_start);
        let mask = self.policy.rating_mask.as_millis() as u64;

        merge_observations(&history.observations, self.policy.observation_period)
            .iter()
            .filter(|o| watermark.is_none_or(|w| o.period_start > w))
            .filter(|o| o.period_start.saturating_add(mask) <= now)
            .map(RatingPeriod::from_observation)
            .collect()
    }

    /// Evaluate every tracked function once
    pub async fn run_cycle(&self) -> CycleSummary {
        let mut summary = CycleSummary::default();
        let functions = match self.store.tracked_functions().await {
            Ok(functions) => functions,
            Err(e) => {
                warn!(error = %e, "Could not list tracked functions, skipping cycle");
                summary.failures = 1;
                return summary;
            }
        };

        for function in functions {
            match self.evaluate(&function).await {
                Ok(evaluation) => {
                    summary.evaluated += 1;
                    if evaluation.changed() {
                        summary.transitions += 1;
                    }
                }
                Err(e) => {
                    summary.failures += 1;
                    warn!(function = %function, error = %e, "Evaluation failed");
                }
            }
        }
        debug!(
            evaluated = summary.evaluated,
            transitions = summary.transitions,
            failures = summary.failures,
            "Evaluation cycle finished"
        );
        summary
    }

    /// Record an operator-chosen state.
    ///
    /// This is the only way out of [`TrustState::DisabledIndefinitely`].
    pub async fn force_state(&self, function: &FunctionId, state: TrustState) -> Result<()> {
        let now = self.clock.now_millis();
        self.store
            .append_state(function, StatePeriod { timestamp: now, state })
            .await?;
        self.known_states.insert(function.clone(), state);
        warn!(function = %function, state = %state, "Trust state forced by operator");
        Ok(())
    }

    /// Snapshot of a function's reliability
    pub async fn report(&self, function: &FunctionId) -> Result<FunctionReport> {
        let now = self.clock.now_millis();
        let history = self.store.load(function).await?;
        let current = CurrentState::from_history(&history.states, now);
        let considered = self.ratings_for_decision(&history.ratings, &current);
        let state = self.deriver.derive(considered, &history.states, now)?;

        Ok(FunctionReport {
            function_id: function.clone(),
            state,
            state_since: match current {
                CurrentState::Recorded(p) => Some(p.timestamp),
                CurrentState::Implicit { .. } => None,
            },
            average_rating: average_rating(
                &considered[considered.len().saturating_sub(self.policy.max_recorded_ratings)..],
            ),
            ratings_considered: considered.len().min(self.policy.max_recorded_ratings),
            temporary_disables: self.deriver.temporary_disables(&history.states),
            observation_periods: merge_observations(
                &history.observations,
                self.policy.observation_period,
            ),
            ratings: history.ratings,
        })
    }
}

/// Spawn the flush + evaluation loop.
///
/// The task exits when the `shutdown` receiver fires, flushing once more on
/// the way out.
pub fn spawn_evaluation_loop(
    watcher: Arc<Watcher>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    watcher.flush().await;
                    watcher.run_cycle().await;
                }
                _ = shutdown.recv() => {
                    watcher.flush().await;
                    debug!("Evaluation loop shutting down");
                    break;
                }
            }
        }
    })
}
