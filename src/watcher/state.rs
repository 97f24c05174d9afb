//! Trust states and the escalation/recovery policy.
//!
//! ```text
//!            avg < overflow              avg < disable
//!  Healthy ─────────────────▶ Overflowed ─────────────▶ DisabledForPeriod
//!     ▲                          │  ▲                          │
//!     └──────────────────────────┘  └──────────────────────────┘
//!            avg > overflow             disabled_period elapsed
//!
//!  Overflowed ──(avg < disable, temporary-disable budget spent)──▶ DisabledIndefinitely
//! ```
//!
//! [`StateDeriver::derive`] is pure: the same rating and state history at the
//! same instant always yields the same state, so concurrent evaluators may
//! race without coordination.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::rating::{RatingPeriod, average_rating};
use crate::config::PolicyConfig;
use crate::{Error, Result};

/// Escalating trust classification, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    /// Runs normally
    #[default]
    Healthy,
    /// Runs at reduced priority (overflow lane)
    Overflowed,
    /// Not dispatched until the disable period passes
    DisabledForPeriod,
    /// Not dispatched until an operator intervenes
    DisabledIndefinitely,
}

impl TrustState {
    /// Any disabled variant
    #[must_use]
    pub fn is_disabled(self) -> bool {
        matches!(self, Self::DisabledForPeriod | Self::DisabledIndefinitely)
    }

    /// Stable lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Overflowed => "overflowed",
            Self::DisabledForPeriod => "disabled_for_period",
            Self::DisabledIndefinitely => "disabled_indefinitely",
        }
    }
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded trust-state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePeriod {
    /// When the state was entered (millis since epoch)
    pub timestamp: u64,
    /// The state entered
    pub state: TrustState,
}

/// The state a function is in right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentState {
    /// Last entry of the recorded history
    Recorded(StatePeriod),
    /// No history: healthy as of the evaluation instant
    Implicit {
        /// The evaluation instant
        since: u64,
    },
}

impl CurrentState {
    /// Latest recorded state, or the implicit healthy default
    #[must_use]
    pub fn from_history(states: &[StatePeriod], now_ms: u64) -> Self {
        states
            .last()
            .map_or(Self::Implicit { since: now_ms }, |p| Self::Recorded(*p))
    }

    /// The trust state
    #[must_use]
    pub fn state(&self) -> TrustState {
        match self {
            Self::Recorded(p) => p.state,
            Self::Implicit { .. } => TrustState::Healthy,
        }
    }

    /// When the state was entered
    #[must_use]
    pub fn since(&self) -> u64 {
        match self {
            Self::Recorded(p) => p.timestamp,
            Self::Implicit { since } => *since,
        }
    }
}

fn tail<T>(items: &[T], max: usize) -> &[T] {
    &items[items.len().saturating_sub(max)..]
}

/// Maps rating and state history to the next trust state
#[derive(Debug, Clone)]
pub struct StateDeriver {
    overflow_threshold: f64,
    disable_threshold: f64,
    disabled_period_ms: u64,
    min_observations: usize,
    max_recorded_states: usize,
    max_recorded_ratings: usize,
    temporary_disable_budget: usize,
}

impl StateDeriver {
    /// Build from policy configuration
    #[must_use]
    pub fn new(policy: &PolicyConfig) -> Self {
        Self {
            overflow_threshold: policy.overflow_threshold,
            disable_threshold: policy.disable_threshold,
            disabled_period_ms: policy.disabled_period.as_millis() as u64,
            min_observations: policy.min_observations,
            max_recorded_states: policy.max_recorded_states,
            max_recorded_ratings: policy.max_recorded_ratings,
            temporary_disable_budget: policy.temporary_disable_budget(),
        }
    }

    /// Temporary disables still inside the retained state window
    #[must_use]
    pub fn temporary_disables(&self, states: &[StatePeriod]) -> usize {
        tail(states, self.max_recorded_states)
            .iter()
            .filter(|p| p.state == TrustState::DisabledForPeriod)
            .count()
    }

    /// Derive the current trust state.
    ///
    /// `ratings` and `states` are oldest first. Only the most recent
    /// `max_recorded_states` states and `max_recorded_ratings` ratings count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invariant`] if a rating outside [0, 1] reaches the
    /// deriver.
    pub fn derive(
        &self,
        ratings: &[RatingPeriod],
        states: &[StatePeriod],
        now_ms: u64,
    ) -> Result<TrustState> {
        let states = tail(states, self.max_recorded_states);
        let current = CurrentState::from_history(states, now_ms);

        match current.state() {
            TrustState::DisabledIndefinitely => return Ok(TrustState::DisabledIndefinitely),
            TrustState::DisabledForPeriod => {
                // Expiry readmits at reduced trust; healthy needs another good evaluation.
                if now_ms.saturating_sub(current.since()) > self.disabled_period_ms {
                    return Ok(TrustState::Overflowed);
                }
                return Ok(TrustState::DisabledForPeriod);
            }
            TrustState::Healthy | TrustState::Overflowed => {}
        }

        if ratings.len() < self.min_observations {
            return Ok(current.state());
        }

        let ratings = tail(ratings, self.max_recorded_ratings);
        if let Some(bad) = ratings.iter().find(|r| !r.is_valid()) {
            return Err(Error::invariant(format!(
                "rating {} for period {} is outside [0, 1]",
                bad.rating, bad.period_start
            )));
        }
        let Some(average) = average_rating(ratings) else {
            return Ok(current.state());
        };

        let next = match current.state() {
            TrustState::Healthy if average < self.overflow_threshold => TrustState::Overflowed,
            TrustState::Overflowed if average > self.overflow_threshold => TrustState::Healthy,
            TrustState::Overflowed if average < self.disable_threshold => {
                if self.temporary_disables(states) >= self.temporary_disable_budget {
                    TrustState::DisabledIndefinitely
                } else {
                    TrustState::DisabledForPeriod
                }
            }
            state => state,
        };

        Ok(next)
    }
}
