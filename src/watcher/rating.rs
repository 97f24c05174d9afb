//! Per-period reliability rating

use serde::{Deserialize, Serialize};

use super::period::ObservationPeriod;

/// Reliability rating of one merged observation period
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingPeriod {
    /// Start of the rated period (millis since epoch)
    pub period_start: u64,
    /// 0.0 = nothing works, 1.0 = everything works
    pub rating: f64,
}

impl RatingPeriod {
    /// Rate a merged observation period
    #[must_use]
    pub fn from_observation(observation: &ObservationPeriod) -> Self {
        Self {
            period_start: observation.period_start,
            rating: calculate_rating(observation),
        }
    }

    /// Rating lies within [0, 1] and is a number
    #[must_use]
    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.rating)
    }
}

/// Rate one observation period.
///
/// The function is only as healthy as its worse dimension: sync and async
/// success rates are computed separately and the minimum wins. A dimension
/// with no data counts as perfect, so idle functions are never penalised.
#[must_use]
pub fn calculate_rating(observation: &ObservationPeriod) -> f64 {
    let success_rate = ratio(observation.successes, observation.total());
    let async_success_rate = ratio(observation.async_successes, observation.async_total());

    1.0_f64.min(success_rate).min(async_success_rate)
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        part as f64 / total as f64
    }
}

/// Arithmetic mean of the given ratings, `None` when there are none
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn average_rating(ratings: &[RatingPeriod]) -> Option<f64> {
    if ratings.is_empty() {
        return None;
    }
    let sum: f64 = ratings.iter().map(|r| r.rating).sum();
    Some(sum / ratings.len() as f64)
}
