//! [`HistoryStore`] over any pooled list store, with every call guarded.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::guard::StoreGuard;
use super::pool::{ConnectionPool, ListConnection};
use super::{FunctionHistory, HistoryStore, StoreKeys};
use crate::Result;
use crate::config::{PolicyConfig, StoreConfig};
use crate::watcher::{FunctionId, ObservationPeriod, RatingPeriod, StatePeriod};

/// History store over a shared list store
pub struct SharedHistoryStore<P: ConnectionPool> {
    guard: StoreGuard<P>,
    keys: StoreKeys,
    max_observations: usize,
    max_ratings: usize,
    max_states: usize,
}

impl<P: ConnectionPool> SharedHistoryStore<P> {
    /// Create a store over `pool`
    #[must_use]
    pub fn new(pool: Arc<P>, store: &StoreConfig, policy: &PolicyConfig) -> Self {
        Self {
            guard: StoreGuard::new(pool, store),
            keys: StoreKeys::new(store.namespace.clone()),
            max_observations: store.max_recorded_observations,
            max_ratings: policy.max_recorded_ratings,
            max_states: policy.max_recorded_states,
        }
    }

    /// The access guard (for diagnostics)
    #[must_use]
    pub fn guard(&self) -> &StoreGuard<P> {
        &self.guard
    }

    /// Key builder
    #[must_use]
    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    async fn push(
        &self,
        description: &str,
        function: &FunctionId,
        key: String,
        values: Vec<String>,
        max_len: usize,
    ) -> Result<()> {
        let functions_key = self.keys.functions();
        let member = function.to_string();
        self.guard
            .run(description, move |conn| {
                Box::pin(async move {
                    conn.push_trimmed(&key, values, max_len).await?;
                    conn.add_member(&functions_key, &member).await?;
                    Ok(())
                })
            })
            .await
    }
}

fn encode<T: Serialize>(items: &[T]) -> Result<Vec<String>> {
    items
        .iter()
        .map(|item| serde_json::to_string(item).map_err(Into::into))
        .collect()
}

/// Parse entries, skipping malformed ones
fn decode<T: DeserializeOwned>(function: &FunctionId, list: &str, raw: &[String]) -> Vec<T> {
    raw.iter()
        .filter_map(|entry| match serde_json::from_str(entry) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(function = %function, list, error = %e, "Skipping malformed history entry");
                None
            }
        })
        .collect()
}

fn valid_ratings(function: &FunctionId, mut ratings: Vec<RatingPeriod>) -> Vec<RatingPeriod> {
    ratings.retain(|r| {
        let valid = r.is_valid();
        if !valid {
            warn!(
                function = %function,
                period = r.period_start,
                rating = r.rating,
                "Skipping out-of-range rating"
            );
        }
        valid
    });
    ratings
}

/// Collapse back-to-back duplicates of the same state
fn normalize_states(mut states: Vec<StatePeriod>) -> Vec<StatePeriod> {
    states.dedup_by_key(|s| s.state);
    states
}

#[async_trait]
impl<P: ConnectionPool> HistoryStore for SharedHistoryStore<P> {
    async fn load(&self, function: &FunctionId) -> Result<FunctionHistory> {
        let observations_key = self.keys.observations(function);
        let ratings_key = self.keys.ratings(function);
        let states_key = self.keys.states(function);

        let (observations, ratings, states) = self
            .guard
            .run("load function history", move |conn| {
                Box::pin(async move {
                    let observations = conn.range(&observations_key).await?;
                    let ratings = conn.range_by_score(&ratings_key).await?;
                    let states = conn.range(&states_key).await?;
                    Ok((observations, ratings, states))
                })
            })
            .await?;

        Ok(FunctionHistory {
            function_id: function.clone(),
            observations: decode(function, "observations", &observations),
            ratings: valid_ratings(function, decode(function, "ratings", &ratings)),
            states: normalize_states(decode(function, "states", &states)),
        })
    }

    async fn append_observations(
        &self,
        function: &FunctionId,
        observations: &[ObservationPeriod],
    ) -> Result<()> {
        if observations.is_empty() {
            return Ok(());
        }
        let values = encode(observations)?;
        self.push(
            "append observations",
            function,
            self.keys.observations(function),
            values,
            self.max_observations,
        )
        .await
    }

    async fn append_ratings(
        &self,
        function: &FunctionId,
        ratings: &[RatingPeriod],
    ) -> Result<usize> {
        if ratings.is_empty() {
            return Ok(0);
        }
        let entries: Vec<(u64, String)> = ratings
            .iter()
            .map(|r| r.period_start)
            .zip(encode(ratings)?)
            .collect();
        let key = self.keys.ratings(function);
        let functions_key = self.keys.functions();
        let member = function.to_string();
        let max_len = self.max_ratings;

        let accepted = self
            .guard
            .run("append ratings", move |conn| {
                Box::pin(async move {
                    let accepted = conn.add_scored(&key, entries, max_len).await?;
                    conn.add_member(&functions_key, &member).await?;
                    Ok(accepted)
                })
            })
            .await?;
        if accepted < ratings.len() {
            debug!(
                function = %function,
                offered = ratings.len(),
                accepted,
                "Periods already rated by another evaluator"
            );
        }
        telemetry_metrics::counter!("function_watcher_ratings_written_total")
            .increment(accepted as u64);
        Ok(accepted)
    }

    async fn append_state(&self, function: &FunctionId, state: StatePeriod) -> Result<()> {
        let values = encode(&[state])?;
        self.push(
            "append state",
            function,
            self.keys.states(function),
            values,
            self.max_states,
        )
        .await
    }

    async fn tracked_functions(&self) -> Result<Vec<FunctionId>> {
        let key = self.keys.functions();
        let members = self
            .guard
            .run("list tracked functions", move |conn| {
                Box::pin(async move { conn.members(&key).await })
            })
            .await?;
        Ok(members.into_iter().map(FunctionId::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPool;
    use crate::watcher::TrustState;
    use pretty_assertions::assert_eq;

    fn store() -> (Arc<MemoryPool>, SharedHistoryStore<MemoryPool>) {
        let pool = Arc::new(MemoryPool::new(4));
        let config = StoreConfig {
            namespace: "function-watcher-test".to_string(),
            max_recorded_observations: 5,
            ..Default::default()
        };
        let store =
            SharedHistoryStore::new(Arc::clone(&pool), &config, &PolicyConfig::default());
        (pool, store)
    }

    fn obs(ts: u64, s: u64, f: u64) -> ObservationPeriod {
        ObservationPeriod {
            period_start: ts,
            successes: s,
            failures: f,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unknown_function_has_empty_history() {
        let (_, store) = store();
        let f = FunctionId::from("never-seen");
        assert_eq!(store.load(&f).await.unwrap(), FunctionHistory::empty(f));
    }

    #[tokio::test]
    async fn round_trips_all_three_lists() {
        let (_, store) = store();
        let f = FunctionId::from("fn-a");
        store.append_observations(&f, &[obs(0, 1, 2)]).await.unwrap();
        store
            .append_ratings(&f, &[RatingPeriod { period_start: 0, rating: 0.25 }])
            .await
            .unwrap();
        store
            .append_state(&f, StatePeriod { timestamp: 5, state: TrustState::Overflowed })
            .await
            .unwrap();

        let history = store.load(&f).await.unwrap();
        assert_eq!(history.observations, vec![obs(0, 1, 2)]);
        assert_eq!(
            history.ratings,
            vec![RatingPeriod {
                period_start: 0,
                rating: 0.25
            }]
        );
        assert_eq!(
            history.states,
            vec![StatePeriod {
                timestamp: 5,
                state: TrustState::Overflowed
            }]
        );
        assert_eq!(store.tracked_functions().await.unwrap(), vec![f]);
    }

    #[tokio::test]
    async fn lists_never_exceed_caps() {
        let (pool, store) = store();
        let f = FunctionId::from("fn-a");
        for i in 0..40_u64 {
            store.append_observations(&f, &[obs(i * 10_000, 1, 0)]).await.unwrap();
            store
                .append_ratings(&f, &[RatingPeriod { period_start: i * 10_000, rating: 1.0 }])
                .await
                .unwrap();
            let state = if i % 2 == 0 { TrustState::Overflowed } else { TrustState::Healthy };
            store.append_state(&f, StatePeriod { timestamp: i, state }).await.unwrap();

            assert!(pool.list_len(&store.keys().observations(&f)) <= 5);
            assert!(pool.scored_len(&store.keys().ratings(&f)) <= 10);
            assert!(pool.list_len(&store.keys().states(&f)) <= 10);
        }

        let history = store.load(&f).await.unwrap();
        assert_eq!(history.observations.len(), 5);
        assert_eq!(history.observations[0].period_start, 350_000);
        assert_eq!(history.ratings.len(), 10);
        assert_eq!(history.ratings[0].period_start, 300_000);
        assert_eq!(history.states.len(), 10);
    }

    #[tokio::test]
    async fn first_rating_of_a_period_wins() {
        let (pool, store) = store();
        let f = FunctionId::from("fn-a");
        let first = RatingPeriod {
            period_start: 10_000,
            rating: 0.4,
        };
        let late = RatingPeriod {
            rating: 0.9,
            ..first
        };
        let next = RatingPeriod {
            period_start: 20_000,
            rating: 0.5,
        };

        assert_eq!(store.append_ratings(&f, &[first]).await.unwrap(), 1);
        assert_eq!(store.append_ratings(&f, &[late, next]).await.unwrap(), 1);

        assert_eq!(store.load(&f).await.unwrap().ratings, vec![first, next]);
        assert_eq!(pool.scored_len(&store.keys().ratings(&f)), 2);
    }

    #[tokio::test]
    async fn duplicate_states_collapse() {
        let (_, store) = store();
        let f = FunctionId::from("fn-a");
        let s = StatePeriod { timestamp: 1, state: TrustState::DisabledForPeriod };
        store.append_state(&f, s).await.unwrap();
        store
            .append_state(&f, StatePeriod { timestamp: 2, ..s })
            .await
            .unwrap();

        assert_eq!(store.load(&f).await.unwrap().states, vec![s]);
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let (pool, store) = store();
        let f = FunctionId::from("fn-a");
        store.append_observations(&f, &[obs(0, 1, 0)]).await.unwrap();
        let conn = pool.acquire().await.unwrap();
        conn.push_trimmed(&store.keys().observations(&f), vec!["{not json".into()], 5)
            .await
            .unwrap();
        conn.add_scored(
            &store.keys().ratings(&f),
            vec![(0, r#"{"period_start":0,"rating":7.5}"#.into())],
            10,
        )
        .await
        .unwrap();
        pool.release(conn);

        let history = store.load(&f).await.unwrap();
        assert_eq!(history.observations, vec![obs(0, 1, 0)]);
        assert!(history.ratings.is_empty());
    }

    #[tokio::test]
    async fn empty_appends_do_not_touch_the_store() {
        let (pool, store) = store();
        let f = FunctionId::from("fn-a");
        store.append_observations(&f, &[]).await.unwrap();
        assert_eq!(store.append_ratings(&f, &[]).await.unwrap(), 0);
        assert_eq!(pool.list_len(&store.keys().observations(&f)), 0);
        assert!(store.tracked_functions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_surfaces_transient_error() {
        let (pool, store) = store();
        pool.set_unavailable(true);
        let err = store.load(&FunctionId::from("fn-a")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(pool.in_use(), 0);
    }
}
