//! Watcher integration tests - several workers sharing one history store

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use function_watcher::clock::{Clock, ManualClock};
use function_watcher::config::Config;
use function_watcher::store::{HistoryStore, MemoryPool, SharedHistoryStore};
use function_watcher::watcher::{FunctionId, InvocationOutcome, TrustState, Watcher};
use futures::future::join_all;
use pretty_assertions::assert_eq;

const START: u64 = 1_718_000_000_000;

fn test_config() -> Config {
    let mut config = Config::default();
    config.store.namespace = "function-watcher-test".to_string();
    config
}

struct Fleet {
    clock: Arc<ManualClock>,
    pool: Arc<MemoryPool>,
    store: Arc<SharedHistoryStore<MemoryPool>>,
    workers: Vec<Watcher>,
    period: Duration,
}

impl Fleet {
    fn new(config: &Config, workers: usize) -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let pool = Arc::new(MemoryPool::new(config.store.max_connections));
        let store = Arc::new(SharedHistoryStore::new(
            Arc::clone(&pool),
            &config.store,
            &config.policy,
        ));
        let workers = (0..workers)
            .map(|_| Watcher::with_clock(config, store.clone(), clock.clone()))
            .collect();
        Self {
            clock,
            pool,
            store,
            workers,
            period: config.policy.observation_period,
        }
    }

    /// Every worker runs `per_worker` invocations, then all flush and evaluate
    async fn period(
        &self,
        function: &FunctionId,
        per_worker: u64,
        failures: u64,
    ) -> Vec<TrustState> {
        let now = self.clock.now_millis();
        for worker in &self.workers {
            if !worker.is_allowed(function).await {
                continue;
            }
            for i in 0..per_worker {
                let outcome = if i < failures {
                    InvocationOutcome::failure(function.clone(), now)
                } else {
                    InvocationOutcome::success(function.clone(), now)
                };
                worker.observe(&outcome);
            }
        }
        self.clock.advance(self.period);

        let mut states = Vec::new();
        for worker in &self.workers {
            worker.flush().await;
        }
        for worker in &self.workers {
            states.push(worker.evaluate(function).await.unwrap().state);
        }
        states
    }
}

#[tokio::test]
async fn partial_counts_from_every_worker_are_merged() {
    let fleet = Fleet::new(&test_config(), 3);
    let f = FunctionId::from("fn-shared");

    fleet.period(&f, 4, 1).await;
    fleet.clock.advance(Duration::from_secs(20));
    fleet.workers[0].evaluate(&f).await.unwrap();

    let report = fleet.workers[1].report(&f).await.unwrap();
    assert_eq!(report.observation_periods.len(), 1);
    assert_eq!(report.observation_periods[0].successes, 9);
    assert_eq!(report.observation_periods[0].failures, 3);
    // Rated once, by whichever worker got there first
    assert_eq!(report.ratings.len(), 1);
    assert_eq!(report.ratings[0].rating, 0.75);
}

#[tokio::test]
async fn workers_agree_on_every_transition() {
    let fleet = Fleet::new(&test_config(), 3);
    let f = FunctionId::from("fn-failing");

    // Degrades to 0.6 first, then to 0.2
    let mut seen = Vec::new();
    for i in 0..14 {
        let failures = if i < 6 { 2 } else { 4 };
        let states = fleet.period(&f, 5, failures).await;
        assert!(states.windows(2).all(|w| w[0] == w[1]), "workers disagree: {states:?}");
        if seen.last() != Some(&states[0]) {
            seen.push(states[0]);
        }
    }

    assert_eq!(
        seen,
        vec![TrustState::Healthy, TrustState::Overflowed, TrustState::DisabledForPeriod]
    );
    // One recorded entry per transition despite three evaluators
    let history = fleet.store.load(&f).await.unwrap();
    assert_eq!(history.states.len(), 2);
}

#[tokio::test]
async fn full_lifecycle_to_permanent_disable_and_operator_reset() {
    let mut config = Config::load(None).unwrap();
    config.store.namespace = "function-watcher-test".to_string();
    let fleet = Fleet::new(&config, 2);
    let f = FunctionId::from("fn-broken");
    let budget = config.policy.temporary_disable_budget();

    let mut disables = 0;
    let mut final_state = TrustState::Healthy;
    for _ in 0..2_000 {
        final_state = fleet.period(&f, 10, 10).await[0];
        if final_state == TrustState::DisabledIndefinitely {
            break;
        }
        if final_state == TrustState::DisabledForPeriod {
            // Sit out the disable without traffic
            disables += 1;
            fleet.clock.advance(config.policy.disabled_period + fleet.period);
            assert_eq!(fleet.period(&f, 10, 10).await[0], TrustState::Overflowed);
        }
    }

    assert_eq!(final_state, TrustState::DisabledIndefinitely);
    assert_eq!(disables, budget);
    for worker in &fleet.workers {
        assert!(!worker.is_allowed(&f).await);
    }

    fleet.workers[0]
        .force_state(&f, TrustState::Healthy)
        .await
        .unwrap();
    for worker in &fleet.workers {
        assert!(worker.is_allowed(&f).await);
    }
    // The failures behind the ban are still in the rating window
    let evaluation = fleet.workers[0].evaluate(&f).await.unwrap();
    assert_eq!(evaluation.previous, TrustState::Healthy);
    assert_eq!(evaluation.state, TrustState::Overflowed);
}

#[tokio::test(start_paused = true)]
async fn concurrent_evaluators_rate_each_period_once() {
    let config = test_config();
    let fleet = Fleet::new(&config, 5);
    let f = FunctionId::from("fn-contended");
    fleet.pool.set_latency(Duration::from_millis(2));

    for _ in 0..30 {
        let now = fleet.clock.now_millis();
        for worker in &fleet.workers {
            worker.observe(&InvocationOutcome::failure(f.clone(), now));
        }
        fleet.clock.advance(fleet.period);
        join_all(fleet.workers.iter().map(Watcher::flush)).await;

        let evaluations = join_all(fleet.workers.iter().map(|w| w.evaluate(&f))).await;
        let written: usize = evaluations
            .into_iter()
            .map(|e| e.unwrap().ratings_written)
            .sum();
        assert!(written <= 1, "{written} ratings written for one closed period");
    }

    let max = config.policy.max_recorded_ratings;
    let ratings = fleet.store.load(&f).await.unwrap().ratings;
    let periods: BTreeSet<u64> = ratings.iter().map(|r| r.period_start).collect();
    assert_eq!(ratings.len(), max);
    assert_eq!(periods.len(), max);
    assert_eq!(fleet.pool.scored_len(&fleet.store.keys().ratings(&f)), max);
    // The newest closed periods are the ones retained
    let newest = fleet.clock.now_millis() - 20_000;
    assert_eq!(periods.last(), Some(&newest));
}

#[tokio::test]
async fn other_functions_are_unaffected() {
    let fleet = Fleet::new(&test_config(), 1);
    let bad = FunctionId::from("fn-bad");
    let good = FunctionId::from("fn-good");

    for _ in 0..8 {
        fleet.period(&bad, 10, 10).await;
        fleet.period(&good, 10, 0).await;
    }

    assert!(!fleet.workers[0].is_allowed(&bad).await);
    assert!(fleet.workers[0].is_allowed(&good).await);
    let mut tracked = fleet.store.tracked_functions().await.unwrap();
    tracked.sort();
    assert_eq!(tracked, vec![bad, good]);
}

#[tokio::test(start_paused = true)]
async fn slow_store_is_reported_but_not_abandoned() {
    let fleet = Fleet::new(&test_config(), 1);
    let f = FunctionId::from("fn-a");
    fleet.workers[0].observe(&InvocationOutcome::success(f.clone(), START));

    fleet.pool.set_latency(Duration::from_secs(6));
    assert_eq!(fleet.workers[0].flush().await, 1);
    assert!(fleet.store.guard().slow_operations() >= 1);
    assert_eq!(fleet.pool.in_use(), 0);

    fleet.pool.set_latency(Duration::ZERO);
    assert_eq!(fleet.store.load(&f).await.unwrap().observations.len(), 1);
}
