//! Function Watcher - reliability tracking for user-defined functions

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, ensure};
use chrono::{DateTime, Utc};
use clap::Parser;

use function_watcher::{
    cli::{Cli, Command},
    clock::{Clock, ManualClock},
    config::Config,
    setup_tracing,
    store::{FunctionHistory, HistoryStore, MemoryPool, SharedHistoryStore},
    watcher::{FunctionId, InvocationOutcome, Watcher},
};

/// Parameters of a `simulate` run
struct Simulation {
    function: String,
    cycles: u32,
    invocations: u64,
    failure_rate: f64,
    recover_after: Option<u32>,
    start: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Config => print_config(&config),
        Command::Evaluate { file, at } => run_evaluate(&config, &file, at.as_deref()).await,
        Command::Simulate {
            function,
            cycles,
            invocations,
            failure_rate,
            recover_after,
            start,
        } => {
            run_simulate(
                &config,
                Simulation {
                    function,
                    cycles,
                    invocations,
                    failure_rate,
                    recover_after,
                    start,
                },
            )
            .await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn print_config(config: &Config) -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    print!("{yaml}");
    Ok(())
}

/// Millis since epoch of an RFC 3339 instant, or of now
fn parse_instant(instant: Option<&str>) -> anyhow::Result<u64> {
    let millis = match instant {
        Some(s) => DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("Invalid RFC 3339 instant: {s}"))?
            .timestamp_millis(),
        None => Utc::now().timestamp_millis(),
    };
    u64::try_from(millis).context("Instant is before the Unix epoch")
}

fn format_instant(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map_or_else(|| millis.to_string(), |t| t.to_rfc3339())
}

/// Watcher over a fresh in-memory store
fn in_memory_watcher(
    config: &Config,
    clock: Arc<ManualClock>,
) -> (Watcher, Arc<SharedHistoryStore<MemoryPool>>) {
    let pool = Arc::new(MemoryPool::new(config.store.max_connections));
    let store = Arc::new(SharedHistoryStore::new(pool, &config.store, &config.policy));
    let watcher = Watcher::with_clock(config, store.clone(), clock);
    (watcher, store)
}

async fn run_evaluate(config: &Config, file: &Path, at: Option<&str>) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let history: FunctionHistory = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", file.display()))?;

    let clock = Arc::new(ManualClock::new(parse_instant(at)?));
    let (watcher, store) = in_memory_watcher(config, clock);
    let function = history.function_id.clone();

    store
        .append_observations(&function, &history.observations)
        .await?;
    store.append_ratings(&function, &history.ratings).await?;
    for state in &history.states {
        store.append_state(&function, *state).await?;
    }

    let evaluation = watcher.evaluate(&function).await?;
    if evaluation.changed() {
        eprintln!(
            "{}: {} -> {}",
            evaluation.function_id, evaluation.previous, evaluation.state
        );
    }

    let report = watcher.report(&function).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_simulate(config: &Config, sim: Simulation) -> anyhow::Result<()> {
    ensure!(
        (0.0..=1.0).contains(&sim.failure_rate),
        "--failure-rate must be within [0, 1], got {}",
        sim.failure_rate
    );

    let clock = Arc::new(ManualClock::new(parse_instant(sim.start.as_deref())?));
    let (watcher, _store) = in_memory_watcher(config, Arc::clone(&clock));
    let function = FunctionId::new(sim.function);
    let failing = ((sim.invocations as f64) * sim.failure_rate).round() as u64;

    println!("{:>5}  {:<32}  {:<22}  dispatched", "cycle", "time", "state");
    for cycle in 1..=sim.cycles {
        let now = clock.now_millis();
        let dispatched = watcher.is_allowed(&function).await;
        if dispatched {
            let failures = if sim.recover_after.is_some_and(|r| cycle > r) {
                0
            } else {
                failing
            };
            for i in 0..sim.invocations {
                let outcome = if i < failures {
                    InvocationOutcome::failure(function.clone(), now)
                } else {
                    InvocationOutcome::success(function.clone(), now)
                };
                watcher.observe(&outcome);
            }
        }

        clock.advance(config.policy.observation_period);
        watcher.flush().await;
        let evaluation = watcher.evaluate(&function).await?;
        println!(
            "{:>5}  {:<32}  {:<22}  {}",
            cycle,
            format_instant(now),
            evaluation.state.as_str(),
            if dispatched { "yes" } else { "no" }
        );
    }

    let report = watcher.report(&function).await?;
    println!("\n{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
