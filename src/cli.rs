//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Function Watcher - reliability-based trust states for user-defined functions
#[derive(Parser, Debug)]
#[command(name = "function-watcher")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "FUNCTION_WATCHER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "warn",
        env = "FUNCTION_WATCHER_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "FUNCTION_WATCHER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the effective configuration as YAML
    Config,

    /// Derive the trust state of a recorded function history
    Evaluate {
        /// JSON dump of one function's history
        #[arg(required = true)]
        file: PathBuf,

        /// Evaluation instant (RFC 3339), defaults to now
        #[arg(long)]
        at: Option<String>,
    },

    /// Replay synthetic traffic through the watcher and print each state
    Simulate {
        /// Function id to simulate
        #[arg(long, default_value = "simulated-function")]
        function: String,

        /// Observation periods to simulate
        #[arg(long, default_value_t = 120)]
        cycles: u32,

        /// Invocations per period
        #[arg(long, default_value_t = 20)]
        invocations: u64,

        /// Fraction of invocations that fail, in [0, 1]
        #[arg(long, default_value_t = 1.0)]
        failure_rate: f64,

        /// Period after which every invocation succeeds
        #[arg(long)]
        recover_after: Option<u32>,

        /// Simulated start instant (RFC 3339), defaults to now
        #[arg(long)]
        start: Option<String>,
    },
}
