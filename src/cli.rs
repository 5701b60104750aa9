//! Command-line interface for lokikit.
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// `--log-level` value: `off`, `error`, `warn`, `info`, `debug`, `trace`, or `0` (off)
/// through `5` (trace).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    pub fn filter(&self) -> LevelFilter {
        self.0
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Err("log level cannot be empty".into());
        }
        value.parse::<LevelFilter>().map(LogLevelArg).map_err(|_| {
            format!("invalid log level '{value}' (expected a level name or 0-5)")
        })
    }
}

/// Command-line interface for lokikit.
#[derive(Parser, Debug)]
#[command(name = "lokikit", version, author)]
#[command(about = "Minimal Loki + Promtail + Grafana stack launcher", long_about = None)]
pub struct Cli {
    /// Base directory for downloads, configs, logs and the PID file [default: ~/.lokikit].
    #[arg(long, value_name = "DIR", global = true)]
    pub base_dir: Option<String>,

    /// Host address to bind services to (e.g. 0.0.0.0 for all interfaces) [default: 127.0.0.1].
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port for the Grafana server [default: 3000].
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Port for the Loki server [default: 3100].
    #[arg(long, global = true)]
    pub loki_port: Option<u16>,

    /// Port for the Promtail server [default: 9080].
    #[arg(long, global = true)]
    pub promtail_port: Option<u16>,

    /// Path to a YAML configuration file overriding the defaults.
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<String>,

    /// Enable verbose logging for debugging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for lokikit.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download binaries and write config files.
    Setup,

    /// Start Loki, Promtail and Grafana.
    Start {
        /// Run services in the background and return to the terminal.
        #[arg(long)]
        background: bool,

        /// Restart even if services are already running.
        #[arg(long)]
        force: bool,

        /// Maximum time to wait for services to become reachable, in seconds.
        #[arg(long, default_value_t = 20)]
        timeout: u64,
    },

    /// Stop running services.
    Stop {
        /// Use SIGKILL immediately instead of a graceful SIGTERM.
        #[arg(long)]
        force: bool,
    },

    /// Check whether services are running.
    Status,

    /// Remove all downloaded files, configs and logs.
    Clean,

    /// Add a log path to the Promtail configuration.
    Watch {
        /// File or glob to watch.
        path: String,

        /// Job name for the log path.
        #[arg(long)]
        job: Option<String>,

        /// Labels in `key=value` form; may be repeated.
        #[arg(long = "label")]
        labels: Vec<String>,
    },

    /// Kill every lokikit process, including stale ones missing from the PID file.
    ForceQuit,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
