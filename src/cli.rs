//! Command-line interface for workbench.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// names ("info", "debug", ...) or numbers (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// Directive string for `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            _ => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            const LEVELS: [LevelFilter; 6] = [
                LevelFilter::OFF,
                LevelFilter::ERROR,
                LevelFilter::WARN,
                LevelFilter::INFO,
                LevelFilter::DEBUG,
                LevelFilter::TRACE,
            ];
            return LEVELS
                .get(number as usize)
                .copied()
                .map(LogLevelArg)
                .ok_or_else(|| format!("unsupported log level number '{number}' (expected 0-5)"));
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "off" => Ok(LevelFilter::OFF),
            "error" | "err" => Ok(LevelFilter::ERROR),
            "warn" | "warning" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(format!("invalid log level '{trimmed}'")),
        }
        .map(LogLevelArg)
    }
}

/// Command-line interface for workbench.
#[derive(Parser, Debug)]
#[command(name = "workbench", version)]
#[command(about = "Run the services of a multi-repo workbench together", long_about = None)]
pub struct Cli {
    /// Only print errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Print extra detail and debug diagnostics.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Override the diagnostic log level (name or 0-5).
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Path to workbench.yaml (searched upward from the current directory by default).
    #[arg(long, value_name = "PATH", global = true)]
    pub manifest: Option<PathBuf>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start services, wait for them to become healthy, and stream their output.
    Up {
        /// Start only this service.
        service: Option<String>,

        /// Seconds to wait for each service to report healthy.
        #[arg(long, value_name = "SECS", default_value_t = 30)]
        health_timeout: u64,

        /// Seconds to wait for a service to exit after SIGTERM before killing it.
        #[arg(long, value_name = "SECS", default_value_t = 5)]
        stop_timeout: u64,
    },

    /// Stop services recorded as running.
    Down {
        /// Stop only this service.
        service: Option<String>,
    },

    /// Show which services are running.
    Status,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
