//! Error handling for workbench.
use std::path::PathBuf;

use thiserror::Error;

/// Defines all possible errors raised while managing workbench services.
#[derive(Debug, Error)]
pub enum WorkbenchError {
    /// Error reading the manifest file.
    #[error("Failed to read manifest: {0}")]
    ManifestReadError(#[from] std::io::Error),

    /// Error parsing the YAML manifest.
    #[error("Invalid YAML format: {0}")]
    ManifestParseError(#[from] serde_yaml::Error),

    /// No `workbench.yaml` was found walking up from the start directory.
    #[error("Could not find workbench.yaml in {} or any parent directory", start.display())]
    ManifestNotFound {
        /// Directory the search started from.
        start: PathBuf,
    },

    /// A service was requested that the manifest does not declare.
    #[error("Unknown service '{service}' (available: {})", available.join(", "))]
    UnknownService {
        /// The requested name.
        service: String,
        /// Every repo declared in the manifest.
        available: Vec<String>,
    },

    /// The requested repo is reference-only and cannot be started.
    #[error("'{0}' is an infrastructure repo (reference only, cannot be started)")]
    InfrastructureService(String),

    /// Nothing in the manifest can be started.
    #[error("No startable services found")]
    NoStartableServices,

    /// One or more selected services have no start command.
    #[error("Missing start commands for: {}", services.join(", "))]
    MissingStartCommands {
        /// Services lacking a `start_command`.
        services: Vec<String>,
    },

    /// Two handles were registered under the same name in one run.
    #[error("Service '{0}' is already registered")]
    DuplicateService(String),

    /// Error spawning a service process.
    #[error("Failed to start service '{service}': {source}")]
    ServiceStartError {
        /// The service name that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error stopping a service process.
    #[error("Failed to stop service '{service}': {source}")]
    ServiceStopError {
        /// The service name that failed to stop.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// At least one service died during startup; everything was rolled back.
    #[error("Service(s) failed to start: {}", services.join(", "))]
    StartupFailed {
        /// Services that exited before becoming healthy.
        services: Vec<String>,
    },

    /// A service exited with a failure status while streaming; everything was stopped.
    #[error("Service(s) exited unexpectedly: {}", services.join(", "))]
    ServicesCrashed {
        /// Services that exited with a failure status.
        services: Vec<String>,
    },

    /// Error for PID records.
    #[error("PID record error: {0}")]
    PidRecordError(#[from] PidRecordError),

    /// The interrupt handler could not be installed.
    #[error("Failed to install signal handler: {0}")]
    SignalHandlerError(#[from] ctrlc::Error),
}

/// Error type for PID record operations.
#[derive(Debug, Error)]
pub enum PidRecordError {
    /// Error reading or writing a record file.
    #[error("Failed to access PID record: {0}")]
    IoError(#[from] std::io::Error),

    /// Error (de)serialising a record file.
    #[error("Failed to parse PID record: {0}")]
    ParseError(#[from] serde_json::Error),
}
