//! Workbench runs the services of a multi-repo workspace together: it starts each declared
//! service, waits for it to become healthy, streams its output with a coloured prefix, and
//! stops every process group cleanly on exit. Running services are recorded on disk so
//! `down` and `status` work from a separate invocation.

/// CLI interface.
pub mod cli;

/// Manifest loading.
pub mod config;

/// Startup, streaming and shutdown orchestration.
pub mod coordinator;

/// Error handling.
pub mod error;

/// Tagged service output.
pub mod logs;

/// Console messages.
pub mod output;

/// PID records.
pub mod pid;

/// Process and process-group signalling.
pub mod process;

/// Single-service lifecycle.
pub mod service;

/// Status table.
pub mod status;

/// Service group management.
pub mod supervisor;
