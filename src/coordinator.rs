//! Top-level control loop for `workbench up`.
//!
//! The coordinator starts every service, waits for all of them to report a health outcome,
//! streams their output, and then blocks until a shutdown trigger fires. Whatever the trigger,
//! the stop sequence runs exactly once.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
    },
    thread,
    time::{Duration, Instant},
};

use strum_macros::AsRefStr;
use tracing::{debug, info, warn};

use crate::{
    error::WorkbenchError,
    logs::{Color, LogLine},
    pid::PidRegistry,
    service::{HealthSettings, LaunchDescriptor, ServiceHandle},
    supervisor::{RunReport, Supervisor},
};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Cancellation flag shared with the signal handler.
///
/// The handler only flips the flag; the coordinator's own loop performs the stop sequence.
/// Repeated signals collapse into the same request.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` or until shutdown is requested. Returns whether it was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while !self.is_requested() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            thread::sleep(remaining.min(SHUTDOWN_POLL));
        }
        true
    }
}

/// Routes SIGINT and SIGTERM to `token`. Can only be installed once per process.
pub fn install_signal_handler(token: &ShutdownToken) -> Result<(), WorkbenchError> {
    let token = token.clone();
    ctrlc::set_handler(move || {
        if !token.is_requested() {
            eprintln!("\nworkbench is shutting down... stopping services");
        }
        token.request();
    })?;
    Ok(())
}

/// Timings for one `up` run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Health wait settings applied to every service.
    pub health: HealthSettings,
    /// Time allowed for a graceful exit after `SIGTERM`.
    pub stop_timeout: Duration,
    /// Time allowed after `SIGKILL`.
    pub kill_grace: Duration,
    /// Interval between liveness sweeps while streaming.
    pub sweep_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            health: HealthSettings::default(),
            stop_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Lifecycle phases of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Idle,
    Starting,
    WaitingHealthy,
    AllHealthy,
    PartialFailure,
    Streaming,
    ShutdownRequested,
    Stopped,
}

/// Why the streaming phase ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM was received.
    Signal,
    /// These services exited with a failure status.
    Crashed(Vec<String>),
    /// Every service exited on its own.
    AllExited,
}

/// Drives a [`Supervisor`] through start, health wait, streaming and shutdown.
pub struct Coordinator {
    supervisor: Supervisor,
    options: RunOptions,
    token: ShutdownToken,
    phase: Phase,
    report: RunReport,
    stopped: bool,
}

impl Coordinator {
    /// Builds one handle per descriptor, assigning colours in order.
    ///
    /// Fails before anything is spawned if any descriptor lacks a command.
    pub fn new(
        descriptors: Vec<LaunchDescriptor>,
        registry: PidRegistry,
        options: RunOptions,
        token: ShutdownToken,
    ) -> Result<Self, WorkbenchError> {
        let missing: Vec<String> = descriptors
            .iter()
            .filter(|descriptor| descriptor.command.trim().is_empty())
            .map(|descriptor| descriptor.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(WorkbenchError::MissingStartCommands { services: missing });
        }

        let mut supervisor = Supervisor::new();
        for (index, descriptor) in descriptors.into_iter().enumerate() {
            supervisor.add(ServiceHandle::new(
                descriptor,
                Color::for_index(index),
                registry.clone(),
            ))?;
        }

        Ok(Self {
            supervisor,
            options,
            token,
            phase: Phase::Idle,
            report: RunReport::default(),
            stopped: false,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn token(&self) -> &ShutdownToken {
        &self.token
    }

    /// Health outcomes of the most recent startup, kept after a rollback.
    pub fn report(&self) -> &RunReport {
        &self.report
    }

    fn enter(&mut self, phase: Phase) {
        debug!("Coordinator phase: {} -> {}", self.phase.as_ref(), phase.as_ref());
        self.phase = phase;
    }

    /// Starts every service and waits for their health outcomes.
    ///
    /// All-or-nothing: if any service is confirmed dead, every service is stopped and
    /// [`WorkbenchError::StartupFailed`] is returned. Timed-out but alive services count as
    /// started.
    pub fn start(&mut self) -> Result<RunReport, WorkbenchError> {
        self.enter(Phase::Starting);
        let spawn_failures = self.supervisor.start_all();

        self.enter(Phase::WaitingHealthy);
        let mut report = self
            .supervisor
            .wait_all_healthy(&self.options.health, &self.token);
        for name in &spawn_failures {
            report.mark_failed(name);
        }
        self.report = report.clone();

        let failed = report.failed();
        if !failed.is_empty() {
            self.enter(Phase::PartialFailure);
            warn!("Startup failed for: {}; rolling back", failed.join(", "));
            self.shutdown();
            return Err(WorkbenchError::StartupFailed { services: failed });
        }

        self.enter(Phase::AllHealthy);
        Ok(report)
    }

    /// Starts a streaming thread per service feeding `sink`.
    pub fn stream(&mut self, sink: Sender<LogLine>) -> Vec<thread::JoinHandle<()>> {
        self.enter(Phase::Streaming);
        self.supervisor.stream_all(&sink)
    }

    /// Blocks until a signal arrives, a service crashes, or every service has exited.
    pub fn wait_for_shutdown(&mut self) -> ShutdownReason {
        let reason = loop {
            if self.token.is_requested() {
                break ShutdownReason::Signal;
            }

            let running = self.supervisor.running_names();
            let crashed = self.supervisor.crashed_names();
            if !crashed.is_empty() {
                break ShutdownReason::Crashed(crashed);
            }
            if running.is_empty() {
                break ShutdownReason::AllExited;
            }

            self.token.sleep(self.options.sweep_interval);
        };

        info!("Shutdown requested: {reason:?}");
        self.enter(Phase::ShutdownRequested);
        reason
    }

    /// Stops every service. Only the first call does anything; returns whether this call
    /// performed the stop.
    pub fn shutdown(&mut self) -> bool {
        if self.stopped {
            debug!("Shutdown already performed");
            return false;
        }
        self.stopped = true;

        info!("Stopping all services...");
        self.supervisor
            .stop_all(self.options.stop_timeout, self.options.kill_grace);
        self.enter(Phase::Stopped);
        true
    }

    /// Full lifecycle: start, stream into `sink`, wait for a trigger, shut down.
    pub fn run(&mut self, sink: Sender<LogLine>) -> Result<ShutdownReason, WorkbenchError> {
        self.start()?;
        self.stream(sink);
        let reason = self.wait_for_shutdown();
        self.shutdown();
        Ok(reason)
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        // Never leave services behind on early return or panic.
        self.shutdown();
    }
}
