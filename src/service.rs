//! A single service subprocess: launch, health probing, output streaming and teardown.
use std::{
    collections::HashMap,
    fmt, io,
    net::{SocketAddr, TcpStream},
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc::Sender,
    thread,
    time::{Duration, Instant},
};

use nix::sys::signal::Signal;
use reqwest::blocking::Client;
use strum_macros::AsRefStr;
use tracing::{debug, error, info, warn};

use crate::{
    coordinator::ShutdownToken,
    error::WorkbenchError,
    logs::{self, Color, LogLine},
    pid::PidRegistry,
    process,
};

const LOOPBACK: &str = "127.0.0.1";

/// Everything needed to launch one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchDescriptor {
    /// Unique service name, stable across invocations.
    pub name: String,
    /// Shell command line.
    pub command: String,
    /// Directory the command runs in.
    pub working_dir: PathBuf,
    /// Port the service listens on, if declared.
    pub port: Option<u16>,
    /// Absolute URL, `/path` or bare path used to probe readiness.
    pub health_check: Option<String>,
    /// Variables layered over the inherited environment.
    pub env: HashMap<String, String>,
}

/// Runtime state of a [`ServiceHandle`]. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ServiceState {
    NotStarted,
    Starting,
    Running,
    Healthy,
    HealthUnknown,
    Stopping,
    Stopped,
    /// Exited before it was ever confirmed running.
    Failed,
    /// Exited unexpectedly while being watched.
    Crashed,
}

/// Outcome of [`ServiceHandle::wait_healthy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// A health signal succeeded, or the liveness grace period passed with the process alive.
    Healthy,
    /// No health signal before the timeout, but the process is still running.
    InconclusiveButAlive,
    /// The process exited.
    Failed,
}

impl HealthStatus {
    /// Whether the service should be treated as started. Only a confirmed exit is fatal.
    pub fn is_alive(&self) -> bool {
        !matches!(self, HealthStatus::Failed)
    }
}

/// How readiness is probed, resolved from a descriptor's `health_check` and `port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthProbe {
    /// HTTP GET; any status in `[200, 400)` is healthy.
    Http(String),
    /// Raw TCP connect.
    Tcp(SocketAddr),
    /// Nothing to probe: wait one grace interval and report liveness.
    Liveness,
}

impl HealthProbe {
    /// Resolves the probe for a service.
    ///
    /// Absolute URLs are used as-is. Paths are anchored at `http://127.0.0.1:{port}` and need
    /// a port; without one the probe degrades to liveness.
    pub fn resolve(health_check: Option<&str>, port: Option<u16>) -> Self {
        let check = health_check.map(str::trim).filter(|check| !check.is_empty());

        match (check, port) {
            (Some(url), _) if url.starts_with("http://") || url.starts_with("https://") => {
                HealthProbe::Http(url.to_string())
            }
            (Some(path), Some(port)) if path.starts_with('/') => {
                HealthProbe::Http(format!("http://{LOOPBACK}:{port}{path}"))
            }
            (Some(path), Some(port)) => HealthProbe::Http(format!(
                "http://{LOOPBACK}:{port}/{}",
                path.trim_start_matches('/')
            )),
            (Some(path), None) => {
                warn!("Health check '{path}' needs a port; falling back to liveness");
                HealthProbe::Liveness
            }
            (None, Some(port)) => HealthProbe::Tcp(SocketAddr::from(([127, 0, 0, 1], port))),
            (None, None) => HealthProbe::Liveness,
        }
    }
}

impl fmt::Display for HealthProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthProbe::Http(url) => write!(f, "GET {url}"),
            HealthProbe::Tcp(addr) => write!(f, "tcp {addr}"),
            HealthProbe::Liveness => write!(f, "liveness"),
        }
    }
}

/// Timings used while waiting for a service to become healthy.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    /// Overall budget for one service.
    pub timeout: Duration,
    /// Sleep between probe attempts.
    pub poll_interval: Duration,
    /// Wait used when there is nothing to probe.
    pub liveness_grace: Duration,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Per-attempt TCP connect timeout.
    pub connect_timeout: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            liveness_grace: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
        }
    }
}

/// Owns one service subprocess and its process group.
pub struct ServiceHandle {
    descriptor: LaunchDescriptor,
    color: Color,
    registry: PidRegistry,
    state: ServiceState,
    child: Option<Child>,
    pid: Option<u32>,
    exit_status: Option<ExitStatus>,
    output: Option<io::PipeReader>,
}

impl ServiceHandle {
    /// Creates a handle; nothing is spawned until [`ServiceHandle::start`].
    pub fn new(descriptor: LaunchDescriptor, color: Color, registry: PidRegistry) -> Self {
        Self {
            descriptor,
            color,
            registry,
            state: ServiceState::NotStarted,
            child: None,
            pid: None,
            exit_status: None,
            output: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &LaunchDescriptor {
        &self.descriptor
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// PID of the most recently spawned process, retained after it stops.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status observed for the process, if it exited on its own.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    fn retains_state_after_stop(&self) -> bool {
        matches!(
            self.state,
            ServiceState::NotStarted | ServiceState::Failed | ServiceState::Crashed
        )
    }

    /// Spawns the command under `sh -c` in its own process group with stdout and stderr
    /// merged into one pipe, then records the PID.
    pub fn start(&mut self) -> Result<(), WorkbenchError> {
        if self.child.is_some() {
            debug!("Service '{}' already started", self.name());
            return Ok(());
        }

        let name = self.descriptor.name.clone();
        let start_error = |source: io::Error| WorkbenchError::ServiceStartError {
            service: name.clone(),
            source,
        };

        self.state = ServiceState::Starting;
        debug!(
            "Launching service '{}' with command: `{}`",
            self.name(),
            self.descriptor.command
        );

        let (reader, writer) = io::pipe().map_err(start_error)?;
        let child = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(&self.descriptor.command)
                .current_dir(&self.descriptor.working_dir)
                .envs(&self.descriptor.env)
                .stdin(Stdio::null())
                .stdout(writer.try_clone().map_err(start_error)?)
                .stderr(writer);

            unsafe {
                cmd.pre_exec(|| {
                    // Own process group so the whole tree can be signalled at once.
                    if libc::setpgid(0, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }

                    #[cfg(target_os = "linux")]
                    {
                        use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                        if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                            return Err(io::Error::last_os_error());
                        }
                    }

                    Ok(())
                });
            }

            // `cmd` holds the parent's copies of the write end; dropping it at the end of
            // this block lets the reader see EOF once the service exits.
            cmd.spawn()
        };

        let child = match child {
            Ok(child) => child,
            Err(err) => {
                error!("Failed to start service '{}': {err}", self.name());
                self.state = ServiceState::Failed;
                return Err(start_error(err));
            }
        };

        let pid = child.id();
        info!("Service '{}' started with PID {pid}", self.name());

        self.pid = Some(pid);
        self.exit_status = None;
        self.child = Some(child);
        self.output = Some(reader);

        if let Err(err) = self
            .registry
            .write(&self.descriptor.name, pid, self.descriptor.port)
        {
            error!(
                "Failed to record PID for '{}': {err}; killing the untracked process",
                self.name()
            );
            self.discard_untracked();
            return Err(err.into());
        }
        self.state = ServiceState::Running;
        Ok(())
    }

    /// Kills and reaps a process that could not be recorded, leaving the handle `Failed`.
    fn discard_untracked(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(err) = process::signal_group(child.id(), Signal::SIGKILL) {
                warn!("Failed to kill process group {}: {err}", child.id());
                let _ = child.kill();
            }
            if let Ok(status) = child.wait() {
                self.exit_status = Some(status);
            }
        }
        self.output = None;
        self.state = ServiceState::Failed;
    }

    /// Non-blocking check of whether the owned process is still alive.
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Err(err) => {
                error!("Failed to check status of '{}': {err}", self.descriptor.name);
                false
            }
        }
    }

    fn record_exit(&mut self, status: ExitStatus) {
        if self.exit_status.is_some() {
            return;
        }
        self.exit_status = Some(status);
        self.state = match self.state {
            ServiceState::Stopping | ServiceState::Stopped => self.state,
            _ if status.success() => ServiceState::Stopped,
            ServiceState::NotStarted | ServiceState::Starting => ServiceState::Failed,
            _ if self.stopped_externally() => ServiceState::Stopped,
            _ => ServiceState::Crashed,
        };

        match self.state {
            ServiceState::Crashed | ServiceState::Failed => warn!(
                "Service '{}' exited with {status:?}.",
                self.descriptor.name
            ),
            _ => info!("Service '{}' exited ({status:?}).", self.descriptor.name),
        }
    }

    /// `down` removes the PID record before signalling, so a missing record means the exit
    /// was requested rather than spontaneous.
    fn stopped_externally(&self) -> bool {
        match self.registry.read(&self.descriptor.name) {
            Ok(None) => {
                info!(
                    "Service '{}' was stopped outside this run",
                    self.descriptor.name
                );
                true
            }
            Ok(Some(record)) => self.pid.is_some_and(|pid| pid != record.pid),
            Err(_) => false,
        }
    }

    /// Polls until the service is healthy, has exited, or `settings.timeout` elapses.
    ///
    /// A timeout is not a failure: a process that is still alive is reported as
    /// [`HealthStatus::InconclusiveButAlive`]. A requested shutdown ends the wait early with
    /// the same liveness-based answer.
    pub fn wait_healthy(
        &mut self,
        settings: &HealthSettings,
        shutdown: &ShutdownToken,
    ) -> HealthStatus {
        let probe = HealthProbe::resolve(
            self.descriptor.health_check.as_deref(),
            self.descriptor.port,
        );
        debug!("Waiting for '{}' to become healthy ({probe})", self.name());

        let client = match &probe {
            HealthProbe::Http(_) => {
                match Client::builder().timeout(settings.request_timeout).build() {
                    Ok(client) => Some(client),
                    Err(err) => {
                        warn!("Failed to build HTTP client for '{}': {err}", self.name());
                        None
                    }
                }
            }
            _ => None,
        };

        let deadline = Instant::now() + settings.timeout;
        let mut attempt = 0u32;

        while Instant::now() < deadline && !shutdown.is_requested() {
            if !self.is_running() {
                return self.settle(HealthStatus::Failed);
            }
            attempt += 1;

            let healthy = match (&probe, &client) {
                (HealthProbe::Http(url), Some(client)) => Self::check_http(client, url),
                (HealthProbe::Http(_), None) => false,
                (HealthProbe::Tcp(addr), _) => {
                    TcpStream::connect_timeout(addr, settings.connect_timeout).is_ok()
                }
                (HealthProbe::Liveness, _) => {
                    if shutdown.sleep(settings.liveness_grace) {
                        break;
                    }
                    let status = if self.is_running() {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Failed
                    };
                    return self.settle(status);
                }
            };

            if healthy {
                info!(
                    "Health check passed for '{}' on attempt {attempt}",
                    self.name()
                );
                return self.settle(HealthStatus::Healthy);
            }
            debug!("Health check attempt {attempt} failed for '{}'", self.name());

            let remaining = deadline.saturating_duration_since(Instant::now());
            shutdown.sleep(settings.poll_interval.min(remaining));
        }

        let status = if self.is_running() {
            warn!(
                "Health check for '{}' inconclusive after {:?}; process is alive",
                self.name(),
                settings.timeout
            );
            HealthStatus::InconclusiveButAlive
        } else {
            HealthStatus::Failed
        };
        self.settle(status)
    }

    fn check_http(client: &Client, url: &str) -> bool {
        match client.get(url).send() {
            Ok(response) => {
                let code = response.status().as_u16();
                (200..400).contains(&code)
            }
            Err(err) => {
                debug!("Health request to {url} failed: {err}");
                false
            }
        }
    }

    fn settle(&mut self, status: HealthStatus) -> HealthStatus {
        match status {
            HealthStatus::Healthy => self.state = ServiceState::Healthy,
            HealthStatus::InconclusiveButAlive => self.state = ServiceState::HealthUnknown,
            HealthStatus::Failed => {
                // An exit already classified the state; keep it.
                if !matches!(self.state, ServiceState::Crashed | ServiceState::Stopped) {
                    self.state = ServiceState::Failed;
                }
            }
        }
        status
    }

    /// Starts forwarding the merged output of the process to `sink` on its own thread.
    ///
    /// Returns `None` if the output was already taken or the service never started. The
    /// thread ends when the process side of the pipe closes.
    pub fn stream_output(&mut self, sink: Sender<LogLine>) -> Option<thread::JoinHandle<()>> {
        let reader = self.output.take()?;
        let name = self.descriptor.name.clone();
        let color = self.color;

        let spawned = thread::Builder::new()
            .name(format!("log-{name}"))
            .spawn(move || logs::pump_lines(&name, color, reader, &sink));

        match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(
                    "Failed to spawn log thread for '{}': {err}",
                    self.descriptor.name
                );
                None
            }
        }
    }

    /// Terminates the process group: `SIGTERM`, up to `timeout` for a graceful exit, then
    /// `SIGKILL` and `kill_grace` more. Group members that outlive the leader get the same
    /// treatment. The PID record is always cleared.
    ///
    /// Stopping a process that already exited, or calling this twice, is not an error.
    pub fn stop(&mut self, timeout: Duration, kill_grace: Duration) -> Result<(), WorkbenchError> {
        let Some(mut child) = self.child.take() else {
            self.output = None;
            self.registry.remove(&self.descriptor.name)?;
            if !self.retains_state_after_stop() {
                self.state = ServiceState::Stopped;
            }
            return Ok(());
        };

        let name = self.descriptor.name.clone();
        let pgid = child.id();
        let previous = self.state;
        self.state = ServiceState::Stopping;
        debug!("Stopping service '{name}' (process group {pgid})");

        if let Err(source) = Self::terminate_group(&name, &mut child, pgid, timeout, kill_grace)
        {
            if let Err(err) = self.registry.remove(&name) {
                warn!("Failed to clear PID record for '{name}': {err}");
            }
            // Keep ownership so a later stop can retry.
            self.child = Some(child);
            self.state = previous;
            return Err(WorkbenchError::ServiceStopError {
                service: name,
                source,
            });
        }

        self.output = None;
        self.registry.remove(&name)?;
        self.state = match previous {
            ServiceState::Failed | ServiceState::Crashed => previous,
            _ => ServiceState::Stopped,
        };
        debug!("Service '{name}' stopped successfully.");
        Ok(())
    }

    fn terminate_group(
        name: &str,
        child: &mut Child,
        pgid: u32,
        timeout: Duration,
        kill_grace: Duration,
    ) -> io::Result<()> {
        match process::signal_group(pgid, Signal::SIGTERM) {
            Ok(true) => debug!("Sent SIGTERM to process group {pgid} for '{name}'"),
            Ok(false) => debug!("Process group for '{name}' already gone"),
            Err(err) if err.raw_os_error() == Some(libc::EPERM) => {
                warn!(
                    "Insufficient permissions to signal process group {pgid} for '{name}'. Falling back to direct signal"
                );
                process::signal_process(pgid, Signal::SIGTERM)?;
            }
            Err(err) => return Err(err),
        }

        if process::wait_with_timeout(child, timeout)?.is_none() {
            warn!("Service '{name}' did not exit after SIGTERM; sending SIGKILL");
            process::signal_group(pgid, Signal::SIGKILL)?;
            if process::wait_with_timeout(child, kill_grace)?.is_none() {
                child.kill()?;
                child.wait()?;
            }
        }

        // The leader is reaped; anything left in the group was orphaned by it.
        if process::group_exists(pgid) && !process::wait_for_group_exit(pgid, timeout) {
            warn!("Process group {pgid} of '{name}' outlived its leader; sending SIGKILL");
            process::signal_group(pgid, Signal::SIGKILL)?;
            process::wait_for_group_exit(pgid, kill_grace);
        }

        Ok(())
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.descriptor.name)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .finish()
    }
}
