//! Owns every [`ServiceHandle`] of one `up` invocation and drives them as a group.
use std::{
    sync::mpsc::Sender,
    thread,
    time::Duration,
};

use tracing::{debug, error, info};

use crate::{
    coordinator::ShutdownToken,
    error::WorkbenchError,
    logs::LogLine,
    service::{HealthSettings, HealthStatus, ServiceHandle, ServiceState},
};

/// Final health of every service after the startup wait, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    results: Vec<(String, HealthStatus)>,
}

impl RunReport {
    pub fn results(&self) -> &[(String, HealthStatus)] {
        &self.results
    }

    /// Health recorded for `service`.
    pub fn get(&self, service: &str) -> Option<HealthStatus> {
        self.results
            .iter()
            .find(|(name, _)| name == service)
            .map(|(_, status)| *status)
    }

    /// Services confirmed dead during startup.
    pub fn failed(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|(_, status)| !status.is_alive())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Overrides the outcome for `service`, e.g. one that never got recorded.
    pub(crate) fn mark_failed(&mut self, service: &str) {
        for (name, status) in &mut self.results {
            if name == service {
                *status = HealthStatus::Failed;
            }
        }
    }

    /// `true` when no service is confirmed dead.
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|(_, status)| status.is_alive())
    }
}

/// A set of uniquely named service handles.
#[derive(Debug, Default)]
pub struct Supervisor {
    handles: Vec<ServiceHandle>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle. Names must be unique within one supervisor.
    pub fn add(&mut self, handle: ServiceHandle) -> Result<(), WorkbenchError> {
        if self.handle(handle.name()).is_some() {
            return Err(WorkbenchError::DuplicateService(handle.name().to_string()));
        }
        self.handles.push(handle);
        Ok(())
    }

    pub fn handles(&self) -> &[ServiceHandle] {
        &self.handles
    }

    pub fn handle(&self, name: &str) -> Option<&ServiceHandle> {
        self.handles.iter().find(|handle| handle.name() == name)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Spawns every registered service in registration order.
    ///
    /// Spawning never blocks on readiness, so one service cannot hold up another. A spawn
    /// failure is logged and leaves that handle `Failed`; the health wait reports it. Returns
    /// the names that failed to spawn.
    ///
    /// Children are spawned on the calling thread: `PR_SET_PDEATHSIG` fires when the spawning
    /// thread exits, not the process.
    pub fn start_all(&mut self) -> Vec<String> {
        info!("Starting all services...");
        let mut failed = Vec::new();

        for handle in &mut self.handles {
            if let Err(err) = handle.start() {
                error!("{err}");
                failed.push(handle.name().to_string());
            }
        }

        failed
    }

    /// Waits for every service to reach a health outcome, polling each on its own thread.
    pub fn wait_all_healthy(
        &mut self,
        settings: &HealthSettings,
        shutdown: &ShutdownToken,
    ) -> RunReport {
        let results = thread::scope(|scope| {
            let workers: Vec<_> = self
                .handles
                .iter_mut()
                .map(|handle| {
                    let name = handle.name().to_string();
                    let worker = scope.spawn(move || handle.wait_healthy(settings, shutdown));
                    (name, worker)
                })
                .collect();

            workers
                .into_iter()
                .map(|(name, worker)| {
                    let status = worker.join().unwrap_or_else(|_| {
                        error!("Health check thread for '{name}' panicked");
                        HealthStatus::Failed
                    });
                    (name, status)
                })
                .collect()
        });

        RunReport { results }
    }

    /// Starts an output streaming thread per service, all feeding `sink`.
    pub fn stream_all(&mut self, sink: &Sender<LogLine>) -> Vec<thread::JoinHandle<()>> {
        self.handles
            .iter_mut()
            .filter_map(|handle| handle.stream_output(sink.clone()))
            .collect()
    }

    /// Stops every service. Errors are logged, never raised, and calling this again once
    /// everything is stopped sends no further signals.
    pub fn stop_all(&mut self, timeout: Duration, kill_grace: Duration) {
        for handle in &mut self.handles {
            match handle.stop(timeout, kill_grace) {
                Ok(()) => debug!("Service '{}' is down", handle.name()),
                Err(err) => error!("Failed to stop service '{}': {err}", handle.name()),
            }
        }
    }

    /// Names of services whose process is still alive.
    pub fn running_names(&mut self) -> Vec<String> {
        self.handles
            .iter_mut()
            .filter_map(|handle| handle.is_running().then(|| handle.name().to_string()))
            .collect()
    }

    /// Names of services that exited unexpectedly after startup.
    pub fn crashed_names(&self) -> Vec<String> {
        self.handles
            .iter()
            .filter(|handle| handle.state() == ServiceState::Crashed)
            .map(|handle| handle.name().to_string())
            .collect()
    }
}
