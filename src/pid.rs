//! Persisted PID records for services started by workbench.
//!
//! One JSON file per service lives under `<root>/.workbench/pids/<service>.pid`. Files are
//! written the moment a service spawns and are only trusted while the referenced process is
//! still alive: [`PidRegistry::read_all`] prunes anything stale or unreadable.
use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{error::PidRecordError, process};

/// Workbench state directory, relative to the manifest root.
pub const STATE_DIR: &str = ".workbench";

/// Directory under [`STATE_DIR`] holding PID records.
pub const PID_DIR: &str = "pids";

const PID_EXTENSION: &str = "pid";

/// Contents of a single PID record file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidRecord {
    /// Process id of the service, which is also its process group id.
    pub pid: u32,
    /// Port declared for the service, kept for display.
    pub port: Option<u16>,
}

/// Handle on the PID record directory of one workbench root.
#[derive(Debug, Clone)]
pub struct PidRegistry {
    dir: PathBuf,
}

impl PidRegistry {
    /// Creates a registry rooted at the directory containing `workbench.yaml`.
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join(STATE_DIR).join(PID_DIR),
        }
    }

    /// Directory holding the record files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, service: &str) -> PathBuf {
        self.dir.join(format!("{service}.{PID_EXTENSION}"))
    }

    /// Creates or overwrites the record for `service`.
    pub fn write(
        &self,
        service: &str,
        pid: u32,
        port: Option<u16>,
    ) -> Result<(), PidRecordError> {
        fs::create_dir_all(&self.dir)?;
        let record = PidRecord { pid, port };
        fs::write(self.path(service), serde_json::to_string(&record)?)?;
        debug!("Recorded PID {pid} for '{service}'");
        Ok(())
    }

    /// Deletes the record for `service`. A missing record is not an error.
    pub fn remove(&self, service: &str) -> Result<(), PidRecordError> {
        match fs::remove_file(self.path(service)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads the record for `service` without checking liveness.
    pub fn read(&self, service: &str) -> Result<Option<PidRecord>, PidRecordError> {
        let contents = match fs::read_to_string(self.path(service)) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Returns every record whose process is still alive.
    ///
    /// Records that fail to parse or reference a process that no longer exists are deleted
    /// as a side effect.
    pub fn read_all(&self) -> BTreeMap<String, PidRecord> {
        let mut live = BTreeMap::new();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    warn!("Failed to read PID directory {:?}: {err}", self.dir);
                }
                return live;
            }
        };

        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PID_EXTENSION) {
                continue;
            }
            let Some(service) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            let record = fs::read_to_string(&path)
                .map_err(PidRecordError::from)
                .and_then(|contents| {
                    serde_json::from_str::<PidRecord>(&contents).map_err(Into::into)
                });

            match record {
                Ok(record) if process::process_exists(record.pid) => {
                    live.insert(service.to_string(), record);
                }
                Ok(record) => {
                    debug!(
                        "Pruning stale PID record for '{service}' (PID {} is gone)",
                        record.pid
                    );
                    Self::discard(&path);
                }
                Err(err) => {
                    debug!("Pruning unreadable PID record for '{service}': {err}");
                    Self::discard(&path);
                }
            }
        }

        live
    }

    fn discard(path: &Path) {
        if let Err(err) = fs::remove_file(path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!("Failed to remove PID record {:?}: {err}", path);
        }
    }

    /// Deletes the record for `service`, then sends a graceful terminate to the recorded
    /// process group.
    ///
    /// Returns whether a live process was found. A missing record or a process that has
    /// already exited yields `Ok(false)`.
    pub fn kill_by_record(&self, service: &str) -> Result<bool, PidRecordError> {
        let record = match self.read(service) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(false),
            Err(PidRecordError::ParseError(err)) => {
                debug!("Discarding corrupt PID record for '{service}': {err}");
                self.remove(service)?;
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        // Cleared before signalling so the owning run sees a requested stop, not a crash.
        self.remove(service)?;

        let delivered = match process::group_of(record.pid) {
            Some(pgid) => process::signal_group(pgid, Signal::SIGTERM),
            None => process::signal_process(record.pid, Signal::SIGTERM),
        };

        let found = match delivered {
            Ok(found) => found,
            Err(err) => {
                warn!(
                    "Failed to signal '{service}' (PID {}): {err}",
                    record.pid
                );
                false
            }
        };

        if found {
            debug!("Sent SIGTERM to '{service}' (PID {})", record.pid);
        }

        Ok(found)
    }
}
