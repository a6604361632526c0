//! Status table for the services declared in a manifest.
use std::collections::BTreeMap;

use crate::{
    config::{Manifest, RepoConfig},
    output::{DIM, GREEN_BOLD, RESET, YELLOW_BOLD},
    pid::PidRecord,
};

/// Runtime status of one repo as shown by `workbench status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Infrastructure repos are never started.
    ReferenceOnly,
    Running { pid: u32, port: Option<u16> },
    Stopped,
}

impl ServiceStatus {
    /// Derives the status of `repo` from the live PID records.
    pub fn of(repo: &RepoConfig, records: &BTreeMap<String, PidRecord>) -> Self {
        if repo.is_infrastructure() {
            return ServiceStatus::ReferenceOnly;
        }
        match records.get(&repo.name) {
            Some(record) => ServiceStatus::Running {
                pid: record.pid,
                port: record.port.or(repo.port),
            },
            None => ServiceStatus::Stopped,
        }
    }

    fn label(&self) -> String {
        match self {
            ServiceStatus::ReferenceOnly => format!("{DIM}reference only{RESET}"),
            ServiceStatus::Running { pid, .. } => {
                format!("{GREEN_BOLD}running{RESET} (pid {pid})")
            }
            ServiceStatus::Stopped => format!("{YELLOW_BOLD}stopped{RESET}"),
        }
    }
}

/// Renders one row per declared repo, in manifest order.
///
/// `records` is expected to come from [`crate::pid::PidRegistry::read_all`], so stale
/// entries are already gone.
pub fn render_services(manifest: &Manifest, records: &BTreeMap<String, PidRecord>) -> String {
    if manifest.repos.is_empty() {
        return "No repos declared in workbench.yaml".to_string();
    }

    let name_width = manifest
        .repos
        .iter()
        .map(|repo| repo.name.len())
        .max()
        .unwrap_or(0)
        .max("SERVICE".len());

    let mut out = format!("{:<name_width$}  {:<6}  STATUS\n", "SERVICE", "PORT");
    for repo in &manifest.repos {
        let status = ServiceStatus::of(repo, records);
        let port = match status {
            ServiceStatus::Running { port, .. } => port,
            _ => repo.port,
        }
        .map(|port| port.to_string())
        .unwrap_or_else(|| "-".into());

        out.push_str(&format!(
            "{:<name_width$}  {:<6}  {}\n",
            repo.name,
            port,
            status.label()
        ));
    }
    out
}
