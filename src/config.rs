//! Manifest (`workbench.yaml`) loading for workbench.
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Deserializer};
use tracing::{debug, error, warn};

use crate::{error::WorkbenchError, service::LaunchDescriptor};

/// File name searched for when no manifest path is given.
pub const MANIFEST_FILE: &str = "workbench.yaml";

/// Represents the structure of the manifest file.
#[derive(Debug, Default, Deserialize)]
pub struct Manifest {
    /// Workbench metadata.
    #[serde(default)]
    pub workbench: WorkbenchMeta,
    /// Repositories in declaration order.
    #[serde(default, deserialize_with = "ordered_repos")]
    pub repos: Vec<RepoConfig>,
    /// Settings shared by every service.
    #[serde(default)]
    pub environment: EnvironmentConfig,
}

/// The `workbench:` header block.
#[derive(Debug, Deserialize)]
pub struct WorkbenchMeta {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
}

impl Default for WorkbenchMeta {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
        }
    }
}

fn default_name() -> String {
    "my-workbench".into()
}

fn default_version() -> String {
    "0.1.0".into()
}

/// Whether a repo is a runnable service or reference-only infrastructure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    #[default]
    Service,
    Infrastructure,
}

/// Configuration for a single repository.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoConfig {
    /// Logical name, taken from the mapping key.
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Checkout location relative to the workbench root; defaults to `repos/<name>`.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: RepoKind,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default, deserialize_with = "lenient_port")]
    pub port: Option<u16>,
    #[serde(default)]
    pub health_check: Option<String>,
    /// Dotenv file relative to the repo directory.
    #[serde(default)]
    pub env_file: Option<String>,
}

impl RepoConfig {
    pub fn is_infrastructure(&self) -> bool {
        self.kind == RepoKind::Infrastructure
    }

    /// Absolute checkout directory under `root`.
    pub fn dir(&self, root: &Path) -> PathBuf {
        match self.path.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => root.join(path),
            _ => root.join("repos").join(&self.name),
        }
    }

    fn start_command(&self) -> Option<&str> {
        self.start_command
            .as_deref()
            .map(str::trim)
            .filter(|command| !command.is_empty())
    }
}

/// The `environment:` block.
#[derive(Debug, Default, Deserialize)]
pub struct EnvironmentConfig {
    /// Variables exported to every service.
    #[serde(default)]
    pub shared_env: HashMap<String, String>,
}

fn ordered_repos<'de, D>(deserializer: D) -> Result<Vec<RepoConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    let mapping = Option::<serde_yaml::Mapping>::deserialize(deserializer)?.unwrap_or_default();
    let mut repos = Vec::with_capacity(mapping.len());

    for (key, value) in mapping {
        let name = match key {
            serde_yaml::Value::String(name) => name,
            other => return Err(D::Error::custom(format!("invalid repo name: {other:?}"))),
        };
        let mut repo: RepoConfig = if value.is_null() {
            RepoConfig::default()
        } else {
            serde_yaml::from_value(value)
                .map_err(|err| D::Error::custom(format!("repo '{name}': {err}")))?
        };
        repo.name = name;
        repos.push(repo);
    }

    Ok(repos)
}

fn lenient_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    let port = match value {
        Some(serde_yaml::Value::Number(number)) => {
            number.as_u64().and_then(|port| u16::try_from(port).ok())
        }
        Some(serde_yaml::Value::String(text)) => text.trim().parse::<u16>().ok(),
        _ => None,
    };
    Ok(port.filter(|port| *port > 0))
}

/// Walks upward from `start` looking for [`MANIFEST_FILE`].
pub fn find_manifest(start: &Path) -> Result<PathBuf, WorkbenchError> {
    let mut current = Some(start);
    while let Some(dir) = current {
        let candidate = dir.join(MANIFEST_FILE);
        if candidate.is_file() {
            return Ok(candidate);
        }
        current = dir.parent();
    }

    Err(WorkbenchError::ManifestNotFound {
        start: start.to_path_buf(),
    })
}

/// Loads and parses the manifest at `path`.
pub fn load_manifest(path: &Path) -> Result<Manifest, WorkbenchError> {
    let content = fs::read_to_string(path).map_err(|e| {
        WorkbenchError::ManifestReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, path.display()),
        ))
    })?;

    let manifest: Manifest = serde_yaml::from_str(&content)?;
    debug!(
        "Loaded manifest '{}' with {} repos",
        manifest.workbench.name,
        manifest.repos.len()
    );
    Ok(manifest)
}

/// Resolves the manifest path: the explicit one if given, otherwise an upward search from
/// the current directory. Returns the manifest path and the workbench root.
pub fn locate(explicit: Option<&Path>) -> Result<(PathBuf, PathBuf), WorkbenchError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => find_manifest(&env::current_dir()?)?,
    };
    let path = path.canonicalize().unwrap_or(path);
    let root = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((path, root))
}

/// Parses a dotenv file into a map, skipping comments and malformed lines.
fn read_env_file(path: &Path, service_name: &str) -> HashMap<String, String> {
    let mut resolved = HashMap::new();

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            error!("Failed to read env file for '{service_name}': {err}");
            return resolved;
        }
    };

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        if let Some((key, value)) = line.split_once('=') {
            let mut value = value.trim();
            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }
            resolved.insert(key.trim().to_string(), value.to_string());
        } else {
            warn!("Ignoring malformed line in env file for '{service_name}': {line}");
        }
    }

    resolved
}

impl Manifest {
    /// Names of every declared repo, in order.
    pub fn repo_names(&self) -> Vec<String> {
        self.repos.iter().map(|repo| repo.name.clone()).collect()
    }

    pub fn repo(&self, name: &str) -> Option<&RepoConfig> {
        self.repos.iter().find(|repo| repo.name == name)
    }

    /// Builds launch descriptors for the startable services, or only `only` when given.
    ///
    /// Every selected service without a start command is reported together, before
    /// anything is launched.
    pub fn launch_descriptors(
        &self,
        root: &Path,
        only: Option<&str>,
    ) -> Result<Vec<LaunchDescriptor>, WorkbenchError> {
        let selected: Vec<&RepoConfig> = match only {
            Some(name) => {
                let repo = self.repo(name).ok_or_else(|| WorkbenchError::UnknownService {
                    service: name.to_string(),
                    available: self.repo_names(),
                })?;
                if repo.is_infrastructure() {
                    return Err(WorkbenchError::InfrastructureService(name.to_string()));
                }
                vec![repo]
            }
            None => self
                .repos
                .iter()
                .filter(|repo| !repo.is_infrastructure())
                .collect(),
        };

        if selected.is_empty() {
            return Err(WorkbenchError::NoStartableServices);
        }

        let missing: Vec<String> = selected
            .iter()
            .filter(|repo| repo.start_command().is_none())
            .map(|repo| repo.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(WorkbenchError::MissingStartCommands { services: missing });
        }

        Ok(selected
            .into_iter()
            .map(|repo| self.descriptor_for(repo, root))
            .collect())
    }

    fn descriptor_for(&self, repo: &RepoConfig, root: &Path) -> LaunchDescriptor {
        let working_dir = repo.dir(root);

        let mut env = self.environment.shared_env.clone();
        if let Some(file) = repo.env_file.as_deref() {
            let path = working_dir.join(file);
            env.extend(read_env_file(&path, &repo.name));
        }

        LaunchDescriptor {
            name: repo.name.clone(),
            command: repo.start_command().unwrap_or_default().to_string(),
            working_dir,
            port: repo.port,
            health_check: repo.health_check.clone(),
            env,
        }
    }
}
