//! Agent configuration: tiers, connection tuning and credentials.
//!
//! Tiers are fixed for the lifetime of a run. [`AgentConfig::default`]
//! reproduces the standard three-tier layout; a TOML file can override any
//! part of it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable holding the injected device user name.
pub const USER_ENV: &str = "PLCOPS_USER";
/// Environment variable holding the injected device password.
pub const PASSWORD_ENV: &str = "PLCOPS_PASS";

/// Which flow a tier runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Development,
    Staging,
    Production,
}

impl TierKind {
    pub fn name(&self) -> &'static str {
        match self {
            TierKind::Development => "development",
            TierKind::Staging => "staging",
            TierKind::Production => "production",
        }
    }

    /// Development captures device state; the other tiers deploy it.
    pub fn flow(&self) -> Flow {
        match self {
            TierKind::Development => Flow::Capture,
            TierKind::Staging | TierKind::Production => Flow::Deploy,
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The two top-level flows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    Capture,
    Deploy,
}

impl Flow {
    pub fn name(&self) -> &'static str {
        match self {
            Flow::Capture => "capture",
            Flow::Deploy => "deploy",
        }
    }
}

/// What a capture stages before committing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommitScope {
    /// Only the tier's artifact paths.
    #[default]
    Artifacts,
    /// Everything in the working copy (`git add -A`).
    Repository,
}

/// One environment tier bound to a branch and a controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierConfig {
    pub kind: TierKind,

    /// Branch tracked on the remote for this tier.
    pub branch: String,

    /// Controller identity, used in archive file names.
    pub controller: String,

    /// Project file name used when discovering projects in a directory.
    pub project_file: String,

    /// Normalized text artifact, relative to the repository root.
    pub artifact_path: PathBuf,

    /// Directory for timestamped binary snapshots, outside version control.
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,

    #[serde(default)]
    pub commit_scope: CommitScope,

    /// Bring the application to a running state after a deploy.
    #[serde(default = "default_true")]
    pub start_after_deploy: bool,
}

fn default_true() -> bool {
    true
}

impl TierConfig {
    pub fn new(kind: TierKind, branch: &str, controller: &str, project_file: &str) -> Self {
        Self {
            kind,
            branch: branch.to_string(),
            controller: controller.to_string(),
            project_file: project_file.to_string(),
            artifact_path: PathBuf::from("exports/plcopen/PLC_latest.plcopen.xml"),
            archive_dir: Some(PathBuf::from(format!("exports/archives/{branch}"))),
            commit_scope: CommitScope::Artifacts,
            start_after_deploy: true,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn flow(&self) -> Flow {
        self.kind.flow()
    }
}

/// Timing of the connect/login lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionSettings {
    pub attempts: u32,
    pub retry_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub connect_poll_ms: u64,
    pub application_timeout_secs: u64,
    pub application_poll_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay_ms: 3_000,
            connect_timeout_secs: 120,
            connect_poll_ms: 500,
            application_timeout_secs: 120,
            application_poll_ms: 1_000,
        }
    }
}

impl ConnectionSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn connect_poll(&self) -> Duration {
        Duration::from_millis(self.connect_poll_ms)
    }

    pub fn application_timeout(&self) -> Duration {
        Duration::from_secs(self.application_timeout_secs)
    }

    pub fn application_poll(&self) -> Duration {
        Duration::from_millis(self.application_poll_ms)
    }
}

/// Device credentials injected from the environment.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Read [`USER_ENV`] and [`PASSWORD_ENV`]; both must be non-empty.
    pub fn from_env() -> Option<Self> {
        let username = std::env::var(USER_ENV).ok()?;
        let password = std::env::var(PASSWORD_ENV).ok()?;
        Self::from_parts(&username, &password)
    }

    pub fn from_parts(username: &str, password: &str) -> Option<Self> {
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self::new(username, password))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    /// Local working copy.
    pub repo_root: PathBuf,

    #[serde(default = "default_remote")]
    pub remote: String,

    /// Processed strictly in this order.
    pub tiers: Vec<TierConfig>,

    #[serde(default)]
    pub connection: ConnectionSettings,
}

fn default_remote() -> String {
    "origin".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            remote: default_remote(),
            tiers: vec![
                TierConfig::new(TierKind::Development, "dev", "PLC_DEV", "PLC_DEV.project"),
                TierConfig::new(TierKind::Staging, "staging", "PLC_STG", "PLC_STG.project"),
                TierConfig::new(TierKind::Production, "prod", "PLC_PROD", "PLC_PROD.project"),
            ],
            connection: ConnectionSettings::default(),
        }
    }
}

impl AgentConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn with_repo_root(mut self, repo_root: impl Into<PathBuf>) -> Self {
        self.repo_root = repo_root.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::Invalid("at least one tier is required".to_string()));
        }
        if self.connection.attempts == 0 {
            return Err(ConfigError::Invalid(
                "connection.attempts must be at least 1".to_string(),
            ));
        }

        let mut kinds = HashSet::new();
        let mut branches = HashSet::new();
        for tier in &self.tiers {
            if !kinds.insert(tier.kind) {
                return Err(ConfigError::Invalid(format!(
                    "tier '{}' is configured more than once",
                    tier.name()
                )));
            }
            if tier.branch.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "tier '{}' has an empty branch",
                    tier.name()
                )));
            }
            if !branches.insert(tier.branch.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "branch '{}' is bound to more than one tier",
                    tier.branch
                )));
            }
        }
        Ok(())
    }
}

/// Map every tier to the controller project it operates on.
///
/// A directory is scanned for `*.project` files matched case-insensitively
/// against each tier's `project_file`. A single file serves every tier.
pub fn resolve_projects(
    arg: &Path,
    tiers: &[TierConfig],
) -> Result<BTreeMap<TierKind, PathBuf>, ConfigError> {
    if arg.is_file() {
        return Ok(tiers.iter().map(|t| (t.kind, arg.to_path_buf())).collect());
    }
    if !arg.is_dir() {
        return Err(ConfigError::ProjectPathNotFound(arg.display().to_string()));
    }

    let mut by_name = BTreeMap::new();
    for entry in std::fs::read_dir(arg)? {
        let path = entry?.path();
        let is_project = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("project"))
            .unwrap_or(false);
        if !is_project || !path.is_file() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            by_name.insert(name.to_lowercase(), path.clone());
        }
    }
    tracing::debug!(found = by_name.len(), dir = %arg.display(), "scanned for project files");

    let mut mapping = BTreeMap::new();
    let mut missing = Vec::new();
    for tier in tiers {
        match by_name.get(&tier.project_file.to_lowercase()) {
            Some(path) => {
                mapping.insert(tier.kind, path.clone());
            }
            None => missing.push(tier.name()),
        }
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingProjects(missing.join(", ")));
    }
    Ok(mapping)
}
