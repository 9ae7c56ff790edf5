//! Tier-by-tier capture and deploy orchestration.
//!
//! [`DeployOrchestrator::run`] walks the configured tiers strictly in order.
//! Capture tiers pull the controller program into version control; deploy
//! tiers push version control onto the controller when the remote branch
//! moved. Every tier yields an [`Outcome`]; a failing or panicking tier never
//! stops the ones after it.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use chrono::{Local, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::{AgentConfig, CommitScope, Credentials, Flow, TierConfig, TierKind};
use crate::connector::{RuntimeConnector, RuntimeSession};
use crate::device::{ops, Application, AutomationHost, OnlineApplication, Project};
use crate::error::{AgentError, ConfigError, ExportError, Result, VcsError};
use crate::normalize::ArtifactNormalizer;
use crate::obs;
use crate::probe::{CapabilityProbe, APPLY, APPLY_OPTIONS, SOURCE_PULL};
use crate::summary::{Outcome, RunSummary};
use crate::vcs::{short_id, BranchRelation, StageSet, VersionControlGateway};

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Drives capture and deploy flows for every configured tier.
pub struct DeployOrchestrator<'h> {
    config: AgentConfig,
    vcs: VersionControlGateway,
    connector: RuntimeConnector,
    normalizer: ArtifactNormalizer,
    host: &'h dyn AutomationHost,
}

impl<'h> DeployOrchestrator<'h> {
    /// Orchestrator over the system `git` in `config.repo_root`.
    pub fn new(
        config: AgentConfig,
        host: &'h dyn AutomationHost,
        credentials: Option<Credentials>,
    ) -> Self {
        let vcs = VersionControlGateway::system(&config.repo_root, config.remote.clone());
        let connector = RuntimeConnector::new(config.connection.clone(), credentials);
        Self {
            config,
            vcs,
            connector,
            normalizer: ArtifactNormalizer::default(),
            host,
        }
    }

    pub fn with_gateway(mut self, vcs: VersionControlGateway) -> Self {
        self.vcs = vcs;
        self
    }

    pub fn with_normalizer(mut self, normalizer: ArtifactNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn gateway(&self) -> &VersionControlGateway {
        &self.vcs
    }

    /// Process every tier and return the summary.
    ///
    /// Never fails: per-tier errors and panics end up in the outcomes. The
    /// branch checked out beforehand is restored and the automation host is
    /// asked to shut down whatever happened.
    pub async fn run(&self, projects: &BTreeMap<TierKind, PathBuf>) -> RunSummary {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id);
        self.run_inner(run_id, projects).instrument(span).await
    }

    async fn run_inner(&self, run_id: String, projects: &BTreeMap<TierKind, PathBuf>) -> RunSummary {
        let started_at = Utc::now();
        obs::emit_run_started(&run_id, self.config.tiers.len());

        let start_branch = self.vcs.current_branch().await;
        if let Err(e) = self.vcs.fetch().await {
            warn!(error = %e, "initial fetch failed");
        }

        let mut outcomes = Vec::with_capacity(self.config.tiers.len());
        for tier in &self.config.tiers {
            let project = projects.get(&tier.kind).map(PathBuf::as_path);
            outcomes.push(self.run_tier(tier, project).await);
        }

        match &start_branch {
            Some(branch) => {
                if let Err(e) = self.vcs.checkout_or_create(branch).await {
                    warn!(branch = %branch, error = %e, "could not restore start branch");
                }
            }
            None => warn!("no start branch recorded, leaving working copy as is"),
        }

        if let Err(e) = self.host.shutdown().await {
            warn!(error = %e, "automation host shutdown failed");
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            start_branch,
            outcomes,
        };
        obs::emit_run_finished(&summary.run_id, summary.duration_ms(), summary.overall_ok());
        for line in summary.lines() {
            info!("{line}");
        }
        summary
    }

    /// Run one tier's flow and turn whatever happens into an [`Outcome`].
    pub async fn run_tier(&self, tier: &TierConfig, project: Option<&Path>) -> Outcome {
        obs::emit_tier_started(tier.name(), tier.flow().name());

        let span = obs::tier_span(tier.name(), &tier.branch);
        let result = AssertUnwindSafe(self.tier_flow(tier, project).instrument(span))
            .catch_unwind()
            .await;

        let outcome = match settle(result) {
            Ok(note) => Outcome::ok(tier.kind, note),
            Err(e) => {
                if matches!(e, AgentError::Panicked(_)) {
                    error!(tier = %tier.name(), error = %e, "tier flow panicked");
                }
                Outcome::fail(tier.kind, e.to_string())
            }
        };
        obs::emit_tier_finished(tier.name(), outcome.is_ok(), &outcome.note);
        outcome
    }

    async fn tier_flow(&self, tier: &TierConfig, project: Option<&Path>) -> Result<String> {
        let project =
            project.ok_or_else(|| ConfigError::MissingProjects(tier.name().to_string()))?;

        self.vcs.checkout_or_create(&tier.branch).await?;
        if let Err(e) = self.vcs.ensure_upstream(&tier.branch).await {
            warn!(branch = %tier.branch, error = %e, "could not set upstream");
        }

        match tier.flow() {
            Flow::Capture => self.capture(tier, project).await,
            Flow::Deploy => self.deploy(tier, project).await,
        }
    }

    /// Pull the controller program into the tier branch.
    ///
    /// Returns the outcome note on success.
    pub async fn capture(&self, tier: &TierConfig, project_path: &Path) -> Result<String> {
        let stamp = Local::now().format(STAMP_FORMAT).to_string();
        let artifact_abs = self.config.repo_root.join(&tier.artifact_path);
        create_parent(&artifact_abs)?;

        let project = self.host.open_project(project_path).await?;
        let captured = self
            .capture_from_device(tier, project.as_ref(), &artifact_abs, &stamp)
            .await;
        close_project(project.as_ref()).await;
        captured?;

        let artifact = self.normalizer.normalize_artifact(&artifact_abs)?;
        obs::emit_artifact_normalized(
            &tier.artifact_path.display().to_string(),
            artifact.short_hash(),
            artifact.rewritten,
        );

        let stage = match tier.commit_scope {
            CommitScope::Artifacts => StageSet::Paths(vec![tier.artifact_path.clone()]),
            CommitScope::Repository => StageSet::Repository {
                exclude: self.archive_exclusion(tier),
            },
        };
        let dirty = match &stage {
            StageSet::Paths(_) => self.vcs.has_diff(&tier.artifact_path).await,
            StageSet::Repository { exclude } => {
                !self.vcs.status_porcelain(exclude).await?.is_empty()
            }
        };
        if !dirty {
            return Ok(format!("no changes ({})", artifact.short_hash()));
        }

        let message = format!("{} capture {}", tier.name(), stamp);

        match self.vcs.commit_and_push(&stage, &message, &tier.branch).await {
            Ok(report) if report.pushed => {
                Ok(format!("committed and pushed ({})", artifact.short_hash()))
            }
            Ok(_) => Ok(format!("committed locally ({})", artifact.short_hash())),
            Err(VcsError::NothingToCommit) => Ok("no changes (nothing to commit)".to_string()),
            Err(e) => Err(e.into()),
        }
    }

    async fn capture_from_device(
        &self,
        tier: &TierConfig,
        project: &dyn Project,
        artifact: &Path,
        stamp: &str,
    ) -> Result<()> {
        let app = self.connector.wait_active_application(project).await?;
        let session = self.connector.open(app.as_ref()).await?;
        let body = AssertUnwindSafe(self.capture_in_session(
            tier,
            &session,
            project,
            app.as_ref(),
            artifact,
            stamp,
        ))
        .catch_unwind()
        .await;
        session.close().await;
        settle(body)
    }

    async fn capture_in_session(
        &self,
        tier: &TierConfig,
        session: &RuntimeSession,
        project: &dyn Project,
        app: &dyn Application,
        artifact: &Path,
        stamp: &str,
    ) -> Result<()> {
        if CapabilityProbe::exposes_any(session.application(), SOURCE_PULL) {
            let pulled = CapabilityProbe::resolve(session.application(), SOURCE_PULL, &[]).await?;
            info!(operation = %pulled, "pulled source from device");
        } else {
            info!("no source pull operation exposed, exporting current project state");
        }

        self.save_archive(tier, project, stamp).await;
        export_artifact(project, app, artifact).await
    }

    /// Archive snapshots never enter version control, so a whole-repository
    /// capture leaves the archive directory out when it lies in the working copy.
    fn archive_exclusion(&self, tier: &TierConfig) -> Vec<PathBuf> {
        let Some(dir) = &tier.archive_dir else {
            return Vec::new();
        };
        if dir.is_relative() {
            return vec![dir.clone()];
        }
        match dir.strip_prefix(&self.config.repo_root) {
            Ok(inner) if !inner.as_os_str().is_empty() => vec![inner.to_path_buf()],
            Ok(_) => {
                warn!(dir = %dir.display(), "archive directory is the repository root");
                Vec::new()
            }
            Err(_) => Vec::new(),
        }
    }

    async fn save_archive(&self, tier: &TierConfig, project: &dyn Project, stamp: &str) {
        let Some(dir) = &tier.archive_dir else {
            return;
        };
        let dir = self.config.repo_root.join(dir);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "could not create archive directory");
            return;
        }
        let dest = dir.join(format!("{}_{}.projectarchive", tier.controller, stamp));
        match project.save_archive(&dest).await {
            Ok(()) => info!(path = %dest.display(), "saved project archive"),
            Err(e) => warn!(path = %dest.display(), error = %e, "project archive failed"),
        }
    }

    /// Apply the tier branch to the controller when the remote moved.
    ///
    /// Returns the outcome note on success.
    pub async fn deploy(&self, tier: &TierConfig, project_path: &Path) -> Result<String> {
        if let Err(e) = self.vcs.fetch().await {
            warn!(error = %e, "fetch failed, deciding on last known remote state");
        }

        let state = self.vcs.repository_state(&tier.branch).await;
        info!(
            local = %state.short_local(),
            remote = %state.short_remote(),
            relation = %state.relation,
            "repository state"
        );
        if !state.remote_ahead() {
            return Ok("no remote changes".to_string());
        }

        self.vcs.fast_forward_pull(&tier.branch).await?;

        let project = self.host.open_project(project_path).await?;
        let deployed = self.deploy_to_device(tier, project.as_ref()).await;
        close_project(project.as_ref()).await;
        deployed
    }

    async fn deploy_to_device(&self, tier: &TierConfig, project: &dyn Project) -> Result<String> {
        let app = self.connector.wait_active_application(project).await?;
        let session = self.connector.open(app.as_ref()).await?;
        let body = AssertUnwindSafe(self.apply_in_session(tier, &session))
            .catch_unwind()
            .await;
        session.close().await;
        settle(body)
    }

    async fn apply_in_session(&self, tier: &TierConfig, session: &RuntimeSession) -> Result<String> {
        let resolved = CapabilityProbe::resolve(session.application(), APPLY, APPLY_OPTIONS).await?;
        if tier.start_after_deploy {
            ensure_running(session.application()).await;
        }
        Ok(format!("deployed ({})", resolved.descriptor()))
    }

    /// What [`run`](Self::run) would do, without touching a device.
    pub async fn plan(&self) -> Vec<PlanEntry> {
        plan(&self.config, &self.vcs).await
    }
}

/// Action a run would take for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedAction {
    Capture,
    Deploy,
    Skip,
}

/// One tier's row in a dry run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub tier: TierKind,
    pub branch: String,
    pub action: PlannedAction,
    pub local: Option<String>,
    pub remote: Option<String>,
    /// Set for deploy tiers only.
    pub relation: Option<BranchRelation>,
}

impl PlanEntry {
    pub fn line(&self) -> String {
        match self.action {
            PlannedAction::Capture => format!("{}: capture ({})", self.tier, self.branch),
            PlannedAction::Deploy | PlannedAction::Skip => {
                let verb = if self.action == PlannedAction::Deploy {
                    "deploy"
                } else {
                    "skip"
                };
                let relation = self
                    .relation
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                format!(
                    "{}: {} ({} {}, {})",
                    self.tier,
                    verb,
                    self.branch,
                    short_id(self.local.as_deref()),
                    relation,
                )
            }
        }
    }
}

/// Dry run over `config` using `vcs`. Fetches once, never opens a project.
pub async fn plan(config: &AgentConfig, vcs: &VersionControlGateway) -> Vec<PlanEntry> {
    if let Err(e) = vcs.fetch().await {
        warn!(error = %e, "fetch failed, planning on last known remote state");
    }

    let mut entries = Vec::with_capacity(config.tiers.len());
    for tier in &config.tiers {
        let entry = match tier.flow() {
            Flow::Capture => PlanEntry {
                tier: tier.kind,
                branch: tier.branch.clone(),
                action: PlannedAction::Capture,
                local: None,
                remote: None,
                relation: None,
            },
            Flow::Deploy => {
                let state = vcs.repository_state(&tier.branch).await;
                PlanEntry {
                    tier: tier.kind,
                    branch: tier.branch.clone(),
                    action: if state.remote_ahead() {
                        PlannedAction::Deploy
                    } else {
                        PlannedAction::Skip
                    },
                    relation: Some(state.relation),
                    local: state.local,
                    remote: state.remote,
                }
            }
        };
        entries.push(entry);
    }
    entries
}

/// Export through the application, falling back to the project export.
async fn export_artifact(project: &dyn Project, app: &dyn Application, dest: &Path) -> Result<()> {
    let app_error = match app.export_xml(dest).await {
        Ok(()) => {
            info!(path = %dest.display(), "exported application");
            return Ok(());
        }
        Err(e) => {
            warn!(error = %e, "application export failed, trying project export");
            e
        }
    };

    match project.export_xml(dest).await {
        Ok(()) => {
            info!(path = %dest.display(), "exported project");
            Ok(())
        }
        Err(e) => Err(ExportError::Export {
            path: dest.display().to_string(),
            detail: format!("application export: {app_error}; project export: {e}"),
        }
        .into()),
    }
}

/// Best effort: start the application unless it already runs.
async fn ensure_running(app: &dyn OnlineApplication) {
    match app.application_state().await {
        Ok(Some(state)) if state.is_running() => {
            info!("application already running");
            return;
        }
        Ok(state) => info!(state = ?state, "application not running"),
        Err(e) => warn!(error = %e, "could not read application state"),
    }

    if !app.capabilities().exposes(ops::START) {
        info!("no start operation exposed, leaving application stopped");
        return;
    }
    match app.invoke(ops::START, None).await {
        Ok(()) => info!("application started"),
        Err(e) => warn!(error = %e, "start failed, application left stopped"),
    }
}

async fn close_project(project: &dyn Project) {
    if let Err(e) = project.close().await {
        warn!(error = %e, "closing project failed");
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ExportError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

/// Flatten a caught flow result, turning a panic into [`AgentError::Panicked`].
fn settle<T>(caught: std::thread::Result<Result<T>>) -> Result<T> {
    match caught {
        Ok(result) => result,
        Err(payload) => Err(AgentError::Panicked(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
