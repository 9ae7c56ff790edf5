//! PLC GitOps Core Library
//!
//! Capture controller programs into version control and deploy version
//! control back onto controllers, one environment tier at a time.

pub mod config;
pub mod connector;
pub mod device;
pub mod error;
pub mod fakes;
pub mod normalize;
pub mod obs;
pub mod orchestrator;
pub mod probe;
pub mod summary;
pub mod telemetry;
pub mod vcs;

pub use config::{
    resolve_projects, AgentConfig, CommitScope, ConnectionSettings, Credentials, Flow, TierConfig,
    TierKind,
};
pub use connector::{RuntimeConnector, RuntimeSession, SessionState};
pub use device::{
    ApplicationState, AutomationHost, CapabilitySet, OnlineApplication, OnlineDevice, Project,
};
pub use error::{
    AgentError, AuthError, CapabilityError, ConfigError, ConnectionError, DeviceError,
    ExportError, Result, VcsError,
};
pub use normalize::{Artifact, ArtifactNormalizer, NormalizeRules};
pub use orchestrator::{plan, DeployOrchestrator, PlanEntry, PlannedAction};
pub use probe::{CapabilityProbe, ResolvedOperation};
pub use summary::{Outcome, RunSummary, TierStatus};
pub use vcs::{
    BranchRelation, GitExecutor, GitOutput, RepositoryState, StageSet, SystemGit,
    VersionControlGateway,
};

pub use obs::{emit_run_finished, emit_run_started};
pub use telemetry::init_tracing;

/// plcops version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
