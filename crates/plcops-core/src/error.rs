//! Error taxonomy for the PLC GitOps agent.
//!
//! Each component reports its own category; [`AgentError`] is the umbrella
//! used at the orchestration layer and converts from every category.

/// Version-control failures reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VcsError {
    #[error("branch '{branch}' exists neither locally nor on the remote")]
    NotFound { branch: String },

    #[error("branch '{branch}' cannot be fast-forwarded: {detail}")]
    Diverged { branch: String, detail: String },

    #[error("nothing to commit")]
    NothingToCommit,

    #[error("push of '{branch}' rejected (commit kept locally): {detail}")]
    PushRejected { branch: String, detail: String },

    #[error("git {command} failed: {detail}")]
    CommandFailed { command: String, detail: String },

    #[error("remote '{remote}' is not configured")]
    NoRemote { remote: String },
}

/// Failures while establishing the device connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("timed out after {waited_secs}s waiting for {what}")]
    Timeout { what: String, waited_secs: u64 },

    #[error("connection refused after {attempts} attempt(s): {last_error}")]
    Refused { attempts: u32, last_error: String },
}

/// Authentication failures. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("login failed: {detail}")]
    LoginFailed { detail: String },

    #[error("runtime does not offer the '{policy}' login policy")]
    MissingPolicyEnum { policy: String },
}

/// No candidate operation could be invoked on the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("no matching operation among [{candidates}] (last error: {last_error})")]
    NoMatchingOperation {
        candidates: String,
        last_error: String,
    },
}

/// Failures producing or rewriting an exported artifact.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("export to {path} failed: {detail}")]
    Export { path: String, detail: String },

    #[error("artifact io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Opaque failure raised by the device-automation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DeviceError(pub String);

impl DeviceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result type for calls into the device-automation collaborator.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Configuration and project-resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("project path not found: {0}")]
    ProjectPathNotFound(String),

    #[error("missing project files for tier(s): {0}")]
    MissingProjects(String),

    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Umbrella error for orchestration steps.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("panic: {0}")]
    Panicked(String),
}

/// Result type for orchestration steps.
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vcs_error_display() {
        let err = VcsError::Diverged {
            branch: "staging".to_string(),
            detail: "fatal: Not possible to fast-forward".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("staging"));
        assert!(msg.contains("fast-forward"));
    }

    #[test]
    fn test_agent_error_is_transparent_for_categories() {
        let err: AgentError = AuthError::LoginFailed {
            detail: "still logged out".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "login failed: still logged out");

        let err: AgentError = ConnectionError::Refused {
            attempts: 3,
            last_error: "gateway offline".to_string(),
        }
        .into();
        assert!(err.to_string().contains("3 attempt(s)"));
    }

    #[test]
    fn test_device_error_wraps_message() {
        let err: AgentError = DeviceError::new("no target").into();
        assert_eq!(err.to_string(), "device error: no target");
    }
}
