//! Device-automation collaborator interfaces.
//!
//! These traits describe what the agent needs from the automation host that
//! drives controllers: opening projects, exporting them, going online and
//! invoking application operations. The exact operation surface of a live
//! application varies by runtime build, so it is published as data through
//! [`CapabilitySet`] instead of being assumed.
//!
//! In-memory implementations for testing live in [`crate::fakes`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Credentials;
use crate::error::DeviceResult;

/// Operation names a runtime may expose on an online application.
pub mod ops {
    pub const SOURCE_DOWNLOAD: &str = "source_download";
    pub const SOURCE_UPLOAD: &str = "source_upload";
    pub const DOWNLOAD: &str = "download";
    pub const APPLICATION_DOWNLOAD: &str = "application_download";
    pub const PROGRAM_DOWNLOAD: &str = "program_download";
    pub const CREATE_BOOT_APPLICATION: &str = "create_boot_application";
    pub const START: &str = "start";
}

/// Online-change option names a runtime may expose.
pub mod options {
    pub const KEEP: &str = "Keep";
    pub const DOWNLOAD: &str = "Download";
    pub const FULL_DOWNLOAD: &str = "FullDownload";
    pub const ALL: &str = "All";
}

/// Operations and option names a connected runtime build supports.
///
/// Order is whatever the runtime reports and carries no preference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub operations: Vec<String>,
    pub options: Vec<String>,
}

impl CapabilitySet {
    pub fn new<O, P>(operations: O, options: P) -> Self
    where
        O: IntoIterator,
        O::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            operations: operations.into_iter().map(Into::into).collect(),
            options: options.into_iter().map(Into::into).collect(),
        }
    }

    pub fn exposes(&self, operation: &str) -> bool {
        self.operations.iter().any(|o| o == operation)
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }
}

/// Run state reported by an online application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationState {
    Run,
    Stop,
    Exception,
    Unknown,
}

impl ApplicationState {
    pub fn is_running(&self) -> bool {
        matches!(self, ApplicationState::Run)
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApplicationState::Run => "run",
            ApplicationState::Stop => "stop",
            ApplicationState::Exception => "exception",
            ApplicationState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// The process hosting the device-automation surface.
#[async_trait]
pub trait AutomationHost: Send + Sync {
    /// Open a controller project, replacing any project already open.
    async fn open_project(&self, path: &Path) -> DeviceResult<Box<dyn Project>>;

    /// Ask the host to shut down cleanly.
    async fn shutdown(&self) -> DeviceResult<()>;
}

/// An open controller project.
#[async_trait]
pub trait Project: Send + Sync {
    /// The active application, `None` while the project is still loading.
    async fn active_application(&self) -> DeviceResult<Option<Arc<dyn Application>>>;

    /// Project-level export of the whole tree to a text artifact.
    async fn export_xml(&self, dest: &Path) -> DeviceResult<()>;

    /// Save a binary snapshot of the project.
    async fn save_archive(&self, dest: &Path) -> DeviceResult<()>;

    async fn close(&self) -> DeviceResult<()>;
}

/// Offline handle on a project's application.
#[async_trait]
pub trait Application: Send + Sync {
    /// Export the application tree to a text artifact.
    async fn export_xml(&self, dest: &Path) -> DeviceResult<()>;

    /// Create the online view of this application and its device.
    async fn go_online(&self) -> DeviceResult<OnlineHandles>;
}

/// Handles produced by [`Application::go_online`].
pub struct OnlineHandles {
    pub application: Box<dyn OnlineApplication>,
    pub device: Box<dyn OnlineDevice>,
}

/// The controller device behind an online application.
#[async_trait]
pub trait OnlineDevice: Send + Sync {
    /// Store credentials for the next connection without prompting.
    async fn set_credentials(&self, credentials: &Credentials) -> DeviceResult<()>;

    async fn connect(&self) -> DeviceResult<()>;

    async fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> DeviceResult<()>;
}

/// Live application on a connected controller.
#[async_trait]
pub trait OnlineApplication: Send + Sync {
    fn capabilities(&self) -> CapabilitySet;

    async fn is_logged_in(&self) -> bool;

    /// Log in with the named online-change option.
    async fn login(&self, option: &str) -> DeviceResult<()>;

    async fn logout(&self) -> DeviceResult<()>;

    /// Invoke a named operation, optionally with an online-change option.
    async fn invoke(&self, operation: &str, option: Option<&str>) -> DeviceResult<()>;

    /// Current run state, `None` when the runtime cannot report it.
    async fn application_state(&self) -> DeviceResult<Option<ApplicationState>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_set_lookup() {
        let caps = CapabilitySet::new(
            [ops::CREATE_BOOT_APPLICATION, ops::START],
            [options::KEEP],
        );
        assert!(caps.exposes("start"));
        assert!(!caps.exposes("download"));
        assert!(caps.has_option("Keep"));
        assert!(!caps.has_option("FullDownload"));
    }

    #[test]
    fn test_only_run_counts_as_running() {
        assert!(ApplicationState::Run.is_running());
        assert!(!ApplicationState::Stop.is_running());
        assert_eq!(ApplicationState::Exception.to_string(), "exception");
    }
}
