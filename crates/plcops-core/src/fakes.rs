//! In-memory fakes for the device-automation traits (testing only)
//!
//! Provides `FakeHost`, `FakeProject`, `FakeApplication`,
//! `FakeOnlineApplication` and `FakeOnlineDevice`. Every fake is a cheap
//! handle over shared state, so a test keeps a clone to script behaviour and
//! inspect call counts after handing the other clone to the agent.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::Credentials;
use crate::device::{
    ops, Application, ApplicationState, AutomationHost, CapabilitySet, OnlineApplication,
    OnlineDevice, OnlineHandles, Project,
};
use crate::error::{DeviceError, DeviceResult};

// ---------------------------------------------------------------------------
// FakeOnlineDevice
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct DeviceState {
    connected: bool,
    /// Number of leading `connect` calls that fail.
    failing_connects: u32,
    /// `connect` returns Ok but the device never reports connected.
    silent: bool,
    /// Polls of `is_connected` before a successful connect becomes visible.
    connect_latency_polls: u32,
    pending_polls: u32,
    connect_calls: u32,
    disconnect_calls: u32,
    /// `disconnect` panics instead of returning.
    disconnect_panics: bool,
    credentials: Vec<Credentials>,
}

/// Scripted controller device.
#[derive(Debug, Clone, Default)]
pub struct FakeOnlineDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl FakeOnlineDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `n` connect calls fail; `u32::MAX` fails forever.
    pub fn failing_connects(self, n: u32) -> Self {
        self.state.lock().unwrap().failing_connects = n;
        self
    }

    /// Accept connect calls but never reach the connected state.
    pub fn never_connects(self) -> Self {
        self.state.lock().unwrap().silent = true;
        self
    }

    /// A successful connect becomes visible only after `polls` status checks.
    pub fn connect_latency(self, polls: u32) -> Self {
        self.state.lock().unwrap().connect_latency_polls = polls;
        self
    }

    pub fn already_connected(self) -> Self {
        self.state.lock().unwrap().connected = true;
        self
    }

    pub fn panicking_disconnect(self) -> Self {
        self.state.lock().unwrap().disconnect_panics = true;
        self
    }

    pub fn connect_calls(&self) -> u32 {
        self.state.lock().unwrap().connect_calls
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.state.lock().unwrap().disconnect_calls
    }

    pub fn connected_now(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    pub fn credentials(&self) -> Vec<Credentials> {
        self.state.lock().unwrap().credentials.clone()
    }
}

#[async_trait]
impl OnlineDevice for FakeOnlineDevice {
    async fn set_credentials(&self, credentials: &Credentials) -> DeviceResult<()> {
        self.state
            .lock()
            .unwrap()
            .credentials
            .push(credentials.clone());
        Ok(())
    }

    async fn connect(&self) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.connect_calls += 1;
        if state.connect_calls <= state.failing_connects {
            return Err(DeviceError::new("gateway refused connection"));
        }
        if !state.silent {
            if state.connect_latency_polls == 0 {
                state.connected = true;
            } else {
                state.pending_polls = state.connect_latency_polls;
            }
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.pending_polls > 0 {
            state.pending_polls -= 1;
            if state.pending_polls == 0 {
                state.connected = true;
            }
        }
        state.connected
    }

    async fn disconnect(&self) -> DeviceResult<()> {
        let panics = {
            let mut state = self.state.lock().unwrap();
            state.disconnect_calls += 1;
            if !state.disconnect_panics {
                state.connected = false;
            }
            state.disconnect_panics
        };
        if panics {
            panic!("device driver crashed during disconnect");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeOnlineApplication
// ---------------------------------------------------------------------------

/// How `login` behaves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LoginBehavior {
    #[default]
    Succeed,
    /// Returns Ok but the application stays logged out.
    StayLoggedOut,
    Error(String),
}

#[derive(Debug, Default)]
struct OnlineAppState {
    capabilities: CapabilitySet,
    logged_in: bool,
    login_behavior: LoginBehavior,
    logins: Vec<String>,
    logout_calls: u32,
    logout_error: Option<String>,
    invocations: Vec<String>,
    failures: HashMap<String, String>,
    panics: HashSet<String>,
    app_state: Option<ApplicationState>,
}

/// Scripted online application with a declared capability set.
#[derive(Debug, Clone, Default)]
pub struct FakeOnlineApplication {
    state: Arc<Mutex<OnlineAppState>>,
}

impl FakeOnlineApplication {
    pub fn new(capabilities: CapabilitySet) -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().capabilities = capabilities;
        fake
    }

    pub fn with_login(self, behavior: LoginBehavior) -> Self {
        self.state.lock().unwrap().login_behavior = behavior;
        self
    }

    pub fn already_logged_in(self) -> Self {
        self.state.lock().unwrap().logged_in = true;
        self
    }

    pub fn with_state(self, app_state: ApplicationState) -> Self {
        self.state.lock().unwrap().app_state = Some(app_state);
        self
    }

    pub fn failing_logout(self, message: &str) -> Self {
        self.state.lock().unwrap().logout_error = Some(message.to_string());
        self
    }

    /// Make the invocation rendered as `descriptor` (e.g. `"download(Keep)"`) fail.
    pub fn fail_invocation(&self, descriptor: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(descriptor.to_string(), message.to_string());
    }

    /// Make the invocation rendered as `descriptor` panic.
    pub fn panic_on(&self, descriptor: &str) {
        self.state
            .lock()
            .unwrap()
            .panics
            .insert(descriptor.to_string());
    }

    pub fn invocations(&self) -> Vec<String> {
        self.state.lock().unwrap().invocations.clone()
    }

    pub fn logins(&self) -> Vec<String> {
        self.state.lock().unwrap().logins.clone()
    }

    pub fn logout_calls(&self) -> u32 {
        self.state.lock().unwrap().logout_calls
    }

    pub fn logged_in_now(&self) -> bool {
        self.state.lock().unwrap().logged_in
    }
}

#[async_trait]
impl OnlineApplication for FakeOnlineApplication {
    fn capabilities(&self) -> CapabilitySet {
        self.state.lock().unwrap().capabilities.clone()
    }

    async fn is_logged_in(&self) -> bool {
        self.state.lock().unwrap().logged_in
    }

    async fn login(&self, option: &str) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.logins.push(option.to_string());
        match state.login_behavior.clone() {
            LoginBehavior::Succeed => {
                state.logged_in = true;
                Ok(())
            }
            LoginBehavior::StayLoggedOut => Ok(()),
            LoginBehavior::Error(message) => Err(DeviceError(message)),
        }
    }

    async fn logout(&self) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.logout_calls += 1;
        if let Some(message) = state.logout_error.clone() {
            return Err(DeviceError(message));
        }
        state.logged_in = false;
        Ok(())
    }

    async fn invoke(&self, operation: &str, option: Option<&str>) -> DeviceResult<()> {
        let descriptor = format!("{}({})", operation, option.unwrap_or(""));
        let mut state = self.state.lock().unwrap();
        state.invocations.push(descriptor.clone());
        if state.panics.contains(&descriptor) {
            drop(state);
            panic!("runtime crashed during {descriptor}");
        }
        if let Some(message) = state.failures.get(&descriptor) {
            return Err(DeviceError(message.clone()));
        }
        if operation == ops::START {
            state.app_state = Some(ApplicationState::Run);
        }
        Ok(())
    }

    async fn application_state(&self) -> DeviceResult<Option<ApplicationState>> {
        Ok(self.state.lock().unwrap().app_state)
    }
}

// ---------------------------------------------------------------------------
// FakeApplication
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ApplicationFakeState {
    export: Option<String>,
    go_online_calls: u32,
}

/// Offline application handle that exports scripted text.
#[derive(Debug, Clone)]
pub struct FakeApplication {
    state: Arc<Mutex<ApplicationFakeState>>,
    online: FakeOnlineApplication,
    device: FakeOnlineDevice,
}

impl FakeApplication {
    pub fn new(online: FakeOnlineApplication, device: FakeOnlineDevice) -> Self {
        Self {
            state: Arc::default(),
            online,
            device,
        }
    }

    /// Text written by `export_xml`; `None` makes the export fail.
    pub fn set_export(&self, content: Option<&str>) {
        self.state.lock().unwrap().export = content.map(str::to_string);
    }

    pub fn go_online_calls(&self) -> u32 {
        self.state.lock().unwrap().go_online_calls
    }

    pub fn online(&self) -> &FakeOnlineApplication {
        &self.online
    }

    pub fn device(&self) -> &FakeOnlineDevice {
        &self.device
    }
}

#[async_trait]
impl Application for FakeApplication {
    async fn export_xml(&self, dest: &Path) -> DeviceResult<()> {
        let export = self.state.lock().unwrap().export.clone();
        match export {
            Some(text) => std::fs::write(dest, text).map_err(|e| DeviceError(e.to_string())),
            None => Err(DeviceError::new("application export not supported")),
        }
    }

    async fn go_online(&self) -> DeviceResult<OnlineHandles> {
        self.state.lock().unwrap().go_online_calls += 1;
        Ok(OnlineHandles {
            application: Box::new(self.online.clone()),
            device: Box::new(self.device.clone()),
        })
    }
}

// ---------------------------------------------------------------------------
// FakeProject
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ProjectState {
    /// `active_application` polls that return `None` before the app appears.
    loading_polls: u32,
    export: Option<String>,
    archive_fails: bool,
    archives: Vec<PathBuf>,
    close_calls: u32,
}

/// Scripted controller project.
#[derive(Debug, Clone)]
pub struct FakeProject {
    state: Arc<Mutex<ProjectState>>,
    application: Option<FakeApplication>,
}

impl FakeProject {
    pub fn new(application: FakeApplication) -> Self {
        Self {
            state: Arc::default(),
            application: Some(application),
        }
    }

    /// A project whose active application never appears.
    pub fn without_application() -> Self {
        Self {
            state: Arc::default(),
            application: None,
        }
    }

    pub fn loading_for(self, polls: u32) -> Self {
        self.state.lock().unwrap().loading_polls = polls;
        self
    }

    /// Text written by the project-level export fallback.
    pub fn with_project_export(self, content: &str) -> Self {
        self.state.lock().unwrap().export = Some(content.to_string());
        self
    }

    pub fn failing_archive(self) -> Self {
        self.state.lock().unwrap().archive_fails = true;
        self
    }

    pub fn archives(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().archives.clone()
    }

    pub fn close_calls(&self) -> u32 {
        self.state.lock().unwrap().close_calls
    }

    pub fn application(&self) -> Option<&FakeApplication> {
        self.application.as_ref()
    }
}

#[async_trait]
impl Project for FakeProject {
    async fn active_application(&self) -> DeviceResult<Option<Arc<dyn Application>>> {
        let mut state = self.state.lock().unwrap();
        if state.loading_polls > 0 {
            state.loading_polls -= 1;
            return Ok(None);
        }
        Ok(self
            .application
            .clone()
            .map(|app| Arc::new(app) as Arc<dyn Application>))
    }

    async fn export_xml(&self, dest: &Path) -> DeviceResult<()> {
        let export = self.state.lock().unwrap().export.clone();
        match export {
            Some(text) => std::fs::write(dest, text).map_err(|e| DeviceError(e.to_string())),
            None => Err(DeviceError::new("project export not supported")),
        }
    }

    async fn save_archive(&self, dest: &Path) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.archive_fails {
            return Err(DeviceError::new("archive save failed"));
        }
        std::fs::write(dest, b"archive").map_err(|e| DeviceError(e.to_string()))?;
        state.archives.push(dest.to_path_buf());
        Ok(())
    }

    async fn close(&self) -> DeviceResult<()> {
        self.state.lock().unwrap().close_calls += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeHost
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct HostState {
    projects: HashMap<PathBuf, FakeProject>,
    opened: Vec<PathBuf>,
    shutdown_calls: u32,
}

/// Automation host serving scripted projects by path.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(self, path: impl Into<PathBuf>, project: FakeProject) -> Self {
        self.state
            .lock()
            .unwrap()
            .projects
            .insert(path.into(), project);
        self
    }

    /// Every path passed to `open_project`, in order.
    pub fn opened(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().opened.clone()
    }

    pub fn shutdown_calls(&self) -> u32 {
        self.state.lock().unwrap().shutdown_calls
    }
}

#[async_trait]
impl AutomationHost for FakeHost {
    async fn open_project(&self, path: &Path) -> DeviceResult<Box<dyn Project>> {
        let mut state = self.state.lock().unwrap();
        state.opened.push(path.to_path_buf());
        match state.projects.get(path) {
            Some(project) => Ok(Box::new(project.clone())),
            None => Err(DeviceError(format!(
                "project not found: {}",
                path.display()
            ))),
        }
    }

    async fn shutdown(&self) -> DeviceResult<()> {
        self.state.lock().unwrap().shutdown_calls += 1;
        Ok(())
    }
}
