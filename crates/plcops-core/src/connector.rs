//! Connect/authenticate/login lifecycle against one controller.
//!
//! A [`RuntimeSession`] walks
//! `Idle -> Connecting -> Connected -> LoggedIn -> Closed`, with `Failed`
//! reachable from any non-terminal state. Sessions are built fresh for each
//! tier and must be closed before the next tier starts.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::config::{ConnectionSettings, Credentials};
use crate::device::{options, Application, OnlineApplication, OnlineDevice, Project};
use crate::error::{AuthError, ConnectionError, DeviceResult, Result};
use crate::obs;
use crate::orchestrator::panic_message;

/// Login policy: keep whatever is running on the device.
pub const LOGIN_POLICY: &str = options::KEEP;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    LoggedIn,
    Closed,
    Failed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::LoggedIn => "logged_in",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Live association with one controller.
pub struct RuntimeSession {
    application: Box<dyn OnlineApplication>,
    device: Box<dyn OnlineDevice>,
    state: SessionState,
    history: Vec<SessionState>,
    credentials_injected: bool,
    released: bool,
}

impl RuntimeSession {
    fn new(application: Box<dyn OnlineApplication>, device: Box<dyn OnlineDevice>) -> Self {
        Self {
            application,
            device,
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
            credentials_injected: false,
            released: false,
        }
    }

    pub fn application(&self) -> &dyn OnlineApplication {
        self.application.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state visited, starting with `Idle`.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn credentials_injected(&self) -> bool {
        self.credentials_injected
    }

    fn transition(&mut self, to: SessionState) {
        if self.state == to || self.state.is_terminal() {
            return;
        }
        obs::emit_session_transition(self.state.name(), to.name());
        self.state = to;
        self.history.push(to);
    }

    /// Disconnect and log out. Never fails.
    pub async fn close(mut self) {
        self.release().await;
        self.transition(SessionState::Closed);
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // A status query that panics counts as "still up" so teardown is tried.
        let connected = AssertUnwindSafe(self.device.is_connected())
            .catch_unwind()
            .await
            .unwrap_or(true);
        let logged_in = AssertUnwindSafe(self.application.is_logged_in())
            .catch_unwind()
            .await
            .unwrap_or(true);

        if connected {
            teardown_step("disconnect", self.device.disconnect()).await;
        }
        if logged_in {
            teardown_step("logout", self.application.logout()).await;
        }
    }
}

/// Run one teardown call, logging its error or panic instead of raising it.
async fn teardown_step(step: &str, call: impl Future<Output = DeviceResult<()>>) {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(step, error = %e, "teardown step failed"),
        Err(payload) => warn!(
            step,
            panic = %panic_message(payload.as_ref()),
            "teardown step panicked"
        ),
    }
}

impl Drop for RuntimeSession {
    fn drop(&mut self) {
        if !self.released {
            warn!(state = %self.state, "runtime session dropped without teardown");
        }
    }
}

/// Builds [`RuntimeSession`]s.
#[derive(Debug, Clone)]
pub struct RuntimeConnector {
    settings: ConnectionSettings,
    credentials: Option<Credentials>,
}

impl RuntimeConnector {
    pub fn new(settings: ConnectionSettings, credentials: Option<Credentials>) -> Self {
        Self {
            settings,
            credentials,
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Poll the project until its active application appears.
    pub async fn wait_active_application(
        &self,
        project: &dyn Project,
    ) -> Result<Arc<dyn Application>> {
        let started = Instant::now();
        let deadline = started + self.settings.application_timeout();
        loop {
            if let Some(app) = project.active_application().await? {
                return Ok(app);
            }
            if Instant::now() >= deadline {
                return Err(ConnectionError::Timeout {
                    what: "active application".to_string(),
                    waited_secs: started.elapsed().as_secs(),
                }
                .into());
            }
            sleep(self.settings.application_poll()).await;
        }
    }

    /// Go online with `application`, connect and log in.
    ///
    /// On failure the partially built session is torn down before the error
    /// is returned.
    pub async fn open(&self, application: &dyn Application) -> Result<RuntimeSession> {
        let handles = application.go_online().await?;
        let mut session = RuntimeSession::new(handles.application, handles.device);

        match self.establish(&mut session).await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.transition(SessionState::Failed);
                session.release().await;
                Err(e)
            }
        }
    }

    async fn establish(&self, session: &mut RuntimeSession) -> Result<()> {
        session.transition(SessionState::Connecting);

        match &self.credentials {
            Some(credentials) => {
                info!(user = %credentials.username, "injecting credentials");
                match session.device.set_credentials(credentials).await {
                    Ok(()) => session.credentials_injected = true,
                    Err(e) => warn!(error = %e, "credential injection failed"),
                }
            }
            None => info!("relying on stored credentials"),
        }

        self.connect_with_retry(session.device.as_ref()).await?;
        self.wait_connected(session.device.as_ref()).await?;
        session.transition(SessionState::Connected);

        self.login(session.application.as_ref()).await?;
        session.transition(SessionState::LoggedIn);
        Ok(())
    }

    async fn connect_with_retry(&self, device: &dyn OnlineDevice) -> Result<()> {
        let attempts = self.settings.attempts.max(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=attempts {
            if device.is_connected().await {
                info!("device already connected");
                return Ok(());
            }
            info!(attempt = attempt, of = attempts, "connecting");
            match device.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "connect failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        sleep(self.settings.retry_delay()).await;
                    }
                }
            }
        }

        Err(ConnectionError::Refused {
            attempts,
            last_error,
        }
        .into())
    }

    async fn wait_connected(&self, device: &dyn OnlineDevice) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.settings.connect_timeout();
        loop {
            if device.is_connected().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ConnectionError::Timeout {
                    what: "device connection".to_string(),
                    waited_secs: started.elapsed().as_secs(),
                }
                .into());
            }
            sleep(self.settings.connect_poll()).await;
        }
    }

    async fn login(&self, application: &dyn OnlineApplication) -> Result<()> {
        if application.is_logged_in().await {
            return Ok(());
        }
        if !application.capabilities().has_option(LOGIN_POLICY) {
            return Err(AuthError::MissingPolicyEnum {
                policy: LOGIN_POLICY.to_string(),
            }
            .into());
        }

        info!(policy = %LOGIN_POLICY, "logging in");
        application
            .login(LOGIN_POLICY)
            .await
            .map_err(|e| AuthError::LoginFailed {
                detail: e.to_string(),
            })?;

        if !application.is_logged_in().await {
            return Err(AuthError::LoginFailed {
                detail: "runtime still reports logged out".to_string(),
            }
            .into());
        }
        Ok(())
    }
}
