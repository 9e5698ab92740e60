//! Session and channel lifecycle for one panel.
//!
//! [`SessionLifecycleController`] is the only owner of the panel's kernel
//! [`Session`] and comm [`Channel`]. `start()` waits for the session to be
//! ready, opens the comm and sends a liveness probe; inbound results are
//! fanned out through the controller's [`ResultBroadcaster`].
//!
//! ```text
//! Idle -> AwaitingReady -> ChannelEstablishing -> ChannelActive
//!   any -> Error      (failed start, or the kernel closed the comm)
//!   any -> Disposed   (terminal)
//! ```
//!
//! There is no automatic retry. After an error the owner calls `start()`
//! again, or `select_backend()` with a new session.

use std::fmt;
use std::time::Duration;

use q8s_core::job_spec::JobDescriptor;
use q8s_events::{ResultBroadcaster, ResultEvent};
use q8s_kernel::channel::DEFAULT_OPEN_TIMEOUT;
use q8s_kernel::{Channel, KernelError, Session};
use tokio::task::JoinHandle;

use crate::error::PanelError;

/// Comm target registered by the q8s kernel.
pub const DEFAULT_COMM_TARGET: &str = "my_comm_target";

/// Expression sent right after the comm opens to check the kernel answers.
pub const DEFAULT_PROBE_CODE: &str = "1+1";

/// How long `start()` waits for the session to become ready.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    AwaitingReady,
    ChannelEstablishing,
    ChannelActive,
    Error,
    Disposed,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingReady => "awaiting_ready",
            Self::ChannelEstablishing => "channel_establishing",
            Self::ChannelActive => "channel_active",
            Self::Error => "error",
            Self::Disposed => "disposed",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the controller opens and probes its comm.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub target_name: String,
    pub probe_code: String,
    pub ready_timeout: Duration,
    pub open_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            target_name: DEFAULT_COMM_TARGET.to_string(),
            probe_code: DEFAULT_PROBE_CODE.to_string(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

pub struct SessionLifecycleController {
    config: ChannelConfig,
    state: ControllerState,
    session: Option<Session>,
    channel: Option<Channel>,
    results: ResultBroadcaster,
    session_watch: Option<JoinHandle<()>>,
}

impl SessionLifecycleController {
    /// A controller with no backend selected yet.
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            state: ControllerState::Idle,
            session: None,
            channel: None,
            results: ResultBroadcaster::new(),
            session_watch: None,
        }
    }

    /// A controller observing `session`.
    pub fn with_session(config: ChannelConfig, session: Session) -> Self {
        let mut controller = Self::new(config);
        controller.session = Some(session);
        controller
    }

    /// Current state. A comm the kernel closed reports as [`ControllerState::Error`].
    pub fn state(&self) -> ControllerState {
        match (&self.state, &self.channel) {
            (ControllerState::ChannelActive, Some(channel)) if !channel.is_open() => {
                ControllerState::Error
            }
            (state, _) => *state,
        }
    }

    /// Broadcaster fed by every result the kernel sends on the comm.
    pub fn results(&self) -> &ResultBroadcaster {
        &self.results
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    /// Wait for the session, open the comm and send the liveness probe.
    ///
    /// A no-op while a comm is already active. Fails with
    /// [`KernelError::NoBackend`] when no session is selected or it does not
    /// become ready in time, and with [`KernelError::ChannelSetup`] when the
    /// comm cannot be opened or probed. In both cases no channel is kept.
    pub async fn start(&mut self) -> Result<(), PanelError> {
        match self.state() {
            ControllerState::Disposed => return Err(PanelError::Disposed),
            ControllerState::ChannelActive => {
                tracing::debug!("Comm channel already active, start is a no-op");
                return Ok(());
            }
            ControllerState::Error => {
                // Drop the dead comm before trying again.
                self.channel = None;
            }
            _ => {}
        }

        match self.establish().await {
            Ok(channel) => {
                tracing::info!(
                    comm_id = %channel.comm_id(),
                    target = %self.config.target_name,
                    "Kernel comm channel active",
                );
                self.channel = Some(channel);
                self.state = ControllerState::ChannelActive;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Panel could not connect to the kernel");
                self.state = ControllerState::Error;
                Err(e.into())
            }
        }
    }

    async fn establish(&mut self) -> Result<Channel, KernelError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| KernelError::NoBackend("No kernel session selected".to_string()))?;

        self.state = ControllerState::AwaitingReady;
        if self.session_watch.is_none() {
            self.session_watch = Some(spawn_session_watch(session));
        }

        match tokio::time::timeout(self.config.ready_timeout, session.ready()).await {
            Ok(ready) => ready?,
            Err(_) => {
                return Err(KernelError::NoBackend(format!(
                    "Session '{}' not ready within {:?}",
                    session.name(),
                    self.config.ready_timeout
                )))
            }
        }

        self.state = ControllerState::ChannelEstablishing;

        let mut channel = Channel::new(session).with_open_timeout(self.config.open_timeout);
        let results = self.results.clone();
        channel.on_message(move |msg| match msg.result() {
            Some(value) => {
                results.emit(&ResultEvent::new(value.clone()));
            }
            None => {
                tracing::warn!(comm_id = %msg.comm_id, data = %msg.data, "Kernel message without a result");
            }
        });
        let comm_id = channel.comm_id().to_string();
        channel.on_close(move || {
            tracing::warn!(comm_id = %comm_id, "Kernel closed the comm channel, panel is disconnected");
        });

        channel.open(&self.config.target_name).await?;

        if let Err(e) = channel.send_code(&self.config.probe_code) {
            if let Err(close_err) = channel.close() {
                tracing::warn!(error = %close_err, "Failed to close comm channel after probe failure");
            }
            return Err(KernelError::ChannelSetup(format!("Liveness probe failed: {e}")));
        }

        Ok(channel)
    }

    /// Send `descriptor` to the kernel as `submit_job(<json>)`.
    pub fn submit(&self, descriptor: &JobDescriptor) -> Result<(), PanelError> {
        if self.state == ControllerState::Disposed {
            return Err(PanelError::Disposed);
        }
        let channel = self.channel.as_ref().ok_or_else(|| {
            KernelError::NoBackend("Panel is not connected to a kernel".to_string())
        })?;

        let json = serde_json::to_string(descriptor)
            .map_err(|e| KernelError::Protocol(format!("Failed to encode job descriptor: {e}")))?;
        channel.send_code(&format!("submit_job({json})"))?;

        tracing::info!(
            job = %descriptor.metadata.name,
            comm_id = %channel.comm_id(),
            "Job descriptor submitted",
        );
        Ok(())
    }

    /// Switch to a different kernel session.
    ///
    /// Closes the current comm and resets to [`ControllerState::Idle`]; call
    /// `start()` to connect to the new session.
    pub fn select_backend(&mut self, session: Session) -> Result<(), PanelError> {
        if self.state == ControllerState::Disposed {
            return Err(PanelError::Disposed);
        }
        tracing::info!(session = %session.name(), "Kernel backend selected");

        self.release();
        self.session = Some(session);
        self.state = ControllerState::Idle;
        Ok(())
    }

    /// Close the comm and release the session. Idempotent.
    pub fn dispose(&mut self) {
        if self.state == ControllerState::Disposed {
            return;
        }
        self.release();
        self.state = ControllerState::Disposed;
        tracing::info!("Panel disposed");
    }

    fn release(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if channel.is_open() {
                if let Err(e) = channel.close() {
                    tracing::warn!(error = %e, "Failed to close comm channel");
                }
            }
        }
        if let Some(watch) = self.session_watch.take() {
            watch.abort();
        }
        if let Some(session) = self.session.take() {
            session.shutdown();
        }
    }
}

impl Drop for SessionLifecycleController {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Log every state change of the observed session.
fn spawn_session_watch(session: &Session) -> JoinHandle<()> {
    let mut states = session.watch_state();
    let name = session.name().to_string();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            tracing::info!(session = %name, state = %state, "Kernel session state changed");
        }
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn fast_config() -> ChannelConfig {
        ChannelConfig {
            ready_timeout: Duration::from_millis(30),
            open_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_without_session_is_no_backend() {
        let mut controller = SessionLifecycleController::new(fast_config());
        assert_matches!(
            controller.start().await,
            Err(PanelError::Kernel(KernelError::NoBackend(_)))
        );
        assert_eq!(controller.state(), ControllerState::Error);
        assert!(controller.channel().is_none());
    }

    #[tokio::test]
    async fn start_on_never_ready_session_is_no_backend() {
        let session = Session::new("never");
        let mut controller = SessionLifecycleController::with_session(fast_config(), session);
        assert_matches!(
            controller.start().await,
            Err(PanelError::Kernel(KernelError::NoBackend(_)))
        );
        assert!(controller.channel().is_none());
    }

    #[tokio::test]
    async fn submit_before_start_is_no_backend() {
        let controller = SessionLifecycleController::new(fast_config());
        let result = controller.submit(&JobDescriptor::baseline());
        assert_matches!(result, Err(PanelError::Kernel(KernelError::NoBackend(_))));
    }

    #[tokio::test]
    async fn disposed_controller_rejects_operations() {
        let mut controller = SessionLifecycleController::new(fast_config());
        controller.dispose();
        controller.dispose();

        assert_eq!(controller.state(), ControllerState::Disposed);
        assert_matches!(controller.start().await, Err(PanelError::Disposed));
        assert_matches!(
            controller.select_backend(Session::new("late")),
            Err(PanelError::Disposed)
        );
        assert_matches!(
            controller.submit(&JobDescriptor::baseline()),
            Err(PanelError::Disposed)
        );
    }

    #[test]
    fn default_channel_config_matches_kernel_target() {
        let config = ChannelConfig::default();
        assert_eq!(config.target_name, "my_comm_target");
        assert_eq!(config.probe_code, "1+1");
    }
}
