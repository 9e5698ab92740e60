//! Duplex comm channel over a kernel session.
//!
//! A [`Channel`] moves `Closed -> Opening -> Open -> Closed`. Opening sends
//! `comm_open` and waits for the kernel's `comm_open_reply`. While open, a
//! dispatch task delivers each inbound `comm_msg` to the message callback in
//! arrival order. When the kernel closes the comm (or the session goes
//! away) the channel becomes `Closed` and the close callback fires once.
//!
//! There is no request/response correlation: callers keep at most one
//! request outstanding and treat the next inbound message as its answer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::KernelError;
use crate::messages::{CommMsgContent, KernelFrame, ReplyStatus};
use crate::session::{Session, SessionShared, SessionState};

/// Default time to wait for the kernel to acknowledge `comm_open`.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type MessageCallback = Arc<dyn Fn(CommMsgContent) + Send + Sync>;
type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// A comm bound to one session.
pub struct Channel {
    session: Arc<SessionShared>,
    comm_id: String,
    target_name: Option<String>,
    state: Arc<watch::Sender<ChannelState>>,
    /// Bumped on every open and local close so a dispatch task left over
    /// from an earlier open cannot close the current one.
    generation: Arc<AtomicU64>,
    open_timeout: Duration,
    on_message: Option<MessageCallback>,
    on_close: Option<CloseCallback>,
    dispatch: Option<JoinHandle<()>>,
}

impl Channel {
    /// Create a closed channel on `session`.
    pub fn new(session: &Session) -> Self {
        let (state, _) = watch::channel(ChannelState::Closed);
        Self {
            session: session.shared(),
            comm_id: uuid::Uuid::new_v4().to_string(),
            target_name: None,
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            on_message: None,
            on_close: None,
            dispatch: None,
        }
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Callback invoked once per inbound message while open.
    pub fn on_message<F>(&mut self, callback: F)
    where
        F: Fn(CommMsgContent) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(callback));
    }

    /// Callback invoked once each time the kernel closes an open channel.
    /// A local [`close`](Self::close) does not trigger it.
    pub fn on_close<F>(&mut self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(callback));
    }

    pub fn comm_id(&self) -> &str {
        &self.comm_id
    }

    pub fn target_name(&self) -> Option<&str> {
        self.target_name.as_deref()
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Open the comm for `target_name` and wait for the kernel to accept it.
    ///
    /// Fails with [`KernelError::NoBackend`] if the session is not ready and
    /// with [`KernelError::ChannelSetup`] if the kernel rejects the open,
    /// closes the comm instead of replying, or does not answer in time.
    pub async fn open(&mut self, target_name: &str) -> Result<(), KernelError> {
        if self.state() != ChannelState::Closed {
            return Err(KernelError::ChannelSetup(format!(
                "Channel {} is already {}",
                self.comm_id,
                self.state()
            )));
        }
        if self.session.state() != SessionState::Ready {
            return Err(KernelError::NoBackend(format!(
                "Session '{}' is {}",
                self.session.name(),
                self.session.state()
            )));
        }

        // A reopened channel gets a fresh comm id.
        if self.target_name.is_some() {
            self.comm_id = uuid::Uuid::new_v4().to_string();
        }
        self.target_name = Some(target_name.to_string());
        if let Some(stale) = self.dispatch.take() {
            stale.abort();
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut inbound = self.session.register(&self.comm_id)?;
        self.state.send_replace(ChannelState::Opening);
        tracing::debug!(comm_id = %self.comm_id, target = %target_name, "Opening comm channel");

        let opened = match self
            .session
            .send_frame(KernelFrame::comm_open(&self.comm_id, target_name))
        {
            Ok(()) => {
                match tokio::time::timeout(self.open_timeout, await_open_reply(&mut inbound)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(KernelError::ChannelSetup(format!(
                        "Kernel did not acknowledge comm '{target_name}' within {:?}",
                        self.open_timeout
                    ))),
                }
            }
            Err(e) => Err(KernelError::ChannelSetup(format!("Failed to send comm_open: {e}"))),
        };

        let early = match opened {
            Ok(early) => early,
            Err(e) => {
                self.session.unregister(&self.comm_id);
                self.state.send_replace(ChannelState::Closed);
                tracing::warn!(comm_id = %self.comm_id, error = %e, "Comm channel setup failed");
                return Err(e);
            }
        };

        self.state.send_replace(ChannelState::Open);
        tracing::info!(comm_id = %self.comm_id, target = %target_name, "Comm channel open");

        self.dispatch = Some(tokio::spawn(run_dispatch(
            Arc::clone(&self.session),
            self.comm_id.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.generation),
            generation,
            inbound,
            early,
            self.on_message.clone(),
            self.on_close.clone(),
        )));

        Ok(())
    }

    /// Send a raw `data` payload. Fire-and-forget: no acknowledgment.
    pub fn send(&self, data: serde_json::Value) -> Result<(), KernelError> {
        match self.state() {
            ChannelState::Open => {}
            ChannelState::Opening => return Err(KernelError::ChannelNotOpen),
            ChannelState::Closed => return Err(KernelError::ChannelClosed),
        }
        self.session
            .send_frame(KernelFrame::comm_msg(&self.comm_id, data))
    }

    /// Ask the kernel to evaluate `code` (`{"code": ...}` payload).
    pub fn send_code(&self, code: &str) -> Result<(), KernelError> {
        tracing::debug!(comm_id = %self.comm_id, code = %code, "Sending code to kernel");
        self.send(serde_json::json!({ "code": code }))
    }

    /// Close the channel from this side and tell the kernel.
    pub fn close(&mut self) -> Result<(), KernelError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.abort();
        }
        let previous = self.state.send_replace(ChannelState::Closed);
        if previous == ChannelState::Closed {
            return Err(KernelError::ChannelClosed);
        }

        let sent = self
            .session
            .send_frame(KernelFrame::comm_close(&self.comm_id));
        self.session.unregister(&self.comm_id);
        tracing::info!(comm_id = %self.comm_id, "Comm channel closed locally");
        sent
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.state() != ChannelState::Closed {
            let _ = self.close();
        }
        // Nobody is left to observe a close callback.
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.abort();
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("comm_id", &self.comm_id)
            .field("target_name", &self.target_name)
            .field("state", &self.state())
            .finish()
    }
}

/// Wait for the kernel's answer to `comm_open`.
///
/// Messages that arrive before the reply are kept and delivered once the
/// channel is open.
async fn await_open_reply(
    inbound: &mut mpsc::UnboundedReceiver<KernelFrame>,
) -> Result<Vec<CommMsgContent>, KernelError> {
    let mut early = Vec::new();
    while let Some(frame) = inbound.recv().await {
        match frame {
            KernelFrame::CommOpenReply { content, .. } => match content.status {
                ReplyStatus::Ok => return Ok(early),
                ReplyStatus::Error => {
                    return Err(KernelError::ChannelSetup(format!(
                        "Kernel rejected comm: {}",
                        content.reason.as_deref().unwrap_or("no reason given")
                    )))
                }
            },
            KernelFrame::CommClose { .. } => {
                return Err(KernelError::ChannelSetup(
                    "Kernel closed the comm during open".to_string(),
                ))
            }
            KernelFrame::CommMsg { content, .. } => early.push(content),
            KernelFrame::CommOpen { .. } => {
                tracing::debug!("Ignoring kernel-initiated comm_open on an opening channel");
            }
        }
    }
    Err(KernelError::ChannelSetup(
        "Session closed while opening comm".to_string(),
    ))
}

/// Deliver inbound frames to the callbacks until the comm closes.
async fn run_dispatch(
    session: Arc<SessionShared>,
    comm_id: String,
    state: Arc<watch::Sender<ChannelState>>,
    current_generation: Arc<AtomicU64>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<KernelFrame>,
    early: Vec<CommMsgContent>,
    on_message: Option<MessageCallback>,
    on_close: Option<CloseCallback>,
) {
    let deliver = |content: CommMsgContent| match &on_message {
        Some(callback) => callback(content),
        None => tracing::debug!(comm_id = %content.comm_id, "No message callback, dropping"),
    };

    for content in early {
        deliver(content);
    }

    while let Some(frame) = inbound.recv().await {
        match frame {
            KernelFrame::CommMsg { content, .. } => {
                if *state.borrow() != ChannelState::Open {
                    break;
                }
                deliver(content);
            }
            KernelFrame::CommClose { .. } => {
                tracing::info!(comm_id = %comm_id, "Kernel closed comm channel");
                break;
            }
            other => {
                tracing::debug!(comm_id = %comm_id, msg_type = other.msg_type(), "Ignoring frame");
            }
        }
    }

    // Reached on a kernel close, a session shutdown, or a local close that
    // dropped our route. Only the first two count as a remote close, and
    // only while this task still belongs to the current open.
    let mut remote_close = false;
    state.send_if_modified(|s| {
        if *s == ChannelState::Open && current_generation.load(Ordering::SeqCst) == generation {
            *s = ChannelState::Closed;
            remote_close = true;
        }
        remote_close
    });
    if remote_close {
        session.unregister(&comm_id);
        if let Some(callback) = on_close {
            callback();
        }
    }
}
