//! Kernel session: the connection handle a panel owns.
//!
//! A [`Session`] wraps one [`KernelTransport`]. Once attached it runs two
//! background tasks: a writer draining the outbound frame queue into the
//! transport sink, and a reader routing inbound frames to the channel that
//! registered their `comm_id`. Both stop when the session is shut down,
//! dropped, or the transport ends.
//!
//! State is published on a [`tokio::sync::watch`] channel: [`Session::ready`]
//! is the readiness gate and [`Session::watch_state`] the change stream.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::KernelError;
use crate::messages::KernelFrame;
use crate::transport::{connect_websocket, FrameSink, FrameStream, KernelTransport};

/// Lifecycle of a kernel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Ready,
    Disconnected,
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Errored => "errored",
        }
    }

    /// Disconnected and errored sessions never become ready again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Errored)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Route = mpsc::UnboundedSender<KernelFrame>;

/// State shared between a session, its background tasks and its channels.
pub(crate) struct SessionShared {
    name: String,
    state: watch::Sender<SessionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<KernelFrame>>>,
    routes: Mutex<HashMap<String, Route>>,
    cancel: CancellationToken,
}

/// Connection handle to a kernel.
///
/// Owned by exactly one panel; dropping it stops the background tasks and
/// closes every channel opened over it.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Create an unconnected session.
    pub fn new(name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(SessionState::Unconnected);
        Self {
            shared: Arc::new(SessionShared {
                name: name.into(),
                state,
                outbound: Mutex::new(None),
                routes: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Create a session already attached to `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_transport(name: impl Into<String>, transport: KernelTransport) -> Self {
        let session = Self::new(name);
        session.attach(transport);
        session
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Subscribe to session state changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Connect to the kernel WebSocket at `ws_url` and attach to it.
    ///
    /// On failure the session moves to [`SessionState::Errored`].
    pub async fn connect(&self, ws_url: &str) -> Result<(), KernelError> {
        if self.state() != SessionState::Unconnected {
            return Err(KernelError::Transport(format!(
                "Session '{}' is {} and cannot connect",
                self.name(),
                self.state()
            )));
        }
        self.shared.transition(SessionState::Connecting);

        match connect_websocket(ws_url).await {
            Ok(transport) => {
                self.attach(transport);
                Ok(())
            }
            Err(e) => {
                tracing::error!(session = %self.name(), error = %e, "Kernel connection failed");
                self.shared.transition(SessionState::Errored);
                Err(e)
            }
        }
    }

    /// Start the reader and writer tasks over `transport` and mark the
    /// session ready.
    pub fn attach(&self, transport: KernelTransport) {
        if self.state().is_terminal() {
            tracing::warn!(session = %self.name(), "Ignoring transport for a finished session");
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.outbound) = Some(tx);

        tokio::spawn(run_writer(Arc::clone(&self.shared), transport.sink, rx));
        tokio::spawn(run_reader(Arc::clone(&self.shared), transport.stream));

        self.shared.transition(SessionState::Ready);
        tracing::info!(session = %self.name(), "Kernel session ready");
    }

    /// Readiness gate: resolves once the session is [`SessionState::Ready`].
    ///
    /// Fails with [`KernelError::NoBackend`] if the session disconnects or
    /// errors first. Never resolves while the session stays unconnected;
    /// callers bound the wait with a timeout.
    pub async fn ready(&self) -> Result<(), KernelError> {
        let mut rx = self.watch_state();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                SessionState::Ready => return Ok(()),
                s if s.is_terminal() => {
                    return Err(KernelError::NoBackend(format!(
                        "Session '{}' is {s}",
                        self.name()
                    )))
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(KernelError::NoBackend(format!(
                    "Session '{}' was dropped",
                    self.name()
                )));
            }
        }
    }

    /// Stop the background tasks and close every channel on this session.
    pub fn shutdown(&self) {
        self.shared.shutdown(SessionState::Disconnected);
    }

    pub(crate) fn shared(&self) -> Arc<SessionShared> {
        Arc::clone(&self.shared)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.shutdown(SessionState::Disconnected);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionShared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `next` unless the session already finished.
    fn transition(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            tracing::debug!(session = %self.name, from = %current, to = %next, "Session state change");
            *current = next;
            true
        });
    }

    fn shutdown(&self, final_state: SessionState) {
        self.transition(final_state);
        self.cancel.cancel();
        lock(&self.outbound).take();
        // Dropping the routes ends every channel's inbound queue.
        let routes = std::mem::take(&mut *lock(&self.routes));
        drop(routes);
    }

    /// Register an inbound queue for `comm_id`.
    pub(crate) fn register(
        &self,
        comm_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<KernelFrame>, KernelError> {
        if self.state() != SessionState::Ready {
            return Err(KernelError::NoBackend(format!(
                "Session '{}' is {}",
                self.name,
                self.state()
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.routes).insert(comm_id.to_string(), tx);
        Ok(rx)
    }

    pub(crate) fn unregister(&self, comm_id: &str) {
        let route = lock(&self.routes).remove(comm_id);
        drop(route);
    }

    /// Queue a frame for the writer task.
    pub(crate) fn send_frame(&self, frame: KernelFrame) -> Result<(), KernelError> {
        let outbound = lock(&self.outbound);
        let tx = outbound
            .as_ref()
            .ok_or_else(|| KernelError::Transport(format!("Session '{}' is not connected", self.name)))?;
        tx.send(frame)
            .map_err(|_| KernelError::Transport(format!("Session '{}' writer stopped", self.name)))
    }

    fn route(&self, frame: KernelFrame) {
        let comm_id = frame.comm_id().to_string();
        let is_close = matches!(frame, KernelFrame::CommClose { .. });

        let delivered = {
            let routes = lock(&self.routes);
            match routes.get(&comm_id) {
                Some(route) => route.send(frame).is_ok(),
                None => false,
            }
        };

        if !delivered {
            tracing::debug!(
                session = %self.name,
                comm_id = %comm_id,
                "Dropping frame for unknown comm",
            );
        }
        if is_close {
            self.unregister(&comm_id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drain queued frames into the transport sink.
async fn run_writer(
    shared: Arc<SessionShared>,
    mut sink: FrameSink,
    mut rx: mpsc::UnboundedReceiver<KernelFrame>,
) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                tracing::trace!(
                    session = %shared.name,
                    msg_type = frame.msg_type(),
                    msg_id = %frame.header().msg_id,
                    "Sending kernel frame",
                );
                if let Err(e) = sink.send(frame).await {
                    tracing::error!(session = %shared.name, error = %e, "Failed to send kernel frame");
                    shared.shutdown(SessionState::Errored);
                    break;
                }
            }
        }
    }

    // Flush anything still queued before a local shutdown so close frames
    // reach the kernel.
    while let Ok(frame) = rx.try_recv() {
        if sink.send(frame).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Route inbound frames until the transport ends.
async fn run_reader(shared: Arc<SessionShared>, mut stream: FrameStream) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(frame)) => shared.route(frame),
                Some(Err(e)) => {
                    tracing::error!(session = %shared.name, error = %e, "Kernel receive error");
                    shared.shutdown(SessionState::Errored);
                    break;
                }
                None => {
                    tracing::info!(session = %shared.name, "Kernel connection closed");
                    shared.shutdown(SessionState::Disconnected);
                    break;
                }
            }
        }
    }
}
