/// Errors raised by the kernel session and comm channel layer.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// No reachable or selected execution backend.
    #[error("No execution backend: {0}")]
    NoBackend(String),

    /// Opening the channel (or its first send) failed.
    #[error("Channel setup failed: {0}")]
    ChannelSetup(String),

    /// The operation needs an open channel but it has been closed.
    #[error("Channel is closed")]
    ChannelClosed,

    /// The channel is still waiting for the kernel to acknowledge the open.
    #[error("Channel is not open yet")]
    ChannelNotOpen,

    /// The underlying connection failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for KernelError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
