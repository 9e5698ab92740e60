use q8s_core::error::CoreError;
use q8s_kernel::KernelError;

/// Errors surfaced to the owner of a panel.
///
/// None of these are process-fatal; a failed connection leaves the panel
/// degraded until the user triggers a new one.
#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    /// Form input was rejected before any backend call.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Session or channel failure.
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// The panel was disposed and accepts no further operations.
    #[error("Panel has been disposed")]
    Disposed,

    /// An environment variable held an invalid value.
    #[error("Configuration error: {0}")]
    Config(String),
}
