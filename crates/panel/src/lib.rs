//! `q8s-panel` library crate.
//!
//! Ties the pure job logic in `q8s-core` to the kernel channel in
//! `q8s-kernel`: the [`SessionLifecycleController`] owns the session and
//! its comm, and [`preview`] / [`submit_preview`] implement the
//! configure, preview, confirm flow. The binary entrypoint lives in
//! `main.rs`.

pub mod config;
pub mod controller;
pub mod error;
pub mod panel;

pub use controller::{ChannelConfig, ControllerState, SessionLifecycleController};
pub use error::PanelError;
pub use panel::{preview, submit_preview, JobPreview};
