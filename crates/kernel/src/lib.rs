//! Kernel session and comm channel client.
//!
//! Provides the wire frame types, a WebSocket (or in-memory) transport,
//! the [`Session`](session::Session) connection handle with its readiness
//! gate, and the duplex [`Channel`](channel::Channel) opened over it.
//! [`echo`] contains a loopback kernel used for local runs and tests.

pub mod channel;
pub mod echo;
pub mod error;
pub mod messages;
pub mod session;
pub mod transport;

pub use channel::{Channel, ChannelState};
pub use error::KernelError;
pub use session::{Session, SessionState};
