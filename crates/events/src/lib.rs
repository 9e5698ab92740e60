//! Result fan-out for the q8s panel.
//!
//! - [`ResultBroadcaster`] delivers every [`ResultEvent`] received from the
//!   kernel synchronously to the observers subscribed at that moment.
//! - [`Subscription`] is the handle returned by `subscribe`; dropping it (or
//!   calling [`Subscription::unsubscribe`]) removes the observer.

pub mod bus;

pub use bus::{Broadcaster, ResultBroadcaster, ResultEvent, Subscription};
