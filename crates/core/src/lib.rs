//! Pure domain logic for the q8s control panel.
//!
//! Everything in this crate is free of I/O: the job descriptor model and
//! builder, the line diff used for previews, and the declarative job form
//! schema. The kernel channel and session plumbing lives in `q8s-kernel`.

pub mod diff;
pub mod error;
pub mod form;
pub mod job_spec;
pub mod types;
