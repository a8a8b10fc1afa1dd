//! Pipewright Core
//!
//! Domain types, port traits, error handling and the condition expression
//! engine. This crate defines the shared vocabulary used by the scheduler,
//! the step runner, the artifact broker and the CLI.

pub mod artifact;
pub mod bus;
pub mod cancel;
pub mod error;
pub mod events;
pub mod expression;
pub mod ids;
pub mod interpolation;
pub mod pattern;
pub mod pipeline;
pub mod ports;
pub mod run;

pub use error::{Error, Result};
pub use ids::*;
