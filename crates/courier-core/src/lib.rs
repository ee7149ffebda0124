//! Core runtime for courier: per-account session lifecycle, event dispatch and
//! the auto-reply / media-forward handlers.
//!
//! This crate is intentionally platform-agnostic. The messaging platform and the
//! completion endpoint live behind ports (traits) implemented in adapter crates.

pub mod completion;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod forward_store;
pub mod handlers;
pub mod logging;
pub mod orchestrator;
pub mod platform;
pub mod session;

#[cfg(test)]
mod testing;

pub use errors::{Error, ErrorKind, Result};
