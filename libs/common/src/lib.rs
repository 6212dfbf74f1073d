//! Shared service plumbing
//!
//! Provides the pieces every EVSE gateway binary needs:
//! - logging setup (`tracing-subscriber` + `tracing-appender`)
//! - layered configuration loading (`figment`)
//! - shutdown signal handling
//! - hex formatting for wire dumps

pub mod config;
pub mod error;
pub mod hex;
pub mod logging;
pub mod shutdown;

pub use error::{Error, Result};
