//! Common utilities shared between the orchestrator and agent processes

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, Result};
