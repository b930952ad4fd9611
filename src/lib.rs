//! testrig - test execution orchestration
//!
//! Loads test packages into isolated runners, executes them with category
//! filters, streams run events to observers and aggregates results. Runners
//! compose: an aggregate fans out to one proxy per assembly, each hosted in
//! an in-process context or a leased agent process.

pub mod agency;
pub mod cli;
pub mod commands;
pub mod common;
pub mod controller;
pub mod events;
pub mod filter;
pub mod ipc;
pub mod model;
pub mod runner;
pub mod services;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use controller::TestController;
pub use model::{Test, TestPackage, TestResult};
pub use runner::TestRunner;
