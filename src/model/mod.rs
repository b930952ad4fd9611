//! Core data model shared by every runner
//!
//! A [`TestPackage`] describes what to load. Loading produces a [`Test`]
//! tree, and running it produces a [`TestResult`] tree of identical shape.

mod package;
mod result;
mod test;

pub use package::{settings, AssemblyInfo, SettingValue, TestPackage};
pub use result::{CaseResult, FailureSite, ResultSummary, SuiteResult, TestResult};
pub use test::{RunnerId, Test, TestId, TestName};
