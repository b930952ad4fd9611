//! Result persistence after each completed run

use std::path::PathBuf;

use serde::Serialize;

use crate::common::Result;
use crate::model::{ResultSummary, TestPackage, TestResult};

/// Receives the merged result tree of every completed run
pub trait ResultWriter: Send + Sync {
    /// Persist `result`, returning where it went
    fn write(&self, package: &TestPackage, result: &TestResult) -> Result<PathBuf>;
}

/// Writes the result as JSON into the package's base directory
pub struct JsonResultWriter {
    file_name: String,
}

#[derive(Serialize)]
struct ResultDocument<'a> {
    package: String,
    assemblies: &'a [PathBuf],
    summary: ResultSummary,
    result: &'a TestResult,
}

impl JsonResultWriter {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }
}

impl ResultWriter for JsonResultWriter {
    fn write(&self, package: &TestPackage, result: &TestResult) -> Result<PathBuf> {
        let path = package.base_directory.join(&self.file_name);
        let document = ResultDocument {
            package: package.name(),
            assemblies: &package.assemblies,
            summary: result.summary(),
            result,
        };

        std::fs::write(&path, serde_json::to_vec_pretty(&document)?)?;
        tracing::info!(path = %path.display(), "Saved test result");
        Ok(path)
    }
}
