//! Framework for tests registered as Rust closures
//!
//! Lets an embedding application hand the orchestrator test bodies directly,
//! without building a separate test executable. Assemblies are addressed by
//! name; the path given in the package only has to end with that name.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};

use crate::common::{Error, Result};
use crate::events::{OutputStream, TestOutput};
use crate::model::Test;

use super::framework::{AssemblyContext, CaseContext, CaseOutcome, LoadedAssembly, TestCaseInfo, TestFramework};

type TestBody = Arc<dyn Fn(&mut CaseLog<'_>) -> std::result::Result<(), String> + Send + Sync>;

/// Output sink handed to a test body
pub struct CaseLog<'a> {
    test_name: &'a str,
    sink: &'a mut dyn FnMut(TestOutput),
}

impl CaseLog<'_> {
    pub fn write(&mut self, text: impl Into<String>) {
        (self.sink)(TestOutput {
            stream: OutputStream::Stdout,
            text: text.into(),
            test_name: Some(self.test_name.to_string()),
        });
    }
}

/// One registered test
#[derive(Clone)]
pub struct InProcessTest {
    info: TestCaseInfo,
    body: TestBody,
}

impl InProcessTest {
    pub fn new<F>(full_name: &str, body: F) -> Self
    where
        F: Fn(&mut CaseLog<'_>) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Self {
            info: TestCaseInfo::new(full_name),
            body: Arc::new(body),
        }
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.info = self.info.with_category(category);
        self
    }
}

/// Registry of closure-based assemblies
#[derive(Clone, Default)]
pub struct InProcessFramework {
    assemblies: Arc<RwLock<HashMap<String, Vec<InProcessTest>>>>,
}

impl InProcessFramework {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an assembly
    pub fn add_assembly(&self, name: &str, tests: Vec<InProcessTest>) {
        if let Ok(mut assemblies) = self.assemblies.write() {
            assemblies.insert(name.to_string(), tests);
        }
    }

    fn lookup(&self, assembly: &Path) -> Option<Vec<InProcessTest>> {
        let name = assembly.file_name()?.to_str()?;
        self.assemblies.read().ok()?.get(name).cloned()
    }
}

impl TestFramework for InProcessFramework {
    fn name(&self) -> &str {
        "in-process"
    }

    fn can_load(&self, assembly: &Path) -> bool {
        self.lookup(assembly).is_some()
    }

    fn load(&self, assembly: &Path, _context: &AssemblyContext) -> Result<Box<dyn LoadedAssembly>> {
        let tests = self
            .lookup(assembly)
            .ok_or_else(|| Error::AssemblyNotFound(assembly.display().to_string()))?;
        let cases = tests.iter().map(|t| t.info.clone()).collect();
        Ok(Box::new(LoadedInProcess { tests, cases }))
    }
}

struct LoadedInProcess {
    tests: Vec<InProcessTest>,
    cases: Vec<TestCaseInfo>,
}

impl LoadedAssembly for LoadedInProcess {
    fn cases(&self) -> &[TestCaseInfo] {
        &self.cases
    }

    fn execute(
        &mut self,
        case: &Test,
        context: &CaseContext<'_>,
        output: &mut dyn FnMut(TestOutput),
    ) -> CaseOutcome {
        if context.cancel.load(Ordering::SeqCst) {
            return CaseOutcome::NotRun {
                reason: "Run cancelled".to_string(),
            };
        }

        let Some(test) = self.tests.iter().find(|t| t.info.full_name == case.name.full_name) else {
            return CaseOutcome::NotRun {
                reason: format!("Test '{}' is no longer registered", case.name.full_name),
            };
        };

        let mut log = CaseLog {
            test_name: &case.name.full_name,
            sink: output,
        };
        match (test.body)(&mut log) {
            Ok(()) => CaseOutcome::Passed { assert_count: 0 },
            Err(message) => CaseOutcome::Failed {
                message,
                stack_trace: None,
            },
        }
    }
}
