//! Test outcome tree

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::test::{Test, TestName};

/// Where a suite failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSite {
    /// Setting up the suite failed before any child ran
    SetUp,
    /// The suite itself failed as a test case
    TestCase,
    /// One or more children failed
    Child,
}

/// Outcome of a single test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub name: TestName,
    pub executed: bool,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub assert_count: u32,
    pub time: Duration,
}

impl CaseResult {
    /// A case that was not executed (filtered out or cancelled)
    pub fn not_run(test: &Test, reason: Option<String>) -> Self {
        Self {
            name: test.name.clone(),
            executed: false,
            success: false,
            message: reason,
            stack_trace: None,
            assert_count: 0,
            time: Duration::ZERO,
        }
    }

    pub fn success(test: &Test, time: Duration) -> Self {
        Self {
            executed: true,
            success: true,
            time,
            ..Self::not_run(test, None)
        }
    }

    pub fn failure(test: &Test, message: impl Into<String>, stack_trace: Option<String>, time: Duration) -> Self {
        Self {
            executed: true,
            success: false,
            message: Some(message.into()),
            stack_trace,
            time,
            ..Self::not_run(test, None)
        }
    }
}

/// Outcome of a suite, aggregating its children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteResult {
    pub name: TestName,
    pub executed: bool,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_site: Option<FailureSite>,
    pub time: Duration,
    pub children: Vec<TestResult>,
}

impl SuiteResult {
    pub fn new(test: &Test) -> Self {
        Self::named(test.name.clone())
    }

    pub fn named(name: TestName) -> Self {
        Self {
            name,
            executed: false,
            success: true,
            message: None,
            failure_site: None,
            time: Duration::ZERO,
            children: Vec::new(),
        }
    }

    /// Append a child result, folding its outcome into this suite
    pub fn add_result(&mut self, result: TestResult) {
        if result.executed() {
            self.executed = true;
        }
        if result.is_failure() {
            self.success = false;
            self.failure_site.get_or_insert(FailureSite::Child);
        }
        self.children.push(result);
    }

    /// Mark the suite itself as failed
    pub fn fail(&mut self, site: FailureSite, message: impl Into<String>) {
        self.executed = true;
        self.success = false;
        self.failure_site = Some(site);
        self.message = Some(message.into());
    }
}

/// Result tree mirroring a [`Test`] tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestResult {
    Case(CaseResult),
    Suite(SuiteResult),
}

impl TestResult {
    /// Not-run result with the same shape as `test`
    pub fn not_run(test: &Test, reason: Option<&str>) -> Self {
        if test.is_suite {
            let mut suite = SuiteResult::new(test);
            for child in &test.children {
                suite.add_result(Self::not_run(child, reason));
            }
            suite.message = reason.map(str::to_string);
            Self::Suite(suite)
        } else {
            Self::Case(CaseResult::not_run(test, reason.map(str::to_string)))
        }
    }

    /// Result for a suite whose set up failed: same shape as `test`, nothing run
    pub fn set_up_failed(test: &Test, message: impl Into<String>) -> Self {
        match Self::not_run(test, None) {
            Self::Suite(mut suite) => {
                suite.fail(FailureSite::SetUp, message);
                Self::Suite(suite)
            }
            Self::Case(_) => Self::Case(CaseResult::failure(test, message, None, Duration::ZERO)),
        }
    }

    pub fn name(&self) -> &TestName {
        match self {
            Self::Case(c) => &c.name,
            Self::Suite(s) => &s.name,
        }
    }

    pub fn is_suite(&self) -> bool {
        matches!(self, Self::Suite(_))
    }

    pub fn executed(&self) -> bool {
        match self {
            Self::Case(c) => c.executed,
            Self::Suite(s) => s.executed,
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            Self::Case(c) => c.executed && c.success,
            Self::Suite(s) => s.executed && s.success,
        }
    }

    pub fn is_failure(&self) -> bool {
        match self {
            Self::Case(c) => c.executed && !c.success,
            Self::Suite(s) => s.executed && !s.success,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Case(c) => c.message.as_deref(),
            Self::Suite(s) => s.message.as_deref(),
        }
    }

    pub fn time(&self) -> Duration {
        match self {
            Self::Case(c) => c.time,
            Self::Suite(s) => s.time,
        }
    }

    pub fn children(&self) -> &[TestResult] {
        match self {
            Self::Case(_) => &[],
            Self::Suite(s) => &s.children,
        }
    }

    /// Number of failed cases, plus suites that failed outside their children
    pub fn failure_count(&self) -> usize {
        match self {
            Self::Case(c) => usize::from(c.executed && !c.success),
            Self::Suite(s) => {
                let own = matches!(s.failure_site, Some(site) if site != FailureSite::Child);
                usize::from(own) + s.children.iter().map(TestResult::failure_count).sum::<usize>()
            }
        }
    }

    /// Count leaves by outcome
    pub fn summary(&self) -> ResultSummary {
        let mut summary = ResultSummary::default();
        self.accumulate(&mut summary);
        summary.time = self.time();
        summary
    }

    fn accumulate(&self, summary: &mut ResultSummary) {
        match self {
            Self::Case(c) => {
                summary.total += 1;
                match (c.executed, c.success) {
                    (false, _) => summary.not_run += 1,
                    (true, true) => summary.passed += 1,
                    (true, false) => summary.failed += 1,
                }
            }
            Self::Suite(s) => s.children.iter().for_each(|c| c.accumulate(summary)),
        }
    }

    /// Whether this result tree has the same shape as `test`
    pub fn mirrors(&self, test: &Test) -> bool {
        self.is_suite() == test.is_suite
            && self.name().full_name == test.name.full_name
            && self.children().len() == test.children.len()
            && self
                .children()
                .iter()
                .zip(&test.children)
                .all(|(r, t)| r.mirrors(t))
    }
}

/// Leaf-level counts for reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub not_run: usize,
    pub time: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunnerId, TestId};

    fn tree() -> Test {
        let id = |key| TestId {
            runner: RunnerId(1),
            key,
        };
        let mut suite = Test::suite(id(0), TestName::new("s", "s"));
        suite.children.push(Test::case(id(1), TestName::new("a", "s::a")));
        suite.children.push(Test::case(id(2), TestName::new("b", "s::b")));
        suite
    }

    #[test]
    fn test_failed_child_fails_suite() {
        let test = tree();
        let mut suite = SuiteResult::new(&test);
        suite.add_result(TestResult::Case(CaseResult::success(&test.children[0], Duration::ZERO)));
        suite.add_result(TestResult::Case(CaseResult::failure(
            &test.children[1],
            "assertion failed",
            None,
            Duration::ZERO,
        )));
        let result = TestResult::Suite(suite);

        assert!(result.is_failure());
        assert_eq!(result.failure_count(), 1);
        assert!(result.mirrors(&test));
        if let TestResult::Suite(s) = &result {
            assert_eq!(s.failure_site, Some(FailureSite::Child));
        }
    }

    #[test]
    fn test_not_run_is_neither_success_nor_failure() {
        let test = tree();
        let result = TestResult::not_run(&test, Some("cancelled"));
        assert!(!result.executed());
        assert!(!result.is_success());
        assert!(!result.is_failure());
        assert_eq!(result.summary().not_run, 2);
        assert!(result.mirrors(&test));
    }

    #[test]
    fn test_set_up_failure_keeps_shape_and_counts_once() {
        let test = tree();
        let result = TestResult::set_up_failed(&test, "agent died");

        assert!(result.mirrors(&test));
        assert!(result.is_failure());
        assert_eq!(result.failure_count(), 1);
        assert_eq!(result.message(), Some("agent died"));
        assert_eq!(result.summary().not_run, 2);
    }
}
