//! Run-time event contracts
//!
//! [`EventListener`] is the 8-callback contract runners report through while
//! a run is in flight. [`RunEvent`] is the same contract as data, used to
//! carry callbacks across process boundaries and to record them. The richer
//! named vocabulary lives in [`dispatcher`].

pub mod dispatcher;

pub use dispatcher::{DispatchingListener, EventDispatcher, TestEvent, TestObserver};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::common::Error;
use crate::model::{TestName, TestResult};

/// Serializable description of an infrastructure failure or panic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: None,
        }
    }
}

impl From<&Error> for ErrorInfo {
    fn from(e: &Error) -> Self {
        Self::new(e.to_string())
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// How a run ended: a result or an error, never both
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(TestResult),
    Failed(ErrorInfo),
}

/// Stream a piece of captured output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    Log,
}

/// Output captured while a test ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutput {
    pub stream: OutputStream,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
}

/// Callbacks delivered while a run is in flight
///
/// Implementations must be cheap: callbacks are invoked on the thread that
/// executes the tests.
pub trait EventListener: Send + Sync {
    fn run_started(&self, name: &str, test_count: usize);
    fn run_finished(&self, outcome: &RunOutcome);
    fn suite_started(&self, name: &TestName);
    fn suite_finished(&self, result: &TestResult);
    fn test_started(&self, name: &TestName);
    fn test_finished(&self, result: &TestResult);
    fn unhandled_exception(&self, error: &ErrorInfo);
    fn test_output(&self, output: &TestOutput);
}

pub type SharedListener = Arc<dyn EventListener>;

/// Listener that ignores everything
pub struct NullListener;

impl EventListener for NullListener {
    fn run_started(&self, _: &str, _: usize) {}
    fn run_finished(&self, _: &RunOutcome) {}
    fn suite_started(&self, _: &TestName) {}
    fn suite_finished(&self, _: &TestResult) {}
    fn test_started(&self, _: &TestName) {}
    fn test_finished(&self, _: &TestResult) {}
    fn unhandled_exception(&self, _: &ErrorInfo) {}
    fn test_output(&self, _: &TestOutput) {}
}

/// One listener callback as data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted { name: String, test_count: usize },
    RunFinished { outcome: RunOutcome },
    SuiteStarted { name: TestName },
    SuiteFinished { result: TestResult },
    TestStarted { name: TestName },
    TestFinished { result: TestResult },
    UnhandledException { error: ErrorInfo },
    TestOutput { output: TestOutput },
}

impl RunEvent {
    /// Invoke the matching callback on `listener`
    pub fn deliver(&self, listener: &dyn EventListener) {
        match self {
            Self::RunStarted { name, test_count } => listener.run_started(name, *test_count),
            Self::RunFinished { outcome } => listener.run_finished(outcome),
            Self::SuiteStarted { name } => listener.suite_started(name),
            Self::SuiteFinished { result } => listener.suite_finished(result),
            Self::TestStarted { name } => listener.test_started(name),
            Self::TestFinished { result } => listener.test_finished(result),
            Self::UnhandledException { error } => listener.unhandled_exception(error),
            Self::TestOutput { output } => listener.test_output(output),
        }
    }
}

/// Listener that turns callbacks into [`RunEvent`]s on a channel
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: RunEvent) {
        // The receiving side going away only means nobody is listening anymore
        let _ = self.tx.send(event);
    }
}

impl EventListener for ChannelListener {
    fn run_started(&self, name: &str, test_count: usize) {
        self.send(RunEvent::RunStarted {
            name: name.to_string(),
            test_count,
        });
    }

    fn run_finished(&self, outcome: &RunOutcome) {
        self.send(RunEvent::RunFinished {
            outcome: outcome.clone(),
        });
    }

    fn suite_started(&self, name: &TestName) {
        self.send(RunEvent::SuiteStarted { name: name.clone() });
    }

    fn suite_finished(&self, result: &TestResult) {
        self.send(RunEvent::SuiteFinished {
            result: result.clone(),
        });
    }

    fn test_started(&self, name: &TestName) {
        self.send(RunEvent::TestStarted { name: name.clone() });
    }

    fn test_finished(&self, result: &TestResult) {
        self.send(RunEvent::TestFinished {
            result: result.clone(),
        });
    }

    fn unhandled_exception(&self, error: &ErrorInfo) {
        self.send(RunEvent::UnhandledException {
            error: error.clone(),
        });
    }

    fn test_output(&self, output: &TestOutput) {
        self.send(RunEvent::TestOutput {
            output: output.clone(),
        });
    }
}
