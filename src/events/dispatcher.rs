//! Named test events and their observer list
//!
//! Every action has a fixed payload shape, enforced by its [`TestEvent`]
//! variant. The controller fires load/unload/reload events itself and
//! republishes run callbacks through [`DispatchingListener`].

use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::model::{Test, TestName, TestResult};

use super::{ErrorInfo, EventListener, RunOutcome, TestOutput};

/// One observable action with its payload
#[derive(Debug, Clone, PartialEq)]
pub enum TestEvent {
    ProjectLoading { name: String },
    ProjectLoaded { name: String },
    ProjectLoadFailed { name: String, error: ErrorInfo },
    ProjectUnloading { name: String },
    ProjectUnloaded { name: String },
    ProjectUnloadFailed { name: String, error: ErrorInfo },
    TestLoading { name: String },
    TestLoaded { name: String, test: Test },
    TestLoadFailed { name: String, error: ErrorInfo },
    TestReloading { name: String },
    TestReloaded { name: String, test: Test },
    TestReloadFailed { name: String, error: ErrorInfo },
    TestUnloading { name: String },
    TestUnloaded { name: String },
    TestUnloadFailed { name: String, error: ErrorInfo },
    RunStarting { name: String, test_count: usize },
    RunFinished { outcome: RunOutcome },
    SuiteStarting { name: TestName },
    SuiteFinished { result: TestResult },
    TestStarting { name: TestName },
    TestFinished { result: TestResult },
    UnhandledException { error: ErrorInfo },
    TestOutput { output: TestOutput },
}

impl TestEvent {
    /// Stable action name, used in logs
    pub fn action(&self) -> &'static str {
        match self {
            Self::ProjectLoading { .. } => "ProjectLoading",
            Self::ProjectLoaded { .. } => "ProjectLoaded",
            Self::ProjectLoadFailed { .. } => "ProjectLoadFailed",
            Self::ProjectUnloading { .. } => "ProjectUnloading",
            Self::ProjectUnloaded { .. } => "ProjectUnloaded",
            Self::ProjectUnloadFailed { .. } => "ProjectUnloadFailed",
            Self::TestLoading { .. } => "TestLoading",
            Self::TestLoaded { .. } => "TestLoaded",
            Self::TestLoadFailed { .. } => "TestLoadFailed",
            Self::TestReloading { .. } => "TestReloading",
            Self::TestReloaded { .. } => "TestReloaded",
            Self::TestReloadFailed { .. } => "TestReloadFailed",
            Self::TestUnloading { .. } => "TestUnloading",
            Self::TestUnloaded { .. } => "TestUnloaded",
            Self::TestUnloadFailed { .. } => "TestUnloadFailed",
            Self::RunStarting { .. } => "RunStarting",
            Self::RunFinished { .. } => "RunFinished",
            Self::SuiteStarting { .. } => "SuiteStarting",
            Self::SuiteFinished { .. } => "SuiteFinished",
            Self::TestStarting { .. } => "TestStarting",
            Self::TestFinished { .. } => "TestFinished",
            Self::UnhandledException { .. } => "UnhandledException",
            Self::TestOutput { .. } => "TestOutput",
        }
    }

    /// Whether this event reports a failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ProjectLoadFailed { .. }
                | Self::ProjectUnloadFailed { .. }
                | Self::TestLoadFailed { .. }
                | Self::TestReloadFailed { .. }
                | Self::TestUnloadFailed { .. }
                | Self::RunFinished {
                    outcome: RunOutcome::Failed(_)
                }
        )
    }
}

impl fmt::Display for TestEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action())
    }
}

/// Receives every fired event
pub trait TestObserver: Send + Sync {
    fn on_event(&self, event: &TestEvent);
}

impl<F> TestObserver for F
where
    F: Fn(&TestEvent) + Send + Sync,
{
    fn on_event(&self, event: &TestEvent) {
        self(event)
    }
}

struct ChannelObserver {
    tx: mpsc::UnboundedSender<TestEvent>,
}

impl TestObserver for ChannelObserver {
    fn on_event(&self, event: &TestEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Observer list with one `fire_*` method per action
#[derive(Default)]
pub struct EventDispatcher {
    observers: RwLock<Vec<Arc<dyn TestObserver>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn TestObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(observer);
        }
    }

    /// Subscribe through a channel instead of a callback
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<TestEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(ChannelObserver { tx }));
        rx
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().map(|o| o.len()).unwrap_or(0)
    }

    /// Deliver an event to every observer, in subscription order
    pub fn fire(&self, event: TestEvent) {
        tracing::trace!(action = event.action(), "Dispatching test event");
        let observers = match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(_) => return,
        };
        for observer in observers {
            observer.on_event(&event);
        }
    }

    pub fn fire_project_loading(&self, name: &str) {
        self.fire(TestEvent::ProjectLoading { name: name.to_string() });
    }

    pub fn fire_project_loaded(&self, name: &str) {
        self.fire(TestEvent::ProjectLoaded { name: name.to_string() });
    }

    pub fn fire_project_load_failed(&self, name: &str, error: ErrorInfo) {
        self.fire(TestEvent::ProjectLoadFailed {
            name: name.to_string(),
            error,
        });
    }

    pub fn fire_project_unloading(&self, name: &str) {
        self.fire(TestEvent::ProjectUnloading { name: name.to_string() });
    }

    pub fn fire_project_unloaded(&self, name: &str) {
        self.fire(TestEvent::ProjectUnloaded { name: name.to_string() });
    }

    pub fn fire_project_unload_failed(&self, name: &str, error: ErrorInfo) {
        self.fire(TestEvent::ProjectUnloadFailed {
            name: name.to_string(),
            error,
        });
    }

    pub fn fire_test_loading(&self, name: &str) {
        self.fire(TestEvent::TestLoading { name: name.to_string() });
    }

    pub fn fire_test_loaded(&self, name: &str, test: Test) {
        self.fire(TestEvent::TestLoaded {
            name: name.to_string(),
            test,
        });
    }

    pub fn fire_test_load_failed(&self, name: &str, error: ErrorInfo) {
        self.fire(TestEvent::TestLoadFailed {
            name: name.to_string(),
            error,
        });
    }

    pub fn fire_test_reloading(&self, name: &str) {
        self.fire(TestEvent::TestReloading { name: name.to_string() });
    }

    pub fn fire_test_reloaded(&self, name: &str, test: Test) {
        self.fire(TestEvent::TestReloaded {
            name: name.to_string(),
            test,
        });
    }

    pub fn fire_test_reload_failed(&self, name: &str, error: ErrorInfo) {
        self.fire(TestEvent::TestReloadFailed {
            name: name.to_string(),
            error,
        });
    }

    pub fn fire_test_unloading(&self, name: &str) {
        self.fire(TestEvent::TestUnloading { name: name.to_string() });
    }

    pub fn fire_test_unloaded(&self, name: &str) {
        self.fire(TestEvent::TestUnloaded { name: name.to_string() });
    }

    pub fn fire_test_unload_failed(&self, name: &str, error: ErrorInfo) {
        self.fire(TestEvent::TestUnloadFailed {
            name: name.to_string(),
            error,
        });
    }

    pub fn fire_run_starting(&self, name: &str, test_count: usize) {
        self.fire(TestEvent::RunStarting {
            name: name.to_string(),
            test_count,
        });
    }

    pub fn fire_run_finished(&self, outcome: RunOutcome) {
        self.fire(TestEvent::RunFinished { outcome });
    }

    pub fn fire_suite_starting(&self, name: &TestName) {
        self.fire(TestEvent::SuiteStarting { name: name.clone() });
    }

    pub fn fire_suite_finished(&self, result: &TestResult) {
        self.fire(TestEvent::SuiteFinished {
            result: result.clone(),
        });
    }

    pub fn fire_test_starting(&self, name: &TestName) {
        self.fire(TestEvent::TestStarting { name: name.clone() });
    }

    pub fn fire_test_finished(&self, result: &TestResult) {
        self.fire(TestEvent::TestFinished {
            result: result.clone(),
        });
    }

    pub fn fire_unhandled_exception(&self, error: ErrorInfo) {
        self.fire(TestEvent::UnhandledException { error });
    }

    pub fn fire_test_output(&self, output: &TestOutput) {
        self.fire(TestEvent::TestOutput {
            output: output.clone(),
        });
    }
}

/// Republishes run callbacks as named events
pub struct DispatchingListener {
    dispatcher: Arc<EventDispatcher>,
}

impl DispatchingListener {
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl EventListener for DispatchingListener {
    fn run_started(&self, name: &str, test_count: usize) {
        self.dispatcher.fire_run_starting(name, test_count);
    }

    fn run_finished(&self, outcome: &RunOutcome) {
        self.dispatcher.fire_run_finished(outcome.clone());
    }

    fn suite_started(&self, name: &TestName) {
        self.dispatcher.fire_suite_starting(name);
    }

    fn suite_finished(&self, result: &TestResult) {
        self.dispatcher.fire_suite_finished(result);
    }

    fn test_started(&self, name: &TestName) {
        self.dispatcher.fire_test_starting(name);
    }

    fn test_finished(&self, result: &TestResult) {
        self.dispatcher.fire_test_finished(result);
    }

    fn unhandled_exception(&self, error: &ErrorInfo) {
        self.dispatcher.fire_unhandled_exception(error.clone());
    }

    fn test_output(&self, output: &TestOutput) {
        self.dispatcher.fire_test_output(output);
    }
}
