//! End-to-end tests for the orchestrator
//!
//! These drive a [`TestController`] over real runners:
//! 1. Isolated contexts on worker threads, with closure-based assemblies
//! 2. An agency leasing in-task agents over real local sockets
//! 3. Result persistence, reload and cancellation through the controller

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use testrig::agency::{Agent, AgentLauncher};
use testrig::common::config::{Config, Isolation, RunnerConfig};
use testrig::controller::TestController;
use testrig::events::{RunOutcome, TestEvent};
use testrig::filter::{CategoryExpression, TestFilter};
use testrig::model::TestPackage;
use testrig::runner::{ContextManager, FrameworkRegistry, InProcessFramework, InProcessTest};
use testrig::services::Services;
use testrig::{Error, Result};

/// Starts agents as tasks of the test runtime instead of child processes
struct InTaskLauncher {
    manager: Arc<ContextManager>,
}

impl AgentLauncher for InTaskLauncher {
    fn launch(&self, agency_address: &str, agent_id: u64) -> Result<()> {
        let agent = Agent::new(agent_id, Arc::clone(&self.manager), RunnerConfig::default());
        let address = agency_address.to_string();
        tokio::spawn(async move { agent.serve(&address).await });
        Ok(())
    }
}

/// Test body that blocks until the gate opens
fn gated(name: &str, gate: &Arc<AtomicBool>) -> InProcessTest {
    let gate = Arc::clone(gate);
    InProcessTest::new(name, move |_| {
        while !gate.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    })
}

fn framework() -> InProcessFramework {
    let framework = InProcessFramework::new();
    framework.add_assembly(
        "alpha.so",
        vec![
            InProcessTest::new("math::adds", |_| Ok(())),
            InProcessTest::new("math::divides", |_| Err("division by zero".to_string())),
            InProcessTest::new("io::reads", |log| {
                log.write("reading fixture");
                Ok(())
            })
            .with_category("Slow"),
        ],
    );
    framework.add_assembly("beta.so", vec![InProcessTest::new("beta::works", |_| Ok(()))]);
    framework
}

struct Harness {
    controller: Arc<TestController>,
    events: UnboundedReceiver<TestEvent>,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new(framework: &InProcessFramework, config: Config) -> Self {
        let mut registry = FrameworkRegistry::new();
        registry.register(Arc::new(framework.clone()));

        let manager = {
            let mut agent_registry = FrameworkRegistry::new();
            agent_registry.register(Arc::new(framework.clone()));
            Arc::new(ContextManager::new(Arc::new(agent_registry)))
        };
        let launcher = Arc::new(InTaskLauncher { manager });

        let services = Arc::new(Services::with_parts(config, registry, launcher));
        let controller = TestController::new(services);
        let events = controller.events().subscribe_channel();

        Self {
            controller,
            events,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn package(&self, assemblies: &[&str]) -> TestPackage {
        TestPackage::new(assemblies.iter().map(PathBuf::from)).with_base_directory(self.dir.path())
    }

    async fn open(&self, assemblies: &[&str]) -> Result<()> {
        let package = self.package(assemblies);
        self.controller.load_project(&package.name(), package).await?;
        self.controller.load_test(None).await
    }

    fn actions(&mut self) -> Vec<&'static str> {
        let mut actions = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            actions.push(event.action());
        }
        actions
    }

    /// Wait for released context threads to exit
    async fn settle(&self) {
        let contexts = self.controller.services().contexts();
        tokio::time::timeout(Duration::from_secs(5), contexts.wait_for_contexts(0))
            .await
            .expect("context threads never exited");
    }

    async fn wait_for_start(&mut self, full_name: &str) {
        let wait = async {
            while let Some(event) = self.events.recv().await {
                if let TestEvent::TestStarting { name } = &event {
                    if name.full_name == full_name {
                        return;
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("test never started");
    }
}

fn context_config() -> Config {
    let mut config = Config::default();
    config.runner.shadow_copy = false;
    config
}

fn process_config() -> Config {
    let mut config = context_config();
    config.runner.isolation = Isolation::Process;
    config
}

#[tokio::test]
async fn test_run_reports_events_and_writes_result() {
    let mut harness = Harness::new(&framework(), context_config());
    harness.open(&["alpha.so", "beta.so"]).await.unwrap();

    let test = harness.controller.test().await.unwrap();
    assert_eq!(test.test_case_count(), 4);

    let result = harness.controller.run(TestFilter::Empty).await.unwrap();
    let summary = result.summary();
    assert_eq!(summary.passed, 3);
    assert_eq!(summary.failed, 1);
    assert!(result.is_failure());
    assert!(result.mirrors(&test));

    let actions = harness.actions();
    assert_eq!(
        &actions[..4],
        &["ProjectLoading", "ProjectLoaded", "TestLoading", "TestLoaded"]
    );
    assert_eq!(actions[4], "RunStarting");
    assert_eq!(actions.last(), Some(&"RunFinished"));
    assert_eq!(actions.iter().filter(|a| **a == "TestFinished").count(), 4);
    assert!(actions.contains(&"TestOutput"));

    let saved = harness.dir.path().join("TestResult.json");
    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(saved).unwrap()).unwrap();
    assert_eq!(json["summary"]["failed"], 1);
    assert_eq!(json["summary"]["passed"], 3);
    assert_eq!(harness.controller.last_result().await, Some(result));

    harness.controller.shutdown().await;
    assert_eq!(harness.controller.services().contexts().live_contexts(), 0);
}

#[tokio::test]
async fn test_category_filter_limits_the_run() {
    let harness = Harness::new(&framework(), context_config());
    harness.open(&["alpha.so", "beta.so"]).await.unwrap();

    let filter = CategoryExpression::parse("Slow").unwrap();
    let result = harness.controller.run(filter).await.unwrap();
    let summary = result.summary();
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.not_run, 3);
    assert!(!result.is_failure());

    harness.controller.shutdown().await;
}

#[tokio::test]
async fn test_load_target_narrows_to_one_assembly() {
    let harness = Harness::new(&framework(), context_config());
    let package = harness.package(&["alpha.so", "beta.so"]);
    harness.controller.load_project("both", package).await.unwrap();
    harness.controller.load_test(Some("beta::works")).await.unwrap();

    let test = harness.controller.test().await.unwrap();
    assert_eq!(test.test_case_count(), 1);

    harness.controller.shutdown().await;
}

#[tokio::test]
async fn test_partial_load_failure_leaves_nothing_behind() {
    let mut harness = Harness::new(&framework(), context_config());

    let err = harness.open(&["alpha.so", "missing.so"]).await.unwrap_err();
    assert!(matches!(err, Error::NoTestsLoaded(_)));
    assert!(harness.actions().contains(&"TestLoadFailed"));
    assert!(harness.controller.test().await.is_none());
    harness.settle().await;

    harness.controller.shutdown().await;
}

#[tokio::test]
async fn test_unload_is_idempotent() {
    let harness = Harness::new(&framework(), context_config());
    harness.open(&["beta.so"]).await.unwrap();

    harness.controller.unload_test().await.unwrap();
    harness.controller.unload_test().await.unwrap();
    assert!(!harness.controller.is_running().await);
    assert!(matches!(
        harness.controller.run(TestFilter::Empty).await,
        Err(Error::NotLoaded)
    ));

    harness.controller.shutdown().await;
}

#[tokio::test]
async fn test_failed_reload_keeps_previous_tests() {
    let framework = framework();
    let mut harness = Harness::new(&framework, context_config());
    harness.open(&["alpha.so"]).await.unwrap();
    let result = harness.controller.run(TestFilter::Empty).await.unwrap();
    harness.actions();

    // The rebuilt assembly no longer has any tests
    framework.add_assembly("alpha.so", Vec::new());
    assert!(harness.controller.reload_test().await.is_err());

    let actions = harness.actions();
    assert_eq!(actions, vec!["TestReloading", "TestReloadFailed"]);
    assert_eq!(harness.controller.test().await.unwrap().test_case_count(), 3);
    assert_eq!(harness.controller.last_result().await, Some(result));
    harness.settle().await;

    // The next good build reloads through the same runner
    framework.add_assembly("alpha.so", vec![InProcessTest::new("math::adds", |_| Ok(()))]);
    harness.controller.reload_test().await.unwrap();
    assert_eq!(harness.controller.test().await.unwrap().test_case_count(), 1);

    let again = harness.controller.run(TestFilter::Empty).await.unwrap();
    assert_eq!(again.summary().total, 1);

    harness.controller.shutdown().await;
}

#[tokio::test]
async fn test_change_during_run_reloads_afterwards() {
    let gate = Arc::new(AtomicBool::new(false));
    let framework = InProcessFramework::new();
    framework.add_assembly("slow.so", vec![gated("slow::blocks", &gate)]);

    let mut harness = Harness::new(&framework, context_config());
    harness.open(&["slow.so"]).await.unwrap();

    harness.controller.run_tests(TestFilter::Empty).await.unwrap();
    harness.wait_for_start("slow::blocks").await;
    assert!(harness.controller.is_running().await);

    harness.controller.handle_change(Path::new("slow.so")).await;
    assert!(!harness.actions().contains(&"TestReloading"));

    gate.store(true, Ordering::SeqCst);
    harness.controller.wait().await;

    let actions = harness.actions();
    let finished = actions.iter().position(|a| *a == "RunFinished").unwrap();
    let reloaded = actions.iter().position(|a| *a == "TestReloaded").unwrap();
    assert!(finished < reloaded);
    assert!(harness.controller.test().await.is_some());

    harness.controller.shutdown().await;
}

#[tokio::test]
async fn test_change_during_blocking_run_reloads_afterwards() {
    let gate = Arc::new(AtomicBool::new(false));
    let framework = InProcessFramework::new();
    framework.add_assembly("slow.so", vec![gated("slow::blocks", &gate)]);

    let mut harness = Harness::new(&framework, context_config());
    harness.open(&["slow.so"]).await.unwrap();

    let run = {
        let controller = Arc::clone(&harness.controller);
        tokio::spawn(async move { controller.run(TestFilter::Empty).await })
    };
    harness.wait_for_start("slow::blocks").await;

    harness.controller.handle_change(Path::new("slow.so")).await;
    assert!(!harness.actions().contains(&"TestReloading"));

    gate.store(true, Ordering::SeqCst);
    let result = run.await.unwrap().unwrap();
    assert!(result.is_success());

    let actions = harness.actions();
    let finished = actions.iter().position(|a| *a == "RunFinished").unwrap();
    let reloading = actions.iter().position(|a| *a == "TestReloading").unwrap();
    let reloaded = actions.iter().position(|a| *a == "TestReloaded").unwrap();
    assert!(finished < reloading && reloading < reloaded);

    harness.controller.shutdown().await;
}

#[tokio::test]
async fn test_cancel_right_after_run_tests_skips_every_case() {
    let harness = Harness::new(&framework(), context_config());
    harness.open(&["alpha.so", "beta.so"]).await.unwrap();

    harness.controller.run_tests(TestFilter::Empty).await.unwrap();
    harness.controller.cancel_run().await;
    harness.controller.wait().await;

    let result = harness.controller.last_result().await.unwrap();
    let summary = result.summary();
    assert_eq!((summary.passed, summary.failed, summary.not_run), (0, 0, 4));
    assert!(result.mirrors(&harness.controller.test().await.unwrap()));

    harness.controller.shutdown().await;
}

#[tokio::test]
async fn test_cancel_marks_remaining_cases_not_run() {
    let gate = Arc::new(AtomicBool::new(false));
    let framework = InProcessFramework::new();
    framework.add_assembly(
        "slow.so",
        vec![gated("slow::first", &gate), InProcessTest::new("slow::second", |_| Ok(()))],
    );

    let mut harness = Harness::new(&framework, context_config());
    harness.open(&["slow.so"]).await.unwrap();

    harness.controller.run_tests(TestFilter::Empty).await.unwrap();
    harness.wait_for_start("slow::first").await;

    harness.controller.cancel_run().await;
    gate.store(true, Ordering::SeqCst);
    harness.controller.wait().await;

    let result = harness.controller.last_result().await.unwrap();
    let summary = result.summary();
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.not_run, 1);
    assert!(!harness.controller.is_running().await);

    harness.controller.shutdown().await;
}

#[tokio::test]
async fn test_cancel_when_idle_is_silent() {
    let mut harness = Harness::new(&framework(), context_config());
    harness.open(&["beta.so"]).await.unwrap();
    harness.actions();

    harness.controller.cancel_run().await;
    assert!(harness.actions().is_empty());

    harness.controller.shutdown().await;
}

#[tokio::test]
async fn test_process_isolation_runs_through_agents() {
    let mut harness = Harness::new(&framework(), process_config());
    harness.open(&["alpha.so", "beta.so"]).await.unwrap();

    let agency = harness.controller.services().started_agency().unwrap();
    assert_eq!(agency.leased_count(), 2);

    let result = harness.controller.run(TestFilter::Empty).await.unwrap();
    let summary = result.summary();
    assert_eq!(summary.passed, 3);
    assert_eq!(summary.failed, 1);

    let events: Vec<_> = std::iter::from_fn(|| harness.events.try_recv().ok()).collect();
    let outcome = events.iter().rev().find_map(|e| match e {
        TestEvent::RunFinished { outcome } => Some(outcome.clone()),
        _ => None,
    });
    assert!(matches!(outcome, Some(RunOutcome::Completed(_))));
    assert_eq!(
        events.iter().filter(|e| matches!(e, TestEvent::RunStarting { .. })).count(),
        1
    );

    // Agents go back to the pool, they are not stopped
    harness.controller.unload_test().await.unwrap();
    assert_eq!(agency.leased_count(), 0);
    assert_eq!(agency.agent_count(), 2);

    harness.controller.shutdown().await;
    assert_eq!(agency.agent_count(), 0);
}

#[tokio::test]
async fn test_process_reload_reuses_leased_agents() {
    let framework = framework();
    framework.add_assembly("gamma.so", vec![InProcessTest::new("gamma::works", |_| Ok(()))]);
    let mut config = process_config();
    config.agency.max_agents = 3;
    config.agency.acquire_timeout_secs = 1;

    let mut harness = Harness::new(&framework, config);
    harness.open(&["alpha.so", "beta.so", "gamma.so"]).await.unwrap();
    let agency = harness.controller.services().started_agency().unwrap();
    assert_eq!(agency.leased_count(), 3);
    harness.actions();

    // A second lease per assembly would not fit in the pool
    harness.controller.reload_test().await.unwrap();
    assert_eq!(harness.actions(), vec!["TestReloading", "TestReloaded"]);
    assert_eq!(agency.agent_count(), 3);
    assert_eq!(agency.leased_count(), 3);

    let result = harness.controller.run(TestFilter::Empty).await.unwrap();
    assert_eq!(result.summary().total, 5);

    harness.controller.shutdown().await;
}

#[tokio::test]
async fn test_process_load_failure_releases_agents() {
    let harness = Harness::new(&framework(), process_config());

    let err = harness.open(&["missing.so"]).await.unwrap_err();
    assert!(matches!(err, Error::AssemblyNotFound(_)));

    let agency = harness.controller.services().started_agency().unwrap();
    assert_eq!(agency.leased_count(), 0);

    harness.controller.shutdown().await;
}
