//! Fan-out over one child runner per assembly
//!
//! The aggregate splits a package into single-assembly sub-packages, loads a
//! child for each and merges their trees and results under a synthetic root
//! suite. Children run sequentially, in package order.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::common::{Error, Result};
use crate::events::{ErrorInfo, EventListener, RunOutcome, SharedListener, TestOutput};
use crate::filter::TestFilter;
use crate::model::{AssemblyInfo, RunnerId, SuiteResult, Test, TestId, TestName, TestPackage, TestResult};

use super::{lock, BackgroundRun, RunFlag, TestRunner};

/// Builds the child runner for one sub-package
pub trait ChildFactory: Send + Sync + 'static {
    fn create(&self, id: RunnerId, package: &TestPackage) -> Arc<dyn TestRunner>;
}

impl<F> ChildFactory for F
where
    F: Fn(RunnerId, &TestPackage) -> Arc<dyn TestRunner> + Send + Sync + 'static,
{
    fn create(&self, id: RunnerId, package: &TestPackage) -> Arc<dyn TestRunner> {
        self(id, package)
    }
}

pub struct AggregateRunner {
    id: RunnerId,
    factory: Arc<dyn ChildFactory>,
    children: Mutex<Vec<Arc<dyn TestRunner>>>,
    name: Mutex<String>,
    tree: Mutex<Option<Test>>,
    result: Arc<Mutex<Option<TestResult>>>,
    cancelled: Arc<AtomicBool>,
    flag: RunFlag,
    background: BackgroundRun,
}

impl AggregateRunner {
    pub fn new(id: RunnerId, factory: impl ChildFactory) -> Self {
        Self {
            id,
            factory: Arc::new(factory),
            children: Mutex::new(Vec::new()),
            name: Mutex::new(String::new()),
            tree: Mutex::new(None),
            result: Arc::new(Mutex::new(None)),
            cancelled: Arc::new(AtomicBool::new(false)),
            flag: RunFlag::new(),
            background: BackgroundRun::default(),
        }
    }

    /// Loaded children, in package order
    pub fn children(&self) -> Vec<Arc<dyn TestRunner>> {
        lock(&self.children).clone()
    }

    fn fan_out(&self, listener: SharedListener, filter: TestFilter) -> FanOut {
        FanOut {
            name: lock(&self.name).clone(),
            root: self.test(),
            children: self.children(),
            listener,
            filter,
            cancelled: Arc::clone(&self.cancelled),
            store: Arc::clone(&self.result),
        }
    }
}

/// Sub-packages for a package: one per assembly, or just the target assembly
fn split(package: &TestPackage) -> Vec<TestPackage> {
    if let Some(target) = &package.test_name {
        let named = package
            .assemblies
            .iter()
            .find(|a| a.as_os_str() == target.as_str() || package.resolve(a) == Path::new(target));
        if let Some(assembly) = named {
            return vec![package.sub_package(assembly, None)];
        }
    }

    package
        .assemblies
        .iter()
        .map(|a| package.sub_package(a, package.test_name.clone()))
        .collect()
}

#[async_trait]
impl TestRunner for AggregateRunner {
    fn id(&self) -> RunnerId {
        self.id
    }

    #[tracing::instrument(skip_all, fields(runner = %self.id, package = %package.name()))]
    async fn load(&self, package: &TestPackage) -> Result<bool> {
        let previous = std::mem::take(&mut *lock(&self.children));
        *lock(&self.tree) = None;
        *lock(&self.result) = None;

        let packages = split(package);
        let ids: Vec<RunnerId> = (0..packages.len()).map(|index| self.id.child(index)).collect();

        // Children keep their id across reloads, so whatever they hold is reused
        let mut reusable = HashMap::new();
        for child in previous {
            if ids.contains(&child.id()) {
                reusable.insert(child.id(), child);
            } else if let Err(e) = child.unload().await {
                tracing::warn!(runner = %child.id(), error = %e, "Failed to unload child");
            }
        }

        if packages.is_empty() {
            return Ok(false);
        }

        let mut loaded = Vec::new();
        let mut first_error = None;
        for (id, sub) in ids.into_iter().zip(&packages) {
            let child = reusable.remove(&id).unwrap_or_else(|| self.factory.create(id, sub));
            match child.load(sub).await {
                Ok(true) => loaded.push(child),
                outcome => {
                    if let Err(e) = &outcome {
                        tracing::warn!(assembly = %sub.name(), error = %e, "Assembly failed to load");
                    }
                    if let Err(e) = child.unload().await {
                        tracing::warn!(error = %e, "Failed to unload child");
                    }
                    if let Err(e) = outcome {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        let found = loaded.len();
        tracing::info!(found, total = packages.len(), "Loaded package");

        *lock(&self.name) = package.name();
        *lock(&self.children) = loaded;

        if found == 0 {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        Ok(if package.test_name.is_some() {
            found > 0
        } else {
            found == packages.len()
        })
    }

    async fn unload(&self) -> Result<()> {
        let children = std::mem::take(&mut *lock(&self.children));
        *lock(&self.tree) = None;
        *lock(&self.result) = None;

        let mut first_error = None;
        for child in children {
            if let Err(e) = child.unload().await {
                tracing::warn!(runner = %child.id(), error = %e, "Failed to unload child");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn count_test_cases(&self, filter: &TestFilter) -> Result<usize> {
        let mut total = 0;
        for child in self.children() {
            total += child.count_test_cases(filter).await?;
        }
        Ok(total)
    }

    async fn run(&self, listener: SharedListener, filter: &TestFilter) -> Result<TestResult> {
        let _guard = self.flag.enter()?;
        self.cancelled.store(false, Ordering::SeqCst);
        self.fan_out(listener, filter.clone()).run().await
    }

    async fn begin_run(&self, listener: SharedListener, filter: TestFilter) -> Result<()> {
        let guard = self.flag.enter()?;
        // Cleared before the task starts so an immediate cancel_run sticks
        self.cancelled.store(false, Ordering::SeqCst);
        let fan_out = self.fan_out(listener, filter);
        self.background.start(async move {
            let _guard = guard;
            fan_out.run().await
        });
        Ok(())
    }

    async fn end_run(&self) -> Result<TestResult> {
        self.background.join().await
    }

    async fn cancel_run(&self) {
        if self.flag.is_running() {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        join_all(self.children().iter().map(|c| c.cancel_run())).await;
    }

    async fn wait(&self) {
        self.flag.wait().await;
        join_all(self.children().iter().map(|c| c.wait())).await;
    }

    fn test(&self) -> Option<Test> {
        let mut tree = lock(&self.tree);
        if tree.is_none() {
            let children = lock(&self.children);
            if children.is_empty() {
                return None;
            }
            let name = lock(&self.name).clone();
            let mut root = Test::suite(
                TestId {
                    runner: self.id,
                    key: 0,
                },
                TestName::new(name.clone(), name),
            );
            root.children = children.iter().filter_map(|c| c.test()).collect();
            *tree = Some(root);
        }
        tree.clone()
    }

    fn test_result(&self) -> Option<TestResult> {
        lock(&self.result).clone()
    }

    fn running(&self) -> bool {
        self.flag.is_running()
    }

    fn assembly_info(&self) -> Vec<AssemblyInfo> {
        self.children().iter().flat_map(|c| c.assembly_info()).collect()
    }
}

/// One sequential pass over the children, detached from the runner
struct FanOut {
    name: String,
    root: Option<Test>,
    children: Vec<Arc<dyn TestRunner>>,
    listener: SharedListener,
    filter: TestFilter,
    cancelled: Arc<AtomicBool>,
    store: Arc<Mutex<Option<TestResult>>>,
}

impl FanOut {
    async fn run(self) -> Result<TestResult> {
        let root = self.root.ok_or(Error::NotLoaded)?;

        let mut total = 0;
        for child in &self.children {
            total += child.count_test_cases(&self.filter).await?;
        }

        let started = Instant::now();
        self.listener.run_started(&self.name, total);
        self.listener.suite_started(&root.name);

        let forward: SharedListener = Arc::new(ChildEvents {
            caller: Arc::clone(&self.listener),
        });
        let mut suite = SuiteResult::new(&root);

        for child in &self.children {
            let Some(test) = child.test() else {
                continue;
            };

            if !self.filter.pass(&test) {
                suite.add_result(TestResult::not_run(&test, None));
                continue;
            }
            if self.cancelled.load(Ordering::SeqCst) {
                suite.add_result(TestResult::not_run(&test, Some("Run cancelled")));
                continue;
            }

            match child.run(Arc::clone(&forward), &self.filter).await {
                Ok(result) => suite.add_result(result),
                Err(e) => {
                    tracing::warn!(runner = %child.id(), error = %e, "Child run failed");
                    suite.add_result(TestResult::set_up_failed(&test, e.to_string()));
                }
            }
        }

        suite.time = started.elapsed();
        let result = TestResult::Suite(suite);

        self.listener.suite_finished(&result);
        self.listener.run_finished(&RunOutcome::Completed(result.clone()));
        *lock(&self.store) = Some(result.clone());

        Ok(result)
    }
}

/// Forwards child callbacks, dropping the child's own run start and finish
struct ChildEvents {
    caller: SharedListener,
}

impl EventListener for ChildEvents {
    fn run_started(&self, _: &str, _: usize) {}

    fn run_finished(&self, _: &RunOutcome) {}

    fn suite_started(&self, name: &TestName) {
        self.caller.suite_started(name);
    }

    fn suite_finished(&self, result: &TestResult) {
        self.caller.suite_finished(result);
    }

    fn test_started(&self, name: &TestName) {
        self.caller.test_started(name);
    }

    fn test_finished(&self, result: &TestResult) {
        self.caller.test_finished(result);
    }

    fn unhandled_exception(&self, error: &ErrorInfo) {
        self.caller.unhandled_exception(error);
    }

    fn test_output(&self, output: &TestOutput) {
        self.caller.test_output(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::RunnerConfig;
    use crate::events::{ChannelListener, NullListener, RunEvent};
    use crate::runner::{ContextManager, FrameworkRegistry, InProcessFramework, InProcessTest, IsolatedRunner};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        manager: Arc<ContextManager>,
    }

    impl Fixture {
        fn new() -> Self {
            let framework = InProcessFramework::new();
            framework.add_assembly(
                "one.dll",
                vec![
                    InProcessTest::new("One::a", |_| Ok(())),
                    InProcessTest::new("One::b", |_| Ok(())).with_category("Fast"),
                ],
            );
            framework.add_assembly(
                "two.dll",
                vec![
                    InProcessTest::new("Two::x", |_| Err("bad x".to_string())),
                    InProcessTest::new("Two::y", |_| Err("bad y".to_string())),
                ],
            );
            framework.add_assembly("three.dll", vec![InProcessTest::new("Three::z", |_| Ok(())).with_category("Fast")]);

            let mut registry = FrameworkRegistry::new();
            registry.register(Arc::new(framework));
            Self {
                dir: tempfile::tempdir().unwrap(),
                manager: Arc::new(ContextManager::new(Arc::new(registry))),
            }
        }

        fn runner(&self) -> AggregateRunner {
            let manager = Arc::clone(&self.manager);
            AggregateRunner::new(RunnerId(1), move |id: RunnerId, _: &TestPackage| {
                Arc::new(IsolatedRunner::new(id, Arc::clone(&manager), RunnerConfig::default())) as Arc<dyn TestRunner>
            })
        }

        fn package(&self, assemblies: &[&str]) -> TestPackage {
            TestPackage::new(assemblies.iter().copied()).with_base_directory(self.dir.path())
        }

        /// Wait for every released context thread to exit
        async fn settle(&self) {
            tokio::time::timeout(Duration::from_secs(5), self.manager.wait_for_contexts(0))
                .await
                .unwrap();
        }
    }

    /// Child whose tree loads fine but whose run always fails
    struct BrokenRun {
        id: RunnerId,
    }

    impl BrokenRun {
        fn tree(&self) -> Test {
            let mut suite = Test::suite(TestId { runner: self.id, key: 0 }, TestName::new("lost.dll", "lost.dll"));
            for (key, name) in [(1, "first"), (2, "second")] {
                suite.children.push(Test::case(
                    TestId { runner: self.id, key },
                    TestName::new(name, format!("Lost::{}", name)),
                ));
            }
            suite
        }
    }

    #[async_trait]
    impl TestRunner for BrokenRun {
        fn id(&self) -> RunnerId {
            self.id
        }
        async fn load(&self, _: &TestPackage) -> Result<bool> {
            Ok(true)
        }
        async fn unload(&self) -> Result<()> {
            Ok(())
        }
        async fn count_test_cases(&self, _: &TestFilter) -> Result<usize> {
            Ok(2)
        }
        async fn run(&self, _: SharedListener, _: &TestFilter) -> Result<TestResult> {
            Err(Error::AgentCommunication("connection reset".to_string()))
        }
        async fn begin_run(&self, _: SharedListener, _: TestFilter) -> Result<()> {
            Ok(())
        }
        async fn end_run(&self) -> Result<TestResult> {
            Err(Error::NoPendingRun)
        }
        async fn cancel_run(&self) {}
        async fn wait(&self) {}
        fn test(&self) -> Option<Test> {
            Some(self.tree())
        }
        fn test_result(&self) -> Option<TestResult> {
            None
        }
        fn running(&self) -> bool {
            false
        }
        fn assembly_info(&self) -> Vec<AssemblyInfo> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_children_get_derived_ids() {
        let fixture = Fixture::new();
        let runner = fixture.runner();
        assert!(runner.load(&fixture.package(&["one.dll", "two.dll", "three.dll"])).await.unwrap());

        let ids: Vec<_> = runner.children().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![RunnerId(101), RunnerId(102), RunnerId(103)]);
    }

    #[tokio::test]
    async fn test_count_is_sum_of_children() {
        let fixture = Fixture::new();
        let runner = fixture.runner();
        runner.load(&fixture.package(&["one.dll", "two.dll", "three.dll"])).await.unwrap();

        for filter in [TestFilter::Empty, TestFilter::category(["Fast"])] {
            let mut sum = 0;
            for child in runner.children() {
                sum += child.count_test_cases(&filter).await.unwrap();
            }
            assert_eq!(runner.count_test_cases(&filter).await.unwrap(), sum);
        }
        assert_eq!(runner.count_test_cases(&TestFilter::category(["Fast"])).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_partial_load_without_target_fails() {
        let fixture = Fixture::new();
        let runner = fixture.runner();
        assert!(!runner.load(&fixture.package(&["one.dll", "missing.dll"])).await.unwrap());
        assert_eq!(runner.children().len(), 1);
    }

    #[tokio::test]
    async fn test_target_in_one_assembly_loads() {
        let fixture = Fixture::new();
        let runner = fixture.runner();
        let package = fixture.package(&["one.dll", "missing.dll"]).with_test_name("One::a");
        assert!(runner.load(&package).await.unwrap());

        let tree = runner.test().unwrap();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.test_case_count(), 1);
        assert!(tree.find("One::a").is_some());
        assert!(tree.find("One::b").is_none());
    }

    #[tokio::test]
    async fn test_target_naming_an_assembly_narrows() {
        let fixture = Fixture::new();
        let runner = fixture.runner();
        let package = fixture.package(&["one.dll", "two.dll"]).with_test_name("two.dll");
        assert!(runner.load(&package).await.unwrap());
        assert_eq!(runner.children().len(), 1);
        assert_eq!(runner.test().unwrap().test_case_count(), 2);
    }

    #[tokio::test]
    async fn test_all_children_failing_reports_error() {
        let fixture = Fixture::new();
        let runner = fixture.runner();
        let result = runner.load(&fixture.package(&["missing.dll"])).await;
        assert!(matches!(result, Err(Error::AssemblyNotFound(_))));
        fixture.settle().await;
    }

    #[tokio::test]
    async fn test_empty_package_does_not_load() {
        let fixture = Fixture::new();
        let runner = fixture.runner();
        assert!(!runner.load(&fixture.package(&[])).await.unwrap());
        assert!(runner.test().is_none());
    }

    #[tokio::test]
    async fn test_merged_run_keeps_order_and_failures() {
        let fixture = Fixture::new();
        let runner = fixture.runner();
        runner.load(&fixture.package(&["one.dll", "two.dll", "three.dll"])).await.unwrap();

        let (listener, mut events) = ChannelListener::new();
        let started = Instant::now();
        let result = runner.run(Arc::new(listener), &TestFilter::Empty).await.unwrap();

        assert!(!result.is_success());
        assert_eq!(result.failure_count(), 2);
        assert!(result.time() <= started.elapsed());
        assert!(result.mirrors(&runner.test().unwrap()));

        let mut finished = Vec::new();
        let mut run_started = 0;
        let mut run_finished = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                RunEvent::RunStarted { test_count, .. } => {
                    assert_eq!(test_count, 5);
                    run_started += 1;
                }
                RunEvent::RunFinished { .. } => run_finished += 1,
                RunEvent::TestFinished { result } => finished.push(result.name().full_name.clone()),
                _ => {}
            }
        }
        assert_eq!((run_started, run_finished), (1, 1));
        assert_eq!(finished, vec!["One::a", "One::b", "Two::x", "Two::y", "Three::z"]);
    }

    #[tokio::test]
    async fn test_filtered_child_is_not_run() {
        let fixture = Fixture::new();
        let runner = fixture.runner();
        runner.load(&fixture.package(&["one.dll", "two.dll", "three.dll"])).await.unwrap();

        let result = runner.run(Arc::new(NullListener), &TestFilter::category(["Fast"])).await.unwrap();
        let summary = result.summary();
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.not_run, 3);
        assert!(result.mirrors(&runner.test().unwrap()));
    }

    #[tokio::test]
    async fn test_begin_and_end_run() {
        let fixture = Fixture::new();
        let runner = fixture.runner();
        runner.load(&fixture.package(&["one.dll"])).await.unwrap();

        runner.begin_run(Arc::new(NullListener), TestFilter::Empty).await.unwrap();
        let result = runner.end_run().await.unwrap();
        assert!(result.is_success());
        assert!(!runner.running());
        assert_eq!(runner.test_result(), Some(result));
    }

    #[tokio::test]
    async fn test_cancel_and_unload_when_idle() {
        let fixture = Fixture::new();
        let runner = fixture.runner();
        runner.cancel_run().await;
        runner.unload().await.unwrap();

        runner.load(&fixture.package(&["one.dll"])).await.unwrap();
        runner.cancel_run().await;
        runner.unload().await.unwrap();
        runner.unload().await.unwrap();
        assert!(!runner.running());
        fixture.settle().await;
    }

    #[tokio::test]
    async fn test_cancel_right_after_begin_run_skips_every_case() {
        let fixture = Fixture::new();
        let runner = fixture.runner();
        runner.load(&fixture.package(&["one.dll", "two.dll", "three.dll"])).await.unwrap();

        runner.begin_run(Arc::new(NullListener), TestFilter::Empty).await.unwrap();
        runner.cancel_run().await;
        let result = runner.end_run().await.unwrap();

        let summary = result.summary();
        assert_eq!((summary.passed, summary.failed, summary.not_run), (0, 0, 5));
        assert!(result.mirrors(&runner.test().unwrap()));
    }

    #[tokio::test]
    async fn test_failed_child_run_keeps_tree_shape() {
        let runner = AggregateRunner::new(RunnerId(1), |id: RunnerId, _: &TestPackage| {
            Arc::new(BrokenRun { id }) as Arc<dyn TestRunner>
        });
        runner.load(&TestPackage::new(["lost.dll"])).await.unwrap();

        let result = runner.run(Arc::new(NullListener), &TestFilter::Empty).await.unwrap();
        assert!(result.mirrors(&runner.test().unwrap()));
        assert!(result.is_failure());
        assert_eq!(result.failure_count(), 1);

        let child = &result.children()[0];
        assert!(child.is_failure());
        assert!(child.message().unwrap().contains("connection reset"));
        assert_eq!(child.summary().not_run, 2);
    }

    #[tokio::test]
    async fn test_reload_reuses_children_by_id() {
        let fixture = Fixture::new();
        let created = Arc::new(AtomicUsize::new(0));
        let runner = {
            let manager = Arc::clone(&fixture.manager);
            let created = Arc::clone(&created);
            AggregateRunner::new(RunnerId(1), move |id: RunnerId, _: &TestPackage| {
                created.fetch_add(1, Ordering::SeqCst);
                Arc::new(IsolatedRunner::new(id, Arc::clone(&manager), RunnerConfig::default())) as Arc<dyn TestRunner>
            })
        };

        runner.load(&fixture.package(&["one.dll", "two.dll", "three.dll"])).await.unwrap();
        let before: Vec<_> = runner.children().iter().map(|c| Arc::as_ptr(c) as *const ()).collect();
        assert!(runner.load(&fixture.package(&["one.dll", "two.dll", "three.dll"])).await.unwrap());
        let after: Vec<_> = runner.children().iter().map(|c| Arc::as_ptr(c) as *const ()).collect();

        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert_eq!(before, after);
        assert_eq!(runner.test().unwrap().test_case_count(), 5);

        // A shorter package drops the children it no longer needs
        assert!(runner.load(&fixture.package(&["one.dll"])).await.unwrap());
        assert_eq!(runner.children().len(), 1);
        assert_eq!(created.load(Ordering::SeqCst), 3);
        tokio::time::timeout(Duration::from_secs(5), fixture.manager.wait_for_contexts(1))
            .await
            .unwrap();
        assert_eq!(fixture.manager.live_contexts(), 1);
    }
}
