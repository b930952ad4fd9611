//! Orchestrating façade
//!
//! [`TestController`] owns the current project, package, runner and last
//! result. It drives load, unload, reload, run and cancel, republishes run
//! callbacks as named [`TestEvent`](crate::events::TestEvent)s, persists
//! results and reacts to assembly changes. Infrastructure failures become
//! `*Failed` events and are returned to the caller; nothing here panics.

mod persist;
mod watcher;

pub use persist::{JsonResultWriter, ResultWriter};
pub use watcher::AssemblyWatcher;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::common::{Error, Result};
use crate::events::{DispatchingListener, ErrorInfo, EventDispatcher, RunOutcome, SharedListener};
use crate::filter::TestFilter;
use crate::model::{Test, TestPackage, TestResult};
use crate::runner::{lock, AggregateRunner, TestRunner};
use crate::services::Services;

#[derive(Default)]
struct State {
    project: Option<String>,
    package: Option<TestPackage>,
    runner: Option<Arc<AggregateRunner>>,
    test: Option<Test>,
    result: Option<TestResult>,
    /// Filter of the most recent run, reused by reruns
    filter: TestFilter,
    /// An assembly changed while a run was in flight
    reload_pending: bool,
    watcher: Option<AssemblyWatcher>,
}

pub struct TestController {
    services: Arc<Services>,
    events: Arc<EventDispatcher>,
    writer: Arc<dyn ResultWriter>,
    state: Mutex<State>,
    run_task: StdMutex<Option<JoinHandle<()>>>,
}

impl TestController {
    /// Controller persisting results as JSON next to the package
    pub fn new(services: Arc<Services>) -> Arc<Self> {
        let writer = Arc::new(JsonResultWriter::new(services.config().output.result_file.clone()));
        Self::with_writer(services, writer)
    }

    pub fn with_writer(services: Arc<Services>, writer: Arc<dyn ResultWriter>) -> Arc<Self> {
        Arc::new(Self {
            services,
            events: Arc::new(EventDispatcher::new()),
            writer,
            state: Mutex::new(State::default()),
            run_task: StdMutex::new(None),
        })
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub async fn test(&self) -> Option<Test> {
        self.state.lock().await.test.clone()
    }

    pub async fn last_result(&self) -> Option<TestResult> {
        self.state.lock().await.result.clone()
    }

    pub async fn package(&self) -> Option<TestPackage> {
        self.state.lock().await.package.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.runner.as_ref().is_some_and(|r| r.running())
    }

    /// Open a project, replacing the current one
    pub async fn load_project(&self, name: &str, package: TestPackage) -> Result<()> {
        self.events.fire_project_loading(name);

        if package.assemblies.is_empty() {
            let error = Error::Config(format!("Project '{}' has no assemblies", name));
            self.events.fire_project_load_failed(name, ErrorInfo::from(&error));
            return Err(error);
        }

        if let Err(e) = self.unload_project().await {
            self.events.fire_project_load_failed(name, ErrorInfo::from(&e));
            return Err(e);
        }

        {
            let mut state = self.state.lock().await;
            state.project = Some(name.to_string());
            state.package = Some(package);
        }

        tracing::info!(project = name, "Project loaded");
        self.events.fire_project_loaded(name);
        Ok(())
    }

    pub async fn unload_project(&self) -> Result<()> {
        let Some(name) = self.state.lock().await.project.clone() else {
            return Ok(());
        };
        self.events.fire_project_unloading(&name);

        if let Err(e) = self.unload_test().await {
            self.events.fire_project_unload_failed(&name, ErrorInfo::from(&e));
            return Err(e);
        }

        {
            let mut state = self.state.lock().await;
            state.project = None;
            state.package = None;
            state.result = None;
        }

        self.events.fire_project_unloaded(&name);
        Ok(())
    }

    /// Load the project's tests, optionally narrowed to one test or assembly
    #[tracing::instrument(skip(self))]
    pub async fn load_test(self: &Arc<Self>, test_name: Option<&str>) -> Result<()> {
        let package = self.state.lock().await.package.clone().ok_or(Error::NotLoaded)?;
        let package = match test_name {
            Some(name) => package.with_test_name(name),
            None => TestPackage {
                test_name: None,
                ..package
            },
        };
        let name = package.name();

        self.events.fire_test_loading(&name);

        if let Err(e) = self.unload_test().await {
            self.events.fire_test_load_failed(&name, ErrorInfo::from(&e));
            return Err(e);
        }

        let (runner, test) = match self.create_and_load(&package).await {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(package = %name, error = %e, "Load failed");
                self.events.fire_test_load_failed(&name, ErrorInfo::from(&e));
                return Err(e);
            }
        };

        let watcher = if self.services.config().watch.enabled {
            match self.start_watching(&package) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot watch assemblies, automatic reload disabled");
                    None
                }
            }
        } else {
            None
        };

        {
            let mut state = self.state.lock().await;
            state.runner = Some(runner);
            state.test = Some(test.clone());
            state.result = None;
            state.package = Some(package);
            state.reload_pending = false;
            state.watcher = watcher;
        }

        tracing::info!(package = %name, tests = test.test_case_count(), "Tests loaded");
        self.events.fire_test_loaded(&name, test);
        Ok(())
    }

    /// Build a runner for `package` and load it; nothing survives a failure
    async fn create_and_load(&self, package: &TestPackage) -> Result<(Arc<AggregateRunner>, Test)> {
        let runner = Arc::new(self.services.create_runner(package).await?);

        let failure = match runner.load(package).await {
            Ok(true) => match runner.test() {
                Some(test) => return Ok((runner, test)),
                None => Error::NoTestsLoaded(package.name()),
            },
            Ok(false) => Error::NoTestsLoaded(package.name()),
            Err(e) => e,
        };

        if let Err(e) = runner.unload().await {
            tracing::warn!(error = %e, "Failed to unload after failed load");
        }
        Err(failure)
    }

    pub async fn unload_test(&self) -> Result<()> {
        let (runner, name) = {
            let mut state = self.state.lock().await;
            state.watcher = None;
            let name = state.package.as_ref().map(TestPackage::name).unwrap_or_default();
            (state.runner.take(), name)
        };
        let Some(runner) = runner else {
            return Ok(());
        };

        self.events.fire_test_unloading(&name);

        if runner.running() {
            runner.cancel_run().await;
            runner.wait().await;
        }
        let unloaded = runner.unload().await;

        {
            let mut state = self.state.lock().await;
            state.test = None;
            state.result = None;
            state.reload_pending = false;
        }

        match unloaded {
            Ok(()) => {
                self.events.fire_test_unloaded(&name);
                Ok(())
            }
            Err(e) => {
                self.events.fire_test_unload_failed(&name, ErrorInfo::from(&e));
                Err(e)
            }
        }
    }

    /// Reload the current package through the runner that already holds it
    ///
    /// Children keep their leases, so agents are reused rather than leased a
    /// second time. On failure the runner is left unloaded while the previous
    /// tree and result stay visible until a reload succeeds.
    pub async fn reload_test(&self) -> Result<()> {
        let (package, runner) = {
            let state = self.state.lock().await;
            match (&state.package, &state.runner) {
                (Some(package), Some(runner)) => (package.clone(), Arc::clone(runner)),
                _ => return Err(Error::NotLoaded),
            }
        };
        let name = package.name();

        self.events.fire_test_reloading(&name);

        let loaded = if runner.running() {
            Err(Error::AlreadyRunning)
        } else {
            self.reload_in_place(&runner, &package).await
        };

        match loaded {
            Ok(test) => {
                {
                    let mut state = self.state.lock().await;
                    state.reload_pending = false;
                    state.test = Some(test.clone());
                }

                tracing::info!(package = %name, "Tests reloaded");
                self.events.fire_test_reloaded(&name, test);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(package = %name, error = %e, "Reload failed, keeping previous tests");
                self.events.fire_test_reload_failed(&name, ErrorInfo::from(&e));
                Err(e)
            }
        }
    }

    async fn reload_in_place(&self, runner: &Arc<AggregateRunner>, package: &TestPackage) -> Result<Test> {
        let failure = match runner.load(package).await {
            Ok(true) => match runner.test() {
                Some(test) => return Ok(test),
                None => Error::NoTestsLoaded(package.name()),
            },
            Ok(false) => Error::NoTestsLoaded(package.name()),
            Err(e) => e,
        };

        // Half a reload is not kept; children give their leases back
        if let Err(e) = runner.unload().await {
            tracing::warn!(error = %e, "Failed to unload after failed reload");
        }
        Err(failure)
    }

    fn listener(&self) -> SharedListener {
        Arc::new(DispatchingListener::new(Arc::clone(&self.events)))
    }

    async fn loaded_runner(&self, filter: &TestFilter) -> Result<(Arc<AggregateRunner>, TestPackage)> {
        let mut state = self.state.lock().await;
        let runner = state.runner.clone().ok_or(Error::NotLoaded)?;
        let package = state.package.clone().ok_or(Error::NotLoaded)?;
        state.filter = filter.clone();
        Ok((runner, package))
    }

    /// Run the loaded tests and wait for the result
    ///
    /// A reload deferred by a change during the run is applied before
    /// returning.
    pub async fn run(self: &Arc<Self>, filter: TestFilter) -> Result<TestResult> {
        let (runner, package) = self.loaded_runner(&filter).await?;

        let outcome = match runner.run(self.listener(), &filter).await {
            Ok(result) => {
                self.record(&runner, &package, &result).await;
                Ok(result)
            }
            Err(Error::AlreadyRunning) => return Err(Error::AlreadyRunning),
            Err(e) => {
                self.events.fire_run_finished(RunOutcome::Failed(ErrorInfo::from(&e)));
                Err(e)
            }
        };

        self.apply_deferred_change().await;
        outcome
    }

    /// Start a run in the background; follow it through the events
    pub async fn run_tests(self: &Arc<Self>, filter: TestFilter) -> Result<()> {
        let (runner, package) = self.loaded_runner(&filter).await?;
        runner.begin_run(self.listener(), filter).await?;

        let handle = tokio::spawn(Arc::clone(self).finish_run(runner, package));
        *lock(&self.run_task) = Some(handle);
        Ok(())
    }

    fn finish_run(self: Arc<Self>, runner: Arc<AggregateRunner>, package: TestPackage) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            match runner.end_run().await {
                Ok(result) => self.record(&runner, &package, &result).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Run failed");
                    self.events.fire_run_finished(RunOutcome::Failed(ErrorInfo::from(&e)));
                }
            }

            self.apply_deferred_change().await;
        })
    }

    async fn apply_deferred_change(self: &Arc<Self>) {
        let reload = std::mem::take(&mut self.state.lock().await.reload_pending);
        if reload {
            tracing::info!("Applying reload deferred during the run");
            self.apply_change().await;
        }
    }

    /// Keep and persist the result of a run on the current runner
    async fn record(&self, runner: &Arc<AggregateRunner>, package: &TestPackage, result: &TestResult) {
        {
            let mut state = self.state.lock().await;
            let current = state.runner.as_ref().is_some_and(|r| Arc::ptr_eq(r, runner));
            if !current {
                return;
            }
            state.result = Some(result.clone());
        }

        if let Err(e) = self.writer.write(package, result) {
            tracing::warn!(error = %e, "Failed to save test result");
        }
    }

    /// Wait for background runs, including reruns they trigger
    pub async fn wait(&self) {
        loop {
            let handle = lock(&self.run_task).take();
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }

    pub async fn cancel_run(&self) {
        let runner = self.state.lock().await.runner.clone();
        if let Some(runner) = runner {
            runner.cancel_run().await;
        }
    }

    /// React to a changed assembly: reload now, or after the current run
    pub async fn handle_change(self: &Arc<Self>, path: &Path) {
        let deferred = {
            let mut state = self.state.lock().await;
            let Some(runner) = &state.runner else {
                return;
            };
            let running = runner.running();
            if running {
                state.reload_pending = true;
            }
            running
        };

        tracing::info!(path = %path.display(), deferred, "Assembly changed");
        if !deferred {
            self.apply_change().await;
        }
    }

    async fn apply_change(self: &Arc<Self>) {
        if self.reload_test().await.is_err() {
            return;
        }
        if self.services.config().watch.rerun_on_change {
            let filter = self.state.lock().await.filter.clone();
            if let Err(e) = self.run_tests(filter).await {
                tracing::warn!(error = %e, "Rerun after reload failed");
            }
        }
    }

    fn start_watching(self: &Arc<Self>, package: &TestPackage) -> Result<AssemblyWatcher> {
        let assemblies: Vec<PathBuf> = package.assemblies.iter().map(|a| package.resolve(a)).collect();
        let debounce = Duration::from_millis(self.services.config().watch.debounce_ms);
        let (watcher, mut changes) = AssemblyWatcher::start(&assemblies, debounce)?;

        let controller = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(path) = changes.recv().await {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.handle_change(&path).await;
            }
        });

        Ok(watcher)
    }

    /// Unload everything and stop any agents
    pub async fn shutdown(&self) {
        if let Err(e) = self.unload_project().await {
            tracing::warn!(error = %e, "Failed to unload project during shutdown");
        }
        self.services.shutdown().await;
    }
}
