//! Isolated execution contexts
//!
//! A context is a dedicated thread that owns one loaded assembly. It has its
//! own application base, private bin path, configuration file and, when
//! shadow copying, a private directory the assembly is copied into before
//! loading. Requests reach it by message passing; panics escaping test code
//! stop at the context boundary and are reported as unhandled exceptions.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use crate::common::config::RunnerConfig;
use crate::common::{Error, Result};
use crate::events::{ErrorInfo, EventListener, RunOutcome, SharedListener};
use crate::filter::TestFilter;
use crate::model::{settings, AssemblyInfo, RunnerId, SuiteResult, Test, TestPackage, TestResult};

use super::framework::{build_tree, prune_to, AssemblyContext, CaseContext, FrameworkRegistry, LoadedAssembly, TreeOptions};
use super::{lock, BackgroundRun, RunFlag, TestRunner};

/// How a context is configured
#[derive(Debug, Clone)]
pub struct ContextSetup {
    pub application_base: PathBuf,
    pub private_bin_path: Vec<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub shadow_copy: bool,
    pub default_timeout: Duration,
}

impl ContextSetup {
    pub fn from_package(package: &TestPackage, config: &RunnerConfig) -> Self {
        let timeout_ms = package
            .int_setting(settings::DEFAULT_TIMEOUT_MS)
            .and_then(|ms| u64::try_from(ms).ok())
            .unwrap_or(config.default_timeout_ms);

        Self {
            application_base: package.base_directory.clone(),
            private_bin_path: package.private_bin_dirs(),
            config_file: package.config_file.as_ref().map(|c| package.resolve(c)),
            shadow_copy: package.bool_setting(settings::SHADOW_COPY, config.shadow_copy),
            default_timeout: Duration::from_millis(timeout_ms),
        }
    }
}

/// Creates contexts and keeps track of which are alive
pub struct ContextManager {
    frameworks: Arc<FrameworkRegistry>,
    next_id: AtomicU64,
    live: Arc<watch::Sender<usize>>,
}

impl ContextManager {
    pub fn new(frameworks: Arc<FrameworkRegistry>) -> Self {
        Self {
            frameworks,
            next_id: AtomicU64::new(1),
            live: Arc::new(watch::Sender::new(0)),
        }
    }

    /// Number of context threads that have not exited yet
    pub fn live_contexts(&self) -> usize {
        *self.live.borrow()
    }

    /// Wait until at most `count` context threads are left
    pub async fn wait_for_contexts(&self, count: usize) {
        let mut live = self.live.subscribe();
        // The sender lives in self, so this cannot fail
        let _ = live.wait_for(|n| *n <= count).await;
    }

    #[tracing::instrument(skip(self, setup), fields(base = %setup.application_base.display()))]
    pub fn create_context(&self, setup: ContextSetup) -> Result<IsolatedContext> {
        if !setup.application_base.is_dir() {
            return Err(Error::ContextCreationFailed(format!(
                "application base '{}' is not a directory",
                setup.application_base.display()
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let shadow_dir = if setup.shadow_copy {
            let dir = tempfile::Builder::new()
                .prefix(&format!("testrig-shadow-{}-", id))
                .tempdir()
                .map_err(|e| Error::ContextCreationFailed(format!("cannot create shadow directory: {}", e)))?;
            Some(dir)
        } else {
            None
        };

        let (tx, rx) = mpsc::channel();
        let host = ContextHost {
            id,
            setup,
            frameworks: Arc::clone(&self.frameworks),
            shadow_dir,
            loaded: None,
        };
        let live = LiveContext::register(id, Arc::clone(&self.live));

        std::thread::Builder::new()
            .name(format!("testrig-context-{}", id))
            .spawn(move || {
                let _live = live;
                host.serve(rx)
            })
            .map_err(|e| Error::ContextCreationFailed(format!("cannot start context thread: {}", e)))?;

        tracing::debug!(context = id, "Created isolated context");
        Ok(IsolatedContext { id, tx })
    }
}

/// Counts a context as live until the thread owning it (and its shadow
/// directory) is gone
struct LiveContext {
    id: u64,
    live: Arc<watch::Sender<usize>>,
}

impl LiveContext {
    fn register(id: u64, live: Arc<watch::Sender<usize>>) -> Self {
        live.send_modify(|n| *n += 1);
        Self { id, live }
    }
}

impl Drop for LiveContext {
    fn drop(&mut self) {
        self.live.send_modify(|n| *n = n.saturating_sub(1));
        tracing::trace!(context = self.id, "Context thread exited");
    }
}

/// Handle to a live context. Dropping it asks the context to shut down once
/// its current request is done.
pub struct IsolatedContext {
    id: u64,
    tx: mpsc::Sender<ContextRequest>,
}

impl IsolatedContext {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Create a runner bound to this context
    pub fn create_runner(&self, id: RunnerId) -> ContextRunner {
        ContextRunner::new(id, self.id, self.tx.clone())
    }
}

impl Drop for IsolatedContext {
    fn drop(&mut self) {
        // The thread may already be gone
        let _ = self.tx.send(ContextRequest::Shutdown);
        tracing::debug!(context = self.id, "Destroying isolated context");
    }
}

struct LoadReply {
    test: Option<Test>,
    info: Option<AssemblyInfo>,
}

enum ContextRequest {
    Load {
        runner: RunnerId,
        package: Box<TestPackage>,
        reply: oneshot::Sender<Result<LoadReply>>,
    },
    Count {
        filter: TestFilter,
        reply: oneshot::Sender<usize>,
    },
    Run {
        filter: TestFilter,
        listener: SharedListener,
        cancel: Arc<AtomicBool>,
        reply: oneshot::Sender<Result<TestResult>>,
    },
    Unload {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

struct LoadedState {
    assembly: Box<dyn LoadedAssembly>,
    test: Test,
}

/// Everything that lives on the context thread
struct ContextHost {
    id: u64,
    setup: ContextSetup,
    frameworks: Arc<FrameworkRegistry>,
    shadow_dir: Option<tempfile::TempDir>,
    loaded: Option<LoadedState>,
}

impl ContextHost {
    fn serve(mut self, rx: mpsc::Receiver<ContextRequest>) {
        while let Ok(request) = rx.recv() {
            match request {
                ContextRequest::Load {
                    runner,
                    package,
                    reply,
                } => {
                    let result = self.load(runner, &package);
                    let _ = reply.send(result);
                }
                ContextRequest::Count { filter, reply } => {
                    let count = self.loaded.as_ref().map(|l| filter.count(&l.test)).unwrap_or(0);
                    let _ = reply.send(count);
                }
                ContextRequest::Run {
                    filter,
                    listener,
                    cancel,
                    reply,
                } => {
                    let result = self.run(&filter, listener.as_ref(), &cancel);
                    let _ = reply.send(result);
                }
                ContextRequest::Unload { reply } => {
                    self.loaded = None;
                    let _ = reply.send(());
                }
                ContextRequest::Shutdown => break,
            }
        }
        tracing::trace!(context = self.id, "Context thread exiting");
    }

    fn load(&mut self, runner: RunnerId, package: &TestPackage) -> Result<LoadReply> {
        self.loaded = None;

        let assembly = package
            .assemblies
            .first()
            .ok_or_else(|| Error::Internal("package has no assembly".to_string()))?;
        let path = package.resolve(assembly);

        let Some(framework) = self.frameworks.find(&path) else {
            return Err(if path.exists() {
                Error::NoFramework(path.display().to_string())
            } else {
                Error::AssemblyNotFound(path.display().to_string())
            });
        };

        let load_path = self.shadow_copy(&path)?;
        let context = AssemblyContext {
            application_base: self.setup.application_base.clone(),
            private_bin_path: self.setup.private_bin_path.clone(),
            config_file: self.setup.config_file.clone(),
            settings: package.settings.clone(),
        };

        let loaded = catch_unwind(AssertUnwindSafe(|| framework.load(&load_path, &context)))
            .map_err(|panic| Error::framework(framework.name(), panic_text(panic.as_ref())))??;

        let tree = build_tree(runner, assembly, loaded.cases(), TreeOptions::from_package(package));
        let tree = match &package.test_name {
            Some(name) => match prune_to(&tree, name) {
                Some(pruned) => pruned,
                None => {
                    tracing::debug!(context = self.id, test = %name, "Target test not in assembly");
                    return Ok(LoadReply {
                        test: None,
                        info: None,
                    });
                }
            },
            None => tree,
        };

        if tree.test_case_count() == 0 {
            return Ok(LoadReply {
                test: None,
                info: None,
            });
        }

        let info = AssemblyInfo {
            path: assembly.clone(),
            framework: framework.name().to_string(),
            process_id: std::process::id(),
            context_id: self.id,
            test_count: tree.test_case_count(),
        };
        tracing::info!(
            context = self.id,
            assembly = %assembly.display(),
            framework = framework.name(),
            tests = info.test_count,
            "Loaded assembly"
        );

        self.loaded = Some(LoadedState {
            assembly: loaded,
            test: tree.clone(),
        });
        Ok(LoadReply {
            test: Some(tree),
            info: Some(info),
        })
    }

    fn shadow_copy(&self, path: &std::path::Path) -> Result<PathBuf> {
        let (Some(dir), true) = (&self.shadow_dir, path.is_file()) else {
            return Ok(path.to_path_buf());
        };
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::AssemblyNotFound(path.display().to_string()))?;
        let target = dir.path().join(file_name);
        std::fs::copy(path, &target)?;
        tracing::debug!(from = %path.display(), to = %target.display(), "Shadow copied assembly");
        Ok(target)
    }

    fn run(&mut self, filter: &TestFilter, listener: &dyn EventListener, cancel: &AtomicBool) -> Result<TestResult> {
        let timeout = self.setup.default_timeout;
        let loaded = self.loaded.as_mut().ok_or(Error::NotLoaded)?;

        listener.run_started(&loaded.test.name.full_name, filter.count(&loaded.test));
        let context = CaseContext { timeout, cancel };
        let result = execute(&loaded.test, loaded.assembly.as_mut(), filter, listener, &context);
        listener.run_finished(&RunOutcome::Completed(result.clone()));

        Ok(result)
    }
}

fn execute(
    test: &Test,
    assembly: &mut dyn LoadedAssembly,
    filter: &TestFilter,
    listener: &dyn EventListener,
    context: &CaseContext<'_>,
) -> TestResult {
    if test.is_suite {
        if !filter.pass(test) {
            return TestResult::not_run(test, None);
        }

        listener.suite_started(&test.name);
        let started = Instant::now();
        let mut suite = SuiteResult::new(test);
        for child in &test.children {
            suite.add_result(execute(child, assembly, filter, listener, context));
        }
        suite.time = started.elapsed();

        let result = TestResult::Suite(suite);
        listener.suite_finished(&result);
        return result;
    }

    if !filter.matches(test) {
        return TestResult::not_run(test, None);
    }
    if context.cancel.load(Ordering::SeqCst) {
        return TestResult::not_run(test, Some("Run cancelled"));
    }

    listener.test_started(&test.name);
    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        assembly.execute(test, context, &mut |output| listener.test_output(&output))
    }));

    let case = match outcome {
        Ok(outcome) => outcome.into_result(test, started.elapsed()),
        Err(panic) => {
            let message = panic_text(panic.as_ref());
            tracing::warn!(test = %test.name, %message, "Test code panicked");
            listener.unhandled_exception(&ErrorInfo {
                message: message.clone(),
                stack_trace: Some(test.name.full_name.clone()),
            });
            crate::model::CaseResult::failure(test, format!("Unhandled panic: {}", message), None, started.elapsed())
        }
    };

    let result = TestResult::Case(case);
    listener.test_finished(&result);
    result
}

fn panic_text(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runner that executes inside one isolated context
///
/// This is the client side of the context: every operation is a message to
/// the context thread.
pub struct ContextRunner {
    id: RunnerId,
    context_id: u64,
    tx: mpsc::Sender<ContextRequest>,
    cancel: Arc<AtomicBool>,
    flag: RunFlag,
    background: BackgroundRun,
    test: Mutex<Option<Test>>,
    info: Mutex<Option<AssemblyInfo>>,
    result: Arc<Mutex<Option<TestResult>>>,
}

impl ContextRunner {
    fn new(id: RunnerId, context_id: u64, tx: mpsc::Sender<ContextRequest>) -> Self {
        Self {
            id,
            context_id,
            tx,
            cancel: Arc::new(AtomicBool::new(false)),
            flag: RunFlag::new(),
            background: BackgroundRun::default(),
            test: Mutex::new(None),
            info: Mutex::new(None),
            result: Arc::new(Mutex::new(None)),
        }
    }

    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    fn run_request(&self, listener: SharedListener, filter: TestFilter) -> impl std::future::Future<Output = Result<TestResult>> + Send + 'static {
        let tx = self.tx.clone();
        let context_id = self.context_id;
        let cancel = Arc::clone(&self.cancel);
        let store = Arc::clone(&self.result);

        async move {
            let (reply, rx) = oneshot::channel();
            tx.send(ContextRequest::Run {
                filter,
                listener,
                cancel,
                reply,
            })
            .map_err(|_| Error::ContextTerminated(context_id))?;

            let result = rx.await.map_err(|_| Error::ContextTerminated(context_id))??;
            *lock(&store) = Some(result.clone());
            Ok(result)
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ContextRequest) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| Error::ContextTerminated(self.context_id))?;
        rx.await.map_err(|_| Error::ContextTerminated(self.context_id))
    }
}

#[async_trait]
impl TestRunner for ContextRunner {
    fn id(&self) -> RunnerId {
        self.id
    }

    async fn load(&self, package: &TestPackage) -> Result<bool> {
        let package = Box::new(package.clone());
        let runner = self.id;
        let reply = self
            .request(|reply| ContextRequest::Load {
                runner,
                package,
                reply,
            })
            .await??;

        let loaded = reply.test.is_some();
        *lock(&self.test) = reply.test;
        *lock(&self.info) = reply.info;
        Ok(loaded)
    }

    async fn unload(&self) -> Result<()> {
        *lock(&self.test) = None;
        *lock(&self.info) = None;
        // A context that is already gone has nothing left to unload
        let _ = self.request(|reply| ContextRequest::Unload { reply }).await;
        Ok(())
    }

    async fn count_test_cases(&self, filter: &TestFilter) -> Result<usize> {
        let filter = filter.clone();
        self.request(|reply| ContextRequest::Count { filter, reply }).await
    }

    async fn run(&self, listener: SharedListener, filter: &TestFilter) -> Result<TestResult> {
        let _guard = self.flag.enter()?;
        self.cancel.store(false, Ordering::SeqCst);
        self.run_request(listener, filter.clone()).await
    }

    async fn begin_run(&self, listener: SharedListener, filter: TestFilter) -> Result<()> {
        let guard = self.flag.enter()?;
        self.cancel.store(false, Ordering::SeqCst);
        let run = self.run_request(listener, filter);
        self.background.start(async move {
            let _guard = guard;
            run.await
        });
        Ok(())
    }

    async fn end_run(&self) -> Result<TestResult> {
        self.background.join().await
    }

    async fn cancel_run(&self) {
        if self.flag.is_running() {
            self.cancel.store(true, Ordering::SeqCst);
        }
    }

    async fn wait(&self) {
        self.flag.wait().await;
    }

    fn test(&self) -> Option<Test> {
        lock(&self.test).clone()
    }

    fn test_result(&self) -> Option<TestResult> {
        lock(&self.result).clone()
    }

    fn running(&self) -> bool {
        self.flag.is_running()
    }

    fn assembly_info(&self) -> Vec<AssemblyInfo> {
        lock(&self.info).iter().cloned().collect()
    }
}
