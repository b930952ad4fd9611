//! Test runners
//!
//! Every way of executing tests implements [`TestRunner`]:
//! - [`ContextRunner`] talks to one isolated context thread
//! - [`IsolatedRunner`] creates a fresh context per load
//! - [`ProcessRunner`] leases an agent process and drives a runner inside it
//! - [`AggregateRunner`] fans a package out over child runners
//!
//! The isolation strategies share [`ProxyRunner`], which owns the rule that a
//! failed load tears down whatever it built before reporting the failure.

mod aggregate;
mod context;
pub mod framework;
mod inprocess;
mod isolated;
mod libtest;
mod process;
mod proxy;

pub use aggregate::{AggregateRunner, ChildFactory};
pub use context::{ContextManager, ContextRunner, ContextSetup, IsolatedContext};
pub use framework::{
    AssemblyContext, CaseContext, CaseOutcome, FrameworkRegistry, LoadedAssembly, TestCaseInfo,
    TestFramework,
};
pub use inprocess::{CaseLog, InProcessFramework, InProcessTest};
pub use isolated::{ContextSource, IsolatedRunner};
pub use libtest::LibtestFramework;
pub use process::{AgentSource, ProcessRunner, RemoteRunner};
pub use proxy::{ProxyRunner, RunnerSource};

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::common::{Error, Result};
use crate::events::SharedListener;
use crate::filter::TestFilter;
use crate::model::{AssemblyInfo, RunnerId, Test, TestPackage, TestResult};

/// The runner capability
///
/// `load` returning `Ok(false)` or an error means no usable test tree was
/// produced; `unload` stays safe to call afterwards, any number of times.
/// `run` only fails for infrastructure problems. Test failures are data in
/// the returned [`TestResult`].
#[async_trait]
pub trait TestRunner: Send + Sync {
    fn id(&self) -> RunnerId;

    async fn load(&self, package: &TestPackage) -> Result<bool>;

    async fn unload(&self) -> Result<()>;

    async fn count_test_cases(&self, filter: &TestFilter) -> Result<usize>;

    /// Run the loaded tests, blocking until they finish
    async fn run(&self, listener: SharedListener, filter: &TestFilter) -> Result<TestResult>;

    /// Start a run in the background; collect it with [`TestRunner::end_run`]
    async fn begin_run(&self, listener: SharedListener, filter: TestFilter) -> Result<()>;

    async fn end_run(&self) -> Result<TestResult>;

    /// Ask the current run to stop. Best effort; a no-op when idle.
    async fn cancel_run(&self);

    /// Wait until no run is in flight
    async fn wait(&self);

    fn test(&self) -> Option<Test>;

    fn test_result(&self) -> Option<TestResult>;

    fn running(&self) -> bool;

    fn assembly_info(&self) -> Vec<AssemblyInfo>;
}

/// Single-run guard shared by a runner and its background task
#[derive(Clone)]
pub struct RunFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for RunFlag {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl RunFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a run as started, failing if one already is
    pub fn enter(&self) -> Result<RunGuard> {
        let mut entered = false;
        self.tx.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                entered = true;
                true
            }
        });

        if entered {
            Ok(RunGuard {
                tx: Arc::clone(&self.tx),
            })
        } else {
            Err(Error::AlreadyRunning)
        }
    }

    pub fn is_running(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }
}

/// Clears the run flag when dropped
pub struct RunGuard {
    tx: Arc<watch::Sender<bool>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.tx.send_replace(false);
    }
}

/// Join handle slot behind `begin_run`/`end_run`
#[derive(Default)]
pub struct BackgroundRun {
    handle: Mutex<Option<JoinHandle<Result<TestResult>>>>,
}

impl BackgroundRun {
    pub fn start<F>(&self, run: F)
    where
        F: Future<Output = Result<TestResult>> + Send + 'static,
    {
        let handle = tokio::spawn(run);
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handle);
    }

    pub async fn join(&self) -> Result<TestResult> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(Error::NoPendingRun)?;

        handle
            .await
            .map_err(|e| Error::Internal(format!("Background run failed: {}", e)))?
    }
}

/// Lock a std mutex, recovering the data if a panicking thread poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
