//! Runner that delegates to an inner runner obtained from a [`RunnerSource`]
//!
//! The source decides where the inner runner lives (a fresh context, a
//! leased agent). The proxy owns the lifecycle: whenever a load does not
//! produce a usable tree, the inner runner is unloaded and the source is
//! released before the outcome is reported, so nothing built for the failed
//! load outlives it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::common::{Error, Result};
use crate::events::SharedListener;
use crate::filter::TestFilter;
use crate::model::{AssemblyInfo, RunnerId, Test, TestPackage, TestResult};

use super::{lock, TestRunner};

/// Where a proxy gets its inner runner from
#[async_trait]
pub trait RunnerSource: Send + Sync + 'static {
    /// Short description for logs
    fn kind(&self) -> &'static str;

    /// Build (or reuse) whatever hosts the runner and create one in it
    async fn acquire(&self, id: RunnerId, package: &TestPackage) -> Result<Arc<dyn TestRunner>>;

    /// Tear down what `acquire` built. Must be idempotent.
    async fn release(&self);
}

pub struct ProxyRunner<S: RunnerSource> {
    id: RunnerId,
    source: S,
    inner: Mutex<Option<Arc<dyn TestRunner>>>,
}

impl<S: RunnerSource> ProxyRunner<S> {
    pub fn with_source(id: RunnerId, source: S) -> Self {
        Self {
            id,
            source,
            inner: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn inner(&self) -> Option<Arc<dyn TestRunner>> {
        lock(&self.inner).clone()
    }

    fn loaded(&self) -> Result<Arc<dyn TestRunner>> {
        self.inner().ok_or(Error::NotLoaded)
    }
}

#[async_trait]
impl<S: RunnerSource> TestRunner for ProxyRunner<S> {
    fn id(&self) -> RunnerId {
        self.id
    }

    #[tracing::instrument(skip_all, fields(runner = %self.id, kind = self.source.kind()))]
    async fn load(&self, package: &TestPackage) -> Result<bool> {
        let previous = lock(&self.inner).take();
        if let Some(previous) = previous {
            if let Err(e) = previous.unload().await {
                tracing::warn!(error = %e, "Failed to unload previous runner");
            }
        }

        let runner = match self.source.acquire(self.id, package).await {
            Ok(runner) => runner,
            Err(e) => {
                tracing::debug!(error = %e, "Acquiring runner failed");
                self.source.release().await;
                return Err(e);
            }
        };

        match runner.load(package).await {
            Ok(true) => {
                *lock(&self.inner) = Some(runner);
                Ok(true)
            }
            outcome => {
                tracing::debug!(?outcome, "Load produced no tests, tearing down");
                if let Err(e) = runner.unload().await {
                    tracing::warn!(error = %e, "Failed to unload runner after failed load");
                }
                self.source.release().await;
                outcome
            }
        }
    }

    async fn unload(&self) -> Result<()> {
        let inner = lock(&self.inner).take();
        let result = match inner {
            Some(inner) => inner.unload().await,
            None => Ok(()),
        };
        self.source.release().await;
        result
    }

    async fn count_test_cases(&self, filter: &TestFilter) -> Result<usize> {
        match self.inner() {
            Some(inner) => inner.count_test_cases(filter).await,
            None => Ok(0),
        }
    }

    async fn run(&self, listener: SharedListener, filter: &TestFilter) -> Result<TestResult> {
        self.loaded()?.run(listener, filter).await
    }

    async fn begin_run(&self, listener: SharedListener, filter: TestFilter) -> Result<()> {
        self.loaded()?.begin_run(listener, filter).await
    }

    async fn end_run(&self) -> Result<TestResult> {
        match self.inner() {
            Some(inner) => inner.end_run().await,
            None => Err(Error::NoPendingRun),
        }
    }

    async fn cancel_run(&self) {
        if let Some(inner) = self.inner() {
            inner.cancel_run().await;
        }
    }

    async fn wait(&self) {
        if let Some(inner) = self.inner() {
            inner.wait().await;
        }
    }

    fn test(&self) -> Option<Test> {
        self.inner().and_then(|inner| inner.test())
    }

    fn test_result(&self) -> Option<TestResult> {
        self.inner().and_then(|inner| inner.test_result())
    }

    fn running(&self) -> bool {
        self.inner().is_some_and(|inner| inner.running())
    }

    fn assembly_info(&self) -> Vec<AssemblyInfo> {
        self.inner().map(|inner| inner.assembly_info()).unwrap_or_default()
    }
}
