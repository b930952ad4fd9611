//! Shared services handed to the controller and the runner factories
//!
//! Holds configuration, the framework registry, the context manager and the
//! agency. The agency is only started the first time a process runner needs
//! it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;

use crate::agency::{Agency, AgentLauncher, ProcessLauncher};
use crate::common::config::{Config, Isolation};
use crate::common::Result;
use crate::model::{RunnerId, TestPackage};
use crate::runner::{AggregateRunner, ContextManager, FrameworkRegistry, IsolatedRunner, ProcessRunner, TestRunner};

/// How long shutdown waits for released contexts to exit
const CONTEXT_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Services {
    config: Config,
    frameworks: Arc<FrameworkRegistry>,
    contexts: Arc<ContextManager>,
    launcher: Arc<dyn AgentLauncher>,
    agency: OnceCell<Arc<Agency>>,
    next_runner: AtomicU64,
}

impl Services {
    /// Services with the built-in frameworks, launching agents from this executable
    pub fn new(config: Config) -> Result<Self> {
        let launcher = Arc::new(ProcessLauncher::current_exe()?);
        Ok(Self::with_parts(config, FrameworkRegistry::with_builtin(), launcher))
    }

    pub fn with_parts(config: Config, frameworks: FrameworkRegistry, launcher: Arc<dyn AgentLauncher>) -> Self {
        let frameworks = Arc::new(frameworks);
        Self {
            config,
            contexts: Arc::new(ContextManager::new(Arc::clone(&frameworks))),
            frameworks,
            launcher,
            agency: OnceCell::new(),
            next_runner: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn frameworks(&self) -> &Arc<FrameworkRegistry> {
        &self.frameworks
    }

    pub fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    /// The agency, started on first use
    pub async fn agency(&self) -> Result<Arc<Agency>> {
        let agency = self
            .agency
            .get_or_try_init(|| async {
                let agency = Agency::start(self.config.agency.clone(), Arc::clone(&self.launcher)).await?;
                Ok::<_, crate::common::Error>(Arc::new(agency))
            })
            .await?;
        Ok(Arc::clone(agency))
    }

    /// Agency if it was ever started
    pub fn started_agency(&self) -> Option<Arc<Agency>> {
        self.agency.get().cloned()
    }

    /// Build the runner for a package: an aggregate with one child per
    /// assembly, isolated the way the configuration says
    pub async fn create_runner(&self, package: &TestPackage) -> Result<AggregateRunner> {
        let id = RunnerId(self.next_runner.fetch_add(1, Ordering::SeqCst));
        tracing::debug!(runner = %id, package = %package.name(), isolation = ?self.config.runner.isolation, "Creating runner");

        let runner = match self.config.runner.isolation {
            Isolation::Context => {
                let contexts = Arc::clone(&self.contexts);
                let config = self.config.runner.clone();
                AggregateRunner::new(id, move |child: RunnerId, _: &TestPackage| {
                    Arc::new(IsolatedRunner::new(child, Arc::clone(&contexts), config.clone())) as Arc<dyn TestRunner>
                })
            }
            Isolation::Process => {
                let agency = self.agency().await?;
                AggregateRunner::new(id, move |child: RunnerId, _: &TestPackage| {
                    Arc::new(ProcessRunner::new(child, Arc::clone(&agency))) as Arc<dyn TestRunner>
                })
            }
        };

        Ok(runner)
    }

    /// Stop every agent, if the agency was started, and let context threads
    /// finish removing their shadow copies
    pub async fn shutdown(&self) {
        if let Some(agency) = self.started_agency() {
            agency.shutdown().await;
        }
        let exited = tokio::time::timeout(CONTEXT_EXIT_TIMEOUT, self.contexts.wait_for_contexts(0)).await;
        if exited.is_err() {
            tracing::warn!(live = self.contexts.live_contexts(), "Context threads still running at shutdown");
        }
    }
}
