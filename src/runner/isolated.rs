//! Context isolation: every load gets a fresh isolated context

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::common::config::RunnerConfig;
use crate::common::Result;
use crate::model::{RunnerId, TestPackage};

use super::context::{ContextManager, ContextSetup, IsolatedContext};
use super::proxy::{ProxyRunner, RunnerSource};
use super::{lock, TestRunner};

/// Creates one context per load and destroys it on release
pub struct ContextSource {
    manager: Arc<ContextManager>,
    config: RunnerConfig,
    context: Mutex<Option<IsolatedContext>>,
}

impl ContextSource {
    pub fn new(manager: Arc<ContextManager>, config: RunnerConfig) -> Self {
        Self {
            manager,
            config,
            context: Mutex::new(None),
        }
    }

    /// Identifier of the current context, if one exists
    pub fn context_id(&self) -> Option<u64> {
        lock(&self.context).as_ref().map(IsolatedContext::id)
    }
}

#[async_trait]
impl RunnerSource for ContextSource {
    fn kind(&self) -> &'static str {
        "context"
    }

    async fn acquire(&self, id: RunnerId, package: &TestPackage) -> Result<Arc<dyn TestRunner>> {
        let setup = ContextSetup::from_package(package, &self.config);
        let context = self.manager.create_context(setup)?;
        let runner = Arc::new(context.create_runner(id));
        // Replacing drops (and destroys) the previous context
        *lock(&self.context) = Some(context);
        Ok(runner)
    }

    async fn release(&self) {
        let context = lock(&self.context).take();
        drop(context);
    }
}

/// Runner that loads each package into its own isolated context
pub type IsolatedRunner = ProxyRunner<ContextSource>;

impl ProxyRunner<ContextSource> {
    pub fn new(id: RunnerId, manager: Arc<ContextManager>, config: RunnerConfig) -> Self {
        Self::with_source(id, ContextSource::new(manager, config))
    }
}
