//! Process isolation: runners hosted by a leased agent process
//!
//! [`RemoteRunner`] is the client half. Every operation is one explicit
//! request on a fresh connection to the agent, so a cancel can reach the
//! agent while a run is still streaming on another connection.

use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::agency::{Agency, AgentHandle};
use crate::common::Result;
use crate::events::SharedListener;
use crate::filter::TestFilter;
use crate::ipc::protocol::{Command, CountResult, LoadResult};
use crate::ipc::IpcClient;
use crate::model::{AssemblyInfo, RunnerId, Test, TestPackage, TestResult};

use super::proxy::{ProxyRunner, RunnerSource};
use super::{lock, BackgroundRun, RunFlag, TestRunner};

/// Handle to a runner living inside an agent
pub struct RemoteRunner {
    id: RunnerId,
    address: String,
    test: Mutex<Option<Test>>,
    info: Mutex<Vec<AssemblyInfo>>,
    result: Arc<Mutex<Option<TestResult>>>,
    flag: RunFlag,
    background: BackgroundRun,
}

impl RemoteRunner {
    /// Ask the agent at `address` to create runner `id`
    pub async fn create(id: RunnerId, address: &str) -> Result<Self> {
        IpcClient::call_once(address, Command::CreateRunner { runner_id: id }).await?;
        tracing::debug!(runner = %id, %address, "Created remote runner");

        Ok(Self {
            id,
            address: address.to_string(),
            test: Mutex::new(None),
            info: Mutex::new(Vec::new()),
            result: Arc::new(Mutex::new(None)),
            flag: RunFlag::new(),
            background: BackgroundRun::default(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Unload and forget the remote runner
    pub async fn destroy(&self) -> Result<()> {
        IpcClient::call_once(&self.address, Command::DestroyRunner { runner_id: self.id }).await?;
        Ok(())
    }

    fn run_request(
        &self,
        listener: SharedListener,
        filter: TestFilter,
    ) -> impl Future<Output = Result<TestResult>> + Send + 'static {
        let address = self.address.clone();
        let id = self.id;
        let store = Arc::clone(&self.result);

        async move {
            let mut client = IpcClient::connect(&address).await?;
            let value = client
                .call_streaming(Command::Run { runner_id: id, filter }, |event| {
                    event.deliver(listener.as_ref())
                })
                .await?;

            let result: TestResult = serde_json::from_value(value)?;
            *lock(&store) = Some(result.clone());
            Ok(result)
        }
    }
}

#[async_trait]
impl TestRunner for RemoteRunner {
    fn id(&self) -> RunnerId {
        self.id
    }

    async fn load(&self, package: &TestPackage) -> Result<bool> {
        let value = IpcClient::call_once(
            &self.address,
            Command::Load {
                runner_id: self.id,
                package: package.clone(),
            },
        )
        .await?;

        let loaded: LoadResult = serde_json::from_value(value)?;
        *lock(&self.test) = loaded.test;
        *lock(&self.info) = loaded.assemblies;
        Ok(loaded.loaded)
    }

    async fn unload(&self) -> Result<()> {
        *lock(&self.test) = None;
        lock(&self.info).clear();
        IpcClient::call_once(&self.address, Command::Unload { runner_id: self.id }).await?;
        Ok(())
    }

    async fn count_test_cases(&self, filter: &TestFilter) -> Result<usize> {
        let value = IpcClient::call_once(
            &self.address,
            Command::CountTestCases {
                runner_id: self.id,
                filter: filter.clone(),
            },
        )
        .await?;
        let count: CountResult = serde_json::from_value(value)?;
        Ok(count.count)
    }

    async fn run(&self, listener: SharedListener, filter: &TestFilter) -> Result<TestResult> {
        let _guard = self.flag.enter()?;
        self.run_request(listener, filter.clone()).await
    }

    async fn begin_run(&self, listener: SharedListener, filter: TestFilter) -> Result<()> {
        let guard = self.flag.enter()?;
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
        if !self.flag.is_running() {
            return;
        }
        if let Err(e) = IpcClient::call_once(&self.address, Command::CancelRun { runner_id: self.id }).await {
            tracing::warn!(runner = %self.id, error = %e, "Failed to cancel remote run");
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
        lock(&self.info).clone()
    }
}

/// Leases an agent from the agency and creates runners inside it
///
/// The agent stays leased across reloads and goes back to the pool on
/// release.
pub struct AgentSource {
    agency: Arc<Agency>,
    agent: Mutex<Option<AgentHandle>>,
    runner: Mutex<Option<Arc<RemoteRunner>>>,
}

impl AgentSource {
    pub fn new(agency: Arc<Agency>) -> Self {
        Self {
            agency,
            agent: Mutex::new(None),
            runner: Mutex::new(None),
        }
    }

    /// The agent currently leased, if any
    pub fn agent(&self) -> Option<AgentHandle> {
        lock(&self.agent).clone()
    }
}

#[async_trait]
impl RunnerSource for AgentSource {
    fn kind(&self) -> &'static str {
        "process"
    }

    async fn acquire(&self, id: RunnerId, _package: &TestPackage) -> Result<Arc<dyn TestRunner>> {
        let held = self.agent();
        let agent = match held {
            Some(agent) => agent,
            None => {
                let agent = self.agency.get_agent().await?;
                *lock(&self.agent) = Some(agent.clone());
                agent
            }
        };

        let runner = Arc::new(RemoteRunner::create(id, &agent.address).await?);
        *lock(&self.runner) = Some(Arc::clone(&runner));
        Ok(runner)
    }

    async fn release(&self) {
        let runner = lock(&self.runner).take();
        if let Some(runner) = runner {
            if let Err(e) = runner.destroy().await {
                tracing::debug!(runner = %runner.id(), error = %e, "Failed to destroy remote runner");
            }
        }

        let agent = lock(&self.agent).take();
        if let Some(agent) = agent {
            self.agency.release_agent(agent.agent_id);
        }
    }
}

impl Drop for AgentSource {
    fn drop(&mut self) {
        if let Some(agent) = lock(&self.agent).take() {
            self.agency.release_agent(agent.agent_id);
        }
    }
}

/// Runner that loads each package inside a leased agent process
pub type ProcessRunner = ProxyRunner<AgentSource>;

impl ProxyRunner<AgentSource> {
    pub fn new(id: RunnerId, agency: Arc<Agency>) -> Self {
        Self::with_source(id, AgentSource::new(agency))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agency::{AgentLauncher, InTaskLauncher};
    use crate::common::config::AgencyConfig;
    use crate::common::Error;
    use crate::events::{ChannelListener, NullListener};
    use crate::runner::{ContextManager, FrameworkRegistry, InProcessFramework, InProcessTest};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        agency: Arc<Agency>,
        gate: Arc<AtomicBool>,
        started: Arc<AtomicUsize>,
    }

    impl Fixture {
        async fn new() -> Self {
            let gate = Arc::new(AtomicBool::new(false));
            let started = Arc::new(AtomicUsize::new(0));
            let waiting = |name: &str| {
                let (gate, started) = (Arc::clone(&gate), Arc::clone(&started));
                InProcessTest::new(name, move |_| {
                    started.fetch_add(1, Ordering::SeqCst);
                    while !gate.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Ok(())
                })
            };

            let framework = InProcessFramework::new();
            framework.add_assembly("quick.dll", vec![InProcessTest::new("Quick::passes", |_| Ok(()))]);
            framework.add_assembly("gated.dll", vec![waiting("Gated::first"), waiting("Gated::second")]);
            let mut registry = FrameworkRegistry::new();
            registry.register(Arc::new(framework));

            let manager = Arc::new(ContextManager::new(Arc::new(registry)));
            let launcher: Arc<dyn AgentLauncher> = Arc::new(InTaskLauncher::new(manager));
            let agency = Agency::start(AgencyConfig::default(), launcher).await.unwrap();

            Self {
                dir: tempfile::tempdir().unwrap(),
                agency: Arc::new(agency),
                gate,
                started,
            }
        }

        fn package(&self, assembly: &str) -> TestPackage {
            TestPackage::new([assembly]).with_base_directory(self.dir.path())
        }
    }

    #[tokio::test]
    async fn test_reload_keeps_the_leased_agent() {
        let fixture = Fixture::new().await;
        let runner = ProcessRunner::new(RunnerId(101), Arc::clone(&fixture.agency));

        assert!(runner.load(&fixture.package("quick.dll")).await.unwrap());
        let leased = runner.source().agent().unwrap();

        assert!(runner.load(&fixture.package("quick.dll")).await.unwrap());
        assert_eq!(runner.source().agent(), Some(leased));
        assert_eq!(fixture.agency.agent_count(), 1);
        assert_eq!(fixture.agency.leased_count(), 1);

        let result = runner.run(Arc::new(NullListener), &TestFilter::Empty).await.unwrap();
        assert!(result.is_success());

        runner.unload().await.unwrap();
        assert_eq!(fixture.agency.leased_count(), 0);
        fixture.agency.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_load_returns_the_agent() {
        let fixture = Fixture::new().await;
        let runner = ProcessRunner::new(RunnerId(101), Arc::clone(&fixture.agency));

        let result = runner.load(&fixture.package("missing.dll")).await;
        assert!(matches!(result, Err(Error::AssemblyNotFound(_))));
        assert!(runner.source().agent().is_none());
        assert_eq!(fixture.agency.leased_count(), 0);
        fixture.agency.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_reaches_a_streaming_run() {
        let fixture = Fixture::new().await;
        let runner = ProcessRunner::new(RunnerId(101), Arc::clone(&fixture.agency));
        assert!(runner.load(&fixture.package("gated.dll")).await.unwrap());

        let (listener, _events) = ChannelListener::new();
        runner.begin_run(Arc::new(listener), TestFilter::Empty).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while fixture.started.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        runner.cancel_run().await;
        fixture.gate.store(true, Ordering::SeqCst);
        let result = runner.end_run().await.unwrap();

        let summary = result.summary();
        assert_eq!((summary.passed, summary.not_run), (1, 1));
        assert_eq!(fixture.started.load(Ordering::SeqCst), 1);
        assert!(result.mirrors(&runner.test().unwrap()));

        runner.unload().await.unwrap();
        fixture.agency.shutdown().await;
    }
}
