//! Agent side: serves runners to the process that leased this agent

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use interprocess::local_socket::traits::tokio::Listener as ListenerTrait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::Notify;

use crate::common::config::{Config, RunnerConfig};
use crate::common::error::IpcError;
use crate::common::{paths, Error, Result};
use crate::events::ChannelListener;
use crate::filter::TestFilter;
use crate::ipc::protocol::{Command, CountResult, LoadResult, Reply, Request, Response};
use crate::ipc::{transport, IpcClient};
use crate::model::RunnerId;
use crate::runner::{lock, ContextManager, FrameworkRegistry, IsolatedRunner, TestRunner};

/// One agent: a socket endpoint hosting isolated runners by id
pub struct Agent {
    agent_id: u64,
    address: String,
    manager: Arc<ContextManager>,
    config: RunnerConfig,
    runners: Mutex<HashMap<RunnerId, Arc<IsolatedRunner>>>,
    stop: Notify,
}

impl Agent {
    pub fn new(agent_id: u64, manager: Arc<ContextManager>, config: RunnerConfig) -> Arc<Self> {
        Arc::new(Self {
            agent_id,
            address: paths::socket_name(&paths::agent_endpoint(std::process::id(), agent_id)),
            manager,
            config,
            runners: Mutex::new(HashMap::new()),
            stop: Notify::new(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Bind, register with the agency and serve until stopped
    ///
    /// Also exits once the agency's socket disappears, so agents do not
    /// outlive the process that launched them.
    pub async fn serve(self: Arc<Self>, agency_address: &str) -> Result<()> {
        let listener = transport::create_listener(&self.address).await?;
        tracing::info!(agent_id = self.agent_id, address = %self.address, "Agent listening");

        if let Err(e) = self.register(agency_address).await {
            let _ = paths::remove_socket(&self.address);
            return Err(e);
        }

        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let agent = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = agent.handle_client(stream).await {
                                tracing::error!("Error handling client: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
                _ = self.stop.notified() => {
                    tracing::info!("Stop requested, exiting");
                    break;
                }
                _ = tick.tick() => {
                    if !transport::socket_exists(agency_address) {
                        tracing::info!("Agency is gone, exiting");
                        break;
                    }
                }
            }
        }

        let runners: Vec<_> = lock(&self.runners).drain().map(|(_, r)| r).collect();
        for runner in runners {
            let _ = runner.unload().await;
        }
        paths::remove_socket(&self.address)?;
        tracing::info!("Agent shutdown complete");

        Ok(())
    }

    async fn register(&self, agency_address: &str) -> Result<()> {
        let mut agency = IpcClient::connect(agency_address)
            .await
            .map_err(|_| Error::AgencyNotRunning(agency_address.to_string()))?;
        agency
            .send_command(Command::Register {
                agent_id: self.agent_id,
                pid: std::process::id(),
                address: self.address.clone(),
            })
            .await?;
        Ok(())
    }

    async fn handle_client(self: Arc<Self>, stream: transport::Stream) -> Result<()> {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        loop {
            let request: Request = match transport::recv_json(&mut reader).await {
                Ok(request) => request,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::trace!("Client disconnected");
                    break;
                }
                Err(e) => {
                    tracing::error!("Invalid request: {}", e);
                    let response = Response::error(
                        0,
                        IpcError {
                            code: "INVALID_REQUEST".to_string(),
                            message: e.to_string(),
                        },
                    );
                    transport::send_json(&mut writer, &Reply::Response { response }).await?;
                    continue;
                }
            };

            tracing::debug!(command = request.command.name(), "Received command");
            let stop = matches!(request.command, Command::Stop);

            let response = match self.handle_command(request.command, &mut writer).await {
                Ok(result) => Response::success(request.id, result),
                Err(e) => Response::error(request.id, IpcError::from(&e)),
            };
            transport::send_json(&mut writer, &Reply::Response { response }).await?;

            if stop {
                self.stop.notify_one();
                break;
            }
        }

        Ok(())
    }

    fn runner(&self, id: RunnerId) -> Result<Arc<IsolatedRunner>> {
        lock(&self.runners)
            .get(&id)
            .cloned()
            .ok_or(Error::RemoteRunnerNotFound(id.0))
    }

    async fn handle_command<W>(&self, command: Command, writer: &mut W) -> Result<serde_json::Value>
    where
        W: AsyncWriteExt + Unpin + Send,
    {
        match command {
            Command::Ping => Ok(serde_json::json!({ "pid": std::process::id() })),

            Command::CreateRunner { runner_id } => {
                let runner = Arc::new(IsolatedRunner::new(runner_id, Arc::clone(&self.manager), self.config.clone()));
                let previous = lock(&self.runners).insert(runner_id, runner);
                if let Some(previous) = previous {
                    previous.unload().await?;
                }
                Ok(serde_json::json!({}))
            }

            Command::DestroyRunner { runner_id } => {
                let runner = lock(&self.runners).remove(&runner_id);
                if let Some(runner) = runner {
                    runner.unload().await?;
                }
                Ok(serde_json::json!({}))
            }

            Command::Load { runner_id, package } => {
                let runner = self.runner(runner_id)?;
                let loaded = runner.load(&package).await?;
                Ok(serde_json::to_value(LoadResult {
                    loaded,
                    test: runner.test(),
                    assemblies: runner.assembly_info(),
                })?)
            }

            Command::Unload { runner_id } => {
                self.runner(runner_id)?.unload().await?;
                Ok(serde_json::json!({}))
            }

            Command::CountTestCases { runner_id, filter } => {
                let count = self.runner(runner_id)?.count_test_cases(&filter).await?;
                Ok(serde_json::to_value(CountResult { count })?)
            }

            Command::Run { runner_id, filter } => self.run(self.runner(runner_id)?, filter, writer).await,

            Command::CancelRun { runner_id } => {
                self.runner(runner_id)?.cancel_run().await;
                Ok(serde_json::json!({}))
            }

            Command::Stop => Ok(serde_json::json!({})),

            Command::Register { .. } => Err(Error::Internal("Agents do not accept registrations".to_string())),
        }
    }

    /// Run and stream every listener callback as an event frame
    async fn run<W>(&self, runner: Arc<IsolatedRunner>, filter: TestFilter, writer: &mut W) -> Result<serde_json::Value>
    where
        W: AsyncWriteExt + Unpin + Send,
    {
        let (listener, mut events) = ChannelListener::new();
        let run = runner.run(Arc::new(listener), &filter);
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    transport::send_json(writer, &Reply::Event { event }).await?;
                }
                result = &mut run => break result,
            }
        };

        while let Ok(event) = events.try_recv() {
            transport::send_json(writer, &Reply::Event { event }).await?;
        }

        Ok(serde_json::to_value(result?)?)
    }
}

/// Entry point of an agent process launched by an agency
pub async fn run(agency_address: &str, agent_id: u64) -> Result<()> {
    let config = Config::load()?;
    let manager = Arc::new(ContextManager::new(Arc::new(FrameworkRegistry::with_builtin())));
    tracing::info!(agent_id, pid = std::process::id(), "Agent starting");

    Agent::new(agent_id, manager, config.runner).serve(agency_address).await
}
