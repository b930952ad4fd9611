//! Agent pool
//!
//! The agency listens on its own socket for agents announcing themselves,
//! keeps them in a pool and leases them out to process runners. Agents are
//! launched lazily, up to `max_agents`, and returned to the pool on release
//! rather than killed.

mod agent;
mod launcher;

pub use agent::{run as run_agent, Agent};
pub use launcher::{AgentLauncher, ProcessLauncher};

#[cfg(test)]
pub(crate) use launcher::in_task::InTaskLauncher;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use interprocess::local_socket::traits::tokio::Listener as ListenerTrait;
use tokio::io::BufReader;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::common::config::AgencyConfig;
use crate::common::error::IpcError;
use crate::common::{paths, Error, Result};
use crate::ipc::protocol::{Command, Request, Response};
use crate::ipc::{transport, IpcClient};
use crate::runner::lock;

/// How long a leased agent gets to answer a liveness check
const PING_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_AGENCY: AtomicU64 = AtomicU64::new(1);

/// Agent ids are unique per process, so agents of several agencies never
/// share an endpoint name
static NEXT_AGENT: AtomicU64 = AtomicU64::new(1);

/// A registered agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentHandle {
    pub agent_id: u64,
    pub pid: u32,
    /// Socket name the agent serves on
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    Free,
    Leased,
}

struct AgentEntry {
    handle: AgentHandle,
    state: LeaseState,
}

#[derive(Default)]
struct Pool {
    agents: Vec<AgentEntry>,
    /// Launched agents that have not registered yet, by launch time
    pending: HashMap<u64, Instant>,
}

#[derive(Default)]
struct Shared {
    pool: Mutex<Pool>,
    available: Notify,
}

impl Shared {
    fn register(&self, handle: AgentHandle) {
        {
            let mut pool = lock(&self.pool);
            pool.pending.remove(&handle.agent_id);
            pool.agents.retain(|e| e.handle.agent_id != handle.agent_id);
            tracing::info!(agent_id = handle.agent_id, pid = handle.pid, "Agent registered");
            pool.agents.push(AgentEntry {
                handle,
                state: LeaseState::Free,
            });
        }
        self.available.notify_waiters();
    }
}

pub struct Agency {
    address: String,
    config: AgencyConfig,
    launcher: Arc<dyn AgentLauncher>,
    shared: Arc<Shared>,
    accept: JoinHandle<()>,
}

impl Agency {
    /// Bind the agency socket and start accepting registrations
    pub async fn start(config: AgencyConfig, launcher: Arc<dyn AgentLauncher>) -> Result<Self> {
        let seq = NEXT_AGENCY.fetch_add(1, Ordering::SeqCst);
        let address = paths::socket_name(&paths::agency_endpoint(std::process::id(), seq));
        let listener = transport::create_listener(&address).await?;
        tracing::info!(%address, "Agency listening");

        let shared = Arc::new(Shared::default());
        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));

        Ok(Self {
            address,
            config,
            launcher,
            shared,
            accept,
        })
    }

    /// Address agents register with
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Registered agents, leased or not
    pub fn agent_count(&self) -> usize {
        lock(&self.shared.pool).agents.len()
    }

    pub fn leased_count(&self) -> usize {
        lock(&self.shared.pool).agents.iter().filter(|e| e.state == LeaseState::Leased).count()
    }

    /// Lease an agent, waiting up to the configured acquire timeout
    pub async fn get_agent(&self) -> Result<AgentHandle> {
        self.get_agent_within(self.config.acquire_timeout()).await
    }

    /// Lease an agent, launching one if the pool has room
    pub async fn get_agent_within(&self, timeout: Duration) -> Result<AgentHandle> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Enabled before inspecting the pool so a registration or release
            // between the check and the wait is not missed
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (candidate, launch) = self.try_lease();

            if let Some(handle) = candidate {
                if self.ping(&handle).await {
                    tracing::debug!(agent_id = handle.agent_id, "Leased agent");
                    return Ok(handle);
                }
                tracing::warn!(agent_id = handle.agent_id, pid = handle.pid, "Agent not responding, dropping it");
                self.forget(handle.agent_id);
                continue;
            }

            if let Some(agent_id) = launch {
                tracing::info!(agent_id, "Launching agent");
                if let Err(e) = self.launcher.launch(&self.address, agent_id) {
                    lock(&self.shared.pool).pending.remove(&agent_id);
                    return Err(e);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::AgentTimeout(timeout.as_secs()));
            }
        }
    }

    /// Take a free agent, or reserve a launch slot if the pool has room
    fn try_lease(&self) -> (Option<AgentHandle>, Option<u64>) {
        let mut pool = lock(&self.shared.pool);

        let launch_timeout = self.config.launch_timeout();
        pool.pending.retain(|agent_id, launched| {
            let alive = launched.elapsed() < launch_timeout;
            if !alive {
                tracing::warn!(agent_id, "Launched agent never registered");
            }
            alive
        });

        if let Some(entry) = pool.agents.iter_mut().find(|e| e.state == LeaseState::Free) {
            entry.state = LeaseState::Leased;
            return (Some(entry.handle.clone()), None);
        }

        if pool.agents.len() + pool.pending.len() < self.config.max_agents {
            let agent_id = NEXT_AGENT.fetch_add(1, Ordering::SeqCst);
            pool.pending.insert(agent_id, Instant::now());
            return (None, Some(agent_id));
        }

        (None, None)
    }

    async fn ping(&self, handle: &AgentHandle) -> bool {
        let ping = IpcClient::call_once(&handle.address, Command::Ping);
        matches!(tokio::time::timeout(PING_TIMEOUT, ping).await, Ok(Ok(_)))
    }

    fn forget(&self, agent_id: u64) {
        lock(&self.shared.pool).agents.retain(|e| e.handle.agent_id != agent_id);
        self.shared.available.notify_waiters();
    }

    /// Return a leased agent to the pool
    pub fn release_agent(&self, agent_id: u64) {
        {
            let mut pool = lock(&self.shared.pool);
            if let Some(entry) = pool.agents.iter_mut().find(|e| e.handle.agent_id == agent_id) {
                entry.state = LeaseState::Free;
                tracing::debug!(agent_id, "Released agent");
            }
        }
        self.shared.available.notify_waiters();
    }

    /// Tell every agent to stop and stop accepting registrations
    pub async fn shutdown(&self) {
        let agents: Vec<AgentHandle> = {
            let mut pool = lock(&self.shared.pool);
            pool.pending.clear();
            pool.agents.drain(..).map(|e| e.handle).collect()
        };

        for agent in agents {
            let stop = IpcClient::call_once(&agent.address, Command::Stop);
            match tokio::time::timeout(PING_TIMEOUT, stop).await {
                Ok(Ok(_)) => tracing::debug!(agent_id = agent.agent_id, "Agent stopped"),
                Ok(Err(e)) => tracing::warn!(agent_id = agent.agent_id, error = %e, "Failed to stop agent"),
                Err(_) => tracing::warn!(agent_id = agent.agent_id, "Agent did not acknowledge stop"),
            }
        }

        self.accept.abort();
        if let Err(e) = paths::remove_socket(&self.address) {
            tracing::debug!(error = %e, "Failed to remove agency socket");
        }
        tracing::info!("Agency shut down");
    }
}

impl Drop for Agency {
    fn drop(&mut self) {
        self.accept.abort();
        let _ = paths::remove_socket(&self.address);
    }
}

async fn accept_loop(listener: transport::Listener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok(stream) => {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, shared).await {
                        tracing::debug!(error = %e, "Agency client error");
                    }
                });
            }
            Err(e) => {
                tracing::error!("Accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_client(stream: transport::Stream, shared: Arc<Shared>) -> Result<()> {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    loop {
        let request: Request = match transport::recv_json(&mut reader).await {
            Ok(request) => request,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                tracing::error!("Invalid request: {}", e);
                let response = Response::error(
                    0,
                    IpcError {
                        code: "INVALID_REQUEST".to_string(),
                        message: e.to_string(),
                    },
                );
                transport::send_json(&mut writer, &response).await?;
                continue;
            }
        };

        tracing::debug!(command = request.command.name(), "Agency received command");

        let response = match request.command {
            Command::Register {
                agent_id,
                pid,
                address,
            } => {
                shared.register(AgentHandle {
                    agent_id,
                    pid,
                    address,
                });
                Response::ok(request.id)
            }
            Command::Ping => Response::ok(request.id),
            other => Response::error(
                request.id,
                IpcError {
                    code: "UNSUPPORTED_COMMAND".to_string(),
                    message: format!("The agency does not handle '{}'", other.name()),
                },
            ),
        };

        transport::send_json(&mut writer, &response).await?;
    }

    Ok(())
}
