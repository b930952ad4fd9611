//! Starting agent processes
//!
//! Agents are the same binary started with the hidden `agent` subcommand.
//! They run detached and log to their own file, so no output is kept.

use std::path::PathBuf;
use std::process::Stdio;

use crate::common::{Error, Result};

/// Starts an agent that will register with the agency at `agency_address`
pub trait AgentLauncher: Send + Sync {
    fn launch(&self, agency_address: &str, agent_id: u64) -> Result<()>;
}

/// Launches agents as child processes
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Launch agents from the currently running executable
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| Error::Internal(format!("Failed to get current executable path: {}", e)))?;
        Ok(Self::new(program))
    }

    fn command(&self, agency_address: &str, agent_id: u64) -> std::process::Command {
        let mut command = std::process::Command::new(&self.program);
        command
            .arg("agent")
            .arg("--agency")
            .arg(agency_address)
            .arg("--agent-id")
            .arg(agent_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }
}

impl AgentLauncher for ProcessLauncher {
    fn launch(&self, agency_address: &str, agent_id: u64) -> Result<()> {
        let mut command = self.command(agency_address, agent_id);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New process group (detach from terminal)
            command.process_group(0);
        }

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x00000008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        let child = command
            .spawn()
            .map_err(|e| Error::AgentLaunchFailed(format!("{}: {}", self.program.display(), e)))?;
        tracing::debug!(agent_id, pid = child.id(), "Spawned agent process");
        Ok(())
    }
}
