//! IPC protocol message types
//!
//! Defines the request/response format spoken to the agency and to agents.
//! Uses a simple length-prefixed JSON protocol. Agents answer with
//! [`Reply`] frames so a run can stream its events ahead of the response.

use serde::{Deserialize, Serialize};

use crate::common::error::IpcError;
use crate::events::RunEvent;
use crate::filter::TestFilter;
use crate::model::{AssemblyInfo, RunnerId, Test, TestPackage};

/// IPC request
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for matching responses
    pub id: u64,
    /// The command to execute
    pub command: Command,
}

/// IPC response
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    /// Request ID this response corresponds to
    pub id: u64,
    /// Whether the command succeeded
    pub success: bool,
    /// Result data on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error information on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
}

impl Response {
    /// Create a success response
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: u64, error: IpcError) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error),
        }
    }

    /// Create a success response with no data
    pub fn ok(id: u64) -> Self {
        Self {
            id,
            success: true,
            result: Some(serde_json::json!({})),
            error: None,
        }
    }
}

/// One frame written by an agent
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Reply {
    /// A listener callback from a run in progress
    Event { event: RunEvent },
    /// The final answer to a request
    Response { response: Response },
}

/// Commands understood by the agency and by agents
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    // === Agency ===
    /// An agent announcing itself
    Register {
        agent_id: u64,
        pid: u32,
        /// Socket name the agent serves on
        address: String,
    },

    // === Agent ===
    /// Liveness check
    Ping,

    /// Create (or replace) a runner with this id
    CreateRunner { runner_id: RunnerId },

    /// Unload and forget a runner
    DestroyRunner { runner_id: RunnerId },

    Load {
        runner_id: RunnerId,
        package: TestPackage,
    },

    Unload { runner_id: RunnerId },

    CountTestCases {
        runner_id: RunnerId,
        filter: TestFilter,
    },

    /// Run tests, streaming [`Reply::Event`] frames before the response
    Run {
        runner_id: RunnerId,
        filter: TestFilter,
    },

    CancelRun { runner_id: RunnerId },

    /// Stop serving and exit
    Stop,
}

impl Command {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Ping => "ping",
            Self::CreateRunner { .. } => "create_runner",
            Self::DestroyRunner { .. } => "destroy_runner",
            Self::Load { .. } => "load",
            Self::Unload { .. } => "unload",
            Self::CountTestCases { .. } => "count_test_cases",
            Self::Run { .. } => "run",
            Self::CancelRun { .. } => "cancel_run",
            Self::Stop => "stop",
        }
    }
}

/// Result of a remote load
#[derive(Debug, Serialize, Deserialize)]
pub struct LoadResult {
    pub loaded: bool,
    pub test: Option<Test>,
    #[serde(default)]
    pub assemblies: Vec<AssemblyInfo>,
}

/// Result of a remote count
#[derive(Debug, Serialize, Deserialize)]
pub struct CountResult {
    pub count: usize,
}
