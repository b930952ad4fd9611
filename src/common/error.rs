//! Error types for the test orchestrator
//!
//! Infrastructure failures surface as [`Error`] at the runner boundary.
//! Test failures never do: they are carried as data in `TestResult`.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // === Agency/Agent Errors ===
    #[error("Agency is not accepting registrations at '{0}'")]
    AgencyNotRunning(String),

    #[error("No agent became available within {0} seconds")]
    AgentTimeout(u64),

    #[error("Failed to launch agent process: {0}")]
    AgentLaunchFailed(String),

    #[error("Failed to connect to agent: {0}")]
    AgentConnectionFailed(#[source] io::Error),

    #[error("Agent communication error: {0}")]
    AgentCommunication(String),

    #[error("Runner {0} does not exist in this agent")]
    RemoteRunnerNotFound(u64),

    // === Isolated Context Errors ===
    #[error("Failed to create isolated context: {0}")]
    ContextCreationFailed(String),

    #[error("Isolated context {0} terminated unexpectedly")]
    ContextTerminated(u64),

    // === Load Errors ===
    #[error("Assembly not found: {0}")]
    AssemblyNotFound(String),

    #[error("No tests were loaded from '{0}'")]
    NoTestsLoaded(String),

    #[error("No test framework can load '{0}'")]
    NoFramework(String),

    #[error("Test framework '{framework}' failed: {message}")]
    Framework { framework: String, message: String },

    // === Runner State Errors ===
    #[error("A test run is already in progress")]
    AlreadyRunning,

    #[error("No tests are loaded")]
    NotLoaded,

    #[error("No background run was started")]
    NoPendingRun,

    // === Filter Errors ===
    #[error("Invalid category expression at position {position}: {message}")]
    FilterSyntax { position: usize, message: String },

    // === Timeout Errors ===
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a framework failure error
    pub fn framework(framework: &str, message: impl Into<String>) -> Self {
        Self::Framework {
            framework: framework.to_string(),
            message: message.into(),
        }
    }

    /// Create a filter syntax error at a character position
    pub fn filter_syntax(position: usize, message: impl Into<String>) -> Self {
        Self::FilterSyntax {
            position,
            message: message.into(),
        }
    }
}

/// IPC-serializable error for agent and agency responses
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IpcError {
    pub code: String,
    pub message: String,
}

impl From<&Error> for IpcError {
    fn from(e: &Error) -> Self {
        let code = match e {
            Error::AgentTimeout(_) => "AGENT_TIMEOUT",
            Error::RemoteRunnerNotFound(_) => "RUNNER_NOT_FOUND",
            Error::ContextCreationFailed(_) => "CONTEXT_CREATION_FAILED",
            Error::ContextTerminated(_) => "CONTEXT_TERMINATED",
            Error::AssemblyNotFound(_) => "ASSEMBLY_NOT_FOUND",
            Error::NoFramework(_) => "NO_FRAMEWORK",
            Error::Framework { .. } => "FRAMEWORK_ERROR",
            Error::AlreadyRunning => "ALREADY_RUNNING",
            Error::NotLoaded => "NOT_LOADED",
            Error::NoPendingRun => "NO_PENDING_RUN",
            Error::Timeout(_) => "TIMEOUT",
            _ => "INTERNAL_ERROR",
        }
        .to_string();

        Self {
            code,
            message: e.to_string(),
        }
    }
}

impl From<IpcError> for Error {
    fn from(e: IpcError) -> Self {
        // Map IPC errors back to our error types where the payload allows it
        match e.code.as_str() {
            "ALREADY_RUNNING" => Error::AlreadyRunning,
            "NOT_LOADED" => Error::NotLoaded,
            "NO_PENDING_RUN" => Error::NoPendingRun,
            "ASSEMBLY_NOT_FOUND" => Error::AssemblyNotFound(payload(e.message, "Assembly not found: ")),
            "CONTEXT_CREATION_FAILED" => {
                Error::ContextCreationFailed(payload(e.message, "Failed to create isolated context: "))
            }
            "NO_FRAMEWORK" => Error::NoFramework(payload(e.message, "No test framework can load '").trim_end_matches('\'').to_string()),
            _ => Error::AgentCommunication(e.message),
        }
    }
}

/// Strip the display prefix the remote side added
fn payload(message: String, prefix: &str) -> String {
    match message.strip_prefix(prefix) {
        Some(rest) => rest.to_string(),
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_error_round_trips_known_codes() {
        let ipc = IpcError::from(&Error::AlreadyRunning);
        assert_eq!(ipc.code, "ALREADY_RUNNING");
        assert!(matches!(Error::from(ipc), Error::AlreadyRunning));
    }

    #[test]
    fn test_unknown_ipc_code_becomes_communication_error() {
        let ipc = IpcError {
            code: "SOMETHING_ELSE".to_string(),
            message: "boom".to_string(),
        };
        match Error::from(ipc) {
            Error::AgentCommunication(msg) => assert_eq!(msg, "boom"),
            other => panic!("Expected AgentCommunication, got {other:?}"),
        }
    }

    #[test]
    fn test_payload_survives_the_wire() {
        let ipc = IpcError::from(&Error::AssemblyNotFound("a.dll".to_string()));
        match Error::from(ipc) {
            Error::AssemblyNotFound(path) => assert_eq!(path, "a.dll"),
            other => panic!("Expected AssemblyNotFound, got {other:?}"),
        }
    }
}
