//! Cross-platform socket and configuration paths
//!
//! Unix/macOS: Uses Unix domain sockets at $XDG_RUNTIME_DIR or /tmp
//! Windows: Uses named pipes at \\.\pipe\testrig-<username>-<endpoint>

use std::io;
use std::path::PathBuf;

/// Name used for the IPC socket directory and project directories
const APP_NAME: &str = "testrig";

/// Endpoint name for the `seq`-th agency started by process `pid`
pub fn agency_endpoint(pid: u32, seq: u64) -> String {
    format!("agency-{}-{}", pid, seq)
}

/// Endpoint name for an agent served by process `pid`
pub fn agent_endpoint(pid: u32, agent_id: u64) -> String {
    format!("agent-{}-{}", pid, agent_id)
}

/// Directory holding all socket files
///
/// - Unix: `$XDG_RUNTIME_DIR/testrig/` or `/tmp/testrig-<uid>/`
#[cfg(unix)]
pub fn socket_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_NAME);
    }

    // Fallback to /tmp with uid for security
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
}

#[cfg(windows)]
pub fn socket_dir() -> PathBuf {
    PathBuf::new()
}

/// Get the socket path for an endpoint
#[cfg(unix)]
pub fn socket_path(endpoint: &str) -> PathBuf {
    socket_dir().join(format!("{}.sock", endpoint))
}

#[cfg(windows)]
pub fn socket_path(endpoint: &str) -> PathBuf {
    PathBuf::from(socket_name(endpoint))
}

/// Get the socket name for interprocess LocalSocketName
///
/// This is the address agents publish as their callable reference.
#[cfg(unix)]
pub fn socket_name(endpoint: &str) -> String {
    socket_path(endpoint).to_string_lossy().into_owned()
}

#[cfg(windows)]
pub fn socket_name(endpoint: &str) -> String {
    let username = std::env::var("USERNAME").unwrap_or_else(|_| "default".to_string());
    format!("{}-{}-{}", APP_NAME, username, endpoint)
}

/// Ensure the socket directory exists with proper permissions
///
/// On Unix, creates the directory with mode 0700 for security
#[cfg(unix)]
pub fn ensure_socket_dir() -> io::Result<PathBuf> {
    let dir = socket_dir();

    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        // Set directory permissions to 0700 (owner only)
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(dir)
}

#[cfg(windows)]
pub fn ensure_socket_dir() -> io::Result<PathBuf> {
    // Named pipes don't need a directory on Windows
    Ok(PathBuf::new())
}

/// Remove a socket file if it exists (for cleanup)
#[cfg(unix)]
pub fn remove_socket(name: &str) -> io::Result<()> {
    let path = PathBuf::from(name);
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

#[cfg(windows)]
pub fn remove_socket(_name: &str) -> io::Result<()> {
    // Named pipes are automatically cleaned up on Windows
    Ok(())
}

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/testrig/`
/// - macOS: `~/Library/Application Support/testrig/`
/// - Windows: `%APPDATA%\testrig\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.data_dir().join("logs"))
}
