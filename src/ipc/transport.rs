//! Cross-platform IPC transport layer
//!
//! Abstracts Unix domain sockets (Unix/macOS) and named pipes (Windows)
//! using the interprocess crate. Every endpoint is addressed by the socket
//! name from [`paths::socket_name`].

use std::io;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::paths;

/// Maximum message size (10 MB)
const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

// Platform-specific imports and type aliases
#[cfg(unix)]
pub mod platform {
    pub use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
    pub use interprocess::local_socket::{GenericFilePath, ListenerOptions};
}

#[cfg(windows)]
pub mod platform {
    pub use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
    pub use interprocess::local_socket::{GenericNamespaced, ListenerOptions};
}

use platform::*;

pub use platform::{Listener, Stream};

/// Create a listener at `name`, replacing any stale socket
pub async fn create_listener(name: &str) -> io::Result<Listener> {
    paths::ensure_socket_dir()?;
    paths::remove_socket(name)?;

    #[cfg(unix)]
    let listener = {
        let fs_name = name.to_fs_name::<GenericFilePath>()?;
        ListenerOptions::new().name(fs_name).create_tokio()?
    };

    #[cfg(windows)]
    let listener = {
        let ns_name = name.to_ns_name::<GenericNamespaced>()?;
        ListenerOptions::new().name(ns_name).create_tokio()?
    };

    // Set socket permissions on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(name, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}

/// Connect to the endpoint at `name`
pub async fn connect(name: &str) -> io::Result<Stream> {
    #[cfg(unix)]
    let stream = {
        let fs_name = name.to_fs_name::<GenericFilePath>()?;
        Stream::connect(fs_name).await?
    };

    #[cfg(windows)]
    let stream = {
        let ns_name = name.to_ns_name::<GenericNamespaced>()?;
        Stream::connect(ns_name).await?
    };

    Ok(stream)
}

/// Send a length-prefixed message
pub async fn send_message<W: AsyncWriteExt + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "Message too large"));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a length-prefixed message
pub async fn recv_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);

    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

/// Serialize `value` as JSON and send it as one frame
pub async fn send_json<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(value)?;
    send_message(writer, &json).await
}

/// Receive one frame and parse it as JSON
pub async fn recv_json<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let data = recv_message(reader).await?;
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Check if the endpoint's socket exists
pub fn socket_exists(name: &str) -> bool {
    #[cfg(unix)]
    {
        std::path::Path::new(name).exists()
    }

    #[cfg(windows)]
    {
        // Named pipes cannot be checked cheaply; rely on connection attempts
        let _ = name;
        true
    }
}
