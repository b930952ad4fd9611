//! IPC client used by runners and agents

use tokio::io::{ReadHalf, WriteHalf};

use crate::common::error::IpcError;
use crate::common::{Error, Result};
use crate::events::RunEvent;

use super::protocol::{Command, Reply, Request, Response};
use super::transport::{self, Stream};

/// Connection to an agency or agent endpoint
pub struct IpcClient {
    address: String,
    reader: ReadHalf<Stream>,
    writer: WriteHalf<Stream>,
    next_id: u64,
}

impl IpcClient {
    /// Connect to the endpoint at `address`
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = transport::connect(address)
            .await
            .map_err(Error::AgentConnectionFailed)?;

        let (reader, writer) = tokio::io::split(stream);

        Ok(Self {
            address: address.to_string(),
            reader,
            writer,
            next_id: 1,
        })
    }

    /// Connect, send one command to an agent and disconnect
    pub async fn call_once(address: &str, command: Command) -> Result<serde_json::Value> {
        let mut client = Self::connect(address).await?;
        client.call(command).await
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send a command to the agency, which answers with a plain response
    pub async fn send_command(&mut self, command: Command) -> Result<serde_json::Value> {
        let id = self.send(command).await?;
        let response: Response = transport::recv_json(&mut self.reader)
            .await
            .map_err(|e| Error::AgentCommunication(e.to_string()))?;
        Self::unpack(id, response)
    }

    /// Send a command to an agent and wait for its response
    pub async fn call(&mut self, command: Command) -> Result<serde_json::Value> {
        self.call_streaming(command, |_| {}).await
    }

    /// Send a command to an agent, handing every streamed event to `on_event`
    pub async fn call_streaming<F>(&mut self, command: Command, mut on_event: F) -> Result<serde_json::Value>
    where
        F: FnMut(RunEvent),
    {
        let id = self.send(command).await?;

        loop {
            let reply: Reply = transport::recv_json(&mut self.reader)
                .await
                .map_err(|e| Error::AgentCommunication(e.to_string()))?;

            match reply {
                Reply::Event { event } => on_event(event),
                Reply::Response { response } => return Self::unpack(id, response),
            }
        }
    }

    async fn send(&mut self, command: Command) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;

        tracing::trace!(address = %self.address, id, command = command.name(), "Sending command");
        let request = Request { id, command };
        transport::send_json(&mut self.writer, &request)
            .await
            .map_err(|e| Error::AgentCommunication(e.to_string()))?;
        Ok(id)
    }

    fn unpack(id: u64, response: Response) -> Result<serde_json::Value> {
        if response.id != id {
            return Err(Error::AgentCommunication(format!(
                "Response ID mismatch: expected {}, got {}",
                id, response.id
            )));
        }

        if response.success {
            Ok(response.result.unwrap_or(serde_json::json!({})))
        } else {
            let error = response.error.unwrap_or_else(|| IpcError {
                code: "UNKNOWN".to_string(),
                message: "Unknown error".to_string(),
            });
            Err(error.into())
        }
    }
}
