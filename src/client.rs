//! Short-lived TCP client used by CLI code to talk to the broker.
//!
//! Each call sends exactly one frame and awaits exactly one response
//! frame. Error responses are rebuilt into [`StructuredError`]s; socket
//! failures surface as `CONNECTION_ERROR`, never as raw I/O errors.

use crate::errors::StructuredError;
use crate::protocol::{self, ProviderFailure, Request, Response, ToolDescriptor};
use crate::server::{DEFAULT_HOST, DEFAULT_PORT};
use crate::supervisor::ServerSupervisor;
use serde_json::Value;
use std::path::PathBuf;
use tokio::net::TcpStream;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// Start the broker through the supervisor when it is not running.
    pub auto_start: bool,
    /// Broker executable for auto-start; defaults to `mcp-broker` on
    /// PATH.
    pub program: Option<PathBuf>,
    /// Configuration file handed to an auto-started broker; defaults to
    /// the broker's own lookup.
    pub config: Option<PathBuf>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            auto_start: true,
            program: None,
            config: None,
        }
    }
}

pub struct BrokerClient {
    stream: TcpStream,
}

impl BrokerClient {
    /// Connect directly, without touching the supervisor.
    pub async fn connect(host: &str, port: u16) -> Result<Self, StructuredError> {
        let stream = TcpStream::connect((host, port)).await.map_err(|source| {
            StructuredError::connection(format!(
                "failed to connect to broker at {host}:{port}: {source}"
            ))
        })?;
        Ok(Self { stream })
    }

    /// Connect, auto-starting the broker first when requested. Yields
    /// `None` (with the reason logged) when the broker cannot be
    /// reached; callers must check rather than assume a usable client.
    pub async fn ensure_connected(options: ConnectOptions) -> Option<Self> {
        if options.auto_start {
            let mut supervisor = ServerSupervisor::new(options.host.clone(), options.port);
            if let Some(program) = &options.program {
                supervisor = supervisor.with_program(program.clone());
            }
            if let Some(config) = &options.config {
                supervisor = supervisor.with_config(config.clone());
            }
            if !supervisor.is_server_running().await {
                match supervisor.start_server().await {
                    Ok(message) => debug!(%message, "broker auto-start"),
                    Err(err) => {
                        warn!(%err, "could not start the broker server");
                        return None;
                    }
                }
            }
        }

        match Self::connect(&options.host, options.port).await {
            Ok(client) => Some(client),
            Err(err) => {
                warn!(%err, "could not connect to the broker server");
                None
            }
        }
    }

    /// Invoke one tool and return its stringified result.
    pub async fn call_tool(
        &mut self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<String, StructuredError> {
        let request = Request::CallTool {
            tool_name: tool_name.to_string(),
            arguments,
        };
        match self.round_trip(&request).await? {
            Response::ToolResult { result, .. } => Ok(result),
            Response::Error { error, .. } => Err(error),
            Response::ToolList { .. } => Err(StructuredError::unknown(
                "broker returned a tool list for a call_tool request",
            )),
        }
    }

    /// Fetch every Ready tool plus the initialization failures the
    /// broker accumulated at startup.
    pub async fn get_tools(
        &mut self,
    ) -> Result<(Vec<ToolDescriptor>, Vec<ProviderFailure>), StructuredError> {
        match self.round_trip(&Request::GetTools).await? {
            Response::ToolList {
                tools,
                initialization_errors,
                ..
            } => Ok((tools, initialization_errors.unwrap_or_default())),
            Response::Error { error, .. } => Err(error),
            Response::ToolResult { .. } => Err(StructuredError::unknown(
                "broker returned a tool result for a get_tools request",
            )),
        }
    }

    async fn round_trip(&mut self, request: &Request) -> Result<Response, StructuredError> {
        protocol::write_frame(&mut self.stream, request).await?;
        let payload = protocol::read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| StructuredError::connection("connection closed by server"))?;
        protocol::decode(&payload).map_err(|source| {
            StructuredError::unknown(format!("broker sent an undecodable response: {source}"))
        })
    }
}
