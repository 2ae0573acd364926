//! The broker's TCP face: accept loop, per-connection dispatch, and
//! graceful shutdown.
//!
//! Each accepted connection is an independent task that reads frames in
//! order, dispatches against the shared read-only registry, and writes
//! one response per request. No failure is allowed to reach the wire
//! unstructured.

use crate::errors::StructuredError;
use crate::protocol::{self, Request, Response};
use crate::registry::BrokerRegistry;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8765;

pub struct BrokerServer {
    listener: TcpListener,
    registry: Arc<BrokerRegistry>,
}

impl BrokerServer {
    /// Bind the listening socket. Fails with `CONNECTION_ERROR` when the
    /// address is unavailable.
    pub async fn bind(
        registry: Arc<BrokerRegistry>,
        host: &str,
        port: u16,
    ) -> Result<Self, StructuredError> {
        let listener = TcpListener::bind((host, port)).await.map_err(|source| {
            StructuredError::connection(format!("failed to bind {host}:{port}: {source}"))
        })?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StructuredError> {
        self.listener
            .local_addr()
            .map_err(|source| StructuredError::connection(source.to_string()))
    }

    /// Log which tools came up and which providers did not.
    pub fn log_startup_summary(&self) {
        let (tools, failures) = self.registry.list_tools();
        if !tools.is_empty() {
            info!(count = tools.len(), "Total tools initialized");
            for tool in &tools {
                info!(tool = %tool.name, description = %tool.description, "  tool ready");
            }
        }
        if !failures.is_empty() {
            warn!(count = failures.len(), "Some providers failed to initialize");
            for failure in &failures {
                warn!(provider = %failure.server, error = %failure.error, "  provider failed");
            }
        }
    }

    /// Accept connections until `shutdown` resolves, then stop accepting
    /// and tear the registry down.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        match self.local_addr() {
            Ok(addr) => info!(%addr, "Broker listening"),
            Err(_) => info!("Broker listening"),
        }

        tokio::select! {
            _ = shutdown => {
                info!("Shutdown signal received; no longer accepting connections");
            }
            _ = self.accept_loop() => {}
        }

        self.registry.shutdown().await;
        info!("Broker stopped");
    }

    async fn accept_loop(&self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "Client connected");
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        handle_connection(stream, registry).await;
                        debug!(%peer, "Client disconnected");
                    });
                }
                Err(err) => {
                    warn!(%err, "failed to accept connection");
                }
            }
        }
    }
}

/// Resolves on ctrl-c or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler; using ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Per-connection state machine: read frame, dispatch, write frame,
/// strictly in order, until the peer closes or the stream breaks.
async fn handle_connection(mut stream: TcpStream, registry: Arc<BrokerRegistry>) {
    let (mut reader, mut writer) = stream.split();
    loop {
        let payload = match protocol::read_frame(&mut reader).await {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(err) => {
                debug!(%err, "connection ended with a framing error");
                break;
            }
        };

        let response = match decode_request(&payload) {
            Ok(request) => dispatch(&registry, request).await,
            Err(error) => Response::error(error),
        };

        if let Err(err) = protocol::write_frame(&mut writer, &response).await {
            warn!(%err, "failed to write response frame");
            break;
        }
    }
}

/// Non-JSON payloads are decode errors (`UNKNOWN_ERROR`); valid JSON
/// that is not a known request shape is an `INVALID_COMMAND`. The
/// connection stays usable either way.
fn decode_request(payload: &[u8]) -> Result<Request, StructuredError> {
    let value: Value = protocol::decode(payload)
        .map_err(|source| StructuredError::unknown(format!("failed to decode request: {source}")))?;
    serde_json::from_value(value).map_err(|_| StructuredError::invalid_command())
}

async fn dispatch(registry: &BrokerRegistry, request: Request) -> Response {
    match request {
        Request::GetTools => {
            let (tools, failures) = registry.list_tools();
            Response::tool_list(tools, failures)
        }
        Request::CallTool {
            tool_name,
            arguments,
        } => match registry.resolve_tool(&tool_name) {
            None => Response::error(StructuredError::tool_execution(
                "Tool not found",
                &tool_name,
                &arguments,
            )),
            Some(session) => match session.call_tool(&tool_name, arguments).await {
                Ok(result) => Response::tool_result(stringify_result(&result)),
                Err(error) => Response::error(error),
            },
        },
    }
}

/// Tool results cross the wire as strings: plain string results pass
/// through unquoted, everything else renders as compact JSON.
fn stringify_result(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
