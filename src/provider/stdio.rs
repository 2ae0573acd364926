//! Stdio implementation of [`ProviderCapability`].
//!
//! Speaks newline-delimited JSON-RPC 2.0 with a spawned provider
//! subprocess: the MCP `initialize` handshake, `tools/list`, and
//! `tools/call`. A background task owns the child's stdout and routes
//! responses to pending requests by id.

use super::capability::{CapabilityError, ProviderCapability};
use crate::config::ProviderConfig;
use crate::protocol::ToolDescriptor;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";

pub struct StdioCapability {
    inner: Arc<StdioInner>,
}

struct StdioInner {
    provider: String,
    program: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    child: AsyncMutex<Option<Child>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: AsyncMutex<HashMap<String, oneshot::Sender<Result<Value, CapabilityError>>>>,
    id_counter: AtomicU64,
}

impl StdioCapability {
    /// Build a capability for one provider. `program` is the already
    /// resolved executable path; spawning happens in `initialize`.
    pub fn new(config: &ProviderConfig, program: PathBuf) -> Self {
        Self {
            inner: Arc::new(StdioInner {
                provider: config.name.clone(),
                program,
                args: config.args.clone(),
                env: config.env.clone(),
                child: AsyncMutex::new(None),
                writer: AsyncMutex::new(None),
                pending: AsyncMutex::new(HashMap::new()),
                id_counter: AtomicU64::new(1),
            }),
        }
    }
}

#[async_trait]
impl ProviderCapability for StdioCapability {
    async fn initialize(&self) -> Result<(), CapabilityError> {
        self.inner.spawn().await?;
        match self.inner.handshake().await {
            Ok(()) => Ok(()),
            Err(err) => {
                // Partial process state must not outlive a failed handshake.
                let _ = self.inner.reset().await;
                Err(err)
            }
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, CapabilityError> {
        let result = self.inner.send_request("tools/list", json!({})).await?;
        Ok(parse_tool_list(&result))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, CapabilityError> {
        let params = json!({
            "name": name,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            },
        });
        self.inner.send_request("tools/call", params).await
    }

    async fn close(&self) -> Result<(), CapabilityError> {
        self.inner.reset().await
    }
}

impl StdioInner {
    async fn spawn(self: &Arc<Self>) -> Result<(), CapabilityError> {
        {
            let child = self.child.lock().await;
            if child.is_some() {
                return Ok(());
            }
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("NODE_NO_WARNINGS", "1")
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            // The child must not outlive the broker if teardown is skipped.
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| CapabilityError::Spawn {
            provider: self.provider.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.transport_error("failed to capture provider stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.transport_error("failed to capture provider stdout"))?;

        *self.writer.lock().await = Some(BufWriter::new(stdin));
        *self.child.lock().await = Some(child);

        let reader_self = Arc::clone(self);
        tokio::spawn(async move {
            reader_self.reader_loop(stdout).await;
        });

        Ok(())
    }

    async fn handshake(self: &Arc<Self>) -> Result<(), CapabilityError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {},
        });
        self.send_request("initialize", params).await?;
        self.send_notification("notifications/initialized", json!({}))
            .await
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(item) = lines.next_line().await {
            match item {
                Some(raw) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(value) => self.route_inbound(value).await,
                        Err(source) => {
                            warn!(
                                provider = %self.provider,
                                line = trimmed,
                                %source,
                                "received invalid JSON from provider"
                            );
                        }
                    }
                }
                None => break,
            }
        }

        let _ = self.reset().await;
    }

    async fn route_inbound(&self, value: Value) {
        match (value.get("id").cloned(), value.get("method").is_some()) {
            (Some(id), true) => self.handle_provider_request(id, &value).await,
            (Some(id), false) => self.handle_response(id, value).await,
            (None, true) => {
                let method = value.get("method").and_then(Value::as_str).unwrap_or("");
                debug!(provider = %self.provider, method, "received notification from provider");
            }
            (None, false) => {}
        }
    }

    async fn handle_response(&self, id: Value, value: Value) {
        let Some(key) = response_key(&id) else {
            return;
        };

        let responder = self.pending.lock().await.remove(&key);
        let Some(sender) = responder else {
            debug!(provider = %self.provider, response_id = key, "received response for unknown request");
            return;
        };

        if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            let _ = sender.send(Err(CapabilityError::Rpc {
                provider: self.provider.clone(),
                code,
                message,
            }));
        } else {
            let result = value.get("result").cloned().unwrap_or(Value::Null);
            let _ = sender.send(Ok(result));
        }
    }

    async fn handle_provider_request(&self, id: Value, value: &Value) {
        let method = value.get("method").and_then(Value::as_str).unwrap_or("");
        let reply = match method {
            "ping" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
            other => {
                warn!(provider = %self.provider, method = other, "provider sent unsupported request");
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": -32601,
                        "message": format!("broker does not implement method '{other}'"),
                    },
                })
            }
        };
        if let Err(err) = self.write_message(&reply).await {
            warn!(provider = %self.provider, %err, "failed to answer provider request");
        }
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, CapabilityError> {
        let id = format!("req-{}", self.id_counter.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = self.write_message(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CapabilityError::Terminated {
                provider: self.provider.clone(),
            }),
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), CapabilityError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_message(&payload).await
    }

    async fn write_message(&self, message: &Value) -> Result<(), CapabilityError> {
        let encoded =
            serde_json::to_string(message).map_err(|source| CapabilityError::InvalidJson {
                provider: self.provider.clone(),
                source,
            })?;

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| CapabilityError::Terminated {
                provider: self.provider.clone(),
            })?;
        stream
            .write_all(encoded.as_bytes())
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        Ok(())
    }

    /// Tear down the child and fail every in-flight request. Idempotent;
    /// returns the kill error if the process refused to die.
    async fn reset(&self) -> Result<(), CapabilityError> {
        *self.writer.lock().await = None;

        let mut outcome = Ok(());
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if let Err(err) = child.kill().await {
                debug!(
                    provider = %self.provider,
                    %err,
                    "failed to kill provider process (may have already exited)"
                );
                outcome = Err(self.transport_error(format!("failed to kill provider: {err}")));
            }
            let _ = child.wait().await;
        }

        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(CapabilityError::Terminated {
                provider: self.provider.clone(),
            }));
        }

        outcome
    }

    fn transport_error(&self, message: impl Into<String>) -> CapabilityError {
        CapabilityError::Transport {
            provider: self.provider.clone(),
            message: message.into(),
        }
    }
}

fn response_key(id: &Value) -> Option<String> {
    match id {
        Value::String(value) => Some(value.clone()),
        Value::Number(num) => Some(num.to_string()),
        _ => None,
    }
}

fn parse_tool_list(result: &Value) -> Vec<ToolDescriptor> {
    let Some(array) = result.get("tools").and_then(Value::as_array) else {
        return Vec::new();
    };
    array
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name").and_then(Value::as_str)?;
            Some(ToolDescriptor {
                name: name.to_string(),
                description: tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input_schema: tool.get("inputSchema").cloned().unwrap_or_else(
                    || json!({"type": "object", "properties": {}, "required": []}),
                ),
            })
        })
        .collect()
}
