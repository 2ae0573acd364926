//! Provider sessions: one spawned tool-provider subprocess each.
//!
//! A session is created at broker startup, transitions to Ready or
//! Failed exactly once, and is destroyed at shutdown. The registry owns
//! the set of sessions; this module owns a single provider's lifecycle.

pub mod capability;
pub mod resolve;
pub mod stdio;

pub use capability::{CapabilityError, ProviderCapability};
pub use stdio::StdioCapability;

use crate::config::ProviderConfig;
use crate::errors::StructuredError;
use crate::protocol::ToolDescriptor;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// A Ready provider session. Initialization failures never produce a
/// session; the registry stores the error instead.
pub struct ProviderSession {
    name: String,
    capability: Arc<dyn ProviderCapability>,
    tools: Vec<ToolDescriptor>,
    /// Set when the provider dies after a successful init; subsequent
    /// calls return this instead of racing a dead process.
    runtime_error: Mutex<Option<StructuredError>>,
}

impl std::fmt::Debug for ProviderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSession")
            .field("name", &self.name)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl ProviderSession {
    /// Resolve the configured command, spawn the provider over stdio,
    /// run the handshake, and list its tools.
    pub async fn initialize(config: &ProviderConfig) -> Result<Self, StructuredError> {
        let program = resolve::resolve_command(&config.command).await?;
        debug!(provider = %config.name, program = %program.display(), "Resolved provider command");
        let capability = Arc::new(StdioCapability::new(config, program));
        Self::from_capability(config.name.clone(), capability).await
    }

    /// Build a session from an already-constructed capability. This is
    /// the injection point the registry and the tests share.
    pub async fn from_capability(
        name: String,
        capability: Arc<dyn ProviderCapability>,
    ) -> Result<Self, StructuredError> {
        if let Err(err) = capability.initialize().await {
            return Err(init_error(&name, err));
        }

        let tools = match capability.list_tools().await {
            Ok(tools) => tools,
            Err(err) => {
                // The handshake succeeded, so there is a live process to
                // tear down before reporting failure.
                if let Err(close_err) = capability.close().await {
                    warn!(provider = %name, %close_err, "cleanup after failed tool listing");
                }
                return Err(init_error(&name, err));
            }
        };

        info!(provider = %name, tool_count = tools.len(), "Provider session ready");
        Ok(Self {
            name,
            capability,
            tools,
            runtime_error: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn owns_tool(&self, tool_name: &str) -> bool {
        self.tools.iter().any(|tool| tool.name == tool_name)
    }

    /// Delegate a tool call to the capability. Only valid for tools in
    /// this session's map; the registry is responsible for routing.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, StructuredError> {
        if let Some(stored) = self.runtime_error.lock().expect("runtime error lock").clone() {
            return Err(stored);
        }

        match self.capability.call_tool(tool_name, arguments.clone()).await {
            Ok(result) => Ok(result),
            Err(err @ (CapabilityError::Terminated { .. } | CapabilityError::Transport { .. })) => {
                let stored =
                    StructuredError::server_init(err.to_string(), &self.name);
                warn!(provider = %self.name, error = %stored, "provider became unavailable");
                *self.runtime_error.lock().expect("runtime error lock") = Some(stored.clone());
                Err(stored)
            }
            Err(err) => Err(StructuredError::tool_execution(
                err.to_string(),
                tool_name,
                &arguments,
            )),
        }
    }

    /// Idempotent teardown. Secondary failures while closing an already
    /// broken handle are reported, not raised further.
    pub async fn cleanup(&self) -> Result<(), StructuredError> {
        self.capability
            .close()
            .await
            .map_err(|err| StructuredError::server_init(err.to_string(), &self.name))
    }
}

fn init_error(name: &str, err: CapabilityError) -> StructuredError {
    StructuredError::server_init(format!("Server initialization failed: {err}"), name)
}
