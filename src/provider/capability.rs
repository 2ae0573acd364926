//! The capability seam between the broker core and a provider's
//! sub-protocol. The core never speaks stdio JSON-RPC itself; it only
//! depends on these four operations.

use crate::protocol::ToolDescriptor;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure modes a capability implementation can report. The session
/// layer converts these into the wire taxonomy.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("failed to spawn provider '{provider}': {source}")]
    Spawn {
        provider: String,
        #[source]
        source: std::io::Error,
    },
    #[error("provider '{provider}' transport error: {message}")]
    Transport { provider: String, message: String },
    #[error("provider '{provider}' returned invalid JSON: {source}")]
    InvalidJson {
        provider: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("provider '{provider}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        provider: String,
        code: i64,
        message: String,
    },
    #[error("provider '{provider}' terminated unexpectedly")]
    Terminated { provider: String },
}

/// An opaque handle onto one tool-provider subprocess.
///
/// Contract: `initialize` is called once before anything else;
/// `list_tools` and `call_tool` are only valid after a successful
/// `initialize`; `close` is idempotent and must release the underlying
/// process.
#[async_trait]
pub trait ProviderCapability: Send + Sync {
    async fn initialize(&self) -> Result<(), CapabilityError>;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, CapabilityError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, CapabilityError>;

    async fn close(&self) -> Result<(), CapabilityError>;
}
