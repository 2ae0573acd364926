//! The broker registry: owns every provider session, initializes them
//! concurrently with per-provider timeouts, and answers tool routing
//! queries.
//!
//! Slots are written once each during startup and read-only afterward,
//! so lookups need no locking. The registry is an explicitly owned
//! value handed to the connection handler, never a global.

use crate::config::ProviderConfig;
use crate::errors::StructuredError;
use crate::provider::{ProviderCapability, ProviderSession, StdioCapability, resolve};
use crate::protocol::{ProviderFailure, ToolDescriptor};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// Default per-provider initialization timeout.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall budget for shutting every session down.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// One registry entry: a provider either came up or it did not.
pub enum ProviderSlot {
    Ready(ProviderSession),
    Failed(StructuredError),
}

pub struct BrokerRegistry {
    /// Insertion-ordered so "first provider wins" follows config order.
    slots: Vec<(String, ProviderSlot)>,
}

impl BrokerRegistry {
    /// Launch one initialization task per provider, each bounded by
    /// `per_provider_timeout`. A provider's failure never aborts or
    /// delays its siblings.
    pub async fn initialize_all(
        configs: Vec<ProviderConfig>,
        per_provider_timeout: Duration,
    ) -> Self {
        let tasks = configs
            .into_iter()
            .map(|config| init_provider(config, per_provider_timeout));
        let slots = join_all(tasks).await;

        let registry = Self { slots };
        info!(
            ready = registry.ready_count(),
            failed = registry.failed_count(),
            "Provider initialization complete"
        );
        registry
    }

    /// Build a registry from pre-made slots. Used by tests to inject
    /// mock sessions without spawning processes.
    pub fn from_slots(slots: Vec<(String, ProviderSlot)>) -> Self {
        Self { slots }
    }

    /// First Ready session (config order) whose tool map contains the
    /// name.
    pub fn resolve_tool(&self, tool_name: &str) -> Option<&ProviderSession> {
        self.slots.iter().find_map(|(_, slot)| match slot {
            ProviderSlot::Ready(session) if session.owns_tool(tool_name) => Some(session),
            _ => None,
        })
    }

    /// All Ready tools plus the accumulated initialization failures.
    pub fn list_tools(&self) -> (Vec<ToolDescriptor>, Vec<ProviderFailure>) {
        let mut tools = Vec::new();
        let mut failures = Vec::new();
        for (name, slot) in &self.slots {
            match slot {
                ProviderSlot::Ready(session) => tools.extend_from_slice(session.tools()),
                ProviderSlot::Failed(error) => failures.push(ProviderFailure {
                    server: name.clone(),
                    error: error.clone(),
                }),
            }
        }
        (tools, failures)
    }

    pub fn ready_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|(_, slot)| matches!(slot, ProviderSlot::Ready(_)))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.slots.len() - self.ready_count()
    }

    /// Concurrent teardown of every Ready session, tolerating individual
    /// failures. Sessions still alive when the budget runs out get a
    /// second, forced close sweep; anything that survives even that is
    /// reaped by `kill_on_drop` at process exit.
    pub async fn shutdown(&self) {
        self.shutdown_within(SHUTDOWN_TIMEOUT).await;
    }

    async fn shutdown_within(&self, budget: Duration) {
        if timeout(budget, self.close_sessions()).await.is_ok() {
            return;
        }
        warn!(
            "registry shutdown exceeded {}s; forcing a second close sweep",
            budget.as_secs()
        );
        if timeout(budget, self.close_sessions()).await.is_err() {
            warn!("providers still alive after the forced sweep; kill_on_drop reaps them at process exit");
        }
    }

    /// Close every Ready session concurrently. Cleanup is idempotent, so
    /// running this more than once is safe.
    async fn close_sessions(&self) {
        let cleanups = self.slots.iter().filter_map(|(name, slot)| match slot {
            ProviderSlot::Ready(session) => Some(async move {
                if let Err(err) = session.cleanup().await {
                    warn!(provider = %name, %err, "error during provider cleanup");
                }
            }),
            ProviderSlot::Failed(_) => None,
        });
        join_all(cleanups).await;
    }
}

async fn init_provider(
    config: ProviderConfig,
    per_provider_timeout: Duration,
) -> (String, ProviderSlot) {
    let name = config.name.clone();
    info!(provider = %name, command = %config.command, "Initializing provider");

    // Resolution can shell out (the npm global-bin probe), so it gets
    // the same bound as the handshake instead of stalling unboundedly.
    let program = match timeout(
        per_provider_timeout,
        resolve::resolve_command(&config.command),
    )
    .await
    {
        Ok(Ok(program)) => program,
        Ok(Err(err)) => {
            warn!(provider = %name, %err, "provider command not found");
            return (name, ProviderSlot::Failed(err));
        }
        Err(_) => {
            warn!(provider = %name, "provider command resolution timed out");
            return (
                name.clone(),
                ProviderSlot::Failed(timeout_error(&name, per_provider_timeout)),
            );
        }
    };

    let capability: Arc<dyn ProviderCapability> = Arc::new(StdioCapability::new(&config, program));
    let slot = init_with_capability(&name, capability, per_provider_timeout).await;
    (name, slot)
}

/// Run the handshake-and-list phase under a timeout. A timed-out
/// capability is closed so no half-initialized process outlives its
/// slot.
async fn init_with_capability(
    name: &str,
    capability: Arc<dyn ProviderCapability>,
    budget: Duration,
) -> ProviderSlot {
    match timeout(
        budget,
        ProviderSession::from_capability(name.to_string(), capability.clone()),
    )
    .await
    {
        Ok(Ok(session)) => {
            info!(provider = %name, "Provider initialized successfully");
            ProviderSlot::Ready(session)
        }
        Ok(Err(err)) => {
            warn!(provider = %name, %err, "provider initialization failed");
            ProviderSlot::Failed(err)
        }
        Err(_) => {
            warn!(provider = %name, "provider initialization timed out");
            if let Err(err) = capability.close().await {
                warn!(provider = %name, %err, "error killing timed-out provider");
            }
            ProviderSlot::Failed(timeout_error(name, budget))
        }
    }
}

fn timeout_error(name: &str, budget: Duration) -> StructuredError {
    StructuredError::server_init(
        format!(
            "Server initialization timed out after {} seconds",
            budget.as_secs()
        ),
        name,
    )
}
