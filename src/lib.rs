//! Local MCP tool broker.
//!
//! One long-lived process supervises a configured set of MCP
//! tool-provider subprocesses and exposes their aggregated tools to
//! loopback TCP clients over a length-framed JSON protocol.

pub mod client;
pub mod config;
pub mod errors;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod server;
pub mod supervisor;

pub use client::{BrokerClient, ConnectOptions};
pub use errors::{ErrorKind, StructuredError};
pub use registry::BrokerRegistry;
pub use server::BrokerServer;
pub use supervisor::ServerSupervisor;
