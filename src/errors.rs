//! Structured error taxonomy shared by the broker, its clients, and the
//! wire protocol.
//!
//! Every failure that crosses a component boundary is converted into a
//! [`StructuredError`] before it is stored, aggregated, or written to the
//! wire. The serialized form uses the field names the TCP protocol has
//! always used (`error_type`, `message`, `details`) and round-trips
//! losslessly.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use thiserror::Error;

/// Closed set of error kinds carried over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "CONFIG_ERROR")]
    Config,
    #[serde(rename = "SERVER_INIT_ERROR")]
    ServerInit,
    #[serde(rename = "TOOL_EXECUTION_ERROR")]
    ToolExecution,
    #[serde(rename = "COMMAND_NOT_FOUND")]
    CommandNotFound,
    #[serde(rename = "INVALID_COMMAND")]
    InvalidCommand,
    #[serde(rename = "CONNECTION_ERROR")]
    Connection,
    #[serde(rename = "UNKNOWN_ERROR")]
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "CONFIG_ERROR",
            ErrorKind::ServerInit => "SERVER_INIT_ERROR",
            ErrorKind::ToolExecution => "TOOL_EXECUTION_ERROR",
            ErrorKind::CommandNotFound => "COMMAND_NOT_FOUND",
            ErrorKind::InvalidCommand => "INVALID_COMMAND",
            ErrorKind::Connection => "CONNECTION_ERROR",
            ErrorKind::Unknown => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (kind, message, details) error that survives serialization across
/// the wire.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StructuredError {
    #[serde(rename = "error_type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl StructuredError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    /// Configuration file failure; aborts broker startup.
    pub fn config(message: impl Into<String>, config_path: &str) -> Self {
        Self::new(ErrorKind::Config, message).with_detail("config_path", json!(config_path))
    }

    /// A provider failed to spawn, handshake, or list its tools.
    pub fn server_init(message: impl Into<String>, server_name: &str) -> Self {
        Self::new(ErrorKind::ServerInit, message).with_detail("server_name", json!(server_name))
    }

    /// A tool call could not be routed or failed while executing.
    pub fn tool_execution(message: impl Into<String>, tool_name: &str, arguments: &Value) -> Self {
        Self::new(ErrorKind::ToolExecution, message)
            .with_detail("tool_name", json!(tool_name))
            .with_detail("arguments", arguments.clone())
    }

    /// A provider command could not be resolved to an executable.
    pub fn command_not_found(command: &str, available_paths: Vec<String>) -> Self {
        Self::new(
            ErrorKind::CommandNotFound,
            format!("Command '{command}' not found. Please ensure it's installed and in your PATH."),
        )
        .with_detail("command", json!(command))
        .with_detail("available_paths", json!(available_paths))
        .with_detail(
            "help",
            json!("The command might need to be installed or added to your system's PATH."),
        )
    }

    pub fn invalid_command() -> Self {
        Self::new(ErrorKind::InvalidCommand, "Invalid command")
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Serialize into the wire dictionary form.
    pub fn to_wire(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            json!({
                "error_type": self.kind.as_str(),
                "message": self.message,
                "details": {},
            })
        })
    }

    /// Rebuild from a wire dictionary. A payload that does not match the
    /// taxonomy (unknown kind, missing fields) degrades to
    /// `UNKNOWN_ERROR` rather than failing the caller.
    pub fn from_wire(value: Value) -> Self {
        match serde_json::from_value::<StructuredError>(value.clone()) {
            Ok(err) => err,
            Err(_) => Self::unknown(format!("unrecognized error payload: {value}")),
        }
    }
}

impl From<std::io::Error> for StructuredError {
    fn from(source: std::io::Error) -> Self {
        Self::connection(source.to_string())
    }
}
