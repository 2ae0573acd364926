//! Length-framed JSON wire protocol spoken between broker and clients.
//!
//! Every frame is a 4-byte big-endian length prefix followed by exactly
//! that many bytes of UTF-8 JSON. Requests and responses are closed
//! enums so dispatch is exhaustively matched; adding a command is a
//! compile-time-checked change.

use crate::errors::StructuredError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload. A length prefix beyond this is
/// treated as a corrupt stream, not an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One tool as advertised by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// One failed provider in a `get_tools` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub server: String,
    pub error: StructuredError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    CallTool {
        tool_name: String,
        #[serde(default)]
        arguments: Value,
    },
    GetTools,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
}

/// Response frames. The three shapes share the `status` discriminator
/// but differ in their remaining fields, so they deserialize untagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    ToolList {
        status: Status,
        tools: Vec<ToolDescriptor>,
        /// Serialized as `null` when no provider failed; clients use it
        /// for partial-availability diagnostics.
        initialization_errors: Option<Vec<ProviderFailure>>,
    },
    ToolResult {
        status: Status,
        result: String,
    },
    Error {
        status: Status,
        error: StructuredError,
    },
}

impl Response {
    pub fn tool_result(result: String) -> Self {
        Response::ToolResult {
            status: Status::Success,
            result,
        }
    }

    pub fn tool_list(tools: Vec<ToolDescriptor>, failures: Vec<ProviderFailure>) -> Self {
        Response::ToolList {
            status: Status::Success,
            tools,
            initialization_errors: if failures.is_empty() {
                None
            } else {
                Some(failures)
            },
        }
    }

    pub fn error(error: StructuredError) -> Self {
        Response::Error {
            status: Status::Error,
            error,
        }
    }
}

/// Encode a frame object into prefix + payload bytes.
pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, StructuredError> {
    let payload = serde_json::to_vec(frame)
        .map_err(|source| StructuredError::unknown(format!("failed to encode frame: {source}")))?;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Parse a frame payload. Callers decide how a decode failure maps into
/// the taxonomy (the server answers `UNKNOWN_ERROR`, clients surface a
/// connection-level failure).
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Serialize and write one frame, flushing before returning.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), StructuredError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode(frame)?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|source| StructuredError::connection(format!("failed to write frame: {source}")))?;
    writer
        .flush()
        .await
        .map_err(|source| StructuredError::connection(format!("failed to flush frame: {source}")))?;
    Ok(())
}

/// Read one frame payload. `Ok(None)` means the peer closed the stream
/// cleanly between frames; closing mid-frame is a `CONNECTION_ERROR`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, StructuredError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader
            .read(&mut len_buf[filled..])
            .await
            .map_err(|source| StructuredError::connection(format!("failed to read frame length: {source}")))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(StructuredError::connection(
                "peer closed the connection inside a frame length prefix",
            ));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(StructuredError::connection(format!(
            "frame length {len} exceeds the {MAX_FRAME_LEN}-byte limit"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|source| {
        if source.kind() == io::ErrorKind::UnexpectedEof {
            StructuredError::connection("peer closed the connection mid-frame")
        } else {
            StructuredError::connection(format!("failed to read frame payload: {source}"))
        }
    })?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use serde_json::json;

    fn frame_json<T: Serialize>(frame: &T) -> Value {
        let bytes = encode(frame).expect("encode");
        let (prefix, payload) = bytes.split_at(4);
        let len = u32::from_be_bytes(prefix.try_into().unwrap()) as usize;
        assert_eq!(len, payload.len());
        serde_json::from_slice(payload).expect("valid JSON payload")
    }

    #[test]
    fn call_tool_request_shape() {
        let request = Request::CallTool {
            tool_name: "get_weather".to_string(),
            arguments: json!({"city": "Jakarta"}),
        };
        assert_eq!(
            frame_json(&request),
            json!({
                "command": "call_tool",
                "tool_name": "get_weather",
                "arguments": {"city": "Jakarta"},
            })
        );
    }

    #[test]
    fn get_tools_request_shape() {
        assert_eq!(frame_json(&Request::GetTools), json!({"command": "get_tools"}));
    }

    #[test]
    fn tool_list_serializes_null_when_no_failures() {
        let response = Response::tool_list(vec![], vec![]);
        let value = frame_json(&response);
        assert_eq!(value["status"], "success");
        assert!(value["initialization_errors"].is_null());
    }

    #[test]
    fn responses_round_trip() {
        let descriptors = vec![ToolDescriptor {
            name: "get_weather".to_string(),
            description: "Current weather by city".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }];
        let failures = vec![ProviderFailure {
            server: "bad".to_string(),
            error: StructuredError::command_not_found("/no/such/binary", vec![]),
        }];

        for response in [
            Response::tool_result("42".to_string()),
            Response::tool_list(descriptors, failures),
            Response::error(StructuredError::invalid_command()),
        ] {
            let bytes = encode(&response).expect("encode");
            let decoded: Response = decode(&bytes[4..]).expect("decode");
            assert_eq!(response, decoded);
        }
    }

    #[test]
    fn requests_round_trip() {
        for request in [
            Request::CallTool {
                tool_name: "echo".to_string(),
                arguments: json!({}),
            },
            Request::GetTools,
        ] {
            let bytes = encode(&request).expect("encode");
            let decoded: Request = decode(&bytes[4..]).expect("decode");
            assert_eq!(request, decoded);
        }
    }

    #[tokio::test]
    async fn read_frame_returns_none_on_clean_close() {
        let mut stream: &[u8] = &[];
        assert!(read_frame(&mut stream).await.expect("clean close").is_none());
    }

    #[tokio::test]
    async fn read_frame_reports_truncation() {
        let bytes = encode(&Request::GetTools).expect("encode");
        let mut truncated: &[u8] = &bytes[..bytes.len() - 3];
        let err = read_frame(&mut truncated).await.expect_err("mid-frame close");
        assert_eq!(err.kind, ErrorKind::Connection);

        let mut short_prefix: &[u8] = &bytes[..2];
        let err = read_frame(&mut short_prefix).await.expect_err("short prefix");
        assert_eq!(err.kind, ErrorKind::Connection);
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_lengths() {
        let mut bytes = u32::MAX.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        let mut stream: &[u8] = &bytes;
        let err = read_frame(&mut stream).await.expect_err("oversized frame");
        assert_eq!(err.kind, ErrorKind::Connection);
    }

    #[tokio::test]
    async fn read_frame_yields_full_payload() {
        let request = Request::CallTool {
            tool_name: "echo".to_string(),
            arguments: json!({"text": "hello"}),
        };
        let bytes = encode(&request).expect("encode");
        let mut stream: &[u8] = &bytes;
        let payload = read_frame(&mut stream)
            .await
            .expect("read")
            .expect("one frame");
        let decoded: Request = decode(&payload).expect("decode");
        assert_eq!(decoded, request);
    }
}
