//! End-to-end broker tests over real loopback TCP: an in-process
//! server with injected provider capabilities, talked to through both
//! the typed client and raw framed sockets.

use async_trait::async_trait;
use mcp_broker::client::{BrokerClient, ConnectOptions};
use mcp_broker::errors::{ErrorKind, StructuredError};
use mcp_broker::protocol::{self, Request, ToolDescriptor};
use mcp_broker::provider::{CapabilityError, ProviderCapability, ProviderSession};
use mcp_broker::registry::{BrokerRegistry, ProviderSlot};
use mcp_broker::server::BrokerServer;
use mcp_broker::supervisor::ServerSupervisor;
use serde_json::{Value, json};
use serial_test::serial;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

/// A provider capability that answers from memory, optionally slowly.
struct MockProvider {
    label: &'static str,
    tools: Vec<&'static str>,
    delay: Duration,
}

impl MockProvider {
    fn new(label: &'static str, tools: Vec<&'static str>) -> Self {
        Self {
            label,
            tools,
            delay: Duration::ZERO,
        }
    }

    fn slow(label: &'static str, tools: Vec<&'static str>, delay: Duration) -> Self {
        Self {
            label,
            tools,
            delay,
        }
    }
}

#[async_trait]
impl ProviderCapability for MockProvider {
    async fn initialize(&self) -> Result<(), CapabilityError> {
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, CapabilityError> {
        Ok(self
            .tools
            .iter()
            .map(|name| ToolDescriptor {
                name: name.to_string(),
                description: format!("{name} from {}", self.label),
                input_schema: json!({"type": "object", "properties": {}}),
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, _arguments: Value) -> Result<Value, CapabilityError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Value::String(format!("{}::{name}", self.label)))
    }

    async fn close(&self) -> Result<(), CapabilityError> {
        Ok(())
    }
}

async fn ready_slot(name: &str, provider: MockProvider) -> (String, ProviderSlot) {
    let session = ProviderSession::from_capability(name.to_string(), Arc::new(provider))
        .await
        .expect("mock session is ready");
    (name.to_string(), ProviderSlot::Ready(session))
}

fn failed_slot(name: &str, error: StructuredError) -> (String, ProviderSlot) {
    (name.to_string(), ProviderSlot::Failed(error))
}

/// Bind an in-process broker on an ephemeral port. The returned sender
/// triggers graceful shutdown.
async fn start_broker(registry: BrokerRegistry) -> (SocketAddr, oneshot::Sender<()>) {
    let server = BrokerServer::bind(Arc::new(registry), "127.0.0.1", 0)
        .await
        .expect("bind ephemeral port");
    let addr = server.local_addr().expect("local addr");
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        server
            .run_until(async {
                let _ = rx.await;
            })
            .await;
    });
    (addr, tx)
}

#[tokio::test]
async fn get_tools_reports_partial_availability() {
    // One good provider next to one whose command does not exist.
    let registry = BrokerRegistry::from_slots(vec![
        ready_slot("good", MockProvider::new("good", vec!["echo", "reverse"])).await,
        failed_slot(
            "bad",
            StructuredError::command_not_found("/no/such/binary", vec!["/usr/bin".to_string()]),
        ),
    ]);
    let (addr, shutdown) = start_broker(registry).await;

    let mut client = BrokerClient::connect("127.0.0.1", addr.port())
        .await
        .expect("connect");
    let (tools, failures) = client.get_tools().await.expect("get_tools");

    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["echo", "reverse"]);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].server, "bad");
    assert_eq!(failures[0].error.kind, ErrorKind::CommandNotFound);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn get_tools_with_no_failures_sends_null_errors() {
    let registry =
        BrokerRegistry::from_slots(vec![
            ready_slot("only", MockProvider::new("only", vec!["echo"])).await,
        ]);
    let (addr, shutdown) = start_broker(registry).await;

    // Raw socket so the null vs absent distinction is visible.
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    protocol::write_frame(&mut stream, &Request::GetTools)
        .await
        .expect("send");
    let payload = protocol::read_frame(&mut stream)
        .await
        .expect("read")
        .expect("one frame");
    let value: Value = serde_json::from_slice(&payload).expect("json");
    assert_eq!(value["status"], "success");
    assert!(value["initialization_errors"].is_null());
    assert_eq!(value["tools"][0]["name"], "echo");
    assert!(value["tools"][0]["inputSchema"].is_object());

    let _ = shutdown.send(());
}

#[tokio::test]
async fn unknown_tool_yields_tool_execution_error() {
    let registry =
        BrokerRegistry::from_slots(vec![
            ready_slot("only", MockProvider::new("only", vec!["echo"])).await,
        ]);
    let (addr, shutdown) = start_broker(registry).await;

    let mut client = BrokerClient::connect("127.0.0.1", addr.port())
        .await
        .expect("connect");
    let err = client
        .call_tool("nonexistent", json!({}))
        .await
        .expect_err("no such tool");
    assert_eq!(err.kind, ErrorKind::ToolExecution);
    assert_eq!(err.message, "Tool not found");
    assert_eq!(err.details["tool_name"], "nonexistent");

    let _ = shutdown.send(());
}

#[tokio::test]
async fn routing_prefers_the_first_configured_provider() {
    let registry = BrokerRegistry::from_slots(vec![
        ready_slot("first", MockProvider::new("first", vec!["dup", "only_first"])).await,
        ready_slot("second", MockProvider::new("second", vec!["dup", "only_second"])).await,
    ]);
    let (addr, shutdown) = start_broker(registry).await;

    let mut client = BrokerClient::connect("127.0.0.1", addr.port())
        .await
        .expect("connect");

    assert_eq!(
        client.call_tool("dup", json!({})).await.expect("dup"),
        "first::dup"
    );
    assert_eq!(
        client
            .call_tool("only_second", json!({}))
            .await
            .expect("only_second"),
        "second::only_second"
    );

    let _ = shutdown.send(());
}

#[tokio::test]
async fn concurrent_calls_do_not_block_each_other() {
    let registry = BrokerRegistry::from_slots(vec![
        ready_slot(
            "slow",
            MockProvider::slow("slow", vec!["ponder"], Duration::from_millis(300)),
        )
        .await,
        ready_slot("fast", MockProvider::new("fast", vec!["echo"])).await,
    ]);
    let (addr, shutdown) = start_broker(registry).await;

    let mut slow_client = BrokerClient::connect("127.0.0.1", addr.port())
        .await
        .expect("connect slow");
    let mut fast_client = BrokerClient::connect("127.0.0.1", addr.port())
        .await
        .expect("connect fast");

    let slow_call = async {
        let result = slow_client.call_tool("ponder", json!({})).await;
        (Instant::now(), result)
    };
    let fast_call = async {
        let result = fast_client.call_tool("echo", json!({})).await;
        (Instant::now(), result)
    };

    let ((slow_done, slow_result), (fast_done, fast_result)) =
        tokio::join!(slow_call, fast_call);

    assert_eq!(slow_result.expect("slow result"), "slow::ponder");
    assert_eq!(fast_result.expect("fast result"), "fast::echo");
    // The fast provider must finish while the slow one is still working.
    assert!(fast_done < slow_done);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn malformed_payload_keeps_the_connection_usable() {
    // A well-formed frame whose payload is not JSON.
    let registry =
        BrokerRegistry::from_slots(vec![
            ready_slot("only", MockProvider::new("only", vec!["echo"])).await,
        ]);
    let (addr, shutdown) = start_broker(registry).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let garbage = b"this is not json";
    stream
        .write_all(&(garbage.len() as u32).to_be_bytes())
        .await
        .expect("prefix");
    stream.write_all(garbage).await.expect("payload");
    stream.flush().await.expect("flush");

    let payload = protocol::read_frame(&mut stream)
        .await
        .expect("read")
        .expect("error frame");
    let value: Value = serde_json::from_slice(&payload).expect("json");
    assert_eq!(value["status"], "error");
    assert_eq!(value["error"]["error_type"], "UNKNOWN_ERROR");

    // The same connection must still serve the next request.
    protocol::write_frame(&mut stream, &Request::GetTools)
        .await
        .expect("send");
    let payload = protocol::read_frame(&mut stream)
        .await
        .expect("read")
        .expect("tools frame");
    let value: Value = serde_json::from_slice(&payload).expect("json");
    assert_eq!(value["status"], "success");

    let _ = shutdown.send(());
}

#[tokio::test]
async fn unrecognized_command_is_invalid_command() {
    let registry = BrokerRegistry::from_slots(vec![]);
    let (addr, shutdown) = start_broker(registry).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let request = br#"{"command": "reboot"}"#;
    stream
        .write_all(&(request.len() as u32).to_be_bytes())
        .await
        .expect("prefix");
    stream.write_all(request).await.expect("payload");

    let payload = protocol::read_frame(&mut stream)
        .await
        .expect("read")
        .expect("error frame");
    let value: Value = serde_json::from_slice(&payload).expect("json");
    assert_eq!(value["status"], "error");
    assert_eq!(value["error"]["error_type"], "INVALID_COMMAND");

    let _ = shutdown.send(());
}

#[tokio::test]
async fn requests_on_one_connection_are_answered_in_order() {
    let registry = BrokerRegistry::from_slots(vec![
        ready_slot(
            "slow",
            MockProvider::slow("slow", vec!["ponder"], Duration::from_millis(200)),
        )
        .await,
        ready_slot("fast", MockProvider::new("fast", vec!["echo"])).await,
    ]);
    let (addr, shutdown) = start_broker(registry).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");

    // Pipeline a slow call ahead of a fast one; responses must come
    // back in request order, not completion order.
    for request in [
        Request::CallTool {
            tool_name: "ponder".to_string(),
            arguments: json!({}),
        },
        Request::CallTool {
            tool_name: "echo".to_string(),
            arguments: json!({}),
        },
    ] {
        protocol::write_frame(&mut stream, &request)
            .await
            .expect("send");
    }

    let mut results = Vec::new();
    for _ in 0..2 {
        let payload = protocol::read_frame(&mut stream)
            .await
            .expect("read")
            .expect("frame");
        let value: Value = serde_json::from_slice(&payload).expect("json");
        results.push(value["result"].as_str().expect("string result").to_string());
    }
    assert_eq!(results, vec!["slow::ponder", "fast::echo"]);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn auto_start_failure_yields_no_client() {
    let options = ConnectOptions {
        host: "127.0.0.1".to_string(),
        port: 1,
        auto_start: true,
        program: Some("/no/such/broker-binary".into()),
        config: None,
    };
    assert!(BrokerClient::ensure_connected(options).await.is_none());
}

#[tokio::test]
#[serial]
async fn auto_start_brings_up_a_broker_and_stop_tears_it_down() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = dir.path().join("mcp_config.json");
    std::fs::write(&config, r#"{"mcpServers": {}}"#).expect("write config");

    // Reserve a free port for the spawned broker.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("probe port");
    let port = probe.local_addr().expect("addr").port();
    drop(probe);

    let program = std::path::PathBuf::from(env!("CARGO_BIN_EXE_mcp-broker"));
    let options = ConnectOptions {
        host: "127.0.0.1".to_string(),
        port,
        auto_start: true,
        program: Some(program.clone()),
        config: Some(config.clone()),
    };
    let mut client = BrokerClient::ensure_connected(options)
        .await
        .expect("broker auto-starts");
    let (tools, failures) = client.get_tools().await.expect("get_tools");
    assert!(tools.is_empty());
    assert!(failures.is_empty());
    drop(client);

    // Stop the running broker, then stop again once it is down.
    let mut supervisor = ServerSupervisor::new("127.0.0.1", port).with_program(program);
    assert_eq!(
        supervisor.stop_server().await.expect("graceful stop"),
        "Server stopped successfully"
    );
    assert_eq!(
        supervisor.stop_server().await.expect("stop when already down"),
        "Server is not running"
    );
}

#[tokio::test]
async fn connect_without_auto_start_fails_cleanly_when_down() {
    let err = BrokerClient::connect("127.0.0.1", 1)
        .await
        .err()
        .expect("no broker on port 1");
    assert_eq!(err.kind, ErrorKind::Connection);
}
