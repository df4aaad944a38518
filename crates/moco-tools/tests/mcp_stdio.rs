//! End-to-end tests for the MCP stdio client against a scripted server.
//!
//! The fake server is a small `sh` script that answers the handshake and a
//! few tools by pattern-matching request lines. `slow` answers from a
//! background job, so later calls can be answered before it. `sh` is added to the
//! launcher allow-list for these tests only.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use moco_tools::mcp::McpClient;
use moco_tools::{McpServerConfig, ToolErrorKind, ToolGateway};
use serde_json::json;

const FAKE_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo back","inputSchema":{"type":"object"}},{"name":"slow","description":"Sleeps"},{"name":"fail","description":"Always fails"}]}}\n' "$id" ;;
    *'"name":"slow"'*)
      ( sleep 1
        printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"late"}]}}\n' "$id" ) & ;;
    *'"name":"fail"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"boom"}],"isError":true}}\n' "$id" ;;
    *'"name":"echo"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echoed"}]}}\n' "$id" ;;
  esac
done
"#;

fn write_server(dir: &Path) -> String {
    let path = dir.join("fake_mcp.sh");
    std::fs::write(&path, FAKE_SERVER).unwrap();
    path.to_string_lossy().into_owned()
}

fn client() -> McpClient {
    McpClient::new(Duration::from_secs(5)).with_allowed_commands(vec!["sh".into()])
}

// ── discovery ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_lists_namespaced_tools() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_server(dir.path());
    let client = client();

    let report = client
        .connect(&[McpServerConfig::stdio("fake", "sh", vec![script])])
        .await;
    assert!(report.is_complete(), "{:?}", report.failed);
    assert_eq!(report.connected, vec![("fake".to_string(), 3)]);

    let defs = client.tool_definitions().await;
    let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["fake__echo", "fake__fail", "fake__slow"]);
    assert!(defs[0].description.starts_with("[MCP:fake] "));
    assert_eq!(client.connected_servers().await, vec!["fake".to_string()]);
    assert_eq!(client.server_tools("fake").await.unwrap().len(), 3);

    client.disconnect().await;
    assert!(client.tool_definitions().await.is_empty());
    client.disconnect().await;
}

#[tokio::test]
async fn one_bad_server_does_not_block_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_server(dir.path());
    let client = client();

    let report = client
        .connect(&[
            McpServerConfig::stdio("broken", "sh", vec!["/nonexistent/script.sh".into()]),
            McpServerConfig::stdio("fake", "sh", vec![script]),
        ])
        .await;

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "broken");
    assert_eq!(report.connected.len(), 1);
    assert!(client.has_tool("fake__echo").await);
    client.disconnect().await;
}

// ── calls ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn timed_out_call_does_not_poison_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_server(dir.path());
    let client = client();
    client
        .connect(&[McpServerConfig::stdio("fake", "sh", vec![script])])
        .await;

    let slow = client
        .call_tool("c1", "fake__slow", json!({}), Duration::from_millis(100))
        .await;
    assert!(!slow.success);
    assert_eq!(slow.error_kind, Some(ToolErrorKind::Timeout));

    // The late "slow" reply has nobody waiting for it and must be discarded.
    let echo = client
        .call_tool("c2", "fake__echo", json!({"x": 1}), Duration::from_secs(5))
        .await;
    assert!(echo.success, "{}", echo.content);
    assert_eq!(echo.content, "echoed");
    assert_eq!(echo.tool_call_id, "c2");

    client.disconnect().await;
}

#[tokio::test]
async fn overlapping_calls_share_one_connection() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_server(dir.path());
    let client = client();
    client
        .connect(&[McpServerConfig::stdio("fake", "sh", vec![script])])
        .await;

    let start = Instant::now();
    let slow = client.call_tool("c1", "fake__slow", json!({}), Duration::from_secs(5));
    let echo = async {
        let result = client
            .call_tool("c2", "fake__echo", json!({}), Duration::from_secs(5))
            .await;
        (result, start.elapsed())
    };
    let (slow, (echo, echo_took)) = tokio::join!(slow, echo);

    // The echo reply overtakes the slow one instead of queueing behind it.
    assert!(echo_took < Duration::from_millis(900), "{echo_took:?}");
    assert_eq!((echo.tool_call_id.as_str(), echo.content.as_str()), ("c2", "echoed"));
    assert!(slow.success, "{}", slow.content);
    assert_eq!((slow.tool_call_id.as_str(), slow.content.as_str()), ("c1", "late"));

    client.disconnect().await;
}

#[tokio::test]
async fn server_side_error_is_an_execution_failure() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_server(dir.path());
    let client = Arc::new(client());
    client
        .connect(&[McpServerConfig::stdio("fake", "sh", vec![script])])
        .await;

    let gateway = ToolGateway::default().with_mcp(Arc::clone(&client));
    let result = gateway.invoke("c1", "fake__fail", json!({}), None).await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ToolErrorKind::Execution));
    assert!(result.content.contains("boom"));

    let ok = gateway.invoke("c2", "fake__echo", json!({}), None).await;
    assert!(ok.success);

    client.disconnect().await;
    let gone = gateway.invoke("c3", "fake__echo", json!({}), None).await;
    assert_eq!(gone.error_kind, Some(ToolErrorKind::NotFound));
}
