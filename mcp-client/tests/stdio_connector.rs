//! Exercises a `Connector` over the stdio transport against a tiny fake
//! MCP server written as a shell one-liner, so the test has no
//! dependency on any real MCP server binary being installed.

use std::collections::HashMap;
use std::time::Duration;

use switchboard_mcp_client::Connector;
use switchboard_mcp_client::ServerConfig;
use switchboard_mcp_client::Timeouts;

/// Reads two newline-delimited JSON-RPC requests and answers `initialize`
/// then `tools/list` with a single `echo` tool.
fn fake_server_script() -> String {
    let init_resp = r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"fake","version":"0"}}}"#;
    let list_resp = r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}]}}"#;
    format!("read _; echo '{init_resp}'; read _; echo '{list_resp}'")
}

fn fake_server_config() -> ServerConfig {
    ServerConfig::Stdio {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), fake_server_script()],
        env: HashMap::new(),
        cwd: None,
    }
}

#[tokio::test]
async fn stdio_connector_discovers_tools_from_a_fake_server() {
    let connector = Connector::new("fake", fake_server_config(), Timeouts::default());
    connector.start().await.expect("fake server should start");
    let tools = connector.discover().await.expect("discover should succeed");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");
    assert_eq!(tools[0].input_schema.required_names(), vec!["text".to_string()]);
    connector.close().await.expect("close should succeed");
}

#[tokio::test]
async fn stdio_connector_call_against_a_server_with_no_call_handler_times_out_gracefully() {
    // The fake server only answers two requests; a third `tools/call`
    // is left unanswered, so the call should surface a timeout rather
    // than hang the test.
    let connector = Connector::new("fake", fake_server_config(), Timeouts::default());
    connector.start().await.unwrap();
    connector.discover().await.unwrap();
    let result = connector
        .call("echo", Some(serde_json::json!({"text": "hi"})), Some(Duration::from_millis(200)))
        .await;
    assert!(result.is_err());
    connector.close().await.unwrap();
}
