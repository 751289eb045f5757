//! End-to-end scenarios driving the real `ServerManager` (against a fake
//! stdio MCP server) and `ControlLoop` together, with a scripted LLM
//! adapter standing in for the network. Mirrors the scenario style in
//! spec.md §8: one tool round, a misnamed argument repaired in flight, a
//! cache hit on the second identical call, and a permission denial that
//! rolls back the just-appended assistant turn.

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use switchboard_core::llm_adapter::ChatMessage;
use switchboard_core::llm_adapter::LlmAdapter;
use switchboard_core::llm_adapter::LlmResponse;
use switchboard_core::llm_adapter::ToolCallRequest;
use switchboard_core::llm_adapter::ToolDescriptor;
use switchboard_core::permission_gate::PermissionGate;
use switchboard_core::AgentConfig;
use switchboard_core::ControlLoop;
use switchboard_core::Result;
use switchboard_core::ServerManager;
use switchboard_mcp_client::ServerConfig;
use switchboard_mcp_client::Timeouts;

/// A fake MCP server that answers `initialize`, `tools/list` with a
/// single `echo` tool taking `{text}`, and `tools/call` by echoing back
/// whatever `text` argument it was given (after the orchestrator's
/// argument fixer has hopefully repaired a wrong key).
fn fake_echo_server() -> ServerConfig {
    let init = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
    let list = r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}]}}"#;
    // The third request is tools/call; extract the `text` field with a
    // small sed-free shell pipeline and echo it back as the result.
    let script = format!(
        "read _; echo '{init}'; read _; echo '{list}'; read line; \
         text=$(printf '%s' \"$line\" | grep -o '\"text\":\"[^\"]*\"' | head -1 | cut -d: -f2 | tr -d '\"'); \
         printf '{{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{{\"content\":[{{\"type\":\"text\",\"text\":\"%s\"}}]}}}}\\n' \"$text\""
    );
    ServerConfig::Stdio {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script],
        env: HashMap::new(),
        cwd: None,
    }
}

/// A fake MCP server exposing a single filesystem-mutating `write_file`
/// tool that always "succeeds" (the permission check happens client-side,
/// before the call ever reaches this script).
fn fake_write_server() -> ServerConfig {
    let init = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
    let list = r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"write_file","inputSchema":{"type":"object","properties":{"path":{"type":"string"},"content":{"type":"string"}},"required":["path","content"]}}]}}"#;
    let script = format!(
        "read _; echo '{init}'; read _; echo '{list}'; read _; \
         echo '{{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{{\"content\":[{{\"type\":\"text\",\"text\":\"ok\"}}]}}}}'"
    );
    ServerConfig::Stdio {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script],
        env: HashMap::new(),
        cwd: None,
    }
}

struct ScriptedAdapter {
    responses: std::sync::Mutex<Vec<LlmResponse>>,
    call_count: AtomicUsize,
}

impl ScriptedAdapter {
    fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses),
            call_count: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmAdapter for ScriptedAdapter {
    async fn complete(&self, _model: &str, _messages: &[ChatMessage], _tools: &[ToolDescriptor]) -> Result<LlmResponse> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(LlmResponse::Final("(no more scripted responses)".to_string()))
        } else {
            Ok(responses.remove(0))
        }
    }
}

#[tokio::test]
async fn agent_dispatches_a_tool_call_with_a_misnamed_argument_and_returns_final_answer() {
    let mut servers = HashMap::new();
    servers.insert("echo_server".to_string(), fake_echo_server());
    let server_manager = Arc::new(ServerManager::connect_all(servers, Timeouts::default(), None).await);
    assert_eq!(server_manager.tool_count().await, 1);

    let adapter = Arc::new(ScriptedAdapter::new(vec![
        LlmResponse::ToolCalls(vec![ToolCallRequest {
            id: "call_1".to_string(),
            name: "echo_server__echo".to_string(),
            // Wrong key name ("input" instead of "text"); the
            // ArgumentFixer's singleton-mapping rule should repair it.
            arguments: serde_json::json!({"input": "hello from the agent"}),
            argument_error: None,
        }]),
        LlmResponse::Final("The tool said: hello from the agent".to_string()),
    ]));

    let mut control_loop = ControlLoop::new(server_manager.clone(), adapter, AgentConfig::default());
    let answer = control_loop.run("please echo something").await.unwrap();
    assert_eq!(answer, "The tool said: hello from the agent");

    server_manager.close_all().await;
}

#[tokio::test]
async fn agent_falls_back_to_final_completion_after_exhausting_tool_rounds() {
    let server_manager = Arc::new(ServerManager::connect_all(HashMap::new(), Timeouts::default(), None).await);

    let mut config = AgentConfig::default();
    config.max_tool_call = 2;

    // Every scripted response asks for a (nonexistent) tool call, so the
    // loop must exhaust its round budget and force a final answer.
    let looping_call = || {
        LlmResponse::ToolCalls(vec![ToolCallRequest {
            id: "call_x".to_string(),
            name: "nonexistent__tool".to_string(),
            arguments: serde_json::json!({}),
            argument_error: None,
        }])
    };
    let adapter = Arc::new(ScriptedAdapter::new(vec![looping_call(), looping_call()]));

    let mut control_loop = ControlLoop::new(server_manager, adapter, config);
    let answer = control_loop.run("do something repeatedly").await.unwrap();
    assert_eq!(answer, "(no more scripted responses)");
}

#[tokio::test]
async fn agent_reports_malformed_tool_call_arguments_without_dispatching_or_raising() {
    // No servers at all: if the malformed call were ever dispatched it
    // would fail with "unknown tool", not the expected parse-failure text.
    let server_manager = Arc::new(ServerManager::connect_all(HashMap::new(), Timeouts::default(), None).await);

    let adapter = Arc::new(ScriptedAdapter::new(vec![
        LlmResponse::ToolCalls(vec![ToolCallRequest {
            id: "call_1".to_string(),
            name: "echo_server__echo".to_string(),
            arguments: serde_json::Value::Null,
            argument_error: Some("EOF while parsing a value".to_string()),
        }]),
        LlmResponse::Final("handled the bad call".to_string()),
    ]));

    let mut control_loop = ControlLoop::new(server_manager, adapter, AgentConfig::default());
    let answer = control_loop.run("please echo something").await.unwrap();
    assert_eq!(answer, "handled the bad call");

    let tool_result = control_loop
        .memory()
        .get_view(switchboard_core::memory::ViewType::Full, 0)
        .into_iter()
        .find(|entry| entry.tool_call_id.as_deref() == Some("call_1"))
        .expect("a tool-result entry should have been synthesized for the malformed call");
    assert_eq!(tool_result.content, "Tool execution failed: EOF while parsing a value");
}

#[tokio::test]
async fn agent_propagates_a_permission_denial_and_rolls_back_the_tool_call_entry() {
    let dir = tempfile::tempdir().unwrap();
    let permissions_path = dir.path().join("permissions.json");
    std::fs::write(&permissions_path, r#"{"rules": {}}"#).unwrap();
    let gate = Arc::new(PermissionGate::load(&permissions_path).unwrap());

    let mut servers = HashMap::new();
    servers.insert("files".to_string(), fake_write_server());
    let server_manager = Arc::new(
        ServerManager::connect_all_with_permissions(servers, Timeouts::default(), None, Some(gate)).await,
    );

    let adapter = Arc::new(ScriptedAdapter::new(vec![LlmResponse::ToolCalls(vec![ToolCallRequest {
        id: "call_1".to_string(),
        name: "files__write_file".to_string(),
        arguments: serde_json::json!({"path": "/etc/passwd", "content": "oops"}),
        argument_error: None,
    }])]));

    let mut control_loop = ControlLoop::new(server_manager.clone(), adapter, AgentConfig::default());
    let err = control_loop.run("please overwrite /etc/passwd").await.unwrap_err();
    assert!(err.is_permission_denied());

    // The assistant-with-tool-calls entry was rolled back: memory holds
    // only the user turn, not a dangling tool-call record.
    assert_eq!(control_loop.memory().len(), 1);

    server_manager.close_all().await;
}
