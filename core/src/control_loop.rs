//! The reason-act loop: ask the LLM, dispatch whatever tools it asked
//! for, feed results back, repeat until it gives a final answer or the
//! round budget runs out.
//!
//! Grounded on `examples/original_source/agents/mcp_agent.py`'s
//! `_process_query_async` for the round structure and the
//! rollback-on-permission-denial behavior, and on
//! `examples/ya-luotao-codex/codex-rs/core/src/tools/executor.rs` for
//! dispatching a round's tool calls concurrently while preserving their
//! original order in the appended results.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::warn;

use crate::config::AgentConfig;
use crate::config::MemoryViewType;
use crate::error::Result;
use crate::error::SwitchboardError;
use crate::llm_adapter::ChatMessage;
use crate::llm_adapter::LlmAdapter;
use crate::llm_adapter::LlmResponse;
use crate::llm_adapter::ToolCallRequest;
use crate::llm_adapter::ToolDescriptor;
use crate::memory::Memory;
use crate::memory::MemoryEntry;
use crate::memory::Role;
use crate::memory::ViewType;
use crate::server_manager::ServerManager;

fn view_type_from_config(memory_view: crate::config::MemoryViewType) -> ViewType {
    match memory_view {
        MemoryViewType::Full => ViewType::Full,
        MemoryViewType::ChatMessages => ViewType::ChatMessages,
    }
}

fn to_chat_message(entry: &MemoryEntry) -> ChatMessage {
    ChatMessage {
        role: match entry.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
        .to_string(),
        content: entry.content.clone(),
        tool_call_id: entry.tool_call_id.clone(),
        tool_calls: entry.tool_calls.clone(),
    }
}

/// Creates a cancellation channel for a `ControlLoop`: the sender is held
/// by whoever installs the interrupt handler (the CLI's Ctrl-C listener);
/// the receiver is handed to `ControlLoop::with_cancel`. Starts at
/// `false` (not cancelled).
pub fn cancellation_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Agent state for a single conversation: its memory, and shared handles
/// to the tool-calling infrastructure and the LLM backend.
pub struct ControlLoop {
    server_manager: Arc<ServerManager>,
    llm: Arc<dyn LlmAdapter>,
    config: AgentConfig,
    memory: Memory,
    cancel: watch::Receiver<bool>,
}

impl ControlLoop {
    pub fn new(server_manager: Arc<ServerManager>, llm: Arc<dyn LlmAdapter>, config: AgentConfig) -> Self {
        let (_tx, rx) = cancellation_channel();
        Self::with_cancel(server_manager, llm, config, rx)
    }

    /// Like `new`, but wired to an externally-held cancellation signal
    /// (see `cancellation_channel`) so a caller can interrupt a run that
    /// is already in progress.
    pub fn with_cancel(
        server_manager: Arc<ServerManager>,
        llm: Arc<dyn LlmAdapter>,
        config: AgentConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let memory = Memory::new(config.system_prompt.clone());
        Self {
            server_manager,
            llm,
            config,
            memory,
            cancel,
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn set_model(&mut self, model_name: String) {
        self.config.model_name = model_name;
    }

    pub fn set_max_tool_call(&mut self, max_tool_call: u32) {
        self.config.max_tool_call = max_tool_call;
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    async fn tool_descriptors(&self) -> Vec<ToolDescriptor> {
        self.server_manager
            .list_tools()
            .await
            .into_iter()
            .map(|spec| ToolDescriptor {
                name: spec.qualified_name.clone(),
                description: spec.description.clone().unwrap_or_default(),
                parameters: serde_json::to_value(&spec.tool.input_schema).unwrap_or(Value::Null),
            })
            .collect()
    }

    fn current_messages(&self) -> Vec<ChatMessage> {
        self.memory
            .get_view(view_type_from_config(self.config.memory_view.0), self.config.max_history_entries)
            .into_iter()
            .map(to_chat_message)
            .collect()
    }

    /// Runs the agent on one user turn: appends `user_input`, loops
    /// rounds of (LLM call -> tool dispatch) until a final answer or the
    /// round budget is exhausted, and returns that answer. The returned
    /// text is also the last entry appended to memory.
    pub async fn run(&mut self, user_input: &str) -> Result<String> {
        self.memory.add(MemoryEntry::user(user_input));

        for _round in 0..self.config.max_tool_call {
            if self.is_cancelled() {
                return self.handle_cancellation().await;
            }

            let tools = self.tool_descriptors().await;
            let messages = self.current_messages();
            let response = tokio::select! {
                response = self.llm.complete(&self.config.model_name, &messages, &tools) => response?,
                _ = self.cancel.changed() => return self.handle_cancellation().await,
            };

            match response {
                LlmResponse::Final(text) => {
                    self.memory.add(MemoryEntry::assistant(text.clone()));
                    return Ok(text);
                }
                LlmResponse::ToolCalls(calls) => {
                    self.memory
                        .add(MemoryEntry::assistant_with_tool_calls(serde_json::to_value(&calls).unwrap_or(Value::Null)));

                    match self.dispatch_round(&calls).await {
                        RoundOutcome::Results(results) => {
                            if self.is_cancelled() {
                                return self.handle_cancellation().await;
                            }
                            for (call, result) in calls.iter().zip(results) {
                                let text = match result {
                                    Ok(value) => value,
                                    Err(err) => format!("Error: {err}"),
                                };
                                self.memory.add(MemoryEntry::tool_result(call.id.clone(), text));
                            }
                        }
                        RoundOutcome::Denied(err) => {
                            // Roll back the just-appended assistant-with-tool-calls
                            // entry so a retry after the user grants access
                            // doesn't leave a dangling tool-call record, then
                            // propagate the denial so the caller can prompt
                            // for authorization instead of treating this as
                            // an ordinary answer.
                            if matches!(self.memory.last().map(|e| e.role), Some(Role::Assistant)) {
                                self.memory.pop();
                            }
                            return Err(err);
                        }
                    }
                }
            }
        }

        let messages = self.current_messages();
        let text = self.llm.complete_final(&self.config.model_name, &messages).await?;
        self.memory.add(MemoryEntry::assistant(text.clone()));
        Ok(text)
    }

    /// A user interrupt cancels the in-flight LLM call, stops the round
    /// loop, and closes every MCP server connection. Cache writes already
    /// committed by earlier rounds are left intact.
    async fn handle_cancellation(&mut self) -> Result<String> {
        self.server_manager.close_all().await;
        let message = "Cancelled.".to_string();
        self.memory.add(MemoryEntry::assistant(message.clone()));
        Ok(message)
    }

    /// Dispatches every call in a round concurrently, placing each
    /// result at its original index once all complete. Short-circuits to
    /// `RoundOutcome::Denied` the moment any call comes back as a
    /// permission denial, matching the Python reference's rollback.
    async fn dispatch_round(&self, calls: &[ToolCallRequest]) -> RoundOutcome {
        let mut slots: Vec<Option<Result<String>>> = (0..calls.len()).map(|_| None).collect();

        let mut join_set: JoinSet<(usize, Result<String>)> = JoinSet::new();
        for (index, call) in calls.iter().enumerate() {
            // Arguments that never parsed as JSON never reach a server:
            // synthesize the failure text directly, matching the Python
            // reference's "don't raise, report" handling of malformed
            // tool-call arguments.
            if let Some(reason) = &call.argument_error {
                slots[index] = Some(Ok(format!("Tool execution failed: {reason}")));
                continue;
            }
            let server_manager = self.server_manager.clone();
            let name = call.name.clone();
            let arguments = call.arguments.clone();
            join_set.spawn(async move {
                let outcome = server_manager.call_tool(&name, Some(arguments), None).await;
                let rendered = outcome.map(|result| result.first_text().unwrap_or_default().to_string());
                (index, rendered)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(panic_err) => {
                    warn!(error = %panic_err, "tool dispatch task panicked");
                }
            }
        }

        if let Some(index) = slots.iter().position(|slot| matches!(slot, Some(Err(err)) if err.is_permission_denied())) {
            let Some(Err(err)) = slots.remove(index) else {
                unreachable!("position() already confirmed this slot is a permission-denied Err");
            };
            return RoundOutcome::Denied(err);
        }

        RoundOutcome::Results(slots.into_iter().map(|s| s.unwrap_or_else(|| Err(SwitchboardError::Timeout("tool task lost".into())))).collect())
    }
}

enum RoundOutcome {
    Results(Vec<Result<String>>),
    Denied(SwitchboardError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    struct ScriptedAdapter {
        responses: std::sync::Mutex<Vec<LlmResponse>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmAdapter for ScriptedAdapter {
        async fn complete(&self, _model: &str, _messages: &[ChatMessage], _tools: &[ToolDescriptor]) -> Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(LlmResponse::Final("fallback".to_string()))
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    #[tokio::test]
    async fn run_returns_immediate_final_response_without_tool_calls() {
        let servers = std::collections::HashMap::new();
        let server_manager = Arc::new(
            ServerManager::connect_all(servers, switchboard_mcp_client::Timeouts::default(), None).await,
        );
        let adapter = Arc::new(ScriptedAdapter {
            responses: std::sync::Mutex::new(vec![LlmResponse::Final("hi there".to_string())]),
            calls: AtomicUsize::new(0),
        });
        let mut loop_ = ControlLoop::new(server_manager, adapter, AgentConfig::default());
        let answer = loop_.run("hello").await.unwrap();
        assert_eq!(answer, "hi there");
        assert_eq!(loop_.memory().len(), 2); // no system prompt configured: user + assistant
    }

    #[tokio::test]
    async fn run_stops_immediately_when_already_cancelled() {
        let server_manager = Arc::new(
            ServerManager::connect_all(std::collections::HashMap::new(), switchboard_mcp_client::Timeouts::default(), None)
                .await,
        );
        let adapter = Arc::new(ScriptedAdapter {
            responses: std::sync::Mutex::new(vec![LlmResponse::Final("should not be reached".to_string())]),
            calls: AtomicUsize::new(0),
        });
        let (tx, rx) = cancellation_channel();
        tx.send(true).unwrap();
        let mut loop_ = ControlLoop::with_cancel(server_manager, adapter.clone(), AgentConfig::default(), rx);
        let answer = loop_.run("hello").await.unwrap();
        assert_eq!(answer, "Cancelled.");
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }
}
