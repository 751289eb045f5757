//! One [`Connector`] per configured MCP server, regardless of transport.
//!
//! Grounded on `examples/ya-luotao-codex/codex-rs/core/src/mcp_connection_manager.rs`
//! (lazy per-server `initialize` via a once-cell, fixed request ids, the
//! `tools/call` -> `content[0].text` convention) and
//! `examples/original_source/tools/connector.py` (port search + argv
//! rewriting on conflict, SIGTERM-then-SIGKILL shutdown, `mcp-session-id`
//! header propagation, SSE `data: ` unframing).

use std::net::ToSocketAddrs;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::Value;
use switchboard_mcp_types::CallToolParams;
use switchboard_mcp_types::CallToolResult;
use switchboard_mcp_types::ClientCapabilities;
use switchboard_mcp_types::Implementation;
use switchboard_mcp_types::InitializeRequestParams;
use switchboard_mcp_types::JsonRpcRequest;
use switchboard_mcp_types::JsonRpcResponse;
use switchboard_mcp_types::ListToolsResult;
use switchboard_mcp_types::MCP_SCHEMA_VERSION;
use switchboard_mcp_types::RequestId;
use switchboard_mcp_types::Tool;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::sync::Mutex;
use tokio::sync::OnceCell;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ServerConfig;
use crate::config::Timeouts;
use crate::error::ConnectorError;
use crate::error::Result;
use crate::port;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    New,
    Starting,
    Ready,
    Closing,
    Closed,
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectorState::New => "new",
            ConnectorState::Starting => "starting",
            ConnectorState::Ready => "ready",
            ConnectorState::Closing => "closing",
            ConnectorState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

struct StdioTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

struct HttpLikeTransport {
    child: Option<Child>,
    base_url: String,
    client: reqwest::Client,
    session_id: Option<String>,
    /// Whether to speak SSE (`Accept: text/event-stream`) or plain JSON.
    sse: bool,
    /// The resolved port, for the diagnostic free-port check on close.
    port: Option<u16>,
}

enum Transport {
    Stdio(StdioTransport),
    HttpLike(HttpLikeTransport),
}

/// Invariant (spec.md §3): exactly one of {child process, remote URL} is
/// the transport target for a given connector; a `session_id` is present
/// only after a successful `initialize` handshake.
pub struct Connector {
    server_name: String,
    config: ServerConfig,
    timeouts: Timeouts,
    state: RwLock<ConnectorState>,
    transport: Mutex<Option<Transport>>,
    init_cell: OnceCell<()>,
}

fn build_initialize_params() -> InitializeRequestParams {
    InitializeRequestParams {
        protocol_version: MCP_SCHEMA_VERSION.to_string(),
        capabilities: ClientCapabilities {
            elicitation: Some(serde_json::json!({})),
            ..Default::default()
        },
        client_info: Implementation {
            name: "switchboard-mcp-client".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("switchboard".to_string()),
        },
    }
}

impl Connector {
    pub fn new(server_name: impl Into<String>, config: ServerConfig, timeouts: Timeouts) -> Self {
        Self {
            server_name: server_name.into(),
            config,
            timeouts,
            state: RwLock::new(ConnectorState::New),
            transport: Mutex::new(None),
            init_cell: OnceCell::new(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub async fn state(&self) -> ConnectorState {
        *self.state.read().await
    }

    fn startup_err(&self, reason: impl Into<String>) -> ConnectorError {
        ConnectorError::Startup {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }

    /// Launch (or attach to) the server and reach `READY`. Idempotent: a
    /// second call when already `Ready` is a no-op.
    pub async fn start(&self) -> Result<()> {
        {
            let state = self.state.read().await;
            if *state == ConnectorState::Ready {
                return Ok(());
            }
        }
        *self.state.write().await = ConnectorState::Starting;

        let transport = match &self.config {
            ServerConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => self.start_stdio(command, args, env, cwd.as_deref()).await?,
            ServerConfig::Http {
                command,
                args,
                env,
                cwd,
                port,
                endpoint,
            } => {
                self.start_local_http_like(command, args, env, cwd.as_deref(), *port, endpoint, false)
                    .await?
            }
            ServerConfig::Sse {
                command,
                args,
                env,
                cwd,
                port,
                endpoint,
            } => {
                self.start_local_http_like(command, args, env, cwd.as_deref(), *port, endpoint, true)
                    .await?
            }
            ServerConfig::Url { url } => Transport::HttpLike(HttpLikeTransport {
                child: None,
                base_url: url.clone(),
                client: reqwest::Client::new(),
                session_id: None,
                sse: false,
                port: None,
            }),
        };

        *self.transport.lock().await = Some(transport);
        *self.state.write().await = ConnectorState::Ready;
        Ok(())
    }

    async fn start_stdio(
        &self,
        command: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
        cwd: Option<&str>,
    ) -> Result<Transport> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| self.startup_err(format!("failed to spawn `{command}`: {e}")))?;

        // Give the process a moment to crash-exit before declaring success.
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(self.startup_err(format!("process exited immediately: {status}")));
        }

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.startup_err("child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.startup_err("child has no stdout"))?;

        Ok(Transport::Stdio(StdioTransport {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        }))
    }

    async fn start_local_http_like(
        &self,
        command: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
        cwd: Option<&str>,
        preferred_port: Option<u16>,
        endpoint: &str,
        sse: bool,
    ) -> Result<Transport> {
        let attempts = 100;
        let chosen_port = port::find_available_port(preferred_port, attempts)
            .ok_or_else(|| self.startup_err("no free port found in search window"))?;

        let mut final_args = args.to_vec();
        if let Some(preferred) = preferred_port {
            if preferred != chosen_port {
                port::rewrite_port_arg(&mut final_args, preferred, chosen_port);
            }
        }

        let mut cmd = tokio::process::Command::new(command);
        cmd.args(&final_args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| self.startup_err(format!("failed to spawn `{command}`: {e}")))?;

        let deadline = Instant::now() + self.timeouts.startup;
        let grace = Instant::now() + Duration::from_millis(300);
        let mut ready = false;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(self.startup_err(format!("process exited before becoming ready: {status}")));
            }
            if tcp_probe(chosen_port) {
                ready = true;
                break;
            }
            if Instant::now() >= grace && child.try_wait().ok().flatten().is_none() {
                // Process has stayed alive for the grace interval even
                // without an open port yet; treat as ready per spec.md §4.1.
                ready = true;
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !ready {
            let _ = child.kill().await;
            return Err(self.startup_err("timed out waiting for readiness"));
        }

        let base_url = format!("http://127.0.0.1:{chosen_port}{endpoint}");
        Ok(Transport::HttpLike(HttpLikeTransport {
            child: Some(child),
            base_url,
            client: reqwest::Client::new(),
            session_id: None,
            sse,
            port: Some(chosen_port),
        }))
    }

    /// Perform `initialize` exactly once per connector lifetime, then
    /// `tools/list`. Safe to call repeatedly; the handshake is memoized.
    pub async fn discover(&self) -> Result<Vec<Tool>> {
        self.ensure_initialized().await?;
        let req = JsonRpcRequest::new(
            RequestId::Integer(2),
            "tools/list",
            Some(serde_json::json!({})),
        );
        let resp = self.roundtrip(req, self.timeouts.discovery).await?;
        let result = resp
            .result
            .ok_or_else(|| self.protocol_err("tools/list returned no result"))?;
        let parsed: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| self.protocol_err(format!("malformed tools/list result: {e}")))?;
        Ok(parsed.tools)
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if self.init_cell.initialized() {
            return Ok(());
        }
        let params = build_initialize_params();
        let req = JsonRpcRequest::new(
            RequestId::Integer(1),
            "initialize",
            Some(serde_json::to_value(params).expect("InitializeRequestParams always serializes")),
        );
        let timeout = self.timeouts.discovery;
        self.init_cell
            .get_or_try_init(|| async {
                self.roundtrip(req, timeout).await?;
                Ok::<(), ConnectorError>(())
            })
            .await?;
        Ok(())
    }

    pub async fn call(
        &self,
        local_name: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult> {
        {
            let state = *self.state.read().await;
            if state != ConnectorState::Ready {
                return Err(ConnectorError::NotReady {
                    server: self.server_name.clone(),
                    state: state.to_string(),
                });
            }
        }
        self.ensure_initialized().await?;
        let call_params = CallToolParams {
            name: local_name.to_string(),
            arguments: params,
        };
        let req = JsonRpcRequest::new(
            RequestId::Integer(3),
            "tools/call",
            Some(serde_json::to_value(call_params).expect("CallToolParams always serializes")),
        );
        let timeout = timeout.unwrap_or(self.timeouts.tool_call);
        let resp = self.roundtrip(req, timeout).await?;
        if let Some(err) = resp.error {
            return Err(ConnectorError::ToolCall {
                server: self.server_name.clone(),
                reason: err.to_string(),
            });
        }
        let result = resp
            .result
            .ok_or_else(|| self.tool_call_err("tools/call returned neither result nor error"))?;
        serde_json::from_value(result)
            .map_err(|e| self.tool_call_err(format!("malformed tools/call result: {e}")))
    }

    fn protocol_err(&self, reason: impl Into<String>) -> ConnectorError {
        ConnectorError::Protocol {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }

    fn tool_call_err(&self, reason: impl Into<String>) -> ConnectorError {
        ConnectorError::ToolCall {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }

    async fn roundtrip(&self, req: JsonRpcRequest, timeout: Duration) -> Result<JsonRpcResponse> {
        let mut guard = self.transport.lock().await;
        let transport = guard
            .as_mut()
            .ok_or_else(|| self.startup_err("connector has no active transport"))?;
        let fut: std::pin::Pin<Box<dyn std::future::Future<Output = Result<JsonRpcResponse>> + Send + '_>> =
            match transport {
                Transport::Stdio(t) => Box::pin(stdio_roundtrip(t, &req)),
                Transport::HttpLike(t) => Box::pin(http_roundtrip(t, &req)),
            };
        tokio::time::timeout(timeout, fut).await.map_err(|_| {
            let id = req.id.to_string();
            ConnectorError::Timeout {
                server: self.server_name.clone(),
                operation: format!("{} (id {id})", req.method),
            }
        })?
    }

    /// Close the connector. Idempotent.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == ConnectorState::Closed || *state == ConnectorState::Closing {
                return Ok(());
            }
            *state = ConnectorState::Closing;
        }
        let mut guard = self.transport.lock().await;
        if let Some(transport) = guard.take() {
            match transport {
                Transport::Stdio(mut t) => {
                    let _ = t.child.kill().await;
                    let _ = t.child.wait().await;
                }
                Transport::HttpLike(mut t) => {
                    if let Some(mut child) = t.child.take() {
                        let _ = child.start_kill();
                        let waited = tokio::time::timeout(Duration::from_secs(3), child.wait()).await;
                        if waited.is_err() {
                            warn!(server = %self.server_name, "process did not exit after terminate, already sent kill");
                        }
                        if let Some(port) = t.port {
                            if !tcp_probe(port) {
                                debug!(server = %self.server_name, port, "confirmed port released");
                            } else {
                                warn!(server = %self.server_name, port, "port still occupied after shutdown");
                            }
                        }
                    }
                }
            }
        }
        *self.state.write().await = ConnectorState::Closed;
        info!(server = %self.server_name, "connector closed");
        Ok(())
    }
}

fn tcp_probe(port: u16) -> bool {
    let addr = format!("127.0.0.1:{port}");
    match addr.to_socket_addrs() {
        Ok(mut addrs) => addrs.any(|a| std::net::TcpStream::connect_timeout(&a, Duration::from_millis(100)).is_ok()),
        Err(_) => false,
    }
}

async fn stdio_roundtrip(t: &mut StdioTransport, req: &JsonRpcRequest) -> Result<JsonRpcResponse> {
    let mut line = serde_json::to_string(req).map_err(|e| ConnectorError::Protocol {
        server: "stdio".to_string(),
        reason: format!("failed to encode request: {e}"),
    })?;
    line.push('\n');
    t.stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ConnectorError::ToolCall {
            server: "stdio".to_string(),
            reason: format!("write failed: {e}"),
        })?;
    t.stdin.flush().await.ok();

    loop {
        let mut buf = String::new();
        let n = t
            .stdout
            .read_line(&mut buf)
            .await
            .map_err(|e| ConnectorError::Protocol {
                server: "stdio".to_string(),
                reason: format!("read failed: {e}"),
            })?;
        if n == 0 {
            return Err(ConnectorError::Protocol {
                server: "stdio".to_string(),
                reason: "server closed stdout before responding".to_string(),
            });
        }
        let trimmed = buf.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(trimmed) else {
            continue;
        };
        if resp.id.as_ref() == Some(&req.id) {
            return Ok(resp);
        }
    }
}

async fn http_roundtrip(t: &mut HttpLikeTransport, req: &JsonRpcRequest) -> Result<JsonRpcResponse> {
    let accept = if t.sse {
        "application/json, text/event-stream"
    } else {
        "application/json"
    };
    let mut builder = t
        .client
        .post(&t.base_url)
        .header("Content-Type", "application/json")
        .header("Accept", accept)
        .json(req);
    if let Some(session_id) = &t.session_id {
        builder = builder.header("mcp-session-id", session_id.clone());
    }
    let response = builder.send().await.map_err(|e| ConnectorError::ToolCall {
        server: t.base_url.clone(),
        reason: format!("request failed: {e}"),
    })?;

    if let Some(session_header) = response.headers().get("mcp-session-id") {
        if let Ok(value) = session_header.to_str() {
            t.session_id = Some(value.to_string());
        }
    }

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ConnectorError::ToolCall {
            server: t.base_url.clone(),
            reason: format!("HTTP {status}: {body}"),
        });
    }

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.contains("text/event-stream") {
        parse_sse_response(response, &req.id).await
    } else {
        let body = response.bytes().await.map_err(|e| ConnectorError::Protocol {
            server: t.base_url.clone(),
            reason: format!("failed to read body: {e}"),
        })?;
        serde_json::from_slice(&body).map_err(|e| ConnectorError::Protocol {
            server: t.base_url.clone(),
            reason: format!("malformed JSON-RPC response: {e}"),
        })
    }
}

async fn parse_sse_response(
    response: reqwest::Response,
    want_id: &RequestId,
) -> Result<JsonRpcResponse> {
    let mut stream = response.bytes_stream().eventsource();
    while let Some(event) = stream.next().await {
        let event = event.map_err(|e| ConnectorError::Protocol {
            server: "sse".to_string(),
            reason: format!("SSE framing error: {e}"),
        })?;
        let data = event.data.trim();
        if data.is_empty() {
            continue;
        }
        let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(data) else {
            continue;
        };
        if resp.id.as_ref() == Some(want_id) {
            return Ok(resp);
        }
    }
    Err(ConnectorError::Protocol {
        server: "sse".to_string(),
        reason: "stream ended before matching response arrived".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_connector_starts_in_new_state() {
        let connector = Connector::new(
            "srv",
            ServerConfig::Url {
                url: "http://127.0.0.1:1/mcp".to_string(),
            },
            Timeouts::default(),
        );
        assert_eq!(connector.state().await, ConnectorState::New);
    }

    #[tokio::test]
    async fn url_connector_reaches_ready_without_spawning_a_process() {
        let connector = Connector::new(
            "srv",
            ServerConfig::Url {
                url: "http://127.0.0.1:1/mcp".to_string(),
            },
            Timeouts::default(),
        );
        connector.start().await.expect("url transport never fails to start");
        assert_eq!(connector.state().await, ConnectorState::Ready);
    }

    #[tokio::test]
    async fn call_before_start_is_not_ready() {
        let connector = Connector::new(
            "srv",
            ServerConfig::Url {
                url: "http://127.0.0.1:1/mcp".to_string(),
            },
            Timeouts::default(),
        );
        let err = connector.call("echo", None, None).await.unwrap_err();
        assert!(matches!(err, ConnectorError::NotReady { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let connector = Connector::new(
            "srv",
            ServerConfig::Url {
                url: "http://127.0.0.1:1/mcp".to_string(),
            },
            Timeouts::default(),
        );
        connector.start().await.unwrap();
        connector.close().await.unwrap();
        connector.close().await.unwrap();
        assert_eq!(connector.state().await, ConnectorState::Closed);
    }
}
