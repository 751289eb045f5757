use thiserror::Error;

/// Errors a [`crate::Connector`] can surface. These map directly onto the
/// `StartupError` / `ProtocolError` / `ToolCallError` / `TimeoutError`
/// kinds from the orchestrator's error model; `switchboard-core` wraps
/// these into its own `SwitchboardError` at the `ServerManager` boundary.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("failed to start MCP server `{server}`: {reason}")]
    Startup { server: String, reason: String },

    #[error("protocol violation talking to `{server}`: {reason}")]
    Protocol { server: String, reason: String },

    #[error("tool call failed on `{server}`: {reason}")]
    ToolCall { server: String, reason: String },

    #[error("timed out waiting on `{server}`: {operation}")]
    Timeout { server: String, operation: String },

    #[error("connector for `{server}` is not ready (state: {state})")]
    NotReady { server: String, state: String },
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
