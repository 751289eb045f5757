use switchboard_mcp_client::ConnectorError;
use thiserror::Error;

/// The orchestrator's unified error type (spec.md §7). Every public
/// operation on `ServerManager`, `PermissionGate`, `ToolCache`, and
/// `ControlLoop` resolves to one of these kinds so the CLI can render a
/// consistent message and the control loop can branch on deny-vs-failure.
#[derive(Debug, Error)]
pub enum SwitchboardError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to start server `{server}`: {reason}")]
    Startup { server: String, reason: String },

    #[error("protocol error talking to `{server}`: {reason}")]
    Protocol { server: String, reason: String },

    #[error("tool call `{tool}` on `{server}` failed: {reason}")]
    ToolCall {
        server: String,
        tool: String,
        reason: String,
    },

    #[error("access to `{path}` denied: no matching permission rule")]
    ImplicitDeny { path: String },

    #[error("access to `{path}` denied: {reason}")]
    ExplicitDeny { path: String, reason: String },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("LLM adapter error: {0}")]
    Llm(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl SwitchboardError {
    /// True for the two permission-denial kinds the control loop treats
    /// specially (rollback of the just-appended assistant turn).
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            SwitchboardError::ImplicitDeny { .. } | SwitchboardError::ExplicitDeny { .. }
        )
    }
}

impl From<ConnectorError> for SwitchboardError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::Startup { server, reason } => SwitchboardError::Startup { server, reason },
            ConnectorError::Protocol { server, reason } => SwitchboardError::Protocol { server, reason },
            ConnectorError::ToolCall { server, reason } => SwitchboardError::ToolCall {
                server,
                tool: String::new(),
                reason,
            },
            ConnectorError::Timeout { server, operation } => {
                SwitchboardError::Timeout(format!("{server}: {operation}"))
            }
            ConnectorError::NotReady { server, state } => {
                SwitchboardError::Startup {
                    server,
                    reason: format!("connector not ready (state: {state})"),
                }
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SwitchboardError>;
