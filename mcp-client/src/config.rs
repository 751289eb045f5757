use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

/// How to reach one MCP server. Transport choice is fixed at construction
/// time (spec.md §3/§4.1) — a `Connector` never switches transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ServerConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    Http {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default = "default_endpoint")]
        endpoint: String,
    },
    Sse {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default = "default_endpoint")]
        endpoint: String,
    },
    Url {
        url: String,
    },
}

fn default_endpoint() -> String {
    "/mcp".to_string()
}

impl ServerConfig {
    pub fn transport_name(&self) -> &'static str {
        match self {
            ServerConfig::Stdio { .. } => "stdio",
            ServerConfig::Http { .. } => "http",
            ServerConfig::Sse { .. } => "sse",
            ServerConfig::Url { .. } => "url",
        }
    }
}

/// Global timeouts (spec.md §5). Connector callers (`ServerManager`) pass
/// these in; the connector itself has no hardcoded policy beyond these
/// defaults.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub discovery: std::time::Duration,
    pub tool_call: std::time::Duration,
    pub startup: std::time::Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            discovery: std::time::Duration::from_secs(10),
            tool_call: std::time::Duration::from_secs(60),
            startup: std::time::Duration::from_secs(30),
        }
    }
}
