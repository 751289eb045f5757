//! Configuration loading: the MCP server registry and the top-level agent
//! config, both YAML, both supporting `${VAR}` / `${VAR:-default}` shell-style
//! environment expansion.
//!
//! Grounded on `examples/ya-luotao-codex/codex-rs/core/src/mcp_toml.rs`
//! (`expand_vars`, per-project overlay merging) adapted from TOML to YAML
//! to match `examples/original_source/core/config_loader.py`'s format, and
//! on that same Python module for the agent-level settings (model name,
//! max rounds, memory view size).

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use switchboard_mcp_client::ServerConfig;

use crate::error::Result;
use crate::error::SwitchboardError;

/// Expands `${VAR}` and `${VAR:-default}` references against the process
/// environment. Unresolvable `${VAR}` with no default is left verbatim,
/// matching codex's `expand_vars` so a misconfigured server surfaces a
/// visible placeholder instead of a silent empty string.
pub fn expand_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(close) = input[i + 2..].find('}') {
                let inner = &input[i + 2..i + 2 + close];
                let (name, default) = match inner.split_once(":-") {
                    Some((n, d)) => (n, Some(d)),
                    None => (inner, None),
                };
                match std::env::var(name) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => match default {
                        Some(d) => out.push_str(d),
                        None => {
                            out.push_str("${");
                            out.push_str(inner);
                            out.push('}');
                        }
                    },
                }
                i += 2 + close + 1;
                continue;
            }
        }
        let ch = input[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

fn expand_map(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter().map(|(k, v)| (k.clone(), expand_vars(v))).collect()
}

/// On-disk shape of a single server entry before environment expansion.
/// Mirrors codex's `McpTomlEntry`, generalized across the four transports.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
enum RawServerEntry {
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
        #[serde(default)]
        endpoint: Option<String>,
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
        #[serde(default)]
        endpoint: Option<String>,
    },
    Url {
        url: String,
    },
}

impl RawServerEntry {
    fn into_server_config(self) -> ServerConfig {
        match self {
            RawServerEntry::Stdio { command, args, env, cwd } => ServerConfig::Stdio {
                command: expand_vars(&command),
                args: args.iter().map(|a| expand_vars(a)).collect(),
                env: expand_map(&env),
                cwd: cwd.map(|c| expand_vars(&c)),
            },
            RawServerEntry::Http {
                command,
                args,
                env,
                cwd,
                port,
                endpoint,
            } => ServerConfig::Http {
                command: expand_vars(&command),
                args: args.iter().map(|a| expand_vars(a)).collect(),
                env: expand_map(&env),
                cwd: cwd.map(|c| expand_vars(&c)),
                port,
                endpoint: endpoint.unwrap_or_else(|| "/mcp".to_string()),
            },
            RawServerEntry::Sse {
                command,
                args,
                env,
                cwd,
                port,
                endpoint,
            } => ServerConfig::Sse {
                command: expand_vars(&command),
                args: args.iter().map(|a| expand_vars(a)).collect(),
                env: expand_map(&env),
                cwd: cwd.map(|c| expand_vars(&c)),
                port,
                endpoint: endpoint.unwrap_or_else(|| "/mcp".to_string()),
            },
            RawServerEntry::Url { url } => ServerConfig::Url { url: expand_vars(&url) },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
struct McpServersFile {
    #[serde(default)]
    all_servers: HashMap<String, RawServerEntry>,
}

/// Load the server registry from `path`, then merge in a project-local
/// overlay (`<parent>/mcp_servers.local.yaml`) if present — entries there
/// win, matching codex's `load_project_overlays` precedence.
pub fn load_mcp_servers(path: &Path) -> Result<HashMap<String, ServerConfig>> {
    let mut merged: HashMap<String, RawServerEntry> = load_servers_file(path)?;

    if let Some(parent) = path.parent() {
        let overlay = parent.join("mcp_servers.local.yaml");
        if overlay.exists() {
            let overlay_entries = load_servers_file(&overlay)?;
            merged.extend(overlay_entries);
        }
    }

    Ok(merged
        .into_iter()
        .map(|(name, entry)| (name, entry.into_server_config()))
        .collect())
}

fn load_servers_file(path: &Path) -> Result<HashMap<String, RawServerEntry>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let text = std::fs::read_to_string(path)
        .map_err(|e| SwitchboardError::Config(format!("failed to read {}: {e}", path.display())))?;
    let parsed: McpServersFile = serde_yaml::from_str(&text)
        .map_err(|e| SwitchboardError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(parsed.all_servers)
}

/// View kind handed to the LLM (spec.md §4.6) — how much history to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryViewType {
    Full,
    ChatMessages,
}

/// Top-level agent configuration, grounded on
/// `examples/original_source/core/config_loader.py`. Field names mirror
/// the YAML keys named in the server's external interface contract
/// (`model_name`, `max_tool_call`, `server_config_path`) so the on-disk
/// shape and the Rust shape never drift apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model_name: String,
    #[serde(default = "default_max_rounds")]
    pub max_tool_call: u32,
    #[serde(default = "default_max_history")]
    pub max_history_entries: usize,
    #[serde(default)]
    pub memory_view: MemoryViewTypeDefault,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_mcp_servers_path")]
    pub server_config_path: PathBuf,
    #[serde(default = "default_permissions_path")]
    pub permissions_path: PathBuf,
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    #[serde(default = "default_base_url")]
    pub llm_base_url: String,
    #[serde(default = "default_api_key_env")]
    pub llm_api_key_env: String,
}

/// Newtype so `#[serde(default)]` can pick `ChatMessages` without forcing
/// every caller to spell out the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryViewTypeDefault(pub MemoryViewType);

impl Default for MemoryViewTypeDefault {
    fn default() -> Self {
        MemoryViewTypeDefault(MemoryViewType::ChatMessages)
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_rounds() -> u32 {
    5
}
fn default_max_history() -> usize {
    50
}
fn default_mcp_servers_path() -> PathBuf {
    PathBuf::from("mcp_servers.yaml")
}
fn default_permissions_path() -> PathBuf {
    PathBuf::from("permissions.json")
}
fn default_cache_path() -> PathBuf {
    PathBuf::from("tool_cache.sqlite3")
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model_name: default_model(),
            max_tool_call: default_max_rounds(),
            max_history_entries: default_max_history(),
            memory_view: MemoryViewTypeDefault::default(),
            system_prompt: None,
            server_config_path: default_mcp_servers_path(),
            permissions_path: default_permissions_path(),
            cache_path: default_cache_path(),
            llm_base_url: default_base_url(),
            llm_api_key_env: default_api_key_env(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SwitchboardError::Config(format!("failed to read {}: {e}", path.display())))?;
        let mut config: Self = serde_yaml::from_str(&text)
            .map_err(|e| SwitchboardError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Resolve the config to use, in precedence order: an explicit
    /// `path`, `./switchboard.yaml`, `~/.config/switchboard/switchboard.yaml`,
    /// then built-in defaults. Mirrors the project-then-global precedence
    /// in `examples/ya-luotao-codex/codex-rs/core/src/config_loader.rs`.
    /// Environment overrides apply on every path, including the built-in
    /// default, so `AGENT_*` always wins regardless of where the rest of
    /// the config came from.
    pub fn resolve(path: Option<PathBuf>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(&path);
        }
        let project_path = PathBuf::from("switchboard.yaml");
        if project_path.exists() {
            return Self::load(&project_path);
        }
        if let Some(global_path) = dirs::home_dir().map(|mut home| {
            home.push(".config");
            home.push("switchboard");
            home.push("switchboard.yaml");
            home
        }) {
            if global_path.exists() {
                return Self::load(&global_path);
            }
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// `AGENT_MODEL_NAME`, `AGENT_MAX_TOOL_CALL`, `AGENT_SERVER_CONFIG_PATH`,
    /// `AGENT_BASE_URL`, `AGENT_API_KEY` each override the corresponding
    /// file value when set. `AGENT_API_KEY` is handled by pointing
    /// `llm_api_key_env` at itself rather than by storing the secret
    /// in the struct, so the key never gets serialized back out with
    /// `/config` or `export`.
    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("AGENT_MODEL_NAME") {
            self.model_name = value;
        }
        if let Ok(value) = std::env::var("AGENT_MAX_TOOL_CALL") {
            if let Ok(parsed) = value.parse() {
                self.max_tool_call = parsed;
            }
        }
        if let Ok(value) = std::env::var("AGENT_SERVER_CONFIG_PATH") {
            self.server_config_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("AGENT_BASE_URL") {
            self.llm_base_url = value;
        }
        if std::env::var_os("AGENT_API_KEY").is_some() {
            self.llm_api_key_env = "AGENT_API_KEY".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_vars_substitutes_present_variable() {
        std::env::set_var("SWITCHBOARD_TEST_VAR", "hello");
        assert_eq!(expand_vars("value=${SWITCHBOARD_TEST_VAR}"), "value=hello");
        std::env::remove_var("SWITCHBOARD_TEST_VAR");
    }

    #[test]
    fn expand_vars_falls_back_to_default() {
        std::env::remove_var("SWITCHBOARD_MISSING_VAR");
        assert_eq!(expand_vars("${SWITCHBOARD_MISSING_VAR:-fallback}"), "fallback");
    }

    #[test]
    fn expand_vars_leaves_unresolvable_reference_verbatim() {
        std::env::remove_var("SWITCHBOARD_MISSING_VAR_2");
        assert_eq!(expand_vars("${SWITCHBOARD_MISSING_VAR_2}"), "${SWITCHBOARD_MISSING_VAR_2}");
    }

    #[test]
    fn default_agent_config_has_sane_values() {
        let config = AgentConfig::default();
        assert_eq!(config.model_name, "gpt-4o-mini");
        assert_eq!(config.max_tool_call, 5);
    }

    #[test]
    fn load_mcp_servers_parses_mixed_transports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_servers.yaml");
        std::fs::write(
            &path,
            r#"
all_servers:
  files:
    transport: stdio
    command: mcp-server-files
    args: ["--root", "."]
  remote:
    transport: url
    url: "https://example.com/mcp"
"#,
        )
        .unwrap();
        let servers = load_mcp_servers(&path).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers["files"].transport_name(), "stdio");
        assert_eq!(servers["remote"].transport_name(), "url");
    }

    #[test]
    fn load_mcp_servers_merges_local_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_servers.yaml");
        std::fs::write(
            &path,
            "all_servers:\n  files:\n    transport: stdio\n    command: base\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("mcp_servers.local.yaml"),
            "all_servers:\n  files:\n    transport: stdio\n    command: overridden\n",
        )
        .unwrap();
        let servers = load_mcp_servers(&path).unwrap();
        match &servers["files"] {
            ServerConfig::Stdio { command, .. } => assert_eq!(command, "overridden"),
            other => panic!("unexpected transport: {other:?}"),
        }
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.yaml");
        std::fs::write(&path, "model_name: from-file\nmax_tool_call: 3\n").unwrap();
        std::env::set_var("AGENT_MODEL_NAME", "from-env");
        std::env::set_var("AGENT_MAX_TOOL_CALL", "7");
        let config = AgentConfig::load(&path).unwrap();
        std::env::remove_var("AGENT_MODEL_NAME");
        std::env::remove_var("AGENT_MAX_TOOL_CALL");
        assert_eq!(config.model_name, "from-env");
        assert_eq!(config.max_tool_call, 7);
    }
}
