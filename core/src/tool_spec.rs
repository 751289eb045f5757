//! Namespacing and cataloging of tools discovered across servers.
//!
//! Grounded on `examples/ya-luotao-codex/codex-rs/core/src/mcp_connection_manager.rs`'s
//! `qualify_tools`: tool names are joined as `server__tool`, truncated to
//! 64 characters with a SHA1-derived suffix when the qualified name would
//! otherwise overflow what most LLM function-calling APIs accept, and a
//! name collision after truncation silently keeps the first registration.

use std::collections::HashMap;

use sha1::Digest;
use sha1::Sha1;
use switchboard_mcp_types::Tool;

pub const NAME_DELIMITER: &str = "__";
pub const MAX_TOOL_NAME_LENGTH: usize = 64;

/// A tool as the agent sees it: namespaced by server, carrying enough of
/// the original MCP `Tool` to drive formatting for the LLM and argument
/// repair.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub qualified_name: String,
    pub server_name: String,
    pub local_name: String,
    pub description: Option<String>,
    pub tool: Tool,
}

/// Join `server` and `tool` into a single name, truncating with a hash
/// suffix if it would exceed [`MAX_TOOL_NAME_LENGTH`].
pub fn qualify_name(server: &str, tool: &str) -> String {
    let full = format!("{server}{NAME_DELIMITER}{tool}");
    if full.len() <= MAX_TOOL_NAME_LENGTH {
        return full;
    }
    let mut hasher = Sha1::new();
    hasher.update(full.as_bytes());
    let digest = hasher.finalize();
    let suffix = format!("{NAME_DELIMITER}{:08x}", u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]));
    let keep = MAX_TOOL_NAME_LENGTH.saturating_sub(suffix.len());
    let mut truncated: String = full.chars().take(keep).collect();
    truncated.push_str(&suffix);
    truncated
}

/// Splits a qualified name back into `(server, tool)` on the first
/// occurrence of the delimiter. Names that underwent hash-truncation
/// cannot be reversed this way — the catalog is consulted instead.
pub fn split_qualified_name(qualified: &str) -> Option<(&str, &str)> {
    qualified.split_once(NAME_DELIMITER)
}

/// All tools currently known across every connected server, keyed by
/// qualified name.
#[derive(Debug, Default)]
pub struct ToolCatalog {
    tools: HashMap<String, ToolSpec>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every tool belonging to `server` with a fresh set,
    /// leaving other servers' tools untouched. Used on reconnect/refresh.
    pub fn replace_server_tools(&mut self, server: &str, tools: Vec<Tool>) {
        self.tools.retain(|_, spec| spec.server_name != server);
        for tool in tools {
            let qualified_name = qualify_name(server, &tool.name);
            if self.tools.contains_key(&qualified_name) {
                continue;
            }
            self.tools.insert(
                qualified_name.clone(),
                ToolSpec {
                    qualified_name,
                    server_name: server.to_string(),
                    local_name: tool.name.clone(),
                    description: tool.description.clone(),
                    tool,
                },
            );
        }
    }

    /// Resolves `name` against the catalog, trying an exact qualified-name
    /// match first and falling back to a scan by bare local name (first
    /// match wins) since the model may emit either form.
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools
            .get(name)
            .or_else(|| self.tools.values().find(|spec| spec.local_name == name))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values()
    }

    pub fn remove_server(&mut self, server: &str) {
        self.tools.retain(|_, spec| spec.server_name != server);
    }
}
