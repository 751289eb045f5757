//! Owns one [`Connector`] per configured MCP server and the merged tool
//! catalog across all of them.
//!
//! Grounded on `examples/ya-luotao-codex/codex-rs/core/src/mcp_connection_manager.rs`
//! for the connect-all-concurrently-tolerate-individual-failures shape
//! (`JoinSet`, `tool_count` watch channel) and on
//! `examples/original_source/tools/server_manager.py`'s `MultiServerManager`
//! for the cache-check-then-dispatch-then-cache-store call path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use switchboard_mcp_client::Connector;
use switchboard_mcp_client::ServerConfig;
use switchboard_mcp_client::Timeouts;
use switchboard_mcp_types::CallToolResult;
use tokio::sync::watch;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::info;
use tracing::warn;

use crate::argument_fixer::ArgumentFixer;
use crate::error::Result;
use crate::error::SwitchboardError;
use crate::permission_gate::Action;
use crate::permission_gate::PermissionGate;
use crate::tool_cache::ToolCache;
use crate::tool_spec::ToolCatalog;
use crate::tool_spec::ToolSpec;

/// Argument keys checked, in order, for a path a filesystem-mutating tool
/// would operate on. Grounded on
/// `examples/original_source/mcp_server/operate_file/server.py`'s tool
/// signatures (`path`, `src`/`dest` for `mv`/`copy`).
const PATH_ARGUMENT_KEYS: &[&str] = &["path", "file_path", "target_path", "src"];

/// Classifies a tool call as filesystem-mutating (or not) from its local
/// name and arguments, grounded on the verb/action mapping in
/// `examples/original_source/mcp_server/operate_file/manage_ops.py` and
/// `write_ops.py` (`ls`/`cat`/`tree`/`search_files` -> read, `touch`/
/// `append` -> write, `mkdir`/`copy` -> create, `rm` -> delete). Returns
/// `None` when no path-shaped argument is present, i.e. the tool isn't
/// operating on the filesystem at all.
fn classify_filesystem_action(local_name: &str, arguments: &Value) -> Option<(std::path::PathBuf, Action)> {
    let path = PATH_ARGUMENT_KEYS
        .iter()
        .find_map(|key| arguments.get(key)?.as_str())?;

    let name = local_name.to_ascii_lowercase();
    let action = if name.contains("delete") || name.contains("remove") || name == "rm" {
        Action::Delete
    } else if name.contains("mkdir") || name.contains("create") || name.contains("copy") || name == "cp" {
        Action::Create
    } else if name.contains("write") || name.contains("append") || name.contains("touch") || name.contains("mv") || name.contains("move") || name.contains("rename") {
        Action::Write
    } else {
        Action::Read
    };

    Some((std::path::PathBuf::from(path), action))
}

pub struct ServerManager {
    connectors: HashMap<String, Arc<Connector>>,
    catalog: RwLock<ToolCatalog>,
    cache: Option<Arc<ToolCache>>,
    permission_gate: Option<Arc<PermissionGate>>,
    tool_count_tx: watch::Sender<usize>,
}

impl ServerManager {
    /// Spawns a `Connector` per entry in `servers` and concurrently
    /// attempts `start` + `discover` on each. A server that fails to
    /// start is logged and excluded from the catalog rather than
    /// aborting the whole startup, matching codex's connection manager.
    pub async fn connect_all(
        servers: HashMap<String, ServerConfig>,
        timeouts: Timeouts,
        cache: Option<Arc<ToolCache>>,
    ) -> Self {
        Self::connect_all_with_permissions(servers, timeouts, cache, None).await
    }

    /// Like `connect_all`, but also wires in a [`PermissionGate`] that
    /// `call_tool` consults before dispatching any filesystem-mutating
    /// tool call.
    pub async fn connect_all_with_permissions(
        servers: HashMap<String, ServerConfig>,
        timeouts: Timeouts,
        cache: Option<Arc<ToolCache>>,
        permission_gate: Option<Arc<PermissionGate>>,
    ) -> Self {
        let mut connectors = HashMap::new();
        let mut catalog = ToolCatalog::new();
        let mut join_set: JoinSet<(String, Result<Vec<switchboard_mcp_types::Tool>>, Arc<Connector>)> =
            JoinSet::new();

        for (name, config) in servers {
            let connector = Arc::new(Connector::new(name.clone(), config, timeouts));
            let spawned = connector.clone();
            join_set.spawn(async move {
                let result = async {
                    spawned.start().await?;
                    let tools = spawned.discover().await?;
                    Ok::<_, switchboard_mcp_client::ConnectorError>(tools)
                }
                .await
                .map_err(SwitchboardError::from);
                (spawned.server_name().to_string(), result, spawned)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let Ok((name, result, connector)) = joined else {
                warn!("server connection task panicked");
                continue;
            };
            match result {
                Ok(tools) => {
                    info!(server = %name, tool_count = tools.len(), "server ready");
                    catalog.replace_server_tools(&name, tools);
                    connectors.insert(name, connector);
                }
                Err(err) => {
                    warn!(server = %name, error = %err, "server failed to start; excluded from catalog");
                }
            }
        }

        let (tool_count_tx, _) = watch::channel(catalog.len());

        Self {
            connectors,
            catalog: RwLock::new(catalog),
            cache,
            permission_gate,
            tool_count_tx,
        }
    }

    pub fn subscribe_tool_count(&self) -> watch::Receiver<usize> {
        self.tool_count_tx.subscribe()
    }

    pub async fn list_tools(&self) -> Vec<ToolSpec> {
        self.catalog.read().await.iter().cloned().collect()
    }

    pub async fn tool_count(&self) -> usize {
        self.catalog.read().await.len()
    }

    /// Re-runs `tools/list` against one already-connected server and
    /// replaces its slice of the catalog.
    pub async fn refresh_tools(&self, server: &str) -> Result<()> {
        let connector = self
            .connectors
            .get(server)
            .ok_or_else(|| SwitchboardError::Config(format!("unknown server `{server}`")))?;
        let tools = connector.discover().await?;
        let mut catalog = self.catalog.write().await;
        catalog.replace_server_tools(server, tools);
        let _ = self.tool_count_tx.send(catalog.len());
        Ok(())
    }

    /// Resolves `qualified_name`, repairs its arguments against the
    /// tool's declared schema, checks the cache, and on a miss dispatches
    /// to the owning connector and stores the result.
    pub async fn call_tool(
        &self,
        qualified_name: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult> {
        let spec = {
            let catalog = self.catalog.read().await;
            catalog
                .get(qualified_name)
                .cloned()
                .ok_or_else(|| SwitchboardError::Config(format!("unknown tool `{qualified_name}`")))?
        };

        let raw_arguments = arguments.unwrap_or(Value::Object(Default::default()));
        let fixed = ArgumentFixer::fix(
            &raw_arguments,
            &spec.tool.input_schema.property_names(),
            &spec.tool.input_schema.required_names(),
        );

        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(&spec.server_name, &spec.local_name, &fixed.arguments)? {
                let result: CallToolResult = serde_json::from_value(cached)
                    .map_err(|e| SwitchboardError::Cache(format!("corrupt cached tool result: {e}")))?;
                return Ok(result);
            }
        }

        if let Some(gate) = &self.permission_gate {
            if let Some((path, action)) = classify_filesystem_action(&spec.local_name, &fixed.arguments) {
                gate.validate_access(&path, action)?;
            }
        }

        let connector = self
            .connectors
            .get(&spec.server_name)
            .ok_or_else(|| SwitchboardError::Config(format!("unknown server `{}`", spec.server_name)))?;

        let result = connector
            .call(&spec.local_name, Some(fixed.arguments.clone()), timeout)
            .await
            .map_err(|err| match SwitchboardError::from(err) {
                SwitchboardError::ToolCall { server, reason, .. } => SwitchboardError::ToolCall {
                    server,
                    tool: spec.local_name.clone(),
                    reason,
                },
                other => other,
            })?;

        if let Some(cache) = &self.cache {
            let value = serde_json::to_value(&result)
                .map_err(|e| SwitchboardError::Cache(format!("failed to serialize tool result: {e}")))?;
            cache.set(&spec.server_name, &spec.local_name, &fixed.arguments, &value)?;
        }

        Ok(result)
    }

    /// Closes every connector concurrently, tolerating individual
    /// failures so one stuck server cannot block shutdown of the rest.
    pub async fn close_all(&self) {
        let mut join_set = JoinSet::new();
        for connector in self.connectors.values().cloned() {
            join_set.spawn(async move { connector.close().await });
        }
        while let Some(joined) = join_set.join_next().await {
            if let Ok(Err(err)) = joined {
                warn!(error = %err, "error closing connector");
            }
        }
    }
}
