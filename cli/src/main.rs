//! Interactive REPL for the orchestrator.
//!
//! Grounded on `examples/ya-luotao-codex/codex-rs/cli`'s binary shape:
//! `clap` for flags, `tracing-subscriber` with an `EnvFilter` for
//! logging, and a line-oriented REPL reading from stdin.

mod openai_adapter;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use switchboard_core::config::AgentConfig;
use switchboard_core::control_loop::cancellation_channel;
use switchboard_core::control_loop::ControlLoop;
use switchboard_core::permission_gate::PermissionGate;
use switchboard_core::tool_cache::ToolCache;
use switchboard_core::ServerManager;
use switchboard_mcp_client::Timeouts;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;

use crate::openai_adapter::OpenAiCompatibleAdapter;

#[derive(Parser, Debug)]
#[command(name = "switchboard", about = "Tool-augmented agent orchestrator")]
struct Cli {
    /// Path to the agent config YAML. Defaults to ./switchboard.yaml if present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the model configured in the agent config.
    #[arg(long)]
    model: Option<String>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "switchboard=info,switchboard_core=info",
        1 => "switchboard=debug,switchboard_core=debug",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = AgentConfig::resolve(cli.config.clone()).context("loading agent config")?;
    if let Some(model) = cli.model {
        config.model_name = model;
    }

    let servers = switchboard_core::config::load_mcp_servers(&config.server_config_path)
        .context("loading MCP server registry")?;
    tracing::info!(count = servers.len(), "loaded server registry");

    let cache = ToolCache::open(&config.cache_path, 3600)
        .map(Arc::new)
        .map_err(|e| anyhow::anyhow!("opening tool cache: {e}"))?;

    let permission_gate = if config.permissions_path.exists() {
        Some(Arc::new(
            PermissionGate::load(&config.permissions_path).context("loading permission rules")?,
        ))
    } else {
        None
    };

    let server_manager = Arc::new(
        ServerManager::connect_all_with_permissions(servers, Timeouts::default(), Some(cache), permission_gate).await,
    );
    tracing::info!(tools = server_manager.tool_count().await, "connected to MCP servers");

    let api_key = std::env::var(&config.llm_api_key_env).ok();
    let adapter = Arc::new(OpenAiCompatibleAdapter::new(config.llm_base_url.clone(), api_key));

    let (cancel_tx, cancel_rx) = cancellation_channel();
    let mut control_loop = ControlLoop::with_cancel(server_manager.clone(), adapter, config, cancel_rx);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    println!("switchboard ready. Type /help for commands, or just ask a question.");
    let result = repl(&mut control_loop).await;

    server_manager.close_all().await;
    result
}

async fn repl(control_loop: &mut ControlLoop) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        print!("> ");
        use std::io::Write;
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(command) = trimmed.strip_prefix('/') {
            if handle_command(command, control_loop)? {
                break;
            }
            continue;
        }

        match control_loop.run(trimmed).await {
            Ok(answer) => println!("{answer}"),
            Err(err) if err.is_permission_denied() => {
                println!("Permission required: {err}\n(grant access, then re-ask your question)");
            }
            Err(err) => println!("error: {err}"),
        }
    }
    Ok(())
}

/// Returns `Ok(true)` if the REPL should exit.
fn handle_command(command: &str, control_loop: &mut ControlLoop) -> Result<bool> {
    let mut parts = command.split_whitespace();
    match parts.next().unwrap_or_default() {
        "help" => {
            println!(
                "Commands: /help, /quit (or /exit), /clear, /reset, /export [path], /config, /model <name>, /max_tools <n>"
            );
        }
        "quit" | "exit" => return Ok(true),
        "clear" => {
            control_loop.memory_mut().reset();
            println!("conversation history cleared.");
        }
        "reset" => {
            match AgentConfig::resolve(None) {
                Ok(fresh) => {
                    control_loop.set_model(fresh.model_name.clone());
                    control_loop.set_max_tool_call(fresh.max_tool_call);
                    control_loop.memory_mut().reset();
                    println!("agent config reloaded from disk.");
                }
                Err(err) => println!("failed to reload config: {err}"),
            }
        }
        "export" => {
            let path = parts.next().unwrap_or("switchboard_memory.json");
            let json = control_loop
                .memory()
                .export()
                .map_err(|e| anyhow::anyhow!("failed to export memory: {e}"))?;
            std::fs::write(path, json).with_context(|| format!("writing {path}"))?;
            println!("exported conversation to {path}");
        }
        "config" => {
            let config = control_loop.config();
            println!(
                "model_name: {}\nmax_tool_call: {}\nserver_config_path: {}\nllm_base_url: {}",
                config.model_name,
                config.max_tool_call,
                config.server_config_path.display(),
                config.llm_base_url,
            );
        }
        "model" => match parts.next() {
            Some(name) => {
                control_loop.set_model(name.to_string());
                println!("model set to {name}");
            }
            None => println!("usage: /model <name>"),
        },
        "max_tools" => match parts.next().and_then(|n| n.parse::<u32>().ok()) {
            Some(n) => {
                control_loop.set_max_tool_call(n);
                println!("max_tool_call set to {n}");
            }
            None => println!("usage: /max_tools <n>"),
        },
        other => {
            println!("unknown command: /{other} (try /help)");
        }
    }
    Ok(false)
}
