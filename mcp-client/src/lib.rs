//! Multi-transport MCP client.
//!
//! A [`Connector`] owns exactly one MCP server connection — stdio child
//! process, locally-spawned HTTP/SSE server, or a remote URL — and speaks
//! the `initialize` / `tools/list` / `tools/call` subset of MCP over it.
//! `switchboard-core`'s `ServerManager` owns a pool of these, one per
//! configured server.

mod config;
mod connector;
mod error;
mod port;

pub use config::ServerConfig;
pub use config::Timeouts;
pub use connector::Connector;
pub use connector::ConnectorState;
pub use error::ConnectorError;
pub use error::Result;
pub use port::find_available_port;
pub use port::rewrite_port_arg;
