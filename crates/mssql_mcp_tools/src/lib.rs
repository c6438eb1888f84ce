//! Database tool set for the MSSQL MCP server (spec C5).
//!
//! Each tool is a small `McpTool` implementation wired against a shared
//! [`AppContext`]: the resolved config snapshot, the connection pool, the
//! performance observatory, and the audit trail. The dispatcher (in
//! `mssql_mcp_server`) owns the `ToolRegistry` and converts each tool's
//! returned JSON value into the protocol's `ToolCallResult` envelope.

pub mod output_budget;
pub mod registry;
pub mod sql;
pub mod tools;

use std::sync::Arc;

use async_trait::async_trait;
use mssql_mcp_config::ServerConfig;
use mssql_mcp_error::Result;
use mssql_mcp_logging::Audit;
use mssql_mcp_observatory::Observatory;
use mssql_mcp_pool::ConnectionManager;
use serde_json::Value;

pub use output_budget::OutputBudget;
pub use registry::ToolRegistry;

/// Everything a tool handler needs, bundled once at startup and shared
/// (via `Arc`) across every concurrently dispatched tool call.
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub pool: Arc<ConnectionManager>,
    pub observatory: Arc<Observatory>,
    pub audit: Arc<Audit>,
    pub output_budget: OutputBudget,
}

/// A single MCP tool (spec §4.5). `execute` returns the tool's JSON payload
/// directly; the dispatcher is responsible for wrapping it as a text content
/// block and for mapping an `Err` to the protocol's error envelope.
#[async_trait]
pub trait McpTool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn input_schema(&self) -> Value;
    async fn execute(&self, ctx: &AppContext, arguments: Value) -> Result<Value>;
}
