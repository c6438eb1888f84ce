//! One module per tool group, mirroring how the teacher splits `tools/`
//! by subject area rather than one file per tool.

pub mod advisor;
pub mod data;
pub mod performance;
pub mod query;
pub mod schema;

use chrono::Utc;
use mssql_mcp_error::{McpError, Result};
use mssql_mcp_logging::AuditEntry;
use mssql_mcp_pool::PooledConnection;
use mssql_mcp_safety::{evaluate, PolicyDecision, PolicyFlags};
use serde_json::Value;

use crate::AppContext;

pub(crate) fn policy_flags(ctx: &AppContext) -> PolicyFlags {
    PolicyFlags {
        read_only_mode: ctx.config.read_only_mode,
        allow_destructive: ctx.config.allow_destructive,
        allow_schema_changes: ctx.config.allow_schema_changes,
    }
}

/// Classify and authorize a statement against the current policy, recording
/// the decision to the audit trail regardless of outcome (spec §4.3/§4.7).
/// Returns the decision on allow, `McpError::PolicyDenied` on deny.
pub(crate) fn authorize(ctx: &AppContext, tool: &str, statement: &str) -> Result<PolicyDecision> {
    let flags = policy_flags(ctx);
    let decision = evaluate(statement, flags);
    ctx.audit.record(&AuditEntry {
        ts: Utc::now(),
        tool: tool.to_string(),
        classification: format!("{:?}", decision.classification),
        allowed: decision.allowed,
        reason: decision.reason.clone(),
        read_only_mode: flags.read_only_mode,
        allow_destructive: flags.allow_destructive,
        allow_schema_changes: flags.allow_schema_changes,
    });
    if !decision.allowed {
        return Err(McpError::policy_denied(decision.reason));
    }
    Ok(decision)
}

/// Ensure the pool is connected, borrow a connection, and switch database if
/// requested — the three steps every tool handler performs before issuing
/// SQL (spec §4.5's preamble).
pub(crate) async fn borrow_connection(ctx: &AppContext, database: Option<&str>) -> Result<PooledConnection> {
    ctx.pool.connect().await?;
    let mut conn = ctx.pool.borrow().await?;
    crate::sql::use_database(&mut conn, database).await?;
    Ok(conn)
}

/// Pull a required string argument out of a tool's `arguments` object.
pub(crate) fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| McpError::validation(format!("missing required argument: {key}")))
}

pub(crate) fn opt_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

pub(crate) fn opt_u64(args: &Value, key: &str) -> Option<u64> {
    args.get(key).and_then(Value::as_u64)
}

pub(crate) fn opt_bool(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}
