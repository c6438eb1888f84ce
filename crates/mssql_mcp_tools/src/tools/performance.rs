//! Facades over the C4 observatory (spec §4.4): `get_performance_stats`,
//! `get_query_performance`, `get_connection_health`. None of these touch
//! the database directly or run through the C3 gate — they only read the
//! in-process ring buffer and, for connection health, the pool's own stats.

use async_trait::async_trait;
use mssql_mcp_error::{McpError, Result};
use mssql_mcp_observatory::Timeframe;
use serde_json::{json, Value};

use super::{opt_bool, opt_str, opt_u64};
use crate::{AppContext, McpTool};

fn to_value<T: serde::Serialize>(result: T) -> Result<Value> {
    serde_json::to_value(result).map_err(|e| McpError::internal(e.to_string()))
}

pub struct GetPerformanceStatsTool;

#[async_trait]
impl McpTool for GetPerformanceStatsTool {
    fn name(&self) -> &'static str {
        "get_performance_stats"
    }

    fn description(&self) -> &'static str {
        "Aggregate query performance over a timeframe (recent, session, or all) — counts, error rate, and duration percentiles."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "timeframe": { "type": "string", "enum": ["recent", "session", "all"], "default": "all" }
            }
        })
    }

    async fn execute(&self, ctx: &AppContext, arguments: Value) -> Result<Value> {
        let timeframe = Timeframe::parse(opt_str(&arguments, "timeframe"));
        to_value(ctx.observatory.stats(timeframe))
    }
}

pub struct GetQueryPerformanceTool;

#[async_trait]
impl McpTool for GetQueryPerformanceTool {
    fn name(&self) -> &'static str {
        "get_query_performance"
    }

    fn description(&self) -> &'static str {
        "List recent tracked query records, newest first, optionally filtered by tool name or restricted to slow queries."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "default": 50 },
                "toolFilter": { "type": "string" },
                "slowOnly": { "type": "boolean", "default": false }
            }
        })
    }

    async fn execute(&self, ctx: &AppContext, arguments: Value) -> Result<Value> {
        // A non-positive or non-numeric limit normalizes to 50.
        let limit = match opt_u64(&arguments, "limit") {
            Some(0) | None => 50,
            Some(n) => n as usize,
        };
        let tool_filter = opt_str(&arguments, "toolFilter");
        let slow_only = opt_bool(&arguments, "slowOnly", false);
        to_value(ctx.observatory.query_stats(limit, tool_filter, slow_only))
    }
}

pub struct GetConnectionHealthTool;

#[async_trait]
impl McpTool for GetConnectionHealthTool {
    fn name(&self) -> &'static str {
        "get_connection_health"
    }

    fn description(&self) -> &'static str {
        "Report the connection pool's current utilization and health score, annotated with the recent observatory-tracked error rate."
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, ctx: &AppContext, _arguments: Value) -> Result<Value> {
        to_value(ctx.observatory.pool_stats(&ctx.pool).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn performance_stats_schema_defaults_to_all_timeframe() {
        let schema = GetPerformanceStatsTool.input_schema();
        assert_eq!(schema["properties"]["timeframe"]["default"], "all");
    }

    #[test]
    fn query_performance_schema_defaults_limit_to_fifty() {
        let schema = GetQueryPerformanceTool.input_schema();
        assert_eq!(schema["properties"]["limit"]["default"], 50);
    }
}
