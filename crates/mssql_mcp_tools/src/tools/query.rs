//! `execute_query` and `explain_query` (spec §4.5) — the two tools that run
//! an arbitrary, caller-supplied statement rather than a fixed
//! introspection query, and so are the only ones subject to the full C3
//! classify+authorize gate on the statement itself.

use async_trait::async_trait;
use mssql_mcp_error::{McpError, Result};
use mssql_mcp_observatory::QueryOutcome;
use mssql_mcp_safety::Classification;
use serde_json::{json, Value};

use super::{opt_bool, opt_str, require_str};
use crate::sql;
use crate::tools::{authorize, borrow_connection};
use crate::{AppContext, McpTool};

pub struct ExecuteQueryTool;

#[async_trait]
impl McpTool for ExecuteQueryTool {
    fn name(&self) -> &'static str {
        "execute_query"
    }

    fn description(&self) -> &'static str {
        "Execute a SQL statement against the configured SQL Server database, subject to the server's safety policy."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "statement": { "type": "string", "description": "SQL statement to execute" },
                "database": { "type": "string", "description": "Database to switch to before executing" }
            },
            "required": ["statement"]
        })
    }

    async fn execute(&self, ctx: &AppContext, arguments: Value) -> Result<Value> {
        let statement = require_str(&arguments, "statement")?;
        let database = opt_str(&arguments, "database");

        let decision = authorize(ctx, self.name(), statement)?;
        let token = ctx.observatory.start_query(self.name(), statement, database);

        let mut conn = match borrow_connection(ctx, database).await {
            Ok(c) => c,
            Err(e) => {
                ctx.observatory.end_query(
                    token,
                    QueryOutcome::failure(e.kind(), &e.to_string()),
                );
                return Err(e);
            }
        };

        let outcome = match decision.classification {
            Classification::Empty | Classification::ReadOnly => {
                sql::query_recordsets(&mut conn, statement).await.map(|recordsets| {
                    let row_count: i64 = recordsets.iter().map(|r| r.len() as i64).sum();
                    (Vec::<i64>::new(), recordsets, row_count)
                })
            }
            _ => sql::execute_statement(&mut conn, statement)
                .await
                .map(|rows_affected| {
                    let total: i64 = rows_affected.iter().map(|&n| n as i64).sum();
                    (rows_affected.iter().map(|&n| n as i64).collect(), Vec::new(), total)
                }),
        };

        match outcome {
            Ok((rows_affected, recordsets, row_count)) => {
                ctx.observatory.end_query(
                    token,
                    QueryOutcome::success(rows_affected.clone(), row_count),
                );
                Ok(json!({
                    "rowsAffected": rows_affected,
                    "recordset": recordsets.first().cloned().unwrap_or_default(),
                    "recordsets": recordsets,
                    "safetyInfo": {
                        "classification": format!("{:?}", decision.classification),
                        "allowed": decision.allowed,
                        "reason": decision.reason,
                    }
                }))
            }
            Err(e) => {
                ctx.observatory.end_query(token, QueryOutcome::failure(e.kind(), &e.to_string()));
                Err(e)
            }
        }
    }
}

pub struct ExplainQueryTool;

#[async_trait]
impl McpTool for ExplainQueryTool {
    fn name(&self) -> &'static str {
        "explain_query"
    }

    fn description(&self) -> &'static str {
        "Return the execution plan for a SQL statement without (or, optionally, with) actually collecting its result rows."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "statement": { "type": "string", "description": "SQL statement to explain" },
                "database": { "type": "string" },
                "includeActualPlan": {
                    "type": "boolean",
                    "description": "Capture the actual (post-execution) plan instead of the estimated plan",
                    "default": false
                }
            },
            "required": ["statement"]
        })
    }

    async fn execute(&self, ctx: &AppContext, arguments: Value) -> Result<Value> {
        let statement = require_str(&arguments, "statement")?;
        let database = opt_str(&arguments, "database");
        let include_actual_plan = opt_bool(&arguments, "includeActualPlan", false);

        // `SET SHOWPLAN_XML ON` suppresses execution entirely, but
        // `SET STATISTICS XML ON` does not — it only annotates the results of
        // a statement that still actually runs. So `includeActualPlan` goes
        // through the same classify+authorize gate `execute_query` does;
        // without it a caller could smuggle a DROP/DELETE/UPDATE past
        // `readOnlyMode` by wrapping it in an "explain" call.
        let decision = authorize(ctx, self.name(), statement)?;
        let token = ctx.observatory.start_query(self.name(), statement, database);
        let mut conn = match borrow_connection(ctx, database).await {
            Ok(c) => c,
            Err(e) => {
                ctx.observatory.end_query(token, QueryOutcome::failure(e.kind(), &e.to_string()));
                return Err(e);
            }
        };

        let setting = if include_actual_plan {
            "SET STATISTICS XML ON"
        } else {
            "SET SHOWPLAN_XML ON"
        };
        let restore = if include_actual_plan {
            "SET STATISTICS XML OFF"
        } else {
            "SET SHOWPLAN_XML OFF"
        };

        let result = async {
            sql::execute_statement(&mut conn, setting).await.ok();
            let plan_rows = sql::query_recordsets(&mut conn, statement).await?;
            Ok::<_, McpError>(plan_rows)
        }
        .await;

        // Best-effort restore on every exit path; failure here is logged,
        // never surfaced (spec §4.5: "restores settings on all exit paths —
        // failure to restore is logged but not surfaced").
        if let Err(e) = sql::execute_statement(&mut conn, restore).await {
            tracing::warn!(error = %e, "failed to restore showplan session setting");
        }

        match result {
            Ok(plan_rows) => {
                ctx.observatory.end_query(token, QueryOutcome::success(Vec::new(), 0));
                let cost_lookup = best_effort_cost_lookup(&mut conn, statement).await;
                Ok(json!({
                    "plan": plan_rows,
                    "includeActualPlan": include_actual_plan,
                    "estimatedCost": cost_lookup,
                    "safetyInfo": {
                        "classification": format!("{:?}", decision.classification),
                        "allowed": decision.allowed,
                        "reason": decision.reason,
                    }
                }))
            }
            Err(e) => {
                ctx.observatory.end_query(token, QueryOutcome::failure(e.kind(), &e.to_string()));
                Err(e)
            }
        }
    }
}

/// Best-effort lookup against `sys.dm_exec_query_stats`/`sys.dm_exec_sql_text`
/// for a statement matching this one's fingerprint. Returns `null` rather
/// than failing the whole tool call if the DMV read itself fails — this is
/// explicitly a "best effort" enrichment per spec §4.5.
async fn best_effort_cost_lookup(conn: &mut mssql_mcp_pool::PooledConnection, statement: &str) -> Value {
    let escaped = statement.replace('\'', "''");
    let sql = format!(
        "SELECT TOP 1 qs.total_worker_time, qs.total_elapsed_time, qs.execution_count \
         FROM sys.dm_exec_query_stats qs \
         CROSS APPLY sys.dm_exec_sql_text(qs.sql_handle) st \
         WHERE st.text LIKE '%{escaped}%' \
         ORDER BY qs.last_execution_time DESC"
    );
    match sql::query_rows(conn, &sql).await {
        Ok(mut rows) => rows.pop().unwrap_or(Value::Null),
        Err(_) => Value::Null,
    }
}
