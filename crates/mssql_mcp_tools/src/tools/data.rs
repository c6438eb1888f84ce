//! Row-data access tools (spec §4.5): `get_table_data`, `export_table_csv`.
//! Both read a single table by bracket-escaped identifier rather than
//! running caller SQL, so neither goes through the C3 gate, but both are
//! subject to the output budget (spec §4.4/§4.9).

use async_trait::async_trait;
use mssql_mcp_error::Result;
use mssql_mcp_observatory::QueryOutcome;
use serde_json::{json, Value};

use super::{opt_str, opt_u64, require_str};
use crate::sql::{self, schema_or_default};
use crate::tools::borrow_connection;
use crate::{AppContext, McpTool};

pub struct GetTableDataTool;

#[async_trait]
impl McpTool for GetTableDataTool {
    fn name(&self) -> &'static str {
        "get_table_data"
    }

    fn description(&self) -> &'static str {
        "Fetch a page of rows from a table, subject to the server's output size and row-count budget."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tableName": { "type": "string" },
                "database": { "type": "string" },
                "schema": { "type": "string", "default": "dbo" },
                "limit": { "type": "integer", "default": 100 },
                "offset": { "type": "integer", "default": 0 },
                "where": { "type": "string", "description": "WHERE clause, passed through unchanged" }
            },
            "required": ["tableName"]
        })
    }

    async fn execute(&self, ctx: &AppContext, arguments: Value) -> Result<Value> {
        let table_name = require_str(&arguments, "tableName")?;
        let database = opt_str(&arguments, "database");
        let schema = schema_or_default(opt_str(&arguments, "schema"));
        let bracketed_table = sql::ident(table_name)?;
        let bracketed_schema = sql::ident(schema)?;
        let requested_limit = opt_u64(&arguments, "limit").unwrap_or(100) as usize;
        let offset = opt_u64(&arguments, "offset").unwrap_or(0);
        let limit = requested_limit.min(ctx.output_budget.max_rows());
        let where_clause = opt_str(&arguments, "where")
            .map(|w| format!(" WHERE {w}"))
            .unwrap_or_default();

        let token = ctx.observatory.start_query(self.name(), table_name, database);
        let mut conn = borrow_connection(ctx, database).await?;

        let sql_text = format!(
            "SELECT * FROM {bracketed_schema}.{bracketed_table}{where_clause} \
             ORDER BY (SELECT NULL) OFFSET {offset} ROWS FETCH NEXT {limit} ROWS ONLY"
        );

        match sql::query_rows(&mut conn, &sql_text).await {
            Ok(rows) => {
                ctx.observatory.end_query(token, QueryOutcome::success(Vec::new(), rows.len() as i64));
                let (rows, truncated) = ctx.output_budget.enforce_rows(rows);
                Ok(json!({
                    "table": table_name,
                    "schema": schema,
                    "rows": rows,
                    "truncated": truncated,
                }))
            }
            Err(e) => {
                ctx.observatory.end_query(token, QueryOutcome::failure(e.kind(), &e.to_string()));
                Err(e)
            }
        }
    }
}

pub struct ExportTableCsvTool;

#[async_trait]
impl McpTool for ExportTableCsvTool {
    fn name(&self) -> &'static str {
        "export_table_csv"
    }

    fn description(&self) -> &'static str {
        "Export a table's rows as RFC 4180 CSV text, subject to the server's output size and row-count budget."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tableName": { "type": "string" },
                "database": { "type": "string" },
                "schema": { "type": "string", "default": "dbo" },
                "limit": { "type": "integer", "default": 1000 },
                "where": { "type": "string", "description": "WHERE clause, passed through unchanged" }
            },
            "required": ["tableName"]
        })
    }

    async fn execute(&self, ctx: &AppContext, arguments: Value) -> Result<Value> {
        let table_name = require_str(&arguments, "tableName")?;
        let database = opt_str(&arguments, "database");
        let schema = schema_or_default(opt_str(&arguments, "schema"));
        let bracketed_table = sql::ident(table_name)?;
        let bracketed_schema = sql::ident(schema)?;
        let requested_limit = opt_u64(&arguments, "limit").unwrap_or(1000) as usize;
        let limit = requested_limit.min(ctx.output_budget.max_rows());
        let where_clause = opt_str(&arguments, "where")
            .map(|w| format!(" WHERE {w}"))
            .unwrap_or_default();

        let token = ctx.observatory.start_query(self.name(), table_name, database);
        let mut conn = borrow_connection(ctx, database).await?;

        let sql_text =
            format!("SELECT TOP ({limit}) * FROM {bracketed_schema}.{bracketed_table}{where_clause}");

        match sql::query_rows(&mut conn, &sql_text).await {
            Ok(rows) => {
                ctx.observatory.end_query(token, QueryOutcome::success(Vec::new(), rows.len() as i64));
                let (rows, truncated) = ctx.output_budget.enforce_rows(rows);
                let csv = rows_to_csv(&rows);
                ctx.output_budget.check_size(csv.len())?;
                Ok(json!({
                    "table": table_name,
                    "schema": schema,
                    "csv": csv,
                    "rowCount": rows.len(),
                    "truncated": truncated,
                }))
            }
            Err(e) => {
                ctx.observatory.end_query(token, QueryOutcome::failure(e.kind(), &e.to_string()));
                Err(e)
            }
        }
    }
}

/// Render a list of row objects as CSV text: a header line from the first
/// row's keys (insertion order, as produced by `sql::row_to_json`), then one
/// line per row in the same column order.
fn rows_to_csv(rows: &[Value]) -> String {
    let Some(Value::Object(first)) = rows.first() else {
        return String::new();
    };
    let columns: Vec<&String> = first.keys().collect();

    let mut out = String::new();
    out.push_str(&columns.iter().map(|c| sql::csv_escape(c)).collect::<Vec<_>>().join(","));
    out.push_str("\r\n");

    for row in rows {
        let Value::Object(obj) = row else { continue };
        let line = columns
            .iter()
            .map(|c| sql::csv_escape(&sql::json_to_csv_field(obj.get(*c).unwrap_or(&Value::Null))))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push_str("\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_to_csv_renders_header_and_rows() {
        let rows = vec![json!({"id": 1, "name": "a,b"}), json!({"id": 2, "name": "plain"})];
        let csv = rows_to_csv(&rows);
        assert!(csv.starts_with("id,name\r\n"));
        assert!(csv.contains("1,\"a,b\"\r\n"));
        assert!(csv.contains("2,plain\r\n"));
    }

    #[test]
    fn rows_to_csv_handles_empty_input() {
        assert_eq!(rows_to_csv(&[]), "");
    }
}
