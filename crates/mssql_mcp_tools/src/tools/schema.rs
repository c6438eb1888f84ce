//! Schema introspection tools (spec §4.5): `list_databases`, `list_tables`,
//! `describe_table`, `list_foreign_keys`, `get_index_recommendations`.
//!
//! None of these run caller-supplied SQL text (beyond a validated identifier
//! interpolated into a fixed catalog/DMV query), so none of them go through
//! the C3 classify+authorize gate — they are read-only by construction.

use async_trait::async_trait;
use mssql_mcp_error::{McpError, Result};
use mssql_mcp_observatory::QueryOutcome;
use serde_json::{json, Value};

use super::{opt_str, opt_u64, require_str};
use crate::sql::{self, schema_or_default};
use crate::tools::borrow_connection;
use crate::{AppContext, McpTool};

const SYSTEM_DATABASES: &[&str] = &["master", "tempdb", "model", "msdb"];

pub struct ListDatabasesTool;

#[async_trait]
impl McpTool for ListDatabasesTool {
    fn name(&self) -> &'static str {
        "list_databases"
    }

    fn description(&self) -> &'static str {
        "List user databases on the connected SQL Server instance, excluding the fixed system databases."
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, ctx: &AppContext, _arguments: Value) -> Result<Value> {
        let token = ctx.observatory.start_query(self.name(), "sys.databases", None);
        let mut conn = borrow_connection(ctx, None).await?;

        let excluded = SYSTEM_DATABASES
            .iter()
            .map(|n| format!("'{n}'"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql_text = format!(
            "SELECT name, database_id, create_date, collation_name, state_desc \
             FROM sys.databases WHERE name NOT IN ({excluded}) ORDER BY name"
        );

        match sql::query_rows(&mut conn, &sql_text).await {
            Ok(rows) => {
                ctx.observatory.end_query(token, QueryOutcome::success(Vec::new(), rows.len() as i64));
                Ok(json!({ "databases": rows }))
            }
            Err(e) => {
                ctx.observatory.end_query(token, QueryOutcome::failure(e.kind(), &e.to_string()));
                Err(e)
            }
        }
    }
}

pub struct ListTablesTool;

#[async_trait]
impl McpTool for ListTablesTool {
    fn name(&self) -> &'static str {
        "list_tables"
    }

    fn description(&self) -> &'static str {
        "List tables in a schema (defaults to dbo), optionally in a different database."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "database": { "type": "string" },
                "schema": { "type": "string", "default": "dbo" }
            }
        })
    }

    async fn execute(&self, ctx: &AppContext, arguments: Value) -> Result<Value> {
        let database = opt_str(&arguments, "database");
        let schema = schema_or_default(opt_str(&arguments, "schema"));
        sql::ident(schema)?;

        let token = ctx.observatory.start_query(self.name(), "information_schema.tables", database);
        let mut conn = borrow_connection(ctx, database).await?;

        let sql_text = format!(
            "SELECT TABLE_CATALOG AS [database], TABLE_SCHEMA AS [schema], TABLE_NAME AS [table], TABLE_TYPE AS [tableType] \
             FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = '{schema}' ORDER BY TABLE_NAME"
        );

        match sql::query_rows(&mut conn, &sql_text).await {
            Ok(rows) => {
                ctx.observatory.end_query(token, QueryOutcome::success(Vec::new(), rows.len() as i64));
                Ok(json!({ "tables": rows }))
            }
            Err(e) => {
                ctx.observatory.end_query(token, QueryOutcome::failure(e.kind(), &e.to_string()));
                Err(e)
            }
        }
    }
}

pub struct DescribeTableTool;

#[async_trait]
impl McpTool for DescribeTableTool {
    fn name(&self) -> &'static str {
        "describe_table"
    }

    fn description(&self) -> &'static str {
        "Describe a table's columns: data type, length/precision/scale, nullability, default, and primary-key membership."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tableName": { "type": "string" },
                "database": { "type": "string" },
                "schema": { "type": "string", "default": "dbo" }
            },
            "required": ["tableName"]
        })
    }

    async fn execute(&self, ctx: &AppContext, arguments: Value) -> Result<Value> {
        let table_name = require_str(&arguments, "tableName")?;
        let database = opt_str(&arguments, "database");
        let schema = schema_or_default(opt_str(&arguments, "schema"));
        sql::ident(table_name)?;
        sql::ident(schema)?;

        let token = ctx.observatory.start_query(self.name(), table_name, database);
        let mut conn = borrow_connection(ctx, database).await?;

        let sql_text = format!(
            "SELECT c.COLUMN_NAME AS [name], c.DATA_TYPE AS [dataType], \
                    c.CHARACTER_MAXIMUM_LENGTH AS [maxLength], c.NUMERIC_PRECISION AS [precision], \
                    c.NUMERIC_SCALE AS [scale], c.IS_NULLABLE AS [isNullable], \
                    c.COLUMN_DEFAULT AS [columnDefault], \
                    CASE WHEN pk.COLUMN_NAME IS NOT NULL THEN CAST(1 AS BIT) ELSE CAST(0 AS BIT) END AS [isPrimaryKey] \
             FROM INFORMATION_SCHEMA.COLUMNS c \
             LEFT JOIN ( \
                 SELECT ku.TABLE_SCHEMA, ku.TABLE_NAME, ku.COLUMN_NAME \
                 FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
                 JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE ku \
                     ON tc.CONSTRAINT_NAME = ku.CONSTRAINT_NAME AND tc.TABLE_SCHEMA = ku.TABLE_SCHEMA \
                 WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY' \
             ) pk ON pk.TABLE_SCHEMA = c.TABLE_SCHEMA AND pk.TABLE_NAME = c.TABLE_NAME AND pk.COLUMN_NAME = c.COLUMN_NAME \
             WHERE c.TABLE_SCHEMA = '{schema}' AND c.TABLE_NAME = '{table_name}' \
             ORDER BY c.ORDINAL_POSITION"
        );

        match sql::query_rows(&mut conn, &sql_text).await {
            Ok(rows) => {
                ctx.observatory.end_query(token, QueryOutcome::success(Vec::new(), rows.len() as i64));
                Ok(json!({ "table": table_name, "schema": schema, "columns": rows }))
            }
            Err(e) => {
                ctx.observatory.end_query(token, QueryOutcome::failure(e.kind(), &e.to_string()));
                Err(e)
            }
        }
    }
}

pub struct ListForeignKeysTool;

#[async_trait]
impl McpTool for ListForeignKeysTool {
    fn name(&self) -> &'static str {
        "list_foreign_keys"
    }

    fn description(&self) -> &'static str {
        "List foreign key constraints in a schema: parent/referenced table and column, and the ON DELETE/ON UPDATE actions."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "database": { "type": "string" },
                "schema": { "type": "string", "default": "dbo" }
            }
        })
    }

    async fn execute(&self, ctx: &AppContext, arguments: Value) -> Result<Value> {
        let database = opt_str(&arguments, "database");
        let schema = schema_or_default(opt_str(&arguments, "schema"));
        sql::ident(schema)?;

        let token = ctx.observatory.start_query(self.name(), "sys.foreign_keys", database);
        let mut conn = borrow_connection(ctx, database).await?;

        let sql_text = format!(
            "SELECT fk.name AS [constraint], \
                    tp.name AS [parentTable], cp.name AS [parentColumn], \
                    tr.name AS [referencedTable], cr.name AS [referencedColumn], \
                    fk.delete_referential_action_desc AS [onDelete], \
                    fk.update_referential_action_desc AS [onUpdate], \
                    fk.is_disabled AS [disabled] \
             FROM sys.foreign_keys fk \
             JOIN sys.foreign_key_columns fkc ON fkc.constraint_object_id = fk.object_id \
             JOIN sys.tables tp ON tp.object_id = fk.parent_object_id \
             JOIN sys.columns cp ON cp.object_id = fkc.parent_object_id AND cp.column_id = fkc.parent_column_id \
             JOIN sys.tables tr ON tr.object_id = fk.referenced_object_id \
             JOIN sys.columns cr ON cr.object_id = fkc.referenced_object_id AND cr.column_id = fkc.referenced_column_id \
             JOIN sys.schemas s ON s.schema_id = tp.schema_id \
             WHERE s.name = '{schema}' \
             ORDER BY tp.name"
        );

        match sql::query_rows(&mut conn, &sql_text).await {
            Ok(rows) => {
                ctx.observatory.end_query(token, QueryOutcome::success(Vec::new(), rows.len() as i64));
                Ok(json!({ "foreignKeys": rows }))
            }
            Err(e) => {
                ctx.observatory.end_query(token, QueryOutcome::failure(e.kind(), &e.to_string()));
                Err(e)
            }
        }
    }
}

pub struct GetIndexRecommendationsTool;

#[async_trait]
impl McpTool for GetIndexRecommendationsTool {
    fn name(&self) -> &'static str {
        "get_index_recommendations"
    }

    fn description(&self) -> &'static str {
        "Read the server's missing-index DMVs and recommend indexes ordered by average user impact."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "database": { "type": "string" },
                "schema": { "type": "string", "default": "dbo" },
                "limit": { "type": "integer", "default": 10 },
                "impactThreshold": { "type": "number", "description": "Minimum avg_user_impact, 0-100" }
            }
        })
    }

    async fn execute(&self, ctx: &AppContext, arguments: Value) -> Result<Value> {
        let database = opt_str(&arguments, "database");
        let schema = schema_or_default(opt_str(&arguments, "schema"));
        sql::ident(schema)?;
        let limit = opt_u64(&arguments, "limit").filter(|&n| n > 0).unwrap_or(10);
        let impact_threshold = match arguments.get("impactThreshold").and_then(Value::as_f64) {
            Some(v) if !(0.0..=100.0).contains(&v) => {
                return Err(McpError::validation(format!(
                    "impactThreshold ({v}) must be within [0, 100]"
                )))
            }
            other => other.unwrap_or(0.0),
        };

        let token = ctx.observatory.start_query(self.name(), "sys.dm_db_missing_index_details", database);
        let mut conn = borrow_connection(ctx, database).await?;

        let sql_text = format!(
            "SELECT TOP ({limit}) \
                    mid.statement AS [table], mid.equality_columns AS [equalityColumns], \
                    mid.inequality_columns AS [inequalityColumns], mid.included_columns AS [includedColumns], \
                    migs.avg_user_impact AS [avgUserImpact], migs.avg_total_user_cost AS [avgTotalUserCost], \
                    migs.user_seeks AS [userSeeks] \
             FROM sys.dm_db_missing_index_groups mig \
             JOIN sys.dm_db_missing_index_group_stats migs ON migs.group_handle = mig.index_group_handle \
             JOIN sys.dm_db_missing_index_details mid ON mid.index_handle = mig.index_handle \
             WHERE migs.avg_user_impact >= {impact_threshold} \
             ORDER BY migs.avg_user_impact DESC"
        );
        let _ = schema; // schema currently only used as an argument-shape placeholder; SQL Server's missing-index DMVs are not schema-scoped.

        match sql::query_rows(&mut conn, &sql_text).await {
            Ok(rows) => {
                ctx.observatory.end_query(token, QueryOutcome::success(Vec::new(), rows.len() as i64));
                Ok(json!({ "recommendations": rows }))
            }
            Err(e) => {
                ctx.observatory.end_query(token, QueryOutcome::failure(e.kind(), &e.to_string()));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_databases_schema_has_no_required_args() {
        let schema = ListDatabasesTool.input_schema();
        assert_eq!(schema["type"], "object");
    }

    #[test]
    fn describe_table_requires_table_name() {
        let schema = DescribeTableTool.input_schema();
        assert_eq!(schema["required"][0], "tableName");
    }
}
