//! SQL helpers shared by every tool: identifier escaping, the guarded
//! `USE [database]` switch, tiberius `Row` → JSON conversion, and CSV
//! field escaping.

use mssql_mcp_error::{McpError, Result};
use mssql_mcp_pool::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use tiberius::{ColumnType, Row};

/// Bracket-quote a single identifier, rejecting names that themselves
/// contain `]` (spec §4.5: "names containing `]` are rejected as
/// ErrValidation"). Never accepts a dotted or already-bracketed name —
/// callers bracket each part of a multi-part name separately.
pub fn ident(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(McpError::validation("identifier must not be empty"));
    }
    if name.contains(']') {
        return Err(McpError::validation(format!(
            "identifier {name:?} contains ']' and cannot be safely bracketed"
        )));
    }
    Ok(format!("[{name}]"))
}

/// Default schema per spec §4.5 ("schema defaults to dbo").
pub fn schema_or_default(schema: Option<&str>) -> &str {
    schema.unwrap_or("dbo")
}

/// Issue a guarded `USE [name]` against the borrowed connection if a
/// database override was requested. A bare identifier check keeps this from
/// ever becoming a second injection surface.
pub async fn use_database(client: &mut Client, database: Option<&str>) -> Result<()> {
    let Some(name) = database else {
        return Ok(());
    };
    let bracketed = ident(name)?;
    client
        .simple_query(format!("USE {bracketed}"))
        .await
        .map_err(|e| McpError::sql_execution(format!("failed to switch to database {name:?}: {e}")))?
        .into_results()
        .await
        .map_err(|e| McpError::sql_execution(e.to_string()))?;
    Ok(())
}

/// Run a statement expected to return rows (spec classification `ReadOnly`
/// or `Empty`) and collect every resultset as JSON objects.
pub async fn query_recordsets(client: &mut Client, sql: &str) -> Result<Vec<Vec<Value>>> {
    let stream = client
        .simple_query(sql)
        .await
        .map_err(|e| McpError::sql_execution(e.to_string()))?;
    let results = stream
        .into_results()
        .await
        .map_err(|e| McpError::sql_execution(e.to_string()))?;
    Ok(results
        .into_iter()
        .map(|rows| rows.iter().map(|r| Value::Object(row_to_json(r))).collect())
        .collect())
}

/// Run a statement that mutates data (spec classification `Dml`/`Ddl`/
/// `Admin`) and report the server's row-affected counts. No resultset is
/// expected, matching `Client::execute`'s contract.
pub async fn execute_statement(client: &mut Client, sql: &str) -> Result<Vec<u64>> {
    let result = client
        .execute(sql, &[])
        .await
        .map_err(|e| McpError::sql_execution(e.to_string()))?;
    Ok(result.rows_affected().to_vec())
}

/// Run a single plain query and flatten to one list of rows — the shape
/// every schema-introspection tool needs (`list_databases`, `list_tables`,
/// DMV reads, …).
pub async fn query_rows(client: &mut Client, sql: &str) -> Result<Vec<Value>> {
    let mut sets = query_recordsets(client, sql).await?;
    Ok(sets.pop().unwrap_or_default())
}

/// Convert one `tiberius::Row` into a JSON object keyed by column name,
/// dispatching the value conversion on the column's wire type so numeric and
/// temporal columns come back as native JSON types rather than strings.
pub fn row_to_json(row: &Row) -> serde_json::Map<String, Value> {
    let mut obj = serde_json::Map::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = column_value(row, idx, column.column_type());
        obj.insert(column.name().to_string(), value);
    }
    obj
}

fn column_value(row: &Row, idx: usize, column_type: ColumnType) -> Value {
    use ColumnType::*;
    match column_type {
        Null => Value::Null,
        Bit | Bitn => row
            .try_get::<bool, _>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        Int1 => get_number::<u8>(row, idx),
        Int2 => get_number::<i16>(row, idx),
        Int4 => get_number::<i32>(row, idx),
        Int8 => get_number::<i64>(row, idx),
        Intn => row
            .try_get::<i64, _>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),
        Float4 => get_float::<f32>(row, idx),
        Float8 | Floatn => get_float::<f64>(row, idx),
        Money | Money4 | Moneyn | Decimaln | Numericn => row
            .try_get::<Decimal, _>(idx)
            .ok()
            .flatten()
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),
        Guid => row
            .try_get::<uuid::Uuid, _>(idx)
            .ok()
            .flatten()
            .map(|u| Value::String(u.to_string()))
            .unwrap_or(Value::Null),
        Datetime | Datetime4 | Datetimen | Daten | Timen | Datetime2 | DatetimeOffsetn => row
            .try_get::<&str, _>(idx)
            .ok()
            .flatten()
            .map(|s| Value::String(s.to_string()))
            .or_else(|| {
                row.try_get::<chrono::NaiveDateTime, _>(idx)
                    .ok()
                    .flatten()
                    .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            })
            .unwrap_or(Value::Null),
        BigVarChar | BigChar | NVarchar | NChar | Text | NText | Xml => row
            .try_get::<&str, _>(idx)
            .ok()
            .flatten()
            .map(|s| Value::String(s.to_string()))
            .unwrap_or(Value::Null),
        BigVarBin | BigBinary | Image | Udt | SSVariant => Value::String("[binary]".to_string()),
    }
}

fn get_number<T>(row: &Row, idx: usize) -> Value
where
    T: for<'a> tiberius::FromSql<'a> + Into<i64>,
{
    row.try_get::<T, _>(idx)
        .ok()
        .flatten()
        .map(|v| Value::Number(v.into().into()))
        .unwrap_or(Value::Null)
}

fn get_float<T>(row: &Row, idx: usize) -> Value
where
    T: for<'a> tiberius::FromSql<'a> + Into<f64>,
{
    row.try_get::<T, _>(idx)
        .ok()
        .flatten()
        .and_then(|v| serde_json::Number::from_f64(v.into()))
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// RFC 4180-style CSV field escaping (spec §4.5's `export_table_csv` rule):
/// a field containing a comma, double quote, or newline is wrapped in
/// quotes with any embedded quote doubled.
pub fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Render a JSON value as the CSV cell text `export_table_csv` writes: null
/// and absent values become empty fields, everything else renders as its
/// plain (unquoted-yet) text for `csv_escape` to then wrap if needed.
pub fn json_to_csv_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_brackets_a_plain_name() {
        assert_eq!(ident("dbo").unwrap(), "[dbo]");
    }

    #[test]
    fn ident_rejects_embedded_bracket() {
        assert!(ident("evil]; DROP TABLE x --").is_err());
    }

    #[test]
    fn ident_rejects_empty_name() {
        assert!(ident("").is_err());
    }

    #[test]
    fn schema_defaults_to_dbo() {
        assert_eq!(schema_or_default(None), "dbo");
        assert_eq!(schema_or_default(Some("sales")), "sales");
    }

    #[test]
    fn csv_escape_wraps_fields_with_special_characters() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("line1\nline2"), "\"line1\nline2\"");
    }

    #[test]
    fn json_to_csv_field_renders_null_as_empty() {
        assert_eq!(json_to_csv_field(&Value::Null), "");
        assert_eq!(json_to_csv_field(&Value::String("x".into())), "x");
        assert_eq!(json_to_csv_field(&serde_json::json!(42)), "42");
    }
}
