//! Tool registry: the fixed catalog the dispatcher serves on `tools/list`
//! and dispatches against on `tools/call` (spec §4.6).

use std::collections::HashMap;

use mssql_mcp_error::{McpError, Result};
use mssql_mcp_protocol::ToolDefinition;
use serde_json::Value;

use crate::tools::{
    advisor::{AnalyzeQueryPerformanceTool, DetectQueryBottlenecksTool, GetOptimizationInsightsTool},
    data::{ExportTableCsvTool, GetTableDataTool},
    performance::{GetConnectionHealthTool, GetPerformanceStatsTool, GetQueryPerformanceTool},
    query::{ExecuteQueryTool, ExplainQueryTool},
    schema::{DescribeTableTool, GetIndexRecommendationsTool, ListDatabasesTool, ListForeignKeysTool, ListTablesTool},
};
use crate::{AppContext, McpTool};

/// Owns one boxed instance of every registered tool.
pub struct ToolRegistry {
    tools: HashMap<&'static str, Box<dyn McpTool>>,
}

impl ToolRegistry {
    /// Build the registry with the fixed catalog from spec §6 — exactly
    /// these 15 tools, no more, no fewer.
    pub fn new() -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
        };

        registry.register(Box::new(ExecuteQueryTool));
        registry.register(Box::new(ListDatabasesTool));
        registry.register(Box::new(ListTablesTool));
        registry.register(Box::new(DescribeTableTool));
        registry.register(Box::new(GetTableDataTool));
        registry.register(Box::new(ListForeignKeysTool));
        registry.register(Box::new(ExportTableCsvTool));
        registry.register(Box::new(ExplainQueryTool));
        registry.register(Box::new(GetPerformanceStatsTool));
        registry.register(Box::new(GetQueryPerformanceTool));
        registry.register(Box::new(GetConnectionHealthTool));
        registry.register(Box::new(GetIndexRecommendationsTool));
        registry.register(Box::new(AnalyzeQueryPerformanceTool));
        registry.register(Box::new(DetectQueryBottlenecksTool));
        registry.register(Box::new(GetOptimizationInsightsTool));

        tracing::debug!(count = registry.tools.len(), "tool registry initialized");
        registry
    }

    fn register(&mut self, tool: Box<dyn McpTool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn call_tool(&self, ctx: &AppContext, name: &str, arguments: Value) -> Result<Value> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| McpError::unknown_tool(name))?;
        tool.execute(ctx, arguments).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_has_exactly_the_fifteen_spec_tools() {
        let registry = ToolRegistry::new();
        let names: Vec<&str> = registry.tools.keys().copied().collect();
        assert_eq!(names.len(), 15);
        for expected in [
            "execute_query",
            "list_databases",
            "list_tables",
            "describe_table",
            "get_table_data",
            "list_foreign_keys",
            "export_table_csv",
            "explain_query",
            "get_performance_stats",
            "get_query_performance",
            "get_connection_health",
            "get_index_recommendations",
            "analyze_query_performance",
            "detect_query_bottlenecks",
            "get_optimization_insights",
        ] {
            assert!(names.contains(&expected), "missing tool {expected}");
        }
    }

    #[test]
    fn unknown_tool_name_is_rejected() {
        let registry = ToolRegistry::new();
        assert!(!registry.tools.contains_key("frobnicate"));
    }
}
