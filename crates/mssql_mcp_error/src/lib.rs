//! Shared error taxonomy for the MSSQL MCP server.
//!
//! Every subsystem (config, pool, safety, tools, dispatcher) returns errors
//! through this single enum. `McpError` never carries credentials: callers
//! are responsible for redacting secrets before they reach a variant's
//! message (see `mssql_mcp_logging::redact`).

use serde::Serialize;
use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, McpError>;

/// The closed error taxonomy from spec §7.
#[derive(Debug, Error)]
pub enum McpError {
    /// Malformed or missing required configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Cumulative initial-connect failure or mid-session driver disconnect.
    #[error("connection error: {0}")]
    Connection(String),

    /// Borrow or statement timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The safety policy engine refused the statement.
    #[error("denied by safety policy: {0}")]
    PolicyDenied(String),

    /// A tool argument violated a precondition.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// `call_tool` named a tool outside the registered catalog.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The server returned a SQL-level error (syntax, permission, constraint).
    #[error("SQL execution error: {0}")]
    SqlExecution(String),

    /// Any other unexpected fault.
    #[error("internal error: {0}")]
    Internal(String),
}

impl McpError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn policy_denied(msg: impl Into<String>) -> Self {
        Self::PolicyDenied(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unknown_tool(msg: impl Into<String>) -> Self {
        Self::UnknownTool(msg.into())
    }

    pub fn sql_execution(msg: impl Into<String>) -> Self {
        Self::SqlExecution(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Kind tag used for logging and for the `errorKind` field on query records.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::PolicyDenied(_) => ErrorKind::PolicyDenied,
            Self::Validation(_) => ErrorKind::Validation,
            Self::UnknownTool(_) => ErrorKind::UnknownTool,
            Self::SqlExecution(_) => ErrorKind::SqlExecution,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// JSON-RPC error code this error maps to at the protocol boundary.
    ///
    /// `ErrConfig` never actually reaches the wire (it is fatal at startup,
    /// before the dispatcher is serving requests) but is included for
    /// completeness and for tests that exercise the mapping directly.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::Config(_) => -32001,
            Self::Connection(_) => -32002,
            Self::Timeout(_) => -32003,
            Self::PolicyDenied(_) => -32600, // InvalidRequest
            Self::Validation(_) => -32602,   // InvalidParams
            Self::UnknownTool(_) => -32601,  // MethodNotFound
            Self::SqlExecution(_) => -32004,
            Self::Internal(_) => -32603, // InternalError
        }
    }
}

/// Tagged, serializable form of the error kind (used in query records and
/// in structured log attributes, where the full message may be redacted
/// independently).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Connection,
    Timeout,
    PolicyDenied,
    Validation,
    UnknownTool,
    SqlExecution,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_codes_match_spec_table() {
        assert_eq!(McpError::policy_denied("x").rpc_code(), -32600);
        assert_eq!(McpError::validation("x").rpc_code(), -32602);
        assert_eq!(McpError::unknown_tool("x").rpc_code(), -32601);
        assert_eq!(McpError::internal("x").rpc_code(), -32603);
    }

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(McpError::timeout("x").kind(), ErrorKind::Timeout);
        assert_eq!(
            serde_json::to_string(&ErrorKind::PolicyDenied).unwrap(),
            "\"policy_denied\""
        );
    }
}
