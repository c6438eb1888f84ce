//! MSSQL MCP server binary: the dispatcher loop and process lifecycle.
//!
//! Reads one JSON-RPC request per line from stdin, dispatches each to its
//! own task so concurrent tool calls never block one another, and funnels
//! every response through a single writer task so stdout never interleaves
//! two partial frames. Shutdown drains in-flight calls within a bounded
//! grace period before closing the connection pool.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mssql_mcp_config::{EnvSecretSource, ServerConfig};
use mssql_mcp_logging::{init_logging, Audit, AuditLog, LogConfig, NullAuditLog};
use mssql_mcp_observatory::Observatory;
use mssql_mcp_pool::{ConnectionManager, ConnectionSettings, PoolSettings};
use mssql_mcp_protocol::{
    methods, ClientCapabilities, ClientInfo, ErrorCode, InitializeResult, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, ServerCapabilities, ServerInfo, ToolCallParams,
    ToolCallResult, ToolsCapability, ToolsListResult, MCP_PROTOCOL_VERSION,
};
use mssql_mcp_tools::{AppContext, OutputBudget, ToolRegistry};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Bound on how long in-flight tool calls get to finish once shutdown is
/// requested, before they are aborted outright.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "mssql-mcp-server", about = "MCP server for SQL Server tool access")]
struct Cli {
    /// Force debug-level logging regardless of the logLevel/debug env vars.
    #[arg(long)]
    debug: bool,

    /// Reserved for a future file-based configuration override. Environment
    /// variables remain authoritative — this server is meant to be launched
    /// by a host process with its environment already set, not configured
    /// interactively.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = cli.config;

    let config = match ServerConfig::from_env(&EnvSecretSource) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(LogConfig {
        debug: config.debug || cli.debug,
        log_level: config.log_level.clone(),
    }) {
        eprintln!("fatal: failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let observatory = Arc::new(Observatory::new(
        config.perf_enabled,
        config.perf_max_history,
        config.slow_query_ms,
        config.perf_sampling_rate,
        config.track_pool,
    ));

    let pool = Arc::new(ConnectionManager::new(PoolSettings {
        connection: ConnectionSettings {
            host: config.host.clone(),
            port: config.port,
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            domain: config.domain.clone(),
            encrypt: config.encrypt,
            trust_server_certificate: config.trust_server_certificate,
            application_name: "mssql-mcp-server".to_string(),
        },
        pool_max: config.pool_max,
        pool_min: config.pool_min,
        pool_idle_ms: config.pool_idle_ms,
        connect_timeout_ms: config.connect_timeout_ms,
        max_retries: config.max_retries,
        retry_delay_ms: config.retry_delay_ms,
    }));

    let audit = Arc::new(if config.audit_enabled {
        match AuditLog::new(audit_log_path()) {
            Ok(log) => Audit::File(log),
            Err(e) => {
                eprintln!("fatal: failed to open audit log: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        Audit::Disabled(NullAuditLog)
    });

    let output_budget = OutputBudget::from_config(config.stream_response_limit_bytes);
    let config = Arc::new(config);

    // Eager connect at startup. Failure is logged but non-fatal: the
    // dispatcher still starts serving, and the first tool call that needs a
    // connection retries the establishment protocol itself.
    match pool.connect().await {
        Ok(()) => info!("initial connection established"),
        Err(e) => warn!(error = %e, "initial connection attempt failed; will retry on first tool call"),
    }

    print_startup_banner(&config);

    let ctx = Arc::new(AppContext {
        config,
        pool: pool.clone(),
        observatory,
        audit,
        output_budget,
    });
    let registry = Arc::new(ToolRegistry::new());

    let exit_code = run_dispatcher(ctx, registry).await;

    pool.close().await;
    info!("shutdown complete");
    exit_code
}

fn audit_log_path() -> std::path::PathBuf {
    std::env::var("auditLogPath")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("mcp_audit.ndjson"))
}

fn print_startup_banner(config: &ServerConfig) {
    let posture = if config.is_secure_posture() {
        "SECURE".to_string()
    } else {
        format!("UNSAFE (relaxed: {})", config.relaxed_flags().join(", "))
    };
    eprintln!("mssql-mcp-server starting");
    eprintln!("  target:        {}:{}/{}", config.host, config.port, config.database);
    eprintln!(
        "  encrypt:       {} (trustServerCertificate={})",
        config.encrypt, config.trust_server_certificate
    );
    eprintln!(
        "  pool:          min={} max={} idleMs={}",
        config.pool_min, config.pool_max, config.pool_idle_ms
    );
    eprintln!("  safety policy: {posture}");
    eprintln!(
        "  perf tracking: {} (maxHistory={}, slowQueryMs={}, samplingRate={})",
        config.perf_enabled, config.perf_max_history, config.slow_query_ms, config.perf_sampling_rate
    );
    eprintln!("  audit log:     {}", config.audit_enabled);
}

/// Read one framed JSON-RPC request per stdin line, dispatch each on its own
/// task, and serialize every write through a single writer task. There is no
/// guarantee that responses are written in request order — only that each
/// carries the `id` of the request it answers.
async fn run_dispatcher(ctx: Arc<AppContext>, registry: Arc<ToolRegistry>) -> ExitCode {
    let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();

    let writer_task = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            let json = match serde_json::to_string(&response) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "failed to serialize response envelope");
                    continue;
                }
            };
            debug!(response = %json, "sending");
            if stdout.write_all(json.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut tasks: JoinSet<()> = JoinSet::new();

    info!("dispatcher ready");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let ctx = ctx.clone();
                        let registry = registry.clone();
                        let tx = tx.clone();
                        tasks.spawn(async move {
                            if let Some(response) = handle_line(&ctx, &registry, &line).await {
                                let _ = tx.send(response);
                            }
                        });
                    }
                    Ok(None) => {
                        info!("stdin closed, shutting down");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "failed to read from stdin, shutting down");
                        break;
                    }
                }
            }
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    drop(tx);
    let drain = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drain.is_err() {
        warn!("shutdown grace period elapsed with tasks still in flight; aborting them");
        tasks.abort_all();
    }
    let _ = writer_task.await;

    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler, relying on Ctrl-C only");
            std::future::pending::<()>().await;
            unreachable!()
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Parse one line as a JSON-RPC request and dispatch it. Returns `None` for
/// the `notifications/initialized` notification, which carries no `id` and
/// never gets a response written.
async fn handle_line(ctx: &AppContext, registry: &ToolRegistry, line: &str) -> Option<JsonRpcResponse> {
    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            return Some(JsonRpcResponse::error(
                None,
                JsonRpcError::new(ErrorCode::ParseError, format!("invalid JSON: {e}")),
            ));
        }
    };

    if request.id.is_none() {
        handle_notification(&request);
        return None;
    }

    Some(handle_request(ctx, registry, request).await)
}

fn handle_notification(request: &JsonRpcRequest) {
    if request.method != methods::INITIALIZED {
        debug!(method = %request.method, "ignoring unrecognized notification");
    }
}

async fn handle_request(ctx: &AppContext, registry: &ToolRegistry, request: JsonRpcRequest) -> JsonRpcResponse {
    match request.method.as_str() {
        methods::INITIALIZE => handle_initialize(request),
        methods::TOOLS_LIST => handle_tools_list(registry, request),
        methods::TOOLS_CALL => handle_tools_call(ctx, registry, request).await,
        methods::PING => JsonRpcResponse::success(request.id, Value::Object(Default::default())),
        other => JsonRpcResponse::error(
            request.id,
            JsonRpcError::new(ErrorCode::MethodNotFound, format!("unknown method: {other}")),
        ),
    }
}

fn handle_initialize(request: JsonRpcRequest) -> JsonRpcResponse {
    let _client: Option<ClientCapabilities> = request
        .params
        .as_ref()
        .and_then(|p| p.get("capabilities"))
        .and_then(|c| serde_json::from_value(c.clone()).ok());
    let _client_info: Option<ClientInfo> = request
        .params
        .as_ref()
        .and_then(|p| p.get("clientInfo"))
        .and_then(|c| serde_json::from_value(c.clone()).ok());

    let result = InitializeResult {
        protocol_version: MCP_PROTOCOL_VERSION.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability { list_changed: false }),
            resources: None,
            prompts: None,
            logging: None,
        },
        server_info: ServerInfo {
            name: "mssql-mcp-server".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };
    JsonRpcResponse::success(
        request.id,
        serde_json::to_value(result).expect("InitializeResult always serializes"),
    )
}

fn handle_tools_list(registry: &ToolRegistry, request: JsonRpcRequest) -> JsonRpcResponse {
    let result = ToolsListResult {
        tools: registry.list_tools(),
    };
    JsonRpcResponse::success(
        request.id,
        serde_json::to_value(result).expect("ToolsListResult always serializes"),
    )
}

async fn handle_tools_call(ctx: &AppContext, registry: &ToolRegistry, request: JsonRpcRequest) -> JsonRpcResponse {
    let params: ToolCallParams = match request.params.and_then(|p| serde_json::from_value(p).ok()) {
        Some(params) => params,
        None => {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(ErrorCode::InvalidParams, "missing or malformed tool call params"),
            );
        }
    };

    info!(tool = %params.name, "tool call");

    match registry.call_tool(ctx, &params.name, params.arguments).await {
        Ok(value) => {
            let text = serde_json::to_string(&value).unwrap_or_else(|e| {
                error!(error = %e, "failed to serialize tool result");
                format!("{{\"error\":\"serialization failed: {e}\"}}")
            });
            let result = ToolCallResult::text(text);
            JsonRpcResponse::success(
                request.id,
                serde_json::to_value(result).expect("ToolCallResult always serializes"),
            )
        }
        Err(e) => {
            warn!(error = %e, tool = %params.name, "tool call failed");
            JsonRpcResponse::error(request.id, JsonRpcError::new(protocol_error_code(&e), e.to_string()))
        }
    }
}

fn protocol_error_code(e: &mssql_mcp_error::McpError) -> ErrorCode {
    match e {
        mssql_mcp_error::McpError::PolicyDenied(_) => ErrorCode::InvalidRequest,
        mssql_mcp_error::McpError::Validation(_) => ErrorCode::InvalidParams,
        mssql_mcp_error::McpError::UnknownTool(_) => ErrorCode::MethodNotFound,
        _ => ErrorCode::ServerError(e.rpc_code()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_code_maps_policy_denied_to_invalid_request() {
        let e = mssql_mcp_error::McpError::policy_denied("DDL denied");
        assert_eq!(protocol_error_code(&e).as_i32(), -32600);
    }

    #[test]
    fn protocol_error_code_maps_unknown_tool_to_method_not_found() {
        let e = mssql_mcp_error::McpError::unknown_tool("frobnicate");
        assert_eq!(protocol_error_code(&e).as_i32(), -32601);
    }

    #[test]
    fn protocol_error_code_maps_sql_execution_to_server_error_range() {
        let e = mssql_mcp_error::McpError::sql_execution("syntax error");
        assert_eq!(protocol_error_code(&e).as_i32(), -32004);
    }

    #[test]
    fn audit_log_path_defaults_when_env_unset() {
        std::env::remove_var("auditLogPath");
        assert_eq!(audit_log_path(), std::path::PathBuf::from("mcp_audit.ndjson"));
    }
}
