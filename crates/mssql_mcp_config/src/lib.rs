//! Configuration snapshot for the MSSQL MCP server.
//!
//! Resolves environment variables into an immutable [`ServerConfig`],
//! applying documented defaults and rejecting malformed values with
//! `McpError::Config`. Also hosts the context-aware SSL trust derivation
//! that config loading consults when `trustServerCertificate` is unset.

use std::collections::HashMap;

use mssql_mcp_error::{McpError, Result};
use serde::Serialize;

/// A secret-resolution backend. `EnvSecretSource` is the only implementation
/// this crate ships; AWS/Azure-backed sources are external collaborators
/// that would implement this trait but live outside this workspace.
pub trait SecretSource {
    /// Fetch `user`/`password` (or any other named secret). Returns `None`
    /// if the key is not present in this source, `Err` if the source itself
    /// is unreachable or misconfigured.
    fn get(&self, key: &str) -> Result<Option<String>>;
}

/// Reads secrets straight from the process environment.
pub struct EnvSecretSource;

impl SecretSource for EnvSecretSource {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match std::env::var(key) {
            Ok(v) => Ok(Some(v)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => {
                Err(McpError::config(format!("{key} is not valid UTF-8")))
            }
        }
    }
}

/// The fully resolved, immutable configuration snapshot (spec §3).
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub domain: String,

    pub encrypt: bool,
    pub trust_server_certificate: bool,

    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,

    pub pool_max: u32,
    pub pool_min: u32,
    pub pool_idle_ms: u64,

    pub read_only_mode: bool,
    pub allow_destructive: bool,
    pub allow_schema_changes: bool,

    pub debug: bool,
    pub log_level: String,
    pub audit_enabled: bool,

    pub perf_enabled: bool,
    pub perf_max_history: usize,
    pub slow_query_ms: u64,
    pub perf_sampling_rate: f64,
    pub track_pool: bool,

    pub streaming_enabled: bool,
    pub stream_batch_rows: u32,
    pub stream_mem_limit_mb: u32,
    pub stream_response_limit_bytes: u64,
}

impl ServerConfig {
    /// Resolve a configuration snapshot from the process environment,
    /// using `secrets` to resolve `user`/`password` (env vars take
    /// precedence when both are present, matching the "host env wins"
    /// posture of a locally-launched tool server).
    pub fn from_env(secrets: &dyn SecretSource) -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars, secrets)
    }

    fn from_map(vars: &HashMap<String, String>, secrets: &dyn SecretSource) -> Result<Self> {
        let get = |k: &str| vars.get(k).cloned();

        let user = get("user")
            .or(secrets.get("user")?)
            .unwrap_or_default();
        let password = get("password")
            .or(secrets.get("password")?)
            .unwrap_or_default();

        let host = get("host").unwrap_or_else(|| "localhost".to_string());
        let port = parse_opt("port", get("port"), 1433)?;
        let database = get("database").unwrap_or_else(|| "master".to_string());
        let domain = get("domain").unwrap_or_default();

        let encrypt = parse_bool("encrypt", get("encrypt"), true)?;
        let environment_tag = get("environmentTag").or_else(|| get("NODE_ENV"));
        let explicit_trust = get("trustServerCertificate");
        let trust_server_certificate = match &explicit_trust {
            Some(v) => parse_bool("trustServerCertificate", Some(v.clone()), false)?,
            None => derive_ssl_trust(&host, environment_tag.as_deref(), None),
        };

        let connect_timeout_ms = parse_opt("connectTimeoutMs", get("connectTimeoutMs"), 15_000)?;
        let request_timeout_ms = parse_opt("requestTimeoutMs", get("requestTimeoutMs"), 30_000)?;
        let max_retries = parse_opt("maxRetries", get("maxRetries"), 3)?;
        let retry_delay_ms = parse_opt("retryDelayMs", get("retryDelayMs"), 1_000)?;

        let pool_max = parse_opt("poolMax", get("poolMax"), 10)?;
        let pool_min = parse_opt("poolMin", get("poolMin"), 0)?;
        let pool_idle_ms = parse_opt("poolIdleMs", get("poolIdleMs"), 30_000)?;
        if pool_min > pool_max {
            return Err(McpError::config(format!(
                "poolMin ({pool_min}) must not exceed poolMax ({pool_max})"
            )));
        }

        let read_only_mode = parse_bool("readOnlyMode", get("readOnlyMode"), true)?;
        let allow_destructive = parse_bool("allowDestructive", get("allowDestructive"), false)?;
        let allow_schema_changes =
            parse_bool("allowSchemaChanges", get("allowSchemaChanges"), false)?;

        let debug = parse_bool("debug", get("debug"), false)?;
        let log_level = get("logLevel").unwrap_or_else(|| "info".to_string());
        let audit_enabled = parse_bool("auditEnabled", get("auditEnabled"), true)?;

        let perf_enabled = parse_bool("perfEnabled", get("perfEnabled"), true)?;
        let perf_max_history = parse_opt("perfMaxHistory", get("perfMaxHistory"), 1_000)?;
        if perf_max_history == 0 {
            return Err(McpError::config("perfMaxHistory must be at least 1"));
        }
        let slow_query_ms = parse_opt("slowQueryMs", get("slowQueryMs"), 1_000)?;
        let perf_sampling_rate: f64 = parse_opt("perfSamplingRate", get("perfSamplingRate"), 1.0)?;
        if !(0.0..=1.0).contains(&perf_sampling_rate) {
            return Err(McpError::config(format!(
                "perfSamplingRate ({perf_sampling_rate}) must be within [0.0, 1.0]"
            )));
        }
        let track_pool = parse_bool("trackPool", get("trackPool"), true)?;

        let streaming_enabled = parse_bool("streamingEnabled", get("streamingEnabled"), false)?;
        let stream_batch_rows = parse_opt("streamBatchRows", get("streamBatchRows"), 1_000)?;
        let stream_mem_limit_mb = parse_opt("streamMemLimitMB", get("streamMemLimitMB"), 100)?;
        let stream_response_limit_bytes = parse_opt(
            "streamResponseLimitBytes",
            get("streamResponseLimitBytes"),
            10 * 1024 * 1024,
        )?;

        Ok(Self {
            host,
            port,
            database,
            user,
            password,
            domain,
            encrypt,
            trust_server_certificate,
            connect_timeout_ms,
            request_timeout_ms,
            max_retries,
            retry_delay_ms,
            pool_max,
            pool_min,
            pool_idle_ms,
            read_only_mode,
            allow_destructive,
            allow_schema_changes,
            debug,
            log_level,
            audit_enabled,
            perf_enabled,
            perf_max_history,
            slow_query_ms,
            perf_sampling_rate,
            track_pool,
            streaming_enabled,
            stream_batch_rows,
            stream_mem_limit_mb,
            stream_response_limit_bytes,
        })
    }

    /// True when all three safety flags default to the safe posture
    /// (read-only, no destructive writes, no schema changes).
    pub fn is_secure_posture(&self) -> bool {
        self.read_only_mode && !self.allow_destructive && !self.allow_schema_changes
    }

    /// Names of the flags relaxed away from the secure default, for the
    /// startup banner (empty when `is_secure_posture()` is true).
    pub fn relaxed_flags(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if !self.read_only_mode {
            out.push("readOnlyMode");
        }
        if self.allow_destructive {
            out.push("allowDestructive");
        }
        if self.allow_schema_changes {
            out.push("allowSchemaChanges");
        }
        out
    }
}

fn parse_bool(field: &str, raw: Option<String>, default: bool) -> Result<bool> {
    match raw {
        None => Ok(default),
        Some(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(McpError::config(format!(
                "{field}: expected a boolean, got {s:?}"
            ))),
        },
    }
}

fn parse_opt<T>(field: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    match raw {
        None => Ok(default),
        Some(s) => s
            .trim()
            .parse::<T>()
            .map_err(|_| McpError::config(format!("{field}: could not parse {s:?}"))),
    }
}

/// Context-aware SSL trust derivation (spec §4.1). Pure function: the same
/// `(host, environment_tag, explicit_override)` triple always yields the
/// same result, and no global state is consulted.
///
/// `explicit_override`, when present, always wins; callers normally pass
/// `None` here and handle the explicit-value case themselves (as
/// `ServerConfig::from_env` does), but the parameter is kept so the pure
/// function can be exercised directly in tests against all three inputs
/// named in the spec.
pub fn derive_ssl_trust(
    host: &str,
    environment_tag: Option<&str>,
    explicit_override: Option<bool>,
) -> bool {
    if let Some(explicit) = explicit_override {
        return explicit;
    }

    // Strong indicators: a dev/test tag trusts regardless of host; a
    // loopback host trusts regardless of tag.
    let tag_is_dev = matches!(environment_tag, Some("development") | Some("test"));
    if tag_is_dev || host == "localhost" || host == "127.0.0.1" {
        return true;
    }

    // Weak indicators (.local names, RFC 1918 addresses) only grant trust
    // paired with a dev/test tag, and that combination is already covered
    // above (the tag alone is a strong indicator regardless of host). A
    // private-IP or .local host with no dev/test tag is production posture,
    // same as any other host — e.g. a cloud deployment addressed by a
    // private IP with no tag is not treated as development.
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoSecrets;
    impl SecretSource for NoSecrets {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[test]
    fn defaults_match_spec_table() {
        let cfg = ServerConfig::from_map(&HashMap::new(), &NoSecrets).unwrap();
        assert_eq!(cfg.port, 1433);
        assert_eq!(cfg.connect_timeout_ms, 15_000);
        assert_eq!(cfg.request_timeout_ms, 30_000);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_delay_ms, 1_000);
        assert_eq!(cfg.pool_max, 10);
        assert_eq!(cfg.pool_min, 0);
        assert!(cfg.read_only_mode);
        assert!(!cfg.allow_destructive);
        assert!(!cfg.allow_schema_changes);
        assert_eq!(cfg.perf_max_history, 1_000);
        assert_eq!(cfg.slow_query_ms, 1_000);
        assert_eq!(cfg.perf_sampling_rate, 1.0);
        assert_eq!(cfg.stream_response_limit_bytes, 10 * 1024 * 1024);
        assert!(cfg.is_secure_posture());
    }

    #[test]
    fn malformed_boolean_is_rejected() {
        let mut vars = HashMap::new();
        vars.insert("readOnlyMode".to_string(), "maybe".to_string());
        let err = ServerConfig::from_map(&vars, &NoSecrets).unwrap_err();
        assert_eq!(err.rpc_code(), -32001);
    }

    #[test]
    fn pool_min_exceeding_pool_max_is_rejected() {
        let mut vars = HashMap::new();
        vars.insert("poolMin".to_string(), "20".to_string());
        vars.insert("poolMax".to_string(), "10".to_string());
        assert!(ServerConfig::from_map(&vars, &NoSecrets).is_err());
    }

    #[test]
    fn sampling_rate_out_of_range_is_rejected() {
        let mut vars = HashMap::new();
        vars.insert("perfSamplingRate".to_string(), "1.5".to_string());
        assert!(ServerConfig::from_map(&vars, &NoSecrets).is_err());
    }

    #[test]
    fn relaxed_flags_lists_every_non_default_flag() {
        let mut vars = HashMap::new();
        vars.insert("readOnlyMode".to_string(), "false".to_string());
        vars.insert("allowDestructive".to_string(), "true".to_string());
        let cfg = ServerConfig::from_map(&vars, &NoSecrets).unwrap();
        assert!(!cfg.is_secure_posture());
        assert_eq!(cfg.relaxed_flags(), vec!["readOnlyMode", "allowDestructive"]);
    }

    #[test]
    fn trust_derivation_strong_dev_indicators() {
        assert!(derive_ssl_trust("localhost", None, None));
        assert!(derive_ssl_trust("127.0.0.1", None, None));
        assert!(derive_ssl_trust("db.example.com", Some("development"), None));
        assert!(derive_ssl_trust("db.example.com", Some("test"), None));
    }

    #[test]
    fn trust_derivation_weak_dev_indicators_require_tag() {
        assert!(!derive_ssl_trust("192.168.1.50", None, None));
        assert!(derive_ssl_trust("192.168.1.50", Some("development"), None));
        assert!(derive_ssl_trust("db.local", Some("test"), None));
        assert!(!derive_ssl_trust("db.local", None, None));
    }

    #[test]
    fn trust_derivation_production_posture_by_default() {
        assert!(!derive_ssl_trust("sql.prod.internal", None, None));
        assert!(!derive_ssl_trust("10.1.2.3", None, None));
    }

    #[test]
    fn trust_derivation_explicit_override_always_wins() {
        assert!(!derive_ssl_trust("localhost", Some("development"), Some(false)));
        assert!(derive_ssl_trust("sql.prod.internal", None, Some(true)));
    }

    #[test]
    fn trust_derivation_is_pure() {
        let a = derive_ssl_trust("192.168.1.50", Some("development"), None);
        let b = derive_ssl_trust("192.168.1.50", Some("development"), None);
        assert_eq!(a, b);
    }
}
