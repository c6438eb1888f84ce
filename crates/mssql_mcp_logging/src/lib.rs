//! Structured logging, redaction, and the policy audit trail (spec C7).
//!
//! Every subsystem logs through `tracing`; this crate only wires the
//! subscriber and supplies the two things the spec calls out specifically:
//! a `redact()` helper so passwords and connection-string secrets never
//! reach a log line, and an `AuditLog` that the safety policy engine writes
//! every allow/deny decision to.
//!
//! All diagnostic output goes to stderr — stdout is reserved for framed
//! JSON-RPC (spec §4.6), so unlike the teacher's dual file+stderr writer
//! this subscriber has exactly one sink.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Placeholder a redacted value is replaced with.
pub const REDACTED: &str = "[REDACTED]";

/// Logging configuration resolved from `mssql_mcp_config::ServerConfig`.
pub struct LogConfig {
    pub debug: bool,
    pub log_level: String,
}

/// Initialize the global `tracing` subscriber. Stderr-only: the dispatcher
/// relies on stdout carrying nothing but protocol frames.
pub fn init_logging(config: LogConfig) -> Result<()> {
    let default_filter = if config.debug { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(true)
                .with_filter(filter),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}

/// Strip a `password=...`/`pwd=...` style key/value pair (case-insensitive
/// key, `;`/`&`/end-of-string terminated value) out of a free-form string
/// such as a connection string or an error message that may have echoed
/// one. Runs until no more occurrences are found, so multiple secrets in
/// the same string are all redacted.
pub fn redact_connection_string(s: &str) -> String {
    const KEYS: &[&str] = &["password=", "pwd="];
    let mut out = s.to_string();
    loop {
        let lower = out.to_ascii_lowercase();
        let hit = KEYS
            .iter()
            .filter_map(|key| lower.find(key).map(|idx| (idx, key.len())))
            .min_by_key(|(idx, _)| *idx);

        let Some((key_start, key_len)) = hit else {
            return out;
        };
        let value_start = key_start + key_len;
        let value_end = out[value_start..]
            .find([';', '&'])
            .map(|i| value_start + i)
            .unwrap_or(out.len());

        let mut next = String::with_capacity(out.len());
        next.push_str(&out[..value_start]);
        next.push_str(REDACTED);
        next.push_str(&out[value_end..]);
        out = next;
    }
}

/// Redact a JSON attributes map in place: any key that looks like a secret
/// (`password`, `pwd`, `connectionString`/`connection_string`) has its
/// value replaced wholesale; string values elsewhere are passed through
/// `redact_connection_string` in case they embed a connection string.
pub fn redact_attributes(mut attrs: serde_json::Map<String, Value>) -> serde_json::Map<String, Value> {
    for (key, value) in attrs.iter_mut() {
        let lower = key.to_ascii_lowercase();
        if is_secret_key(&lower) {
            *value = Value::String(REDACTED.to_string());
        } else if let Value::String(s) = value {
            *s = redact_connection_string(s);
        }
    }
    attrs
}

fn is_secret_key(lower_key: &str) -> bool {
    matches!(
        lower_key,
        "password" | "pwd" | "connectionstring" | "connection_string" | "secret"
    )
}

/// A tagged record of one safety-policy decision (spec §4.3: "every
/// decision is emitted to the audit stream with classification and the
/// effective policy flags").
#[derive(Debug, Serialize)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub tool: String,
    pub classification: String,
    pub allowed: bool,
    pub reason: String,
    pub read_only_mode: bool,
    pub allow_destructive: bool,
    pub allow_schema_changes: bool,
}

/// Append-only newline-delimited-JSON audit trail. One process-lifetime
/// instance, shared behind a `Mutex` the way the teacher's `AuditLog` wraps
/// its `BufWriter`.
pub struct AuditLog {
    writer: Mutex<BufWriter<File>>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create audit log directory: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open audit log: {}", path.display()))?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn record(&self, entry: &AuditEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("audit log writer lock poisoned"))?;
        writeln!(writer, "{json}")?;
        writer.flush()?;
        Ok(())
    }
}

/// An audit sink that always succeeds but does nothing — used when
/// `auditEnabled` is false, so call sites never need an `Option` branch.
pub struct NullAuditLog;

impl NullAuditLog {
    pub fn record(&self, _entry: &AuditEntry) -> Result<()> {
        Ok(())
    }
}

/// Either a file-backed audit log or a no-op, selected once at startup
/// from `ServerConfig::audit_enabled`.
pub enum Audit {
    File(AuditLog),
    Disabled(NullAuditLog),
}

impl Audit {
    pub fn record(&self, entry: &AuditEntry) {
        let result = match self {
            Audit::File(log) => log.record(entry),
            Audit::Disabled(log) => log.record(entry),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_password_in_connection_string() {
        let s = "Server=db;Database=master;User Id=sa;Password=hunter2;Encrypt=true";
        let redacted = redact_connection_string(s);
        assert!(!redacted.contains("hunter2"));
        assert!(redacted.contains(REDACTED));
        assert!(redacted.contains("Encrypt=true"));
    }

    #[test]
    fn redacts_pwd_key_variant() {
        let s = "pwd=supersecret;host=localhost";
        let redacted = redact_connection_string(s);
        assert!(!redacted.contains("supersecret"));
    }

    #[test]
    fn leaves_strings_without_secrets_untouched() {
        let s = "Server=db;Database=master";
        assert_eq!(redact_connection_string(s), s);
    }

    #[test]
    fn redacts_attribute_map_secret_keys() {
        let mut map = serde_json::Map::new();
        map.insert("password".to_string(), Value::String("hunter2".to_string()));
        map.insert("host".to_string(), Value::String("db.example.com".to_string()));
        let redacted = redact_attributes(map);
        assert_eq!(redacted["password"], Value::String(REDACTED.to_string()));
        assert_eq!(redacted["host"], Value::String("db.example.com".to_string()));
    }

    #[test]
    fn audit_log_writes_ndjson_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.ndjson");
        let log = AuditLog::new(path.clone()).unwrap();

        log.record(&AuditEntry {
            ts: Utc::now(),
            tool: "execute_query".to_string(),
            classification: "Dml".to_string(),
            allowed: false,
            reason: "denied: allowDestructive is disabled".to_string(),
            read_only_mode: false,
            allow_destructive: false,
            allow_schema_changes: false,
        })
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("execute_query"));
        assert!(content.contains("\"allowed\":false"));
    }

    #[test]
    fn null_audit_log_always_succeeds() {
        let log = NullAuditLog;
        let entry = AuditEntry {
            ts: Utc::now(),
            tool: "x".to_string(),
            classification: "Empty".to_string(),
            allowed: true,
            reason: "allowed".to_string(),
            read_only_mode: true,
            allow_destructive: false,
            allow_schema_changes: false,
        };
        assert!(log.record(&entry).is_ok());
    }
}
