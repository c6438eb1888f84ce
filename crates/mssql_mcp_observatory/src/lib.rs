//! Performance observatory (spec C4): per-query sampling, a bounded ring of
//! query records, rolling aggregation, slow-query flagging, and the
//! pool-health facade the `get_connection_health` tool surfaces.
//!
//! Grounded on the ring-buffer/zone-accumulator pattern of the teacher's
//! frame profiler, re-applied here to query records under a `Mutex`
//! instead of a single-threaded `RefCell` (this server serves concurrent
//! tool calls, the TUI profiler never did).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mssql_mcp_error::ErrorKind;
use mssql_mcp_pool::{ConnectionManager, PoolStats};
use serde::Serialize;

const STATEMENT_TRUNCATE_BYTES: usize = 1024;
const RECENT_WINDOW_MINUTES: i64 = 5;

/// The three timeframes `get_performance_stats` accepts. Unknown input
/// strings normalize to `All` (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    Recent,
    Session,
    All,
}

impl Timeframe {
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("recent") => Timeframe::Recent,
            Some("session") => Timeframe::Session,
            _ => Timeframe::All,
        }
    }
}

/// One attempted execution (spec §3's "query record").
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecord {
    pub id: u64,
    pub tool: String,
    pub statement: String,
    pub statement_fingerprint: String,
    pub database: Option<String>,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub rows_affected: Vec<i64>,
    pub row_count: i64,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub sampled: bool,
    pub slow: bool,
}

/// The outcome a tool handler reports to `end_query`.
pub struct QueryOutcome<'a> {
    pub rows_affected: Vec<i64>,
    pub row_count: i64,
    pub error: Option<(ErrorKind, &'a str)>,
}

impl<'a> QueryOutcome<'a> {
    pub fn success(rows_affected: Vec<i64>, row_count: i64) -> Self {
        Self {
            rows_affected,
            row_count,
            error: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: &'a str) -> Self {
        Self {
            rows_affected: Vec::new(),
            row_count: 0,
            error: Some((kind, message)),
        }
    }
}

/// The handle `start_query` returns. Holds everything `end_query` needs to
/// finalize a record, plus the sampling decision made up front — an
/// unretained (unsampled) call carries no token work at `end_query` time.
pub enum QueryToken {
    Tracked {
        id: u64,
        tool: String,
        statement: String,
        statement_fingerprint: String,
        database: Option<String>,
        start_instant: Instant,
        start_timestamp: DateTime<Utc>,
        sampled: bool,
    },
    /// `perfEnabled` is false, or sampling decided not to retain this call.
    Disabled,
}

/// Tool-level breakdown within the aggregated stats.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolStats {
    pub count: usize,
    pub average_ms: f64,
    pub error_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStats {
    pub timeframe: &'static str,
    pub total_queries: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub error_rate: f64,
    pub average_duration_ms: f64,
    pub p50_duration_ms: f64,
    pub p90_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub slow_query_count: usize,
    pub per_tool: HashMap<String, ToolStats>,
}

/// Either the real aggregation or the disabled envelope (spec §4.4: "If
/// `perfEnabled` is false, all operations are no-ops that return an
/// envelope `{enabled: false, message: …}`").
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PerfResult<T> {
    Enabled(T),
    Disabled { enabled: bool, message: String },
}

impl<T> PerfResult<T> {
    fn disabled() -> Self {
        PerfResult::Disabled {
            enabled: false,
            message: "performance tracking is disabled (perfEnabled=false)".to_string(),
        }
    }
}

/// Owns the bounded ring and aggregation tables; every other component
/// interacts with it only through `start_query`/`end_query`/`stats`/
/// `query_stats`/`pool_stats` (spec §3 ownership rules).
pub struct Observatory {
    enabled: bool,
    max_history: usize,
    slow_query_ms: u64,
    sampling_rate: f64,
    track_pool: bool,
    ring: Mutex<VecDeque<QueryRecord>>,
    next_id: AtomicU64,
}

impl Observatory {
    pub fn new(enabled: bool, max_history: usize, slow_query_ms: u64, sampling_rate: f64, track_pool: bool) -> Self {
        Self {
            enabled,
            max_history: max_history.max(1),
            slow_query_ms,
            sampling_rate,
            track_pool,
            ring: Mutex::new(VecDeque::with_capacity(max_history.max(1))),
            next_id: AtomicU64::new(1),
        }
    }

    /// Begin tracking one execution. Always returns a token: callers pass
    /// it straight to `end_query` without branching on whether tracking is
    /// actually happening.
    pub fn start_query(&self, tool: &str, statement: &str, database: Option<&str>) -> QueryToken {
        if !self.enabled {
            return QueryToken::Disabled;
        }
        let sampled = bernoulli_sample(self.sampling_rate);
        if !sampled {
            // Sampling decides retention, not just slow-query eligibility
            // (spec §9 open question, resolved explicitly): an unsampled
            // call contributes nothing downstream, so there is no reason
            // to carry its statement text forward either.
            return QueryToken::Disabled;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        QueryToken::Tracked {
            id,
            tool: tool.to_string(),
            statement: truncate_statement(statement),
            statement_fingerprint: fingerprint(statement),
            database: database.map(str::to_string),
            start_instant: Instant::now(),
            start_timestamp: Utc::now(),
            sampled: true,
        }
    }

    /// Finalize a record and append it to the ring, evicting the oldest
    /// entry first once the ring is at `perfMaxHistory` capacity.
    pub fn end_query(&self, token: QueryToken, outcome: QueryOutcome<'_>) {
        let QueryToken::Tracked {
            id,
            tool,
            statement,
            statement_fingerprint,
            database,
            start_instant,
            start_timestamp,
            sampled,
        } = token
        else {
            return;
        };

        let duration_ms = start_instant.elapsed().as_millis() as u64;
        let success = outcome.error.is_none();
        let slow = success && duration_ms >= self.slow_query_ms;

        let record = QueryRecord {
            id,
            tool,
            statement,
            statement_fingerprint,
            database,
            start_timestamp,
            end_timestamp: Utc::now(),
            duration_ms,
            rows_affected: outcome.rows_affected,
            row_count: outcome.row_count,
            success,
            error_kind: outcome.error.as_ref().map(|(k, _)| *k),
            error_message: outcome.error.map(|(_, m)| m.to_string()),
            sampled,
            slow,
        };

        let mut ring = self.ring.lock().expect("observatory ring lock poisoned");
        if ring.len() >= self.max_history {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Aggregate over the ring for the requested timeframe.
    pub fn stats(&self, timeframe: Timeframe) -> PerfResult<AggregatedStats> {
        if !self.enabled {
            return PerfResult::disabled();
        }
        let ring = self.ring.lock().expect("observatory ring lock poisoned");
        let records: Vec<&QueryRecord> = match timeframe {
            Timeframe::Recent => {
                let cutoff = Utc::now() - ChronoDuration::minutes(RECENT_WINDOW_MINUTES);
                ring.iter().filter(|r| r.end_timestamp >= cutoff).collect()
            }
            Timeframe::Session | Timeframe::All => ring.iter().collect(),
        };

        PerfResult::Enabled(aggregate(&records, label(timeframe)))
    }

    /// Most recent records, newest first, optionally filtered.
    pub fn query_stats(
        &self,
        limit: usize,
        tool_filter: Option<&str>,
        slow_only: bool,
    ) -> PerfResult<Vec<QueryRecord>> {
        if !self.enabled {
            return PerfResult::disabled();
        }
        let ring = self.ring.lock().expect("observatory ring lock poisoned");
        let records: Vec<QueryRecord> = ring
            .iter()
            .rev()
            .filter(|r| match tool_filter {
                None => true,
                Some(f) => r.tool == f,
            })
            .filter(|r| !slow_only || r.slow)
            .take(limit)
            .cloned()
            .collect();
        PerfResult::Enabled(records)
    }

    /// Pool stats annotated with this process's own error-rate window
    /// (spec §4.4's `poolStats` rule: "delegates to C2 and annotates with
    /// observatory-side error rate").
    pub async fn pool_stats(&self, pool: &ConnectionManager) -> PerfResult<PoolStats> {
        if !self.enabled || !self.track_pool {
            return PerfResult::disabled();
        }
        let base = pool.stats().await;
        let error_rate = self.recent_error_rate_percent();
        PerfResult::Enabled(base.with_error_rate(error_rate))
    }

    fn recent_error_rate_percent(&self) -> f64 {
        let ring = self.ring.lock().expect("observatory ring lock poisoned");
        let cutoff = Utc::now() - ChronoDuration::minutes(RECENT_WINDOW_MINUTES);
        let recent: Vec<&QueryRecord> = ring.iter().filter(|r| r.end_timestamp >= cutoff).collect();
        if recent.is_empty() {
            return 0.0;
        }
        let errors = recent.iter().filter(|r| !r.success).count();
        (errors as f64 / recent.len() as f64) * 100.0
    }

    /// Exposed for tests exercising the bounded-ring property directly.
    #[cfg(test)]
    fn ring_len(&self) -> usize {
        self.ring.lock().unwrap().len()
    }
}

fn label(timeframe: Timeframe) -> &'static str {
    match timeframe {
        Timeframe::Recent => "recent",
        Timeframe::Session => "session",
        Timeframe::All => "all",
    }
}

fn aggregate(records: &[&QueryRecord], timeframe: &'static str) -> AggregatedStats {
    let total_queries = records.len();
    let success_count = records.iter().filter(|r| r.success).count();
    let error_count = total_queries - success_count;
    let error_rate = if total_queries == 0 {
        0.0
    } else {
        (error_count as f64 / total_queries as f64) * 100.0
    };

    let mut durations: Vec<u64> = records.iter().map(|r| r.duration_ms).collect();
    durations.sort_unstable();
    let average_duration_ms = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<u64>() as f64 / durations.len() as f64
    };

    let slow_query_count = records.iter().filter(|r| r.slow).count();

    let mut per_tool: HashMap<String, (usize, u64, usize)> = HashMap::new();
    for r in records {
        let entry = per_tool.entry(r.tool.clone()).or_insert((0, 0, 0));
        entry.0 += 1;
        entry.1 += r.duration_ms;
        if !r.success {
            entry.2 += 1;
        }
    }
    let per_tool = per_tool
        .into_iter()
        .map(|(tool, (count, total_ms, error_count))| {
            let average_ms = if count == 0 { 0.0 } else { total_ms as f64 / count as f64 };
            (
                tool,
                ToolStats {
                    count,
                    average_ms,
                    error_count,
                },
            )
        })
        .collect();

    AggregatedStats {
        timeframe,
        total_queries,
        success_count,
        error_count,
        error_rate,
        average_duration_ms,
        p50_duration_ms: percentile(&durations, 50.0),
        p90_duration_ms: percentile(&durations, 90.0),
        p95_duration_ms: percentile(&durations, 95.0),
        slow_query_count,
        per_tool,
    }
}

/// Nearest-rank percentile over an already-sorted slice.
fn percentile(sorted: &[u64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[idx] as f64
}

fn truncate_statement(sql: &str) -> String {
    if sql.len() <= STATEMENT_TRUNCATE_BYTES {
        sql.to_string()
    } else {
        let mut end = STATEMENT_TRUNCATE_BYTES;
        while !sql.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &sql[..end])
    }
}

/// Normalize whitespace and lowercase so semantically-identical statements
/// (differing only in casing/spacing) group together.
fn fingerprint(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

fn bernoulli_sample(rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    rand::random::<f64>() < rate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observatory(max_history: usize, slow_ms: u64) -> Observatory {
        Observatory::new(true, max_history, slow_ms, 1.0, true)
    }

    #[test]
    fn bounded_ring_evicts_oldest_first() {
        let obs = observatory(5, 1000);
        for i in 0..8 {
            let token = obs.start_query("execute_query", &format!("SELECT {i}"), None);
            obs.end_query(token, QueryOutcome::success(vec![], 1));
        }
        assert_eq!(obs.ring_len(), 5);

        let PerfResult::Enabled(records) = obs.query_stats(10, None, false) else {
            panic!("expected enabled result");
        };
        // Most recent first; oldest three (SELECT 0..2) were evicted.
        assert_eq!(records.len(), 5);
        assert!(records.iter().all(|r| r.statement.contains("SELECT")));
        assert_eq!(records[0].statement, "SELECT 7");
    }

    #[test]
    fn slow_flag_requires_success() {
        let obs = observatory(10, 10);
        let token = obs.start_query("execute_query", "SELECT 1", None);
        obs.end_query(
            token,
            QueryOutcome::failure(ErrorKind::SqlExecution, "boom"),
        );
        let PerfResult::Enabled(records) = obs.query_stats(10, None, true) else {
            panic!()
        };
        assert!(records.is_empty(), "a failed query must never be tagged slow");
    }

    #[test]
    fn slow_query_flagging_and_filter() {
        let obs = observatory(10, 10);
        // Simulate a slow query by sleeping past the threshold.
        let token = obs.start_query("get_table_data", "SELECT * FROM t", None);
        std::thread::sleep(std::time::Duration::from_millis(15));
        obs.end_query(token, QueryOutcome::success(vec![], 100));

        let fast_token = obs.start_query("get_table_data", "SELECT 1", None);
        obs.end_query(fast_token, QueryOutcome::success(vec![], 1));

        let PerfResult::Enabled(slow_only) = obs.query_stats(10, None, true) else {
            panic!()
        };
        assert_eq!(slow_only.len(), 1);
        assert!(slow_only[0].slow);
    }

    #[test]
    fn disabled_observatory_is_a_no_op() {
        let obs = Observatory::new(false, 10, 1000, 1.0, true);
        let token = obs.start_query("execute_query", "SELECT 1", None);
        assert!(matches!(token, QueryToken::Disabled));
        obs.end_query(token, QueryOutcome::success(vec![], 1));
        assert!(matches!(obs.stats(Timeframe::All), PerfResult::Disabled { .. }));
        assert!(matches!(
            obs.query_stats(10, None, false),
            PerfResult::Disabled { .. }
        ));
    }

    #[test]
    fn zero_sampling_rate_retains_nothing() {
        let obs = Observatory::new(true, 10, 1000, 0.0, true);
        let token = obs.start_query("execute_query", "SELECT 1", None);
        assert!(matches!(token, QueryToken::Disabled));
        obs.end_query(token, QueryOutcome::success(vec![], 1));
        assert_eq!(obs.ring_len(), 0);
    }

    #[test]
    fn aggregates_error_rate_and_per_tool_counts() {
        let obs = observatory(10, 1000);
        let ok = obs.start_query("list_tables", "SELECT 1", None);
        obs.end_query(ok, QueryOutcome::success(vec![], 1));
        let err = obs.start_query("list_tables", "SELECT 2", None);
        obs.end_query(err, QueryOutcome::failure(ErrorKind::SqlExecution, "x"));

        let PerfResult::Enabled(stats) = obs.stats(Timeframe::All) else {
            panic!()
        };
        assert_eq!(stats.total_queries, 2);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.error_rate, 50.0);
        let tool = stats.per_tool.get("list_tables").unwrap();
        assert_eq!(tool.count, 2);
        assert_eq!(tool.error_count, 1);
    }

    #[test]
    fn tool_filter_narrows_query_stats() {
        let obs = observatory(10, 1000);
        let a = obs.start_query("execute_query", "SELECT 1", None);
        obs.end_query(a, QueryOutcome::success(vec![], 1));
        let b = obs.start_query("list_tables", "SELECT 2", None);
        obs.end_query(b, QueryOutcome::success(vec![], 1));

        let PerfResult::Enabled(records) = obs.query_stats(10, Some("list_tables"), false) else {
            panic!()
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tool, "list_tables");
    }

    #[test]
    fn statement_truncation_preserves_bounded_length() {
        let long = "x".repeat(2000);
        let truncated = truncate_statement(&long);
        assert!(truncated.len() <= STATEMENT_TRUNCATE_BYTES + 4);
    }

    #[test]
    fn fingerprint_normalizes_whitespace_and_case() {
        assert_eq!(
            fingerprint("SELECT   *\nFROM   T"),
            fingerprint("select * from t")
        );
    }
}
