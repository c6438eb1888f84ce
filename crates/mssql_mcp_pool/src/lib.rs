//! Pooled connection lifecycle manager for SQL Server (spec C2).
//!
//! Owns a single `deadpool` pool of `tiberius` clients. Establishment runs
//! a bounded retry loop with exponential backoff; once connected, borrows
//! are served from the pool with a bounded wait; `close()` drains and
//! refuses further borrows.

mod manager;
mod stats;

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deadpool::managed::{Pool, PoolConfig, Timeouts};
use mssql_mcp_error::{McpError, Result};
use tokio::sync::Mutex;

pub use manager::{Client, ConnectionSettings};
pub use stats::{HealthStatus, PoolStats};

type ManagedPool = Pool<manager::Manager>;

/// Sizing and retry knobs, independent of how they were resolved
/// (`mssql_mcp_config::ServerConfig` maps onto this 1:1 in the binary crate).
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub connection: ConnectionSettings,
    pub pool_max: u32,
    pub pool_min: u32,
    pub pool_idle_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Owns the pool for the process lifetime. `connect()` is idempotent;
/// `borrow()`/`stats()`/`close()` operate on whatever pool currently exists.
pub struct ConnectionManager {
    settings: PoolSettings,
    pool: Mutex<Option<ManagedPool>>,
    active: Arc<AtomicUsize>,
    pending: Arc<AtomicUsize>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl ConnectionManager {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            pool: Mutex::new(None),
            active: Arc::new(AtomicUsize::new(0)),
            pending: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Idempotent: returns immediately if a live pool already exists.
    /// Otherwise runs the bounded retry+backoff establishment protocol.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.pool.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let pool = self.build_pool()?;
        let max_retries = self.settings.max_retries;
        let retry_delay_ms = self.settings.retry_delay_ms;
        let connect_timeout_ms = self.settings.connect_timeout_ms;

        retry_with_backoff(max_retries, retry_delay_ms, |attempt| {
            let pool = pool.clone();
            async move {
                match tokio::time::timeout(
                    Duration::from_millis(connect_timeout_ms),
                    pool.get(),
                )
                .await
                {
                    Ok(Ok(_conn)) => Ok(()),
                    Ok(Err(e)) => Err(format!("attempt {attempt}: {e}")),
                    Err(_) => Err(format!("attempt {attempt}: timed out")),
                }
            }
        })
        .await
        .map_err(McpError::connection)?;

        *guard = Some(pool);
        Ok(())
    }

    /// Borrow a connection, waiting up to `connectTimeoutMs` if the pool is
    /// saturated. Guarantees release on every exit path: the returned guard
    /// decrements the active-borrow counter and returns the object to the
    /// pool on drop, success or fault alike.
    pub async fn borrow(&self) -> Result<PooledConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::connection("pool is closed"));
        }
        let guard = self.pool.lock().await;
        let pool = guard
            .as_ref()
            .ok_or_else(|| McpError::connection("pool is not connected"))?
            .clone();
        drop(guard);

        self.pending.fetch_add(1, Ordering::SeqCst);
        let result = tokio::time::timeout(
            Duration::from_millis(self.settings.connect_timeout_ms),
            pool.get(),
        )
        .await;
        self.pending.fetch_sub(1, Ordering::SeqCst);

        let object = match result {
            Ok(Ok(obj)) => obj,
            Ok(Err(e)) => return Err(McpError::connection(e.to_string())),
            Err(_) => {
                return Err(McpError::timeout(
                    "timed out waiting to borrow a connection from the pool",
                ))
            }
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection {
            object: Some(object),
            active: self.active.clone(),
        })
    }

    /// A point-in-time pool stats snapshot (spec §3). `active`/`pending`
    /// reflect this process's own bookkeeping; `idle` is derived from the
    /// pool's reported size.
    pub async fn stats(&self) -> PoolStats {
        let guard = self.pool.lock().await;
        let (size, _available) = match guard.as_ref() {
            Some(pool) => {
                let status = pool.status();
                (status.size, status.available)
            }
            None => (0, 0),
        };
        let active = self.active.load(Ordering::SeqCst);
        let idle = size.saturating_sub(active);
        let pending = self.pending.load(Ordering::SeqCst);

        PoolStats::new(
            self.settings.pool_max as usize,
            self.settings.pool_min as usize,
            active,
            idle,
            pending,
        )
    }

    /// Graceful shutdown: refuse new borrows, then drop the pool, which
    /// drains in-flight objects as they are returned.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.take() {
            pool.close();
        }
    }

    fn build_pool(&self) -> Result<ManagedPool> {
        let manager = manager::Manager::new(&self.settings.connection);
        let mut pool_config = PoolConfig::new(self.settings.pool_max as usize);
        pool_config.timeouts = Timeouts {
            wait: Some(Duration::from_millis(self.settings.connect_timeout_ms)),
            create: Some(Duration::from_millis(self.settings.connect_timeout_ms)),
            recycle: Some(Duration::from_millis(self.settings.pool_idle_ms)),
        };
        Pool::builder(manager)
            .config(pool_config)
            .build()
            .map_err(|e| McpError::config(format!("invalid pool configuration: {e}")))
    }
}

/// A borrowed connection. Decrements the active-borrow counter on every
/// exit path (the field is always `Some` until `Drop`).
pub struct PooledConnection {
    object: Option<deadpool::managed::Object<manager::Manager>>,
    active: Arc<AtomicUsize>,
}

impl Deref for PooledConnection {
    type Target = Client;
    fn deref(&self) -> &Self::Target {
        self.object.as_ref().expect("object taken before drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.object.as_mut().expect("object taken before drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.object.take();
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded retry loop with exponential backoff: attempt *n* (1-indexed)
/// waits `retry_delay_ms * 2^(n-1)` before the next attempt. Total attempts
/// allowed is `max_retries + 1` (the initial attempt plus `max_retries`
/// retries); exhausting them returns the last attempt's error.
///
/// Generic over the attempt future so the backoff/retry-budget arithmetic
/// can be unit-tested without a live SQL Server.
pub async fn retry_with_backoff<F, Fut, T>(
    max_retries: u32,
    retry_delay_ms: u64,
    mut attempt: F,
) -> std::result::Result<T, String>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, String>>,
{
    let max_attempts = max_retries + 1;
    let mut n = 0u32;
    loop {
        n += 1;
        match attempt(n).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                tracing::warn!(attempt = n, error = %e, "connection attempt failed");
                if n >= max_attempts {
                    return Err(e);
                }
                let backoff_ms = retry_delay_ms.saturating_mul(1u64 << (n - 1));
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn retry_budget_succeeds_on_fourth_attempt() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result = retry_with_backoff(3, 10, |n| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if n < 4 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() >= Duration::from_millis(70));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_exhausted_yields_last_error() {
        let calls = AtomicU32::new(0);

        let result: std::result::Result<(), String> = retry_with_backoff(3, 10, |n| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(format!("attempt {n} failed"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn zero_retries_means_a_single_attempt() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(0, 10, |_n| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("no retries configured".to_string())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
