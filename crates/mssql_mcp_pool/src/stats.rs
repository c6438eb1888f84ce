//! Pool stats snapshot and health scoring (spec §4.2/§3).

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Healthy,
    NeedsAttention,
    Critical,
}

/// A point-in-time snapshot of the pool, published by `ConnectionManager::stats()`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub max: usize,
    pub min: usize,
    pub active: usize,
    pub idle: usize,
    pub pending: usize,
    pub utilization_percent: f64,
    pub health_score: u8,
    pub health_status: HealthStatus,
}

impl PoolStats {
    pub(crate) fn new(max: usize, min: usize, active: usize, idle: usize, pending: usize) -> Self {
        let utilization_percent = if max == 0 {
            0.0
        } else {
            (active as f64 / max as f64) * 100.0
        };
        let idle_exhausted = idle == 0 && active > 0;
        let (health_score, health_status) =
            compute_health(utilization_percent, pending, 0.0, idle_exhausted);
        Self {
            max,
            min,
            active,
            idle,
            pending,
            utilization_percent,
            health_score,
            health_status,
        }
    }

    /// Recompute the health score with an externally supplied error rate
    /// (the observatory's own window, not something this crate tracks).
    /// Used by `get_connection_health`/`poolStats` to fold in query-level
    /// error pressure the pool itself has no visibility into.
    pub fn with_error_rate(mut self, error_rate_percent: f64) -> Self {
        let idle_exhausted = self.idle == 0 && self.active > 0;
        let (score, status) = compute_health(
            self.utilization_percent,
            self.pending,
            error_rate_percent,
            idle_exhausted,
        );
        self.health_score = score;
        self.health_status = status;
        self
    }
}

/// Health scoring: start at 100, subtract for each pressure indicator
/// present, clamp to [0,100], then band into a status.
///
/// No penalty (and no warning) below 95% utilization — only the ≥95% band
/// costs points.
fn compute_health(
    utilization_percent: f64,
    pending: usize,
    error_rate_percent: f64,
    idle_exhausted: bool,
) -> (u8, HealthStatus) {
    let mut score: i32 = 100;
    if utilization_percent >= 95.0 {
        score -= 20;
    }
    if pending > 0 {
        score -= 15;
    }
    if error_rate_percent >= 5.0 {
        score -= 15;
    }
    if idle_exhausted {
        score -= 10;
    }
    let score = score.clamp(0, 100) as u8;

    let status = if score >= 80 {
        HealthStatus::Healthy
    } else if score >= 60 {
        HealthStatus::NeedsAttention
    } else {
        HealthStatus::Critical
    };

    (score, status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_pool_scores_100() {
        let stats = PoolStats::new(10, 0, 2, 8, 0);
        assert_eq!(stats.health_score, 100);
        assert_eq!(stats.health_status, HealthStatus::Healthy);
    }

    #[test]
    fn high_utilization_costs_twenty_points() {
        let stats = PoolStats::new(10, 0, 10, 0, 0);
        assert_eq!(stats.utilization_percent, 100.0);
        // utilization (-20) + idle_exhausted (-10) = 70
        assert_eq!(stats.health_score, 70);
        assert_eq!(stats.health_status, HealthStatus::NeedsAttention);
    }

    #[test]
    fn no_penalty_below_95_percent_utilization() {
        let stats = PoolStats::new(10, 0, 9, 1, 0);
        assert_eq!(stats.utilization_percent, 90.0);
        assert_eq!(stats.health_score, 100);
    }

    #[test]
    fn waiters_and_error_rate_compound() {
        let stats = PoolStats::new(10, 0, 5, 5, 2).with_error_rate(6.0);
        // waiters (-15) + error rate (-15) = 70
        assert_eq!(stats.health_score, 70);
    }

    #[test]
    fn critical_band_below_sixty() {
        let stats = PoolStats::new(10, 0, 10, 0, 3).with_error_rate(10.0);
        // utilization (-20) + waiters (-15) + error rate (-15) + idle exhausted (-10) = 40
        assert_eq!(stats.health_score, 40);
        assert_eq!(stats.health_status, HealthStatus::Critical);
    }
}
