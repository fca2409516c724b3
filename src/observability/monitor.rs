use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

/// Bands for the system-status verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusThresholds {
    pub healthy_success_pct: f64,
    pub degraded_success_pct: f64,
    pub healthy_response_ms: f64,
    pub degraded_response_ms: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            healthy_success_pct: 99.0,
            degraded_success_pct: 95.0,
            healthy_response_ms: 5_000.0,
            degraded_response_ms: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct SystemStatus {
    pub status: HealthLevel,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub success_rate_pct: f64,
    pub avg_response_ms: f64,
}

/// Request accounting for the status endpoint. Server errors count as
/// failures; client errors do not.
pub struct Monitor {
    started_at: DateTime<Utc>,
    thresholds: StatusThresholds,
    requests: AtomicU64,
    failures: AtomicU64,
    latency_micros: AtomicU64,
}

impl Monitor {
    pub fn new(thresholds: StatusThresholds) -> Self {
        Self {
            started_at: Utc::now(),
            thresholds,
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            latency_micros: AtomicU64::new(0),
        }
    }

    pub fn record(&self, server_error: bool, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if server_error {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.latency_micros.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> SystemStatus {
        let total = self.requests.load(Ordering::Relaxed);
        let failed = self.failures.load(Ordering::Relaxed);
        let latency = self.latency_micros.load(Ordering::Relaxed);

        let (success_rate_pct, avg_response_ms) = if total == 0 {
            (100.0, 0.0)
        } else {
            (
                (total - failed) as f64 / total as f64 * 100.0,
                latency as f64 / total as f64 / 1_000.0,
            )
        };

        SystemStatus {
            status: classify(&self.thresholds, success_rate_pct, avg_response_ms),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: self.started_at,
            uptime_seconds: (now - self.started_at).num_seconds().max(0),
            total_requests: total,
            failed_requests: failed,
            success_rate_pct,
            avg_response_ms,
        }
    }
}

pub fn classify(thresholds: &StatusThresholds, success_pct: f64, avg_ms: f64) -> HealthLevel {
    if success_pct >= thresholds.healthy_success_pct && avg_ms < thresholds.healthy_response_ms {
        HealthLevel::Healthy
    } else if success_pct >= thresholds.degraded_success_pct
        && avg_ms < thresholds.degraded_response_ms
    {
        HealthLevel::Degraded
    } else {
        HealthLevel::Unhealthy
    }
}
