use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::breaker::CircuitState;
use super::models::InitialContext;

/// Latency above which a sandbox with no failures is still reported Degraded.
pub const DEFAULT_DEGRADED_LATENCY: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unresponsive,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unresponsive => "unresponsive",
        }
    }

    /// Whether commands may still be sent to the sandbox.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a sandbox from its consecutive-failure count and last latency,
/// using the default latency threshold.
pub fn calculate_health_status(consecutive_failures: u32, latency: Duration) -> HealthStatus {
    calculate_health_status_with(consecutive_failures, latency, DEFAULT_DEGRADED_LATENCY)
}

/// Classification with an explicit Degraded latency threshold.
///
/// | failures | status |
/// |----------|--------|
/// | 0        | Healthy, or Degraded when `latency > degraded_latency` |
/// | 1–2      | Degraded |
/// | 3–4      | Unhealthy |
/// | ≥ 5      | Unresponsive |
pub fn calculate_health_status_with(
    consecutive_failures: u32,
    latency: Duration,
    degraded_latency: Duration,
) -> HealthStatus {
    match consecutive_failures {
        0 if latency > degraded_latency => HealthStatus::Degraded,
        0 => HealthStatus::Healthy,
        1..=2 => HealthStatus::Degraded,
        3..=4 => HealthStatus::Unhealthy,
        _ => HealthStatus::Unresponsive,
    }
}

/// Health record for one registered session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxHealth {
    pub session_id: String,
    pub sandbox_id: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub response_time_ms: u64,
    pub consecutive_failures: u32,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub status: HealthStatus,
    pub recovery_attempts: u32,
    pub last_recovery: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_context: Option<InitialContext>,
    #[serde(skip)]
    pub probe_in_flight: bool,
    #[serde(skip)]
    pub recovery_in_progress: bool,
}

impl SandboxHealth {
    pub fn new(
        sandbox_id: &str,
        session_id: &str,
        initial_context: Option<InitialContext>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            last_heartbeat: None,
            response_time_ms: 0,
            consecutive_failures: 0,
            error_count: 0,
            last_error: None,
            status: HealthStatus::Healthy,
            recovery_attempts: 0,
            last_recovery: None,
            initial_context,
            probe_in_flight: false,
            recovery_in_progress: false,
        }
    }

    /// Apply a successful probe. Returns the previous status.
    pub fn record_success(
        &mut self,
        latency: Duration,
        degraded_latency: Duration,
    ) -> HealthStatus {
        let previous = self.status;
        self.last_heartbeat = Some(Utc::now());
        self.response_time_ms = latency.as_millis() as u64;
        self.consecutive_failures = 0;
        self.status = calculate_health_status_with(0, latency, degraded_latency);
        previous
    }

    /// Apply a failed probe. Returns the previous status.
    pub fn record_failure(
        &mut self,
        latency: Duration,
        error: &str,
        degraded_latency: Duration,
    ) -> HealthStatus {
        let previous = self.status;
        self.response_time_ms = latency.as_millis() as u64;
        self.consecutive_failures += 1;
        self.error_count += 1;
        self.last_error = Some(error.to_string());
        self.status =
            calculate_health_status_with(self.consecutive_failures, latency, degraded_latency);
        previous
    }
}

/// Per-session line of a health summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHealthDetail {
    #[serde(flatten)]
    pub health: SandboxHealth,
    pub circuit_state: CircuitState,
}

/// Aggregate view returned by `get_health_status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unresponsive: usize,
    pub total: usize,
    pub sessions: Vec<SessionHealthDetail>,
}

impl HealthSummary {
    pub fn from_details(mut sessions: Vec<SessionHealthDetail>) -> Self {
        sessions.sort_by(|a, b| a.health.session_id.cmp(&b.health.session_id));
        let mut summary = Self {
            total: sessions.len(),
            ..Self::default()
        };
        for detail in &sessions {
            match detail.health.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unresponsive => summary.unresponsive += 1,
            }
        }
        summary.sessions = sessions;
        summary
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.iter().any(|d| d.health.session_id == session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_zero_failures_fast_is_healthy() {
        assert_eq!(calculate_health_status(0, ms(120)), HealthStatus::Healthy);
        assert_eq!(calculate_health_status(0, ms(5000)), HealthStatus::Healthy);
    }

    #[test]
    fn test_zero_failures_slow_is_degraded() {
        assert_eq!(calculate_health_status(0, ms(5001)), HealthStatus::Degraded);
    }

    #[test]
    fn test_failure_thresholds() {
        assert_eq!(calculate_health_status(1, ms(10)), HealthStatus::Degraded);
        assert_eq!(calculate_health_status(2, ms(10)), HealthStatus::Degraded);
        assert_eq!(calculate_health_status(3, ms(10)), HealthStatus::Unhealthy);
        assert_eq!(calculate_health_status(4, ms(10)), HealthStatus::Unhealthy);
        assert_eq!(calculate_health_status(5, ms(10)), HealthStatus::Unresponsive);
        assert_eq!(calculate_health_status(50, ms(10)), HealthStatus::Unresponsive);
    }

    #[test]
    fn test_latency_ignored_once_failing() {
        assert_eq!(calculate_health_status(1, ms(60_000)), HealthStatus::Degraded);
        assert_eq!(calculate_health_status(3, ms(60_000)), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_custom_threshold() {
        assert_eq!(
            calculate_health_status_with(0, ms(1500), ms(1000)),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn test_record_failure_then_success() {
        let mut health = SandboxHealth::new("b1", "s1", None);
        for _ in 0..3 {
            health.record_failure(ms(10), "timeout", DEFAULT_DEGRADED_LATENCY);
        }
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(health.error_count, 3);
        assert_eq!(health.last_error.as_deref(), Some("timeout"));

        let previous = health.record_success(ms(40), DEFAULT_DEGRADED_LATENCY);
        assert_eq!(previous, HealthStatus::Unhealthy);
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.error_count, 3, "lifetime error count survives success");
        assert!(health.last_heartbeat.is_some());
    }

    #[test]
    fn test_summary_counts_buckets() {
        let mut a = SandboxHealth::new("b1", "s1", None);
        let mut b = SandboxHealth::new("b2", "s2", None);
        b.status = HealthStatus::Unhealthy;
        a.status = HealthStatus::Degraded;
        let c = SandboxHealth::new("b3", "s3", None);

        let summary = HealthSummary::from_details(
            [a, b, c]
                .into_iter()
                .map(|health| SessionHealthDetail {
                    health,
                    circuit_state: CircuitState::Closed,
                })
                .collect(),
        );
        assert_eq!(summary.total, 3);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.degraded, 1);
        assert_eq!(summary.unhealthy, 1);
        assert_eq!(summary.unresponsive, 0);
        assert!(summary.contains("s2"));
        assert!(!summary.contains("s9"));
    }
}
