//! Per-session circuit breaker.
//!
//! Gates both routine probing and recovery. The breaker never moves out of
//! Open on its own: [`CircuitBreaker::allows_attempt_at`] is the only place an
//! eligible Open circuit becomes HalfOpen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CircuitBreakerSection;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds shared by every breaker a monitor owns.
#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub cooldown: chrono::Duration,
    pub half_open_success_threshold: u32,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self::from(&CircuitBreakerSection::default())
    }
}

impl From<&CircuitBreakerSection> for BreakerPolicy {
    fn from(section: &CircuitBreakerSection) -> Self {
        Self {
            failure_threshold: section.failure_threshold.max(1),
            cooldown: chrono::Duration::seconds(section.cooldown_secs as i64),
            half_open_success_threshold: section.half_open_success_threshold.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub state: CircuitState,
    pub next_attempt_time: Option<DateTime<Utc>>,
    pub half_open_successes: u32,
    #[serde(skip)]
    policy: BreakerPolicy,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            failure_count: 0,
            last_failure: None,
            state: CircuitState::Closed,
            next_attempt_time: None,
            half_open_successes: 0,
            policy,
        }
    }

    pub fn allows_attempt(&mut self) -> bool {
        self.allows_attempt_at(Utc::now())
    }

    /// Whether a probe or recovery may run at `now`.
    ///
    /// An Open circuit that is not yet eligible is left untouched. An eligible
    /// one moves to HalfOpen with a fresh success counter.
    pub fn allows_attempt_at(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.next_attempt_time.is_some_and(|next| now < next) {
                    return false;
                }
                self.transition_to_half_open();
                true
            }
        }
    }

    /// Read-only eligibility check; never changes state.
    pub fn is_blocked_at(&self, now: DateTime<Utc>) -> bool {
        self.state == CircuitState::Open && self.next_attempt_time.is_some_and(|next| now < next)
    }

    /// Returns the new state if this success caused a transition.
    pub fn record_success(&mut self) -> Option<CircuitState> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.policy.half_open_success_threshold {
                    self.transition_to_closed();
                    Some(CircuitState::Closed)
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    pub fn record_failure(&mut self) -> Option<CircuitState> {
        self.record_failure_at(Utc::now())
    }

    /// Returns the new state if this failure caused a transition.
    pub fn record_failure_at(&mut self, now: DateTime<Utc>) -> Option<CircuitState> {
        self.last_failure = Some(now);
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.policy.failure_threshold {
                    self.transition_to_open(now);
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.failure_count = 0;
                self.transition_to_open(now);
                Some(CircuitState::Open)
            }
            CircuitState::Open => {
                self.failure_count += 1;
                None
            }
        }
    }

    /// Forget all history. Used after a recovery hands the session a new sandbox.
    pub fn reset(&mut self) {
        self.transition_to_closed();
        self.last_failure = None;
    }

    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.half_open_successes = 0;
        self.next_attempt_time = None;
    }

    fn transition_to_open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.half_open_successes = 0;
        self.next_attempt_time = Some(now + self.policy.cooldown);
    }

    fn transition_to_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_successes = 0;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tripped(now: DateTime<Utc>) -> CircuitBreaker {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..5 {
            breaker.record_failure_at(now);
        }
        breaker
    }

    #[test]
    fn test_new_breaker_is_closed() {
        let mut breaker = CircuitBreaker::default();
        assert_eq!(breaker.state, CircuitState::Closed);
        assert!(breaker.allows_attempt());
    }

    #[test]
    fn test_opens_after_five_failures() {
        let now = Utc::now();
        let mut breaker = CircuitBreaker::default();
        for i in 0..4 {
            assert_eq!(breaker.record_failure_at(now), None, "failure {}", i + 1);
            assert_eq!(breaker.state, CircuitState::Closed);
        }
        assert_eq!(breaker.record_failure_at(now), Some(CircuitState::Open));
        assert_eq!(breaker.state, CircuitState::Open);
        assert_eq!(breaker.next_attempt_time, Some(now + Duration::seconds(60)));
        assert!(breaker.next_attempt_time.unwrap() > now);
    }

    #[test]
    fn test_success_while_closed_resets_counter() {
        let now = Utc::now();
        let mut breaker = CircuitBreaker::default();
        for _ in 0..4 {
            breaker.record_failure_at(now);
        }
        breaker.record_success();
        assert_eq!(breaker.failure_count, 0);
        assert_eq!(breaker.state, CircuitState::Closed);

        // Four more failures must not open it: the count restarted.
        for _ in 0..4 {
            breaker.record_failure_at(now);
        }
        assert_eq!(breaker.state, CircuitState::Closed);
    }

    #[test]
    fn test_open_blocks_without_mutation() {
        let now = Utc::now();
        let mut breaker = tripped(now);
        let before = breaker.clone();

        assert!(!breaker.allows_attempt_at(now + Duration::seconds(59)));
        assert_eq!(breaker.state, CircuitState::Open);
        assert_eq!(breaker.failure_count, before.failure_count);
        assert_eq!(breaker.next_attempt_time, before.next_attempt_time);
        assert_eq!(breaker.half_open_successes, 0);
        assert!(breaker.is_blocked_at(now + Duration::seconds(59)));
    }

    #[test]
    fn test_eligible_open_becomes_half_open() {
        let now = Utc::now();
        let mut breaker = tripped(now);
        assert!(breaker.allows_attempt_at(now + Duration::seconds(60)));
        assert_eq!(breaker.state, CircuitState::HalfOpen);
        assert_eq!(breaker.half_open_successes, 0);
    }

    #[test]
    fn test_half_open_needs_three_successes() {
        let now = Utc::now();
        let mut breaker = tripped(now);
        let later = now + Duration::seconds(61);
        assert!(breaker.allows_attempt_at(later));

        assert_eq!(breaker.record_success(), None);
        assert_eq!(breaker.record_success(), None);
        assert_eq!(breaker.state, CircuitState::HalfOpen);
        assert_eq!(breaker.half_open_successes, 2);

        assert_eq!(breaker.record_success(), Some(CircuitState::Closed));
        assert_eq!(breaker.state, CircuitState::Closed);
        assert_eq!(breaker.failure_count, 0);
        assert_eq!(breaker.half_open_successes, 0);
    }

    #[test]
    fn test_failure_while_half_open_reopens() {
        let now = Utc::now();
        let mut breaker = tripped(now);
        let later = now + Duration::seconds(61);
        assert!(breaker.allows_attempt_at(later));
        breaker.record_success();
        breaker.record_success();

        assert_eq!(breaker.record_failure_at(later), Some(CircuitState::Open));
        assert_eq!(breaker.state, CircuitState::Open);
        assert_eq!(breaker.half_open_successes, 0);
        assert_eq!(breaker.failure_count, 0);
        assert_eq!(breaker.next_attempt_time, Some(later + Duration::seconds(60)));
        assert!(!breaker.allows_attempt_at(later + Duration::seconds(1)));
    }

    #[test]
    fn test_policy_from_section() {
        let section = CircuitBreakerSection {
            failure_threshold: 2,
            cooldown_secs: 5,
            half_open_success_threshold: 1,
        };
        let now = Utc::now();
        let mut breaker = CircuitBreaker::new(BreakerPolicy::from(&section));
        breaker.record_failure_at(now);
        assert_eq!(breaker.record_failure_at(now), Some(CircuitState::Open));
        assert!(breaker.allows_attempt_at(now + Duration::seconds(5)));
        assert_eq!(breaker.record_success(), Some(CircuitState::Closed));
    }

    #[test]
    fn test_reset() {
        let mut breaker = tripped(Utc::now());
        breaker.reset();
        assert_eq!(breaker.state, CircuitState::Closed);
        assert!(breaker.next_attempt_time.is_none());
        assert!(breaker.last_failure.is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"half_open\""
        );
    }
}
