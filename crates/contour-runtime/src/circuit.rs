use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Restarts allowed.
    Closed,
    /// Too many consecutive crashes; restarts suppressed until the cooldown passes.
    Open,
    /// Cooldown elapsed; one restart is allowed to probe.
    HalfOpen,
}

/// Crash-loop guard for automatic restarts.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    max_failures: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            max_failures: max_failures.max(1),
            cooldown,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.state = CircuitState::Closed;
    }

    /// Failures spaced further apart than the cooldown do not accumulate.
    pub fn record_failure(&mut self) {
        if self.state == CircuitState::Closed
            && self
                .last_failure
                .is_some_and(|at| at.elapsed() >= self.cooldown)
        {
            self.failure_count = 0;
        }
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());

        if self.state == CircuitState::HalfOpen || self.failure_count >= self.max_failures {
            if self.state != CircuitState::Open {
                tracing::warn!(
                    "Circuit breaker opened after {} failures",
                    self.failure_count
                );
            }
            self.state = CircuitState::Open;
        }
    }

    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if let Some(last_failure) = self.last_failure {
                    if last_failure.elapsed() >= self.cooldown {
                        tracing::info!("Circuit breaker entering half-open state");
                        self.state = CircuitState::HalfOpen;
                        return true;
                    }
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_max_failures() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        assert!(breaker.can_execute());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn half_open_after_cooldown_and_reopens_on_failure() {
        let mut breaker = CircuitBreaker::new(1, Duration::ZERO);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn spaced_failures_do_not_accumulate() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_millis(5));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        breaker.record_failure();
        assert_eq!(breaker.failure_count(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn success_closes_the_circuit() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }
}
