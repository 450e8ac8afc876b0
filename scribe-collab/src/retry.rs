//! Bounded polling with a definite outcome.
//!
//! Used wherever the sync core has to wait for something it does not
//! control, such as the host attaching its editing surface.

use std::time::Duration;

/// What the caller should do after a failed probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Probe again after this long.
    Wait(Duration),
    /// Attempts used up; stop waiting.
    Exhausted,
}

/// Result of a full polling run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Ready(T),
    Exhausted { attempts: u32 },
}

/// Fixed-interval retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedRetry {
    max_attempts: u32,
    interval: Duration,
    attempts: u32,
}

impl BoundedRetry {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            attempts: 0,
        }
    }

    /// Record one failed probe and say what to do next.
    pub fn next_step(&mut self) -> RetryStep {
        if self.attempts >= self.max_attempts {
            return RetryStep::Exhausted;
        }
        self.attempts += 1;
        RetryStep::Wait(self.interval)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Probe until it yields a value or the budget runs out.
///
/// The probe runs once up front and once after every wait, so a budget of
/// `n` attempts probes at most `n + 1` times.
pub async fn poll_until<T>(
    mut retry: BoundedRetry,
    mut probe: impl FnMut() -> Option<T>,
) -> RetryOutcome<T> {
    loop {
        if let Some(value) = probe() {
            return RetryOutcome::Ready(value);
        }
        match retry.next_step() {
            RetryStep::Wait(delay) => tokio::time::sleep(delay).await,
            RetryStep::Exhausted => {
                return RetryOutcome::Exhausted {
                    attempts: retry.attempts(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_until_exhausted() {
        let mut retry = BoundedRetry::new(3, Duration::from_millis(500));
        for _ in 0..3 {
            assert_eq!(retry.next_step(), RetryStep::Wait(Duration::from_millis(500)));
        }
        assert!(retry.is_exhausted());
        assert_eq!(retry.next_step(), RetryStep::Exhausted);
        assert_eq!(retry.attempts(), 3);

        retry.reset();
        assert_eq!(retry.attempts(), 0);
        assert!(!retry.is_exhausted());
    }

    #[test]
    fn test_zero_budget_is_immediately_exhausted() {
        let mut retry = BoundedRetry::new(0, Duration::from_secs(1));
        assert_eq!(retry.next_step(), RetryStep::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_ready() {
        let mut calls = 0;
        let outcome = poll_until(BoundedRetry::new(10, Duration::from_millis(100)), || {
            calls += 1;
            (calls == 4).then_some("ready")
        })
        .await;
        assert_eq!(outcome, RetryOutcome::Ready("ready"));
        assert_eq!(calls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_exhausted() {
        let start = tokio::time::Instant::now();
        let outcome: RetryOutcome<()> =
            poll_until(BoundedRetry::new(10, Duration::from_millis(500)), || None).await;
        assert_eq!(outcome, RetryOutcome::Exhausted { attempts: 10 });
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
