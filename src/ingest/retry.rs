/// Bounded retry with exponential backoff.
///
/// The remote services this pipeline depends on fail routinely, so every
/// batch call goes through this runner. Only transient errors are
/// retried; a non-transient error returns immediately.

use std::time::Duration;

use crate::model::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt after that.
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff_ms: u64) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_backoff: Duration::from_millis(base_backoff_ms),
        }
    }

    /// Backoff before attempt `next_attempt` (2-based): base * 2^(n-2).
    fn backoff_before(&self, next_attempt: u32) -> Duration {
        let doublings = next_attempt.saturating_sub(2).min(16);
        self.base_backoff * (1u32 << doublings)
    }

    /// Runs `op` until it succeeds, fails non-transiently, or the
    /// attempt budget is exhausted. The last error is returned.
    pub fn run<T, F>(&self, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Result<T, PipelineError>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_transient() || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    attempt += 1;
                    std::thread::sleep(self.backoff_before(attempt));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, 0)
    }

    #[test]
    fn test_success_on_first_attempt_calls_once() {
        let mut calls = 0;
        let result = instant_policy(3).run(|| {
            calls += 1;
            Ok::<_, PipelineError>(42)
        });
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_transient_error_is_retried_until_success() {
        let mut calls = 0;
        let result = instant_policy(3).run(|| {
            calls += 1;
            if calls < 3 {
                Err(PipelineError::HttpStatus(503))
            } else {
                Ok("up at last")
            }
        });
        assert_eq!(result, Ok("up at last"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_exhaustion_returns_last_error() {
        let mut calls = 0;
        let result: Result<(), _> = instant_policy(3).run(|| {
            calls += 1;
            Err(PipelineError::Transport(format!("attempt {}", calls)))
        });
        assert_eq!(calls, 3);
        assert_eq!(result, Err(PipelineError::Transport("attempt 3".to_string())));
    }

    #[test]
    fn test_non_transient_error_is_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = instant_policy(5).run(|| {
            calls += 1;
            Err(PipelineError::HttpStatus(404))
        });
        assert_eq!(calls, 1);
        assert_eq!(result, Err(PipelineError::HttpStatus(404)));
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(4, 100);
        assert_eq!(policy.backoff_before(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_before(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_before(4), Duration::from_millis(400));
    }

    #[test]
    fn test_zero_attempts_is_clamped_to_one() {
        let mut calls = 0;
        let _ = RetryPolicy::new(0, 0).run(|| {
            calls += 1;
            Ok::<_, PipelineError>(())
        });
        assert_eq!(calls, 1);
    }
}
