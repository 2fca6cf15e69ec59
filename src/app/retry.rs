use std::time::Duration;

use rand::Rng;

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelaySchedule {
    /// `base * attempt²`
    Quadratic,
    /// `base * attempt` plus up to half a base of random jitter.
    LinearJitter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub schedule: DelaySchedule,
}

impl RetryPolicy {
    pub fn quadratic(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            schedule: DelaySchedule::Quadratic,
        }
    }

    pub fn jittered(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            schedule: DelaySchedule::LinearJitter,
        }
    }

    /// Delay after the given failed attempt (1-based). Strictly increases with
    /// `attempt` for any non-zero base.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.schedule {
            DelaySchedule::Quadratic => self.base_delay * attempt * attempt,
            DelaySchedule::LinearJitter => {
                let half_base = (self.base_delay.as_millis() / 2) as u64;
                let jitter = if half_base == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..half_base)
                };
                self.base_delay * attempt + Duration::from_millis(jitter)
            }
        }
    }
}

/// Result of a single attempt: finished, or worth another try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Done(T),
    Retry(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Succeeded(T),
    Exhausted { attempts: u32, last_reason: String },
}

/// Runs `op` until it is done or the policy is exhausted. Errors from `op` are
/// fatal and end the loop immediately.
pub fn run_with_retry<T, E, F>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut op: F,
) -> Result<RetryOutcome<T>, E>
where
    F: FnMut(u32) -> Result<Attempt<T>, E>,
{
    let mut last_reason = String::new();
    for attempt in 1..=policy.max_attempts {
        match op(attempt)? {
            Attempt::Done(value) => return Ok(RetryOutcome::Succeeded(value)),
            Attempt::Retry(reason) => {
                last_reason = reason;
                if attempt < policy.max_attempts {
                    sleeper.sleep(policy.delay_after(attempt));
                }
            }
        }
    }
    Ok(RetryOutcome::Exhausted {
        attempts: policy.max_attempts,
        last_reason,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records requested delays instead of sleeping.
    #[derive(Debug, Default)]
    pub struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        pub fn delays(&self) -> Vec<Duration> {
            self.delays.lock().expect("delays").clone()
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.delays.lock().expect("delays").push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSleeper;
    use super::*;

    #[test]
    fn quadratic_delays_grow_with_square_of_attempt() {
        let policy = RetryPolicy::quadratic(3, Duration::from_millis(100));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(400));
        assert_eq!(policy.delay_after(3), Duration::from_millis(900));
    }

    #[test]
    fn jittered_delays_strictly_increase() {
        let policy = RetryPolicy::jittered(3, Duration::from_millis(200));
        for _ in 0..50 {
            let first = policy.delay_after(1);
            let second = policy.delay_after(2);
            assert!(first >= Duration::from_millis(200) && first < Duration::from_millis(300));
            assert!(second > first);
        }
    }

    #[test]
    fn stops_on_first_success() {
        let sleeper = RecordingSleeper::default();
        let policy = RetryPolicy::quadratic(3, Duration::from_millis(10));
        let outcome: Result<_, ()> = run_with_retry(&policy, &sleeper, |attempt| {
            Ok(if attempt == 2 {
                Attempt::Done(attempt)
            } else {
                Attempt::Retry("not yet".to_string())
            })
        });
        assert_eq!(outcome, Ok(RetryOutcome::Succeeded(2)));
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(10)]);
    }

    #[test]
    fn exhaustion_reports_last_reason_without_trailing_sleep() {
        let sleeper = RecordingSleeper::default();
        let policy = RetryPolicy::quadratic(3, Duration::from_millis(10));
        let outcome: Result<RetryOutcome<()>, ()> = run_with_retry(&policy, &sleeper, |attempt| {
            Ok(Attempt::Retry(format!("attempt {attempt}")))
        });
        assert_eq!(
            outcome,
            Ok(RetryOutcome::Exhausted {
                attempts: 3,
                last_reason: "attempt 3".to_string()
            })
        );
        assert_eq!(sleeper.delays().len(), 2);
    }

    #[test]
    fn fatal_error_ends_loop() {
        let sleeper = RecordingSleeper::default();
        let policy = RetryPolicy::quadratic(3, Duration::from_millis(10));
        let mut calls = 0;
        let outcome: Result<RetryOutcome<()>, &str> = run_with_retry(&policy, &sleeper, |_| {
            calls += 1;
            Err("device gone")
        });
        assert_eq!(outcome, Err("device gone"));
        assert_eq!(calls, 1);
    }
}
