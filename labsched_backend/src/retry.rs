//! Bounded retries for flaky device I/O.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::TaskError;
use crate::estop::EmergencyStop;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub per_attempt_timeout: Duration,
    /// Pause between two attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            per_attempt_timeout: Duration::from_millis(1000),
            backoff: Duration::from_millis(50),
        }
    }
}

/// Passed to every attempt: which try this is (starting at 1) and how long it may wait for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    pub timeout: Duration,
}

/// Runs `action` until it succeeds, fails with a non-transient error, or the policy runs out.
///
/// The stop is checked before every attempt and interrupts the backoff sleep. Exhausting the
/// attempts on transient errors yields [`TaskError::CommunicationTimeout`] for `channel`.
pub fn call_with_retry<T, F>(
    policy: &RetryPolicy,
    channel: &str,
    estop: &EmergencyStop,
    mut action: F,
) -> Result<T, TaskError>
where
    F: FnMut(Attempt) -> Result<T, TaskError>,
{
    let max_attempts = policy.max_attempts.max(1);
    for number in 1..=max_attempts {
        estop.check()?;
        let attempt = Attempt {
            number,
            timeout: policy.per_attempt_timeout,
        };
        match action(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                warn!(channel, attempt = number, max_attempts, %err, "device I/O attempt failed");
                if number < max_attempts {
                    estop.sleep(policy.backoff)?;
                }
            }
            Err(err) => {
                debug!(channel, attempt = number, %err, "non-transient error, not retrying");
                return Err(err);
            }
        }
    }
    Err(TaskError::CommunicationTimeout {
        channel: channel.to_string(),
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn timeout() -> TaskError {
        TaskError::CommunicationTimeout {
            channel: "COM3".into(),
            attempts: 1,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            per_attempt_timeout: Duration::from_millis(10),
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let estop = EmergencyStop::new();
        let mut seen = Vec::new();
        let res = call_with_retry(&policy(), "COM3", &estop, |attempt| {
            seen.push(attempt.number);
            if attempt.number < 3 {
                Err(timeout())
            } else {
                Ok("OK 1200")
            }
        });
        assert_eq!(res, Ok("OK 1200"));
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn exhaustion_reports_attempt_count() {
        let estop = EmergencyStop::new();
        let mut calls = 0;
        let res: Result<(), _> = call_with_retry(&policy(), "COM3", &estop, |_| {
            calls += 1;
            Err(timeout())
        });
        assert_eq!(
            res,
            Err(TaskError::CommunicationTimeout {
                channel: "COM3".into(),
                attempts: 3
            })
        );
        assert_eq!(calls, 3);
    }

    #[test]
    fn protocol_errors_are_not_retried() {
        let estop = EmergencyStop::new();
        let mut calls = 0;
        let res: Result<(), _> = call_with_retry(&policy(), "COM3", &estop, |_| {
            calls += 1;
            Err(TaskError::Protocol {
                channel: "COM3".into(),
                reply: "ERR 9".into(),
            })
        });
        assert!(matches!(res, Err(TaskError::Protocol { .. })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn tripped_stop_skips_io() {
        let estop = EmergencyStop::new();
        estop.trip("test");
        let mut calls = 0;
        let res: Result<(), _> = call_with_retry(&policy(), "COM3", &estop, |_| {
            calls += 1;
            Ok(())
        });
        assert_eq!(res, Err(TaskError::EmergencyStopped));
        assert_eq!(calls, 0);
    }
}
