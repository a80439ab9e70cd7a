//! Reconnect policies for the client tunnel session

use std::time::Duration;

/// Decides whether, and after how long, a lost session is redialed.
///
/// `attempt` counts redials since the session was lost, starting at 1.
/// Returning `None` gives up.
pub trait ReconnectPolicy: Send {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration>;
}

/// Never redial; a lost session stays lost
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverReconnect;

impl ReconnectPolicy for NeverReconnect {
    fn next_delay(&mut self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Up to `max_attempts` redials, a fixed delay apart
#[derive(Debug, Clone, Copy)]
pub struct FixedRetries {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl ReconnectPolicy for FixedRetries {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        (attempt <= self.max_attempts).then_some(self.delay)
    }
}

/// Doubling delay starting at `initial`, capped at `max`.
///
/// `max_attempts` of `None` retries forever.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        if let Some(max_attempts) = self.max_attempts {
            if attempt > max_attempts {
                return None;
            }
        }
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}

/// Policy for a `reconnect_times` style setting: zero disables redialing
pub fn policy_from_retries(times: u32, delay: Duration) -> Box<dyn ReconnectPolicy> {
    if times == 0 {
        Box::new(NeverReconnect)
    } else {
        Box::new(FixedRetries {
            max_attempts: times,
            delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_reconnect() {
        let mut policy = NeverReconnect;
        assert_eq!(policy.next_delay(1), None);
    }

    #[test]
    fn test_fixed_retries() {
        let mut policy = FixedRetries {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        };
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(4), None);
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let mut policy = ExponentialBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            max_attempts: Some(10),
        };
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.next_delay(4), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(10), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(11), None);
    }

    #[test]
    fn test_unbounded_backoff_stays_capped() {
        let mut policy = ExponentialBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            max_attempts: None,
        };
        assert_eq!(policy.next_delay(40), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(u32::MAX), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_policy_from_retries() {
        let mut policy = policy_from_retries(0, Duration::from_secs(1));
        assert_eq!(policy.next_delay(1), None);

        let mut policy = policy_from_retries(2, Duration::from_secs(1));
        assert_eq!(policy.next_delay(2), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(3), None);
    }
}
