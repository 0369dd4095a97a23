//! Retry schedule for rows whose publish failed

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Capped exponential backoff: `min(initial * multiplier^(retry - 1), max)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt number `retry_count + 1`, for `retry_count >= 1`.
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.saturating_sub(1).max(0);
        let factor = self.multiplier.powi(exponent);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let max_millis = self.max_delay.as_millis() as f64;

        if !millis.is_finite() || millis >= max_millis {
            self.max_delay
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, retry_count: i32) -> DateTime<Utc> {
        let delay = TimeDelta::from_std(self.delay_for(retry_count)).unwrap_or(TimeDelta::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for(3), Duration::from_secs(240));
        assert_eq!(policy.delay_for(6), Duration::from_secs(1920));
        // 60 * 2^6 = 3840s, capped at one hour
        assert_eq!(policy.delay_for(7), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(200), Duration::from_secs(3600));
    }

    #[test]
    fn test_schedule_is_monotonic() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 3.0,
        };
        let delays: Vec<_> = (1..12).map(|n| policy.delay_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[0], Duration::from_millis(250));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_next_attempt_at() {
        let policy = BackoffPolicy::default();
        let now = Utc::now();
        assert_eq!(policy.next_attempt_at(now, 2), now + TimeDelta::seconds(120));
    }
}
