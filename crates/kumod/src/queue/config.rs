use kumo_api_types::egress_path::ConfigRefreshStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use throttle::ThrottleSpec;

const TEN_MINUTES: Duration = Duration::from_secs(10 * 60);
const ONE_MINUTE: Duration = Duration::from_secs(60);

/// Configuration for a scheduled queue
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Base retry interval to use in exponential backoff
    #[serde(
        default = "QueueConfig::default_retry_interval",
        with = "duration_serde"
    )]
    pub retry_interval: Duration,

    /// Optional cap on the computed retry interval.
    /// Set to the same number as retry_interval to
    /// prevent using exponential backoff
    #[serde(default, with = "duration_serde")]
    pub max_retry_interval: Option<Duration>,

    /// Limits how long a message can remain in the queue
    #[serde(default = "QueueConfig::default_max_age", with = "duration_serde")]
    pub max_age: Duration,

    /// Specifies which egress pool should be used when
    /// delivering these messages
    #[serde(default)]
    pub egress_pool: Option<String>,

    /// The rate at which messages are allowed to move from
    /// this scheduled queue into the ready queue
    #[serde(default)]
    pub max_message_rate: Option<ThrottleSpec>,

    /// A rate limit shared across every queue of the same scope:
    /// all the queues of a campaign when the queue has a campaign,
    /// otherwise all the queues of the tenant
    #[serde(default)]
    pub overall_max_message_rate: Option<ThrottleSpec>,

    /// How long to wait after the queue is idle before reaping
    /// and removing the scheduled queue from memory
    #[serde(
        default = "QueueConfig::default_reap_interval",
        with = "duration_serde"
    )]
    pub reap_interval: Duration,

    /// How long to wait between config re-resolutions for any given
    /// scheduled queue. Making this longer uses fewer resources (in
    /// aggregate) but means that it will take longer to detect and
    /// adjust to changes in the queue configuration.
    #[serde(
        default = "QueueConfig::default_refresh_interval",
        with = "duration_serde"
    )]
    pub refresh_interval: Duration,

    #[serde(default)]
    pub refresh_strategy: ConfigRefreshStrategy,

    /// An explicit provider name that applies to this queue, used
    /// when grouping metrics by provider. If omitted, a provider
    /// derived from the site_name is used instead.
    #[serde(default)]
    pub provider_name: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_interval: Self::default_retry_interval(),
            max_retry_interval: None,
            max_age: Self::default_max_age(),
            egress_pool: None,
            max_message_rate: None,
            overall_max_message_rate: None,
            reap_interval: Self::default_reap_interval(),
            refresh_interval: Self::default_refresh_interval(),
            refresh_strategy: ConfigRefreshStrategy::default(),
            provider_name: None,
        }
    }
}

/// Clamp a seconds count to what chrono::Duration can represent;
/// the backoff math saturates rather than overflowing
fn clamped_seconds(secs: u64) -> chrono::Duration {
    const CEILING: u64 = (i64::MAX / 1_000) as u64;
    chrono::Duration::seconds(secs.min(CEILING) as i64)
}

impl QueueConfig {
    fn default_retry_interval() -> Duration {
        Duration::from_secs(60 * 20) // 20 minutes
    }

    fn default_max_age() -> Duration {
        Duration::from_secs(86400 * 7) // 1 week
    }

    fn default_reap_interval() -> Duration {
        TEN_MINUTES
    }

    fn default_refresh_interval() -> Duration {
        ONE_MINUTE
    }

    pub fn get_max_age(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX)
    }

    /// The backoff applied after the given zero-based attempt:
    /// retry_interval doubled per attempt, held at max_retry_interval
    /// once the doubling passes it
    pub fn backoff_for_attempt(&self, attempt: u16) -> chrono::Duration {
        let base = self.retry_interval.as_secs();
        let doubled = match 2u64.checked_pow(attempt as u32) {
            Some(factor) => base.saturating_mul(factor),
            None => u64::MAX,
        };
        let capped = match self.max_retry_interval {
            Some(cap) => doubled.min(cap.as_secs()),
            None => doubled,
        };
        clamped_seconds(capped)
    }

    /// The total backoff accumulated over a range of attempt numbers
    fn summed_backoff(&self, attempts: std::ops::Range<u16>) -> chrono::Duration {
        let total = attempts
            .map(|attempt| self.backoff_for_attempt(attempt).num_seconds() as u64)
            .fold(0u64, u64::saturating_add);
        clamped_seconds(total)
    }

    /// Given the age of a message enumerated from the spool, infer
    /// how many delivery attempts it is likely to have made.
    /// Attempts are not persisted, so this is necessarily an
    /// approximation driven by the retry schedule.
    pub fn estimate_attempts_for_age(&self, age: chrono::Duration) -> u16 {
        if self.retry_interval.is_zero() {
            return 0;
        }
        let mut attempts = 0;
        while self.summed_backoff(0..attempts + 1) <= age {
            attempts += 1;
        }
        attempts
    }

    /// How long from now until the next due time for a message of
    /// the given age that has reached `num_attempts`; `age` implies
    /// the "now" in question.
    ///
    /// None when that due time would put the message past max_age,
    /// in which case it should be expired instead.
    pub fn remaining_delay_for_age(
        &self,
        num_attempts: u16,
        age: chrono::Duration,
    ) -> Option<chrono::Duration> {
        let max_age = self.get_max_age();
        if age >= max_age {
            return None;
        }

        let scheduled = self.summed_backoff(1..num_attempts);
        if scheduled >= max_age {
            return None;
        }

        Some(
            scheduled
                .checked_sub(&age)
                .unwrap_or_else(chrono::Duration::zero)
                .max(chrono::Duration::zero()),
        )
    }

    /// Like remaining_delay_for_age, but without regard for max_age;
    /// used when the message carries its own expiry instant
    pub fn remaining_delay_ignoring_max_age(
        &self,
        num_attempts: u16,
        age: chrono::Duration,
    ) -> chrono::Duration {
        self.summed_backoff(1..num_attempts)
            .checked_sub(&age)
            .unwrap_or_else(chrono::Duration::zero)
            .max(chrono::Duration::zero())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn minute_config() -> QueueConfig {
        QueueConfig {
            retry_interval: Duration::from_secs(60),
            max_retry_interval: Some(Duration::from_secs(600)),
            max_age: Duration::from_secs(3600),
            ..QueueConfig::default()
        }
    }

    /// Verify the exponential ladder with a 60s base, 600s cap and
    /// 1 hour max_age: a message that transiently fails on every
    /// attempt becomes due at 60, 180, 420, 900, 1500, 2100, 2700
    /// and 3300 seconds, and the attempt after that would land at
    /// or beyond the hour and is therefore expired.
    #[test]
    fn retry_ladder() {
        let config = minute_config();

        let mut due_times = vec![];
        let mut elapsed = 0;
        for attempt in 0..8 {
            elapsed += config.backoff_for_attempt(attempt).num_seconds();
            due_times.push(elapsed);
        }
        assert_eq!(due_times, vec![60, 180, 420, 900, 1500, 2100, 2700, 3300]);

        // The 9th attempt would be scheduled for 3300 + 600 = 3900,
        // which exceeds max_age
        let age = chrono::Duration::seconds(3300);
        assert_eq!(config.remaining_delay_for_age(9, age), None);
    }

    #[test]
    fn uncapped_backoff_is_pure_exponential() {
        let config = QueueConfig {
            retry_interval: Duration::from_secs(1200),
            ..QueueConfig::default()
        };
        assert_eq!(config.backoff_for_attempt(0).num_seconds(), 1200);
        assert_eq!(config.backoff_for_attempt(1).num_seconds(), 2400);
        assert_eq!(config.backoff_for_attempt(5).num_seconds(), 38400);
    }

    #[test]
    fn attempts_estimated_from_age() {
        let config = minute_config();
        assert_eq!(
            config.estimate_attempts_for_age(chrono::Duration::seconds(30)),
            0
        );
        assert_eq!(
            config.estimate_attempts_for_age(chrono::Duration::seconds(90)),
            1
        );
        assert_eq!(
            config.estimate_attempts_for_age(chrono::Duration::seconds(200)),
            2
        );
        assert_eq!(
            config.estimate_attempts_for_age(chrono::Duration::seconds(1000)),
            4
        );
    }

    #[test]
    fn remaining_delay_is_relative_to_age() {
        let config = minute_config();
        // The cumulative backoff for a message on its second attempt
        // is 120s; observed at 100s of age, 20s remain
        let delay = config
            .remaining_delay_for_age(2, chrono::Duration::seconds(100))
            .unwrap();
        assert_eq!(delay.num_seconds(), 20);

        // An observation after the scheduled point is due immediately
        let delay = config
            .remaining_delay_for_age(2, chrono::Duration::seconds(500))
            .unwrap();
        assert_eq!(delay.num_seconds(), 0);
    }
}
