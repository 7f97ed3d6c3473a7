//! Rate limiting and concurrency limiting primitives based on a generic
//! cell rate algorithm. The default store is in-memory and process-local;
//! when a redis cluster coordinator has been configured via `use_redis`,
//! named throttles and leases are shared across all participating nodes.
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod limit;
#[cfg(feature = "redis")]
mod redis_backend;
mod throttle;

pub use limit::{LimitLease, LimitSpec, LimitSpecWithDuration};
pub use throttle::throttle;

#[cfg(feature = "redis")]
pub use redis_backend::{use_redis, RedisConnection};

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Generic(String),
    #[error("{0}")]
    AnyHow(#[from] anyhow::Error),
    #[cfg(feature = "redis")]
    #[error("{0}")]
    Redis(#[from] redis::RedisError),
    #[error("TooManyLeases, try again in {0:?}")]
    TooManyLeases(Duration),
    #[error("NonExistentLease")]
    NonExistentLease,
}

/// A throttle specification: a limit over a period, with an optional
/// burst allowance. The string form is "100/hr", "1,000/day" and so on,
/// optionally suffixed with ",max_burst=N" and/or prefixed with "local:"
/// to force the process-local store even when redis is configured.
#[derive(Eq, PartialEq, Clone, Copy, Serialize, Deserialize, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ThrottleSpec {
    pub limit: u64,
    /// Period, in seconds
    pub period: u64,
    pub max_burst: Option<u64>,
    pub force_local: bool,
}

impl ThrottleSpec {
    pub async fn throttle<S: AsRef<str>>(&self, key: S) -> Result<ThrottleResult, Error> {
        self.throttle_quantity(key, 1).await
    }

    pub async fn throttle_quantity<S: AsRef<str>>(
        &self,
        key: S,
        quantity: u64,
    ) -> Result<ThrottleResult, Error> {
        let key = key.as_ref();
        let limit = self.limit;
        let period = self.period;
        let max_burst = self.max_burst.unwrap_or(limit);
        // Encode the parameters into the key: a key used with
        // inconsistent parameters would produce nonsense results
        let key = format!("{key}:{limit}:{max_burst}:{period}");
        throttle(
            &key,
            limit,
            Duration::from_secs(period),
            max_burst,
            quantity,
            self.force_local,
        )
        .await
    }

    pub fn as_string(&self) -> String {
        let period = match self.period {
            86400 => "d",
            3600 => "h",
            60 => "m",
            1 => "s",
            secs => {
                return match self.max_burst {
                    Some(burst) => format!(
                        "{}{}/{secs}s,max_burst={burst}",
                        if self.force_local { "local:" } else { "" },
                        self.limit
                    ),
                    None => format!(
                        "{}{}/{secs}s",
                        if self.force_local { "local:" } else { "" },
                        self.limit
                    ),
                };
            }
        };
        let burst = match self.max_burst {
            Some(burst) => format!(",max_burst={burst}"),
            None => String::new(),
        };
        format!(
            "{}{}/{period}{burst}",
            if self.force_local { "local:" } else { "" },
            self.limit
        )
    }
}

impl std::fmt::Debug for ThrottleSpec {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.as_string())
    }
}

impl std::fmt::Display for ThrottleSpec {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.as_string())
    }
}

impl From<ThrottleSpec> for String {
    fn from(spec: ThrottleSpec) -> String {
        spec.as_string()
    }
}

impl TryFrom<String> for ThrottleSpec {
    type Error = String;
    fn try_from(s: String) -> Result<Self, String> {
        Self::try_from(s.as_str())
    }
}

impl TryFrom<&str> for ThrottleSpec {
    type Error = String;
    fn try_from(s: &str) -> Result<Self, String> {
        let (force_local, s) = match s.strip_prefix("local:") {
            Some(s) => (true, s),
            None => (false, s),
        };

        let (s, max_burst) = match s.split_once(",max_burst=") {
            Some((s, burst)) => (
                s,
                Some(
                    burst
                        .parse::<u64>()
                        .map_err(|err| format!("invalid max_burst '{burst}': {err:#}"))?,
                ),
            ),
            None => (s, None),
        };

        let (limit, period) = s
            .split_once('/')
            .ok_or_else(|| format!("expected 'limit/period', got {s}"))?;

        let period = match period.strip_suffix('s').and_then(|p| p.parse::<u64>().ok()) {
            Some(secs) if period.chars().next().is_some_and(|c| c.is_ascii_digit()) => secs,
            _ => match period {
                "h" | "hr" | "hour" => 3600,
                "m" | "min" | "minute" => 60,
                "s" | "sec" | "second" => 1,
                "d" | "day" => 86400,
                invalid => return Err(format!("unknown period quantity {invalid}")),
            },
        };

        // Allow "1_000/hr" and "1,000/hr" for more readable config
        let limit: String = limit.chars().filter(|c| !matches!(c, '_' | ',')).collect();

        let limit = limit
            .parse::<u64>()
            .map_err(|err| format!("invalid limit '{limit}': {err:#}"))?;

        if limit == 0 {
            return Err(format!(
                "invalid ThrottleSpec `{s}`: limit must be greater than 0!"
            ));
        }

        Ok(Self {
            limit,
            period,
            max_burst,
            force_local,
        })
    }
}

#[derive(Debug, Eq, PartialEq, Serialize)]
pub struct ThrottleResult {
    /// true if the action was limited
    pub throttled: bool,
    /// The total limit of the key (max_burst + 1). This is equivalent to
    /// the common X-RateLimit-Limit HTTP header.
    pub limit: u64,
    /// The remaining limit of the key. Equivalent to X-RateLimit-Remaining.
    pub remaining: u64,
    /// How long until the limit resets to its maximum capacity.
    /// Equivalent to X-RateLimit-Reset.
    pub reset_after: Duration,
    /// How long until the caller should retry, or None if the action
    /// was allowed. Equivalent to Retry-After.
    pub retry_after: Option<Duration>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn throttle_spec_parse() {
        assert_eq!(
            ThrottleSpec::try_from("100/hr").unwrap(),
            ThrottleSpec {
                limit: 100,
                period: 3600,
                max_burst: None,
                force_local: false,
            }
        );
        assert_eq!(
            ThrottleSpec::try_from("local:100/hr").unwrap(),
            ThrottleSpec {
                limit: 100,
                period: 3600,
                max_burst: None,
                force_local: true,
            }
        );
        assert_eq!(
            ThrottleSpec::try_from("1_0,0/hour").unwrap(),
            ThrottleSpec {
                limit: 100,
                period: 3600,
                max_burst: None,
                force_local: false,
            }
        );
        assert_eq!(
            ThrottleSpec::try_from("500/d,max_burst=1").unwrap(),
            ThrottleSpec {
                limit: 500,
                period: 86400,
                max_burst: Some(1),
                force_local: false,
            }
        );
        assert_eq!(
            ThrottleSpec::try_from("100/our").unwrap_err(),
            "unknown period quantity our".to_string()
        );
        assert_eq!(
            ThrottleSpec::try_from("three/hour").unwrap_err(),
            "invalid limit 'three': invalid digit found in string".to_string()
        );
    }

    #[test]
    fn throttle_spec_string() {
        assert_eq!(
            ThrottleSpec {
                limit: 100,
                period: 3600,
                max_burst: None,
                force_local: false,
            }
            .as_string(),
            "100/h"
        );
        assert_eq!(
            ThrottleSpec {
                limit: 100,
                period: 3600,
                max_burst: None,
                force_local: true,
            }
            .as_string(),
            "local:100/h"
        );
        assert_eq!(
            ThrottleSpec {
                limit: 500,
                period: 86400,
                max_burst: Some(1),
                force_local: false,
            }
            .as_string(),
            "500/d,max_burst=1"
        );
    }
}
