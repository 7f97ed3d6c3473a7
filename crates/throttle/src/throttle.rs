use crate::{Error, ThrottleResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

/// Process-local store for the generic cell rate algorithm: maps a
/// throttle key to its theoretical arrival time, expressed as seconds
/// since the unix epoch.
static MEMORY: LazyLock<Mutex<HashMap<String, f64>>> = LazyLock::new(Mutex::default);

/// Entries whose tat is this far in the past are dead weight; they are
/// pruned opportunistically when the store grows beyond PRUNE_THRESHOLD.
const PRUNE_THRESHOLD: usize = 16 * 1024;

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The same GCRA arithmetic that the cluster-shared script computes,
/// evaluated against the in-memory store.
pub(crate) fn local_throttle(
    key: &str,
    limit: u64,
    period: Duration,
    max_burst: u64,
    quantity: u64,
) -> Result<ThrottleResult, Error> {
    if limit == 0 {
        return Err(Error::Generic(format!(
            "invalid limit 0 for throttle {key}"
        )));
    }
    let interval = period.as_secs_f64() / limit as f64;
    let increment = interval * quantity as f64;
    let burst_offset = interval * max_burst as f64;
    let now = now_unix();

    let mut store = MEMORY.lock();

    if store.len() > PRUNE_THRESHOLD {
        store.retain(|_, &mut tat| tat > now);
    }

    let tat = store.get(key).copied().unwrap_or(now).max(now);
    let new_tat = tat + increment;
    let allow_at = new_tat - burst_offset;
    let diff = now - allow_at;
    let remaining = (diff / interval).floor();

    let result = if remaining < 0.0 {
        // Compute how many tokens there actually are, since `remaining`
        // reflects the hypothetical post-increment state
        let actual = ((now - (tat - burst_offset)) / interval).floor().max(0.0);
        ThrottleResult {
            throttled: true,
            limit: max_burst + 1,
            remaining: actual as u64,
            reset_after: Duration::from_secs_f64((tat - now).max(0.0).ceil()),
            retry_after: Some(Duration::from_secs_f64((-diff).max(0.0).ceil())),
        }
    } else {
        store.insert(key.to_string(), new_tat);
        ThrottleResult {
            throttled: false,
            limit: max_burst + 1,
            remaining: remaining as u64,
            reset_after: Duration::from_secs_f64((new_tat - now).max(0.0).ceil()),
            retry_after: None,
        }
    };

    Ok(result)
}

/// It is very important for `key` to be used with the same `limit`,
/// `period` and `max_burst` values in order to produce meaningful
/// results; encode the parameters into the key to make misuse
/// impossible.
///
/// * `limit` - the maximum number of tokens allowed over `period`
/// * `period` - the time period over which `limit` is allowed
/// * `max_burst` - the maximum initial burst permitted. Set this
///   smaller than `limit` to force the budget to spread across time.
/// * `quantity` - how many tokens to add to the throttle
/// * `force_local` - always use the in-memory store on the local
///   machine even if the redis backend has been configured
pub async fn throttle(
    key: &str,
    limit: u64,
    period: Duration,
    max_burst: u64,
    quantity: u64,
    force_local: bool,
) -> Result<ThrottleResult, Error> {
    #[cfg(feature = "redis")]
    if !force_local {
        if let Some(conn) = crate::redis_backend::get_redis() {
            return crate::redis_backend::redis_throttle(
                conn, key, limit, period, max_burst, quantity,
            )
            .await;
        }
    }
    let _ = force_local;
    local_throttle(key, limit, period, max_burst, quantity)
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_big_limits(limit: u64, max_burst: Option<u64>, permitted_tolerance: f64) {
        let period = Duration::from_secs(60);
        let max_burst = max_burst.unwrap_or(limit);
        let key = format!("test_big_limits-{limit}-{max_burst}");

        let mut throttled_iter = None;

        for i in 0..limit * 2 {
            let result = local_throttle(&key, limit, period, max_burst, 1).unwrap();
            if result.throttled {
                throttled_iter.replace(i);
                break;
            }
        }

        let throttled_iter = throttled_iter.expect("to hit the throttle limit");
        let diff = ((max_burst as f64) - (throttled_iter as f64)).abs();
        let tolerance = ((max_burst as f64) * permitted_tolerance).max(1.0);

        assert!(
            diff <= tolerance,
            "throttled after {throttled_iter} iterations for \
             limit {limit}. diff={diff} is not within tolerance {tolerance}"
        );
    }

    #[test]
    fn basic_throttle_100() {
        test_big_limits(100, None, 0.01);
    }

    #[test]
    fn basic_throttle_1_000() {
        test_big_limits(1_000, None, 0.02);
    }

    #[test]
    fn basic_throttle_60_000_burst_100() {
        test_big_limits(60_000, Some(100), 0.05);
    }

    #[test]
    fn retry_after_is_set_when_throttled() {
        let period = Duration::from_secs(60);
        let key = "retry_after";
        // burst of 1: the second immediate acquire must be throttled
        let first = local_throttle(key, 60, period, 1, 1).unwrap();
        assert!(!first.throttled);
        let second = local_throttle(key, 60, period, 1, 1).unwrap();
        assert!(second.throttled);
        let delay = second.retry_after.expect("throttled implies retry_after");
        assert!(delay > Duration::ZERO && delay <= Duration::from_secs(2));
    }
}
