use crate::{Error, ThrottleResult};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::sync::{LazyLock, OnceLock};
use std::time::Duration;

static REDIS: OnceLock<RedisConnection> = OnceLock::new();

/// GCRA evaluated server-side so that the increment-and-check is atomic
/// across every node sharing the coordinator.
/// Adapted from <https://github.com/Losant/redis-gcra/blob/master/lib/gcra.lua>
static GCRA_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local period = tonumber(ARGV[2])
local max_burst = tonumber(ARGV[3])
local quantity = tonumber(ARGV[4])

local interval = period / limit
local increment = interval * quantity
local burst_offset = interval * max_burst

local now = tonumber(redis.call("TIME")[1])
local tat = redis.call("GET", key)

if not tat then
  tat = now
else
  tat = tonumber(tat)
end
tat = math.max(tat, now)

local new_tat = tat + increment
local allow_at = new_tat - burst_offset
local diff = now - allow_at

local throttled
local reset_after
local retry_after

local remaining = math.floor(diff / interval)

if remaining < 0 then
  throttled = 1
  remaining = math.max(math.floor((now - (tat - burst_offset)) / interval), 0)
  reset_after = math.ceil(tat - now)
  retry_after = math.ceil(diff * -1)
else
  throttled = 0
  reset_after = math.ceil(new_tat - now)
  retry_after = 0
  redis.call("SET", key, new_tat, "EX", reset_after)
end

return {throttled, remaining, reset_after, retry_after}
"#,
    )
});

#[derive(Clone)]
pub struct RedisConnection {
    manager: ConnectionManager,
}

impl RedisConnection {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

/// Configure the cluster coordinator. Named throttles and leases are
/// shared via this connection from this point on.
pub fn use_redis(conn: RedisConnection) -> Result<(), Error> {
    REDIS
        .set(conn)
        .map_err(|_| Error::Generic("redis already configured for throttles".to_string()))?;
    Ok(())
}

pub(crate) fn get_redis() -> Option<RedisConnection> {
    REDIS.get().cloned()
}

/// Lease acquisition over a sorted set of uuid -> expiry.
/// Expired members are trimmed, then the member is added only when the
/// set is below the limit; otherwise the soonest expiry is returned so
/// the caller knows how long to wait.
static ACQUIRE_LEASE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local expires = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local uuid = ARGV[4]

redis.call("ZREMRANGEBYSCORE", key, "-inf", now)

if redis.call("ZCARD", key) < limit then
  redis.call("ZADD", key, expires, uuid)
  redis.call("EXPIREAT", key, math.ceil(expires))
  return -1
end

local next_expiry = redis.call("ZRANGE", key, 0, 0, "WITHSCORES")[2]
return math.max(math.ceil(next_expiry - now), 1)
"#,
    )
});

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Returns None when the lease was acquired, or Some(wait) with the
/// time until the soonest existing lease expires
pub(crate) async fn acquire_lease_script(
    conn: &RedisConnection,
    key: &str,
    uuid: uuid::Uuid,
    limit: usize,
    duration: Duration,
) -> Result<Option<Duration>, Error> {
    let now = now_unix();
    let mut manager = conn.manager.clone();
    let result: i64 = ACQUIRE_LEASE_SCRIPT
        .key(key)
        .arg(now)
        .arg(now + duration.as_secs_f64())
        .arg(limit)
        .arg(uuid.to_string())
        .invoke_async(&mut manager)
        .await?;

    if result < 0 {
        Ok(None)
    } else {
        Ok(Some(Duration::from_secs(result as u64)))
    }
}

pub(crate) async fn release_lease(conn: &RedisConnection, key: &str, uuid: uuid::Uuid) {
    let mut manager = conn.manager.clone();
    let result: Result<(), _> = redis::cmd("ZREM")
        .arg(key)
        .arg(uuid.to_string())
        .query_async(&mut manager)
        .await;
    if let Err(err) = result {
        tracing::error!("failed to release lease {key}: {err:#}");
    }
}

pub(crate) async fn extend_lease(
    conn: &RedisConnection,
    key: &str,
    uuid: uuid::Uuid,
    duration: Duration,
) -> Result<(), Error> {
    let mut manager = conn.manager.clone();
    let added: i64 = redis::cmd("ZADD")
        .arg(key)
        .arg("XX")
        .arg("CH")
        .arg(now_unix() + duration.as_secs_f64())
        .arg(uuid.to_string())
        .query_async(&mut manager)
        .await?;
    if added == 0 {
        return Err(Error::NonExistentLease);
    }
    Ok(())
}

pub(crate) async fn redis_throttle(
    conn: RedisConnection,
    key: &str,
    limit: u64,
    period: Duration,
    max_burst: u64,
    quantity: u64,
) -> Result<ThrottleResult, Error> {
    let mut manager = conn.manager;
    let result: (u64, u64, u64, u64) = GCRA_SCRIPT
        .key(key)
        .arg(limit)
        .arg(period.as_secs())
        .arg(max_burst)
        .arg(quantity)
        .invoke_async(&mut manager)
        .await?;

    let (throttled, remaining, reset_after, retry_after) = result;

    Ok(ThrottleResult {
        throttled: throttled == 1,
        limit: max_burst + 1,
        remaining,
        reset_after: Duration::from_secs(reset_after),
        retry_after: match retry_after {
            0 => None,
            n => Some(Duration::from_secs(n)),
        },
    })
}
