use crate::Error;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

static MEMORY: LazyLock<Mutex<MemoryStore>> = LazyLock::new(|| Mutex::new(MemoryStore::new()));

/// A concurrency limit: at most `limit` leases may be held at once
/// for a given key. The serialized form is either a bare integer or
/// a string like "local:10" to force the process-local store.
#[derive(Eq, PartialEq, Clone, Copy, Hash)]
pub struct LimitSpec {
    pub limit: usize,
    pub force_local: bool,
}

impl LimitSpec {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            force_local: false,
        }
    }
}

impl std::fmt::Display for LimitSpec {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.force_local {
            write!(fmt, "local:{}", self.limit)
        } else {
            write!(fmt, "{}", self.limit)
        }
    }
}

impl std::fmt::Debug for LimitSpec {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, fmt)
    }
}

impl Serialize for LimitSpec {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        if self.force_local {
            s.serialize_str(&format!("local:{}", self.limit))
        } else {
            s.serialize_u64(self.limit as u64)
        }
    }
}

impl<'de> Deserialize<'de> for LimitSpec {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> serde::de::Visitor<'de> for V {
            type Value = LimitSpec;

            fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
                fmt.write_str("an integer limit or a string like 'local:10'")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<LimitSpec, E> {
                Ok(LimitSpec::new(v as usize))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<LimitSpec, E> {
                if v < 1 {
                    return Err(E::custom("limit must be 1 or larger"));
                }
                Ok(LimitSpec::new(v as usize))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<LimitSpec, E> {
                let (force_local, v) = match v.strip_prefix("local:") {
                    Some(v) => (true, v),
                    None => (false, v),
                };
                let limit = v
                    .parse::<usize>()
                    .map_err(|err| E::custom(format!("invalid limit '{v}': {err:#}")))?;
                Ok(LimitSpec { limit, force_local })
            }
        }
        d.deserialize_any(V)
    }
}

pub struct LimitSpecWithDuration {
    pub spec: LimitSpec,
    /// Maximum lease duration for a single count
    pub duration: Duration,
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum Backend {
    Memory,
    #[cfg(feature = "redis")]
    Redis,
}

/// Holding a LimitLease counts 1 against the named limit until it is
/// released or dropped
#[derive(Debug)]
pub struct LimitLease {
    name: String,
    uuid: Uuid,
    armed: bool,
    backend: Backend,
}

struct MemoryStore {
    sets: HashMap<String, Arc<LeaseSet>>,
}

impl MemoryStore {
    fn new() -> Self {
        Self {
            sets: HashMap::new(),
        }
    }

    fn get_or_create(&mut self, key: &str) -> Arc<LeaseSet> {
        self.sets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(LeaseSet::default()))
            .clone()
    }

    fn get(&self, key: &str) -> Option<Arc<LeaseSet>> {
        self.sets.get(key).cloned()
    }
}

#[derive(Default)]
struct LeaseSet {
    leases: Mutex<HashMap<Uuid, Instant>>,
    notify: Notify,
}

impl LeaseSet {
    async fn acquire(
        &self,
        uuid: Uuid,
        limit: usize,
        duration: Duration,
        deadline: Instant,
    ) -> Result<(), Error> {
        loop {
            let soonest = {
                let mut leases = self.leases.lock();
                let now = Instant::now();
                leases.retain(|_, &mut expires| expires > now);
                if leases.len() < limit {
                    leases.insert(uuid, now + duration);
                    return Ok(());
                }
                leases
                    .values()
                    .min()
                    .copied()
                    .expect("non-empty since len >= limit >= 1")
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TooManyLeases(
                    soonest.saturating_duration_since(now),
                ));
            }

            let wait = soonest
                .min(deadline)
                .saturating_duration_since(now)
                .max(Duration::from_millis(50));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn release(&self, uuid: Uuid) {
        self.leases.lock().remove(&uuid);
        self.notify.notify_waiters();
    }

    fn extend(&self, uuid: Uuid, duration: Duration) -> Result<(), Error> {
        match self.leases.lock().get_mut(&uuid) {
            Some(expires) => {
                *expires = Instant::now() + duration;
                Ok(())
            }
            None => Err(Error::NonExistentLease),
        }
    }
}

impl LimitSpecWithDuration {
    /// Acquire a lease against `key`, waiting until `deadline` for an
    /// existing holder to release or expire
    pub async fn acquire_lease<S: AsRef<str>>(
        &self,
        key: S,
        deadline: Instant,
    ) -> Result<LimitLease, Error> {
        #[cfg(feature = "redis")]
        if !self.spec.force_local {
            if let Some(conn) = crate::redis_backend::get_redis() {
                return self.acquire_lease_redis(conn, key.as_ref(), deadline).await;
            }
        }
        self.acquire_lease_memory(key.as_ref(), deadline).await
    }

    async fn acquire_lease_memory(&self, key: &str, deadline: Instant) -> Result<LimitLease, Error> {
        let uuid = Uuid::new_v4();
        let set = MEMORY.lock().get_or_create(key);

        set.acquire(uuid, self.spec.limit, self.duration, deadline)
            .await?;

        Ok(LimitLease {
            name: key.to_string(),
            uuid,
            armed: true,
            backend: Backend::Memory,
        })
    }

    #[cfg(feature = "redis")]
    async fn acquire_lease_redis(
        &self,
        conn: crate::RedisConnection,
        key: &str,
        deadline: Instant,
    ) -> Result<LimitLease, Error> {
        use crate::redis_backend::acquire_lease_script;

        loop {
            let uuid = Uuid::new_v4();
            match acquire_lease_script(&conn, key, uuid, self.spec.limit, self.duration).await? {
                None => {
                    return Ok(LimitLease {
                        name: key.to_string(),
                        uuid,
                        armed: true,
                        backend: Backend::Redis,
                    });
                }
                Some(next_expiration) => {
                    if Instant::now() >= deadline {
                        return Err(Error::TooManyLeases(next_expiration));
                    }
                    tokio::time::sleep(Duration::from_secs(3).min(next_expiration)).await;
                }
            }
        }
    }
}

impl LimitLease {
    pub async fn release(&mut self) {
        self.armed = false;
        match self.backend {
            Backend::Memory => {
                if let Some(set) = MEMORY.lock().get(&self.name) {
                    set.release(self.uuid);
                }
            }
            #[cfg(feature = "redis")]
            Backend::Redis => {
                if let Some(conn) = crate::redis_backend::get_redis() {
                    crate::redis_backend::release_lease(&conn, &self.name, self.uuid).await;
                }
            }
        }
    }

    pub async fn extend(&self, duration: Duration) -> Result<(), Error> {
        match self.backend {
            Backend::Memory => match MEMORY.lock().get(&self.name) {
                Some(set) => set.extend(self.uuid, duration),
                None => Err(Error::NonExistentLease),
            },
            #[cfg(feature = "redis")]
            Backend::Redis => match crate::redis_backend::get_redis() {
                Some(conn) => {
                    crate::redis_backend::extend_lease(&conn, &self.name, self.uuid, duration).await
                }
                None => Err(Error::NonExistentLease),
            },
        }
    }
}

impl Drop for LimitLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        match self.backend {
            Backend::Memory => {
                if let Some(set) = MEMORY.lock().get(&self.name) {
                    set.release(self.uuid);
                }
            }
            #[cfg(feature = "redis")]
            Backend::Redis => {
                let name = self.name.clone();
                let uuid = self.uuid;
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        if let Some(conn) = crate::redis_backend::get_redis() {
                            crate::redis_backend::release_lease(&conn, &name, uuid).await;
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn lease_limit_is_enforced() {
        let spec = LimitSpecWithDuration {
            spec: LimitSpec {
                limit: 2,
                force_local: true,
            },
            duration: Duration::from_secs(60),
        };

        let deadline = Instant::now() + Duration::from_millis(50);
        let _a = spec.acquire_lease("test-lease", deadline).await.unwrap();
        let _b = spec.acquire_lease("test-lease", deadline).await.unwrap();
        let err = spec
            .acquire_lease("test-lease", Instant::now() + Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooManyLeases(_)));
    }

    #[tokio::test]
    async fn release_frees_a_slot() {
        let spec = LimitSpecWithDuration {
            spec: LimitSpec {
                limit: 1,
                force_local: true,
            },
            duration: Duration::from_secs(60),
        };

        let mut a = spec
            .acquire_lease("test-release", Instant::now() + Duration::from_millis(50))
            .await
            .unwrap();
        a.release().await;

        let _b = spec
            .acquire_lease("test-release", Instant::now() + Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[test]
    fn limit_spec_serde() {
        #[derive(Deserialize, Serialize, Debug)]
        struct Demo {
            limit: LimitSpec,
        }

        let d: Demo = serde_json::from_str(r#"{"limit":10}"#).unwrap();
        assert_eq!(d.limit, LimitSpec::new(10));

        let d: Demo = serde_json::from_str(r#"{"limit":"local:32"}"#).unwrap();
        assert_eq!(
            d.limit,
            LimitSpec {
                limit: 32,
                force_local: true
            }
        );
        assert_eq!(serde_json::to_string(&d).unwrap(), r#"{"limit":"local:32"}"#);
    }
}
