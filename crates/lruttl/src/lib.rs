//! An LRU cache where each entry carries its own expiration time.
//! Caches register themselves in a process-wide list so that they can be
//! purged in bulk, either explicitly or when the configuration epoch
//! changes (for caches that opt in to epoch invalidation).
use lru_cache::LruCache;
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, LazyLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

static CACHES: LazyLock<Mutex<Vec<Weak<dyn CachePurger + Send + Sync>>>> =
    LazyLock::new(Mutex::default);

trait CachePurger {
    fn name(&self) -> &str;
    fn purge(&self) -> usize;
    fn purge_on_epoch_change(&self) -> bool;
}

/// Purge every registered cache, returning the number of entries dropped
pub fn purge_all_caches() -> usize {
    purge_matching(|_| true)
}

/// Purge the caches that opted in to epoch-based invalidation.
/// Call this when the config epoch is incremented.
pub fn purge_epoch_caches() -> usize {
    purge_matching(|p| p.purge_on_epoch_change())
}

fn purge_matching(filter: impl Fn(&dyn CachePurger) -> bool) -> usize {
    let mut purgers = vec![];
    {
        let mut caches = CACHES.lock();
        caches.retain(|entry| match entry.upgrade() {
            Some(purger) => {
                purgers.push(purger);
                true
            }
            None => false,
        });
    }

    let mut total = 0;
    for purger in purgers {
        if filter(&*purger) {
            let num_entries = purger.purge();
            if num_entries > 0 {
                tracing::debug!("cleared {num_entries} entries from cache {}", purger.name());
            }
            total += num_entries;
        }
    }
    total
}

#[derive(Debug, Clone)]
struct Item<V> {
    item: V,
    expiration: Instant,
}

pub struct ItemLookup<V> {
    pub item: V,
    pub expiration: Instant,
    /// true if this lookup populated the entry,
    /// false if it was satisfied by the cache
    pub is_fresh: bool,
}

struct Inner<K: Hash + Eq, V: Clone> {
    name: String,
    cache: Mutex<LruCache<K, Item<V>>>,
    /// Serializes concurrent populators of the same key
    pending: Mutex<std::collections::HashMap<K, Arc<Semaphore>>>,
    epoch_purge: bool,
}

impl<K: Hash + Eq, V: Clone> CachePurger for Inner<K, V> {
    fn name(&self) -> &str {
        &self.name
    }
    fn purge(&self) -> usize {
        let mut cache = self.cache.lock();
        let num_entries = cache.len();
        cache.clear();
        num_entries
    }
    fn purge_on_epoch_change(&self) -> bool {
        self.epoch_purge
    }
}

pub struct LruCacheWithTtl<K: Hash + Eq, V: Clone> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> LruCacheWithTtl<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new_named<S: Into<String>>(name: S, capacity: usize) -> Self {
        Self::build(name, capacity, false)
    }

    /// A cache whose entries are invalidated when the config epoch changes
    pub fn new_named_epoch<S: Into<String>>(name: S, capacity: usize) -> Self {
        Self::build(name, capacity, true)
    }

    fn build<S: Into<String>>(name: S, capacity: usize, epoch_purge: bool) -> Self {
        let inner = Arc::new(Inner {
            name: name.into(),
            cache: Mutex::new(LruCache::new(capacity)),
            pending: Mutex::new(std::collections::HashMap::new()),
            epoch_purge,
        });

        // Register with the global purger list via a type-erased weak ref
        {
            let generic: Arc<dyn CachePurger + Send + Sync> = inner.clone();
            CACHES.lock().push(Arc::downgrade(&generic));
        }

        Self { inner }
    }

    pub fn clear(&self) -> usize {
        self.inner.purge()
    }

    pub fn get<Q: ?Sized>(&self, name: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        self.lookup(name).map(|lookup| lookup.item)
    }

    pub fn lookup<Q: ?Sized>(&self, name: &Q) -> Option<ItemLookup<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let mut cache = self.inner.cache.lock();
        let entry = cache.get_mut(name)?;
        if entry.expiration <= Instant::now() {
            cache.remove(name);
            return None;
        }
        Some(ItemLookup {
            item: entry.item.clone(),
            expiration: entry.expiration,
            is_fresh: false,
        })
    }

    pub fn insert(&self, name: K, item: V, expiration: Instant) {
        self.inner.cache.lock().insert(
            name,
            Item {
                item,
                expiration,
            },
        );
    }

    /// Get the cached value for `name`, or run `future` to populate it.
    /// Concurrent callers for the same key are collapsed into a single
    /// population (single-flight); the losers wait and then read the
    /// value cached by the winner. The ttl for a populated entry is
    /// computed from the value by `ttl_fn`.
    pub async fn get_or_try_insert<E, Fut>(
        &self,
        name: &K,
        ttl_fn: impl FnOnce(&V) -> Duration,
        future: Fut,
    ) -> Result<ItemLookup<V>, E>
    where
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.lookup(name) {
            return Ok(hit);
        }

        let sema = self
            .inner
            .pending
            .lock()
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        // Serialize with any other caller populating this key.
        // The semaphore is never closed, so acquire cannot fail.
        let _permit = sema
            .acquire()
            .await
            .expect("populate semaphore never closed");

        // Maybe someone else won the race while we waited
        if let Some(hit) = self.lookup(name) {
            return Ok(hit);
        }

        let result = future.await;

        self.inner.pending.lock().remove(name);

        match result {
            Ok(item) => {
                let expiration = Instant::now() + ttl_fn(&item);
                self.insert(name.clone(), item.clone(), expiration);
                Ok(ItemLookup {
                    item,
                    expiration,
                    is_fresh: true,
                })
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn basic_ttl() {
        let cache: LruCacheWithTtl<String, u32> = LruCacheWithTtl::new_named("basic", 8);
        cache.insert(
            "foo".to_string(),
            42,
            Instant::now() + Duration::from_secs(60),
        );
        assert_eq!(cache.get("foo"), Some(42));

        cache.insert("bar".to_string(), 1, Instant::now() - Duration::from_secs(1));
        assert_eq!(cache.get("bar"), None, "expired on arrival");
    }

    #[tokio::test]
    async fn single_flight_populates_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let cache: Arc<LruCacheWithTtl<String, u32>> =
            Arc::new(LruCacheWithTtl::new_named("flight", 8));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = vec![];
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_try_insert(
                        &"key".to_string(),
                        |_| Duration::from_secs(60),
                        async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok::<u32, ()>(7)
                        },
                    )
                    .await
                    .unwrap()
                    .item
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn epoch_purge_is_opt_in() {
        let plain: LruCacheWithTtl<String, u32> = LruCacheWithTtl::new_named("plain-epoch", 8);
        let epochy: LruCacheWithTtl<String, u32> =
            LruCacheWithTtl::new_named_epoch("epochy", 8);
        let expire = Instant::now() + Duration::from_secs(60);
        plain.insert("a".to_string(), 1, expire);
        epochy.insert("a".to_string(), 1, expire);

        purge_epoch_caches();
        assert_eq!(plain.get("a"), Some(1));
        assert_eq!(epochy.get("a"), None);
    }
}
