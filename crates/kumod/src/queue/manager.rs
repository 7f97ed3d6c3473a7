use crate::queue::queue::QueueHandle;
use crate::queue::{IncrementAttempts, Queue};
use dashmap::DashMap;
use message::Message;
use prometheus::IntGauge;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

pub static MANAGER: LazyLock<QueueManager> = LazyLock::new(QueueManager::new);

pub static SCHEDULED_QUEUE_COUNT: LazyLock<IntGauge> = LazyLock::new(|| {
    prometheus::register_int_gauge!(
        "scheduled_queue_count",
        "how many scheduled queues are tracked by the QueueManager"
    )
    .unwrap()
});

/// The set of scheduled queues, created on demand and resolved via
/// a single-flight protocol: concurrent resolvers of the same name
/// collapse into one Queue::new call, and failures are negatively
/// cached for a minute.
pub struct QueueManager {
    pub named: DashMap<String, QueueSlot>,
}

pub enum QueueSlot {
    Handle(QueueHandle),
    Resolving(Arc<Semaphore>),
    Failed { error: String, expires: Instant },
}

#[derive(Clone)]
enum SlotLease {
    Handle(QueueHandle),
    Resolving(Arc<Semaphore>),
}

impl QueueManager {
    fn new() -> Self {
        Self {
            named: DashMap::new(),
        }
    }

    /// Insert message into the queue named `name`
    pub async fn insert(name: &str, msg: Message) -> anyhow::Result<()> {
        let entry = Self::resolve(name).await?;
        entry.insert(msg).await
    }

    /// Re-insert a message into the queue subsystem after a
    /// transient outcome or a throttle decision.
    /// The queue name is re-read from the message metadata, so a
    /// message that was re-bound to a different queue moves there.
    pub async fn requeue_message(
        msg: Message,
        increment_attempts: bool,
        delay: Option<chrono::Duration>,
    ) -> anyhow::Result<()> {
        msg.load_meta_if_needed().await?;
        let queue_name = msg.get_queue_name()?;
        let queue = Self::resolve(&queue_name).await?;
        queue
            .requeue_message_internal(
                msg,
                if increment_attempts {
                    IncrementAttempts::Yes
                } else {
                    IncrementAttempts::No
                },
                delay,
            )
            .await
    }

    fn resolve_lease(name: &str) -> anyhow::Result<SlotLease> {
        match MANAGER.named.get_mut(name) {
            Some(mut item) => match item.value() {
                QueueSlot::Handle(handle) => Ok(SlotLease::Handle(handle.clone())),
                QueueSlot::Resolving(sema) => Ok(SlotLease::Resolving(sema.clone())),
                QueueSlot::Failed { error, expires } => {
                    if *expires > Instant::now() {
                        anyhow::bail!("{error}");
                    }
                    // Negative cache expired; set up the slot
                    // for a fresh resolve
                    let sema = Arc::new(Semaphore::new(1));
                    *item.value_mut() = QueueSlot::Resolving(sema.clone());
                    Ok(SlotLease::Resolving(sema))
                }
            },
            None => {
                let entry = MANAGER.named.entry(name.to_string()).or_insert_with(|| {
                    SCHEDULED_QUEUE_COUNT.inc();
                    QueueSlot::Resolving(Arc::new(Semaphore::new(1)))
                });
                match entry.value() {
                    QueueSlot::Handle(handle) => Ok(SlotLease::Handle(handle.clone())),
                    QueueSlot::Resolving(sema) => Ok(SlotLease::Resolving(sema.clone())),
                    QueueSlot::Failed { error, .. } => {
                        // Our first try found nothing in the map, so
                        // an entry seen on this second try must be new
                        // enough to be current; propagate its error
                        // without consulting the expiry
                        anyhow::bail!("{error}");
                    }
                }
            }
        }
    }

    /// Get the handle from the slot, for use by `resolve` only.
    /// Propagates a negatively cached error without considering its
    /// expiry: overlapping calls implicitly fall within the caching
    /// period and observe the same failure.
    fn get_slot(name: &str) -> anyhow::Result<Option<QueueHandle>> {
        match MANAGER.named.get(name) {
            Some(item) => match item.value() {
                QueueSlot::Handle(h) => Ok(Some(h.clone())),
                QueueSlot::Resolving(_) => Ok(None),
                QueueSlot::Failed { error, .. } => anyhow::bail!("{error}"),
            },
            None => Ok(None),
        }
    }

    /// Resolve a scheduled queue name to a handle, returning
    /// a pre-existing handle if it is already known
    pub async fn resolve(name: &str) -> anyhow::Result<QueueHandle> {
        loop {
            match Self::resolve_lease(name)? {
                SlotLease::Handle(e) => return Ok(e),
                SlotLease::Resolving(sema) => {
                    match sema.acquire().await {
                        Ok(_permit) => {
                            // Holding the only permit: we are
                            // responsible for driving the state of
                            // the slot towards resolution or failure.
                            //
                            // The permit is implicitly dropped when we
                            // return; replacing the slot drops the
                            // associated semaphore, which wakes all
                            // other waiters so they re-run the
                            // resolve loop and observe the outcome.
                            match Self::get_slot(name)? {
                                Some(handle) => {
                                    // Someone else fully resolved the entry
                                    return Ok(handle);
                                }
                                None => {
                                    let result = Queue::new(name.to_string()).await;

                                    return match result {
                                        Ok(entry) => {
                                            if MANAGER
                                                .named
                                                .insert(
                                                    name.to_string(),
                                                    QueueSlot::Handle(entry.clone()),
                                                )
                                                .is_none()
                                            {
                                                SCHEDULED_QUEUE_COUNT.inc();
                                            }
                                            Ok(entry)
                                        }
                                        Err(err) => {
                                            if MANAGER
                                                .named
                                                .insert(
                                                    name.to_string(),
                                                    QueueSlot::Failed {
                                                        error: format!("{err:#}"),
                                                        expires: Instant::now()
                                                            + Duration::from_secs(60),
                                                    },
                                                )
                                                .is_none()
                                            {
                                                SCHEDULED_QUEUE_COUNT.inc();
                                            }
                                            Err(err)
                                        }
                                    };
                                }
                            }
                        }
                        Err(_) => {
                            // Semaphore was closed: the resolving
                            // slot was replaced. Retry the resolve.
                            continue;
                        }
                    }
                }
            }
        }
    }

    pub fn get_opt(name: &str) -> Option<QueueHandle> {
        match MANAGER.named.get(name)?.value() {
            QueueSlot::Handle(h) => Some(h.clone()),
            QueueSlot::Resolving(_) | QueueSlot::Failed { .. } => None,
        }
    }

    pub fn all_queue_names() -> Vec<String> {
        MANAGER
            .named
            .iter()
            .map(|item| item.key().to_string())
            .collect()
    }

    /// Remove the named queue if it is still empty
    pub fn remove_if_empty(name: &str) -> bool {
        let removed = MANAGER
            .named
            .remove_if(name, |_key, slot| match slot {
                QueueSlot::Handle(handle) => handle.is_empty(),
                QueueSlot::Resolving(_) => false,
                QueueSlot::Failed { expires, .. } => *expires <= Instant::now(),
            })
            .is_some();
        if removed {
            SCHEDULED_QUEUE_COUNT.dec();
        }
        removed
    }
}
