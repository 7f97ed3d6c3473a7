//! Owns the data and meta spools: definition from policy, startup
//! enumeration that reconstitutes the scheduled queues, and removal
//! when messages reach their final disposition.
use crate::logging::{log_disposition, LogDisposition};
use crate::policy::{Policy, SpoolKind, SpoolParams};
use crate::queue::{Queue, QueueManager};
use anyhow::Context;
use chrono::Utc;
use kumo_log_types::{EnhancedStatusCode, RecordType, Response};
use kumo_server_lifecycle::{Activity, ShutdownSubscription};
use message::Message;
use spool::local_disk::LocalDiskSpool;
use spool::{get_data_spool, get_meta_spool, Spool as SpoolTrait, SpoolEntry, SpoolId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static STARTED: AtomicBool = AtomicBool::new(false);

pub struct SpoolManager;

impl SpoolManager {
    fn open_spool(
        name: &str,
        params: &SpoolParams,
    ) -> anyhow::Result<Arc<dyn SpoolTrait + Send + Sync>> {
        tracing::debug!(
            "Defining {name} spool on {} ({:?})",
            params.path.display(),
            params.kind
        );
        match params.kind {
            SpoolKind::LocalDisk => Ok(Arc::new(
                LocalDiskSpool::new(&params.path, params.flush)
                    .with_context(|| format!("Opening {name} spool"))?,
            )),
            #[cfg(feature = "rocksdb")]
            SpoolKind::RocksDB => Ok(Arc::new(
                spool::rocks::RocksSpool::new(
                    &params.path,
                    params.flush,
                    params.rocks_params.clone(),
                )
                .with_context(|| format!("Opening {name} spool"))?,
            )),
            #[cfg(not(feature = "rocksdb"))]
            SpoolKind::RocksDB => {
                anyhow::bail!(
                    "kind=RocksDB for {name} spool requires building with the rocksdb feature"
                )
            }
        }
    }

    /// Open the spools named in the policy and install them as the
    /// global data/meta stores
    pub fn define_spools(policy: &Policy) -> anyhow::Result<()> {
        let data = policy
            .data_spool
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no data_spool is defined"))?;
        let meta = policy
            .meta_spool
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no meta_spool is defined"))?;

        spool::set_data_spool(Self::open_spool("data", data)?);
        spool::set_meta_spool(Self::open_spool("meta", meta)?);
        Ok(())
    }

    pub fn spool_started() -> bool {
        STARTED.load(Ordering::SeqCst)
    }

    pub async fn remove_from_spool(id: SpoolId) -> anyhow::Result<()> {
        let res_data = get_data_spool().remove(id).await;
        let res_meta = get_meta_spool().remove(id).await;
        // Not logged at error level because a message whose payload
        // was never spooled (eg: delivered on the first attempt with
        // deferred spooling) has nothing to remove
        if let Err(err) = res_data {
            tracing::debug!("Error removing data for {id}: {err:#}");
        }
        if let Err(err) = res_meta {
            tracing::debug!("Error removing meta for {id}: {err:#}");
        }
        Ok(())
    }

    /// Updates the next due time on msg, expiring it if that due time
    /// is outside of either the per-message expiration or the max_age
    /// configured on the queue. When per-message expiration is
    /// configured, max_age is ignored.
    ///
    /// Returns Some(msg) if the message should be inserted into the
    /// queues, None if it was expired.
    async fn update_next_due(
        id: SpoolId,
        msg: Message,
        queue: &Arc<Queue>,
        now: chrono::DateTime<Utc>,
    ) -> anyhow::Result<Option<Message>> {
        let queue_config = queue.queue_config.borrow();
        let age = msg.age(now);
        let num_attempts = queue_config.estimate_attempts_for_age(age);
        msg.set_num_attempts(num_attempts);

        let expired_response = |content: String| Response {
            code: 551,
            enhanced_code: Some(EnhancedStatusCode {
                class: 5,
                subject: 4,
                detail: 7,
            }),
            content,
            command: None,
        };

        match msg.get_scheduling().and_then(|sched| sched.expires) {
            Some(expires) => {
                // Per-message expiry
                let delay =
                    queue_config.remaining_delay_ignoring_max_age(num_attempts, age);
                let next_due = msg.delay_by(delay).unwrap_or(now);
                if next_due >= expires {
                    tracing::debug!("expiring {id} {next_due} > scheduled expiry {expires}");
                    log_disposition(LogDisposition {
                        kind: RecordType::Expiration,
                        msg,
                        site: "",
                        peer_address: None,
                        response: expired_response(format!(
                            "Next delivery time would be at {next_due} \
                             which exceeds the expiry time {expires}"
                        )),
                        egress_pool: None,
                        egress_source: None,
                        delivery_protocol: None,
                        provider: None,
                        session_id: None,
                    })
                    .await;
                    Self::remove_from_spool(id).await?;
                    return Ok(None);
                }
            }
            None => match queue_config.remaining_delay_for_age(num_attempts, age) {
                None => {
                    let max_age = queue_config.get_max_age();
                    tracing::debug!("expiring {id} {age} > {max_age}");
                    log_disposition(LogDisposition {
                        kind: RecordType::Expiration,
                        msg,
                        site: "",
                        peer_address: None,
                        response: expired_response(format!(
                            "Next delivery time would be {age} \
                             after creation, which exceeds max_age={max_age}"
                        )),
                        egress_pool: None,
                        egress_source: None,
                        delivery_protocol: None,
                        provider: None,
                        session_id: None,
                    })
                    .await;
                    Self::remove_from_spool(id).await?;
                    return Ok(None);
                }
                Some(delay) => {
                    msg.delay_by(delay);
                }
            },
        }

        Ok(Some(msg))
    }

    async fn spool_in_task(
        rx: flume::Receiver<SpoolEntry>,
        spooled_in: Arc<AtomicUsize>,
        failed_spool_in: Arc<AtomicUsize>,
    ) -> anyhow::Result<()> {
        let mut shutdown = ShutdownSubscription::get();

        loop {
            let entry = tokio::select! {
                _ = shutdown.shutting_down() => {
                    anyhow::bail!("shutting down");
                }
                entry = rx.recv_async() => match entry {
                    Ok(entry) => entry,
                    Err(_) => return Ok(()),
                },
            };

            let now = Utc::now();
            match entry {
                SpoolEntry::Item { id, data } => match Message::new_from_spool(id, data) {
                    Ok(msg) => {
                        spooled_in.fetch_add(1, Ordering::SeqCst);

                        match msg.get_queue_name() {
                            Ok(queue_name) => match QueueManager::resolve(&queue_name).await {
                                Err(err) => {
                                    // Not removed from the spool: this
                                    // represents a general configuration
                                    // error, not a problem with this
                                    // specific message
                                    tracing::error!(
                                        "failed to resolve queue {queue_name}: {err:#}. \
                                         Ignoring message until kumod is restarted."
                                    );
                                    failed_spool_in.fetch_add(1, Ordering::SeqCst);
                                }
                                Ok(queue) => {
                                    let Some(msg) =
                                        Self::update_next_due(id, msg, &queue, now).await?
                                    else {
                                        // Expired
                                        continue;
                                    };

                                    if let Err(err) = queue.insert(msg.clone()).await {
                                        tracing::error!(
                                            "failed to insert Message {id} \
                                             to queue {queue_name}: {err:#}. \
                                             Ignoring message until kumod is restarted"
                                        );
                                        failed_spool_in.fetch_add(1, Ordering::SeqCst);
                                    }
                                }
                            },
                            Err(err) => {
                                // A failure to compute the queue name
                                // implies that the metadata is corrupt,
                                // so there is nothing useful we can do
                                // with the message beyond logging it
                                tracing::error!(
                                    "Message {id} failed to compute queue name!: {err:#}. \
                                     Removing message from the spool."
                                );
                                log_disposition(LogDisposition {
                                    kind: RecordType::Expiration,
                                    msg,
                                    site: "localhost",
                                    peer_address: None,
                                    response: Response {
                                        code: 551,
                                        enhanced_code: Some(EnhancedStatusCode {
                                            class: 5,
                                            subject: 1,
                                            detail: 3,
                                        }),
                                        content: format!(
                                            "Failed to compute queue name: {err:#}"
                                        ),
                                        command: None,
                                    },
                                    egress_pool: None,
                                    egress_source: None,
                                    delivery_protocol: None,
                                    provider: None,
                                    session_id: None,
                                })
                                .await;
                                Self::remove_from_spool(id).await?;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::error!("Failed to parse metadata for {id}: {err:#}");
                        Self::remove_from_spool(id).await?;
                    }
                },
                SpoolEntry::Corrupt { id, error } => {
                    tracing::error!(
                        "Failed to load {id}: {error}. Removing message from the spool."
                    );
                    Self::remove_from_spool(id).await?;
                }
            }
        }
    }

    /// Enumerate the meta spool, reconstituting the scheduled queues
    /// from the stored messages. Blocks until the enumeration is
    /// complete, then leaves a periodic cleanup task running.
    pub async fn start_spool() -> anyhow::Result<()> {
        STARTED.store(true, Ordering::SeqCst);

        let (tx, rx) = flume::bounded(1024);
        get_meta_spool().enumerate(tx)?;

        let activity = Activity::get("spool enumeration".to_string())?;
        let spooled_in = Arc::new(AtomicUsize::new(0));
        let failed_spool_in = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let num_tasks = (std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4)
            / 2)
        .max(1);
        tracing::info!("Using concurrency {num_tasks} for spooling in");

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..num_tasks {
            set.spawn(Self::spool_in_task(
                rx.clone(),
                spooled_in.clone(),
                failed_spool_in.clone(),
            ));
        }
        drop(rx);

        while let Some(result) = set.join_next().await {
            if let Ok(Err(err)) = result {
                tracing::debug!("spool enumeration task stopped: {err:#}");
            }
        }

        let label = if activity.is_shutting_down() {
            "aborted"
        } else {
            "done"
        };
        drop(activity);

        let elapsed = start.elapsed();
        let total = spooled_in.load(Ordering::SeqCst);
        let failed = failed_spool_in.load(Ordering::SeqCst);
        tracing::info!(
            "start_spool: enumeration {label}, spooled in {total} msgs over {elapsed:?}"
        );
        if failed > 0 {
            tracing::error!(
                "start_spool: {failed}/{total} messages failed to spool in. \
                 These messages are NOT being processed and will remain in the \
                 spool until the cause of the failure is addressed."
            );
        }

        // Periodic maintenance for the stores
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(10 * 60)).await;
                if let Err(err) = get_data_spool().cleanup().await {
                    tracing::error!("error doing data spool cleanup: {err:#}");
                }
                if let Err(err) = get_meta_spool().cleanup().await {
                    tracing::error!("error doing meta spool cleanup: {err:#}");
                }
            }
        });

        Ok(())
    }

    /// Flush and close the stores; the last step of shutdown
    pub async fn shutdown() -> anyhow::Result<()> {
        tracing::info!("Shutting down spool");
        get_data_spool().shutdown().await?;
        get_meta_spool().shutdown().await?;
        Ok(())
    }
}
