use crate::egress_source::EgressPoolRoundRobin;
use crate::logging::{log_disposition, LogDisposition};
use crate::queue::config::QueueConfig;
use crate::queue::maintainer::maintain_named_queue;
use crate::queue::{IncrementAttempts, InsertResult, ReadyQueueFull};
use crate::ready_queue::ReadyQueueManager;
use crate::spool::SpoolManager;
use anyhow::Context;
use arc_swap::ArcSwap;
use chrono::Utc;
use kumo_log_types::{EnhancedStatusCode, RecordType, Response};
use kumo_server_common::config_handle::ConfigHandle;
use kumo_server_lifecycle::Activity;
use message::{Message, QueueNameComponents};
use parking_lot::Mutex;
use prometheus::IntGaugeVec;
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use timeq::{TimeQ, TimerError};
use tokio::sync::Notify;

static SCHEDULED_COUNT: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    prometheus::register_int_gauge_vec!(
        "scheduled_count",
        "number of messages in the scheduled queue",
        &["queue"]
    )
    .unwrap()
});

pub type QueueHandle = Arc<Queue>;

/// A scheduled queue: messages awaiting their next delivery attempt,
/// ordered by due time
pub struct Queue {
    pub name: Arc<String>,
    queue: Mutex<TimeQ<Message>>,
    pub notify_maintainer: Arc<Notify>,
    last_change: Mutex<Instant>,
    pub queue_config: ConfigHandle<QueueConfig>,
    pub activity: Activity,
    rr: ArcSwap<EgressPoolRoundRobin>,
    next_config_refresh: Mutex<Instant>,
    metrics: prometheus::IntGauge,
}

impl Queue {
    pub async fn new(name: String) -> anyhow::Result<QueueHandle> {
        let queue_config = crate::policy::get_queue_config(&name);
        let pool = crate::policy::get_egress_pool(queue_config.egress_pool.as_deref())?;
        let rr = ArcSwap::from_pointee(EgressPoolRoundRobin::new(&pool));

        let activity = Activity::get(format!("Queue {name}"))?;
        let next_config_refresh = Mutex::new(Instant::now() + queue_config.refresh_interval);
        let metrics = SCHEDULED_COUNT.with_label_values(&[name.as_str()]);

        let name = Arc::new(name);

        let handle = Arc::new(Queue {
            name: name.clone(),
            queue: Mutex::new(TimeQ::new()),
            last_change: Mutex::new(Instant::now()),
            queue_config: ConfigHandle::new(queue_config),
            notify_maintainer: Arc::new(Notify::new()),
            activity,
            rr,
            next_config_refresh,
            metrics,
        });

        tokio::spawn({
            let queue = handle.clone();
            async move {
                if let Err(err) = maintain_named_queue(&queue).await {
                    tracing::error!("maintain_named_queue {}: {err:#}", queue.name);
                }
            }
        });

        Ok(handle)
    }

    /// Re-resolve configuration when its refresh interval has elapsed
    /// or the config epoch changed
    pub fn perform_config_refresh_if_due(&self, epoch_changed: bool) {
        use kumo_api_types::egress_path::ConfigRefreshStrategy;
        let now = Instant::now();
        let due = match self.queue_config.borrow().refresh_strategy {
            ConfigRefreshStrategy::Ttl => now >= *self.next_config_refresh.lock(),
            ConfigRefreshStrategy::Epoch => epoch_changed,
        };
        if !due {
            return;
        }

        let queue_config = crate::policy::get_queue_config(&self.name);
        match crate::policy::get_egress_pool(queue_config.egress_pool.as_deref()) {
            Ok(pool) => {
                if !self.rr.load().equivalent(&pool) {
                    self.rr.store(Arc::new(EgressPoolRoundRobin::new(&pool)));
                }
            }
            Err(err) => {
                tracing::error!(
                    "error while processing queue config update for {}: {err:#}",
                    self.name
                );
            }
        }
        *self.next_config_refresh.lock() =
            Instant::now() + queue_config.refresh_interval;
        self.queue_config.update(queue_config);
    }

    /// Insert into the timeq, updating the counters.
    /// Returns the message when it is already due.
    fn timeq_insert(&self, msg: Message) -> Result<(), Message> {
        tracing::trace!("timeq_insert {} due={:?}", self.name, msg.get_due());
        match self.queue.lock().insert(msg) {
            Ok(()) => {
                self.metrics.inc();
                self.notify_maintainer.notify_one();
                Ok(())
            }
            Err(TimerError::Expired(msg)) => Err(msg),
            Err(TimerError::NotFound) => unreachable!("insert does not return NotFound"),
        }
    }

    /// Pop the messages that are now due, updating the counters
    pub fn pop_due(&self) -> Vec<Message> {
        let mut queue = self.queue.lock();
        match queue.pop() {
            timeq::PopResult::Items(messages) => {
                self.metrics.sub(messages.len() as i64);
                messages
            }
            timeq::PopResult::Sleep(_) | timeq::PopResult::Empty => vec![],
        }
    }

    pub fn next_due(&self) -> Option<chrono::DateTime<Utc>> {
        self.queue.lock().peek_next_due()
    }

    /// Removes all messages from the timeq, updating the counters
    pub fn drain_timeq(&self) -> Vec<Message> {
        let msgs = self.queue.lock().drain();
        if !msgs.is_empty() {
            self.metrics.sub(msgs.len() as i64);
            // Wake the maintainer so that it can observe the queue
            // becoming empty
            self.notify_maintainer.notify_one();
        }
        msgs
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn get_last_change(&self) -> Instant {
        *self.last_change.lock()
    }

    /// Apply an automation bounce directive to the entire queue
    pub async fn bounce_all(&self, reason: &str) {
        let msgs = self.drain_timeq();
        if msgs.is_empty() {
            return;
        }
        let name = self.name.clone();
        let reason = reason.to_string();
        let count = msgs.len();
        tracing::info!("bouncing {count} messages from {name}: {reason}");
        tokio::spawn(async move {
            for msg in msgs {
                let id = *msg.id();
                log_disposition(LogDisposition {
                    kind: RecordType::AdminBounce,
                    msg,
                    site: "",
                    peer_address: None,
                    response: Response {
                        code: 551,
                        enhanced_code: Some(EnhancedStatusCode {
                            class: 5,
                            subject: 7,
                            detail: 1,
                        }),
                        content: format!("Bounced by traffic shaping automation: {reason}"),
                        command: None,
                    },
                    egress_pool: None,
                    egress_source: None,
                    delivery_protocol: None,
                    provider: None,
                    session_id: None,
                })
                .await;
                SpoolManager::remove_from_spool(id).await.ok();
            }
        });
    }

    /// Advance the message's due time according to the retry
    /// schedule, expiring it if the next attempt would land beyond
    /// its expiry.
    /// Returns None after an expiration, since the message has been
    /// retired.
    async fn increment_attempts_and_update_delay(
        &self,
        msg: Message,
    ) -> anyhow::Result<Option<Message>> {
        let id = *msg.id();
        // Compute the delay before incrementing the number of
        // attempts: backoff_for_attempt takes a zero-based attempt
        // number
        let num_attempts = msg.get_num_attempts();
        let delay = self.queue_config.borrow().backoff_for_attempt(num_attempts);
        msg.increment_num_attempts();

        // Compute some jitter. The default retry_interval is 20
        // minutes for which 1 minute of jitter is desired; to
        // accommodate different intervals we translate that to
        // allowing up to 1/20th of the retry_interval, capped to
        // 1 minute so that it doesn't diverge excessively for very
        // large intervals.
        let jitter_magnitude =
            (self.queue_config.borrow().retry_interval.as_secs_f32() / 20.0).min(60.0);
        let jitter = (rand::random::<f32>() * jitter_magnitude) - (jitter_magnitude / 2.0);
        let delay = chrono::Duration::seconds(delay.num_seconds() + jitter as i64);

        let expire_response = |content: String| Response {
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
                let next_due = msg.delay_by(delay).unwrap_or_else(Utc::now);
                if next_due >= expires {
                    tracing::debug!("expiring {id} {next_due} > scheduled expiry {expires}");
                    log_disposition(LogDisposition {
                        kind: RecordType::Expiration,
                        msg,
                        site: "",
                        peer_address: None,
                        response: expire_response(format!(
                            "Next delivery time would be at {next_due} \
                             which exceeds the expiry time {expires} \
                             configured via scheduling"
                        )),
                        egress_pool: self.queue_config.borrow().egress_pool.as_deref(),
                        egress_source: None,
                        delivery_protocol: None,
                        provider: self.queue_config.borrow().provider_name.as_deref(),
                        session_id: None,
                    })
                    .await;
                    SpoolManager::remove_from_spool(id).await?;
                    return Ok(None);
                }
            }
            None => {
                // Regular queue based expiry
                let now = Utc::now();
                let max_age = self.queue_config.borrow().get_max_age();
                let age = msg.age(now);
                let delayed_age = age + delay;
                if delayed_age > max_age {
                    tracing::debug!("expiring {id} {delayed_age} > {max_age}");
                    log_disposition(LogDisposition {
                        kind: RecordType::Expiration,
                        msg,
                        site: "",
                        peer_address: None,
                        response: expire_response(format!(
                            "Next delivery time would be {delayed_age} \
                             after creation, which exceeds max_age={max_age}"
                        )),
                        egress_pool: self.queue_config.borrow().egress_pool.as_deref(),
                        egress_source: None,
                        delivery_protocol: None,
                        provider: self.queue_config.borrow().provider_name.as_deref(),
                        session_id: None,
                    })
                    .await;
                    SpoolManager::remove_from_spool(id).await?;
                    return Ok(None);
                }
                let next_due = msg.delay_by(delay);
                tracing::trace!(
                    "increment_attempts_and_update_delay: delaying {id} \
                     by {delay} (num_attempts={}), next_due={next_due:?}",
                    num_attempts + 1
                );
            }
        }

        Ok(Some(msg))
    }

    /// The raw re-insertion of a message into this scheduled queue
    pub async fn requeue_message_internal(
        self: &Arc<Self>,
        msg: Message,
        increment_attempts: IncrementAttempts,
        delay: Option<chrono::Duration>,
    ) -> anyhow::Result<()> {
        if increment_attempts == IncrementAttempts::Yes {
            match self.increment_attempts_and_update_delay(msg).await? {
                Some(msg) => {
                    return Box::pin(self.insert(msg)).await;
                }
                None => {
                    // It was expired and removed from the spool
                    return Ok(());
                }
            };
        } else if let Some(delay) = delay {
            msg.delay_by(delay);
        } else {
            msg.delay_with_jitter(60);
        }

        if let Some(due) = msg.get_due() {
            let max_age = self.queue_config.borrow().get_max_age();
            // The age of the message at its next due time
            let due_age = msg.age(due);
            if due_age >= max_age {
                let id = *msg.id();
                tracing::debug!("expiring {id} {due_age} > {max_age}");
                log_disposition(LogDisposition {
                    kind: RecordType::Expiration,
                    msg,
                    site: "",
                    peer_address: None,
                    response: Response {
                        code: 551,
                        enhanced_code: Some(EnhancedStatusCode {
                            class: 5,
                            subject: 4,
                            detail: 7,
                        }),
                        content: format!("Next delivery time {due_age} > {max_age}"),
                        command: None,
                    },
                    egress_pool: self.queue_config.borrow().egress_pool.as_deref(),
                    egress_source: None,
                    delivery_protocol: None,
                    provider: self.queue_config.borrow().provider_name.as_deref(),
                    session_id: None,
                })
                .await;
                SpoolManager::remove_from_spool(id).await?;
                return Ok(());
            }
        }

        Box::pin(self.insert(msg)).await
    }

    async fn insert_delayed(self: &Arc<Self>, msg: Message) -> anyhow::Result<InsertResult> {
        tracing::trace!("insert_delayed {}", msg.id());

        match msg.get_due() {
            None => Ok(InsertResult::Ready(msg)),
            Some(due) => {
                let now = Utc::now();
                if due <= now {
                    Ok(InsertResult::Ready(msg))
                } else {
                    match self.timeq_insert(msg.clone()) {
                        Ok(_) => {
                            Self::save_if_needed_and_log(&msg).await;
                            Ok(InsertResult::Delayed)
                        }
                        Err(msg) => Ok(InsertResult::Ready(msg)),
                    }
                }
            }
        }
    }

    async fn force_into_delayed(self: &Arc<Self>, msg: Message) -> anyhow::Result<()> {
        tracing::trace!("force_into_delayed {}", msg.id());
        loop {
            match self.insert_delayed(msg.clone()).await? {
                InsertResult::Delayed => return Ok(()),
                // Maybe delay_with_jitter computed an immediate
                // time? Try again
                InsertResult::Ready(_) => {
                    msg.delay_with_jitter(60);
                    continue;
                }
            }
        }
    }

    /// Save the message to spool if dirty, then release its memory;
    /// it can be re-loaded on demand when it becomes due
    pub async fn save_if_needed(msg: &Message) -> anyhow::Result<()> {
        tracing::trace!("save_if_needed {}", msg.id());
        if msg.needs_save() {
            msg.save().await?;
        }
        msg.shrink()?;
        Ok(())
    }

    pub async fn save_if_needed_and_log(msg: &Message) {
        if let Err(err) = Self::save_if_needed(msg).await {
            let id = msg.id();
            tracing::error!("error saving {id}: {err:#}");
        }
    }

    /// The per-queue and scope-wide rate limits that gate promotion
    /// out of this scheduled queue.
    /// Resolution of the Open Question about campaign rate limiting:
    /// the scope key for a queue with a campaign is that campaign,
    /// so a campaign limit constrains the campaign rather than
    /// falling back to the tenant.
    fn message_rate_throttles(&self) -> Vec<(String, throttle::ThrottleSpec)> {
        let config = self.queue_config.borrow();
        let mut result = vec![];
        if let Some(rate) = &config.max_message_rate {
            result.push((format!("schedq-{}-message-rate", self.name), *rate));
        }
        if let Some(rate) = &config.overall_max_message_rate {
            let components = QueueNameComponents::parse(&self.name);
            let scope = match (components.campaign, components.tenant) {
                (Some(campaign), Some(tenant)) => {
                    format!("campaign-{tenant}:{campaign}")
                }
                (None, Some(tenant)) => format!("tenant-{tenant}"),
                _ => format!("domain-{}", components.domain),
            };
            result.push((format!("schedq-{scope}-overall-message-rate"), *rate));
        }
        result
    }

    /// Promote a due message into the ready queue for its resolved
    /// egress path
    pub async fn insert_ready(self: &Arc<Self>, msg: Message) -> anyhow::Result<()> {
        // Don't promote while the queue is suspended by automation
        if let Some((remaining, reason)) = crate::suspend::sched_q_suspension(&self.name) {
            tracing::trace!("{} is suspended, delay={remaining:?}", self.name);

            let response = Response {
                code: 451,
                enhanced_code: Some(EnhancedStatusCode {
                    class: 4,
                    subject: 4,
                    detail: 4,
                }),
                content: format!("Internal: scheduled queue is suspended: {reason}"),
                command: None,
            };

            log_disposition(LogDisposition {
                kind: RecordType::TransientFailure,
                msg: msg.clone(),
                site: &self.name,
                peer_address: None,
                response,
                egress_pool: None,
                egress_source: None,
                delivery_protocol: None,
                provider: None,
                session_id: None,
            })
            .await;

            return self
                .requeue_message_internal(msg, IncrementAttempts::Yes, None)
                .await;
        }

        // Apply promotion rate limits; a throttled message simply
        // becomes due at the throttle's suggested time
        for (key, rate) in self.message_rate_throttles() {
            let result = rate.throttle(&key).await?;
            if let Some(delay) = result.retry_after {
                tracing::trace!("{} throttled message rate, delay={delay:?}", self.name);
                // No jitter here: the throttle should ideally produce
                // a smooth message flow and jitter would
                // (intentionally) perturb that
                let delay =
                    chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                return self
                    .requeue_message_internal(msg, IncrementAttempts::No, Some(delay))
                    .await;
            }
        }

        match self.insert_ready_impl(msg.clone()).await {
            Ok(()) => Ok(()),
            Err(err) if err.downcast_ref::<ReadyQueueFull>().is_some() => {
                // Queue is full; try again shortly
                self.force_into_delayed(msg).await.context("force_into_delayed")
            }
            Err(err) => {
                tracing::debug!("insert_ready: {err:#}");
                log_disposition(LogDisposition {
                    kind: RecordType::TransientFailure,
                    msg: msg.clone(),
                    site: "",
                    peer_address: None,
                    response: Response {
                        code: 451,
                        enhanced_code: Some(EnhancedStatusCode {
                            class: 4,
                            subject: 4,
                            detail: 4,
                        }),
                        content: format!(
                            "Internal: {} error while inserting into ready queue: {err:#}",
                            self.name
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
                self.requeue_message_internal(msg, IncrementAttempts::Yes, None)
                    .await
            }
        }
    }

    async fn insert_ready_impl(self: &Arc<Self>, msg: Message) -> anyhow::Result<()> {
        tracing::trace!("insert_ready {}", msg.id());

        let rr = self.rr.load();
        let source = rr.next(&[]).ok_or_else(|| {
            anyhow::anyhow!(
                "no sources available for {} pool=`{}`",
                self.name,
                rr.name
            )
        })?;

        let site = ReadyQueueManager::resolve_by_queue_name(
            &self.name,
            &self.queue_config.borrow(),
            &source,
            &rr.name,
        )
        .await
        .with_context(|| format!("resolving ready queue for {}", self.name))?;

        site.insert(msg).await.map_err(|_| ReadyQueueFull.into())
    }

    /// Insert a newly received, or freshly loaded from spool,
    /// message into this queue
    pub async fn insert(self: &Arc<Self>, msg: Message) -> anyhow::Result<()> {
        *self.last_change.lock() = Instant::now();

        tracing::trace!("insert msg {}", msg.id());

        if let Some(reason) = crate::suspend::sched_q_bounce(&self.name) {
            let id = *msg.id();
            log_disposition(LogDisposition {
                kind: RecordType::AdminBounce,
                msg,
                site: "",
                peer_address: None,
                response: Response {
                    code: 551,
                    enhanced_code: Some(EnhancedStatusCode {
                        class: 5,
                        subject: 7,
                        detail: 1,
                    }),
                    content: format!("Bounced by traffic shaping automation: {reason}"),
                    command: None,
                },
                egress_pool: None,
                egress_source: None,
                delivery_protocol: None,
                provider: None,
                session_id: None,
            })
            .await;
            SpoolManager::remove_from_spool(id).await?;
            return Ok(());
        }

        if self.activity.is_shutting_down() {
            Self::save_if_needed_and_log(&msg).await;
            drop(msg);
            return Ok(());
        }

        match self.insert_delayed(msg.clone()).await? {
            InsertResult::Delayed => Ok(()),
            InsertResult::Ready(msg) => self.insert_ready(msg).await,
        }
    }
}
