//! Ready queues: per (egress source, site_name) queues of messages
//! actively being dispatched, together with the connection workers
//! that drain them under the shaping-resolved constraints.
use crate::delivery_metrics::DeliveryMetrics;
use crate::egress_source::EgressSource;
use crate::logging::{log_disposition, LogDisposition};
use crate::queue::{Queue, QueueConfig, QueueManager};
use crate::smtp_dispatcher::SmtpDispatcher;
use crate::spool::SpoolManager;
use anyhow::Context;
use async_trait::async_trait;
use dns_resolver::MailExchanger;
use kumo_api_types::egress_path::EgressPathConfig;
use kumo_log_types::{EnhancedStatusCode, RecordType, Response};
use kumo_server_common::config_handle::ConfigHandle;
use kumo_server_lifecycle::{Activity, ShutdownSubscription};
use message::{Message, QueueNameComponents};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use throttle::{LimitLease, LimitSpecWithDuration};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

static MANAGER: LazyLock<Mutex<ReadyQueueManager>> =
    LazyLock::new(|| Mutex::new(ReadyQueueManager::default()));

/// How long a connection lease is held before it must be extended;
/// bounds the damage of a worker that dies without releasing
const LEASE_DURATION: Duration = Duration::from_secs(300);

pub type ReadyQueueHandle = Arc<ReadyQueue>;

#[derive(Default)]
pub struct ReadyQueueManager {
    queues: HashMap<String, ReadyQueueHandle>,
}

pub struct ReadyQueueName {
    pub name: String,
    pub site_name: String,
    pub mx: Arc<MailExchanger>,
}

impl ReadyQueueManager {
    pub fn number_of_queues() -> usize {
        MANAGER.lock().queues.len()
    }

    pub fn all_queues() -> Vec<ReadyQueueHandle> {
        MANAGER.lock().queues.values().cloned().collect()
    }

    pub fn get_by_name(name: &str) -> Option<ReadyQueueHandle> {
        MANAGER.lock().queues.get(name).cloned()
    }

    /// Compute the ready queue name for a scheduled queue name and
    /// egress source: `source->site_name`, where the site name is
    /// derived from the MX records of the routing domain
    pub async fn compute_queue_name(
        queue_name: &str,
        egress_source: &str,
    ) -> anyhow::Result<ReadyQueueName> {
        let components = QueueNameComponents::parse(queue_name);
        let routing_domain = components.routing_domain.unwrap_or(components.domain);

        let mx = MailExchanger::resolve(routing_domain).await?;
        let site_name = mx.site_name.to_string();

        Ok(ReadyQueueName {
            name: format!("{egress_source}->{site_name}"),
            site_name,
            mx,
        })
    }

    /// Resolve (creating on demand) the ready queue for the
    /// (scheduled queue, egress source) pair
    pub async fn resolve_by_queue_name(
        queue_name: &str,
        queue_config: &QueueConfig,
        egress_source: &str,
        egress_pool: &str,
    ) -> anyhow::Result<ReadyQueueHandle> {
        let ready_name = Self::compute_queue_name(queue_name, egress_source).await?;

        let components = QueueNameComponents::parse(queue_name);
        let domain = components.routing_domain.unwrap_or(components.domain);

        let egress_source = crate::policy::get_egress_source(egress_source)?;

        let path_config = crate::shaping::get_shaping()
            .get_egress_path_config(domain, &egress_source.name, &ready_name.site_name)
            .await
            .finish()
            .with_context(|| format!("resolving egress path config for {}", ready_name.name))?;

        let provider_name = path_config
            .provider_name
            .clone()
            .or_else(|| queue_config.provider_name.clone());

        let mut manager = MANAGER.lock();
        let name = ready_name.name.clone();

        if let Some(handle) = manager.queues.get(&name) {
            // Refresh the path config so that shaping changes are
            // observed by the existing queue
            handle.path_config.update(path_config);
            return Ok(handle.clone());
        }

        let activity = Activity::get(format!("ReadyQueue {name}"))?;
        let metrics = DeliveryMetrics::new(&format!("smtp_client:{name}"));

        let handle = Arc::new(ReadyQueue {
            name: name.clone(),
            queue_name: queue_name.to_string(),
            site_name: ready_name.site_name.clone(),
            ready: Mutex::new(VecDeque::new()),
            mx: ready_name.mx,
            notify: Arc::new(Notify::new()),
            connections: Mutex::new(vec![]),
            last_change: Mutex::new(Instant::now()),
            path_config: ConfigHandle::new(path_config),
            egress_source,
            egress_pool: egress_pool.to_string(),
            provider_name,
            metrics,
            activity,
            consecutive_connection_failures: Arc::new(AtomicUsize::new(0)),
        });

        manager.queues.insert(name.clone(), handle.clone());

        tokio::spawn({
            let handle = handle.clone();
            async move { ReadyQueueManager::maintainer_task(handle).await }
        });

        Ok(handle)
    }

    async fn maintainer_task(queue: ReadyQueueHandle) {
        let mut shutdown = ShutdownSubscription::get();
        let mut interval = Duration::from_secs(60);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.shutting_down() => {
                    interval = Duration::from_secs(1);
                }
            };
            queue.maintain().await;
            if queue.reapable() {
                tracing::debug!("reaping ready queue {}", queue.name);
                MANAGER.lock().queues.remove(&queue.name);
                return;
            }
        }
    }
}

pub struct ReadyQueue {
    pub name: String,
    /// A representative scheduled queue name, used when re-resolving
    /// configuration for this path
    pub queue_name: String,
    pub site_name: String,
    ready: Mutex<VecDeque<Message>>,
    pub mx: Arc<MailExchanger>,
    notify: Arc<Notify>,
    connections: Mutex<Vec<JoinHandle<()>>>,
    last_change: Mutex<Instant>,
    pub path_config: ConfigHandle<EgressPathConfig>,
    pub egress_source: EgressSource,
    pub egress_pool: String,
    pub provider_name: Option<String>,
    metrics: DeliveryMetrics,
    activity: Activity,
    consecutive_connection_failures: Arc<AtomicUsize>,
}

impl ReadyQueue {
    /// Accept a message for dispatch.
    /// Returns Err(msg) when the queue is at capacity; the caller
    /// defers the message back to its scheduled queue.
    pub async fn insert(self: &Arc<Self>, msg: Message) -> Result<(), Message> {
        {
            let mut ready = self.ready.lock();
            if ready.len() >= self.path_config.borrow().max_ready {
                return Err(msg);
            }
            ready.push_back(msg);
        }
        self.metrics.ready_count.inc();
        *self.last_change.lock() = Instant::now();
        self.notify.notify_waiters();
        self.maintain().await;
        Ok(())
    }

    pub fn ready_count(&self) -> usize {
        self.ready.lock().len()
    }

    fn pop_message(&self) -> Option<Message> {
        let msg = self.ready.lock().pop_front();
        if msg.is_some() {
            self.metrics.ready_count.dec();
        }
        msg
    }

    fn drain_all(&self) -> Vec<Message> {
        let msgs: Vec<Message> = self.ready.lock().drain(..).collect();
        self.metrics.ready_count.set(0);
        msgs
    }

    fn ideal_connection_count(&self) -> usize {
        if self.activity.is_shutting_down() {
            0
        } else {
            ideal_connection_count(
                self.ready_count(),
                self.path_config.borrow().connection_limit.limit,
            )
        }
    }

    /// Evaluate the queue state and spawn connection workers as
    /// appropriate
    pub async fn maintain(self: &Arc<Self>) {
        // Prune completed connection tasks
        self.connections
            .lock()
            .retain(|handle| !handle.is_finished());

        if self.activity.is_shutting_down() {
            // We are shutting down; all queued messages need to be
            // saved to spool
            let msgs = self.drain_all();
            if !msgs.is_empty() {
                let activity = self.activity.clone();
                tokio::spawn(async move {
                    for msg in msgs {
                        Queue::save_if_needed_and_log(&msg).await;
                        drop(msg);
                    }
                    drop(activity);
                });
            }
            return;
        }

        // A suspension from traffic shaping automation pushes the
        // queued messages back to their scheduled queues until it
        // expires; in-flight deliveries conclude naturally
        if let Some((remaining, reason)) =
            crate::suspend::ready_q_suspension(&self.site_name, &self.egress_source.name)
        {
            let msgs = self.drain_all();
            if !msgs.is_empty() {
                tracing::debug!(
                    "{}: suspended for {remaining:?} ({reason}); \
                     delaying {} ready messages",
                    self.name,
                    msgs.len()
                );
                let delay = chrono::Duration::from_std(remaining)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
                let activity = self.activity.clone();
                tokio::spawn(async move {
                    for msg in msgs {
                        if let Err(err) =
                            Dispatcher::requeue_message(msg, false, Some(delay)).await
                        {
                            tracing::error!("error requeuing message: {err:#}");
                        }
                    }
                    drop(activity);
                });
            }
            return;
        }

        let ideal = self.ideal_connection_count();
        let mut connections = self.connections.lock();

        for _ in connections.len()..ideal {
            let queue = self.clone();
            tracing::trace!("spawning client for {}", self.name);
            connections.push(tokio::spawn(async move {
                if let Err(err) = Dispatcher::run(&queue).await {
                    tracing::debug!(
                        "Error in Dispatcher::run for {}: {err:#} \
                         (consecutive_connection_failures={})",
                        queue.name,
                        queue.consecutive_connection_failures.load(Ordering::SeqCst)
                    );
                }
            }));
        }
    }

    fn reapable(&self) -> bool {
        let idle = self.last_change.lock().elapsed() > Duration::from_secs(10 * 60);
        (self.ready_count() == 0 && self.connections.lock().is_empty() && idle)
            || self.activity.is_shutting_down()
    }
}

/// The trait through which the Dispatcher loop drives a concrete
/// delivery protocol
#[async_trait]
pub trait QueueDispatcher: Send {
    async fn attempt_connection(&mut self, dispatcher: &mut Dispatcher) -> anyhow::Result<()>;
    async fn have_more_connection_candidates(&mut self, dispatcher: &mut Dispatcher) -> bool;
    async fn close_connection(&mut self, dispatcher: &mut Dispatcher) -> anyhow::Result<bool>;

    async fn deliver_message(
        &mut self,
        message: Message,
        dispatcher: &mut Dispatcher,
    ) -> anyhow::Result<()>;
}

/// One connection worker for a ready queue
pub struct Dispatcher {
    pub name: String,
    pub queue_name: String,
    pub mx: Option<Arc<MailExchanger>>,
    pub path_config: ConfigHandle<EgressPathConfig>,
    pub metrics: DeliveryMetrics,
    pub egress_source: EgressSource,
    pub egress_pool: String,
    pub msg: Option<Message>,
    pub delivered_this_connection: usize,
    queue: ReadyQueueHandle,
    shutting_down: ShutdownSubscription,
    activity: Activity,
    leases: Vec<LimitLease>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Ensure that we re-queue any message that we had popped
        if let Some(msg) = self.msg.take() {
            let activity = self.activity.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if activity.is_shutting_down() {
                            Queue::save_if_needed_and_log(&msg).await;
                        } else if let Err(err) =
                            Dispatcher::requeue_message(msg, false, None).await
                        {
                            tracing::error!("error requeuing message: {err:#}");
                        }
                    });
                }
                Err(_) => {
                    tracing::error!(
                        "dispatcher for {} dropped outside the runtime;                          message {} will be recovered from spool on restart",
                        self.name,
                        msg.id()
                    );
                }
            }
        }
    }
}

impl Dispatcher {
    pub async fn run(queue: &ReadyQueueHandle) -> anyhow::Result<()> {
        let activity = Activity::get(format!("smtp client {}", queue.name))?;

        let mut dispatcher = Self {
            name: queue.name.clone(),
            queue_name: queue.queue_name.clone(),
            mx: Some(queue.mx.clone()),
            path_config: queue.path_config.clone(),
            metrics: queue.metrics.clone(),
            egress_source: queue.egress_source.clone(),
            egress_pool: queue.egress_pool.clone(),
            msg: None,
            delivered_this_connection: 0,
            queue: queue.clone(),
            shutting_down: ShutdownSubscription::get(),
            activity,
            leases: vec![],
        };

        let mut queue_dispatcher: Box<dyn QueueDispatcher> =
            match SmtpDispatcher::init(&mut dispatcher).await? {
                Some(disp) => Box::new(disp),
                None => return Ok(()),
            };

        if !dispatcher.obtain_message() {
            // We raced with another dispatcher and there is no
            // more work to be done; no need to open a new connection.
            return Ok(());
        }

        if !dispatcher.acquire_leases().await? {
            // Over the (possibly cluster-shared) connection limit;
            // our message went back to the ready queue and the
            // maintainer will try again shortly
            return Ok(());
        }

        let mut connection_failures = vec![];

        loop {
            if !dispatcher.wait_for_message(&mut *queue_dispatcher).await? {
                // No more messages within our idle time; close
                // the connection
                tracing::debug!("{} Idling out connection", dispatcher.name);
                queue_dispatcher.close_connection(&mut dispatcher).await?;
                return Ok(());
            }

            if let Err(delay) = dispatcher.check_connection_rate().await? {
                dispatcher.throttle_ready_queue_with_self(delay).await;
                return Ok(());
            }

            if let Err(err) = queue_dispatcher.attempt_connection(&mut dispatcher).await {
                connection_failures.push(format!("{err:#}"));
                if !queue_dispatcher
                    .have_more_connection_candidates(&mut dispatcher)
                    .await
                {
                    if let Some(msg) = dispatcher.msg.take() {
                        log_disposition(LogDisposition {
                            kind: RecordType::TransientFailure,
                            msg: msg.clone(),
                            site: &dispatcher.name,
                            peer_address: None,
                            response: Response {
                                code: 451,
                                enhanced_code: Some(EnhancedStatusCode {
                                    class: 4,
                                    subject: 4,
                                    detail: 1,
                                }),
                                content: format!(
                                    "Internal: failed to connect to any \
                                     candidate hosts: {}",
                                    connection_failures.join(", ")
                                ),
                                command: None,
                            },
                            egress_pool: Some(&dispatcher.egress_pool),
                            egress_source: Some(&dispatcher.egress_source.name),
                            delivery_protocol: None,
                            provider: None,
                            session_id: None,
                        })
                        .await;
                        if let Err(err) = Self::requeue_message(msg, true, None).await {
                            tracing::error!("error requeuing message: {err:#}");
                        }
                    }

                    if dispatcher
                        .queue
                        .consecutive_connection_failures
                        .fetch_add(1, Ordering::SeqCst)
                        + 1
                        >= dispatcher
                            .path_config
                            .borrow()
                            .consecutive_connection_failures_before_delay
                    {
                        dispatcher.delay_ready_queue().await;
                    }
                    return Err(err);
                }
                tracing::debug!("{err:#}");
                // Try the next candidate MX address
                continue;
            }

            dispatcher
                .queue
                .consecutive_connection_failures
                .store(0, Ordering::SeqCst);
            connection_failures.clear();

            dispatcher
                .deliver_message(&mut *queue_dispatcher)
                .await
                .context("deliver_message")?;
        }
    }

    /// Acquire the connection-count leases configured for this path.
    /// Returns false (after restoring the in-flight message) when a
    /// limit is contended past its deadline.
    async fn acquire_leases(&mut self) -> anyhow::Result<bool> {
        let limits = {
            let path_config = self.path_config.borrow();
            let mut limits = vec![(
                format!("{}-connection-limit", self.name),
                path_config.connection_limit,
            )];
            for (name, limit) in &path_config.additional_connection_limits {
                limits.push((name.to_string(), *limit));
            }
            limits
        };

        let deadline = Instant::now() + Duration::from_secs(1);
        for (key, spec) in limits {
            match (LimitSpecWithDuration {
                spec,
                duration: LEASE_DURATION,
            })
            .acquire_lease(&key, deadline)
            .await
            {
                Ok(lease) => self.leases.push(lease),
                Err(throttle::Error::TooManyLeases(_)) => {
                    if let Some(msg) = self.msg.take() {
                        self.queue.insert(msg).await.ok();
                    }
                    self.release_leases().await;
                    return Ok(false);
                }
                Err(err) => {
                    self.release_leases().await;
                    return Err(err.into());
                }
            }
        }
        Ok(true)
    }

    async fn release_leases(&mut self) {
        for mut lease in self.leases.drain(..) {
            lease.release().await;
        }
    }

    /// Apply max_connection_rate ahead of opening a connection.
    /// Ok(Err(delay)) means the rate is exhausted for `delay`.
    async fn check_connection_rate(&self) -> anyhow::Result<Result<(), Duration>> {
        let throttle = self.path_config.borrow().max_connection_rate;
        if let Some(throttle) = &throttle {
            let result = throttle
                .throttle(format!("{}-connection-rate", self.name))
                .await?;
            if let Some(delay) = result.retry_after {
                if delay >= self.path_config.borrow().client_timeouts.idle_timeout {
                    return Ok(Err(delay));
                }
                tracing::trace!("{} throttled connection rate, sleep for {delay:?}", self.name);
                tokio::time::sleep(delay).await;
            }
        }
        Ok(Ok(()))
    }

    fn obtain_message(&mut self) -> bool {
        if self.msg.is_some() {
            return true;
        }
        self.msg = self.queue.pop_message();
        self.msg.is_some()
    }

    async fn wait_for_message(
        &mut self,
        queue_dispatcher: &mut dyn QueueDispatcher,
    ) -> anyhow::Result<bool> {
        if self.activity.is_shutting_down() {
            if let Some(msg) = self.msg.take() {
                Queue::save_if_needed_and_log(&msg).await;
            }
            return Ok(false);
        }

        let limit = self.path_config.borrow().max_deliveries_per_connection;
        if self.delivered_this_connection >= limit {
            tracing::trace!(
                "Sent {} and limit is {limit}; close and let the maintainer \
                 open a fresh connection",
                self.delivered_this_connection,
            );
            if queue_dispatcher.close_connection(self).await? {
                return Ok(false);
            }
        }

        if self.obtain_message() {
            return Ok(true);
        }

        let idle_timeout = self.path_config.borrow().client_timeouts.idle_timeout;
        let notify = self.queue.notify.clone();
        tokio::select! {
            _ = tokio::time::sleep(idle_timeout) => {}
            _ = notify.notified() => {}
            _ = self.shutting_down.shutting_down() => {
                return Ok(false);
            }
        };
        Ok(self.obtain_message())
    }

    async fn deliver_message(
        &mut self,
        queue_dispatcher: &mut dyn QueueDispatcher,
    ) -> anyhow::Result<()> {
        let msg = self
            .msg
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("deliver_message with no msg"))?
            .clone();

        msg.load_meta_if_needed().await?;
        msg.load_data_if_needed().await?;

        // Apply the message rate throttles; a long delay means the
        // whole ready queue is paced down
        let throttles = {
            let path_config = self.path_config.borrow();
            let mut throttles = vec![];
            if let Some(rate) = &path_config.max_message_rate {
                throttles.push((format!("{}-message-rate", self.name), *rate));
            }
            for (name, rate) in &path_config.additional_message_rate_throttles {
                throttles.push((name.to_string(), *rate));
            }
            throttles
        };

        for (key, rate) in throttles {
            loop {
                let result = rate.throttle(&key).await?;
                match result.retry_after {
                    Some(delay) => {
                        if delay >= self.path_config.borrow().client_timeouts.idle_timeout {
                            self.throttle_ready_queue_with_self(delay).await;
                            return Ok(());
                        }
                        tracing::trace!(
                            "{} throttled message rate on {key}, sleep for {delay:?}",
                            self.name
                        );
                        let mut shutdown = ShutdownSubscription::get();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.shutting_down() => {
                                anyhow::bail!("shutting down");
                            }
                        };
                    }
                    None => break,
                }
            }
        }

        self.delivered_this_connection += 1;

        // Keep the connection-count leases alive while the session
        // remains productive
        for lease in &self.leases {
            lease.extend(LEASE_DURATION).await.ok();
        }

        queue_dispatcher.deliver_message(msg, self).await
    }

    /// Move a message back to its scheduled queue
    pub async fn requeue_message(
        msg: Message,
        increment_attempts: bool,
        delay: Option<chrono::Duration>,
    ) -> anyhow::Result<()> {
        msg.load_meta_if_needed().await?;
        QueueManager::requeue_message(msg, increment_attempts, delay).await
    }

    /// Push the in-flight message and the entire ready queue back to
    /// their scheduled queues with the given delay
    async fn throttle_ready_queue_with_self(&mut self, delay: Duration) {
        if let Some(msg) = self.msg.take() {
            let delay = chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            if let Err(err) = Self::requeue_message(msg, false, Some(delay)).await {
                tracing::error!("error requeuing message: {err:#}");
            }
        }
        self.queue.clone().throttle_ready_queue(delay).await;
    }

    /// Too many consecutive connection failures: treat the site as
    /// temporarily unreachable and bulk-reschedule everything
    async fn delay_ready_queue(&mut self) {
        tracing::debug!(
            "too many connection failures, delaying ready queue {}",
            self.name,
        );
        self.queue
            .consecutive_connection_failures
            .store(0, Ordering::SeqCst);
        self.bulk_ready_queue_operation(Response {
            code: 451,
            enhanced_code: Some(EnhancedStatusCode {
                class: 4,
                subject: 4,
                detail: 1,
            }),
            content: "No answer from any hosts listed in MX".to_string(),
            command: None,
        })
        .await;
    }

    /// Apply `response` to the in-flight message and everything in
    /// the ready queue: transient responses re-schedule, permanent
    /// responses retire
    pub async fn bulk_ready_queue_operation(&mut self, response: Response) {
        let mut msgs = self.queue.drain_all();
        if let Some(msg) = self.msg.take() {
            msgs.push(msg);
        }
        if msgs.is_empty() {
            return;
        }

        let activity = self.activity.clone();
        let name = self.name.clone();
        let egress_pool = self.egress_pool.clone();
        let egress_source = self.egress_source.name.clone();
        tokio::spawn(async move {
            for msg in msgs {
                log_disposition(LogDisposition {
                    kind: if response.is_transient() {
                        RecordType::TransientFailure
                    } else {
                        RecordType::Bounce
                    },
                    msg: msg.clone(),
                    site: &name,
                    peer_address: None,
                    response: response.clone(),
                    egress_pool: Some(&egress_pool),
                    egress_source: Some(&egress_source),
                    delivery_protocol: None,
                    provider: None,
                    session_id: None,
                })
                .await;

                if response.is_transient() {
                    if let Err(err) = Self::requeue_message(msg, true, None).await {
                        tracing::error!("error requeuing message: {err:#}");
                    }
                } else if response.is_permanent() {
                    SpoolManager::remove_from_spool(*msg.id()).await.ok();
                }
            }
            drop(activity);
        });
    }
}

impl ReadyQueue {
    /// Push every queued message back to its scheduled queue,
    /// delayed by `delay`
    pub async fn throttle_ready_queue(self: Arc<Self>, delay: Duration) {
        let msgs = self.drain_all();
        if !msgs.is_empty() {
            tracing::debug!(
                "throttled: delaying ready queue {} - {} messages",
                self.name,
                msgs.len()
            );
            let delay = chrono::Duration::from_std(delay).unwrap_or_else(|err| {
                tracing::error!(
                    "error creating duration from {delay:?}: {err:#}. Using 1 minute"
                );
                chrono::Duration::seconds(60)
            });
            let activity = self.activity.clone();
            tokio::spawn(async move {
                for msg in msgs {
                    if let Err(err) = Dispatcher::requeue_message(msg, false, Some(delay)).await {
                        tracing::error!("error requeuing message: {err:#}");
                    }
                }
                drop(activity);
            });
        }
    }
}

/// Use an exponential decay curve in the increasing form, asymptotic
/// up to connection_limit, passing through 0.0, increasing but
/// bounded to connection_limit.
///
/// Visualize on wolframalpha: "plot 32 * (1-exp(-x * 0.023)), x from 0 to 100, y from 0 to 32"
pub fn ideal_connection_count(queue_size: usize, connection_limit: usize) -> usize {
    let factor = 0.023;
    let goal = (connection_limit as f32) * (1. - (-1.0 * queue_size as f32 * factor).exp());
    goal.ceil() as usize
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connection_limit() {
        let sizes = [
            0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 20, 32, 64, 128, 256, 400, 512, 1024,
        ];
        let max_connections = 32;
        let targets: Vec<(usize, usize)> = sizes
            .iter()
            .map(|&queue_size| {
                (
                    queue_size,
                    ideal_connection_count(queue_size, max_connections),
                )
            })
            .collect();
        assert_eq!(
            vec![
                (0, 0),
                (1, 1),
                (2, 2),
                (3, 3),
                (4, 3),
                (5, 4),
                (6, 5),
                (7, 5),
                (8, 6),
                (9, 6),
                (10, 7),
                (20, 12),
                (32, 17),
                (64, 25),
                (128, 31),
                (256, 32),
                (400, 32),
                (512, 32),
                (1024, 32)
            ],
            targets
        );
    }
}
