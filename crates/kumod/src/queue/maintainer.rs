use crate::queue::manager::QueueManager;
use crate::queue::queue::{Queue, QueueHandle};
use chrono::Utc;
use kumo_server_lifecycle::{is_shutting_down, ShutdownSubscription};
use std::time::Duration;

/// How long the maintainer sleeps when it has no specific deadline
const IDLE_TICK: Duration = Duration::from_secs(60);

/// The per-queue maintainer: pops messages as they become due and
/// promotes them to the ready queue tier, performs config refresh,
/// and reaps the queue when it has been idle for its reap interval.
pub async fn maintain_named_queue(queue: &QueueHandle) -> anyhow::Result<()> {
    let mut shutdown = ShutdownSubscription::get();

    loop {
        let wait = match queue.next_due() {
            Some(due) => (due - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_millis(1))
                .min(IDLE_TICK),
            None => IDLE_TICK,
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = queue.notify_maintainer.notified() => {}
            _ = shutdown.shutting_down() => {
                let msgs = queue.drain_timeq();
                tracing::debug!(
                    "{}: saving {} scheduled messages for shutdown",
                    queue.name,
                    msgs.len()
                );
                for msg in msgs {
                    Queue::save_if_needed_and_log(&msg).await;
                    drop(msg);
                }
                return Ok(());
            }
        };

        if queue.activity.is_shutting_down() {
            continue;
        }

        let msgs = queue.pop_due();
        for msg in msgs {
            if let Err(err) = msg.load_meta_if_needed().await {
                tracing::error!("{}: failed to load metadata: {err:#}", queue.name);
                continue;
            }
            if let Err(err) = queue.insert_ready(msg).await {
                tracing::error!("{}: insert_ready: {err:#}", queue.name);
            }
        }

        queue.perform_config_refresh_if_due(false);

        // Reap idle queues so that the steady-state memory usage is
        // proportional to the live traffic rather than its history
        if queue.is_empty() {
            let reap_after = queue.queue_config.borrow().reap_interval;
            if queue.get_last_change().elapsed() >= reap_after
                && QueueManager::remove_if_empty(&queue.name)
            {
                tracing::debug!("idling out queue {}", queue.name);
                return Ok(());
            }
        }
    }
}

/// The global maintainer: propagates config epoch changes to every
/// scheduled queue and prunes expired suspensions
pub async fn queue_config_maintainer() {
    let mut shutdown = ShutdownSubscription::get();
    let mut epoch_subscriber = kumo_server_common::epoch::subscribe();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(10)) => {
                crate::suspend::prune();
            }
            _ = epoch_subscriber.changed() => {
                tracing::debug!("queue_config_maintainer: epoch changed");
                for name in QueueManager::all_queue_names() {
                    if is_shutting_down() {
                        return;
                    }
                    if let Some(queue) = QueueManager::get_opt(&name) {
                        queue.perform_config_refresh_if_due(true);
                    }
                }
            }
            _ = shutdown.shutting_down() => {
                tracing::info!("queue_config_maintainer stopping");
                return;
            }
        }
    }
}
