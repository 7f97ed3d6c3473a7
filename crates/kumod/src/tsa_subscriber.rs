//! Maintains the subscription to one or more tsa-daemon instances:
//! a WebSocket event stream of suspensions and bounce directives.
//! The daemon replays the full active set on connect, so a restart
//! of either side converges back to the correct state; incremental
//! events follow.
use crate::suspend;
use futures_util::StreamExt;
use kumo_api_types::tsa::TsaEvent;
use kumo_server_lifecycle::{Activity, ShutdownSubscription};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Spawn a subscriber task per configured tsa-daemon url
pub fn start_subscribers(urls: &[String]) {
    for url in urls {
        let url = url.trim_end_matches('/').to_string();
        tokio::spawn(async move {
            if let Err(err) = subscriber_task(url.clone()).await {
                tracing::error!("tsa subscriber for {url} stopped: {err:#}");
            }
        });
    }
}

fn ws_url(base: &str) -> String {
    let base = base
        .replacen("http://", "ws://", 1)
        .replacen("https://", "wss://", 1);
    format!("{base}/subscribe_event_v1")
}

async fn subscriber_task(base_url: String) -> anyhow::Result<()> {
    let _activity = Activity::get(format!("tsa subscriber {base_url}"))?;
    let mut shutdown = ShutdownSubscription::get();
    let url = ws_url(&base_url);
    let mut backoff = Duration::from_secs(1);

    loop {
        tokio::select! {
            _ = shutdown.shutting_down() => {
                tracing::debug!("tsa subscriber for {base_url} stopping");
                return Ok(());
            }
            result = connect_async(url.as_str()) => {
                match result {
                    Ok((stream, _response)) => {
                        tracing::info!("connected to tsa event stream at {url}");
                        backoff = Duration::from_secs(1);
                        if let Err(err) = process_stream(stream, &mut shutdown).await {
                            tracing::error!("tsa event stream {url}: {err:#}");
                        }
                    }
                    Err(err) => {
                        tracing::debug!("failed to connect to {url}: {err:#}");
                    }
                }
            }
        }

        // Reconnect with capped exponential backoff
        tokio::select! {
            _ = shutdown.shutting_down() => return Ok(()),
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(Duration::from_secs(60));
    }
}

async fn process_stream<S>(
    mut stream: S,
    shutdown: &mut ShutdownSubscription,
) -> anyhow::Result<()>
where
    S: StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = shutdown.shutting_down() => return Ok(()),
            msg = stream.next() => msg,
        };
        match msg {
            None => return Ok(()),
            Some(Err(err)) => return Err(err.into()),
            Some(Ok(WsMessage::Text(json))) => {
                match serde_json::from_str::<TsaEvent>(&json) {
                    Ok(event) => apply_event(event).await,
                    Err(err) => {
                        tracing::error!("invalid tsa event {json}: {err:#}");
                    }
                }
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
            Some(Ok(WsMessage::Close(_))) => return Ok(()),
            Some(Ok(other)) => {
                tracing::debug!("ignoring unexpected tsa ws message {other:?}");
            }
        }
    }
}

async fn apply_event(event: TsaEvent) {
    match event {
        TsaEvent::ReadyQSuspension(entry) => {
            suspend::suspend_ready_q(entry);
            // Poke the affected ready queues so that the suspension
            // takes effect without waiting for their next tick
            for queue in crate::ready_queue::ReadyQueueManager::all_queues() {
                queue.maintain().await;
            }
        }
        TsaEvent::SchedQSuspension(entry) => {
            suspend::suspend_sched_q(entry);
        }
        TsaEvent::SchedQBounce(entry) => {
            suspend::bounce_sched_q(entry.clone());
            // Apply to the matching scheduled queues that already
            // exist; future insertions consult the registry
            for name in crate::queue::QueueManager::all_queue_names() {
                if crate::suspend::sched_q_bounce(&name).is_some() {
                    if let Some(queue) = crate::queue::QueueManager::get_opt(&name) {
                        queue.bounce_all(&entry.reason).await;
                    }
                }
            }
        }
    }
}
