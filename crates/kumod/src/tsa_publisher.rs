//! Forwards disposition log records to the configured tsa-daemon
//! instances so that their automation rules can observe delivery
//! outcomes. Publication is best-effort: a daemon that is down simply
//! misses records until it returns; correctness of the active set is
//! restored by the subscription replay.
use kumo_log_types::{JsonLogRecord, RecordType};
use kumo_server_lifecycle::ShutdownSubscription;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

static SENDERS: OnceLock<Vec<flume::Sender<Arc<JsonLogRecord>>>> = OnceLock::new();

/// Bound on queued records per daemon; when a daemon is slow or down
/// we prefer shedding records over ballooning memory
const PUBLISH_BACKLOG: usize = 4096;

pub fn init(urls: &[String]) {
    if urls.is_empty() {
        return;
    }
    let mut senders = vec![];
    for url in urls {
        let url = format!("{}/publish_log_v1", url.trim_end_matches('/'));
        let (tx, rx) = flume::bounded(PUBLISH_BACKLOG);
        senders.push(tx);
        tokio::spawn(publisher_task(url, rx));
    }
    SENDERS.set(senders).ok();
}

fn wants_record(kind: RecordType) -> bool {
    matches!(
        kind,
        RecordType::Delivery
            | RecordType::TransientFailure
            | RecordType::Bounce
            | RecordType::Rejection
            | RecordType::Expiration
            | RecordType::OOB
            | RecordType::Feedback
    )
}

/// Enqueue the record towards every configured daemon
pub fn publish(record: &Arc<JsonLogRecord>) {
    let Some(senders) = SENDERS.get() else {
        return;
    };
    if !wants_record(record.kind) {
        return;
    }
    for sender in senders {
        if sender.try_send(record.clone()).is_err() {
            tracing::debug!("tsa publish backlog full; shedding record {}", record.id);
        }
    }
}

async fn publisher_task(url: String, rx: flume::Receiver<Arc<JsonLogRecord>>) {
    let mut shutdown = ShutdownSubscription::get();
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::error!("failed to build http client for {url}: {err:#}");
            return;
        }
    };

    loop {
        let record = tokio::select! {
            _ = shutdown.shutting_down() => {
                tracing::debug!("tsa publisher for {url} stopping");
                return;
            }
            record = rx.recv_async() => match record {
                Ok(record) => record,
                Err(_) => return,
            },
        };

        match client.post(&url).json(&*record).send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::debug!(
                    "tsa publisher: {url} responded {} for record {}",
                    response.status(),
                    record.id
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!("tsa publisher: {url}: {err:#}");
            }
        }
    }
}
