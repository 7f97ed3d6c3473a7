//! Holds the process-wide shaping snapshot: the user-authored shaping
//! documents plus the TSA-generated overlay, merged in order.
//! Readers obtain a consistent snapshot via an atomic pointer load;
//! reload failures leave the previous snapshot in effect.
use arc_swap::ArcSwap;
use kumo_api_types::shaping::{Shaping, ShapingMergeOptions};
use kumo_server_lifecycle::ShutdownSubscription;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

static SHAPING: LazyLock<ArcSwap<Shaping>> =
    LazyLock::new(|| ArcSwap::from_pointee(Shaping::default()));
static SOURCES: Mutex<Vec<String>> = Mutex::new(Vec::new());

pub fn get_shaping() -> Arc<Shaping> {
    SHAPING.load_full()
}

/// Configure the list of shaping documents. When tsa urls are
/// configured, the generated overlay is appended after the
/// user-provided documents so that automation wins.
pub fn set_shaping_sources(files: Vec<String>, tsa_urls: &[String]) {
    let mut sources = files;
    for url in tsa_urls {
        let url = url.trim_end_matches('/');
        sources.push(format!("{url}/get_config_v1/shaping.toml"));
    }
    *SOURCES.lock().unwrap() = sources;
}

pub async fn load_shaping(options: &ShapingMergeOptions) -> anyhow::Result<Arc<Shaping>> {
    let sources = SOURCES.lock().unwrap().clone();
    let shaping = Shaping::merge_files(&sources, options).await?;
    for warning in shaping.get_warnings() {
        tracing::warn!("shaping: {warning}");
    }
    for error in shaping.get_errors() {
        tracing::error!("shaping: {error}");
    }
    let shaping = Arc::new(shaping);
    SHAPING.store(shaping.clone());
    Ok(shaping)
}

/// Periodically refresh the shaping snapshot, and also refresh when
/// the config epoch changes. A failed refresh keeps the previous
/// snapshot in place.
pub async fn shaping_updater_task(interval: Duration) {
    let mut shutdown = ShutdownSubscription::get();
    let mut epoch = kumo_server_common::epoch::subscribe();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = epoch.changed() => {}
            _ = shutdown.shutting_down() => {
                tracing::debug!("shaping_updater_task stopping");
                return;
            }
        }
        if let Err(err) = load_shaping(&ShapingMergeOptions::default()).await {
            tracing::error!(
                "failed to refresh shaping; keeping previous snapshot: {err:#}"
            );
        }
    }
}
