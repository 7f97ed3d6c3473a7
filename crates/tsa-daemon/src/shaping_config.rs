//! Loads and refreshes the shaping documents that carry the
//! automation rules evaluated against published log records.
use arc_swap::ArcSwap;
use kumo_api_types::shaping::{Shaping, ShapingMergeOptions};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

static SHAPING: LazyLock<ArcSwap<Shaping>> =
    LazyLock::new(|| ArcSwap::from_pointee(Shaping::default()));
static SOURCES: Mutex<Vec<String>> = Mutex::new(Vec::new());

pub fn set_shaping_sources(files: Vec<String>) {
    *SOURCES.lock().unwrap() = files;
}

pub fn get_shaping() -> Arc<Shaping> {
    SHAPING.load_full()
}

pub async fn load_shaping() -> anyhow::Result<Arc<Shaping>> {
    let sources = SOURCES.lock().unwrap().clone();
    let options = ShapingMergeOptions::default();
    let shaping = Shaping::merge_files(&sources, &options).await?;
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

/// Refresh the shaping snapshot periodically so that edits to the
/// rule documents are picked up without a daemon restart
pub async fn shaping_updater_task(interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if let Err(err) = load_shaping().await {
            tracing::error!("failed to refresh shaping; keeping previous snapshot: {err:#}");
        }
    }
}
