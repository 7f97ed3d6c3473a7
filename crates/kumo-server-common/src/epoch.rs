//! The config epoch is a counter that increments on every successful
//! configuration reload. Long-lived caches subscribe to it in order
//! to invalidate themselves when the config changes.
use std::sync::LazyLock;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ConfigEpoch(pub usize);

static EPOCH: LazyLock<(watch::Sender<ConfigEpoch>, watch::Receiver<ConfigEpoch>)> =
    LazyLock::new(|| watch::channel(ConfigEpoch::default()));

pub fn get_current_epoch() -> ConfigEpoch {
    *EPOCH.1.borrow()
}

/// Announce a new config epoch. Purges the epoch-subscribed caches
/// and wakes any subscribers.
pub fn bump_current_epoch() -> ConfigEpoch {
    let mut value = ConfigEpoch::default();
    EPOCH.0.send_modify(|epoch| {
        epoch.0 += 1;
        value = *epoch;
    });
    let purged = lruttl::purge_epoch_caches();
    tracing::debug!("config epoch is now {value:?}; purged {purged} cache entries");
    value
}

pub fn subscribe() -> watch::Receiver<ConfigEpoch> {
    EPOCH.1.clone()
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn epoch_bumps_and_notifies() {
        let mut rx = subscribe();
        let before = get_current_epoch();
        let after = bump_current_epoch();
        assert_eq!(after.0, before.0 + 1);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), after);
    }
}
