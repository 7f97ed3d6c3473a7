use crate::{Spool, SpoolEntry, SpoolId};
use anyhow::Context;
use async_trait::async_trait;
use flume::Sender;
use rocksdb::{DBCompressionType, FlushOptions, IteratorMode, Options, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Tuning knobs for the embedded key/value backend.
/// All of these have reasonable defaults; they are surfaced so that
/// operators with unusual storage can adjust compaction behavior.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RocksSpoolParams {
    #[serde(default)]
    pub increase_parallelism: Option<i32>,

    #[serde(default)]
    pub optimize_level_style_compaction: Option<usize>,

    #[serde(default)]
    pub paranoid_checks: bool,

    #[serde(default)]
    pub compression_type: DBCompressionTypeDef,

    /// If non-zero, we perform bigger reads when doing compaction,
    /// turning random reads into sequential ones. Worth setting to
    /// at least 2MB on spinning disks.
    #[serde(default)]
    pub compaction_readahead_size: Option<usize>,

    #[serde(default)]
    pub max_open_files: Option<usize>,

    #[serde(
        with = "duration_serde",
        default = "RocksSpoolParams::default_obsolete_files_period"
    )]
    pub obsolete_files_period: Duration,
}

impl Default for RocksSpoolParams {
    fn default() -> Self {
        Self {
            increase_parallelism: None,
            optimize_level_style_compaction: None,
            paranoid_checks: false,
            compression_type: DBCompressionTypeDef::default(),
            compaction_readahead_size: None,
            max_open_files: None,
            obsolete_files_period: Self::default_obsolete_files_period(),
        }
    }
}

impl RocksSpoolParams {
    fn default_obsolete_files_period() -> Duration {
        Duration::from_secs(6 * 60 * 60)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
pub enum DBCompressionTypeDef {
    None,
    #[default]
    Snappy,
    Zlib,
    Lz4,
    Zstd,
}

impl From<DBCompressionTypeDef> for DBCompressionType {
    fn from(val: DBCompressionTypeDef) -> Self {
        match val {
            DBCompressionTypeDef::None => DBCompressionType::None,
            DBCompressionTypeDef::Snappy => DBCompressionType::Snappy,
            DBCompressionTypeDef::Zlib => DBCompressionType::Zlib,
            DBCompressionTypeDef::Lz4 => DBCompressionType::Lz4,
            DBCompressionTypeDef::Zstd => DBCompressionType::Zstd,
        }
    }
}

/// An embedded ordered key/value backend with a write-ahead log.
/// Writes land in the WAL and memtable and are flushed in the
/// background; a `force_sync` store additionally syncs the WAL before
/// completion so the payload is durable when the call returns.
pub struct RocksSpool {
    db: Arc<DB>,
}

impl RocksSpool {
    pub fn new(path: &Path, flush: bool, params: Option<RocksSpoolParams>) -> anyhow::Result<Self> {
        let mut opts = Options::default();
        opts.set_use_fsync(flush);
        opts.create_if_missing(true);
        // The default is 1000, which is a bit high
        opts.set_keep_log_file_num(10);

        let p = params.unwrap_or_default();
        if let Some(i) = p.increase_parallelism {
            opts.increase_parallelism(i);
        }
        if let Some(i) = p.optimize_level_style_compaction {
            opts.optimize_level_style_compaction(i);
        }
        if let Some(i) = p.compaction_readahead_size {
            opts.set_compaction_readahead_size(i);
        }
        if let Some(i) = p.max_open_files {
            opts.set_max_open_files(i as _);
        }
        opts.set_paranoid_checks(p.paranoid_checks);
        opts.set_compression_type(p.compression_type.into());
        opts.set_delete_obsolete_files_period_micros(p.obsolete_files_period.as_micros() as u64);

        let db = Arc::new(
            DB::open(&opts, path).with_context(|| format!("opening rocksdb at {path:?}"))?,
        );

        Ok(Self { db })
    }
}

#[async_trait]
impl Spool for RocksSpool {
    async fn load(&self, id: SpoolId) -> anyhow::Result<Vec<u8>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            db.get(id.as_bytes())?
                .ok_or_else(|| anyhow::anyhow!("no such key {id}"))
        })
        .await?
    }

    async fn remove(&self, id: SpoolId) -> anyhow::Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            db.delete(id.as_bytes())?;
            Ok(())
        })
        .await?
    }

    async fn store(
        &self,
        id: SpoolId,
        data: Arc<Box<[u8]>>,
        force_sync: bool,
    ) -> anyhow::Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut opts = WriteOptions::default();
            opts.set_sync(force_sync);
            db.put_opt(id.as_bytes(), &**data, &opts)?;
            Ok(())
        })
        .await?
    }

    fn enumerate(&self, sender: Sender<SpoolEntry>) -> anyhow::Result<()> {
        let db = self.db.clone();
        let _scanner = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            for entry in db.iterator(IteratorMode::Start) {
                let (key, value) = entry?;
                let Some(id) = SpoolId::from_slice(&key) else {
                    tracing::error!("invalid spool id in rocks spool: {key:?}");
                    continue;
                };
                sender
                    .send(SpoolEntry::Item {
                        id,
                        data: value.to_vec(),
                    })
                    .map_err(|err| anyhow::anyhow!("failed to send SpoolEntry for {id}: {err:#}"))?;
            }
            Ok(())
        });
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut opts = FlushOptions::default();
            opts.set_wait(true);
            db.flush_opt(&opts)?;
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn rocks_round_trip() -> anyhow::Result<()> {
        let location = tempfile::tempdir()?;
        let spool = RocksSpool::new(location.path(), false, None)?;

        let id = SpoolId::new();
        let payload = Arc::new(b"hello there".to_vec().into_boxed_slice());
        spool.store(id, payload, true).await?;
        assert_eq!(spool.load(id).await?, b"hello there".to_vec());

        let (tx, rx) = flume::bounded(4);
        spool.enumerate(tx)?;
        match rx.recv_async().await? {
            SpoolEntry::Item { id: got, data } => {
                assert_eq!(got, id);
                assert_eq!(data, b"hello there".to_vec());
            }
            SpoolEntry::Corrupt { id, error } => {
                anyhow::bail!("corrupt {id}: {error}");
            }
        }

        spool.remove(id).await?;
        assert!(spool.load(id).await.is_err());
        Ok(())
    }
}
