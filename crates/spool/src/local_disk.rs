use crate::{Spool, SpoolEntry, SpoolId};
use anyhow::Context;
use async_trait::async_trait;
use flume::Sender;
use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// A simple directory-of-files backend.
/// Message payloads live under `data/`, keyed by their SpoolId path.
/// Writes stage through `new/` and rename into place so that a crash
/// cannot leave a partially written payload at its final path.
pub struct LocalDiskSpool {
    path: PathBuf,
    flush: bool,
    _pid_file: File,
}

impl LocalDiskSpool {
    pub fn new(path: &Path, flush: bool) -> anyhow::Result<Self> {
        let pid_file_path = path.join("lock");
        let _pid_file = lock_pid_file(pid_file_path)?;

        std::fs::create_dir_all(path.join("new"))
            .with_context(|| format!("creating {}/new", path.display()))?;
        std::fs::create_dir_all(path.join("data"))
            .with_context(|| format!("creating {}/data", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            flush,
            _pid_file,
        })
    }

    fn compute_path(&self, id: SpoolId) -> PathBuf {
        id.compute_path(&self.path.join("data"))
    }

    fn cleanup_dirs(path: &Path) {
        // Anything left in new/ is from an interrupted store
        for entry in walkdir::WalkDir::new(path.join("new"))
            .into_iter()
            .flatten()
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if let Err(err) = std::fs::remove_file(path) {
                tracing::error!("Failed to remove {}: {err:#}", path.display());
            }
        }

        Self::cleanup_data(&path.join("data"));
    }

    fn cleanup_data(data_dir: &Path) {
        for entry in walkdir::WalkDir::new(data_dir)
            .contents_first(true)
            .into_iter()
            .flatten()
        {
            if !entry.file_type().is_dir() || entry.path() == data_dir {
                continue;
            }
            // Speculatively try removing the directory; it will
            // only succeed if it is empty, which is all we want
            std::fs::remove_dir(entry.path()).ok();
        }
    }
}

#[async_trait]
impl Spool for LocalDiskSpool {
    async fn load(&self, id: SpoolId) -> anyhow::Result<Vec<u8>> {
        let path = self.compute_path(id);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to load {id} from {path:?}"))
    }

    async fn remove(&self, id: SpoolId) -> anyhow::Result<()> {
        let path = self.compute_path(id);
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("failed to remove {id} from {path:?}"))
    }

    async fn store(
        &self,
        id: SpoolId,
        data: Arc<Box<[u8]>>,
        force_sync: bool,
    ) -> anyhow::Result<()> {
        let path = self.compute_path(id);
        let new_dir = self.path.join("new");
        let flush = force_sync || self.flush;
        tokio::task::spawn_blocking(move || {
            let mut temp = NamedTempFile::new_in(new_dir)
                .with_context(|| format!("failed to create a temporary file to store {id}"))?;

            temp.write_all(&data)
                .with_context(|| format!("failed to write data for {id}"))?;

            if flush {
                temp.as_file_mut()
                    .sync_data()
                    .with_context(|| format!("failed to sync data for {id}"))?;
            }

            let parent = path.parent().expect("compute_path always has a parent");
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create dir structure for {id} {path:?}"))?;

            temp.persist(&path)
                .with_context(|| format!("failed to move temp file for {id} to {path:?}"))?;
            Ok(())
        })
        .await?
    }

    fn enumerate(&self, sender: Sender<SpoolEntry>) -> anyhow::Result<()> {
        let path = self.path.clone();
        let _scanner = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            Self::cleanup_dirs(&path);

            for entry in walkdir::WalkDir::new(path.join("data"))
                .into_iter()
                .flatten()
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                let Some(id) = SpoolId::from_path(path) else {
                    tracing::error!("{} is not a spool id", path.display());
                    continue;
                };
                let entry = match std::fs::read(path) {
                    Ok(data) => SpoolEntry::Item { id, data },
                    Err(err) => SpoolEntry::Corrupt {
                        id,
                        error: format!("{err:#}"),
                    },
                };
                sender
                    .send(entry)
                    .map_err(|err| anyhow::anyhow!("failed to send SpoolEntry for {id}: {err:#}"))?;
            }
            Ok(())
        });
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        let data_dir = self.path.join("data");
        tokio::task::spawn_blocking(move || {
            Self::cleanup_data(&data_dir);
        })
        .await?;
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Set the sticky bit on path.
/// This prevents tmpwatch from removing the lock file.
fn set_sticky_bit(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = path.metadata() {
            let mut perms = metadata.permissions();
            let mode = perms.mode();
            perms.set_mode(mode | libc::S_ISVTX as u32);
            std::fs::set_permissions(path, perms).ok();
        }
    }
}

fn lock_pid_file(pid_file: PathBuf) -> anyhow::Result<File> {
    let pid_file_dir = pid_file
        .parent()
        .ok_or_else(|| anyhow::anyhow!("{} has no parent?", pid_file.display()))?;
    std::fs::create_dir_all(pid_file_dir).with_context(|| {
        format!(
            "while creating directory structure: {}",
            pid_file_dir.display()
        )
    })?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&pid_file)
        .with_context(|| format!("opening pid file {}", pid_file.display()))?;
    set_sticky_bit(&pid_file);
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res != 0 {
        let err = std::io::Error::last_os_error();

        let owner = match std::fs::read_to_string(&pid_file) {
            Ok(pid) => format!(". Owned by pid {}.", pid.trim()),
            Err(_) => String::new(),
        };

        anyhow::bail!(
            "unable to lock pid file {}: {}{owner}",
            pid_file.display(),
            err
        );
    }

    unsafe { libc::ftruncate(file.as_raw_fd(), 0) };
    writeln!(file, "{}", unsafe { libc::getpid() }).ok();

    Ok(file)
}

#[cfg(test)]
mod test {
    use super::*;

    fn data(s: &str) -> Arc<Box<[u8]>> {
        Arc::new(s.as_bytes().to_vec().into_boxed_slice())
    }

    #[tokio::test]
    async fn store_load_remove_enumerate() -> anyhow::Result<()> {
        let location = tempfile::tempdir()?;
        let spool = LocalDiskSpool::new(location.path(), false)?;

        // Can't load an entry that doesn't exist
        assert!(spool.load(SpoolId::new()).await.is_err());

        let mut ids = vec![];
        for i in 0..20 {
            let id = SpoolId::new();
            spool.store(id, data(&format!("I am {i}")), false).await?;
            ids.push(id);
        }

        for (i, &id) in ids.iter().enumerate() {
            let loaded = spool.load(id).await?;
            assert_eq!(String::from_utf8(loaded)?, format!("I am {i}"));
        }

        // Enumerate them all, and remove as we go
        let (tx, rx) = flume::bounded(32);
        spool.enumerate(tx)?;
        let mut count = 0;

        while let Ok(item) = rx.recv_async().await {
            match item {
                SpoolEntry::Item { id, data } => {
                    let i = ids
                        .iter()
                        .position(|&have| have == id)
                        .expect("enumerated id was stored");
                    assert_eq!(String::from_utf8(data)?, format!("I am {i}"));

                    spool.remove(id).await?;
                    assert!(spool.load(id).await.is_err());
                    count += 1;
                }
                SpoolEntry::Corrupt { id, error } => {
                    anyhow::bail!("Corrupt: {id}: {error}");
                }
            }
        }
        assert_eq!(count, 20);

        // A second enumeration of the now-empty spool yields nothing,
        // and the cleanup that happens within doesn't break the layout
        for _ in 0..2 {
            let (tx, rx) = flume::bounded(32);
            spool.enumerate(tx)?;
            assert!(rx.recv_async().await.is_err(), "spool is empty");
        }

        Ok(())
    }

    #[tokio::test]
    async fn lock_excludes_second_owner() -> anyhow::Result<()> {
        let location = tempfile::tempdir()?;
        let _spool = LocalDiskSpool::new(location.path(), false)?;
        // Note: flock is per-open-file-description, and both handles live
        // in this process, so we can only verify that the lock file exists
        assert!(location.path().join("lock").exists());
        Ok(())
    }
}
