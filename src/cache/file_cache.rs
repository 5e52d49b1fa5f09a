use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use super::{CacheSink, CachedEntry, ContentCache, Lease, LeaseTable};

/// [`ContentCache`] stored as one file per key under a directory.
#[derive(Debug)]
pub struct FileCache {
    root: PathBuf,
    tmp: PathBuf,
    readers: LeaseTable,
    writers: LeaseTable,
}

impl FileCache {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let tmp = root.join("tmp");
        fs::create_dir_all(&tmp)
            .await
            .with_context(|| format!("no se pudo crear {}", tmp.display()))?;

        info!("📁 Caché de audio en: {}", root.display());

        Ok(Self {
            root,
            tmp,
            readers: LeaseTable::new(),
            writers: LeaseTable::new(),
        })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.tmp.join(key)
    }

    async fn remove_unused(&self, dir: &Path, in_use: &LeaseTable, only_empty: bool) -> Result<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() || (only_empty && metadata.len() > 0) {
                continue;
            }

            let Some(key) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if in_use.is_leased(&key) {
                continue;
            }

            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("No se pudo eliminar {}: {}", entry.path().display(), e),
            }
        }

        Ok(removed)
    }
}

#[async_trait]
impl ContentCache for FileCache {
    async fn try_get_path(&self, key: &str) -> Option<CachedEntry> {
        let lease = self.readers.acquire(key);
        let path = self.entry_path(key);

        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() && metadata.len() > 0 => {
                debug!("✅ Cache hit: {}", key);
                Some(CachedEntry::new(path, lease))
            }
            _ => {
                debug!("❌ Cache miss: {}", key);
                None
            }
        }
    }

    async fn open_write_sink(&self, key: &str) -> Result<Box<dyn CacheSink>> {
        let Some(lease) = self.writers.try_acquire(key) else {
            anyhow::bail!("ya hay una escritura en curso para {}", key);
        };

        let tmp_path = self.tmp_path(key);
        let file = File::create(&tmp_path)
            .await
            .with_context(|| format!("no se pudo crear {}", tmp_path.display()))?;

        Ok(Box::new(FileCacheSink {
            file: BufWriter::new(file),
            tmp_path,
            final_path: self.entry_path(key),
            finished: false,
            _lease: lease,
        }))
    }

    async fn cleanup(&self) -> Result<()> {
        fs::create_dir_all(&self.tmp).await?;

        let stale_tmp = self.remove_unused(&self.tmp, &self.writers, false).await?;
        let empty = self.remove_unused(&self.root, &self.readers, true).await?;

        info!(
            "🧹 Limpieza de caché: {} temporales y {} entradas vacías eliminadas",
            stale_tmp, empty
        );
        Ok(())
    }
}

struct FileCacheSink {
    file: BufWriter<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    finished: bool,
    _lease: Lease,
}

#[async_trait]
impl CacheSink for FileCacheSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        self.file.flush().await?;
        self.file.get_mut().sync_all().await?;
        fs::rename(&self.tmp_path, &self.final_path).await?;
        self.finished = true;
        debug!("💾 Entrada guardada en caché: {}", self.final_path.display());
        Ok(())
    }
}

impl Drop for FileCacheSink {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
