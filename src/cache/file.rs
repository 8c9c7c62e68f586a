// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Append-only on-disk spool. Entries and batches are appended as
//! newline-delimited JSON to `<dir>/spool.jsonl`; a sidecar
//! `<dir>/tags.json` holds the tag-name list as of the last
//! [`IngestCache::update_stored_tag_list`] call, so a restarted process can
//! still translate spooled entries once it reconnects.
//!
//! The journal is compacted (rewritten with only the still-unconsumed
//! blocks) on [`IngestCache::close`] and whenever the in-memory queue drains
//! to empty, rather than on every `pop_block` — keeping the hot path to a
//! single append.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, Weak},
};

use anyhow::Context;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::{
    fs,
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::{Mutex as AsyncMutex, mpsc},
};
use tracing::{debug, warn};

use crate::{
    cache::{Block, CacheError, IngestCache, recv_shared},
    entry::{Batch, Entry},
};

#[derive(Debug, Serialize, Deserialize)]
struct StoredBlock {
    entry: Option<Entry>,
    batch: Option<Batch>,
}

impl From<Block> for StoredBlock {
    fn from(b: Block) -> Self {
        Self {
            entry: b.entry,
            batch: b.batch,
        }
    }
}

impl From<StoredBlock> for Block {
    fn from(b: StoredBlock) -> Self {
        Self {
            entry: b.entry,
            batch: b.batch,
        }
    }
}

#[derive(Debug)]
pub struct FileCache {
    data_path: PathBuf,
    tag_path: PathBuf,
    blocks: Mutex<std::collections::VecDeque<Block>>,
    consumer: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    writer: AsyncMutex<fs::File>,
    self_weak: OnceCell<Weak<FileCache>>,
}

impl FileCache {
    /// Opens (creating if absent) the spool under `dir`, replaying any
    /// blocks left over from a prior process into memory.
    pub async fn open(dir: &std::path::Path) -> anyhow::Result<Arc<Self>> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating cache directory {}", dir.display()))?;

        let data_path = dir.join("spool.jsonl");
        let tag_path = dir.join("tags.json");

        let mut blocks = std::collections::VecDeque::new();
        if let Ok(file) = fs::File::open(&data_path).await {
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .context("reading existing spool journal")?
            {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<StoredBlock>(&line) {
                    Ok(sb) => blocks.push_back(sb.into()),
                    Err(e) => warn!(error = %e, "skipping corrupt spool journal line"),
                }
            }
        }

        let writer = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)
            .await
            .with_context(|| format!("opening spool journal {}", data_path.display()))?;

        let cache = Arc::new(Self {
            data_path,
            tag_path,
            blocks: Mutex::new(blocks),
            consumer: AsyncMutex::new(None),
            writer: AsyncMutex::new(writer),
            self_weak: OnceCell::new(),
        });
        let _ = cache.self_weak.set(Arc::downgrade(&cache));
        Ok(cache)
    }

    async fn append(&self, block: &Block) -> Result<(), CacheError> {
        let line = serde_json::to_string(&StoredBlock {
            entry: block.entry.clone(),
            batch: block.batch.clone(),
        })?;
        let mut w = self.writer.lock().await;
        w.write_all(line.as_bytes()).await?;
        w.write_all(b"\n").await?;
        w.flush().await?;
        Ok(())
    }

    fn push_mem(&self, block: Block) {
        self.blocks.lock().expect("file cache mutex poisoned").push_back(block);
    }

    /// Rewrites the journal to contain only what's still queued, dropping
    /// everything already popped. Best-effort: a failure here just means the
    /// journal stays larger than necessary until the next compaction.
    async fn compact(&self) {
        let snapshot: Vec<Block> = {
            let q = self.blocks.lock().expect("file cache mutex poisoned");
            q.iter().cloned().collect()
        };
        let tmp_path = self.data_path.with_extension("jsonl.tmp");
        let result: anyhow::Result<()> = async {
            let mut tmp = fs::File::create(&tmp_path).await?;
            for block in &snapshot {
                let line = serde_json::to_string(&StoredBlock {
                    entry: block.entry.clone(),
                    batch: block.batch.clone(),
                })?;
                tmp.write_all(line.as_bytes()).await?;
                tmp.write_all(b"\n").await?;
            }
            tmp.flush().await?;
            fs::rename(&tmp_path, &self.data_path).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                if let Ok(file) = fs::OpenOptions::new()
                    .append(true)
                    .open(&self.data_path)
                    .await
                {
                    *self.writer.lock().await = file;
                }
            },
            Err(e) => warn!(error = %e, "spool journal compaction failed"),
        }
    }
}

#[async_trait]
impl IngestCache for FileCache {
    async fn start(
        &self,
        entry_rx: Arc<AsyncMutex<mpsc::Receiver<Entry>>>,
        batch_rx: Arc<AsyncMutex<mpsc::Receiver<Batch>>>,
    ) -> Result<(), CacheError> {
        debug!(path = %self.data_path.display(), "file cache: starting spool");
        let Some(this) = self.self_weak.get().and_then(Weak::upgrade) else {
            return Err(CacheError::NotRunning);
        };
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(e) = recv_shared(&entry_rx) => {
                        let block = Block { entry: Some(e), batch: None };
                        if let Err(err) = this.append(&block).await {
                            warn!(error = %err, "file cache: append failed, entry kept in memory only");
                        }
                        this.push_mem(block);
                    }
                    Some(b) = recv_shared(&batch_rx) => {
                        let block = Block { entry: None, batch: Some(b) };
                        if let Err(err) = this.append(&block).await {
                            warn!(error = %err, "file cache: append failed, batch kept in memory only");
                        }
                        this.push_mem(block);
                    }
                    else => break,
                }
            }
        });
        *self.consumer.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<(), CacheError> {
        if let Some(handle) = self.consumer.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    async fn pop_block(&self) -> Result<Option<Block>, CacheError> {
        let popped = self.blocks.lock().expect("file cache mutex poisoned").pop_front();
        if popped.is_some() && self.blocks.lock().expect("file cache mutex poisoned").is_empty() {
            self.compact().await;
        }
        Ok(popped)
    }

    async fn add_entry(&self, entry: Entry) -> Result<(), CacheError> {
        let block = Block {
            entry: Some(entry),
            batch: None,
        };
        self.append(&block).await?;
        self.push_mem(block);
        Ok(())
    }

    async fn add_block(&self, block: Block) -> Result<(), CacheError> {
        self.append(&block).await?;
        self.push_mem(block);
        Ok(())
    }

    async fn count(&self) -> Result<u64, CacheError> {
        Ok(self.blocks.lock().expect("file cache mutex poisoned").len() as u64)
    }

    async fn get_tag_list(&self) -> Result<Vec<String>, CacheError> {
        match fs::read(&self.tag_path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_stored_tag_list(&self, tags: &[String]) -> Result<(), CacheError> {
        let data = serde_json::to_vec(tags)?;
        fs::write(&self.tag_path, data).await?;
        Ok(())
    }

    async fn sync(&self) -> Result<(), CacheError> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.stop().await?;
        self.compact().await;
        self.sync().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{entry::Timestamp, tag::LocalTagId};

    #[tokio::test]
    async fn persists_and_replays_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).await.unwrap();
        cache
            .add_entry(Entry::new(Timestamp { sec: 1, nsec: 0 }, LocalTagId(0), Vec::new()))
            .await
            .unwrap();
        cache.sync().await.unwrap();
        assert_eq!(cache.count().await.unwrap(), 1);

        let cache2 = FileCache::open(dir.path()).await.unwrap();
        assert_eq!(cache2.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tag_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).await.unwrap();
        assert!(cache.get_tag_list().await.unwrap().is_empty());
        cache
            .update_stored_tag_list(&["default".to_string(), "gravwell".to_string()])
            .await
            .unwrap();
        assert_eq!(cache.get_tag_list().await.unwrap(), vec!["default", "gravwell"]);
    }
}
