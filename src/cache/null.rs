// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-memory-only cache used when `enable_cache` is set but no
//! `file_backing_location` is configured. Configuration treats an empty
//! `cache_config.file_backing_location` as the signal
//! for persistence); resolved in DESIGN.md as: still spool, just not to disk,
//! so `enable_cache` alone already protects writers from an all-down outage.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, Weak},
};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, trace};

use crate::{
    cache::{Block, CacheError, IngestCache, recv_shared},
    entry::{Batch, Entry},
};

#[derive(Debug, Default)]
pub struct NullCache {
    blocks: Mutex<VecDeque<Block>>,
    tags: Mutex<Vec<String>>,
    consumer: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    self_weak: OnceCell<Weak<NullCache>>,
}

impl NullCache {
    pub fn new() -> Arc<Self> {
        let cache = Arc::new(Self::default());
        let _ = cache.self_weak.set(Arc::downgrade(&cache));
        cache
    }

    fn push(&self, block: Block) {
        self.blocks.lock().expect("null cache mutex poisoned").push_back(block);
    }
}

#[async_trait]
impl IngestCache for NullCache {
    async fn start(
        &self,
        entry_rx: Arc<AsyncMutex<mpsc::Receiver<Entry>>>,
        batch_rx: Arc<AsyncMutex<mpsc::Receiver<Batch>>>,
    ) -> Result<(), CacheError> {
        debug!("null cache: spooling in memory only");
        let Some(this) = self.self_weak.get().and_then(Weak::upgrade) else {
            return Err(CacheError::NotRunning);
        };
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(e) = recv_shared(&entry_rx) => {
                        trace!(tag = e.tag.0, "null cache: parked entry");
                        this.push(Block { entry: Some(e), batch: None });
                    }
                    Some(b) = recv_shared(&batch_rx) => {
                        trace!(len = b.len(), "null cache: parked batch");
                        this.push(Block { entry: None, batch: Some(b) });
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
        Ok(self.blocks.lock().expect("null cache mutex poisoned").pop_front())
    }

    async fn add_entry(&self, entry: Entry) -> Result<(), CacheError> {
        self.push(Block {
            entry: Some(entry),
            batch: None,
        });
        Ok(())
    }

    async fn add_block(&self, block: Block) -> Result<(), CacheError> {
        self.push(block);
        Ok(())
    }

    async fn count(&self) -> Result<u64, CacheError> {
        Ok(self.blocks.lock().expect("null cache mutex poisoned").len() as u64)
    }

    async fn get_tag_list(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.tags.lock().expect("null cache mutex poisoned").clone())
    }

    async fn update_stored_tag_list(&self, tags: &[String]) -> Result<(), CacheError> {
        *self.tags.lock().expect("null cache mutex poisoned") = tags.to_vec();
        Ok(())
    }

    async fn sync(&self) -> Result<(), CacheError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{entry::Timestamp, tag::LocalTagId};

    #[tokio::test]
    async fn round_trips_an_entry() {
        let cache = NullCache::new();
        let (etx, erx) = mpsc::channel(4);
        let (_btx, brx) = mpsc::channel(4);
        cache
            .start(Arc::new(AsyncMutex::new(erx)), Arc::new(AsyncMutex::new(brx)))
            .await
            .unwrap();

        etx.send(Entry::new(Timestamp { sec: 1, nsec: 0 }, LocalTagId(0), Vec::new()))
            .await
            .unwrap();
        drop(etx);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(cache.count().await.unwrap(), 1);
        let block = cache.pop_block().await.unwrap().unwrap();
        assert!(block.entry.is_some());
    }
}
