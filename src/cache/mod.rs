// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The `IngestCache` collaborator interface: a disk-backed spool
//! that the [`crate::mux::cache_controller`] activates whenever zero
//! connections are hot. [`file::FileCache`] and [`null::NullCache`] are the
//! two concrete implementations.

pub mod file;
pub mod null;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

use crate::entry::{Batch, Entry};

/// One unit of work popped from the spool for redelivery once a connection
/// comes back hot. Mirrors the `{single_entry?, batch?}` shape of an
/// [`crate::emergency::Item`], since both are "replay this later" units.
#[derive(Debug, Clone)]
pub struct Block {
    pub entry: Option<Entry>,
    pub batch: Option<Batch>,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache is not running")]
    NotRunning,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("(de)serialization error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A disk-backed (or no-op) spool for entries the muxer cannot currently
/// deliver.
#[async_trait]
pub trait IngestCache: std::fmt::Debug + Send + Sync {
    /// Begins consuming from the given producer channels, writing everything
    /// received to the spool until [`IngestCache::stop`] is called.
    ///
    /// The channels are shared (mutex-guarded) rather than owned: a
    /// `WriterTask` competes for the same `recv` as the cache's consumer
    /// loop, mirroring the reference-type channels of the original design.
    /// In practice the cache is only activated while every writer task is
    /// blocked awaiting a fresh connection, so there is no real contention.
    async fn start(
        &self,
        entry_rx: Arc<Mutex<mpsc::Receiver<Entry>>>,
        batch_rx: Arc<Mutex<mpsc::Receiver<Batch>>>,
    ) -> Result<(), CacheError>;

    /// Stops consuming from the channels handed to `start`, without closing
    /// the underlying storage.
    async fn stop(&self) -> Result<(), CacheError>;

    /// Pops the oldest spooled block, if any.
    async fn pop_block(&self) -> Result<Option<Block>, CacheError>;

    async fn add_entry(&self, entry: Entry) -> Result<(), CacheError>;

    async fn add_block(&self, block: Block) -> Result<(), CacheError>;

    /// Number of spooled items.
    async fn count(&self) -> Result<u64, CacheError>;

    /// The tag names last persisted via [`IngestCache::update_stored_tag_list`].
    async fn get_tag_list(&self) -> Result<Vec<String>, CacheError>;

    async fn update_stored_tag_list(&self, tags: &[String]) -> Result<(), CacheError>;

    /// Flushes any buffered writes to durable storage.
    async fn sync(&self) -> Result<(), CacheError>;

    /// Tears the cache down. Idempotent.
    async fn close(&self) -> Result<(), CacheError>;
}

/// Receives the next item from a mutex-shared channel, competing with
/// whatever writer task is also racing to lock and receive from it.
pub(crate) async fn recv_shared<T>(rx: &Arc<Mutex<mpsc::Receiver<T>>>) -> Option<T> {
    rx.lock().await.recv().await
}
