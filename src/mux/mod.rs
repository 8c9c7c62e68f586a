// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The ingest multiplexer core: fan-out delivery of [`Entry`]/[`Batch`]
//! values to one or more [`IndexerConnection`]s, with automatic
//! reconnection, per-connection tag translation, in-flight entry recycling,
//! and an optional disk-backed spool.
//!
//! [`Muxer`] is the public entry point; [`connection_task`],
//! [`writer_task`], and [`cache_controller`] are the three task kinds that
//! make it run, built around a long-lived connection owner and the tasks
//! that drive it.

pub mod cache_controller;
pub mod connection_task;
pub mod writer_task;

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Mutex as AsyncMutex, RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cache::IngestCache,
    cfg::config::MuxerConfig,
    entry::{Batch, Entry, Timestamp},
    error::{MuxerError, Result},
    indexer::IndexerConnection,
    tag::{LocalTagId, TagTable, TagTranslator},
    utils::jittered_duration,
};

/// One configured destination; fixed for the muxer's lifetime.
#[derive(Debug, Clone)]
pub struct Target {
    pub address: String,
    pub secret: String,
}

/// Recorded when a destination enters a terminal (fatal) failure state.
#[derive(Debug, Clone)]
pub struct TargetError {
    pub address: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxerState {
    Empty,
    Running,
    Closed,
}

/// A live connection plus the translator built for it, handed from a
/// [`connection_task`] to its paired [`writer_task`] over a single-capacity
/// watch channel.
#[derive(Clone)]
pub(crate) struct ConnSet {
    pub connection: Arc<dyn IndexerConnection>,
    pub translator: TagTranslator,
    pub index: usize,
}

#[derive(Default)]
struct Slot {
    connection: Option<Arc<dyn IndexerConnection>>,
    translator: TagTranslator,
}

struct Inner {
    tags: TagTable,
    slots: Vec<Slot>,
    target_errors: Vec<TargetError>,
    state: MuxerState,
}

/// Per-destination plumbing owned by the muxer but driven by its
/// [`connection_task`]/[`writer_task`] pair.
pub(crate) struct Wiring {
    pub handoff_tx: watch::Sender<Option<ConnSet>>,
    pub handoff_rx: watch::Receiver<Option<ConnSet>>,
    /// Best-effort, capacity-1: a writer task requests reconnection, or the
    /// connection's own failure detector forwards into the same channel.
    pub notify_tx: mpsc::Sender<()>,
    pub notify_rx: AsyncMutex<mpsc::Receiver<()>>,
}

pub struct Muxer {
    cfg: MuxerConfig,
    targets: Vec<Target>,
    inner: RwLock<Inner>,
    conn_hot: AtomicI64,
    conn_dead: AtomicI64,
    entry_tx: mpsc::Sender<Entry>,
    entry_rx: Arc<AsyncMutex<mpsc::Receiver<Entry>>>,
    batch_tx: mpsc::Sender<Batch>,
    batch_rx: Arc<AsyncMutex<mpsc::Receiver<Batch>>>,
    emergency: Arc<crate::emergency::EmergencyQueue>,
    cache: Option<Arc<dyn IngestCache>>,
    cache_signal_tx: mpsc::Sender<bool>,
    cache_signal_rx: AsyncMutex<Option<mpsc::Receiver<bool>>>,
    up_tx: watch::Sender<bool>,
    up_rx: watch::Receiver<bool>,
    die: CancellationToken,
    wiring: Vec<Wiring>,
    tasks: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Muxer {
    /// Builds a muxer from a validated [`MuxerConfig`] and the cache
    /// implementation to use when `enable_cache` is set. Pass
    /// [`crate::cache::null::NullCache`] when no file backing is configured.
    pub fn new(cfg: MuxerConfig, cache: Option<Arc<dyn IngestCache>>) -> Arc<Self> {
        let channel_size = cfg.channel_size();
        let (entry_tx, entry_rx) = mpsc::channel(channel_size);
        let (batch_tx, batch_rx) = mpsc::channel(channel_size);
        let (cache_signal_tx, cache_signal_rx) = mpsc::channel(1);
        let (up_tx, up_rx) = watch::channel(false);

        let targets: Vec<Target> = cfg
            .destinations
            .targets
            .iter()
            .map(|d| Target {
                address: d.address.clone(),
                secret: d.secret.clone(),
            })
            .collect();

        let tags = TagTable::new(cfg.tags.iter().cloned()).unwrap_or_default();
        let n = targets.len();

        let wiring = (0..n)
            .map(|_| {
                let (handoff_tx, handoff_rx) = watch::channel(None);
                let (notify_tx, notify_rx) = mpsc::channel(1);
                Wiring {
                    handoff_tx,
                    handoff_rx,
                    notify_tx,
                    notify_rx: AsyncMutex::new(notify_rx),
                }
            })
            .collect();

        Arc::new(Self {
            cfg,
            targets,
            inner: RwLock::new(Inner {
                tags,
                slots: (0..n).map(|_| Slot::default()).collect(),
                target_errors: Vec::new(),
                state: MuxerState::Empty,
            }),
            conn_hot: AtomicI64::new(0),
            conn_dead: AtomicI64::new(0),
            entry_tx,
            entry_rx: Arc::new(AsyncMutex::new(entry_rx)),
            batch_tx,
            batch_rx: Arc::new(AsyncMutex::new(batch_rx)),
            emergency: Arc::new(crate::emergency::EmergencyQueue::new()),
            cache,
            cache_signal_tx,
            cache_signal_rx: AsyncMutex::new(Some(cache_signal_rx)),
            up_tx,
            up_rx,
            die: CancellationToken::new(),
            wiring,
            tasks: AsyncMutex::new(Vec::new()),
        })
    }

    pub(crate) fn config(&self) -> &MuxerConfig {
        &self.cfg
    }

    pub(crate) fn emergency(&self) -> &crate::emergency::EmergencyQueue {
        &self.emergency
    }

    pub(crate) fn entry_receiver(&self) -> Arc<AsyncMutex<mpsc::Receiver<Entry>>> {
        self.entry_rx.clone()
    }

    pub(crate) fn batch_receiver(&self) -> Arc<AsyncMutex<mpsc::Receiver<Batch>>> {
        self.batch_rx.clone()
    }

    pub(crate) fn entry_sender(&self) -> mpsc::Sender<Entry> {
        self.entry_tx.clone()
    }

    pub(crate) fn batch_sender(&self) -> mpsc::Sender<Batch> {
        self.batch_tx.clone()
    }

    pub(crate) fn die_token(&self) -> CancellationToken {
        self.die.clone()
    }

    pub(crate) async fn tags_snapshot(&self) -> Vec<String> {
        self.inner.read().await.tags.names().to_vec()
    }

    pub(crate) async fn tag_count(&self) -> usize {
        self.inner.read().await.tags.len()
    }

    /// Best-effort, non-exclusive emptiness check used only by the writer
    /// task's opportunistic-yield heuristic; a lock contested by another
    /// writer task is conservatively treated as non-empty.
    pub(crate) async fn channels_empty(&self) -> bool {
        let entry_empty = match self.entry_rx.try_lock() {
            Ok(g) => g.is_empty(),
            Err(_) => return false,
        };
        let batch_empty = match self.batch_rx.try_lock() {
            Ok(g) => g.is_empty(),
            Err(_) => return false,
        };
        entry_empty && batch_empty
    }

    /// Marks destination `index` hot: decrements `conn_dead`, increments
    /// `conn_hot`; on the transition to the first hot connection, wakes
    /// `WaitForHot` and tells the cache controller a connection came up.
    pub(crate) fn go_hot(&self, index: usize) {
        self.conn_dead.fetch_sub(1, Ordering::AcqRel);
        let now_hot = self.conn_hot.fetch_add(1, Ordering::AcqRel) + 1;
        info!(dest = %self.targets[index].address, "connection hot");
        if now_hot == 1 {
            let _ = self.cache_signal_tx.try_send(false);
        }
        let _ = self.up_tx.send(true);
    }

    /// Marks destination `index` dead.
    pub(crate) fn go_dead(&self, index: usize) {
        let now_hot = self.conn_hot.fetch_sub(1, Ordering::AcqRel) - 1;
        self.conn_dead.fetch_add(1, Ordering::AcqRel);
        warn!(dest = %self.targets[index].address, "connection dead");
        if now_hot == 0 {
            let _ = self.cache_signal_tx.try_send(true);
        }
    }

    pub(crate) async fn record_target_error(&self, index: usize, error: String) {
        let mut inner = self.inner.write().await;
        inner.target_errors.push(TargetError {
            address: self.targets[index].address.clone(),
            error,
        });
    }

    pub(crate) async fn target_error_count(&self) -> usize {
        self.inner.read().await.target_errors.len()
    }

    /// Installs a freshly built connection + translator for `index`
    /// and publishes the new [`ConnSet`] to the paired
    /// writer task.
    pub(crate) async fn install_connection(
        &self,
        index: usize,
        connection: Arc<dyn IndexerConnection>,
        translator: TagTranslator,
    ) {
        {
            let mut inner = self.inner.write().await;
            inner.slots[index].connection = Some(connection.clone());
            inner.slots[index].translator = translator.clone();
        }
        let _ = self.wiring[index].handoff_tx.send(Some(ConnSet {
            connection,
            translator,
            index,
        }));
    }

    /// Clears the slot for `index` after its connection has died, returning
    /// whatever was installed (if anything) so the caller can drain its
    /// outstanding entries.
    pub(crate) async fn clear_connection(&self, index: usize) -> Option<Arc<dyn IndexerConnection>> {
        let mut inner = self.inner.write().await;
        inner.slots[index].translator = TagTranslator::new();
        inner.slots[index].connection.take()
    }

    pub(crate) fn wiring(&self, index: usize) -> &Wiring {
        &self.wiring[index]
    }

    pub(crate) fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Authoritative hot-connection count, read outside the muxer lock. Used
    /// by the cache controller to re-check state on every `cache_signal`
    /// wakeup rather than trust the (best-effort, coalescible) edge alone.
    pub(crate) fn conn_hot_count(&self) -> i64 {
        self.conn_hot.load(Ordering::Acquire)
    }

    async fn require_running(&self) -> Result<()> {
        if self.inner.read().await.state != MuxerState::Running {
            return Err(MuxerError::NotRunning);
        }
        Ok(())
    }

    /// Empty -> Running. Spawns the cache controller (if a cache is
    /// configured) and one [`connection_task`] per target.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.state != MuxerState::Empty {
                return Err(MuxerError::NotReady);
            }
            inner.state = MuxerState::Running;
        }

        if self.targets.is_empty() {
            return Err(MuxerError::NoTargets);
        }

        self.conn_dead.store(self.targets.len() as i64, Ordering::SeqCst);
        self.conn_hot.store(0, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().await;

        if let Some(cache) = self.cache.clone()
            && self.cfg.enable_cache
        {
            let cache_signal_rx = self
                .cache_signal_rx
                .lock()
                .await
                .take()
                .expect("cache signal receiver already taken");
            let muxer = self.clone();
            tasks.push(tokio::spawn(cache_controller::run(
                muxer,
                cache,
                cache_signal_rx,
            )));
        }

        for index in 0..self.targets.len() {
            let muxer = self.clone();
            tasks.push(tokio::spawn(connection_task::run(muxer.clone(), index)));
            tasks.push(tokio::spawn(writer_task::run(muxer, index)));
        }

        Ok(())
    }

    /// Running -> Closed. Idempotent. Flushes via a 1s [`Muxer::sync`],
    /// signals every task to stop, waits for them, then (if a file-backed
    /// cache is configured) drains every connection's outstanding entries,
    /// both channels, and the emergency queue into the cache before closing
    /// it.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.state == MuxerState::Closed {
                return Ok(());
            }
            if inner.state != MuxerState::Running {
                inner.state = MuxerState::Closed;
                return Ok(());
            }
        }

        let _ = self.sync(Duration::from_secs(1)).await;

        self.die.cancel();

        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        {
            let mut inner = self.inner.write().await;
            inner.state = MuxerState::Closed;
        }

        if let Some(cache) = &self.cache
            && self.cfg.cache.is_file_backed()
        {
            self.drain_into_cache(cache.as_ref()).await;
            let tags = self.tags_snapshot().await;
            let _ = cache.update_stored_tag_list(&tags).await;
            let _ = cache.close().await;
        }

        Ok(())
    }

    async fn drain_into_cache(&self, cache: &dyn IngestCache) {
        let inner = self.inner.read().await;
        for slot in &inner.slots {
            if let Some(conn) = &slot.connection {
                for wire in conn.outstanding_entries().await {
                    let local = slot.translator.reverse(wire.tag);
                    let entry = Entry {
                        ts: wire.ts,
                        tag: local,
                        src: wire.src,
                        data: wire.data,
                    };
                    let _ = cache.add_entry(entry).await;
                }
            }
        }
        drop(inner);

        let mut entry_rx = self.entry_rx.lock().await;
        while let Ok(e) = entry_rx.try_recv() {
            let _ = cache.add_entry(e).await;
        }
        let mut batch_rx = self.batch_rx.lock().await;
        while let Ok(b) = batch_rx.try_recv() {
            let _ = cache
                .add_block(crate::cache::Block {
                    entry: None,
                    batch: Some(b),
                })
                .await;
        }

        while let Some(item) = self.emergency.pop() {
            if let Some(e) = item.entry {
                let _ = cache.add_entry(e).await;
            }
            if let Some(b) = item.batch {
                let _ = cache
                    .add_block(crate::cache::Block {
                        entry: None,
                        batch: Some(b),
                    })
                    .await;
            }
        }
    }

    /// Appends `e` to the entry channel. A no-op if the payload is empty.
    /// Blocks (backpressure) if the channel is full.
    pub async fn write_entry(&self, e: Entry) -> Result<()> {
        self.require_running().await?;
        if e.data.is_empty() {
            return Ok(());
        }
        self.entry_tx.send(e).await.map_err(|_| MuxerError::NotRunning)
    }

    /// As [`Muxer::write_entry`], but honors cancellation via `token`.
    pub async fn write_entry_context(&self, e: Entry, token: &CancellationToken) -> Result<()> {
        self.require_running().await?;
        if e.data.is_empty() {
            return Ok(());
        }
        tokio::select! {
            res = self.entry_tx.send(e) => res.map_err(|_| MuxerError::NotRunning),
            _ = token.cancelled() => Err(MuxerError::Timeout),
        }
    }

    pub async fn write_batch(&self, b: Batch) -> Result<()> {
        self.require_running().await?;
        if b.is_empty() {
            return Ok(());
        }
        self.batch_tx.send(b).await.map_err(|_| MuxerError::NotRunning)
    }

    pub async fn write_batch_context(&self, b: Batch, token: &CancellationToken) -> Result<()> {
        self.require_running().await?;
        if b.is_empty() {
            return Ok(());
        }
        tokio::select! {
            res = self.batch_tx.send(b) => res.map_err(|_| MuxerError::NotRunning),
            _ = token.cancelled() => Err(MuxerError::Timeout),
        }
    }

    /// Convenience wrapper building an [`Entry`] from its parts.
    pub async fn write(&self, ts: Timestamp, tag: LocalTagId, data: impl Into<bytes::Bytes>) -> Result<()> {
        self.write_entry(Entry {
            ts,
            tag,
            src: None,
            data: data.into(),
        })
        .await
    }

    pub async fn get_tag(&self, name: &str) -> Result<LocalTagId> {
        self.require_running().await?;
        self.inner
            .read()
            .await
            .tags
            .get(name)
            .ok_or_else(|| MuxerError::TagNotFound(name.to_string()))
    }

    /// Linear reverse lookup; expensive, as documented.
    pub async fn lookup_tag(&self, id: LocalTagId) -> Option<String> {
        self.inner.read().await.tags.lookup(id).map(str::to_string)
    }

    /// Idempotent: registers `name` with every live connection's translator,
    /// closing (and so forcing a reconnect of) any connection whose
    /// negotiation or translator registration fails.
    pub async fn negotiate_tag(&self, name: &str) -> Result<LocalTagId> {
        self.require_running().await?;

        let (id, created) = {
            let mut inner = self.inner.write().await;
            inner.tags.negotiate(name).map_err(|_| MuxerError::TagMapInvalid)?
        };
        if !created {
            return Ok(id);
        }

        if let Some(cache) = &self.cache
            && self.cfg.cache.is_file_backed()
        {
            let tags = self.tags_snapshot().await;
            let _ = cache.update_stored_tag_list(&tags).await;
        }

        let connections: Vec<(usize, Arc<dyn IndexerConnection>)> = {
            let inner = self.inner.read().await;
            inner
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.connection.clone().map(|c| (i, c)))
                .collect()
        };

        for (index, conn) in connections {
            let outcome = async {
                let remote = conn.negotiate_tag(name).await?;
                let mut inner = self.inner.write().await;
                inner.slots[index].translator.register_tag(id, remote)?;
                anyhow::Ok(inner.slots[index].translator.clone())
            }
            .await;

            match outcome {
                // Re-publish the enlarged translator to the paired writer
                // task so it can keep writing through the same hot
                // connection instead of translation failing on the new tag
                // and forcing a reconnect.
                Ok(translator) => {
                    let _ = self.wiring[index].handoff_tx.send(Some(ConnSet {
                        connection: conn,
                        translator,
                        index,
                    }));
                },
                Err(_) => conn.close().await,
            }
        }

        Ok(id)
    }

    /// Waits until both channels are empty (or `timeout` elapses), then
    /// syncs every live connection.
    pub async fn sync(&self, timeout: Duration) -> Result<()> {
        self.sync_context(timeout, &CancellationToken::new()).await
    }

    pub async fn sync_context(&self, timeout: Duration, token: &CancellationToken) -> Result<()> {
        self.require_running().await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let empty = {
                let entry_rx = self.entry_rx.lock().await;
                let batch_rx = self.batch_rx.lock().await;
                entry_rx.is_empty() && batch_rx.is_empty()
            };
            if empty {
                break;
            }
            if tokio::time::Instant::now() >= deadline || token.is_cancelled() {
                return Err(MuxerError::SyncTimeout);
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(10)) => {},
                _ = token.cancelled() => return Err(MuxerError::SyncTimeout),
            }
        }

        if self.conn_hot.load(Ordering::Acquire) == 0 && self.cache.is_none() {
            return Err(MuxerError::AllConnsDown);
        }

        let connections: Vec<Arc<dyn IndexerConnection>> = {
            let inner = self.inner.read().await;
            inner.slots.iter().filter_map(|s| s.connection.clone()).collect()
        };

        if connections.is_empty() && self.cache.is_none() {
            return Err(MuxerError::AllConnsDown);
        }

        let mut all_failed = !connections.is_empty();
        for conn in connections {
            if conn.sync(timeout).await.is_ok() {
                all_failed = false;
            }
        }
        if all_failed {
            return Err(MuxerError::AllConnsDown);
        }

        Ok(())
    }

    /// Returns as soon as `conn_hot > 0`, or once timeout elapses if a
    /// file-backed cache is running and error-free. Fails with
    /// [`MuxerError::ConnectionTimeout`] otherwise, or early if every target
    /// has reported a fatal error.
    pub async fn wait_for_hot(&self, timeout: Duration) -> Result<()> {
        self.require_running().await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.conn_hot.load(Ordering::Acquire) > 0 {
                return Ok(());
            }
            if self.target_error_count().await >= self.targets.len() {
                return Err(MuxerError::AllConnsDown);
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            let wait = jittered_duration(Duration::from_millis(50), Duration::from_millis(150));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {},
                _ = self.up_rx.clone().wait_for(|v| *v) => {
                    if self.conn_hot.load(Ordering::Acquire) > 0 {
                        return Ok(());
                    }
                },
            }
        }

        if self.cache.is_some()
            && self.cfg.cache.is_file_backed()
            && self.target_error_count().await == 0
        {
            return Ok(());
        }

        Err(MuxerError::ConnectionTimeout)
    }

    pub async fn hot(&self) -> Result<i64> {
        self.require_running().await?;
        Ok(self.conn_hot.load(Ordering::Acquire))
    }

    pub async fn dead(&self) -> Result<i64> {
        self.require_running().await?;
        Ok(self.conn_dead.load(Ordering::Acquire))
    }

    pub async fn size(&self) -> Result<usize> {
        self.require_running().await?;
        Ok(self.targets.len())
    }

    /// Scans live connections for the first non-loopback source address;
    /// returns a loopback address if every connection reports one, or an
    /// error if none report anything.
    pub async fn source_ip(&self) -> Result<IpAddr> {
        self.require_running().await?;
        let inner = self.inner.read().await;
        let mut loopback = None;
        for slot in &inner.slots {
            if let Some(conn) = &slot.connection
                && let Some(ip) = conn.source_ip()
            {
                if ip.is_loopback() {
                    loopback.get_or_insert(ip);
                } else {
                    return Ok(ip);
                }
            }
        }
        loopback.ok_or(MuxerError::AllConnsDown)
    }
}

/// Entry recycling: tries to push `entry`/`batch` back onto the
/// producer channels within a shared 1-second budget; whatever doesn't make
/// it in time is parked in the emergency queue. A clone is kept so that a
/// send future dropped by a losing `select!` branch doesn't take the data
/// with it.
pub(crate) async fn recycle_entries(muxer: &Muxer, entry: Option<Entry>, batch: Option<Batch>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);

    let mut parked_entry = None;
    if let Some(e) = entry {
        let backup = e.clone();
        let sent = tokio::select! {
            res = muxer.entry_tx.send(e) => res.is_ok(),
            _ = tokio::time::sleep_until(deadline) => false,
        };
        if !sent {
            parked_entry = Some(backup);
        }
    }

    let mut parked_batch = None;
    if let Some(b) = batch {
        let backup = b.clone();
        let sent = tokio::select! {
            res = muxer.batch_tx.send(b) => res.is_ok(),
            _ = tokio::time::sleep_until(deadline) => false,
        };
        if !sent {
            parked_batch = Some(backup);
        }
    }

    if parked_entry.is_some() || parked_batch.is_some() {
        let item = crate::emergency::Item {
            entry: parked_entry,
            batch: parked_batch,
        };
        if let Err(e) = muxer.emergency.push(item) {
            warn!(error = %e, "emergency queue overflow, dropping recycled entries");
        }
    }
}
