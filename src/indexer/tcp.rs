// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Plain-TCP [`IndexerConnection`]: owned read/write halves behind
//! `tokio::sync::Mutex`,
//! a background read loop dispatching replies by correlation id, and a
//! `self_weak` handle (grounded in `client/pool_sessions.rs::Pool::attach_self`)
//! so the read loop can be spawned lazily once `initialize` has dialed out.

use std::{
    net::IpAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    indexer::{
        ConnectError, IndexerConnection, WireEntry,
        protocol::{ControlMessage, Envelope, read_frame, with_timeout, write_frame},
    },
    ratelimit::RateLimiter,
    tag::RemoteTagId,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
enum OutstandingWrite {
    One(WireEntry),
    Many(Vec<WireEntry>),
}

/// A TCP connection to one indexer. Constructed in a "not yet dialed" state;
/// [`IndexerConnection::initialize`] performs the actual connect.
pub struct TcpIndexerConnection {
    rate_limit_bps: u64,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<RateLimiter<OwnedWriteHalf>>>,
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<ControlMessage>>,
    outstanding: DashMap<u64, OutstandingWrite>,
    cancel: CancellationToken,
    closed: AtomicBool,
    source_ip: Mutex<Option<IpAddr>>,
    error_tx: Mutex<Option<oneshot::Sender<anyhow::Error>>>,
    error_rx: Mutex<Option<oneshot::Receiver<anyhow::Error>>>,
    self_weak: OnceCell<Weak<Self>>,
}

impl std::fmt::Debug for TcpIndexerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpIndexerConnection").finish_non_exhaustive()
    }
}

impl TcpIndexerConnection {
    /// `rate_limit_bps` of `0` means unlimited.
    pub fn new(rate_limit_bps: u64) -> Arc<Self> {
        let (error_tx, error_rx) = oneshot::channel();
        let conn = Arc::new(Self {
            rate_limit_bps,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            outstanding: DashMap::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            source_ip: Mutex::new(None),
            error_tx: Mutex::new(Some(error_tx)),
            error_rx: Mutex::new(Some(error_rx)),
            self_weak: OnceCell::new(),
        });
        let _ = conn.self_weak.set(Arc::downgrade(&conn));
        conn
    }

    async fn fail(&self, err: anyhow::Error) {
        if let Some(tx) = self.error_tx.lock().await.take() {
            let _ = tx.send(err);
        }
    }

    async fn read_loop(self: Arc<Self>) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                bail!("cancelled");
            }
            let env = {
                let mut guard = self.reader.lock().await;
                let r = guard.as_mut().ok_or_else(|| anyhow!("not connected"))?;
                read_frame(r).await?
            };
            if matches!(env.msg, ControlMessage::Ack | ControlMessage::Nak { .. }) {
                self.outstanding.remove(&env.id);
            }
            if let Some((_, tx)) = self.pending.remove(&env.id) {
                let _ = tx.send(env.msg);
            } else {
                debug!(id = env.id, "reply for unknown/expired request id");
            }
        }
    }

    async fn roundtrip(&self, msg: ControlMessage) -> Result<ControlMessage> {
        if self.closed.load(Ordering::Acquire) {
            bail!("connection closed");
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if let Err(e) = self.send_frame(id, msg).await {
            self.pending.remove(&id);
            return Err(e);
        }

        with_timeout(
            "roundtrip",
            async { rx.await.map_err(|_| anyhow!("connection closed before reply")) },
            REQUEST_TIMEOUT,
        )
        .await
    }

    async fn send_frame(&self, id: u64, msg: ControlMessage) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let w = guard.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        write_frame(w, &Envelope { id, msg }).await
    }
}

#[async_trait]
impl IndexerConnection for TcpIndexerConnection {
    async fn initialize(
        &self,
        address: &str,
        secret: &str,
        tags: &[String],
    ) -> Result<(), ConnectError> {
        if tags.is_empty() {
            return Err(ConnectError::Fatal("empty tag set".to_string()));
        }

        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ConnectError::Transient(e.into()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ConnectError::Transient(e.into()))?;
        let local = stream.local_addr().ok().map(|a| a.ip());
        let (r, w) = stream.into_split();

        *self.reader.lock().await = Some(r);
        *self.writer.lock().await = Some(RateLimiter::new(w, self.rate_limit_bps));
        *self.source_ip.lock().await = local;

        if let Some(strong) = self.self_weak.get().and_then(Weak::upgrade) {
            tokio::spawn(async move {
                if let Err(e) = strong.clone().read_loop().await {
                    strong.fail(anyhow!("read loop exited: {e}")).await;
                }
            });
        }

        match self
            .roundtrip(ControlMessage::Hello {
                secret: secret.to_string(),
                tags: tags.to_vec(),
            })
            .await
        {
            Ok(ControlMessage::HelloAck) => Ok(()),
            Ok(ControlMessage::HelloReject { reason }) => Err(ConnectError::Fatal(reason)),
            Ok(_) => Err(ConnectError::Transient(anyhow!("unexpected reply to Hello"))),
            Err(e) => Err(ConnectError::Transient(e)),
        }
    }

    async fn identify(&self, name: &str, version: &str, uuid: &str) -> Result<()> {
        match self
            .roundtrip(ControlMessage::Identify {
                name: name.to_string(),
                version: version.to_string(),
                uuid: uuid.to_string(),
            })
            .await?
        {
            ControlMessage::Ack => Ok(()),
            ControlMessage::Nak { reason } => bail!("identify rejected: {reason}"),
            _ => bail!("unexpected reply to Identify"),
        }
    }

    async fn ingest_ok(&self) -> Result<bool> {
        match self.roundtrip(ControlMessage::IngestOkQuery).await? {
            ControlMessage::IngestOkReply { ok } => Ok(ok),
            _ => bail!("unexpected reply to IngestOkQuery"),
        }
    }

    async fn negotiate_tag(&self, name: &str) -> Result<RemoteTagId> {
        match self
            .roundtrip(ControlMessage::NegotiateTag {
                name: name.to_string(),
            })
            .await?
        {
            ControlMessage::NegotiateTagReply { tag } => Ok(RemoteTagId(tag)),
            _ => bail!("unexpected reply to NegotiateTag"),
        }
    }

    async fn get_tag(&self, name: &str) -> Result<Option<RemoteTagId>> {
        match self
            .roundtrip(ControlMessage::GetTag {
                name: name.to_string(),
            })
            .await?
        {
            ControlMessage::GetTagReply { tag } => Ok(tag.map(RemoteTagId)),
            _ => bail!("unexpected reply to GetTag"),
        }
    }

    async fn write_entry(&self, entry: &WireEntry) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.outstanding.insert(id, OutstandingWrite::One(entry.clone()));
        let res = self
            .send_frame(id, ControlMessage::WriteEntry { entry: entry.into() })
            .await;
        if res.is_err() {
            self.outstanding.remove(&id);
        }
        res
    }

    async fn write_batch(&self, entries: &[WireEntry]) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.outstanding
            .insert(id, OutstandingWrite::Many(entries.to_vec()));
        let res = self
            .send_frame(
                id,
                ControlMessage::WriteBatch {
                    entries: entries.iter().map(Into::into).collect(),
                },
            )
            .await;
        if res.is_err() {
            self.outstanding.remove(&id);
        }
        res
    }

    async fn sync(&self, timeout: Duration) -> Result<()> {
        with_timeout(
            "sync",
            async {
                match self.roundtrip(ControlMessage::Sync).await? {
                    ControlMessage::Ack => Ok(()),
                    ControlMessage::Nak { reason } => bail!("sync rejected: {reason}"),
                    _ => bail!("unexpected reply to Sync"),
                }
            },
            timeout,
        )
        .await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let mut guard = self.writer.lock().await;
        if let Some(w) = guard.as_mut() {
            let _ = tokio::io::AsyncWriteExt::shutdown(w).await;
        }
    }

    async fn outstanding_entries(&self) -> Vec<WireEntry> {
        let mut out = Vec::new();
        for kv in self.outstanding.iter() {
            match kv.value() {
                OutstandingWrite::One(e) => out.push(e.clone()),
                OutstandingWrite::Many(es) => out.extend(es.iter().cloned()),
            }
        }
        self.outstanding.clear();
        out
    }

    fn source_ip(&self) -> Option<IpAddr> {
        self.source_ip.try_lock().ok().and_then(|g| *g)
    }

    fn error_notify(&self) -> oneshot::Receiver<anyhow::Error> {
        // Consumed exactly once by the owning ConnectionTask, right after
        // `initialize` succeeds; a second call returns an already-closed
        // receiver.
        match self.error_rx.try_lock().ok().and_then(|mut g| g.take()) {
            Some(rx) => rx,
            None => {
                let (tx, rx) = oneshot::channel();
                drop(tx);
                rx
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_refused_is_transient() {
        let conn = TcpIndexerConnection::new(0);
        // Port 1 is reserved and should refuse immediately on all test hosts.
        let res = conn.initialize("127.0.0.1:1", "secret", &["default".to_string()]).await;
        assert!(res.is_err());
        assert!(!res.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn empty_tags_is_fatal() {
        let conn = TcpIndexerConnection::new(0);
        let res = conn.initialize("127.0.0.1:1", "secret", &[]).await;
        assert!(res.unwrap_err().is_fatal());
    }
}
