// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The `IndexerConnection` collaborator interface: a single
//! authenticated, persistent connection to one remote indexer. The muxer
//! core only depends on this trait; [`tcp`] and [`tls`] provide concrete
//! implementations (owned
//! read/write halves behind `tokio::sync::Mutex`, a background read loop,
//! per-request correlation channels).

pub mod protocol;
pub mod tcp;
pub mod tls;

use std::{fmt::Debug, net::IpAddr, time::Duration};

use anyhow::Result;
use async_trait::async_trait;

use crate::{entry::Entry, tag::RemoteTagId};

/// An entry whose tag has already been resolved to a [`RemoteTagId`] for this
/// particular connection, ready to be framed and written to the wire.
#[derive(Debug, Clone)]
pub struct WireEntry {
    pub tag: RemoteTagId,
    pub ts: crate::entry::Timestamp,
    pub src: Option<IpAddr>,
    pub data: bytes::Bytes,
}

impl WireEntry {
    pub fn new(entry: &Entry, tag: RemoteTagId) -> Self {
        Self {
            tag,
            ts: entry.ts,
            src: entry.src,
            data: entry.data.clone(),
        }
    }
}

/// One authenticated connection to a remote indexer.
///
/// Every method may perform network I/O and should be cancel-safe: the
/// muxer never holds a lock across a call into this trait.
#[async_trait]
pub trait IndexerConnection: Debug + Send + Sync {
    /// Dials `address`, performs the auth handshake with `secret`, and
    /// advertises the initial tag set. Fatal configuration errors (spec
    /// §4.2 step 1) are distinguished from transient ones via
    /// [`ConnectError`].
    ///
    /// A `tls` flag could be threaded through `initialize` instead; here
    /// that choice is made by which concrete type the
    /// muxer constructs ([`tcp::TcpIndexerConnection`] vs.
    /// [`tls::TlsIndexerConnection`]) rather than a runtime bool, which
    /// keeps each implementation's invariants (e.g. certificate
    /// verification) enforced by the type system instead of a branch.
    async fn initialize(
        &self,
        address: &str,
        secret: &str,
        tags: &[String],
    ) -> Result<(), ConnectError>;

    /// Sends ingester identification.
    async fn identify(&self, name: &str, version: &str, uuid: &str) -> Result<()>;

    /// Polls target readiness.
    async fn ingest_ok(&self) -> Result<bool>;

    /// Asks the indexer to assign (or report) a remote id for `name`.
    async fn negotiate_tag(&self, name: &str) -> Result<RemoteTagId>;

    /// Reports the remote id for `name` if the indexer already knows it.
    async fn get_tag(&self, name: &str) -> Result<Option<RemoteTagId>>;

    async fn write_entry(&self, entry: &WireEntry) -> Result<()>;

    async fn write_batch(&self, entries: &[WireEntry]) -> Result<()>;

    /// Flushes any buffered writes and blocks until the target acknowledges
    /// them, or `timeout` elapses.
    async fn sync(&self, timeout: Duration) -> Result<()>;

    /// Tears down the connection. Idempotent.
    async fn close(&self);

    /// Entries handed to `write_entry`/`write_batch` that have not yet been
    /// acknowledged; drained by the owning [`crate::mux::connection_task`]
    /// when the connection dies so they can be recycled.
    async fn outstanding_entries(&self) -> Vec<WireEntry>;

    /// The local address this connection's socket is bound to, if known.
    fn source_ip(&self) -> Option<IpAddr>;

    /// Subscribes to this connection's "I have failed" notification. Firing
    /// is edge-triggered and single-shot: once the channel yields a value
    /// (or closes), the connection is considered dead.
    fn error_notify(&self) -> tokio::sync::oneshot::Receiver<anyhow::Error>;
}

/// The fatal/transient split used by the reconnect loop.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("transient: {0}")]
    Transient(#[from] anyhow::Error),
}

impl ConnectError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectError::Fatal(_))
    }
}
