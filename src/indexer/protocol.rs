// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire framing for the concrete indexer protocol used by [`super::tcp`] and
//! [`super::tls`]: length-prefixed JSON control frames, read in a
//! length-then-payload loop.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::tag::RemoteTagId;

/// Maximum control-frame payload size; guards against a misbehaving peer
/// asking us to allocate unbounded memory for a length-prefixed frame.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireSource {
    pub addr: Option<std::net::IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEntryWire {
    pub tag: u32,
    pub sec: i64,
    pub nsec: u32,
    pub src: Option<std::net::IpAddr>,
    pub data: Vec<u8>,
}

impl From<&crate::indexer::WireEntry> for WireEntryWire {
    fn from(e: &crate::indexer::WireEntry) -> Self {
        Self {
            tag: e.tag.0,
            sec: e.ts.sec,
            nsec: e.ts.nsec,
            src: e.src,
            data: e.data.to_vec(),
        }
    }
}

impl From<WireEntryWire> for crate::indexer::WireEntry {
    fn from(w: WireEntryWire) -> Self {
        Self {
            tag: RemoteTagId(w.tag),
            ts: crate::entry::Timestamp {
                sec: w.sec,
                nsec: w.nsec,
            },
            src: w.src,
            data: w.data.into(),
        }
    }
}

/// A control message exchanged during the handshake and steady-state
/// operation of one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlMessage {
    Hello {
        secret: String,
        tags: Vec<String>,
    },
    HelloAck,
    HelloReject {
        reason: String,
    },
    Identify {
        name: String,
        version: String,
        uuid: String,
    },
    IngestOkQuery,
    IngestOkReply {
        ok: bool,
    },
    NegotiateTag {
        name: String,
    },
    NegotiateTagReply {
        tag: u32,
    },
    GetTag {
        name: String,
    },
    GetTagReply {
        tag: Option<u32>,
    },
    WriteEntry {
        entry: WireEntryWire,
    },
    WriteBatch {
        entries: Vec<WireEntryWire>,
    },
    Sync,
    Ack,
    Nak {
        reason: String,
    },
}

/// Every frame carries a correlation id so replies can be routed back to the
/// caller that issued them, even when several requests (a write from the
/// writer task, a tag negotiation from the muxer) are in flight on the same
/// connection concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub msg: ControlMessage,
}

/// Writes one length-prefixed, JSON-encoded control frame.
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut W,
    env: &Envelope,
) -> Result<()> {
    let body = serde_json::to_vec(env).context("encoding control frame")?;
    let len = u32::try_from(body.len()).context("control frame too large")?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&body).await?;
    // Required for `TlsIndexerConnection`: `tokio_rustls` buffers ciphertext
    // at the record layer, so without this a frame can sit un-sent until the
    // next write or a shutdown. `TcpIndexerConnection`'s unbuffered
    // `OwnedWriteHalf` makes this a no-op there.
    w.flush().await?;
    Ok(())
}

/// Reads one length-prefixed, JSON-encoded control frame.
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(r: &mut R) -> Result<Envelope> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        bail!("control frame of {len} bytes exceeds {MAX_FRAME_LEN} byte cap");
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    serde_json::from_slice(&body).context("decoding control frame")
}

/// Wraps a fallible async I/O operation with a timeout, cancelling cleanly on
/// expiry.
pub async fn with_timeout<F, T>(label: &'static str, fut: F, dur: Duration) -> Result<T>
where F: std::future::Future<Output = Result<T>> {
    match tokio::time::timeout(dur, fut).await {
        Ok(res) => res,
        Err(_) => bail!("{label} timed out after {dur:?}"),
    }
}
