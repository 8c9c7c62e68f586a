// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::IpAddr,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::tag::LocalTagId;

/// Wire-format timestamp: seconds since the Unix epoch plus nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                sec: d.as_secs() as i64,
                nsec: d.subsec_nanos(),
            },
            Err(e) => {
                let d = e.duration();
                Self {
                    sec: -(d.as_secs() as i64),
                    nsec: d.subsec_nanos(),
                }
            },
        }
    }
}

/// A single tagged log/event record moving through the muxer.
///
/// `tag` is meaningful only within this process; it is translated to a
/// connection-specific remote id by a [`crate::tag::TagTranslator`] before it
/// reaches an indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub ts: Timestamp,
    pub tag: LocalTagId,
    pub src: Option<IpAddr>,
    pub data: Bytes,
}

impl Entry {
    pub fn new(ts: Timestamp, tag: LocalTagId, data: impl Into<Bytes>) -> Self {
        Self {
            ts,
            tag,
            src: None,
            data: data.into(),
        }
    }
}

/// A batch of entries written together; order within the batch is preserved
/// to a single indexer, but batches are never split across connections.
pub type Batch = Vec<Entry>;
