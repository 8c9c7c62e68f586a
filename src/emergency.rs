// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-memory fallback for entries/batches that could not be recycled onto a
//! live producer channel within the recycling window.

use std::{collections::VecDeque, sync::Mutex};

use tracing::warn;

use crate::{
    entry::{Batch, Entry},
    error::{MuxerError, Result},
    indexer::{IndexerConnection, WireEntry},
    tag::{RemoteTagId, TagTranslator},
};

/// Maximum number of parked items. Bounded so a long outage can't let this
/// queue grow without limit.
pub const EMERGENCY_QUEUE_CAPACITY: usize = 256;

/// One parked unit of work. Both fields may be populated at once: that is how
/// a partially-translated batch is parked alongside the single entry that
/// triggered the park.
#[derive(Debug, Clone, Default)]
pub struct Item {
    pub entry: Option<Entry>,
    pub batch: Option<Batch>,
}

impl Item {
    fn is_empty(&self) -> bool {
        self.entry.is_none() && self.batch.is_none()
    }
}

#[derive(Debug, Default)]
pub struct EmergencyQueue {
    inner: Mutex<VecDeque<Item>>,
}

impl EmergencyQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(EMERGENCY_QUEUE_CAPACITY)),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("emergency queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes at the tail. Fails with [`MuxerError::EmergencyListOverflow`] at
    /// capacity.
    pub fn push(&self, item: Item) -> Result<()> {
        if item.is_empty() {
            return Ok(());
        }
        let mut q = self.inner.lock().expect("emergency queue mutex poisoned");
        if q.len() >= EMERGENCY_QUEUE_CAPACITY {
            return Err(MuxerError::EmergencyListOverflow);
        }
        q.push_back(item);
        Ok(())
    }

    /// Pops from the head, if any.
    pub fn pop(&self) -> Option<Item> {
        self.inner.lock().expect("emergency queue mutex poisoned").pop_front()
    }

    fn push_front(&self, item: Item) {
        self.inner
            .lock()
            .expect("emergency queue mutex poisoned")
            .push_front(item);
    }

    /// Drains the queue onto `connection`, translating tags through `tt` as
    /// it goes. On any translation or write failure the offending item (with
    /// tags reversed back to local ids) is pushed back at the tail and
    /// `false` is returned so the caller knows to trigger a reconnect.
    /// Returns `true` once the queue is empty.
    pub async fn clear(
        &self,
        connection: &dyn IndexerConnection,
        tt: &TagTranslator,
    ) -> bool {
        loop {
            let Some(item) = self.pop() else {
                return true;
            };

            if let Err(failed) = self.clear_one(connection, tt, item).await {
                self.push_front(failed);
                return false;
            }
        }
    }

    async fn clear_one(
        &self,
        connection: &dyn IndexerConnection,
        tt: &TagTranslator,
        item: Item,
    ) -> std::result::Result<(), Item> {
        let mut out = Item::default();

        if let Some(mut e) = item.entry {
            let (remote, ok) = tt.translate(e.tag);
            if !ok {
                warn!(tag = e.tag.0, "emergency drain: tag unknown to translator");
                out.entry = Some(e);
                out.batch = item.batch;
                return Err(out);
            }
            let wire = WireEntry::new(&e, remote);
            if connection.write_entry(&wire).await.is_err() {
                e.tag = tt.reverse(remote);
                out.entry = Some(e);
                out.batch = item.batch;
                return Err(out);
            }
        }

        if let Some(batch) = item.batch {
            let mut translated: Vec<(RemoteTagId, Entry)> = Vec::with_capacity(batch.len());
            let mut translate_failed = false;
            for e in batch {
                let (remote, ok) = tt.translate(e.tag);
                if !ok {
                    // Reverse the already-translated prefix back to local ids
                    // and park the whole batch, untranslated entry included.
                    let mut reversed: Vec<Entry> = translated
                        .into_iter()
                        .map(|(r, mut pe)| {
                            pe.tag = tt.reverse(r);
                            pe
                        })
                        .collect();
                    reversed.push(e);
                    out.batch = Some(reversed);
                    translate_failed = true;
                    break;
                }
                translated.push((remote, e));
            }
            if translate_failed {
                return Err(out);
            }

            let wire: Vec<WireEntry> = translated
                .iter()
                .map(|(r, e)| WireEntry::new(e, *r))
                .collect();
            if connection.write_batch(&wire).await.is_err() {
                let reversed = translated
                    .into_iter()
                    .map(|(remote, mut e)| {
                        e.tag = tt.reverse(remote);
                        e
                    })
                    .collect();
                out.batch = Some(reversed);
                return Err(out);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Timestamp;
    use crate::tag::LocalTagId;

    fn entry(tag: u32) -> Entry {
        Entry::new(Timestamp { sec: 0, nsec: 0 }, LocalTagId(tag), Vec::new())
    }

    #[test]
    fn overflow_after_capacity() {
        let q = EmergencyQueue::new();
        for _ in 0..EMERGENCY_QUEUE_CAPACITY {
            q.push(Item {
                entry: Some(entry(0)),
                batch: None,
            })
            .unwrap();
        }
        let err = q
            .push(Item {
                entry: Some(entry(0)),
                batch: None,
            })
            .unwrap_err();
        assert!(matches!(err, MuxerError::EmergencyListOverflow));
        assert_eq!(q.len(), EMERGENCY_QUEUE_CAPACITY);
    }

    #[test]
    fn fifo_order() {
        let q = EmergencyQueue::new();
        q.push(Item {
            entry: Some(entry(1)),
            batch: None,
        })
        .unwrap();
        q.push(Item {
            entry: Some(entry(2)),
            batch: None,
        })
        .unwrap();
        let first = q.pop().unwrap();
        assert_eq!(first.entry.unwrap().tag, LocalTagId(1));
        let second = q.pop().unwrap();
        assert_eq!(second.entry.unwrap().tag, LocalTagId(2));
        assert!(q.pop().is_none());
    }
}
