// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One task per destination, paired with a [`super::connection_task`]: pulls
//! from the shared entry/batch channels, translates tags, writes to its
//! current connection, and opportunistically drains the emergency queue.

use std::{sync::Arc, time::Duration};

use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{info, warn};

use crate::{
    entry::{Batch, Entry},
    indexer::WireEntry,
    mux::{ConnSet, Muxer, recycle_entries},
    utils::jittered_duration,
};

pub(crate) async fn run(muxer: Arc<Muxer>, index: usize) {
    let die = muxer.die_token();
    let entry_rx = muxer.entry_receiver();
    let batch_rx = muxer.batch_receiver();
    let mut handoff_rx = muxer.wiring(index).handoff_rx.clone();

    let mut nc = tokio::select! {
        _ = die.cancelled() => return,
        got = get_new_conn_set(&muxer, index, &mut handoff_rx, true) => match got {
            Some(nc) => nc,
            None => return,
        },
    };

    let mut ticker = tokio::time::interval(jittered_duration(
        Duration::from_millis(750),
        Duration::from_millis(1250),
    ));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = die.cancelled() => {
                let _ = nc.connection.sync(Duration::from_secs(1)).await;
                nc.connection.close().await;
                return;
            }

            entry = recv_entry(&entry_rx) => {
                let Some(e) = entry else { continue };
                handle_entry(&muxer, index, &mut nc, &mut handoff_rx, e).await;
            }

            batch = recv_batch(&batch_rx) => {
                let Some(b) = batch else { continue };
                handle_batch(&muxer, index, &mut nc, &mut handoff_rx, b).await;
            }

            changed = handoff_rx.changed() => {
                if changed.is_err() {
                    let _ = nc.connection.sync(Duration::from_secs(1)).await;
                    return;
                }
                if let Some(fresh) = handoff_rx.borrow_and_update().clone() {
                    nc = fresh;
                }
            }

            _ = ticker.tick() => {
                opportunistic_drain(&muxer, index, &mut nc, &mut handoff_rx).await;
            }
        }
    }
}

async fn recv_entry(rx: &Arc<AsyncMutex<mpsc::Receiver<Entry>>>) -> Option<Entry> {
    rx.lock().await.recv().await
}

async fn recv_batch(rx: &Arc<AsyncMutex<mpsc::Receiver<Batch>>>) -> Option<Batch> {
    rx.lock().await.recv().await
}

async fn handle_entry(
    muxer: &Arc<Muxer>,
    index: usize,
    nc: &mut ConnSet,
    handoff_rx: &mut watch::Receiver<Option<ConnSet>>,
    mut e: Entry,
) {
    let (remote, ok) = nc.translator.translate(e.tag);
    if !ok {
        if e.tag.0 as usize >= muxer.tag_count().await {
            warn!(tag = e.tag.0, "dropping entry: tag unknown to the muxer");
            return;
        }
        recycle_entries(muxer, Some(e), None).await;
        if let Some(fresh) = get_new_conn_set(muxer, index, handoff_rx, false).await {
            *nc = fresh;
        }
        return;
    }

    if e.src.is_none() {
        e.src = muxer.source_ip().await.ok();
    }

    let wire = WireEntry::new(&e, remote);
    if nc.connection.write_entry(&wire).await.is_err() {
        recycle_entries(muxer, Some(e), None).await;
        if let Some(fresh) = get_new_conn_set(muxer, index, handoff_rx, false).await {
            *nc = fresh;
        }
        return;
    }

    maybe_should_schedule(muxer, nc).await;
}

async fn handle_batch(
    muxer: &Arc<Muxer>,
    index: usize,
    nc: &mut ConnSet,
    handoff_rx: &mut watch::Receiver<Option<ConnSet>>,
    batch: Batch,
) {
    let mut wire = Vec::with_capacity(batch.len());
    let mut translation_failed = false;
    for e in &batch {
        let (remote, ok) = nc.translator.translate(e.tag);
        if !ok {
            translation_failed = true;
            break;
        }
        wire.push(WireEntry::new(e, remote));
    }

    if translation_failed {
        recycle_entries(muxer, None, Some(batch)).await;
        if let Some(fresh) = get_new_conn_set(muxer, index, handoff_rx, false).await {
            *nc = fresh;
        }
        return;
    }

    if nc.connection.write_batch(&wire).await.is_err() {
        recycle_entries(muxer, None, Some(batch)).await;
        if let Some(fresh) = get_new_conn_set(muxer, index, handoff_rx, false).await {
            *nc = fresh;
        }
        return;
    }

    maybe_should_schedule(muxer, nc).await;
}

/// Load-balancing heuristic: when more than one destination exists and both
/// channels are momentarily empty, opportunistically clear the emergency
/// queue and sync, then yield so idle traffic spreads across connections
/// instead of one writer task monopolizing both channels.
async fn maybe_should_schedule(muxer: &Arc<Muxer>, nc: &ConnSet) {
    if muxer.targets().len() <= 1 {
        return;
    }
    if !muxer.channels_empty().await {
        return;
    }
    let _ = muxer.emergency().clear(nc.connection.as_ref(), &nc.translator).await;
    let _ = nc.connection.sync(Duration::from_secs(1)).await;
    tokio::task::yield_now().await;
}

async fn opportunistic_drain(
    muxer: &Arc<Muxer>,
    index: usize,
    nc: &mut ConnSet,
    handoff_rx: &mut watch::Receiver<Option<ConnSet>>,
) {
    let drained = muxer.emergency().clear(nc.connection.as_ref(), &nc.translator).await;
    let synced = nc.connection.sync(Duration::from_secs(5)).await.is_ok();
    if !drained || !synced {
        if let Some(fresh) = get_new_conn_set(muxer, index, handoff_rx, false).await {
            *nc = fresh;
        }
    }
}

/// Waits for the next connection set from the paired connection task. Unless
/// `first`, also best-effort requests a reconnect (the notify channel may
/// already be full; that's fine, the connection task re-checks state).
/// Returns `None` only once the hand-off channel itself has closed (the
/// connection task has exited for good).
async fn get_new_conn_set(
    muxer: &Arc<Muxer>,
    index: usize,
    handoff_rx: &mut watch::Receiver<Option<ConnSet>>,
    first: bool,
) -> Option<ConnSet> {
    if !first {
        let _ = muxer.wiring(index).notify_tx.try_send(());
    }

    loop {
        if handoff_rx.changed().await.is_err() {
            return None;
        }
        let Some(candidate) = handoff_rx.borrow_and_update().clone() else {
            continue;
        };

        let drained = muxer
            .emergency()
            .clear(candidate.connection.as_ref(), &candidate.translator)
            .await;
        let synced = candidate.connection.sync(Duration::from_secs(5)).await.is_ok();

        if drained && synced {
            info!(index, first, "writer task attached to connection");
            return Some(candidate);
        }

        let _ = muxer.wiring(index).notify_tx.try_send(());
    }
}
