// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Activates and deactivates the disk-backed spool in step with the muxer's
//! hot connection count. `goHot`/`goDead` (in [`super::Muxer`])
//! only flip the counters and push onto `cacheSignal`; this task is the sole
//! owner of `cache_active` and of actually starting, stopping, and draining
//! the cache.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{cache::IngestCache, mux::Muxer};

/// `signal == true` means every connection just went dead; `false` means a
/// connection just came back hot. Runs until the muxer's die token fires
/// (`cache_signal_rx` itself never closes on its own: the sender lives on
/// [`Muxer`], which this task holds an `Arc` to for its whole lifetime).
///
/// The cache is started immediately on entry: destinations start
/// dead by construction, so the spool must already be catching writes before
/// the first `ConnectionTask` has had a chance to dial out.
pub(crate) async fn run(muxer: Arc<Muxer>, cache: Arc<dyn IngestCache>, mut cache_signal_rx: mpsc::Receiver<bool>) {
    let die = muxer.die_token();
    let mut cache_active = activate(&muxer, cache.as_ref()).await;
    if cache_active {
        info!("cache activated: muxer starting with no hot connections");
    }

    loop {
        let all_down = tokio::select! {
            _ = die.cancelled() => break,
            signal = cache_signal_rx.recv() => match signal {
                Some(s) => s,
                None => break,
            },
        };

        if all_down && !cache_active {
            if activate(&muxer, cache.as_ref()).await {
                cache_active = true;
                info!("cache activated: no hot connections");
            }
        } else if !all_down && cache_active {
            let drained = deactivate(&muxer, cache.as_ref(), &mut cache_signal_rx, &die).await;
            if drained {
                cache_active = false;
                info!("cache deactivated: a connection is hot again");
            } else if activate(&muxer, cache.as_ref()).await {
                info!("cache drain interrupted by a new outage, restarted");
            } else {
                cache_active = false;
            }
        }
    }

    if cache_active {
        let _ = cache.stop().await;
    }
}

async fn activate(muxer: &Arc<Muxer>, cache: &dyn IngestCache) -> bool {
    match cache.start(muxer.entry_receiver(), muxer.batch_receiver()).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "cache failed to start, continuing without it");
            false
        },
    }
}

/// Drains every spooled block back onto the producer channels before
/// stopping the cache's own consumer loop. Each send races against another
/// `cacheSignal` message (connections can flap again mid-drain) and against
/// the muxer's die token (`close()` can fire with no writer task left to
/// drain a full channel). A `cacheSignal` wakeup only aborts the drain when
/// `conn_hot` is actually `0` afterward — `cacheSignal` is capacity-1 with
/// non-blocking sends, so a stale or coalesced edge (e.g. a dropped
/// went-dead edge behind a retained came-hot one) must not be trusted on its
/// own; the drain keeps going as long as some connection is really hot. On
/// a die signal, a closed channel, or a confirmed all-down wakeup, the
/// current block goes back into the spool and draining stops early, to be
/// finished next time the cache activates.
async fn deactivate(
    muxer: &Arc<Muxer>,
    cache: &dyn IngestCache,
    cache_signal_rx: &mut mpsc::Receiver<bool>,
    die: &CancellationToken,
) -> bool {
    let _ = cache.stop().await;

    loop {
        let block = match cache.pop_block().await {
            Ok(Some(b)) => b,
            Ok(None) => return true,
            Err(e) => {
                warn!(error = %e, "failed popping spooled block, stopping drain");
                return false;
            },
        };

        if let Some(entry) = block.entry {
            let sent = loop {
                tokio::select! {
                    res = muxer.entry_sender().send(entry.clone()) => break res.is_ok(),
                    signal = cache_signal_rx.recv() => match signal {
                        None => break false,
                        Some(_) if muxer.conn_hot_count() == 0 => break false,
                        Some(_) => continue,
                    },
                    _ = die.cancelled() => break false,
                }
            };
            if !sent {
                let _ = cache
                    .add_block(crate::cache::Block {
                        entry: Some(entry),
                        batch: None,
                    })
                    .await;
                debug!("cache drain interrupted, requeued block");
                return false;
            }
            continue;
        }

        if let Some(batch) = block.batch {
            let sent = loop {
                tokio::select! {
                    res = muxer.batch_sender().send(batch.clone()) => break res.is_ok(),
                    signal = cache_signal_rx.recv() => match signal {
                        None => break false,
                        Some(_) if muxer.conn_hot_count() == 0 => break false,
                        Some(_) => continue,
                    },
                    _ = die.cancelled() => break false,
                }
            };
            if !sent {
                let _ = cache
                    .add_block(crate::cache::Block {
                        entry: None,
                        batch: Some(batch),
                    })
                    .await;
                debug!("cache drain interrupted, requeued block");
                return false;
            }
        }
    }
}
