// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One task per destination: owns the reconnect loop, builds a
//! fresh [`TagTranslator`] against the muxer's current tag table, installs
//! the resulting [`super::ConnSet`] for its paired [`super::writer_task`],
//! and recycles outstanding entries when the connection dies.

use std::{sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::{
    cfg::config::DEFAULT_RETRY,
    indexer::{IndexerConnection, tcp::TcpIndexerConnection, tls::TlsIndexerConnection},
    mux::{Muxer, recycle_entries},
    tag::{LocalTagId, TagTranslator},
};

const INGEST_OK_POLL: Duration = Duration::from_secs(5);

pub(crate) async fn run(muxer: Arc<Muxer>, index: usize) {
    let die = muxer.die_token();

    loop {
        if die.is_cancelled() {
            return;
        }

        let connection = match dial(&muxer, index).await {
            Dial::Connected(c) => c,
            Dial::Fatal(msg) => {
                muxer.record_target_error(index, msg).await;
                warn!(index, "destination failed permanently");
                return;
            },
            Dial::Retry => {
                tokio::select! {
                    _ = tokio::time::sleep(DEFAULT_RETRY) => continue,
                    _ = die.cancelled() => return,
                }
            },
        };

        let translator = match build_translator(&muxer, connection.as_ref()).await {
            Some(t) => t,
            None => {
                connection.close().await;
                continue;
            },
        };

        let ident = muxer.config().identification.clone();
        if connection
            .identify(&ident.ingester_name, &ident.ingester_version, ident.ingester_uuid.as_deref().unwrap_or(""))
            .await
            .is_err()
        {
            connection.close().await;
            continue;
        }

        if !wait_ingest_ok(&connection, &die).await {
            connection.close().await;
            if die.is_cancelled() {
                return;
            }
            continue;
        }

        muxer
            .install_connection(index, connection.clone(), translator.clone())
            .await;
        muxer.go_hot(index);
        info!(index, "connection hot");

        wait_for_failure(&muxer, index, &connection, &die).await;

        if die.is_cancelled() {
            return;
        }

        connection.close().await;
        muxer.go_dead(index);
        let outstanding = connection.outstanding_entries().await;
        muxer.clear_connection(index).await;
        recycle_outstanding(&muxer, &translator, outstanding).await;
    }
}

enum Dial {
    Connected(Arc<dyn IndexerConnection>),
    Fatal(String),
    Retry,
}

async fn dial(muxer: &Arc<Muxer>, index: usize) -> Dial {
    let target = muxer.targets()[index].clone();
    let cfg = muxer.config();

    let connection: Arc<dyn IndexerConnection> = if cfg.tls.enabled {
        let built = crate::indexer::tls::config::build_client_config(
            cfg.tls.public_key.as_deref(),
            cfg.tls.private_key.as_deref(),
            cfg.tls.verify_cert,
        );
        match built {
            Ok(tls_config) => TlsIndexerConnection::new(tls_config, cfg.rate_limit_bps),
            Err(e) => return Dial::Fatal(format!("building TLS client config: {e}")),
        }
    } else {
        TcpIndexerConnection::new(cfg.rate_limit_bps)
    };

    let tags = muxer.tags_snapshot().await;
    match connection.initialize(&target.address, &target.secret, &tags).await {
        Ok(()) => Dial::Connected(connection),
        Err(e) if e.is_fatal() => Dial::Fatal(e.to_string()),
        Err(e) => {
            warn!(index, error = %e, "connect attempt failed, will retry");
            Dial::Retry
        },
    }
}

/// Asks the indexer for the remote id of every tag the muxer already knows,
/// in order, building a translator dense up through the tag table length.
async fn build_translator(muxer: &Arc<Muxer>, connection: &dyn IndexerConnection) -> Option<TagTranslator> {
    let tags = muxer.tags_snapshot().await;
    let mut translator = TagTranslator::new();

    for (i, name) in tags.iter().enumerate().skip(1) {
        match connection.get_tag(name).await {
            Ok(Some(remote)) => {
                if translator.register_tag(LocalTagId(i as u32), remote).is_err() {
                    return None;
                }
            },
            Ok(None) => {
                warn!(tag = name.as_str(), "indexer has no remote id for a tag it was told about");
                return None;
            },
            Err(e) => {
                warn!(tag = name.as_str(), error = %e, "get_tag failed while building translator");
                return None;
            },
        }
    }

    Some(translator)
}

async fn wait_ingest_ok(connection: &Arc<dyn IndexerConnection>, die: &tokio_util::sync::CancellationToken) -> bool {
    loop {
        match connection.ingest_ok().await {
            Ok(true) => return true,
            Ok(false) => {},
            Err(e) => {
                warn!(error = %e, "ingest_ok query failed");
                return false;
            },
        }
        tokio::select! {
            _ = tokio::time::sleep(INGEST_OK_POLL) => {},
            _ = die.cancelled() => return false,
        }
    }
}

/// Blocks until the connection reports failure (edge-triggered, single-shot)
/// or a paired writer task best-effort requests a reconnect, or the muxer is
/// closing.
async fn wait_for_failure(
    muxer: &Arc<Muxer>,
    index: usize,
    connection: &Arc<dyn IndexerConnection>,
    die: &tokio_util::sync::CancellationToken,
) {
    let error_rx = connection.error_notify();
    let wiring = muxer.wiring(index);
    let mut notify_rx = wiring.notify_rx.lock().await;
    while notify_rx.try_recv().is_ok() {}

    tokio::select! {
        _ = die.cancelled() => {},
        _ = error_rx => {},
        _ = notify_rx.recv() => {},
    }
}

async fn recycle_outstanding(muxer: &Arc<Muxer>, translator: &TagTranslator, wires: Vec<crate::indexer::WireEntry>) {
    if wires.is_empty() {
        return;
    }
    let entries: Vec<crate::entry::Entry> = wires
        .into_iter()
        .map(|w| crate::entry::Entry {
            ts: w.ts,
            tag: translator.reverse(w.tag),
            src: w.src,
            data: w.data,
        })
        .collect();
    recycle_entries(muxer, None, Some(entries)).await;
}
