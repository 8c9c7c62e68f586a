// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end tests driving a real [`Muxer`] over real TCP connections
//! against [`support::fake_indexer::FakeIndexer`], covering the named
//! scenarios of the ingest multiplexer's testable properties: the happy
//! path, a single-connection flap, an all-down outage with a file-backed
//! cache, and late tag negotiation.

mod support;

use std::time::Duration;

use ingest_mux::{
    Muxer, MuxerConfig,
    cache::IngestCache,
    cfg::config::{CacheConfig, Destinations, DestinationConfig, Identification, LoggingConfig, TlsConfig},
    entry::Timestamp,
};
use support::fake_indexer::FakeIndexer;

fn base_config(addresses: &[String]) -> MuxerConfig {
    MuxerConfig {
        destinations: Destinations {
            targets: addresses
                .iter()
                .map(|a| DestinationConfig {
                    address: a.clone(),
                    secret: "s3cret".to_string(),
                })
                .collect(),
            shared_secret: None,
        },
        tags: vec!["default".to_string()],
        tls: TlsConfig::default(),
        channel_size: 64,
        enable_cache: false,
        cache: CacheConfig::default(),
        logging: LoggingConfig::default(),
        identification: Identification {
            ingester_name: "test-ingester".to_string(),
            ingester_version: "0.0.0".to_string(),
            ingester_uuid: None,
        },
        rate_limit_bps: 0,
    }
}

#[tokio::test]
async fn happy_path_two_destinations() {
    let a = FakeIndexer::start().await;
    let b = FakeIndexer::start().await;
    let cfg = base_config(&[a.address.clone(), b.address.clone()]);

    let muxer = Muxer::new(cfg, None);
    muxer.start().await.unwrap();
    muxer.wait_for_hot(Duration::from_secs(2)).await.unwrap();

    let tag = muxer.get_tag("default").await.unwrap();
    for i in 0..200u32 {
        muxer
            .write(Timestamp { sec: i as i64, nsec: 0 }, tag, format!("entry-{i}"))
            .await
            .unwrap();
    }

    muxer.sync(Duration::from_secs(5)).await.unwrap();

    let total = a.received_entry_count().await + b.received_entry_count().await;
    assert_eq!(total, 200);

    muxer.close().await.unwrap();
    // Close is idempotent.
    muxer.close().await.unwrap();
}

#[tokio::test]
async fn single_connection_flap_recovers() {
    let a = FakeIndexer::start().await;
    let b = FakeIndexer::start().await;
    let cfg = base_config(&[a.address.clone(), b.address.clone()]);

    let muxer = Muxer::new(cfg, None);
    muxer.start().await.unwrap();
    muxer.wait_for_hot(Duration::from_secs(2)).await.unwrap();
    assert_eq!(muxer.hot().await.unwrap(), 2);

    let tag = muxer.get_tag("default").await.unwrap();
    for i in 0..100u32 {
        muxer
            .write(Timestamp { sec: i as i64, nsec: 0 }, tag, format!("pre-{i}"))
            .await
            .unwrap();
    }
    muxer.sync(Duration::from_secs(5)).await.unwrap();

    a.kill_connections().await;
    // Give the connection task a moment to notice and go dead.
    tokio::time::sleep(Duration::from_millis(200)).await;

    for i in 0..100u32 {
        muxer
            .write(Timestamp { sec: i as i64, nsec: 0 }, tag, format!("post-{i}"))
            .await
            .unwrap();
    }
    muxer.sync(Duration::from_secs(5)).await.unwrap();

    // A's connection task should have reconnected against the still-live
    // listener by now.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(muxer.hot().await.unwrap(), 2);

    let total = a.received_entry_count().await + b.received_entry_count().await;
    assert_eq!(total, 200);

    muxer.close().await.unwrap();
}

#[tokio::test]
async fn all_down_with_file_backed_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ingest_mux::cache::file::FileCache::open(dir.path()).await.unwrap();

    // Nothing is listening on this port.
    let dead_address = "127.0.0.1:1".to_string();
    let mut cfg = base_config(&[dead_address]);
    cfg.enable_cache = true;
    cfg.cache.file_backing_location = dir.path().to_string_lossy().to_string();

    let muxer = Muxer::new(cfg, Some(cache));
    muxer.start().await.unwrap();

    // No connection ever comes up, but the cache is running error-free, so
    // wait_for_hot should still report success.
    muxer.wait_for_hot(Duration::from_secs(1)).await.unwrap();
    assert_eq!(muxer.hot().await.unwrap(), 0);

    let tag = muxer.get_tag("default").await.unwrap();
    for i in 0..50u32 {
        muxer
            .write(Timestamp { sec: i as i64, nsec: 0 }, tag, format!("spooled-{i}"))
            .await
            .unwrap();
    }

    muxer.close().await.unwrap();

    let replayed = ingest_mux::cache::file::FileCache::open(dir.path()).await.unwrap();
    assert_eq!(replayed.count().await.unwrap(), 50);
}

#[tokio::test]
async fn late_tag_negotiation_reaches_every_connection() {
    let a = FakeIndexer::start().await;
    let b = FakeIndexer::start().await;
    let cfg = base_config(&[a.address.clone(), b.address.clone()]);

    let muxer = Muxer::new(cfg, None);
    muxer.start().await.unwrap();
    muxer.wait_for_hot(Duration::from_secs(2)).await.unwrap();

    let tag = muxer.negotiate_tag("extra").await.unwrap();
    assert_eq!(muxer.get_tag("extra").await.unwrap(), tag);

    // Idempotent: negotiating again returns the same id.
    assert_eq!(muxer.negotiate_tag("extra").await.unwrap(), tag);

    muxer
        .write(Timestamp { sec: 0, nsec: 0 }, tag, "late-tag-entry")
        .await
        .unwrap();
    muxer.sync(Duration::from_secs(5)).await.unwrap();

    assert!(a.remote_tag_id("extra").await.is_some());
    assert!(b.remote_tag_id("extra").await.is_some());
    assert_eq!(a.received_entry_count().await + b.received_entry_count().await, 1);

    muxer.close().await.unwrap();
}
