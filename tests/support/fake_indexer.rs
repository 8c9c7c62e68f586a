// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A minimal in-process indexer implementing the wire protocol in
//! `ingest_mux::indexer::protocol`, used to drive [`ingest_mux::Muxer`]
//! through real TCP connections in integration tests rather than faking the
//! `IndexerConnection` trait directly.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use ingest_mux::indexer::protocol::{ControlMessage, Envelope, read_frame, write_frame};
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub struct FakeIndexer {
    pub address: String,
    received: Arc<Mutex<Vec<ControlMessage>>>,
    tag_registry: Arc<Mutex<HashMap<String, u32>>>,
    conns: Arc<Mutex<Vec<CancellationToken>>>,
    accept_task: JoinHandle<()>,
}

impl FakeIndexer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake indexer");
        let address = listener.local_addr().expect("local addr").to_string();

        let received = Arc::new(Mutex::new(Vec::new()));
        let tag_registry = Arc::new(Mutex::new(HashMap::from([("gravwell".to_string(), 0u32)])));
        let next_remote_id = Arc::new(AtomicU32::new(1));
        let conns: Arc<Mutex<Vec<CancellationToken>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_received = received.clone();
        let accept_registry = tag_registry.clone();
        let accept_next_id = next_remote_id.clone();
        let accept_conns = conns.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let token = CancellationToken::new();
                accept_conns.lock().await.push(token.clone());
                let received = accept_received.clone();
                let registry = accept_registry.clone();
                let next_id = accept_next_id.clone();
                tokio::spawn(handle_connection(stream, token, received, registry, next_id));
            }
        });

        Self {
            address,
            received,
            tag_registry,
            conns,
            accept_task,
        }
    }

    /// Forcibly drops every currently-open connection, simulating a dead
    /// destination. The listener keeps accepting, so a reconnecting
    /// `ConnectionTask` succeeds again on its next attempt.
    pub async fn kill_connections(&self) {
        let tokens: Vec<_> = self.conns.lock().await.drain(..).collect();
        for t in tokens {
            t.cancel();
        }
    }

    pub async fn received_entry_count(&self) -> usize {
        self.received
            .lock()
            .await
            .iter()
            .map(|m| match m {
                ControlMessage::WriteEntry { .. } => 1,
                ControlMessage::WriteBatch { entries } => entries.len(),
                _ => 0,
            })
            .sum()
    }

    pub async fn remote_tag_id(&self, name: &str) -> Option<u32> {
        self.tag_registry.lock().await.get(name).copied()
    }
}

impl Drop for FakeIndexer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    token: CancellationToken,
    received: Arc<Mutex<Vec<ControlMessage>>>,
    registry: Arc<Mutex<HashMap<String, u32>>>,
    next_id: Arc<AtomicU32>,
) {
    let (mut r, mut w) = stream.into_split();

    loop {
        let env = tokio::select! {
            _ = token.cancelled() => return,
            env = read_frame(&mut r) => match env {
                Ok(env) => env,
                Err(_) => return,
            },
        };

        let reply = match env.msg {
            ControlMessage::Hello { tags, .. } => {
                let mut reg = registry.lock().await;
                for tag in &tags {
                    if !reg.contains_key(tag) {
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        reg.insert(tag.clone(), id);
                    }
                }
                Some(ControlMessage::HelloAck)
            },
            ControlMessage::Identify { .. } => Some(ControlMessage::Ack),
            ControlMessage::IngestOkQuery => Some(ControlMessage::IngestOkReply { ok: true }),
            ControlMessage::NegotiateTag { name } => {
                let mut reg = registry.lock().await;
                let id = *reg.entry(name).or_insert_with(|| next_id.fetch_add(1, Ordering::Relaxed));
                Some(ControlMessage::NegotiateTagReply { tag: id })
            },
            ControlMessage::GetTag { name } => {
                let reg = registry.lock().await;
                Some(ControlMessage::GetTagReply { tag: reg.get(&name).copied() })
            },
            ControlMessage::WriteEntry { entry } => {
                received.lock().await.push(ControlMessage::WriteEntry { entry });
                Some(ControlMessage::Ack)
            },
            ControlMessage::WriteBatch { entries } => {
                received.lock().await.push(ControlMessage::WriteBatch { entries });
                Some(ControlMessage::Ack)
            },
            ControlMessage::Sync => Some(ControlMessage::Ack),
            _ => None,
        };

        if let Some(msg) = reply {
            let out = Envelope { id: env.id, msg };
            if write_frame(&mut w, &out).await.is_err() {
                return;
            }
        }
    }
}
