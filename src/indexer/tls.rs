// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TLS-wrapped [`IndexerConnection`]. Same correlation/read-loop structure as
//! [`super::tcp::TcpIndexerConnection`], but the stream is a
//! `tokio_rustls::client::TlsStream<TcpStream>` instead of a bare `TcpStream`.
//! Certificate material comes from the muxer's config
//! (`public_key`/`private_key`/`verify_cert`); an `Arc<rustls::ClientConfig>`
//! is built once by [`crate::cfg`] and handed to every connection.

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
use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf, split},
    net::TcpStream,
    sync::{Mutex, oneshot},
};
use tokio_rustls::{TlsConnector, client::TlsStream};
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

type Stream = TlsStream<TcpStream>;

#[derive(Clone)]
enum OutstandingWrite {
    One(WireEntry),
    Many(Vec<WireEntry>),
}

/// A TLS connection to one indexer, verified (or not, per `verify_cert`)
/// against `tls_config`.
pub struct TlsIndexerConnection {
    tls_config: Arc<rustls::ClientConfig>,
    rate_limit_bps: u64,
    reader: Mutex<Option<ReadHalf<Stream>>>,
    writer: Mutex<Option<RateLimiter<WriteHalf<Stream>>>>,
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

impl std::fmt::Debug for TlsIndexerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIndexerConnection").finish_non_exhaustive()
    }
}

impl TlsIndexerConnection {
    pub fn new(tls_config: Arc<rustls::ClientConfig>, rate_limit_bps: u64) -> Arc<Self> {
        let (error_tx, error_rx) = oneshot::channel();
        let conn = Arc::new(Self {
            tls_config,
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
impl IndexerConnection for TlsIndexerConnection {
    async fn initialize(
        &self,
        address: &str,
        secret: &str,
        tags: &[String],
    ) -> Result<(), ConnectError> {
        if tags.is_empty() {
            return Err(ConnectError::Fatal("empty tag set".to_string()));
        }

        let tcp = TcpStream::connect(address)
            .await
            .map_err(|e| ConnectError::Transient(e.into()))?;
        tcp.set_nodelay(true)
            .map_err(|e| ConnectError::Transient(e.into()))?;
        let local = tcp.local_addr().ok().map(|a| a.ip());

        let host = address
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(address)
            .to_string();
        let server_name = ServerName::try_from(host)
            .map_err(|e| ConnectError::Fatal(format!("invalid server name: {e}")))?;

        let connector = TlsConnector::from(self.tls_config.clone());
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ConnectError::Transient(e.into()))?;
        let (r, w) = split(Stream::Client(stream));

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
            let _ = w.shutdown().await;
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

/// Builds the shared `rustls::ClientConfig` from the muxer's TLS config
/// surface. When `verify_cert` is `false` this installs a
/// verifier that accepts any server certificate; only meant for lab/dev use
/// against self-signed indexers, matching the original's `InsecureSkipVerify`
/// knob.
pub mod config {
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use rustls::{
        ClientConfig, DigitallySignedStruct, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    };

    #[derive(Debug)]
    struct NoVerify;

    impl ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ED25519,
                SignatureScheme::RSA_PSS_SHA256,
            ]
        }
    }

    /// `public_key`/`private_key` are optional client certificate material
    /// (mutual TLS); when absent the client presents no certificate.
    pub fn build_client_config(
        public_key: Option<&str>,
        private_key: Option<&str>,
        verify_cert: bool,
    ) -> Result<Arc<ClientConfig>> {
        let builder = ClientConfig::builder();

        let builder = if verify_cert {
            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_native_certs::load_native_certs().certs {
                let _ = roots.add(cert);
            }
            builder.with_root_certificates(roots)
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerify))
        };

        let config = match (public_key, private_key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_key(key_path)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .context("building client auth certificate")?
            },
            _ => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }

    fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
        let data = std::fs::read(path).with_context(|| format!("reading certificate {path}"))?;
        rustls_pemfile::certs(&mut data.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("parsing certificate {path}"))
    }

    fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
        let data = std::fs::read(path).with_context(|| format!("reading private key {path}"))?;
        rustls_pemfile::private_key(&mut data.as_slice())
            .with_context(|| format!("parsing private key {path}"))?
            .context("no private key found in file")
    }
}
