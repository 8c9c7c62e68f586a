// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Token-bucket rate limiting for a connection's socket (`rate_limit_bps`
//! in configuration), attached by [`crate::mux::connection_task`] when
//! configured. Only writes (the egress path to the indexer) are throttled;
//! reads pass straight through.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A simple leaky/token bucket: `capacity` bytes refilled at `rate` bytes/sec.
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_bps: u64) -> Self {
        let rate = rate_bps as f64;
        Self {
            rate,
            capacity: rate.max(1.0),
            tokens: rate.max(1.0),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Returns the number of bytes (> 0) that may be sent right now, or the
    /// duration to wait for at least one token if the bucket is empty. A
    /// zero rate means "unlimited" — every write is let through untouched.
    fn take(&mut self, requested: usize) -> Result<usize, Duration> {
        if self.rate <= 0.0 {
            return Ok(requested);
        }
        self.refill();
        if self.tokens >= 1.0 {
            let allowed = (self.tokens.floor() as usize).min(requested.max(1));
            self.tokens -= allowed as f64;
            Ok(allowed)
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64((deficit / self.rate).max(0.001)))
        }
    }
}

/// Wraps an `AsyncRead + AsyncWrite` stream and throttles the byte rate of
/// writes performed through it.
pub struct RateLimiter<S> {
    inner: S,
    bucket: TokenBucket,
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl<S> RateLimiter<S> {
    pub fn new(inner: S, rate_bps: u64) -> Self {
        Self {
            inner,
            bucket: TokenBucket::new(rate_bps),
            sleep: None,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RateLimiter<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RateLimiter<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if let Some(sleep) = this.sleep.as_mut() {
            match sleep.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => this.sleep = None,
            }
        }

        match this.bucket.take(buf.len()) {
            Ok(allowed) => {
                let slice = &buf[..allowed.min(buf.len())];
                Pin::new(&mut this.inner).poll_write(cx, slice)
            },
            Err(wait) => {
                let mut sleep = Box::pin(tokio::time::sleep(wait));
                let poll = sleep.as_mut().poll(cx);
                this.sleep = Some(sleep);
                debug_assert!(matches!(poll, Poll::Pending));
                Poll::Pending
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    #[tokio::test]
    async fn throttles_large_writes() {
        let (client, mut server) = duplex(1024);
        let mut limited = RateLimiter::new(client, 64);

        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 256];
            let mut total = 0;
            while total < 256 {
                let n = server.read(&mut buf[total..]).await.unwrap();
                if n == 0 {
                    break;
                }
                total += n;
            }
            total
        });

        let payload = vec![7u8; 256];
        let start = Instant::now();
        limited.write_all(&payload).await.unwrap();
        limited.flush().await.unwrap();
        let elapsed = start.elapsed();

        let total = reader.await.unwrap();
        assert_eq!(total, 256);
        assert!(elapsed >= Duration::from_millis(500), "elapsed={elapsed:?}");
    }
}
