//! Bandwidth-capped stream with an idle timeout
//!
//! [`ThrottledStream`] wraps any byte stream. Reads and writes draw from one
//! token bucket refilled at the configured bytes/second; an operation may
//! overdraw the bucket, and the next operation waits until the debt is paid.
//! If no byte crosses the stream for the idle duration, the pending operation
//! fails with [`io::ErrorKind::TimedOut`].

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Token bucket measured in bytes
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec as f64;
        TokenBucket {
            rate,
            tokens: rate,
            last: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
    }

    fn consume(&mut self, n: usize) {
        self.tokens -= n as f64;
    }

    /// How long until the bucket is out of debt
    fn wait(&self) -> Option<Duration> {
        if self.tokens >= 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(-self.tokens / self.rate))
        }
    }
}

/// Stream wrapper enforcing a shared rate cap and an idle timeout
#[derive(Debug)]
pub struct ThrottledStream<S> {
    inner: S,
    bucket: Option<TokenBucket>,
    read_delay: Option<Pin<Box<Sleep>>>,
    write_delay: Option<Pin<Box<Sleep>>>,
    idle_timeout: Option<Duration>,
    idle: Option<Pin<Box<Sleep>>>,
}

impl<S> ThrottledStream<S> {
    /// Wrap `inner`; `bytes_per_sec == 0` disables the cap and a zero
    /// `idle_timeout` disables the timeout
    pub fn new(inner: S, bytes_per_sec: u64, idle_timeout: Duration) -> Self {
        let idle_timeout = (!idle_timeout.is_zero()).then_some(idle_timeout);
        ThrottledStream {
            inner,
            bucket: (bytes_per_sec > 0).then(|| TokenBucket::new(bytes_per_sec)),
            read_delay: None,
            write_delay: None,
            idle_timeout,
            idle: idle_timeout.map(|d| Box::pin(tokio::time::sleep(d))),
        }
    }

    /// Borrow the wrapped stream
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Unwrap the stream
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn touch(&mut self) {
        if let (Some(timeout), Some(idle)) = (self.idle_timeout, self.idle.as_mut()) {
            idle.as_mut().reset(Instant::now() + timeout);
        }
    }

    fn poll_idle(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        match self.idle.as_mut() {
            Some(idle) => match idle.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection idle timeout",
                )),
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Pending,
        }
    }

    fn record(&mut self, n: usize) {
        if n > 0 {
            if let Some(bucket) = self.bucket.as_mut() {
                bucket.consume(n);
            }
            self.touch();
        }
    }
}

/// Park on `delay` while the bucket is in debt
fn poll_bucket(
    bucket: &mut Option<TokenBucket>,
    delay: &mut Option<Pin<Box<Sleep>>>,
    cx: &mut Context<'_>,
) -> Poll<()> {
    let Some(bucket) = bucket.as_mut() else {
        return Poll::Ready(());
    };

    loop {
        if let Some(sleep) = delay.as_mut() {
            match sleep.as_mut().poll(cx) {
                Poll::Ready(()) => *delay = None,
                Poll::Pending => return Poll::Pending,
            }
        }

        bucket.refill();
        match bucket.wait() {
            None => return Poll::Ready(()),
            Some(wait) => *delay = Some(Box::pin(tokio::time::sleep(wait))),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ThrottledStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if poll_bucket(&mut this.bucket, &mut this.read_delay, cx).is_pending() {
            return Poll::Pending;
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                this.record(n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => this.poll_idle(cx).map(Err),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ThrottledStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if poll_bucket(&mut this.bucket, &mut this.write_delay, cx).is_pending() {
            return Poll::Pending;
        }

        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.record(n);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => this.poll_idle(cx).map(Err),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
