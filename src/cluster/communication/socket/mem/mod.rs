//! In-memory duplex streams.
//!
//! A pair of cross-wired pipes standing in for a TCP connection, used to
//! wire in-process clusters and to drive the dispatcher in tests. Writes
//! never block; reads suspend until data or EOF arrives. Dropping either
//! endpoint closes both directions, so a vanished peer surfaces as EOF
//! exactly like a dead TCP connection would.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::io::{AsyncRead, AsyncWrite};
use parking_lot::Mutex;

struct Pipe {
    inner: Mutex<PipeInner>,
}

struct PipeInner {
    buf: VecDeque<u8>,
    closed: bool,
    reader: Option<Waker>,
}

impl Pipe {
    fn new() -> Arc<Pipe> {
        Arc::new(Pipe {
            inner: Mutex::new(PipeInner {
                buf: VecDeque::new(),
                closed: false,
                reader: None,
            }),
        })
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        if let Some(waker) = inner.reader.take() {
            waker.wake();
        }
    }
}

/// One endpoint of an in-memory duplex stream.
pub struct MemStream {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
}

/// Creates a pair of connected in-memory streams.
pub fn duplex() -> (MemStream, MemStream) {
    let a = Pipe::new();
    let b = Pipe::new();
    let left = MemStream {
        rx: a.clone(),
        tx: b.clone(),
    };
    let right = MemStream { rx: b, tx: a };
    (left, right)
}

impl AsyncRead for MemStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.rx.inner.lock();
        if !inner.buf.is_empty() {
            let n = buf.len().min(inner.buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inner.buf.pop_front().unwrap_or(0);
            }
            return Poll::Ready(Ok(n));
        }
        if inner.closed {
            return Poll::Ready(Ok(0));
        }
        inner.reader = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for MemStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.tx.inner.lock();
        if inner.closed {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        inner.buf.extend(buf.iter().copied());
        if let Some(waker) = inner.reader.take() {
            waker.wake();
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MemStream {
    fn drop(&mut self) {
        // a dropped endpoint reads as EOF on the peer, and refuses
        // any writes the peer still attempts
        self.tx.close();
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use futures::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn test_duplex_roundtrip() {
        block_on(async {
            let (mut left, mut right) = duplex();
            left.write_all(b"ping").await.expect("Write failed");
            let mut buf = [0; 4];
            right.read_exact(&mut buf).await.expect("Read failed");
            assert_eq!(&buf, b"ping");

            right.write_all(b"pong").await.expect("Write failed");
            left.read_exact(&mut buf).await.expect("Read failed");
            assert_eq!(&buf, b"pong");
        });
    }

    #[test]
    fn test_drop_reads_as_eof() {
        block_on(async {
            let (left, mut right) = duplex();
            drop(left);
            let mut buf = [0; 1];
            let n = right.read(&mut buf).await.expect("Read failed");
            assert_eq!(n, 0);
            assert!(right.write_all(b"x").await.is_err());
        });
    }
}
