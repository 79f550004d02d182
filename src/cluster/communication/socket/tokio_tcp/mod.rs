use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use ::tokio::net::{TcpListener, TcpStream};
use futures::io::{AsyncRead, AsyncWrite};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

pub struct Listener {
    inner: TcpListener,
}

pub struct Socket {
    inner: Compat<TcpStream>,
}

pub async fn bind(addr: SocketAddr) -> io::Result<Listener> {
    let inner = TcpListener::bind(addr).await?;
    Ok(Listener { inner })
}

pub async fn connect(addr: SocketAddr) -> io::Result<Socket> {
    TcpStream::connect(addr).await.map(|inner| {
        // disable nagle's algorithm; frames are flushed whole
        inner.set_nodelay(true).unwrap_or(());
        Socket {
            inner: inner.compat(),
        }
    })
}

impl Listener {
    pub async fn accept(&self) -> io::Result<Socket> {
        self.inner.accept().await.map(|(inner, _)| {
            inner.set_nodelay(true).unwrap_or(());
            Socket {
                inner: inner.compat(),
            }
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}
