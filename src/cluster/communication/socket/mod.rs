//! Abstractions over different socket types of crates in the Rust
//! ecosystem, as well as the in-memory duplex streams used by
//! in-process clusters.

pub mod mem;

#[cfg(feature = "socket_tokio_tcp")]
mod tokio_tcp;

#[cfg(feature = "socket_async_std_tcp")]
mod async_std_tcp;

#[cfg(feature = "socket_tokio_tcp")]
use self::tokio_tcp as imp;

#[cfg(feature = "socket_async_std_tcp")]
use self::async_std_tcp as imp;

use crate::cluster::error::*;

/// Initialize the sockets module.
pub fn init() -> Result<()> {
    Ok(())
}

/// Drops the global data associated with sockets.
///
/// # Safety
/// Must not race with any socket operation.
pub unsafe fn drop() -> Result<()> {
    Ok(())
}

#[cfg(any(feature = "socket_tokio_tcp", feature = "socket_async_std_tcp"))]
pub use self::tcp::{bind, connect, Listener, Socket};

#[cfg(any(feature = "socket_tokio_tcp", feature = "socket_async_std_tcp"))]
mod tcp {
    use std::io;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use futures::io::{AsyncRead, AsyncWrite};

    use super::imp;
    use crate::cluster::error::*;

    /// A `Listener` represents a socket listening on new communications
    /// requests from peer workers.
    pub struct Listener {
        inner: imp::Listener,
    }

    /// A `Socket` represents a connection between two peer processes
    /// in the cluster.
    pub struct Socket {
        inner: imp::Socket,
    }

    /// Creates a new `Listener` socket, bound to the address `addr`.
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> Result<Listener> {
        let inner = imp::bind(addr.into())
            .await
            .wrapped(ErrorKind::CommunicationSocket)?;
        Ok(Listener { inner })
    }

    /// Connects to the remote node pointed to by the address `addr`.
    pub async fn connect<A: Into<SocketAddr>>(addr: A) -> Result<Socket> {
        let inner = imp::connect(addr.into())
            .await
            .wrapped(ErrorKind::CommunicationSocket)?;
        Ok(Socket { inner })
    }

    impl Listener {
        /// Accepts one connection from a peer process.
        pub async fn accept(&self) -> Result<Socket> {
            let inner = self
                .inner
                .accept()
                .await
                .wrapped(ErrorKind::CommunicationSocket)?;
            Ok(Socket { inner })
        }

        /// Returns the local address this listener is bound to.
        pub fn local_addr(&self) -> Result<SocketAddr> {
            self.inner
                .local_addr()
                .wrapped(ErrorKind::CommunicationSocket)
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
}
