//! Frame-level input and output: the connection handshake, the fixed
//! frame boundary, and recovery after a poisoned message body.
//!
//! Every frame on the wire is `[Header][body][MSG_BOUNDARY]`. The
//! boundary buys nothing while both peers agree on framing, but after a
//! body fails to decode it is the landmark that lets the dispatcher
//! resynchronize instead of tearing the connection down.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use rand_core::{OsRng, RngCore};

use crate::cluster::communication::message::Header;
use crate::cluster::error::*;

/// Length of the cluster cookie exchanged when a connection is opened.
pub const HDR_COOKIE_LEN: usize = 16;

/// Length of the advisory version string that follows the cookie.
pub const HDR_VERSION_LEN: usize = 16;

/// Fixed sentinel terminating every frame.
pub const MSG_BOUNDARY: [u8; 16] = [
    0x7f, 0x43, 0x56, 0x4e, 0xa9, 0x1c, 0x08, 0xe6, 0x5d, 0x32, 0xbb, 0x60, 0xf4, 0x2a, 0x91, 0x0d,
];

/// Bodies larger than this are assumed to come from a broken or
/// hostile peer, and poison the frame they arrive in.
pub const MAX_BODY_LEN: u64 = 256 * 1024 * 1024;

/// The shared secret admitting a peer into the cluster.
///
/// Compared whole on every accepted connection; any mismatch closes
/// the stream before a single frame is read.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Cookie([u8; HDR_COOKIE_LEN]);

impl Cookie {
    /// Draws a fresh random cookie from the operating system.
    pub fn random() -> Self {
        let mut inner = [0; HDR_COOKIE_LEN];
        OsRng.fill_bytes(&mut inner[..]);
        Cookie(inner)
    }

    /// Builds a cookie from raw bytes.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < HDR_COOKIE_LEN {
            return Err("Cookie has an invalid length").wrapped(ErrorKind::CommunicationFraming);
        }
        let mut inner = [0; HDR_COOKIE_LEN];
        inner.copy_from_slice(&raw_bytes[..HDR_COOKIE_LEN]);
        Ok(Cookie(inner))
    }
}

impl AsRef<[u8]> for Cookie {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never leak the secret into logs
        write!(f, "Cookie(..)")
    }
}

/// Returns this build's version, padded to `HDR_VERSION_LEN` bytes.
pub fn version_bytes() -> [u8; HDR_VERSION_LEN] {
    let mut buf = [0; HDR_VERSION_LEN];
    let version = env!("CARGO_PKG_VERSION").as_bytes();
    let n = version.len().min(HDR_VERSION_LEN);
    buf[..n].copy_from_slice(&version[..n]);
    buf
}

/// Writes the handshake preamble on a freshly opened connection:
/// the cluster cookie followed by this build's version.
pub async fn write_handshake<W>(w: &mut W, cookie: &Cookie) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(cookie.as_ref())
        .await
        .wrapped(ErrorKind::CommunicationFraming)?;
    w.write_all(&version_bytes()[..])
        .await
        .wrapped(ErrorKind::CommunicationFraming)?;
    w.flush().await.wrapped(ErrorKind::CommunicationFraming)
}

/// Reads the handshake preamble written by the peer that opened the
/// connection, returning its cookie and advisory version.
pub async fn read_handshake<R>(r: &mut R) -> Result<(Cookie, String)>
where
    R: AsyncRead + Unpin,
{
    let mut cookie = [0; HDR_COOKIE_LEN];
    r.read_exact(&mut cookie[..])
        .await
        .wrapped(ErrorKind::CommunicationFraming)?;
    let mut version = [0; HDR_VERSION_LEN];
    r.read_exact(&mut version[..])
        .await
        .wrapped(ErrorKind::CommunicationFraming)?;
    let version = String::from_utf8_lossy(&version[..])
        .trim_end_matches('\0')
        .to_owned();
    Ok((Cookie(cookie), version))
}

/// Writes one complete frame: header, body, boundary.
pub async fn write_frame<W>(w: &mut W, header: &Header, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = [0; Header::LENGTH];
    header.serialize_into(&mut buf[..])?;
    w.write_all(&buf[..])
        .await
        .wrapped(ErrorKind::CommunicationFraming)?;
    w.write_all(body)
        .await
        .wrapped(ErrorKind::CommunicationFraming)?;
    w.write_all(&MSG_BOUNDARY[..])
        .await
        .wrapped(ErrorKind::CommunicationFraming)?;
    w.flush().await.wrapped(ErrorKind::CommunicationFraming)
}

/// Reads one frame header.
pub async fn read_header<R>(r: &mut R) -> Result<Header>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0; Header::LENGTH];
    r.read_exact(&mut buf[..])
        .await
        .wrapped(ErrorKind::CommunicationFraming)?;
    Header::deserialize_from(&buf[..])
}

/// Reads the body announced by a frame header.
pub async fn read_body<R>(r: &mut R, length: u64) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut body = vec![0; length as usize];
    r.read_exact(&mut body[..])
        .await
        .wrapped(ErrorKind::CommunicationFraming)?;
    Ok(body)
}

/// Reads the boundary terminating a well-formed frame.
pub async fn read_boundary<R>(r: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0; MSG_BOUNDARY.len()];
    r.read_exact(&mut buf[..])
        .await
        .wrapped(ErrorKind::CommunicationFraming)?;
    if buf != MSG_BOUNDARY {
        return Err("Lost framing after a complete message").wrapped(ErrorKind::CommunicationFraming);
    }
    Ok(())
}

/// Scans forward until the frame boundary is found, one byte at a
/// time. Called after a body fails to decode; reaching EOF while
/// scanning means the connection is dead.
pub async fn resync_to_boundary<R>(r: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut window = [0; MSG_BOUNDARY.len()];
    r.read_exact(&mut window[..])
        .await
        .wrapped(ErrorKind::CommunicationFraming)?;
    loop {
        if window == MSG_BOUNDARY {
            return Ok(());
        }
        let mut byte = [0; 1];
        r.read_exact(&mut byte[..])
            .await
            .wrapped(ErrorKind::CommunicationFraming)?;
        window.rotate_left(1);
        window[MSG_BOUNDARY.len() - 1] = byte[0];
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use futures::io::AsyncWriteExt;

    use super::*;
    use crate::cluster::communication::message::{Rrid, WireMessage};
    use crate::cluster::communication::socket::mem;
    use crate::cluster::communication::WorkerId;

    #[test]
    fn test_handshake_roundtrip() {
        block_on(async {
            let (mut left, mut right) = mem::duplex();
            let cookie = Cookie::random();
            write_handshake(&mut left, &cookie)
                .await
                .expect("Handshake write failed");
            let (peer_cookie, version) = read_handshake(&mut right)
                .await
                .expect("Handshake read failed");
            assert!(peer_cookie == cookie);
            assert_eq!(version, env!("CARGO_PKG_VERSION"));
        });
    }

    #[test]
    fn test_frame_roundtrip() {
        block_on(async {
            let (mut left, mut right) = mem::duplex();
            let wm = WireMessage::new(WorkerId::from(1u32), Rrid::NULL, Rrid::NULL, b"payload");
            write_frame(&mut left, wm.header(), wm.body())
                .await
                .expect("Frame write failed");

            let header = read_header(&mut right).await.expect("Header read failed");
            assert_eq!(header.length(), 7);
            let body = read_body(&mut right, header.length())
                .await
                .expect("Body read failed");
            assert_eq!(&body[..], b"payload");
            read_boundary(&mut right).await.expect("Boundary read failed");
        });
    }

    #[test]
    fn test_resync_skips_garbage() {
        block_on(async {
            let (mut left, mut right) = mem::duplex();
            // garbage prefix sharing bytes with the boundary, then the
            // real sentinel, then a byte of the next frame
            left.write_all(&MSG_BOUNDARY[..8]).await.unwrap();
            left.write_all(b"noise").await.unwrap();
            left.write_all(&MSG_BOUNDARY[..]).await.unwrap();
            left.write_all(&[0xaa]).await.unwrap();

            resync_to_boundary(&mut right).await.expect("Resync failed");

            // the byte after the boundary must still be readable
            let mut next = [0; 1];
            use futures::io::AsyncReadExt;
            right.read_exact(&mut next[..]).await.unwrap();
            assert_eq!(next[0], 0xaa);
        });
    }

    #[test]
    fn test_resync_reports_dead_connection() {
        block_on(async {
            let (mut left, mut right) = mem::duplex();
            left.write_all(b"short").await.unwrap();
            drop(left);
            assert!(resync_to_boundary(&mut right).await.is_err());
        });
    }
}
