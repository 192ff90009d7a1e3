//! Connection protocol sniffing
//!
//! Peeks the first byte of a fresh connection to pick the line protocol or
//! the HTTP/upgrade path, then hands the byte back through [`Rewind`] so the
//! chosen handler sees the stream exactly as the peer sent it.
//!
//! Only the first byte is inspected: a line client whose first character is
//! `G` lands on the HTTP path and is rejected by the upgrade probe.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Which handler a connection is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Raw-socket line protocol
    Line,
    /// HTTP request (upgrade or static page)
    Http,
}

impl Protocol {
    /// Route on the first byte alone
    pub fn from_first_byte(byte: u8) -> Self {
        if byte == b'G' {
            Protocol::Http
        } else {
            Protocol::Line
        }
    }
}

/// Stream decorator that replays already consumed bytes before reading on
#[derive(Debug)]
pub struct Rewind<S> {
    pre: Option<Vec<u8>>,
    inner: S,
}

impl<S> Rewind<S> {
    /// Wrap `inner`, yielding `pre` to the first reads
    pub fn new(pre: Vec<u8>, inner: S) -> Self {
        let pre = if pre.is_empty() { None } else { Some(pre) };
        Self { pre, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(mut pre) = this.pre.take() {
            if buf.remaining() == 0 {
                this.pre = Some(pre);
                return Poll::Ready(Ok(()));
            }
            let n = pre.len().min(buf.remaining());
            buf.put_slice(&pre[..n]);
            if n < pre.len() {
                pre.drain(..n);
                this.pre = Some(pre);
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Read one byte and decide the protocol
///
/// A peer that closes before sending anything yields `UnexpectedEof`.
pub async fn sniff<S>(mut stream: S) -> io::Result<(Protocol, Rewind<S>)>
where
    S: AsyncRead + Unpin,
{
    let first = stream.read_u8().await?;
    Ok((Protocol::from_first_byte(first), Rewind::new(vec![first], stream)))
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_routes_on_first_byte() {
        let (protocol, _) = sniff(&b"GET / HTTP/1.1\r\n"[..]).await.unwrap();
        assert_eq!(protocol, Protocol::Http);

        let (protocol, _) = sniff(&b"alice\n"[..]).await.unwrap();
        assert_eq!(protocol, Protocol::Line);

        // Known ambiguity: a line client typing a leading 'G'
        let (protocol, _) = sniff(&b"Gabriel\n"[..]).await.unwrap();
        assert_eq!(protocol, Protocol::Http);
    }

    #[tokio::test]
    async fn test_replay_is_byte_identical() {
        let input = b"GET /ws HTTP/1.1\r\nHost: x\r\n\r\n";
        let (_, mut stream) = sniff(&input[..]).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn test_replay_with_one_byte_reads() {
        let (_, mut stream) = sniff(&b"xyz"[..]).await.unwrap();
        assert_eq!(stream.read_u8().await.unwrap(), b'x');
        assert_eq!(stream.read_u8().await.unwrap(), b'y');
        assert_eq!(stream.read_u8().await.unwrap(), b'z');
        assert!(stream.read_u8().await.is_err());
    }

    #[tokio::test]
    async fn test_empty_connection_fails() {
        let err = sniff(&b""[..]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_writes_pass_through() {
        let (client, server) = duplex(64);
        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        client_wr.write_all(b"hi").await.unwrap();

        let (_, mut stream) = sniff(server).await.unwrap();
        stream.write_all(b"pong").await.unwrap();

        let mut buf = [0u8; 4];
        client_rd.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
