//! Client transports.

use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::server::TlsStream;

use super::codec::PacketIo;
use super::tls::{TlsAcceptor, TlsInfo};
use crate::error::Result;

/// Replays bytes that were buffered before a protocol switch, then reads
/// from the inner stream.
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
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

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// The transport a connection runs over. TLS wraps whatever came before it.
pub enum ConnStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    /// In-process pipe, used by embedders and tests.
    Memory(DuplexStream),
    Tls(Box<TlsStream<Rewind<ConnStream>>>),
    /// Placeholder while the stream is moved into a TLS session.
    Detached,
}

impl ConnStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, ConnStream::Tls(_))
    }

    pub fn is_unix_socket(&self) -> bool {
        match self {
            #[cfg(unix)]
            ConnStream::Unix(_) => true,
            ConnStream::Tls(tls) => tls.get_ref().0.inner().is_unix_socket(),
            _ => false,
        }
    }

    /// UID of the process on the other end of a unix socket.
    pub fn peer_uid(&self) -> Option<u32> {
        match self {
            #[cfg(unix)]
            ConnStream::Unix(s) => s.peer_cred().ok().map(|cred| cred.uid()),
            ConnStream::Tls(tls) => tls.get_ref().0.inner().peer_uid(),
            _ => None,
        }
    }

    pub fn tls_info(&self) -> Option<TlsInfo> {
        match self {
            ConnStream::Tls(tls) => {
                let conn = tls.get_ref().1;
                let version = match conn.protocol_version() {
                    Some(rustls::ProtocolVersion::TLSv1_2) => "TLSv1.2".to_string(),
                    Some(rustls::ProtocolVersion::TLSv1_3) => "TLSv1.3".to_string(),
                    Some(other) => format!("{:?}", other),
                    None => String::new(),
                };
                let cipher = conn
                    .negotiated_cipher_suite()
                    .map(|cs| format!("{:?}", cs.suite()))
                    .unwrap_or_default();
                Some(TlsInfo { version, cipher })
            }
            _ => None,
        }
    }

    fn detached() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "stream detached")
    }
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            ConnStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            ConnStream::Memory(s) => Pin::new(s).poll_read(cx, buf),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            ConnStream::Detached => Poll::Ready(Err(Self::detached())),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            ConnStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            ConnStream::Memory(s) => Pin::new(s).poll_write(cx, buf),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            ConnStream::Detached => Poll::Ready(Err(Self::detached())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            ConnStream::Unix(s) => Pin::new(s).poll_flush(cx),
            ConnStream::Memory(s) => Pin::new(s).poll_flush(cx),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            ConnStream::Detached => Poll::Ready(Err(Self::detached())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            ConnStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            ConnStream::Memory(s) => Pin::new(s).poll_shutdown(cx),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            ConnStream::Detached => Poll::Ready(Ok(())),
        }
    }
}

impl PacketIo<ConnStream> {
    /// Run the TLS server handshake over the current transport. Bytes the
    /// codec has already pulled off the socket are replayed into the TLS
    /// session first, so nothing the client sent after the SSLRequest is lost.
    pub async fn upgrade_to_tls(&mut self, acceptor: &TlsAcceptor) -> Result<()> {
        let (plain, buffered) = self.swap_stream(ConnStream::Detached);
        let tls = acceptor.accept_stream(Rewind::new(buffered, plain)).await?;
        self.set_stream(ConnStream::Tls(Box::new(tls)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_rewind_replays_prefix_before_inner() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b" world").await.unwrap();
        drop(client);

        let mut rewind = Rewind::new(Bytes::from_static(b"hello"), server);
        let mut out = String::new();
        rewind.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_detached_stream_errors() {
        let mut stream = ConnStream::Detached;
        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(!stream.is_tls());
        assert!(!stream.is_unix_socket());
        assert_eq!(stream.peer_uid(), None);
    }
}
