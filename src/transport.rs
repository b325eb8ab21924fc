//! Transport session: a TCP socket, optionally wrapped in a TLS session.
//!
//! One `Transport` maps to one physical connection. A TLS session is bound
//! to the socket it was established on and dies with it; dropping the
//! transport closes the file descriptor.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::trace;

use crate::error::{Result, UpstreamError};

/// One physical connection to an upstream endpoint.
#[derive(Debug)]
pub(crate) enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Open a TCP connection to `host:port` and, when a connector is given,
    /// run the TLS handshake on top of it.
    ///
    /// The caller bounds the whole sequence with the connect deadline; this
    /// function itself never times out.
    pub(crate) async fn open(
        host: &str,
        port: u16,
        tls: Option<&(TlsConnector, ServerName<'static>)>,
    ) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(UpstreamError::Connect)?;
        let _ = stream.set_nodelay(true);
        trace!(host, port, tls = tls.is_some(), "tcp connect completed");

        match tls {
            None => Ok(Self::Tcp(stream)),
            Some((connector, name)) => {
                let session = connector
                    .connect(name.clone(), stream)
                    .await
                    .map_err(|e| UpstreamError::TlsHandshake(e.to_string()))?;
                trace!(host, port, "tls handshake completed");
                Ok(Self::Tls(Box::new(session)))
            }
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn plain_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let mut transport = Transport::open(&addr.ip().to_string(), addr.port(), None)
            .await
            .unwrap();
        transport.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        transport.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        transport.shutdown().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_refused_maps_to_connect_error() {
        // Bind then drop to get a port that is very likely closed.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let err = Transport::open(&addr.ip().to_string(), addr.port(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Connect(_)));
    }
}
