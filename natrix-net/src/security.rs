use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use rustls_platform_verifier::Verifier;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{
    client::TlsStream,
    rustls::{self, pki_types::ServerName, version::TLS13, ClientConfig},
    TlsConnector,
};

/// A byte stream that may have been upgraded to TLS
#[derive(Debug)]
#[expect(
    clippy::large_enum_variant,
    reason = "using TLS is the recommended thing, we do not want to affect it"
)]
pub enum ConnectionSecurity<S> {
    Plain(S),
    Tls(TlsStream<S>),
}

/// Build the TLS connector used to secure connections
///
/// TLS 1.3 only, with certificates checked against the platform
/// verifier and no client authentication.
#[must_use]
pub fn tls_connector() -> TlsConnector {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    TlsConnector::from(Arc::new(
        ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&[&TLS13])
            .expect("the ring provider supports TLS 1.3")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(
                Verifier::new(provider).expect("the ring provider supports the platform verifier"),
            ))
            .with_no_client_auth(),
    ))
}

impl<S> ConnectionSecurity<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Upgrade a plaintext stream to TLS
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS handshake fails.
    ///
    /// # Panics
    ///
    /// Panics if the stream has already been upgraded.
    pub async fn upgrade_tls(
        self,
        connector: &TlsConnector,
        domain: ServerName<'static>,
    ) -> io::Result<Self> {
        let conn = match self {
            Self::Plain(conn) => conn,
            Self::Tls(_) => unreachable!("trying to upgrade to Tls a Tls connection"),
        };

        let conn = connector.connect(domain, conn).await?;
        Ok(Self::Tls(conn))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl<S> AsyncRead for ConnectionSecurity<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(conn) => Pin::new(conn).poll_read(cx, buf),
            Self::Tls(conn) => Pin::new(conn).poll_read(cx, buf),
        }
    }
}

impl<S> AsyncWrite for ConnectionSecurity<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(conn) => Pin::new(conn).poll_write(cx, buf),
            Self::Tls(conn) => Pin::new(conn).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(conn) => Pin::new(conn).poll_flush(cx),
            Self::Tls(conn) => Pin::new(conn).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(conn) => Pin::new(conn).poll_shutdown(cx),
            Self::Tls(conn) => Pin::new(conn).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(conn) => Pin::new(conn).poll_write_vectored(cx, bufs),
            Self::Tls(conn) => Pin::new(conn).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Plain(conn) => conn.is_write_vectored(),
            Self::Tls(conn) => conn.is_write_vectored(),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

    use super::ConnectionSecurity;

    #[tokio::test]
    async fn plain_passthrough() {
        let (socket, mut peer) = io::duplex(64);
        let mut conn = ConnectionSecurity::Plain(socket);
        assert!(!conn.is_tls());

        conn.write_all(b"ping").await.unwrap();
        conn.flush().await.unwrap();

        let mut buf = [0; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(b"ping", &buf);

        peer.write_all(b"pong").await.unwrap();
        let mut buf = [0; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(b"pong", &buf);
    }

    #[tokio::test]
    async fn plain_shutdown_reaches_the_peer() {
        let (socket, mut peer) = io::duplex(64);
        let mut conn = ConnectionSecurity::Plain(socket);

        conn.shutdown().await.unwrap();

        let mut buf = Vec::new();
        assert_eq!(0, peer.read_to_end(&mut buf).await.unwrap());
    }
}
