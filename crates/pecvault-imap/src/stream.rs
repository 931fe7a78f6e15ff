//! Stream types for IMAP connections.

#![allow(clippy::missing_errors_doc)]

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::{Error, Result};

/// A stream that can be either plaintext or TLS.
pub enum ImapStream {
    /// Plaintext TCP stream (tests and local servers only).
    Plain(TcpStream),
    /// TLS-encrypted stream (boxed to reduce enum size).
    Tls(Box<TlsStream<TcpStream>>),
}

impl ImapStream {
    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Creates a TLS connector with default root certificates.
pub fn create_tls_connector() -> Result<TlsConnector> {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Connects to a server with TLS from the start.
pub async fn connect_tls(host: &str, port: u16) -> Result<ImapStream> {
    let addr = format!("{host}:{port}");
    let tcp = TcpStream::connect(&addr).await?;

    let connector = create_tls_connector()?;
    let server_name = ServerName::try_from(host.to_string())?;
    let tls = connector.connect(server_name, tcp).await?;

    Ok(ImapStream::Tls(Box::new(tls)))
}

/// Connects to a server without TLS (for testing against local servers).
pub async fn connect_plain(host: &str, port: u16) -> Result<ImapStream> {
    let addr = format!("{host}:{port}");
    let tcp = TcpStream::connect(&addr).await?;
    Ok(ImapStream::Plain(tcp))
}

/// Connects according to the security mode in `config`, honoring the
/// connect timeout.
pub async fn connect(config: &crate::Config) -> Result<ImapStream> {
    let fut = async {
        match config.security {
            crate::Security::Implicit => connect_tls(&config.host, config.port).await,
            crate::Security::None => connect_plain(&config.host, config.port).await,
        }
    };

    tokio::time::timeout(config.connect_timeout, fut)
        .await
        .map_err(|_| Error::Timeout(config.connect_timeout))?
}
