//! TCP collector session plumbing.
//!
//! Supplies the connected stream for a collector session: timeout-bounded
//! connect, TCP keepalive, optional DSCP marking, and the plain/TLS stream
//! unification. The read loop itself lives with the session owner; this
//! module only hands out the stream and its options.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::error::{Result, TransportError};
use crate::tls::TlsClient;

/// Maximum bytes handed to the reader per chunk.
pub const MAX_READ_SIZE: usize = 4096;

/// Socket options applied to a collector connection.
#[derive(Debug, Clone)]
pub struct TcpOptions {
    /// Socket-level connect timeout.
    pub connect_timeout: Duration,
    /// Idle time before the first keepalive probe.
    pub keepalive_idle: Duration,
    /// Interval between keepalive probes.
    pub keepalive_interval: Duration,
    /// Probes sent before the peer is declared dead.
    pub keepalive_probes: u32,
    /// DSCP value for outgoing packets (0 disables marking).
    pub dscp: u8,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keepalive_idle: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(3),
            keepalive_probes: 5,
            dscp: 0,
        }
    }
}

/// A connected collector stream, plain or TLS.
pub enum SessionStream {
    /// Plain TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl std::fmt::Debug for SessionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStream::Plain(_) => f.write_str("SessionStream::Plain"),
            SessionStream::Tls(_) => f.write_str("SessionStream::Tls"),
        }
    }
}

/// Read half of a split [`SessionStream`].
pub type SessionReadHalf = tokio::io::ReadHalf<SessionStream>;
/// Write half of a split [`SessionStream`].
pub type SessionWriteHalf = tokio::io::WriteHalf<SessionStream>;

impl SessionStream {
    /// Splits the stream into independently owned read and write halves.
    pub fn into_split(self) -> (SessionReadHalf, SessionWriteHalf) {
        tokio::io::split(self)
    }
}

impl AsyncRead for SessionStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            SessionStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::result::Result<usize, std::io::Error>> {
        match &mut *self {
            SessionStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        match &mut *self {
            SessionStream::Plain(s) => Pin::new(s).poll_flush(cx),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        match &mut *self {
            SessionStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connects to `addr` (`host:port`), applies socket options, and optionally
/// wraps the stream in TLS.
pub async fn connect(
    addr: &str,
    options: &TcpOptions,
    tls: Option<&TlsClient>,
) -> Result<SessionStream> {
    let timeout_ms = options.connect_timeout.as_millis() as u64;
    let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::ConnectionTimeout {
            addr: addr.to_string(),
            timeout_ms,
        })?
        .map_err(TransportError::IoError)?;
    stream.set_nodelay(true).map_err(TransportError::IoError)?;
    apply_socket_options(&stream, options)?;
    tracing::debug!(addr, "collector TCP connected");

    match tls {
        None => Ok(SessionStream::Plain(stream)),
        Some(client) => {
            let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
            let tls_stream = client.connect(host, stream).await?;
            tracing::debug!(addr, "collector TLS established");
            Ok(SessionStream::Tls(Box::new(tls_stream)))
        }
    }
}

fn apply_socket_options(stream: &TcpStream, options: &TcpOptions) -> Result<()> {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(options.keepalive_idle)
        .with_interval(options.keepalive_interval)
        .with_retries(options.keepalive_probes);
    sock.set_tcp_keepalive(&keepalive)
        .map_err(TransportError::IoError)?;
    if options.dscp != 0 {
        // setsockopt expects the DSCP value in the upper six bits of TOS.
        sock.set_tos((options.dscp as u32) << 2)
            .map_err(TransportError::IoError)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_default_options() {
        let options = TcpOptions::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(5));
        assert_eq!(options.keepalive_idle, Duration::from_secs(15));
        assert_eq!(options.keepalive_interval, Duration::from_secs(3));
        assert_eq!(options.keepalive_probes, 5);
        assert_eq!(options.dscp, 0);
    }

    #[tokio::test]
    async fn test_connect_and_echo() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let stream = connect(&addr, &TcpOptions::default(), None).await.unwrap();
        let (mut read, mut write) = stream.into_split();
        write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = connect(&addr, &TcpOptions::default(), None).await;
        assert!(result.is_err());
    }
}
