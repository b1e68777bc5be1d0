use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::quicssh::error::{TunnelError, TunnelResult};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

pub const DEFAULT_ALPN: &str = "quicssh";
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Application close code used for orderly connection shutdown.
pub const CLOSE_NORMAL: u32 = 0;

/// Liveness and protocol settings shared by both roles.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub alpn: String,
    pub keep_alive: Duration,
    pub idle_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            alpn: DEFAULT_ALPN.to_string(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl TransportOptions {
    pub fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        vec![self.alpn.as_bytes().to_vec()]
    }
}

/// A connection attempt whose handshake has not finished yet.
pub type PendingSession =
    Pin<Box<dyn Future<Output = TunnelResult<Arc<dyn TransportSession>>> + Send>>;

#[async_trait]
pub trait TransportListener: Send + Sync {
    /// Wait for the next connection attempt.
    ///
    /// Returns before the handshake completes; the caller drives the returned
    /// future so a slow peer never holds up the next accept.
    /// `TunnelError::Listen` means the listener is gone; any other error only
    /// concerns the connection attempt that produced it.
    async fn accept(&self) -> TunnelResult<PendingSession>;
    fn local_addr(&self) -> Option<SocketAddr>;
    async fn close(&self);
}

#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> TunnelResult<BoxedStream>;
    async fn accept_stream(&self) -> TunnelResult<BoxedStream>;
    async fn close(&self, code: u32, reason: &str);
    /// Resolves once the connection is gone, for whatever reason.
    async fn closed(&self) -> TunnelError;
    fn remote_addr(&self) -> Option<SocketAddr>;
    /// ALPN identifier agreed during the handshake.
    fn protocol(&self) -> Option<String>;
}

pin_project! {
    /// A read half and a write half presented as one stream.
    pub struct JoinedStream<R, W> {
        #[pin]
        reader: R,
        #[pin]
        writer: W,
    }
}

impl<R, W> JoinedStream<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R: AsyncRead, W> AsyncRead for JoinedStream<R, W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.project().reader.poll_read(cx, buf)
    }
}

impl<R, W: AsyncWrite> AsyncWrite for JoinedStream<R, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().writer.poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().writer.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().writer.poll_shutdown(cx)
    }
}

/// The process's standard input and output as one stream.
pub type StdioStream = JoinedStream<tokio::io::Stdin, tokio::io::Stdout>;

pub fn stdio() -> StdioStream {
    JoinedStream::new(tokio::io::stdin(), tokio::io::stdout())
}

pub mod quic;

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    #[tokio::test]
    async fn joined_stream_routes_reads_and_writes_to_separate_halves() {
        let (inbound, mut inbound_peer) = duplex(64);
        let (outbound, mut outbound_peer) = duplex(64);
        let mut joined = JoinedStream::new(inbound, outbound);

        inbound_peer.write_all(b"in").await.unwrap();
        let mut got = [0u8; 2];
        joined.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"in");

        joined.write_all(b"out").await.unwrap();
        joined.shutdown().await.unwrap();
        let mut sent = Vec::new();
        outbound_peer.read_to_end(&mut sent).await.unwrap();
        assert_eq!(sent, b"out");
    }

    #[test]
    fn default_options_match_wire_contract() {
        let opts = TransportOptions::default();
        assert_eq!(opts.alpn_protocols(), vec![b"quicssh".to_vec()]);
        assert_eq!(opts.keep_alive, Duration::from_secs(30));
        assert_eq!(opts.idle_timeout, Duration::from_secs(300));
    }
}
