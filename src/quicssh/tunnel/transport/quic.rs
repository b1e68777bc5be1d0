use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use quinn::{
    ClientConfig, Connection, ConnectionError, Endpoint, IdleTimeout, ServerConfig,
    TransportConfig, VarInt,
};

use crate::quicssh::error::{TunnelError, TunnelResult};
use crate::quicssh::net;
use crate::quicssh::tunnel::transport::{
    BoxedStream, CLOSE_NORMAL, HANDSHAKE_TIMEOUT, JoinedStream, PendingSession,
    TransportListener, TransportOptions, TransportSession,
};

/// How long a closing endpoint waits for its close frames to go out.
const CLOSE_LINGER: Duration = Duration::from_secs(1);

pub struct QuicTransport {
    opts: TransportOptions,
}

impl QuicTransport {
    pub fn new(opts: TransportOptions) -> Self {
        Self { opts }
    }

    fn transport_config(&self) -> TunnelResult<Arc<TransportConfig>> {
        let idle = IdleTimeout::try_from(self.opts.idle_timeout)
            .map_err(|e| TunnelError::Config(format!("idle timeout: {e}")))?;

        let mut cfg = TransportConfig::default();
        cfg.max_idle_timeout(Some(idle));
        cfg.keep_alive_interval(Some(self.opts.keep_alive));
        Ok(Arc::new(cfg))
    }

    /// Bind a QUIC endpoint that only completes handshakes offering our ALPN.
    pub fn listen(
        &self,
        addr: &str,
        mut crypto: rustls::ServerConfig,
    ) -> TunnelResult<QuicTransportListener> {
        let listen_err = |reason: String| TunnelError::Listen {
            addr: addr.to_string(),
            reason,
        };

        let bind_addr = net::normalize_bind_addr(addr);
        let sa: SocketAddr = bind_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| listen_err(e.to_string()))?;

        crypto.alpn_protocols = self.opts.alpn_protocols();
        let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .map_err(|e| listen_err(e.to_string()))?;

        let mut server_cfg = ServerConfig::with_crypto(Arc::new(quic_crypto));
        server_cfg.transport_config(self.transport_config()?);

        let endpoint = Endpoint::server(server_cfg, sa).map_err(|e| listen_err(e.to_string()))?;
        Ok(QuicTransportListener {
            endpoint,
            addr: addr.to_string(),
        })
    }

    /// Open one connection to `addr`; the returned session owns its endpoint.
    pub async fn dial(
        &self,
        addr: &str,
        server_name: &str,
        mut crypto: rustls::ClientConfig,
    ) -> TunnelResult<Arc<QuicSession>> {
        let dial_err = |reason: String| TunnelError::Dial {
            addr: addr.to_string(),
            reason,
        };

        crypto.alpn_protocols = self.opts.alpn_protocols();
        let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| dial_err(e.to_string()))?;

        let mut client_cfg = ClientConfig::new(Arc::new(quic_crypto));
        client_cfg.transport_config(self.transport_config()?);

        let remote = net::resolve_socket_addr(addr)
            .await
            .map_err(|e| dial_err(e.to_string()))?;

        let mut endpoint =
            Endpoint::client(net::unspecified_for(&remote)).map_err(|e| dial_err(e.to_string()))?;
        endpoint.set_default_client_config(client_cfg);

        let name = match server_name.trim() {
            "" => "localhost",
            n => n,
        };

        let connecting = endpoint
            .connect(remote, name)
            .map_err(|e| dial_err(e.to_string()))?;
        let conn = connecting.await.map_err(|e| dial_err(e.to_string()))?;
        Ok(Arc::new(QuicSession::new(conn, Some(endpoint))))
    }
}

pub struct QuicTransportListener {
    endpoint: Endpoint,
    addr: String,
}

#[async_trait]
impl TransportListener for QuicTransportListener {
    async fn accept(&self) -> TunnelResult<PendingSession> {
        let incoming = self.endpoint.accept().await.ok_or_else(|| TunnelError::Listen {
            addr: self.addr.clone(),
            reason: "endpoint closed".into(),
        })?;

        let remote = incoming.remote_address();
        let connecting = incoming
            .accept()
            .map_err(|e| TunnelError::Accept(format!("{remote}: {e}")))?;

        Ok(Box::pin(async move {
            let conn = tokio::time::timeout(HANDSHAKE_TIMEOUT, connecting)
                .await
                .map_err(|_| TunnelError::Accept(format!("{remote}: handshake timed out")))?
                .map_err(|e| TunnelError::Accept(format!("{remote}: {e}")))?;
            Ok::<_, TunnelError>(Arc::new(QuicSession::new(conn, None)) as Arc<dyn TransportSession>)
        }))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    async fn close(&self) {
        self.endpoint
            .close(VarInt::from_u32(CLOSE_NORMAL), b"server shutdown");
        let _ = tokio::time::timeout(CLOSE_LINGER, self.endpoint.wait_idle()).await;
    }
}

pub struct QuicSession {
    conn: Connection,
    // Set for dialed sessions, which own a private client endpoint.
    endpoint: Option<Endpoint>,
}

impl QuicSession {
    fn new(conn: Connection, endpoint: Option<Endpoint>) -> Self {
        Self { conn, endpoint }
    }
}

fn map_connection_error(err: ConnectionError) -> TunnelError {
    match &err {
        ConnectionError::ApplicationClosed(_)
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::LocallyClosed
        | ConnectionError::TimedOut
        | ConnectionError::Reset => TunnelError::ConnectionClosed(err.to_string()),
        _ => TunnelError::Accept(err.to_string()),
    }
}

#[async_trait]
impl TransportSession for QuicSession {
    async fn open_stream(&self) -> TunnelResult<BoxedStream> {
        let (send, recv) = self.conn.open_bi().await.map_err(map_connection_error)?;
        Ok(Box::new(JoinedStream::new(recv, send)))
    }

    async fn accept_stream(&self) -> TunnelResult<BoxedStream> {
        let (send, recv) = self.conn.accept_bi().await.map_err(map_connection_error)?;
        Ok(Box::new(JoinedStream::new(recv, send)))
    }

    async fn close(&self, code: u32, reason: &str) {
        self.conn.close(VarInt::from_u32(code), reason.as_bytes());
        if let Some(endpoint) = &self.endpoint {
            let _ = tokio::time::timeout(CLOSE_LINGER, endpoint.wait_idle()).await;
        }
    }

    async fn closed(&self) -> TunnelError {
        map_connection_error(self.conn.closed().await)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.conn.remote_address())
    }

    fn protocol(&self) -> Option<String> {
        let data = self.conn.handshake_data()?;
        let data = data
            .downcast::<quinn::crypto::rustls::HandshakeData>()
            .ok()?;
        data.protocol
            .map(|p| String::from_utf8_lossy(&p).into_owned())
    }
}
