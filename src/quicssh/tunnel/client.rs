use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::quicssh::{
    credentials::{self, Verification},
    error::{TunnelError, TunnelResult},
    relay,
    shutdown::Shutdown,
    tunnel::transport::{self, CLOSE_NORMAL, TransportOptions, TransportSession, quic::QuicTransport},
};

pub const DEFAULT_SERVER_ADDR: &str = "localhost:4242";
pub const DEFAULT_SERVER_NAME: &str = "localhost";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(300);

const CLIENT_CLOSE_REASON: &str = "client done";
const STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub addr: String,
    pub server_name: String,
    /// Bounds the dial and stream-open phase only.
    pub timeout: Duration,
    pub verification: Verification,
    pub transport: TransportOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            addr: DEFAULT_SERVER_ADDR.to_string(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            timeout: DEFAULT_DIAL_TIMEOUT,
            verification: Verification::Insecure,
            transport: TransportOptions::default(),
        }
    }
}

pub struct Client {
    opts: ClientOptions,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> Self {
        if opts.timeout.is_zero() {
            opts.timeout = DEFAULT_DIAL_TIMEOUT;
        }
        if opts.server_name.trim().is_empty() {
            opts.server_name = DEFAULT_SERVER_NAME.to_string();
        }
        Self { opts }
    }

    /// Bridge one stream to the process's stdin/stdout.
    pub async fn run(&self, shutdown: Shutdown) -> TunnelResult<()> {
        self.run_with_io(transport::stdio(), shutdown).await
    }

    /// Dial, open exactly one stream and relay it against `io` until both
    /// directions finish or `shutdown` fires.
    ///
    /// Only dial and stream-open failures are returned as errors; relay failures
    /// and a lost connection are logged and cancel `shutdown`.
    pub async fn run_with_io<S>(&self, mut io: S, shutdown: Shutdown) -> TunnelResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.opts.verification == Verification::Insecure {
            tracing::warn!(
                server = %self.opts.addr,
                "tunnel: server certificate is not verified; pass --fingerprint to pin it"
            );
        }

        let (sess, mut st) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(TunnelError::Cancelled),
            res = tokio::time::timeout(self.opts.timeout, self.connect()) => match res {
                Ok(res) => res?,
                Err(_) => {
                    return Err(TunnelError::Dial {
                        addr: self.opts.addr.clone(),
                        reason: format!(
                            "timed out after {}",
                            humantime::format_duration(self.opts.timeout)
                        ),
                    });
                }
            },
        };

        let remote = sess
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| self.opts.addr.clone());
        tracing::info!(server = %self.opts.addr, remote = %remote, "tunnel: connected");

        // A lost connection does not always surface on the stream: a reset
        // peer can leave stdin blocked forever.
        let outcome = {
            let relay = relay::relay_pair(&shutdown, &mut io, &mut st);
            tokio::pin!(relay);
            tokio::select! {
                biased;
                outcome = &mut relay => outcome,
                err = sess.closed() => {
                    tracing::warn!(remote = %remote, err = %err, "tunnel: connection lost");
                    shutdown.cancel();
                    relay.await
                }
            }
        };
        let (sent, received) = outcome.bytes();
        match outcome.first_error() {
            Some(err) => {
                tracing::warn!(
                    remote = %remote,
                    err = %err,
                    sent,
                    received,
                    "tunnel: relay failed"
                );
                shutdown.cancel();
            }
            None if outcome.was_cancelled() => {
                tracing::debug!(remote = %remote, "tunnel: relay cancelled");
            }
            None => {
                tracing::info!(remote = %remote, sent, received, "tunnel: session finished");
            }
        }

        let _ = tokio::time::timeout(STREAM_CLOSE_TIMEOUT, st.shutdown()).await;
        drop(st);
        sess.close(CLOSE_NORMAL, CLIENT_CLOSE_REASON).await;
        Ok(())
    }

    async fn connect(
        &self,
    ) -> TunnelResult<(
        std::sync::Arc<transport::quic::QuicSession>,
        transport::BoxedStream,
    )> {
        let crypto = credentials::client_crypto_config(&self.opts.verification)?;
        let sess = QuicTransport::new(self.opts.transport.clone())
            .dial(&self.opts.addr, &self.opts.server_name, crypto)
            .await?;

        match sess.open_stream().await {
            Ok(st) => Ok((sess, st)),
            Err(err) => {
                sess.close(CLOSE_NORMAL, CLIENT_CLOSE_REASON).await;
                Err(TunnelError::Dial {
                    addr: self.opts.addr.clone(),
                    reason: format!("open stream: {err}"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;

    use super::*;

    #[test]
    fn new_fills_in_empty_values() {
        let c = Client::new(ClientOptions {
            timeout: Duration::ZERO,
            server_name: " ".into(),
            ..ClientOptions::default()
        });
        assert_eq!(c.opts.timeout, DEFAULT_DIAL_TIMEOUT);
        assert_eq!(c.opts.server_name, DEFAULT_SERVER_NAME);
    }

    #[tokio::test]
    async fn dial_timeout_is_reported_as_dial_error() {
        // Bound but never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = Client::new(ClientOptions {
            addr: silent.local_addr().unwrap().to_string(),
            timeout: Duration::from_millis(200),
            ..ClientOptions::default()
        });

        let (io, _user) = tokio::io::duplex(64);
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            client.run_with_io(io, Shutdown::new()),
        )
        .await
        .expect("dial timeout should fire");
        match res {
            Err(TunnelError::Dial { reason, .. }) => assert!(reason.contains("timed out"), "{reason}"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_before_connect_returns_cancelled() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = Client::new(ClientOptions {
            addr: silent.local_addr().unwrap().to_string(),
            ..ClientOptions::default()
        });
        let shutdown = Shutdown::new();
        shutdown.cancel();

        let (io, _user) = tokio::io::duplex(64);
        let res = client.run_with_io(io, shutdown).await;
        assert!(matches!(res, Err(TunnelError::Cancelled)));
    }
}
