use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{io::AsyncWriteExt, net::TcpStream, task::JoinSet};

use crate::quicssh::{
    credentials::{self, CredentialMaterial},
    error::{TunnelError, TunnelResult},
    relay,
    shutdown::Shutdown,
    tunnel::transport::{
        BoxedStream, CLOSE_NORMAL, PendingSession, TransportListener, TransportOptions,
        TransportSession, quic::QuicTransport,
    },
};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:4242";
pub const DEFAULT_LOCAL_ADDR: &str = "127.0.0.1:22";

const SESSION_CLOSE_REASON: &str = "session closed";
const STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_addr: String,
    /// TCP service each accepted stream is bridged to.
    pub local_addr: String,
    pub transport: TransportOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            local_addr: DEFAULT_LOCAL_ADDR.to_string(),
            transport: TransportOptions::default(),
        }
    }
}

pub struct Server {
    opts: ServerOptions,
    listener: Arc<dyn TransportListener>,
}

impl Server {
    /// Bind the QUIC endpoint. Failing to bind is fatal for the server role.
    pub fn bind(opts: ServerOptions, material: &CredentialMaterial) -> TunnelResult<Self> {
        let crypto = credentials::server_crypto_config(material)?;
        let listener = QuicTransport::new(opts.transport.clone()).listen(&opts.bind_addr, crypto)?;
        Ok(Self {
            opts,
            listener: Arc::new(listener),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self, shutdown: Shutdown) -> TunnelResult<()> {
        tracing::info!(
            addr = %self.local_addr().map(|a| a.to_string()).unwrap_or(self.opts.bind_addr.clone()),
            local = %self.opts.local_addr,
            alpn = %self.opts.transport.alpn,
            "tunnel: listening"
        );
        serve(self.listener, self.opts.local_addr, shutdown).await
    }
}

/// Accept connections until `shutdown` fires or the listener fails, then drain
/// every in-flight session and close the listener.
///
/// Errors for a single connection attempt are logged and the loop keeps going.
pub async fn serve(
    listener: Arc<dyn TransportListener>,
    local_addr: String,
    shutdown: Shutdown,
) -> TunnelResult<()> {
    let local_addr: Arc<str> = local_addr.into();
    let mut sessions = JoinSet::new();

    let result = loop {
        while let Some(res) = sessions.try_join_next() {
            log_task_exit(res);
        }

        if shutdown.is_cancelled() {
            break Ok(());
        }

        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break Ok(()),
            res = listener.accept() => res,
        };

        match accepted {
            Ok(pending) => {
                sessions.spawn(establish_session(pending, local_addr.clone(), shutdown.clone()));
            }
            Err(_) if shutdown.is_cancelled() => break Ok(()),
            Err(err) if err.is_fatal_for_listener() => {
                tracing::error!(err = %err, "tunnel: listener failed");
                shutdown.cancel();
                break Err(err);
            }
            Err(err) => {
                tracing::warn!(err = %err, "tunnel: accept failed");
            }
        }
    };

    if !sessions.is_empty() {
        tracing::info!(sessions = sessions.len(), "tunnel: draining sessions");
    }
    while let Some(res) = sessions.join_next().await {
        log_task_exit(res);
    }

    listener.close().await;
    tracing::info!("tunnel: listener closed");
    result
}

/// Finish the handshake off the accept loop, then run the session.
async fn establish_session(pending: PendingSession, local_addr: Arc<str>, shutdown: Shutdown) {
    let established = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return,
        res = pending => res,
    };

    match established {
        Ok(sess) => handle_session(sess, local_addr, shutdown).await,
        Err(err) => tracing::warn!(err = %err, "tunnel: handshake failed"),
    }
}

async fn handle_session(sess: Arc<dyn TransportSession>, local_addr: Arc<str>, shutdown: Shutdown) {
    let remote = sess
        .remote_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".into());
    tracing::info!(remote = %remote, "tunnel: session opened");

    let mut streams = JoinSet::new();
    loop {
        while let Some(res) = streams.try_join_next() {
            log_task_exit(res);
        }

        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = sess.accept_stream() => res,
        };

        match accepted {
            Ok(st) => {
                streams.spawn(handle_stream(
                    st,
                    local_addr.clone(),
                    remote.clone(),
                    shutdown.clone(),
                ));
            }
            Err(_) if shutdown.is_cancelled() => break,
            Err(TunnelError::ConnectionClosed(reason)) => {
                tracing::debug!(remote = %remote, reason = %reason, "tunnel: peer closed session");
                break;
            }
            Err(err) => {
                tracing::warn!(remote = %remote, err = %err, "tunnel: stream accept failed");
                break;
            }
        }
    }

    sess.close(CLOSE_NORMAL, SESSION_CLOSE_REASON).await;
    while let Some(res) = streams.join_next().await {
        log_task_exit(res);
    }
    tracing::info!(remote = %remote, "tunnel: session closed");
}

async fn handle_stream(mut st: BoxedStream, local_addr: Arc<str>, remote: String, shutdown: Shutdown) {
    let dialed = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return,
        res = TcpStream::connect(&*local_addr) => res,
    };

    let mut local = match dialed {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(
                remote = %remote,
                local = %local_addr,
                err = %err,
                "tunnel: local dial failed"
            );
            let _ = tokio::time::timeout(STREAM_CLOSE_TIMEOUT, st.shutdown()).await;
            return;
        }
    };
    let _ = local.set_nodelay(true);

    tracing::debug!(remote = %remote, local = %local_addr, "tunnel: stream bridged");
    let outcome = relay::relay_pair(&shutdown, &mut st, &mut local).await;
    let (sent, received) = outcome.bytes();

    match outcome.first_error() {
        Some(err) => tracing::warn!(
            remote = %remote,
            err = %err,
            to_local = sent,
            to_remote = received,
            "tunnel: stream relay failed"
        ),
        None if outcome.was_cancelled() => {
            tracing::debug!(remote = %remote, "tunnel: stream cancelled")
        }
        None => tracing::debug!(
            remote = %remote,
            to_local = sent,
            to_remote = received,
            "tunnel: stream finished"
        ),
    }
}

fn log_task_exit(res: Result<(), tokio::task::JoinError>) {
    if let Err(err) = res {
        if err.is_panic() {
            tracing::error!(err = %err, "tunnel: task panicked");
        }
    }
}
