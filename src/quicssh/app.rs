use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Args, Subcommand};

use crate::quicssh::{
    config::{self, Config},
    credentials::{self, Verification},
    error::TunnelError,
    logging,
    shutdown::Shutdown,
    tunnel::{
        client::{Client, ClientOptions},
        server::{Server, ServerOptions},
    },
};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Accept QUIC connections and bridge each stream to a local TCP service.
    #[command(alias = "s")]
    Server(ServerArgs),
    /// Connect to a server and bridge one stream to stdin/stdout (for ssh ProxyCommand).
    #[command(alias = "c")]
    Client(ClientArgs),
}

#[derive(Debug, Default, Args)]
pub struct ServerArgs {
    /// UDP address to listen on [default: 0.0.0.0:4242]. `:PORT` binds all interfaces.
    #[arg(long)]
    pub bind: Option<String>,
    /// Certificate file; generated with the key when neither exists [default: server.crt]
    #[arg(long)]
    pub cert: Option<PathBuf>,
    /// Private key file [default: server.key]
    #[arg(long)]
    pub key: Option<PathBuf>,
    /// TCP service each stream is forwarded to [default: 127.0.0.1:22]
    #[arg(long)]
    pub local_addr: Option<String>,
}

#[derive(Debug, Default, Args)]
pub struct ClientArgs {
    /// Server address [default: localhost:4242]
    #[arg(long)]
    pub addr: Option<String>,
    /// Pin the server certificate by SHA-256 fingerprint (as logged by the server).
    #[arg(long)]
    pub fingerprint: Option<String>,
    /// TLS server name sent during the handshake [default: localhost]
    #[arg(long)]
    pub server_name: Option<String>,
    /// Limit for connecting and opening the stream, e.g. `30s` [default: 300s]
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,
}

impl ServerArgs {
    fn apply(&self, cfg: &mut Config) {
        if let Some(bind) = &self.bind {
            cfg.server.bind = bind.clone();
        }
        if let Some(cert) = &self.cert {
            cfg.server.cert = cert.clone();
        }
        if let Some(key) = &self.key {
            cfg.server.key = key.clone();
        }
        if let Some(local) = &self.local_addr {
            cfg.server.local_addr = local.clone();
        }
    }
}

impl ClientArgs {
    fn apply(&self, cfg: &mut Config) {
        if let Some(addr) = &self.addr {
            cfg.client.addr = addr.clone();
        }
        if let Some(fp) = &self.fingerprint {
            cfg.client.fingerprint = Some(fp.clone());
        }
        if let Some(name) = &self.server_name {
            cfg.client.server_name = name.clone();
        }
        if let Some(timeout) = self.timeout {
            cfg.client.timeout = timeout;
        }
    }
}

impl Command {
    fn apply(&self, cfg: &mut Config) {
        match self {
            Command::Server(args) => args.apply(cfg),
            Command::Client(args) => args.apply(cfg),
        }
    }
}

/// Resolve configuration (defaults, then file, then flags).
pub fn build_config(
    config_path: Option<PathBuf>,
    log_level: Option<String>,
    command: &Command,
) -> anyhow::Result<(Config, Option<PathBuf>)> {
    let path = config::resolve_config_path(config_path)?;

    let mut cfg = match &path {
        Some(p) => config::load_config(p).with_context(|| format!("load config: {}", p.display()))?,
        None => Config::default(),
    };

    if let Some(level) = log_level {
        cfg.logging.level = level;
    }
    command.apply(&mut cfg);
    cfg.validate().context("invalid configuration")?;
    Ok((cfg, path))
}

pub async fn run(
    config_path: Option<PathBuf>,
    log_level: Option<String>,
    command: Command,
) -> anyhow::Result<()> {
    let (cfg, path) = build_config(config_path, log_level, &command)?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if let Some(p) = &path {
        tracing::info!(config = %p.display(), "quicssh: loaded config");
    }

    let shutdown = Shutdown::new();
    let signals = shutdown.listen_for_signals();

    let res = match &command {
        Command::Server(_) => run_server(&cfg, shutdown.clone()).await,
        Command::Client(_) => run_client(&cfg, shutdown.clone()).await,
    };

    shutdown.cancel();
    let _ = signals.await;
    res
}

async fn run_server(cfg: &Config, shutdown: Shutdown) -> anyhow::Result<()> {
    let (cert, key) = (cfg.server.cert.clone(), cfg.server.key.clone());
    let (material, generated) =
        tokio::task::spawn_blocking(move || credentials::load_or_generate(&cert, &key))
            .await
            .context("credentials task")?
            .context("server credentials")?;

    tracing::info!(
        cert = %cfg.server.cert.display(),
        key = %cfg.server.key.display(),
        generated,
        fingerprint = %material.fingerprint,
        "quicssh: server certificate"
    );

    let server = Server::bind(
        ServerOptions {
            bind_addr: cfg.server.bind.clone(),
            local_addr: cfg.server.local_addr.clone(),
            transport: cfg.transport.clone(),
        },
        &material,
    )
    .context("start server")?;

    server.serve(shutdown).await.context("server")?;
    tracing::info!("quicssh: server stopped");
    Ok(())
}

async fn run_client(cfg: &Config, shutdown: Shutdown) -> anyhow::Result<()> {
    let verification = Verification::from_fingerprint(cfg.client.fingerprint.as_deref())
        .context("client fingerprint")?;

    let client = Client::new(ClientOptions {
        addr: cfg.client.addr.clone(),
        server_name: cfg.client.server_name.clone(),
        timeout: cfg.client.timeout,
        verification,
        transport: cfg.transport.clone(),
    });

    match client.run(shutdown).await {
        Ok(()) => Ok(()),
        Err(TunnelError::Cancelled) => {
            tracing::info!("quicssh: cancelled before connecting");
            Ok(())
        }
        Err(err) => Err(anyhow::Error::new(err).context("client")),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn flags_override_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quicssh.toml");
        fs::write(
            &path,
            "[server]\nbind = \":5000\"\nlocal_addr = \"127.0.0.1:2222\"\n",
        )
        .unwrap();

        let cmd = Command::Server(ServerArgs {
            bind: Some("127.0.0.1:6000".into()),
            ..ServerArgs::default()
        });
        let (cfg, used) = build_config(Some(path.clone()), Some("debug".into()), &cmd).unwrap();
        assert_eq!(used, Some(path));
        assert_eq!(cfg.server.bind, "127.0.0.1:6000");
        assert_eq!(cfg.server.local_addr, "127.0.0.1:2222");
        assert_eq!(cfg.logging.level, "debug");
    }

    #[test]
    fn client_flags_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quicssh.toml");
        fs::write(&path, "").unwrap();

        let cmd = Command::Client(ClientArgs {
            fingerprint: Some("not-hex".into()),
            ..ClientArgs::default()
        });
        assert!(build_config(Some(path.clone()), None, &cmd).is_err());

        let cmd = Command::Client(ClientArgs {
            addr: Some("tunnel.example.net:4242".into()),
            timeout: Some(Duration::from_secs(12)),
            ..ClientArgs::default()
        });
        let (cfg, _) = build_config(Some(path), None, &cmd).unwrap();
        assert_eq!(cfg.client.addr, "tunnel.example.net:4242");
        assert_eq!(cfg.client.timeout, Duration::from_secs(12));
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = Command::Server(ServerArgs::default());
        assert!(build_config(Some(dir.path().join("absent.toml")), None, &cmd).is_err());
    }
}
