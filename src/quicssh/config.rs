use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::quicssh::{
    credentials,
    tunnel::{client, server, transport},
};

const CONFIG_CANDIDATES: [&str; 3] = ["quicssh.toml", "quicssh.yaml", "quicssh.yml"];

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub transport: transport::TransportOptions,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub local_addr: String,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub addr: String,
    pub server_name: String,
    pub fingerprint: Option<String>,
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
            },
            transport: transport::TransportOptions::default(),
            server: ServerConfig {
                bind: server::DEFAULT_BIND_ADDR.into(),
                cert: PathBuf::from("server.crt"),
                key: PathBuf::from("server.key"),
                local_addr: server::DEFAULT_LOCAL_ADDR.into(),
            },
            client: ClientConfig {
                addr: client::DEFAULT_SERVER_ADDR.into(),
                server_name: client::DEFAULT_SERVER_NAME.into(),
                fingerprint: None,
                timeout: client::DEFAULT_DIAL_TIMEOUT,
            },
        }
    }
}

/// Pick the config file: the explicit path if given, otherwise a
/// `quicssh.{toml,yaml,yml}` in the working directory, otherwise none.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<Option<PathBuf>> {
    if let Some(p) = explicit {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(Some(p));
    }
    Ok(discover_config_path(Path::new(".")))
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            ext
        ),
    };

    Config::from_file_config(fc).with_context(|| format!("config: {}", path.display()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    logging: Option<FileLogging>,
    transport: Option<FileTransport>,
    server: Option<FileServer>,
    client: Option<FileClient>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTransport {
    alpn: Option<String>,
    keep_alive: Option<String>,
    idle_timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    bind: Option<String>,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    local_addr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    addr: Option<String>,
    server_name: Option<String>,
    fingerprint: Option<String>,
    timeout: Option<String>,
}

/// Trimmed value, or `None` when missing or blank.
fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn non_empty_path(v: &Option<PathBuf>) -> Option<PathBuf> {
    v.as_ref().filter(|p| !p.as_os_str().is_empty()).cloned()
}

/// Parse a humantime duration such as `30s`, `5m` or `1h 30m`; zero is rejected.
pub fn parse_duration(field: &str, raw: &str) -> anyhow::Result<Duration> {
    let d = humantime::parse_duration(raw.trim())
        .with_context(|| format!("{field}: invalid duration {raw:?}"))?;
    if d.is_zero() {
        anyhow::bail!("{field}: duration must be positive");
    }
    Ok(d)
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config::default();

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = non_empty(&l.level) {
                cfg.logging.level = level;
            }
            if let Some(format) = non_empty(&l.format) {
                cfg.logging.format = format;
            }
            if let Some(output) = non_empty(&l.output) {
                cfg.logging.output = output;
            }
        }

        // --- Transport ---
        if let Some(t) = &fc.transport {
            if let Some(alpn) = non_empty(&t.alpn) {
                cfg.transport.alpn = alpn;
            }
            if let Some(raw) = non_empty(&t.keep_alive) {
                cfg.transport.keep_alive = parse_duration("transport.keep_alive", &raw)?;
            }
            if let Some(raw) = non_empty(&t.idle_timeout) {
                cfg.transport.idle_timeout = parse_duration("transport.idle_timeout", &raw)?;
            }
        }

        // --- Server ---
        if let Some(s) = &fc.server {
            if let Some(bind) = non_empty(&s.bind) {
                cfg.server.bind = bind;
            }
            if let Some(cert) = non_empty_path(&s.cert) {
                cfg.server.cert = cert;
            }
            if let Some(key) = non_empty_path(&s.key) {
                cfg.server.key = key;
            }
            if let Some(local) = non_empty(&s.local_addr) {
                cfg.server.local_addr = local;
            }
        }

        // --- Client ---
        if let Some(c) = &fc.client {
            if let Some(addr) = non_empty(&c.addr) {
                cfg.client.addr = addr;
            }
            if let Some(name) = non_empty(&c.server_name) {
                cfg.client.server_name = name;
            }
            cfg.client.fingerprint = non_empty(&c.fingerprint);
            if let Some(raw) = non_empty(&c.timeout) {
                cfg.client.timeout = parse_duration("client.timeout", &raw)?;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check values that would otherwise only fail once the tunnel starts.
    pub fn validate(&self) -> anyhow::Result<()> {
        let level = self.logging.level.trim().to_ascii_lowercase();
        if !matches!(level.as_str(), "debug" | "info" | "warn" | "error") {
            anyhow::bail!(
                "logging.level: unsupported level {:?} (expected debug|info|warn|error)",
                self.logging.level
            );
        }
        let format = self.logging.format.trim().to_ascii_lowercase();
        if !matches!(format.as_str(), "text" | "json") {
            anyhow::bail!(
                "logging.format: unsupported format {:?} (expected text|json)",
                self.logging.format
            );
        }
        if self.logging.output.trim() == "stdout" {
            anyhow::bail!("logging.output: stdout carries tunnel data; use stderr or a file");
        }

        if self.transport.alpn.trim().is_empty() {
            anyhow::bail!("transport.alpn: must not be empty");
        }
        if self.transport.keep_alive >= self.transport.idle_timeout {
            anyhow::bail!(
                "transport.keep_alive ({}) must be shorter than transport.idle_timeout ({})",
                humantime::format_duration(self.transport.keep_alive),
                humantime::format_duration(self.transport.idle_timeout)
            );
        }

        if let Some(fp) = &self.client.fingerprint {
            credentials::parse_fingerprint(fp).context("client.fingerprint")?;
        }
        Ok(())
    }
}
