use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("credential load: {0}")]
    CredentialLoad(String),

    #[error("credential generation: {0}")]
    CredentialGeneration(String),

    #[error("listen {addr}: {reason}")]
    Listen { addr: String, reason: String },

    #[error("dial {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("accept: {0}")]
    Accept(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("relay: {0}")]
    Relay(#[source] std::io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("config: {0}")]
    Config(String),
}

impl TunnelError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TunnelError::Cancelled)
    }

    /// Errors that end the listener itself rather than a single accept.
    pub fn is_fatal_for_listener(&self) -> bool {
        matches!(self, TunnelError::Listen { .. })
    }
}

pub type TunnelResult<T> = std::result::Result<T, TunnelError>;
