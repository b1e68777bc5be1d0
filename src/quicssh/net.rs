use std::{borrow::Cow, net::SocketAddr};

/// Normalize a bind/listen address.
///
/// The shorthand `":PORT"` means "bind on all interfaces". `SocketAddr`
/// parsing does not accept it, so it is rewritten to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Resolve `host:port`, preferring an IPv4 result. Literals skip DNS.
pub async fn resolve_socket_addr(addr: &str) -> std::io::Result<SocketAddr> {
    let addr = addr.trim();
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let all: Vec<SocketAddr> = tokio::net::lookup_host(addr).await?.collect();
    let preferred = all.iter().find(|sa| sa.is_ipv4()).or_else(|| all.first());
    preferred.copied().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("could not resolve {addr:?}"),
        )
    })
}

/// Bind address for a client endpoint in the same family as `remote`.
pub fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}
