//! TLS credential material for the tunnel.
//!
//! - Self-signed RSA-2048 certificate generation and persistence
//! - Loading and validating an existing certificate/key pair
//! - SHA-256 fingerprints (compute, parse, format)
//! - rustls configurations for both roles, including fingerprint pinning

use std::{
    fs,
    io::Write,
    path::Path,
    sync::Arc,
};

use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rsa::{
    RsaPrivateKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding},
    traits::PublicKeyParts,
};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};
use sha2::{Digest, Sha256};
use x509_parser::public_key::PublicKey;

use crate::quicssh::error::{TunnelError, TunnelResult};

pub const RSA_KEY_BITS: usize = 2048;
pub const VALIDITY_DAYS: i64 = 365;
/// `NotBefore` is set this far in the past to tolerate clock skew.
pub const BACKDATE: time::Duration = time::Duration::hours(1);
pub const LOOPBACK_SAN: &str = "127.0.0.1";

const KEY_FILE_MODE: u32 = 0o600;
const CERT_FILE_MODE: u32 = 0o644;

/// A certificate chain with its private key and leaf fingerprint.
pub struct CredentialMaterial {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    /// SHA-256 of the leaf certificate, colon-separated lowercase hex.
    pub fingerprint: String,
}

impl Clone for CredentialMaterial {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

impl std::fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialMaterial")
            .field("certs", &self.cert_chain.len())
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// PEM text of a freshly generated pair.
#[derive(Debug, Clone)]
pub struct GeneratedPair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Load the pair at the given paths, generating and persisting a self-signed
/// pair first when neither file exists.
///
/// A lone certificate or key is an error: it is never overwritten.
/// Returns the material and whether it was generated by this call.
pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> TunnelResult<(CredentialMaterial, bool)> {
    match (cert_path.exists(), key_path.exists()) {
        (true, true) => return Ok((load(cert_path, key_path)?, false)),
        (true, false) => {
            return Err(TunnelError::CredentialLoad(format!(
                "certificate {} exists but key {} is missing",
                cert_path.display(),
                key_path.display()
            )));
        }
        (false, true) => {
            return Err(TunnelError::CredentialLoad(format!(
                "key {} exists but certificate {} is missing",
                key_path.display(),
                cert_path.display()
            )));
        }
        (false, false) => {}
    }

    let host = local_hostname();
    tracing::info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        host = %host,
        "credentials: generating self-signed certificate"
    );

    let pair = generate_self_signed(&host)?;
    persist(&pair, cert_path, key_path)?;

    let material = from_pem(pair.cert_pem.as_bytes(), pair.key_pem.as_bytes())
        .map_err(|e| TunnelError::CredentialGeneration(e.to_string()))?;
    Ok((material, true))
}

/// Load and validate an existing certificate/key pair.
pub fn load(cert_path: &Path, key_path: &Path) -> TunnelResult<CredentialMaterial> {
    let cert_pem = fs::read(cert_path).map_err(|e| {
        TunnelError::CredentialLoad(format!("read {}: {e}", cert_path.display()))
    })?;
    let key_pem = fs::read(key_path).map_err(|e| {
        TunnelError::CredentialLoad(format!("read {}: {e}", key_path.display()))
    })?;
    from_pem(&cert_pem, &key_pem)
}

/// Parse PEM certificate chain and private key, checking that they belong together.
pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> TunnelResult<CredentialMaterial> {
    let cert_chain = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::CredentialLoad(format!("certificate pem: {e}")))?;
    let Some(leaf) = cert_chain.first() else {
        return Err(TunnelError::CredentialLoad(
            "no certificate found in pem".into(),
        ));
    };

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| TunnelError::CredentialLoad(format!("private key pem: {e}")))?
        .ok_or_else(|| TunnelError::CredentialLoad("no private key found in pem".into()))?;

    ensure_key_matches(leaf, &key)?;

    let fingerprint = compute_fingerprint(leaf.as_ref());
    Ok(CredentialMaterial {
        cert_chain,
        key,
        fingerprint,
    })
}

/// Check that `key` is usable and, for RSA, that its modulus matches the leaf
/// certificate's public key.
///
/// Other key types are matched by rustls when the server configuration is built.
fn ensure_key_matches(leaf: &CertificateDer<'_>, key: &PrivateKeyDer<'_>) -> TunnelResult<()> {
    rustls::crypto::ring::sign::any_supported_type(key)
        .map_err(|e| TunnelError::CredentialLoad(format!("private key: {e}")))?;

    let rsa_key = match key {
        PrivateKeyDer::Pkcs1(k) => RsaPrivateKey::from_pkcs1_der(k.secret_pkcs1_der())
            .map_err(|e| TunnelError::CredentialLoad(format!("rsa private key: {e}")))?,
        PrivateKeyDer::Pkcs8(k) => match RsaPrivateKey::from_pkcs8_der(k.secret_pkcs8_der()) {
            Ok(k) => k,
            Err(_) => return Ok(()),
        },
        _ => return Ok(()),
    };

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| TunnelError::CredentialLoad(format!("certificate: {e}")))?;
    let public = cert
        .public_key()
        .parsed()
        .map_err(|e| TunnelError::CredentialLoad(format!("certificate public key: {e}")))?;

    let PublicKey::RSA(cert_rsa) = public else {
        return Err(TunnelError::CredentialLoad(
            "private key is RSA but the certificate key is not".into(),
        ));
    };

    if strip_leading_zeros(cert_rsa.modulus) != rsa_key.n().to_bytes_be().as_slice() {
        return Err(TunnelError::CredentialLoad(
            "private key does not match certificate".into(),
        ));
    }
    Ok(())
}

fn strip_leading_zeros(b: &[u8]) -> &[u8] {
    let start = b.iter().position(|&x| x != 0).unwrap_or(b.len());
    &b[start..]
}

/// Generate a self-signed RSA-2048 server certificate for `host` and loopback.
pub fn generate_self_signed(host: &str) -> TunnelResult<GeneratedPair> {
    let gen_err = |e: String| TunnelError::CredentialGeneration(e);

    let rsa_key = RsaPrivateKey::new(&mut rsa::rand_core::OsRng, RSA_KEY_BITS)
        .map_err(|e| gen_err(format!("rsa key: {e}")))?;
    let key_pem = rsa_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| gen_err(format!("encode key: {e}")))?
        .as_str()
        .to_owned();
    let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| gen_err(format!("signing key: {e}")))?;

    let mut params = CertificateParams::new(vec![host.to_string(), LOOPBACK_SAN.to_string()])
        .map_err(|e| gen_err(format!("subject alt names: {e}")))?;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - BACKDATE;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);
    params.distinguished_name.push(DnType::CommonName, host);
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| gen_err(format!("sign certificate: {e}")))?;

    Ok(GeneratedPair {
        cert_pem: cert.pem(),
        key_pem,
    })
}

fn persist(pair: &GeneratedPair, cert_path: &Path, key_path: &Path) -> TunnelResult<()> {
    write_with_mode(key_path, pair.key_pem.as_bytes(), KEY_FILE_MODE)?;
    write_with_mode(cert_path, pair.cert_pem.as_bytes(), CERT_FILE_MODE)?;
    tracing::info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "credentials: saved self-signed certificate"
    );
    Ok(())
}

fn write_with_mode(path: &Path, data: &[u8], mode: u32) -> TunnelResult<()> {
    let io_err = |e: std::io::Error| {
        TunnelError::CredentialGeneration(format!("write {}: {e}", path.display()))
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    let mut f = opts.open(path).map_err(io_err)?;
    f.write_all(data).map_err(io_err)?;

    // The open mode is filtered by umask and ignored for existing files.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(io_err)?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

fn local_hostname() -> String {
    match hostname::get().map(|h| h.into_string()) {
        Ok(Ok(h)) if !h.trim().is_empty() => h,
        _ => {
            tracing::warn!("credentials: cannot read local hostname; using localhost");
            "localhost".to_string()
        }
    }
}

/// SHA-256 of a DER certificate, colon-separated lowercase hex.
pub fn compute_fingerprint(cert_der: &[u8]) -> String {
    let hash: [u8; 32] = Sha256::digest(cert_der).into();
    format_fingerprint(&hash)
}

pub fn format_fingerprint(bytes: &[u8; 32]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse a fingerprint given as `aa:bb:...` or as 64 continuous hex digits.
pub fn parse_fingerprint(s: &str) -> TunnelResult<[u8; 32]> {
    let s = s.trim();
    let hex: String = if s.contains(':') {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 32 || parts.iter().any(|p| p.len() != 2) {
            return Err(TunnelError::Config(format!(
                "fingerprint must be 32 colon-separated bytes, got {s:?}"
            )));
        }
        parts.concat()
    } else {
        s.to_string()
    };

    if hex.len() != 64 {
        return Err(TunnelError::Config(format!(
            "fingerprint must be 64 hex digits, got {}",
            hex.len()
        )));
    }

    // from_str_radix alone would accept a sign prefix such as "+a".
    if let Some(bad) = hex.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(TunnelError::Config(format!(
            "invalid character {bad:?} in fingerprint"
        )));
    }

    let mut out = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk)
            .map_err(|_| TunnelError::Config("fingerprint is not ascii".into()))?;
        out[i] = u8::from_str_radix(pair, 16)
            .map_err(|_| TunnelError::Config(format!("invalid hex in fingerprint: {pair:?}")))?;
    }
    Ok(out)
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// rustls server configuration; QUIC requires TLS 1.3 so it is the only version.
pub fn server_crypto_config(material: &CredentialMaterial) -> TunnelResult<rustls::ServerConfig> {
    rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TunnelError::Config(format!("tls versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(material.cert_chain.clone(), material.key.clone_key())
        .map_err(|e| TunnelError::CredentialLoad(format!("certificate rejected: {e}")))
}

/// How the client decides whether to trust the server certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Accept any certificate. Vulnerable to MITM; kept for self-signed setups
    /// where the fingerprint is not known in advance.
    Insecure,
    /// Accept only the certificate with this SHA-256 fingerprint.
    Pinned([u8; 32]),
}

impl Verification {
    pub fn from_fingerprint(fingerprint: Option<&str>) -> TunnelResult<Self> {
        match fingerprint.map(str::trim) {
            None | Some("") => Ok(Verification::Insecure),
            Some(fp) => Ok(Verification::Pinned(parse_fingerprint(fp)?)),
        }
    }
}

pub fn client_crypto_config(verification: &Verification) -> TunnelResult<rustls::ClientConfig> {
    let provider = crypto_provider();
    let expected = match verification {
        Verification::Insecure => None,
        Verification::Pinned(fp) => Some(*fp),
    };
    let verifier = Arc::new(FingerprintVerifier {
        expected,
        provider: provider.clone(),
    });

    let cfg = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TunnelError::Config(format!("tls versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(cfg)
}

/// Server certificate check by SHA-256 fingerprint; `None` accepts anything.
///
/// Handshake signatures are always verified so the peer must hold the key.
#[derive(Debug)]
struct FingerprintVerifier {
    expected: Option<[u8; 32]>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let Some(expected) = self.expected else {
            return Ok(ServerCertVerified::assertion());
        };

        let got: [u8; 32] = Sha256::digest(end_entity.as_ref()).into();
        if got == expected {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "certificate fingerprint mismatch: expected {}, got {}",
                format_fingerprint(&expected),
                format_fingerprint(&got)
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
