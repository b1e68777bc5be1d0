//! QUIC tunnel roles.
//!
//! The server accepts connections and bridges every stream to a local TCP
//! service. The client opens one connection with one stream and bridges it to
//! its own stdin/stdout.

pub mod client;
pub mod server;
pub mod transport;

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::Arc,
        time::{Duration, Instant},
    };

    use rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::CryptoProvider,
        pki_types::{CertificateDer, ServerName, UnixTime},
    };

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, duplex},
        net::TcpListener,
        sync::mpsc,
        task::JoinHandle,
    };

    use super::{
        client::{Client, ClientOptions},
        server::{Server, ServerOptions},
        transport::{TransportOptions, quic::QuicTransport},
    };
    use crate::quicssh::{
        credentials::{self, Verification},
        error::{TunnelError, TunnelResult},
        shutdown::Shutdown,
    };

    /// Echo service standing in for sshd; reports what each connection received.
    async fn echo_service() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((mut sock, _)) = ln.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    let mut buf = [0u8; 1024];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                seen.extend_from_slice(&buf[..n]);
                                if sock.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = sock.shutdown().await;
                    let _ = tx.send(seen);
                });
            }
        });

        (addr, rx)
    }

    struct RunningServer {
        addr: String,
        fingerprint: String,
        shutdown: Shutdown,
        task: JoinHandle<TunnelResult<()>>,
    }

    fn start_server(local: SocketAddr) -> RunningServer {
        let material = credentials::testing::material();
        let server = Server::bind(
            ServerOptions {
                bind_addr: "127.0.0.1:0".into(),
                local_addr: local.to_string(),
                ..ServerOptions::default()
            },
            &material,
        )
        .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let shutdown = Shutdown::new();
        let task = tokio::spawn(server.serve(shutdown.clone()));
        RunningServer {
            addr,
            fingerprint: material.fingerprint,
            shutdown,
            task,
        }
    }

    fn client_for(server: &RunningServer, verification: Verification) -> Client {
        Client::new(ClientOptions {
            addr: server.addr.clone(),
            timeout: Duration::from_secs(5),
            verification,
            ..ClientOptions::default()
        })
    }

    /// Write `payload` as the client's stdin, close it, and collect stdout.
    async fn exchange(client: Client, payload: Vec<u8>) -> (TunnelResult<()>, Vec<u8>) {
        let (io, user) = duplex(16 * 1024);
        let (mut user_rd, mut user_wr) = tokio::io::split(user);

        let run = tokio::spawn(async move { client.run_with_io(io, Shutdown::new()).await });
        let writer = tokio::spawn(async move {
            user_wr.write_all(&payload).await.unwrap();
            user_wr.shutdown().await.unwrap();
        });

        let mut out = Vec::new();
        user_rd.read_to_end(&mut out).await.unwrap();
        writer.await.unwrap();
        (run.await.unwrap(), out)
    }

    async fn stop(server: RunningServer) {
        server.shutdown.cancel();
        let res = tokio::time::timeout(Duration::from_secs(5), server.task)
            .await
            .expect("server should drain")
            .unwrap();
        assert!(res.is_ok(), "{res:?}");
    }

    /// Accepts any certificate, but only after blocking the handshake.
    #[derive(Debug)]
    struct StallingVerifier {
        stall: Duration,
        provider: Arc<CryptoProvider>,
    }

    impl ServerCertVerifier for StallingVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            std::thread::sleep(self.stall);
            Ok(ServerCertVerified::assertion())
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

    fn stalling_client_config(stall: Duration) -> rustls::ClientConfig {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(StallingVerifier { stall, provider }))
            .with_no_client_auth()
    }

    #[tokio::test]
    async fn ping_is_echoed_end_to_end() {
        let (echo_addr, mut seen) = echo_service().await;
        let server = start_server(echo_addr);

        let client = client_for(&server, Verification::Insecure);
        let (res, out) = tokio::time::timeout(Duration::from_secs(10), exchange(client, b"ping".to_vec()))
            .await
            .expect("exchange should finish");

        assert!(res.is_ok(), "{res:?}");
        assert_eq!(out, b"ping");
        assert_eq!(seen.recv().await.unwrap(), b"ping");

        stop(server).await;
    }

    #[tokio::test]
    async fn concurrent_clients_get_their_own_streams() {
        let (echo_addr, _seen) = echo_service().await;
        let server = start_server(echo_addr);

        let payload = |tag: u8| -> Vec<u8> {
            (0..256 * 1024).map(|i| tag ^ (i % 251) as u8).collect()
        };
        let a = payload(0x11);
        let b = payload(0xc4);

        let (ra, rb) = tokio::time::timeout(Duration::from_secs(20), async {
            tokio::join!(
                exchange(client_for(&server, Verification::Insecure), a.clone()),
                exchange(client_for(&server, Verification::Insecure), b.clone()),
            )
        })
        .await
        .expect("both exchanges should finish");

        assert!(ra.0.is_ok() && rb.0.is_ok());
        assert!(ra.1 == a, "client a received foreign or reordered bytes");
        assert!(rb.1 == b, "client b received foreign or reordered bytes");

        stop(server).await;
    }

    #[tokio::test]
    async fn pinned_fingerprint_is_accepted() {
        let (echo_addr, _seen) = echo_service().await;
        let server = start_server(echo_addr);

        let pinned = credentials::parse_fingerprint(&server.fingerprint).unwrap();
        let client = client_for(&server, Verification::Pinned(pinned));
        let (res, out) = tokio::time::timeout(Duration::from_secs(10), exchange(client, b"pinned".to_vec()))
            .await
            .expect("exchange should finish");

        assert!(res.is_ok(), "{res:?}");
        assert_eq!(out, b"pinned");
        stop(server).await;
    }

    #[tokio::test]
    async fn wrong_fingerprint_fails_to_dial() {
        let (echo_addr, _seen) = echo_service().await;
        let server = start_server(echo_addr);

        let client = client_for(&server, Verification::Pinned([0x42; 32]));
        let (io, _user) = duplex(64);
        let res = tokio::time::timeout(Duration::from_secs(10), client.run_with_io(io, Shutdown::new()))
            .await
            .expect("dial should fail fast");
        assert!(matches!(res, Err(TunnelError::Dial { .. })), "{res:?}");

        stop(server).await;
    }

    #[tokio::test]
    async fn server_shutdown_unwinds_open_sessions() {
        let (echo_addr, _seen) = echo_service().await;
        let server = start_server(echo_addr);

        let client = client_for(&server, Verification::Insecure);
        let (io, mut user) = duplex(1024);
        let client_scope = Shutdown::new();
        let scope = client_scope.clone();
        let client_task = tokio::spawn(async move { client.run_with_io(io, scope).await });

        // Confirm the bridge is live before shutting the server down.
        user.write_all(b"hi").await.unwrap();
        let mut got = [0u8; 2];
        tokio::time::timeout(Duration::from_secs(10), user.read_exact(&mut got))
            .await
            .expect("echo should arrive")
            .unwrap();
        assert_eq!(&got, b"hi");

        stop(server).await;

        let res = tokio::time::timeout(Duration::from_secs(10), client_task)
            .await
            .expect("client should notice the closed connection")
            .unwrap();
        assert!(res.is_ok(), "{res:?}");
        assert!(client_scope.is_cancelled(), "a lost connection should cancel the client scope");
    }

    #[tokio::test]
    async fn stalled_handshake_does_not_delay_other_clients() {
        let (echo_addr, _seen) = echo_service().await;
        let server = start_server(echo_addr);

        // The verifier blocks its thread, so the stalled client gets its own runtime.
        let addr = server.addr.clone();
        let stalled = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let crypto = stalling_client_config(Duration::from_secs(4));
                let _ = QuicTransport::new(TransportOptions::default())
                    .dial(&addr, "localhost", crypto)
                    .await;
            });
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = Instant::now();
        let client = client_for(&server, Verification::Insecure);
        let (res, out) = tokio::time::timeout(Duration::from_secs(10), exchange(client, b"next".to_vec()))
            .await
            .expect("second client should finish");
        let elapsed = started.elapsed();
        assert!(res.is_ok(), "{res:?}");
        assert_eq!(out, b"next");
        assert!(elapsed < Duration::from_secs(2), "second client took {elapsed:?}");

        tokio::task::spawn_blocking(move || stalled.join())
            .await
            .unwrap()
            .unwrap();
        stop(server).await;
    }

    #[tokio::test]
    async fn unreachable_local_service_keeps_server_running() {
        // Reserve a port, then free it so dials are refused.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let server = start_server(dead);

        let client = client_for(&server, Verification::Insecure);
        let (res, out) = tokio::time::timeout(Duration::from_secs(10), exchange(client, b"lost".to_vec()))
            .await
            .expect("client should finish");
        assert!(res.is_ok(), "{res:?}");
        assert!(out.is_empty());
        assert!(!server.task.is_finished());

        stop(server).await;
    }
}
