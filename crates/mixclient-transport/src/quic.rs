//! QUIC client transport to providers.
//!
//! Providers present self-signed Ed25519 certificates. There is no chain to
//! check; instead the certificate key must equal the provider's published
//! `identity_key`, and the TLS 1.3 handshake signature proves possession of
//! it. Each connection gets a verifier pinned to the descriptor it dials.
//! The account binds itself to the session afterwards with
//! [`ProviderCommand::Authenticate`](crate::wire::ProviderCommand::Authenticate).
//!
//! Each session owns one bidirectional stream carrying
//! `[length:4 LE][frame:length]` records.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mixclient_types::NodeDescriptor;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, VarInt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use tracing::{debug, info, warn};

use crate::session::{Session, Transport};
use crate::wire::MAX_FRAME_SIZE;
use crate::TransportError;

/// ALPN identifier of provider protocol version 1.
pub const ALPN: &[u8] = b"mixclient/1";

/// Name presented as SNI. Providers are addressed by socket address only.
pub const SERVER_NAME: &str = "mixclient-provider";

#[derive(Clone, Debug)]
pub struct QuicConfig {
    pub bind_addr: SocketAddr,
    /// Connections silent for this long are torn down.
    pub idle_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            idle_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(10),
        }
    }
}

/// OID of the Ed25519 public key algorithm.
const ED25519_OID: &str = "1.3.101.112";

/// Client endpoint shared by every account pipeline.
pub struct QuicTransport {
    endpoint: Endpoint,
    config: QuicConfig,
    crypto: Arc<CryptoProvider>,
}

impl QuicTransport {
    /// Bind the endpoint. Must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Tls`] if the TLS or QUIC settings are rejected
    /// - [`TransportError::Io`] if the socket cannot be bound
    pub fn new(config: QuicConfig) -> Result<Self, TransportError> {
        let crypto = Arc::new(rustls::crypto::ring::default_provider());
        // Reject bad settings at startup rather than on the first connect.
        client_config(&config, &crypto, [0u8; 32])?;
        let endpoint =
            Endpoint::client(config.bind_addr).map_err(|e| TransportError::Io(e.to_string()))?;

        let local_addr = endpoint
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        info!(%local_addr, "provider transport ready");
        Ok(Self {
            endpoint,
            config,
            crypto,
        })
    }

    /// Close the endpoint and every session opened through it.
    pub fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn connect(&self, node: &NodeDescriptor) -> Result<Box<dyn Session>, TransportError> {
        let addr = resolve(&node.address).await?;
        let pinned = client_config(&self.config, &self.crypto, node.identity_key)?;
        let connecting = self
            .endpoint
            .connect_with(pinned, addr, SERVER_NAME)
            .map_err(|e| TransportError::Connection(format!("{}: {e}", node.name)))?;
        let connection = connecting
            .await
            .map_err(|e| TransportError::Connection(format!("{}: {e}", node.name)))?;
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Connection(format!("{}: {e}", node.name)))?;

        debug!(node = %node.name, %addr, "provider session open");
        Ok(Box::new(QuicSession {
            connection,
            send,
            recv,
            closed: false,
        }))
    }
}

async fn resolve(address: &str) -> Result<SocketAddr, TransportError> {
    let mut addrs = tokio::net::lookup_host(address)
        .await
        .map_err(|e| TransportError::Connection(format!("resolve {address}: {e}")))?;
    addrs
        .next()
        .ok_or_else(|| TransportError::Connection(format!("no address for {address}")))
}

/// One bidirectional stream to a provider.
pub struct QuicSession {
    connection: Connection,
    send: SendStream,
    recv: RecvStream,
    closed: bool,
}

#[async_trait]
impl Session for QuicSession {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let record = encode_record(data)?;
        self.send
            .write_all(&record)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut header = [0u8; 4];
        self.recv
            .read_exact(&mut header)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let len = record_len(header)?;

        let mut frame = vec![0u8; len];
        self.recv
            .read_exact(&mut frame)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(frame)
    }

    async fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        // The peer may already be gone; nothing to report.
        let _ = self.send.finish();
        self.connection.close(VarInt::from_u32(0), b"session closed");
    }
}

fn encode_record(frame: &[u8]) -> Result<Vec<u8>, TransportError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(TransportError::ProtocolViolation(format!(
            "outbound frame of {} bytes exceeds {MAX_FRAME_SIZE}",
            frame.len()
        )));
    }
    let len = u32::try_from(frame.len())
        .map_err(|_| TransportError::ProtocolViolation("frame length overflow".to_string()))?;
    let mut record = Vec::with_capacity(4 + frame.len());
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(frame);
    Ok(record)
}

fn record_len(header: [u8; 4]) -> Result<usize, TransportError> {
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::ProtocolViolation(format!(
            "inbound frame of {len} bytes exceeds {MAX_FRAME_SIZE}"
        )));
    }
    Ok(len)
}

fn client_config(
    config: &QuicConfig,
    crypto: &Arc<CryptoProvider>,
    identity_key: [u8; 32],
) -> Result<ClientConfig, TransportError> {
    let verifier = Arc::new(ProviderCertVerifier {
        identity_key,
        algorithms: crypto.signature_verification_algorithms,
    });
    let mut tls = rustls::ClientConfig::builder_with_provider(Arc::clone(crypto))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let idle = quinn::IdleTimeout::try_from(config.idle_timeout)
        .map_err(|e| TransportError::Tls(format!("idle timeout: {e}")))?;
    let mut transport = quinn::TransportConfig::default();
    transport
        .max_idle_timeout(Some(idle))
        .keep_alive_interval(Some(config.keep_alive));

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let mut client = ClientConfig::new(Arc::new(quic));
    client.transport_config(Arc::new(transport));
    Ok(client)
}

/// Ed25519 key carried by a DER certificate.
fn certificate_key(cert: &CertificateDer<'_>) -> Result<[u8; 32], CertificateError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|_| CertificateError::BadEncoding)?;
    let spki = parsed.public_key();
    if spki.algorithm.algorithm.to_id_string() != ED25519_OID {
        return Err(CertificateError::UnsupportedSignatureAlgorithm);
    }
    <[u8; 32]>::try_from(spki.subject_public_key.data.as_ref())
        .map_err(|_| CertificateError::BadEncoding)
}

/// Pins the certificate key to one provider's identity key and checks the
/// handshake signatures made with it.
#[derive(Debug)]
struct ProviderCertVerifier {
    identity_key: [u8; 32],
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for ProviderCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = certificate_key(end_entity).map_err(rustls::Error::InvalidCertificate)?;
        if presented != self.identity_key {
            warn!("provider certificate does not match its published identity key");
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use mixclient_types::NodeFlags;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    use super::*;

    /// Self-signed Ed25519 certificate, its private key and raw public key.
    fn provider_cert() -> (CertificateDer<'static>, PrivateKeyDer<'static>, [u8; 32]) {
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519).expect("keypair");
        let cert = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
            .expect("params")
            .self_signed(&key_pair)
            .expect("certificate");
        let public = <[u8; 32]>::try_from(key_pair.public_key_raw()).expect("ed25519 key");
        (
            CertificateDer::from(cert.der().to_vec()),
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
            public,
        )
    }

    fn verifier(identity_key: [u8; 32]) -> ProviderCertVerifier {
        ProviderCertVerifier {
            identity_key,
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }

    fn check(verifier: &ProviderCertVerifier, cert: &CertificateDer<'_>) -> Result<ServerCertVerified, rustls::Error> {
        let name = ServerName::try_from(SERVER_NAME).expect("server name");
        verifier.verify_server_cert(cert, &[], &name, &[], UnixTime::now())
    }

    /// Loopback provider that echoes one record back on the first stream.
    fn echo_provider(cert: CertificateDer<'static>, key: PrivateKeyDer<'static>) -> (Endpoint, SocketAddr) {
        let mut tls = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .expect("versions")
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .expect("server cert");
        tls.alpn_protocols = vec![ALPN.to_vec()];
        let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls).expect("quic crypto");
        let endpoint = Endpoint::server(
            quinn::ServerConfig::with_crypto(Arc::new(crypto)),
            SocketAddr::from(([127, 0, 0, 1], 0)),
        )
        .expect("server endpoint");
        let addr = endpoint.local_addr().expect("addr");

        let server = endpoint.clone();
        tokio::spawn(async move {
            while let Some(incoming) = server.accept().await {
                let Ok(connection) = incoming.await else { continue };
                let Ok((mut send, mut recv)) = connection.accept_bi().await else { continue };
                let mut header = [0u8; 4];
                if recv.read_exact(&mut header).await.is_err() {
                    continue;
                }
                let mut frame = vec![0u8; u32::from_le_bytes(header) as usize];
                if recv.read_exact(&mut frame).await.is_err() {
                    continue;
                }
                let _ = send.write_all(&header).await;
                let _ = send.write_all(&frame).await;
                // Keep the connection open until the client is done.
                connection.closed().await;
            }
        });
        (endpoint, addr)
    }

    fn descriptor(addr: SocketAddr, identity_key: [u8; 32]) -> NodeDescriptor {
        NodeDescriptor {
            name: "provider-1".to_string(),
            identity_key,
            link_key: [0; 32],
            address: addr.to_string(),
            flags: NodeFlags {
                is_provider: true,
                supports_surb: true,
            },
        }
    }

    fn loopback_transport() -> QuicTransport {
        QuicTransport::new(QuicConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..QuicConfig::default()
        })
        .expect("bind")
    }

    #[test]
    fn test_record_layout() {
        let record = encode_record(b"abc").expect("encode");
        assert_eq!(record, [3, 0, 0, 0, b'a', b'b', b'c']);
        assert_eq!(record_len([3, 0, 0, 0]).expect("len"), 3);
    }

    #[test]
    fn test_oversized_frames_rejected() {
        let header = u32::try_from(MAX_FRAME_SIZE + 1).expect("fits").to_le_bytes();
        assert!(matches!(
            record_len(header),
            Err(TransportError::ProtocolViolation(_))
        ));
        assert!(matches!(
            encode_record(&vec![0u8; MAX_FRAME_SIZE + 1]),
            Err(TransportError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_certificate_key_extracted() {
        let (cert, _, public) = provider_cert();
        assert_eq!(certificate_key(&cert).expect("key"), public);
        assert_eq!(
            certificate_key(&CertificateDer::from(vec![0x30, 0x03, 0x01])),
            Err(CertificateError::BadEncoding)
        );
    }

    #[test]
    fn test_certificate_pinned_to_identity_key() {
        let (cert, _, public) = provider_cert();
        assert!(check(&verifier(public), &cert).is_ok());

        let mut other = public;
        other[0] ^= 0x01;
        assert!(matches!(
            check(&verifier(other), &cert),
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure
            ))
        ));
    }

    #[test]
    fn test_verifier_offers_provider_schemes() {
        let schemes = verifier([0; 32]).supported_verify_schemes();
        assert!(schemes.contains(&SignatureScheme::ED25519));
        assert!(schemes.contains(&SignatureScheme::ECDSA_NISTP256_SHA256));
    }

    #[tokio::test]
    async fn test_session_with_pinned_provider() {
        let (cert, key, public) = provider_cert();
        let (server, addr) = echo_provider(cert, key);
        let transport = loopback_transport();

        let mut session = transport
            .connect(&descriptor(addr, public))
            .await
            .expect("connect");
        session.send(b"frame").await.expect("send");
        assert_eq!(session.receive().await.expect("receive"), b"frame");
        session.close().await;
        assert!(matches!(session.send(b"late").await, Err(TransportError::Closed)));

        transport.close();
        server.close(VarInt::from_u32(0), b"done");
    }

    #[tokio::test]
    async fn test_impostor_provider_refused() {
        let (cert, key, public) = provider_cert();
        let (server, addr) = echo_provider(cert, key);
        let transport = loopback_transport();

        let mut expected = public;
        expected[31] ^= 0x80;
        assert!(matches!(
            transport.connect(&descriptor(addr, expected)).await,
            Err(TransportError::Connection(_))
        ));

        transport.close();
        server.close(VarInt::from_u32(0), b"done");
    }

    #[tokio::test]
    async fn test_unresolvable_address() {
        assert!(matches!(
            resolve("not an address").await,
            Err(TransportError::Connection(_))
        ));
    }
}
