//! TLS layer.
//!
//! `TlsSession` wraps a `rustls::ClientConnection` without owning any socket:
//! ciphertext goes in through [`TlsSession::read_tls`] and comes out of
//! [`TlsSession::encrypt`] / [`TlsSession::take_outgoing`]. The transport
//! shares one session between its read half and its write half.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::io::{Read, Write};
use std::sync::Arc;

use crate::endpoint::Address;
use crate::error::{QuayError, Result};

/// TLS settings for the broker connection.
///
/// # Examples
///
/// ```
/// use quay_core::transport::tls::TlsOptions;
///
/// let opts = TlsOptions::insecure().with_server_name("nsqd.internal");
/// assert!(opts.insecure_skip_verify);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Name checked against the broker certificate. Defaults to the host
    /// part of the broker address.
    pub server_name: Option<String>,

    /// Trust anchors used to verify the broker certificate.
    pub roots: Option<Arc<RootCertStore>>,

    /// Accept any certificate. Only for test setups with self-signed certs.
    pub insecure_skip_verify: bool,
}

impl TlsOptions {
    /// Verify the broker against the given roots.
    pub fn with_roots(roots: RootCertStore) -> Self {
        Self {
            roots: Some(Arc::new(roots)),
            ..Self::default()
        }
    }

    /// Accept any broker certificate.
    pub fn insecure() -> Self {
        Self {
            insecure_skip_verify: true,
            ..Self::default()
        }
    }

    /// Override the name sent in SNI and checked against the certificate
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| QuayError::tls(e.to_string()))?;

        let config = if self.insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
                .with_no_client_auth()
        } else {
            let roots = self.roots.clone().ok_or_else(|| {
                QuayError::config("TLS requires root certificates or insecure_skip_verify")
            })?;
            builder.with_root_certificates(roots).with_no_client_auth()
        };
        Ok(Arc::new(config))
    }
}

/// Client side of one TLS session, driven by the transport.
pub struct TlsSession {
    conn: ClientConnection,
}

impl TlsSession {
    /// Start a client handshake towards `address`.
    pub fn new(options: &TlsOptions, address: &Address) -> Result<Self> {
        let name = options
            .server_name
            .clone()
            .or_else(|| address.host().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string());
        let server_name = ServerName::try_from(name)
            .map_err(|e| QuayError::tls(format!("invalid server name: {e}")))?;

        let conn = ClientConnection::new(options.client_config()?, server_name)
            .map_err(|e| QuayError::tls(e.to_string()))?;
        Ok(Self { conn })
    }

    #[inline]
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Feed ciphertext received from the socket; returns any plaintext it
    /// unlocked.
    pub fn read_tls(&mut self, mut data: &[u8]) -> Result<Vec<u8>> {
        let mut plain = Vec::new();
        while !data.is_empty() {
            let n = self
                .conn
                .read_tls(&mut data)
                .map_err(|e| QuayError::tls(e.to_string()))?;
            if n == 0 {
                break;
            }
            let state = self
                .conn
                .process_new_packets()
                .map_err(|e| QuayError::tls(e.to_string()))?;

            let available = state.plaintext_bytes_to_read();
            if available > 0 {
                let start = plain.len();
                plain.resize(start + available, 0);
                self.conn
                    .reader()
                    .read_exact(&mut plain[start..])
                    .map_err(|e| QuayError::tls(e.to_string()))?;
            }
        }
        Ok(plain)
    }

    /// Encrypt application bytes into records ready for the socket.
    pub fn encrypt(&mut self, plain: &[u8]) -> Result<Vec<u8>> {
        self.conn
            .writer()
            .write_all(plain)
            .map_err(|e| QuayError::tls(e.to_string()))?;
        self.take_outgoing()
    }

    /// Drain handshake or alert records waiting to be sent.
    pub fn take_outgoing(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut out)
                .map_err(|e| QuayError::tls(e.to_string()))?;
        }
        Ok(out)
    }

    /// Queue a close_notify alert.
    pub fn close(&mut self) -> Result<Vec<u8>> {
        self.conn.send_close_notify();
        self.take_outgoing()
    }
}

// Certificate verifier that accepts anything
#[derive(Debug)]
struct NoCertVerifier;

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::{ServerConfig, ServerConnection};

    pub(crate) fn self_signed() -> (CertificateDer<'static>, Arc<ServerConfig>) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .unwrap();
        (cert_der, Arc::new(config))
    }

    fn server_feed(server: &mut ServerConnection, mut data: &[u8]) -> Vec<u8> {
        let mut plain = Vec::new();
        while !data.is_empty() {
            server.read_tls(&mut data).unwrap();
            server.process_new_packets().unwrap();
            let _ = server.reader().read_to_end(&mut plain);
        }
        plain
    }

    fn server_out(server: &mut ServerConnection) -> Vec<u8> {
        let mut out = Vec::new();
        while server.wants_write() {
            server.write_tls(&mut out).unwrap();
        }
        out
    }

    fn handshake(client: &mut TlsSession, server: &mut ServerConnection) {
        for _ in 0..10 {
            let to_server = client.take_outgoing().unwrap();
            server_feed(server, &to_server);
            let to_client = server_out(server);
            client.read_tls(&to_client).unwrap();
            if !client.is_handshaking() && !server.is_handshaking() {
                return;
            }
        }
        panic!("handshake did not complete");
    }

    #[test]
    fn test_handshake_and_data_with_roots() {
        let (cert, server_config) = self_signed();
        let mut roots = RootCertStore::empty();
        roots.add(cert).unwrap();

        let address = Address::tcp("localhost", 4150);
        let mut client = TlsSession::new(&TlsOptions::with_roots(roots), &address).unwrap();
        let mut server = ServerConnection::new(server_config).unwrap();
        handshake(&mut client, &mut server);

        let records = client.encrypt(b"SUB orders archive\n").unwrap();
        assert_eq!(server_feed(&mut server, &records), b"SUB orders archive\n");

        server.writer().write_all(b"OK").unwrap();
        let records = server_out(&mut server);
        assert_eq!(client.read_tls(&records).unwrap(), b"OK");
    }

    #[test]
    fn test_insecure_accepts_unknown_cert() {
        let (_cert, server_config) = self_signed();
        let address = Address::tcp("127.0.0.1", 4150);
        let opts = TlsOptions::insecure().with_server_name("localhost");
        let mut client = TlsSession::new(&opts, &address).unwrap();
        let mut server = ServerConnection::new(server_config).unwrap();
        handshake(&mut client, &mut server);
        assert!(!client.is_handshaking());
    }

    #[test]
    fn test_unknown_cert_rejected() {
        let (_cert, server_config) = self_signed();
        let address = Address::tcp("localhost", 4150);
        let mut client =
            TlsSession::new(&TlsOptions::with_roots(RootCertStore::empty()), &address).unwrap();
        let mut server = ServerConnection::new(server_config).unwrap();

        let hello = client.take_outgoing().unwrap();
        server_feed(&mut server, &hello);
        let reply = server_out(&mut server);
        assert!(matches!(client.read_tls(&reply), Err(QuayError::Tls(_))));
    }

    #[test]
    fn test_missing_roots_is_config_error() {
        let address = Address::tcp("localhost", 4150);
        assert!(matches!(
            TlsSession::new(&TlsOptions::default(), &address),
            Err(QuayError::Configuration(_))
        ));
    }
}
