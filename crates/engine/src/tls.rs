//! TLS record detection, acceptor/connector setup, and keyprint computation.
//! Trust-on-first-use for hub certificates, strict verification against
//! peer INF-announced keyprints.
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls_pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub type Keyprint = [u8; 32];

/// Replays a handful of already-consumed bytes before delegating to the
/// inner reader — how `Conn` "peeks" the first byte to tell a TLS
/// ClientHello from clear text without losing it: the byte is read from
/// the socket, inspected, and then prepended back for the real TLS or
/// line-framing reader to consume.
pub struct PrefixedReader<R> {
    prefix: Vec<u8>,
    prefix_pos: usize,
    inner: R,
}

impl<R> PrefixedReader<R> {
    pub fn new(prefix: Vec<u8>, inner: R) -> Self {
        Self {
            prefix,
            prefix_pos: 0,
            inner,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PrefixedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.prefix_pos < self.prefix.len() {
            let remaining = &self.prefix[self.prefix_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.prefix_pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// A TLS record's content-type byte range (handshake, alert, etc.) per
/// RFC 8446 §5.1 — peeking this one byte is how `Conn` tells a TLS
/// ClientHello from a clear-text `$`/`C` first byte.
pub fn looks_like_tls_record(first_byte: u8) -> bool {
    (0x14..=0x17).contains(&first_byte)
}

pub fn keyprint_of(cert: &CertificateDer<'_>) -> Keyprint {
    let mut hasher = Sha256::new();
    hasher.update(cert.as_ref());
    hasher.finalize().into()
}

/// Accepts inbound TLS using a self-signed identity; the leaf certificate's
/// keyprint is what peers announce out of band (ADC `KP`) and is verified
/// by the caller against the announced value, not by the TLS stack itself —
/// DC has no CA hierarchy.
#[derive(Clone)]
pub struct TlsIdentity {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
    pub keyprint: Keyprint,
}

impl TlsIdentity {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        key: rustls_pki_types::PrivateKeyDer<'static>,
    ) -> anyhow::Result<Self> {
        let keyprint = keyprint_of(&cert_chain[0]);

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain.clone(), key.clone_key())?;

        let client_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth();

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
            keyprint,
        })
    }
}

/// DC peers authenticate out of band via keyprint, not via a CA chain —
/// the certificate itself is accepted unconditionally here, and the
/// keyprint comparison happens one layer up once the handshake completes.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls_pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Trust policy applied once a keyprint is known.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KeyprintPolicy {
    /// Hub TLS connections: accept on first use, there is nothing to
    /// compare against yet.
    TrustOnFirstUse,
    /// Peer C-C connections: the ADC `KP` value announced in INF is
    /// authoritative; any mismatch is fatal.
    Strict,
}

pub fn check_keyprint(
    policy: KeyprintPolicy,
    observed: &Keyprint,
    expected: Option<&Keyprint>,
) -> bool {
    match (policy, expected) {
        (KeyprintPolicy::TrustOnFirstUse, _) => true,
        (KeyprintPolicy::Strict, Some(exp)) => observed == exp,
        (KeyprintPolicy::Strict, None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_record_bytes_are_recognized() {
        assert!(looks_like_tls_record(0x16)); // handshake
        assert!(!looks_like_tls_record(b'$'));
        assert!(!looks_like_tls_record(b'C'));
    }

    #[test]
    fn strict_policy_requires_exact_match() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert!(check_keyprint(KeyprintPolicy::Strict, &a, Some(&a)));
        assert!(!check_keyprint(KeyprintPolicy::Strict, &a, Some(&b)));
        assert!(!check_keyprint(KeyprintPolicy::Strict, &a, None));
    }

    #[test]
    fn trust_on_first_use_always_passes() {
        let a = [1u8; 32];
        assert!(check_keyprint(KeyprintPolicy::TrustOnFirstUse, &a, None));
    }

    #[tokio::test]
    async fn prefixed_reader_replays_the_peeked_byte_first() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let (mut writer, reader_half) = tokio::io::duplex(64);
        writer.write_all(b"SUP ADBASE\n").await.unwrap();
        drop(writer);
        let mut reader = PrefixedReader::new(vec![b'C'], reader_half);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"CSUP ADBASE\n");
    }
}
