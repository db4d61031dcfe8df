//! Outbound C-C connection setup (the active/dialing side): plain TCP, or
//! TCP plus an immediate TLS client handshake when the policy calls for it.
//! SOCKS proxy support is not part of this spec and is dropped; the shape
//! here — connect, then return boxed `AsyncRead`/`AsyncWrite` halves — is
//! the same one the engine uses for a non-proxied connection.
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use tigerwire_core::config::TlsPolicy;

use crate::tls::{self, Keyprint, TlsIdentity};

pub type BoxAsyncRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxAsyncWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Dial a peer. When `tls_policy` is `Preferred`, a TLS client handshake is
/// attempted first on the same socket; `Allowed` dials clear-text and lets
/// the peer upgrade; `Disabled` never wraps the stream in TLS. Returns the
/// peer certificate's keyprint when TLS was used, so the caller can verify
/// it against the value announced out of band.
pub async fn connect(
    addr: SocketAddr,
    tls: Option<&Arc<TlsIdentity>>,
    tls_policy: TlsPolicy,
) -> anyhow::Result<(BoxAsyncRead, BoxAsyncWrite, bool, Option<Keyprint>)> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true).ok();

    if tls_policy == TlsPolicy::Preferred {
        if let Some(identity) = tls {
            let server_name = rustls_pki_types::ServerName::IpAddress(addr.ip().into());
            let tls_stream = identity.connector.connect(server_name, stream).await?;
            let keyprint = tls_stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(tls::keyprint_of);
            let (read, write) = tokio::io::split(tls_stream);
            return Ok((Box::new(read), Box::new(write), true, keyprint));
        }
    }

    let (read, write) = stream.into_split();
    Ok((Box::new(read), Box::new(write), false, None))
}
