//! The inbound side of a hub's "incoming connection" callback: bind a TCP
//! listener and hand each accepted socket to a caller-supplied callback as
//! a fresh connection. No uTP, no UPnP port forwarding — just the
//! bind-and-accept-loop.
use std::net::SocketAddr;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connect::{BoxAsyncRead, BoxAsyncWrite};

pub struct Listener {
    tcp: TcpListener,
    pub local_addr: SocketAddr,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let tcp = TcpListener::bind(addr)
            .await
            .context("error starting TCP listener")?;
        let local_addr = tcp.local_addr()?;
        info!(addr = %local_addr, "listening for incoming peer connections");
        Ok(Self { tcp, local_addr })
    }

    /// Accept connections forever, invoking `on_accept` for each with the
    /// peer's address and the two split socket halves. Runs until
    /// `cancellation_token` fires or the listener errors.
    pub async fn serve<F>(self, cancellation_token: CancellationToken, mut on_accept: F)
    where
        F: FnMut(SocketAddr, BoxAsyncRead, BoxAsyncWrite),
    {
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("listener shutting down");
                    return;
                }
                accepted = self.tcp.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            stream.set_nodelay(true).ok();
                            let (read, write) = stream.into_split();
                            on_accept(peer_addr, Box::new(read), Box::new(write));
                        }
                        Err(e) => {
                            warn!(error = %e, "error accepting TCP connection");
                        }
                    }
                }
            }
        }
    }
}
