use std::io;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to tunnel destination {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("timed out waiting for the tunnel connection to establish")]
    ConnectTimeout,

    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("tunnel connection closed or errored")]
    TunnelClosed,

    #[error("tunnel i/o error: {0}")]
    Io(#[source] io::Error),
}
