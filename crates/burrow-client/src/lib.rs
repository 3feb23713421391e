//! Client half of the burrow reverse-tunnel service.
//!
//! The supervisor keeps one TLS control channel open per tunnel and
//! spawns pool workers on server demand; each worker parks itself on
//! the server, terminates the visitor's TLS when a splice arrives, and
//! proxies to the local service. HTTP traffic is teed through a
//! request/response sniffer for pretty-printed logging.

use thiserror::Error;

pub mod config;
pub mod control;
pub mod service;
pub mod sniffer;
pub mod tunnel;
pub mod worker;

pub use control::ControlClient;
pub use service::{Protocol, Service, ServiceMap};
pub use tunnel::{run_tunnel, TunnelContext};

/// Client-side errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server address: {0}")]
    InvalidServerAddress(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(#[source] std::io::Error),

    #[error("failed to dial local service on port {port}: {source}")]
    LocalDialFailed {
        port: u16,
        source: std::io::Error,
    },

    #[error("authentication failed: the server does not know this token")]
    LoginRejected,

    #[error("the server rejected the tunnel request")]
    TunnelRejected,

    #[error("the server rejected the pool join")]
    JoinRejected,

    #[error("no service registered for this session")]
    UnknownSession,

    #[error("unexpected reply from server: {0}")]
    Protocol(&'static str),

    #[error(transparent)]
    Wire(#[from] burrow_proto::WireError),

    #[error(transparent)]
    Tls(#[from] burrow_tls::TlsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
