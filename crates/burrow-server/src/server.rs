//! Listener wiring for the two server sockets.
//!
//! The control listener terminates TLS and feeds the action state
//! machine; the public listener stays plain TCP and feeds the SNI
//! dispatcher. Per-connection failures are logged and forgotten; a
//! failed accept on either listener ends the server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use burrow_tls::TlsError;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::control::{handle_control, ServerState};
use crate::pool;
use crate::public::handle_public;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TLS control listener (Register / Login / Tunnel / JoinPool).
    pub control_addr: SocketAddr,
    /// Plain-TCP public listener visitors connect to.
    pub public_addr: SocketAddr,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_addr: "0.0.0.0:8050".parse().unwrap(),
            public_addr: "0.0.0.0:443".parse().unwrap(),
            cert_path: PathBuf::from("serverCert.pem"),
            key_path: PathBuf::from("serverKey.pem"),
        }
    }
}

/// A bound but not yet running server.
pub struct Server {
    state: Arc<ServerState>,
    acceptor: TlsAcceptor,
    control: TcpListener,
    public: TcpListener,
}

impl Server {
    /// Bind both listeners and load the TLS material.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let acceptor = burrow_tls::build_acceptor(&config.cert_path, &config.key_path)?;
        let control = TcpListener::bind(config.control_addr).await?;
        let public = TcpListener::bind(config.public_addr).await?;

        Ok(Self {
            state: Arc::new(ServerState::new()),
            acceptor,
            control,
            public,
        })
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    pub fn control_addr(&self) -> std::io::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn public_addr(&self) -> std::io::Result<SocketAddr> {
        self.public.local_addr()
    }

    /// Run both accept loops and the pruner until a listener fails.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            state,
            acceptor,
            control,
            public,
        } = self;

        info!(addr = %control.local_addr()?, "control listener ready");
        info!(addr = %public.local_addr()?, "public listener ready");

        tokio::spawn(pool::run_pruner(state.pool.clone()));

        let control_loop = {
            let state = state.clone();
            tokio::spawn(async move { run_control_loop(control, acceptor, state).await })
        };
        let public_loop = tokio::spawn(async move { run_public_loop(public, state).await });

        // both loops only return on accept failure, which is fatal
        let failure = tokio::select! {
            result = control_loop => result,
            result = public_loop => result,
        };

        match failure {
            Ok(Err(e)) => {
                error!(error = %e, "listener failed");
                Err(e.into())
            }
            Ok(Ok(())) | Err(_) => Ok(()),
        }
    }
}

async fn run_control_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<ServerState>,
) -> std::io::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let state = state.clone();

        tokio::spawn(async move {
            let tls = match acceptor.accept(socket).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!(%peer, error = %e, "control TLS handshake failed");
                    return;
                }
            };
            if let Err(e) = handle_control(tls, state).await {
                debug!(%peer, error = %e, "control connection ended");
            }
        });
    }
}

async fn run_public_loop(listener: TcpListener, state: Arc<ServerState>) -> std::io::Result<()> {
    loop {
        let (socket, _peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(handle_public(socket, state));
    }
}
