//! Server side of the control protocol.
//!
//! Every connection accepted on the control port runs through
//! [`handle_control`]: read one action code, dispatch, close. Tunnel
//! and JoinPool keep the socket alive afterwards, as the session
//! control channel and a parked pool worker respectively. Failures are
//! fatal to the single connection only.

use std::sync::Arc;

use burrow_proto::{codec, credentials, Action, WireError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::pool::{ConnectionPool, PooledConn, SharedTunnelWriter, TunnelWriter};
use crate::token_store::TokenStore;

/// Shared server state handed to every connection handler.
///
/// Injected explicitly rather than living in a global so tests can run
/// isolated instances side by side.
pub struct ServerState {
    pub pool: Arc<ConnectionPool>,
    pub tokens: TokenStore,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new()),
            tokens: TokenStore::new(),
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Control-connection errors.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid action code: {0}")]
    InvalidAction(u32),

    #[error("token is not known to this server")]
    InvalidToken,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serve one control connection to completion.
pub async fn handle_control<S>(stream: S, state: Arc<ServerState>) -> Result<(), ControlError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut stream = stream;
    let code = codec::read_u32(&mut stream).await?;
    let action = Action::try_from(code).map_err(|e| ControlError::InvalidAction(e.0))?;

    match action {
        Action::Register => handle_register(stream, state).await,
        Action::Login => handle_login(stream, state).await,
        Action::Tunnel => handle_tunnel(stream, state).await,
        Action::JoinPool => handle_join_pool(stream, state).await,
        // reserved code with no shipped handler
        Action::Connect => Err(ControlError::InvalidAction(code)),
    }
}

async fn handle_register<S>(mut stream: S, state: Arc<ServerState>) -> Result<(), ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let token = credentials::generate();
    state.tokens.insert(token.clone(), String::new());

    codec::write_lp_bytes(&mut stream, token.as_bytes()).await?;
    stream.flush().await?;
    info!("issued a new token");
    Ok(())
}

async fn handle_login<S>(mut stream: S, state: Arc<ServerState>) -> Result<(), ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let token = codec::read_lp_string(&mut stream).await?;
    let known = state.tokens.contains(&token);

    codec::write_bool(&mut stream, known).await?;
    stream.flush().await?;
    debug!(known, "login attempt");
    Ok(())
}

/// Establish a session and hold its control channel open.
///
/// The read half turns into a one-byte keepalive probe: the session
/// lives exactly as long as this socket, and any read error or EOF
/// tears it down together with every still-idle worker.
async fn handle_tunnel<S>(stream: S, state: Arc<ServerState>) -> Result<(), ControlError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let tunnel: SharedTunnelWriter =
        Arc::new(tokio::sync::Mutex::new(Box::new(writer) as TunnelWriter));

    let token = codec::read_lp_string(&mut reader).await?;
    if !state.tokens.contains(&token) {
        write_reply(&tunnel, false).await?;
        return Err(ControlError::InvalidToken);
    }

    let session_id = codec::read_lp_string(&mut reader).await?;
    let subdomain = codec::read_lp_string(&mut reader).await?;

    let session = match state
        .pool
        .add_session(&session_id, &subdomain, tunnel.clone())
    {
        Ok(session) => session,
        Err(e) => {
            warn!(subdomain = %subdomain, error = %e, "tunnel rejected");
            write_reply(&tunnel, false).await?;
            return Ok(());
        }
    };

    if let Err(e) = write_reply(&tunnel, true).await {
        let _ = state.pool.remove_session(&session_id);
        return Err(e.into());
    }
    info!(subdomain = %session.subdomain(), "session established");

    // keepalive: block until the control socket dies
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    let _ = state.pool.remove_session(&session_id);
    info!(subdomain = %session.subdomain(), "session closed");
    Ok(())
}

/// Park a worker connection in the pool until a public splice uses it.
async fn handle_join_pool<S>(mut stream: S, state: Arc<ServerState>) -> Result<(), ControlError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let session_id = codec::read_lp_string(&mut stream).await?;
    let known = state.pool.has_session(&session_id);

    codec::write_bool(&mut stream, known).await?;
    stream.flush().await?;
    if !known {
        debug!("join for unknown session");
        return Ok(());
    }

    let (conn, done) = PooledConn::new(session_id.clone(), Box::new(stream));
    if let Err(e) = state.pool.put_conn(&session_id, conn) {
        warn!(error = %e, "failed to park worker");
        return Ok(());
    }

    // The socket now belongs to the pool; wait here until the splice
    // completes or the pruner / session teardown drops the worker.
    let _ = done.await;
    Ok(())
}

async fn write_reply(tunnel: &SharedTunnelWriter, ok: bool) -> std::io::Result<()> {
    let mut writer = tunnel.lock().await;
    codec::write_bool(&mut *writer, ok).await?;
    writer.flush().await
}
