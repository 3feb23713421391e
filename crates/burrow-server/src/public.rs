//! Public-port dispatch: SNI routing onto pooled workers.
//!
//! Visitors speak raw TLS at this listener; the dispatcher only peeks
//! the ClientHello to pick a session, then splices bytes verbatim. The
//! visitor's TLS terminates inside the client's worker, never here.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::control::ServerState;
use crate::pool::{ConnectionPool, PoolError, PooledConn, Session};
use crate::sni::{self, SniError};

/// How long a visitor may wait for an idle worker.
const ACQUIRE_DEADLINE: Duration = Duration::from_secs(5);
/// Pause between pool polls while waiting.
const ACQUIRE_RETRY: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Sni(#[from] SniError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("no idle worker became available within the deadline")]
    AcquireTimeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serve one public connection; errors drop the visitor and nothing else.
pub async fn handle_public(visitor: TcpStream, state: Arc<ServerState>) {
    let peer = visitor.peer_addr().ok();
    if let Err(e) = dispatch(visitor, state).await {
        debug!(?peer, error = %e, "public connection dropped");
    }
}

async fn dispatch(visitor: TcpStream, state: Arc<ServerState>) -> Result<(), DispatchError> {
    let sni = sni::peek_sni(&visitor).await?;
    let subdomain = subdomain_of(&sni).ok_or(SniError::NoSni)?;

    let session = state.pool.get_session(subdomain)?;
    debug!(%sni, subdomain, "visitor routed");

    let conn = acquire_worker(&state.pool, &session).await?;
    splice(visitor, conn).await;
    Ok(())
}

/// The leftmost DNS label of an SNI hostname is the routing key.
fn subdomain_of(sni: &str) -> Option<&str> {
    sni.split('.').next().filter(|label| !label.is_empty())
}

/// Pop an idle worker, asking the client for more at most once per
/// visitor, bounded by the acquire deadline.
async fn acquire_worker(
    pool: &ConnectionPool,
    session: &Arc<Session>,
) -> Result<PooledConn, DispatchError> {
    let deadline = Instant::now() + ACQUIRE_DEADLINE;
    let mut requested_more = false;

    loop {
        match pool.get_conn(session.session_id()) {
            Ok(conn) => return Ok(conn),
            Err(PoolError::PoolEmpty) => {
                if !requested_more {
                    if let Err(e) = session.open_more().await {
                        warn!(
                            subdomain = %session.subdomain(),
                            error = %e,
                            "failed to request more workers"
                        );
                    }
                    requested_more = true;
                }
                if Instant::now() >= deadline {
                    return Err(DispatchError::AcquireTimeout);
                }
                tokio::time::sleep(ACQUIRE_RETRY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Copy bytes both ways until either side ends, then close both and
/// release the worker's JoinPool handler.
async fn splice(visitor: TcpStream, conn: PooledConn) {
    let (worker, done) = conn.into_parts();
    let (mut worker_rd, mut worker_wr) = tokio::io::split(worker);
    let (mut visitor_rd, mut visitor_wr) = visitor.into_split();

    // The peeked ClientHello is still unread on the visitor socket, so
    // the first copy direction forwards it before anything else.
    tokio::select! {
        result = tokio::io::copy(&mut visitor_rd, &mut worker_wr) => {
            match result {
                Ok(bytes) => debug!(bytes, "visitor side ended"),
                Err(e) => debug!(error = %e, "visitor side failed"),
            }
        }
        result = tokio::io::copy(&mut worker_rd, &mut visitor_wr) => {
            match result {
                Ok(bytes) => debug!(bytes, "worker side ended"),
                Err(e) => debug!(error = %e, "worker side failed"),
            }
        }
    }

    let _ = done.send(());
}
