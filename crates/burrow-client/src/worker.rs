//! Pool workers: pre-opened connections that each serve one visitor.
//!
//! A worker joins the session's pool over a fresh control connection
//! and then waits, parked server-side, for a visitor to be spliced on.
//! The visitor's TLS rides inside the control TLS and terminates here
//! (the public server never decrypts), after which the worker dials the
//! local service and copies bytes both ways until either side closes.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

use crate::control::ControlClient;
use crate::service::Service;
use crate::sniffer;
use crate::tunnel::TunnelContext;
use crate::ClientError;

const COPY_BUF: usize = 8192;

/// Join the pool for `session_id` and serve one public exchange.
pub async fn run_worker(ctx: Arc<TunnelContext>, session_id: String) -> Result<(), ClientError> {
    let mut control = ControlClient::connect(&ctx.server_addr, ctx.connector.clone()).await?;
    if !control.join_pool(&session_id).await? {
        return Err(ClientError::JoinRejected);
    }
    let parked = control.into_stream();

    // Parked: the accept below sits idle until the server splices a
    // visitor onto this socket and their ClientHello arrives.
    let visitor = ctx
        .acceptor
        .accept(parked)
        .await
        .map_err(ClientError::TlsHandshakeFailed)?;
    debug!(session_id, "visitor attached to worker");

    let service = ctx
        .services
        .get(&session_id)
        .ok_or(ClientError::UnknownSession)?;

    let local = TcpStream::connect(("127.0.0.1", service.local_port))
        .await
        .map_err(|source| ClientError::LocalDialFailed {
            port: service.local_port,
            source,
        })?;

    if service.protocol.is_tls() {
        // the local hop is almost always a self-signed dev service
        let connector = burrow_tls::build_connector(true);
        let name = ServerName::try_from("localhost".to_string())
            .map_err(|_| ClientError::InvalidServerAddress("localhost".to_string()))?;
        let local = connector
            .connect(name, local)
            .await
            .map_err(ClientError::TlsHandshakeFailed)?;
        serve(visitor, local, service, &ctx).await
    } else {
        serve(visitor, local, service, &ctx).await
    }
}

/// Splice visitor and local service, teeing HTTP traffic into the sniffer.
async fn serve<V, L>(
    visitor: V,
    local: L,
    service: Service,
    ctx: &Arc<TunnelContext>,
) -> Result<(), ClientError>
where
    V: AsyncRead + AsyncWrite + Send + Unpin,
    L: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (request_tap, response_tap) = if service.protocol.is_http() {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        tokio::spawn(sniffer::observe_requests(request_rx, ctx.traffic.clone()));
        tokio::spawn(sniffer::observe_responses(response_rx, ctx.traffic.clone()));
        (Some(request_tx), Some(response_tx))
    } else {
        (None, None)
    };

    let (mut visitor_rd, mut visitor_wr) = tokio::io::split(visitor);
    let (mut local_rd, mut local_wr) = tokio::io::split(local);

    tokio::select! {
        result = pump(&mut visitor_rd, &mut local_wr, request_tap) => {
            match result {
                Ok(bytes) => debug!(bytes, "visitor to local ended"),
                Err(e) => debug!(error = %e, "visitor to local failed"),
            }
        }
        result = pump(&mut local_rd, &mut visitor_wr, response_tap) => {
            match result {
                Ok(bytes) => debug!(bytes, "local to visitor ended"),
                Err(e) => debug!(error = %e, "local to visitor failed"),
            }
        }
    }

    Ok(())
}

/// Copy one direction, mirroring every chunk into the tap.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    tap: Option<UnboundedSender<Vec<u8>>>,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if let Some(tap) = &tap {
            // the sniffer lagging or dying never stalls the splice
            let _ = tap.send(buf[..n].to_vec());
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    Ok(total)
}
