//! Tunnel supervision: keep the control channel open and grow the
//! worker fleet on server demand.

use std::sync::Arc;

use burrow_proto::credentials;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

use crate::control::ControlClient;
use crate::service::{Service, ServiceMap};
use crate::sniffer::TrafficLog;
use crate::worker;
use crate::ClientError;

/// Everything a tunnel and its workers share.
pub struct TunnelContext {
    /// Control-port address, `host:port`.
    pub server_addr: String,
    /// Client TLS for control connections.
    pub connector: TlsConnector,
    /// Wildcard material for second-hop TLS termination on workers.
    pub acceptor: TlsAcceptor,
    pub services: ServiceMap,
    pub traffic: Arc<TrafficLog>,
}

impl TunnelContext {
    pub fn new(server_addr: String, connector: TlsConnector, acceptor: TlsAcceptor) -> Arc<Self> {
        Arc::new(Self {
            server_addr,
            connector,
            acceptor,
            services: ServiceMap::default(),
            traffic: Arc::new(TrafficLog::default()),
        })
    }

    /// Apex domain visitors use, i.e. the server host without the port.
    pub fn apex(&self) -> &str {
        self.server_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.server_addr)
    }
}

/// Establish a tunnel and supervise it until the control channel dies.
///
/// The server pushes a u32 over the control channel whenever the pool
/// runs dry; each push spawns that many workers. Any read error ends
/// the supervisor, and with it the server-side session.
pub async fn run_tunnel(
    ctx: Arc<TunnelContext>,
    token: &str,
    subdomain: &str,
    service: Service,
) -> Result<(), ClientError> {
    let mut control = ControlClient::connect(&ctx.server_addr, ctx.connector.clone()).await?;

    let session_id = credentials::generate();
    let accepted = control.tunnel(token, &session_id, subdomain).await?;
    if !accepted {
        info!("Error establishing tunnel");
        return Err(ClientError::TunnelRejected);
    }

    info!(
        "Tunnel established! Access your service at https://{}.{}",
        subdomain,
        ctx.apex()
    );

    ctx.services.insert(session_id.clone(), service);
    let result = spawn_loop(&mut control, &ctx, &session_id).await;
    ctx.services.remove(&session_id);
    result
}

async fn spawn_loop(
    control: &mut ControlClient,
    ctx: &Arc<TunnelContext>,
    session_id: &str,
) -> Result<(), ClientError> {
    loop {
        let count = control.next_spawn_count().await?;
        debug!(count, "server requested more workers");

        for _ in 0..count {
            let ctx = ctx.clone();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = worker::run_worker(ctx, session_id).await {
                    debug!(error = %e, "pool worker ended");
                }
            });
        }
    }
}
