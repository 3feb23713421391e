//! Client side of the control protocol.
//!
//! One action per connection: the server reads a single action code and
//! runs its handler, so every operation here starts from a fresh TLS
//! dial. `Tunnel` and `JoinPool` keep the stream afterwards, as the
//! supervisor's control channel and a parked worker respectively.

use burrow_proto::{codec, Action};
use rustls::pki_types::ServerName;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::ClientError;

pub struct ControlClient {
    stream: TlsStream<TcpStream>,
    address: String,
    connector: TlsConnector,
}

impl ControlClient {
    /// Dial TLS to the server's control port (`host:port`).
    pub async fn connect(address: &str, connector: TlsConnector) -> Result<Self, ClientError> {
        let host = address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(address);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ClientError::InvalidServerAddress(address.to_string()))?;

        let tcp = TcpStream::connect(address).await?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(ClientError::TlsHandshakeFailed)?;

        debug!(address, "control channel connected");
        Ok(Self {
            stream,
            address: address.to_string(),
            connector,
        })
    }

    /// Open a fresh control connection to the same server.
    pub async fn reconnect(&self) -> Result<Self, ClientError> {
        Self::connect(&self.address, self.connector.clone()).await
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Request a new token.
    pub async fn register(&mut self) -> Result<String, ClientError> {
        codec::write_u32(&mut self.stream, Action::Register.code()).await?;
        self.stream.flush().await?;

        let token = codec::read_lp_bytes(&mut self.stream).await?;
        String::from_utf8(token).map_err(|_| ClientError::Protocol("token is not valid UTF-8"))
    }

    /// Check a token against the server.
    pub async fn login(&mut self, token: &str) -> Result<bool, ClientError> {
        codec::write_u32(&mut self.stream, Action::Login.code()).await?;
        codec::write_lp_bytes(&mut self.stream, token.as_bytes()).await?;
        self.stream.flush().await?;

        Ok(codec::read_bool(&mut self.stream).await?)
    }

    /// Request a tunnel. On `true` this stream is the live control
    /// channel the server pushes spawn counts over.
    pub async fn tunnel(
        &mut self,
        token: &str,
        session_id: &str,
        subdomain: &str,
    ) -> Result<bool, ClientError> {
        codec::write_u32(&mut self.stream, Action::Tunnel.code()).await?;
        codec::write_lp_bytes(&mut self.stream, token.as_bytes()).await?;
        codec::write_lp_bytes(&mut self.stream, session_id.as_bytes()).await?;
        codec::write_lp_bytes(&mut self.stream, subdomain.as_bytes()).await?;
        self.stream.flush().await?;

        Ok(codec::read_bool(&mut self.stream).await?)
    }

    /// Offer this connection to the session's worker pool. On `true`
    /// the socket is parked server-side until a visitor is spliced on.
    pub async fn join_pool(&mut self, session_id: &str) -> Result<bool, ClientError> {
        codec::write_u32(&mut self.stream, Action::JoinPool.code()).await?;
        codec::write_lp_bytes(&mut self.stream, session_id.as_bytes()).await?;
        self.stream.flush().await?;

        Ok(codec::read_bool(&mut self.stream).await?)
    }

    /// Read the next spawn-count push on an established tunnel channel.
    pub async fn next_spawn_count(&mut self) -> Result<u32, ClientError> {
        Ok(codec::read_u32(&mut self.stream).await?)
    }

    /// Surrender the underlying TLS stream (for parked workers).
    pub fn into_stream(self) -> TlsStream<TcpStream> {
        self.stream
    }
}
