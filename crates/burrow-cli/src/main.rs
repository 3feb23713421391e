//! burrow - expose a local service on a public subdomain through a
//! reverse tunnel.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use burrow_client::{config, run_tunnel, ControlClient, Protocol, Service, TunnelContext};
use burrow_server::{Server, ServerConfig};

/// Reverse tunnels to a public subdomain.
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Expose local services through SNI-routed reverse tunnels", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Client-side commands
    #[command(subcommand)]
    Client(ClientCommands),
    /// Server-side commands
    #[command(subcommand)]
    Server(ServerCommands),
}

#[derive(Subcommand, Debug)]
enum ClientCommands {
    /// Obtain a new token from the server
    Register(RegisterArgs),
    /// Verify a token and persist it locally
    Login(LoginArgs),
    /// Start a tunnel for a local service
    Start(StartArgs),
}

#[derive(Subcommand, Debug)]
enum ServerCommands {
    /// Run the tunnel server
    Start(ServerStartArgs),
}

#[derive(Args, Debug)]
struct RegisterArgs {
    /// Control-port address of the server
    #[arg(long, default_value = "localhost:8050", env = "BURROW_SERVER_URL")]
    server_url: String,

    /// Skip TLS certificate verification (development only)
    #[arg(long)]
    insecure: bool,
}

#[derive(Args, Debug)]
struct LoginArgs {
    /// Token obtained from registration
    #[arg(long, env = "BURROW_TOKEN")]
    token: String,

    /// Control-port address of the server
    #[arg(long, default_value = "localhost:8050", env = "BURROW_SERVER_URL")]
    server_url: String,

    /// Skip TLS certificate verification (development only)
    #[arg(long)]
    insecure: bool,
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Protocol of the local service (http, https, tcp, tcps)
    #[arg(long, default_value = "http")]
    protocol: Protocol,

    /// Local port traffic is tunneled to
    #[arg(long)]
    port: u16,

    /// Subdomain to claim on the server's apex domain
    #[arg(long)]
    subdomain: String,

    /// Control-port address of the server
    #[arg(long, default_value = "localhost:8050", env = "BURROW_SERVER_URL")]
    server_url: String,

    /// Wildcard certificate used to terminate visitor TLS on workers
    #[arg(long, default_value = "serverCert.pem")]
    cert: PathBuf,

    /// Private key for the wildcard certificate
    #[arg(long, default_value = "serverKey.pem")]
    key: PathBuf,

    /// Skip TLS certificate verification (development only)
    #[arg(long)]
    insecure: bool,
}

#[derive(Args, Debug)]
struct ServerStartArgs {
    /// TLS control listener address
    #[arg(long, default_value = "0.0.0.0:8050")]
    control_addr: SocketAddr,

    /// Plain-TCP public listener address
    #[arg(long, default_value = "0.0.0.0:443")]
    public_addr: SocketAddr,

    /// TLS certificate for the control listener (PEM)
    #[arg(long, default_value = "serverCert.pem")]
    cert: PathBuf,

    /// TLS private key for the control listener (PEM)
    #[arg(long, default_value = "serverKey.pem")]
    key: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Client(ClientCommands::Register(args)) => client_register(args).await,
        Commands::Client(ClientCommands::Login(args)) => client_login(args).await,
        Commands::Client(ClientCommands::Start(args)) => client_start(args).await,
        Commands::Server(ServerCommands::Start(args)) => server_start(args).await,
    }
}

async fn client_register(args: RegisterArgs) -> Result<()> {
    info!("Connecting to {}...", args.server_url);
    let connector = burrow_tls::build_connector(args.insecure);
    let mut client = ControlClient::connect(&args.server_url, connector)
        .await
        .context("failed to reach the server")?;

    let token = client.register().await.context("registration failed")?;

    println!("Registration successful.");
    println!("Token: {token}");
    println!("Run `burrow client login --token <token>` to persist it.");
    Ok(())
}

async fn client_login(args: LoginArgs) -> Result<()> {
    info!("Connecting to {}...", args.server_url);
    let connector = burrow_tls::build_connector(args.insecure);
    let mut client = ControlClient::connect(&args.server_url, connector)
        .await
        .context("failed to reach the server")?;

    if !client.login(&args.token).await? {
        bail!("authentication failed: the server rejected this token");
    }

    let path = config::persist_token(&args.token).context("failed to save the token")?;
    println!("Authenticated. Token saved to {}", path.display());
    Ok(())
}

async fn client_start(args: StartArgs) -> Result<()> {
    let token = config::load_token().context("could not load a saved token")?;

    let connector = burrow_tls::build_connector(args.insecure);

    // Log in first; the tunnel request below re-submits the token since
    // the server keeps no per-connection login state.
    let mut client = ControlClient::connect(&args.server_url, connector.clone())
        .await
        .context("failed to reach the server")?;
    if !client.login(&token).await? {
        bail!("authentication failed: run `burrow client login` with a valid token");
    }
    drop(client);

    let acceptor = burrow_tls::build_acceptor(&args.cert, &args.key)
        .context("failed to load the wildcard certificate")?;

    let ctx = TunnelContext::new(args.server_url.clone(), connector, acceptor);
    let service = Service {
        protocol: args.protocol,
        local_port: args.port,
    };

    run_tunnel(ctx, &token, &args.subdomain, service)
        .await
        .context("tunnel ended")?;
    Ok(())
}

async fn server_start(args: ServerStartArgs) -> Result<()> {
    let config = ServerConfig {
        control_addr: args.control_addr,
        public_addr: args.public_addr,
        cert_path: args.cert,
        key_path: args.key,
    };

    let server = Server::bind(config).await.context("failed to start server")?;
    server.run().await.context("server stopped")?;
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
