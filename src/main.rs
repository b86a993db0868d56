//! iap - authenticated TCP tunnels to private instances through a relay
//!
//! Opens a loopback port that forwards to an instance's port (RDP by default),
//! runs the reference relay, and mints development tokens.

mod config;
mod rdp;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{ConfigManager, IapConfig};
use iap_auth::{Authorizer, JwtAuthorizer, JwtValidator, RelayClaims, StaticAuthorizer};
use iap_proto::{Target, DEFAULT_INTERFACE};
use iap_relay::{RelayServer, RelayServerConfig, RouteTable};
use iap_transport::{ReconnectConfig, RelayConfig};
use iap_tunnel::{TunnelConfig, TunnelSession};
use rdp::{AudioMode, ConnectionBar, DesktopSize, RdpSettings};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "iap")]
#[command(about = "Authenticated TCP tunnels to private instances through a relay")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a tunnel to an instance and listen on a local port
    #[command(long_about = r#"
Open a tunnel to a port on a private instance. The tunnel listens on a
loopback port; point your client (an RDP client, ssh, ...) at it.

EXAMPLES:
  # RDP to a Windows instance, writing a connection file
  iap connect --relay wss://relay.example.com \
    --project my-project --zone us-central1-a --instance win-1 \
    --token $IAP_TOKEN --rdp-file win-1.rdp

  # SSH through a development relay sharing a JWT secret
  iap connect --relay ws://127.0.0.1:8080 --jwt-secret dev-secret \
    --project p --zone z --instance vm --port 22 --local-port 2222

ENVIRONMENT VARIABLES:
  IAP_RELAY        Relay base URL
  IAP_TOKEN        Bearer token
  IAP_JWT_SECRET   Secret for minting tokens locally
    "#)]
    Connect(ConnectArgs),

    /// Run the reference relay
    Relay {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Route as project/zone/instance:port=host:port (repeatable)
        #[arg(long = "route", required = true)]
        routes: Vec<String>,

        /// Secret for validating bearer tokens (omit to accept any caller)
        #[arg(long, env = "IAP_JWT_SECRET")]
        jwt_secret: Option<String>,

        /// Seconds a dropped session waits to be resumed
        #[arg(long, default_value = "60")]
        session_linger_secs: u64,
    },

    /// Mint a development token for a relay sharing the secret
    Token {
        #[arg(long, env = "IAP_JWT_SECRET")]
        jwt_secret: String,

        #[arg(long, default_value = "iap-cli")]
        subject: String,

        /// Token lifetime in seconds
        #[arg(long, default_value = "3600")]
        validity_secs: i64,

        /// Target the token may reach: project/zone/instance[:port] or * (repeatable)
        #[arg(long = "allow")]
        allowed_targets: Vec<String>,
    },

    /// Manage stored defaults
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Relay base URL (ws:// or wss://)
    #[arg(long, env = "IAP_RELAY")]
    relay: Option<String>,

    #[arg(long)]
    project: String,

    #[arg(long)]
    zone: String,

    #[arg(long)]
    instance: String,

    /// Destination port on the instance
    #[arg(long, default_value = "3389")]
    port: u16,

    #[arg(long, default_value = DEFAULT_INTERFACE)]
    interface: String,

    /// Local port to listen on (0 = any free port)
    #[arg(long, default_value = "0")]
    local_port: u16,

    /// Bearer token (falls back to the stored token)
    #[arg(long, env = "IAP_TOKEN")]
    token: Option<String>,

    /// Mint tokens locally with this secret instead of using --token
    #[arg(long, env = "IAP_JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Silent reconnect attempts before the tunnel fails
    #[arg(long, default_value = "3")]
    max_reconnect_attempts: usize,

    /// Handshake deadline in seconds
    #[arg(long, default_value = "15")]
    handshake_timeout_secs: u64,

    /// Write a Remote Desktop connection file for the tunnel
    #[arg(long)]
    rdp_file: Option<PathBuf>,

    #[arg(long)]
    rdp_username: Option<String>,

    #[arg(long, value_enum, default_value_t = ConnectionBar::AutoHide)]
    connection_bar: ConnectionBar,

    #[arg(long, value_enum, default_value_t = DesktopSize::ClientSize)]
    desktop_size: DesktopSize,

    #[arg(long, value_enum, default_value_t = AudioMode::PlayLocally)]
    audio_mode: AudioMode,

    #[arg(long)]
    redirect_clipboard: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Set the default relay URL
    SetRelay { url: String },
    /// Set the default bearer token
    SetToken { token: String },
    /// Clear the default bearer token
    ClearToken,
    /// Print the stored defaults
    Show,
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Cancelled on Ctrl+C
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            signal.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Connect(args) => {
            let defaults = ConfigManager::new()?.load()?;
            run_connect(args, defaults).await
        }
        Commands::Relay {
            bind,
            routes,
            jwt_secret,
            session_linger_secs,
        } => run_relay(bind, routes, jwt_secret, session_linger_secs).await,
        Commands::Token {
            jwt_secret,
            subject,
            validity_secs,
            allowed_targets,
        } => {
            let mut claims = RelayClaims::new(
                subject,
                "iap".to_string(),
                "iap-relay".to_string(),
                chrono::Duration::seconds(validity_secs),
            );
            if !allowed_targets.is_empty() {
                claims = claims.with_allowed_targets(allowed_targets);
            }
            let token = JwtValidator::encode(jwt_secret.as_bytes(), &claims)
                .context("Failed to encode token")?;
            println!("{}", token);
            Ok(())
        }
        Commands::Config { command } => handle_config_command(command),
    }
}

async fn run_connect(args: ConnectArgs, defaults: IapConfig) -> Result<()> {
    let relay = args
        .relay
        .or(defaults.relay_url)
        .context("No relay URL: pass --relay or run 'iap config set-relay <URL>'")?;
    let relay_url = Url::parse(&relay).context(format!("Invalid relay URL: {}", relay))?;

    let target = Target::new(args.project, args.zone, args.instance, args.port)
        .with_interface(args.interface);

    let authorizer: Arc<dyn Authorizer> = match (args.jwt_secret, args.token.or(defaults.auth_token))
    {
        (Some(secret), _) => Arc::new(
            JwtAuthorizer::new(secret.into_bytes(), "iap-cli")
                .with_allowed_targets(vec![target.to_string()]),
        ),
        (None, Some(token)) => Arc::new(StaticAuthorizer::from_token(token)),
        (None, None) => bail!("No credential: pass --token, --jwt-secret or run 'iap config set-token'"),
    };

    let relay_config = RelayConfig::new(relay_url)
        .with_handshake_timeout(Duration::from_secs(args.handshake_timeout_secs))
        .with_reconnect(
            ReconnectConfig::default().with_max_attempts(Some(args.max_reconnect_attempts)),
        );
    let config = TunnelConfig::new(relay_config).with_local_port(args.local_port);

    let cancel = shutdown_token();
    let tunnel = TunnelSession::create_with_cancel(target.clone(), authorizer, config, &cancel)
        .await
        .context(format!("Failed to open tunnel to {}", target))?;

    println!("Tunnel to {} listening on {}", target, tunnel.local_addr());

    if let Some(path) = &args.rdp_file {
        let settings = RdpSettings {
            username: args.rdp_username,
            connection_bar: args.connection_bar,
            desktop_size: args.desktop_size,
            audio_mode: args.audio_mode,
            redirect_clipboard: args.redirect_clipboard,
        };
        settings.write_to(path, tunnel.local_addr())?;
        println!("RDP connection file written to {}", path.display());
    }

    let summary = tunnel.closed().await.context("Tunnel failed")?;
    match summary.pump {
        Some(pump) => info!(
            "Tunnel closed: {} bytes sent, {} bytes received, {} reconnects",
            pump.bytes_to_relay, pump.bytes_from_relay, summary.relay.reconnects
        ),
        None => info!("Tunnel closed before a client connected"),
    }
    Ok(())
}

async fn run_relay(
    bind: SocketAddr,
    routes: Vec<String>,
    jwt_secret: Option<String>,
    session_linger_secs: u64,
) -> Result<()> {
    let mut table = RouteTable::new();
    for route in &routes {
        let (target, backend) = RouteTable::parse_route(route)?;
        info!("Route {} -> {}", target, backend);
        table.insert(target, backend);
    }

    let mut config = RelayServerConfig::default()
        .with_bind_addr(bind)
        .with_routes(table)
        .with_session_linger(Duration::from_secs(session_linger_secs));
    match jwt_secret {
        Some(secret) => config = config.with_jwt_secret(secret.into_bytes()),
        None => warn!("⚠️  No JWT secret configured, accepting any caller"),
    }

    let relay = RelayServer::bind(config)
        .await
        .context(format!("Failed to bind relay on {}", bind))?;
    let handle = relay.spawn()?;
    println!("Relay listening on {}", relay.url()?);

    shutdown_token().cancelled().await;
    relay.shutdown();
    let _ = handle.await;

    info!("Relay stopped");
    Ok(())
}

fn handle_config_command(command: ConfigCommands) -> Result<()> {
    let manager = ConfigManager::new()?;
    match command {
        ConfigCommands::SetRelay { url } => {
            Url::parse(&url).context(format!("Invalid relay URL: {}", url))?;
            manager.set_relay(url)?;
            println!("✅ Default relay saved to {}", manager.path().display());
        }
        ConfigCommands::SetToken { token } => {
            manager.set_token(token)?;
            println!("✅ Auth token saved to {}", manager.path().display());
        }
        ConfigCommands::ClearToken => {
            manager.clear_token()?;
            println!("✅ Auth token cleared");
        }
        ConfigCommands::Show => {
            let config = manager.load()?;
            println!(
                "relay: {}",
                config.relay_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "token: {}",
                if config.auth_token.is_some() { "(set)" } else { "(not set)" }
            );
        }
    }
    Ok(())
}
