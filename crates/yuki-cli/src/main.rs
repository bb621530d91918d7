//! Yuki CLI
//!
//! Encrypted point-to-point IP tunnel over TLS.

mod config;
mod tls;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

use config::Config;
use yuki_core::identity::unix_time;
use yuki_core::{Channel, ClientRegistry, IdentityStore, TunnelClient, TunnelEngine, TunnelError};
use yuki_tun::{SharedInterface, VirtualInterface, create_platform_interface};

/// How long the server waits for sessions to tear down after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Yuki - encrypted point-to-point IP tunnel
#[derive(Parser)]
#[command(name = "yuki")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept tunnel clients
    Server,

    /// Connect to a tunnel server
    Connect,

    /// Write a default configuration file
    Genconfig {
        /// Output file (defaults to the configuration path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage registered clients
    Client {
        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Subcommand)]
enum ClientAction {
    /// Register a new client and print its credentials
    Add {
        /// Display name
        #[arg(short, long)]
        name: String,

        /// Upload limit in bytes (0 = server default)
        #[arg(long, default_value_t = 0)]
        max_bandwidth: u64,

        /// Days until the client expires
        #[arg(long)]
        expires_in_days: Option<u64>,
    },

    /// List registered clients
    List,

    /// Refuse further connections from a client
    Block {
        /// Client id
        id: String,
    },

    /// Allow a blocked client again
    Unblock {
        /// Client id
        id: String,
    },

    /// Remove a client
    Delete {
        /// Client id
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::load_or_default(&config_path)?,
    };

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    config.validate()?;

    match cli.command {
        Commands::Server => run_server(&config).await?,
        Commands::Connect => run_client(&config).await?,
        Commands::Genconfig { output } => {
            let path = output.unwrap_or(config_path);
            generate_config(&path)?;
        }
        Commands::Client { action } => manage_clients(action, &config)?,
    }

    Ok(())
}

/// Accept TLS connections and serve one tunnel session per connection.
async fn run_server(config: &Config) -> anyhow::Result<()> {
    let clients_file = config.server.clients_file.clone();
    let registry = Arc::new(
        ClientRegistry::load_or_default(&clients_file)
            .with_context(|| format!("loading clients from {}", clients_file.display()))?,
    );
    if registry.is_empty() {
        tracing::warn!("no clients registered; add one with `yuki client add`");
    }

    let acceptor = tls::acceptor(&config.server.cert_file, &config.server.key_file)?;
    let device = create_platform_interface(&config.server_interface())
        .await
        .context("creating tunnel interface")?;
    let engine = TunnelEngine::new(
        config.tunnel_config(),
        Arc::clone(&registry) as Arc<dyn IdentityStore>,
        Arc::new(SharedInterface::new(Arc::clone(&device))),
    )?;

    let addr = config.parse_listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, iface = device.name(), "server listening");

    let mut sync = tokio::time::interval(Duration::from_secs(config.server.registry_sync_secs));
    sync.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sync.tick().await;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let engine = engine.clone();
                tokio::spawn(async move {
                    let _ = stream.set_nodelay(true);
                    let tls = match acceptor.accept(stream).await {
                        Ok(tls) => tls,
                        Err(e) => {
                            tracing::debug!(%peer, error = %e, "TLS handshake failed");
                            return;
                        }
                    };
                    match engine.accept(Channel::from_stream(tls)).await {
                        Ok(()) | Err(TunnelError::PeerClosed) => {}
                        Err(e) => tracing::debug!(%peer, error = %e, "connection ended"),
                    }
                });
            }
            _ = sync.tick() => sync_registry(&registry, &engine, &clients_file).await,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    engine.close_all().await;
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while engine.session_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            sessions = engine.session_count().await,
            "sessions still open at shutdown"
        );
    }
    if let Err(e) = device.close().await {
        tracing::warn!(error = %e, "closing tunnel interface");
    }
    registry
        .sync(&clients_file)
        .with_context(|| format!("saving clients to {}", clients_file.display()))?;
    Ok(())
}

/// Pick up `yuki client` edits made while the server runs, persist traffic,
/// and end sessions of clients that were blocked or removed.
async fn sync_registry(registry: &Arc<ClientRegistry>, engine: &TunnelEngine, path: &Path) {
    let shared = Arc::clone(registry);
    let file = path.to_path_buf();
    match tokio::task::spawn_blocking(move || shared.sync(&file)).await {
        Ok(Ok(())) => {
            let closed = engine.close_revoked().await;
            if closed > 0 {
                tracing::info!(sessions = closed, "closed sessions of revoked clients");
            }
        }
        Ok(Err(e)) => tracing::warn!(path = %path.display(), error = %e, "registry sync failed"),
        Err(e) => tracing::warn!(error = %e, "registry sync task failed"),
    }
}

/// Connect to the server and relay until interrupted, reconnecting if
/// configured to.
async fn run_client(config: &Config) -> anyhow::Result<()> {
    config.validate_client()?;

    let connector = tls::connector(
        config.client.ca_file.as_deref(),
        config.client.insecure_skip_verify,
    )?;
    let server_name = tls::server_name(&config.client.server_name)?;
    let client = TunnelClient::new(
        config.tunnel_config(),
        &config.client.client_id,
        &config.client.client_secret,
    )?;
    let iface = create_platform_interface(&config.client_interface())
        .await
        .context("creating tunnel interface")?;
    let delay = Duration::from_secs(config.client.reconnect_delay_secs);

    loop {
        match connect_once(config, &connector, &server_name, &client, &iface).await {
            Ok(Outcome::Interrupted) => break,
            Ok(Outcome::Ended) => tracing::info!("tunnel closed"),
            Err(e) => {
                if let Some(TunnelError::AuthenticationFailed(reason)) =
                    e.downcast_ref::<TunnelError>()
                {
                    tracing::error!(%reason, "authentication failed");
                    if let Err(close_err) = iface.close().await {
                        tracing::debug!(error = %close_err, "closing tunnel interface");
                    }
                    return Err(e);
                }
                tracing::warn!(error = %e, "tunnel failed");
            }
        }

        if !config.client.reconnect {
            break;
        }
        tracing::info!(delay = ?delay, "reconnecting");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(e) = iface.close().await {
        tracing::debug!(error = %e, "closing tunnel interface");
    }
    Ok(())
}

enum Outcome {
    Interrupted,
    Ended,
}

async fn connect_once(
    config: &Config,
    connector: &tokio_rustls::TlsConnector,
    server_name: &rustls::pki_types::ServerName<'static>,
    client: &TunnelClient,
    iface: &Arc<dyn VirtualInterface>,
) -> anyhow::Result<Outcome> {
    let addr = &config.client.server_addr;
    let stream = TcpStream::connect(addr.as_str())
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    stream.set_nodelay(true)?;
    let tls = connector
        .connect(server_name.clone(), stream)
        .await
        .context("TLS handshake")?;

    let session = client.connect(Channel::from_stream(tls)).await?;
    tracing::info!(session = session.id(), iface = iface.name(), "tunnel up");

    let shared = session.session();
    let relay = session.run(Arc::clone(iface));
    tokio::pin!(relay);

    tokio::select! {
        result = &mut relay => {
            match result {
                Ok(()) | Err(TunnelError::PeerClosed) => Ok(Outcome::Ended),
                Err(e) => Err(e.into()),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            shared.request_shutdown();
            relay.await?;
            Ok(Outcome::Interrupted)
        }
    }
}

fn generate_config(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn manage_clients(action: ClientAction, config: &Config) -> anyhow::Result<()> {
    let path = &config.server.clients_file;
    let registry = ClientRegistry::load_or_default(path)
        .with_context(|| format!("loading clients from {}", path.display()))?;

    match action {
        ClientAction::Add {
            name,
            max_bandwidth,
            expires_in_days,
        } => {
            let expires_at = expires_in_days.map(|days| unix_time() + days * 86_400);
            let record = registry.create(name, max_bandwidth, expires_at)?;
            println!("Client ID:     {}", record.id);
            println!("Client secret: {}", record.secret);
            println!("Name:          {}", record.name);
            if record.max_bandwidth > 0 {
                println!("Bandwidth:     {}", format_bytes(record.max_bandwidth));
            }
            if let Some(expires_at) = record.expires_at {
                println!("Expires at:    {expires_at} (unix)");
            }
        }
        ClientAction::List => {
            let clients = registry.list();
            if clients.is_empty() {
                println!("No clients registered");
                return Ok(());
            }
            let now = unix_time();
            println!(
                "{:<36}  {:<16}  {:<8}  {:>10}  {:>10}",
                "ID", "NAME", "STATUS", "UP", "DOWN"
            );
            for client in clients {
                let status = if client.blocked {
                    "blocked"
                } else if client.is_expired_at(now) {
                    "expired"
                } else if client.active {
                    "online"
                } else {
                    "offline"
                };
                println!(
                    "{:<36}  {:<16}  {:<8}  {:>10}  {:>10}",
                    client.id,
                    client.name,
                    status,
                    format_bytes(client.bytes_up),
                    format_bytes(client.bytes_down)
                );
            }
            return Ok(());
        }
        ClientAction::Block { id } => {
            registry.block(&id)?;
            println!("Blocked {id}");
        }
        ClientAction::Unblock { id } => {
            registry.unblock(&id)?;
            println!("Unblocked {id}");
        }
        ClientAction::Delete { id } => {
            registry.delete(&id)?;
            println!("Deleted {id}");
        }
    }

    registry
        .save(path)
        .with_context(|| format!("saving clients to {}", path.display()))?;
    Ok(())
}

/// Format byte count as human-readable string
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
