//! TunnelMux CLI
//!
//! `tunnelmux client` runs the local SOCKS5 proxy, `tunnelmux server` runs
//! the tunnel endpoint that dials destinations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, warn};

use tunnelmux_client::{policy_from_retries, SessionHandle, SessionSupervisor, Socks5Server};
use tunnelmux_exit::{ExitConfig, ExitServer};
use tunnelmux_keystore::{default_key_path, expand_path, load_or_generate_keypair};
use tunnelmux_logging::LogLevel;
use tunnelmux_network::{
    parse_multiaddr, Keypair, Libp2pTransport, SecurityParams, SessionDialer,
};
use tunnelmux_settings::{
    default_settings_path, ClientSettings, Mode, ServerSettings, Settings, SettingsOverrides,
    SettingsWatcher,
};

#[derive(Parser)]
#[command(name = "tunnelmux")]
#[command(author, version, about = "SOCKS5 proxy over a multiplexed libp2p tunnel", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the local SOCKS5 proxy
    Client(ClientArgs),

    /// Run the tunnel server
    Server(ServerArgs),

    /// Show the peer ID of a keyfile (generated if missing)
    Info {
        /// Keyfile path
        #[arg(short, long)]
        keyfile: Option<PathBuf>,
    },

    /// Write a settings file filled with defaults
    InitConfig {
        #[arg(short, long, value_enum, default_value_t = ModeArg::Client)]
        mode: ModeArg,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,

        /// Destination (defaults to ~/.tunnelmux/settings.json)
        path: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ClientArgs {
    /// Settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tunnel server, e.g. <peer_id>@/ip4/203.0.113.7/tcp/9000
    #[arg(short, long)]
    server_addr: Option<String>,

    /// SOCKS5 listen address
    #[arg(short, long)]
    local_addr: Option<String>,

    /// error, warn, info, debug or trace
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Args)]
struct ServerArgs {
    /// Settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (multiaddr or host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// error, warn, info, debug or trace
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Client,
    Server,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Client => Mode::Client,
            ModeArg::Server => Mode::Server,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Client(args) => run_client(args, cli.verbose).await,
        Commands::Server(args) => run_server(args, cli.verbose).await,
        Commands::Info { keyfile } => show_node_info(keyfile),
        Commands::InitConfig { mode, force, path } => init_config(mode.into(), force, path),
    }
}

/// Load the settings file (defaults if missing), apply overrides, validate
fn load_settings(config: Option<&Path>, overrides: &SettingsOverrides) -> Result<(PathBuf, Settings)> {
    let path = config.map(expand_path).unwrap_or_else(default_settings_path);
    let mut settings = Settings::load_from(&path)
        .with_context(|| format!("Failed to load settings from {:?}", path))?;
    settings.apply_overrides(overrides);
    settings.validate().context("Invalid settings")?;
    Ok((path, settings))
}

fn init_logging(settings: &Settings, verbose: bool) -> Result<()> {
    let mut level = settings.log_level()?;
    if verbose {
        level = level.max(LogLevel::Debug);
    }
    let log_file = settings.log_file.as_ref().map(expand_path);
    tunnelmux_logging::try_init(level, log_file.as_deref())?;
    Ok(())
}

fn load_keypair(keyfile: Option<&str>) -> Result<Keypair> {
    let path = keyfile.map(expand_path).unwrap_or_else(default_key_path);
    load_or_generate_keypair(&path).with_context(|| format!("Failed to load keypair from {:?}", path))
}

fn client_dialer(client: &ClientSettings) -> Result<Arc<dyn SessionDialer>> {
    let keypair = load_keypair(client.keyfile.as_deref())?;
    let params = SecurityParams::new(keypair).with_protocol(&client.protocol_id)?;
    let transport = Libp2pTransport::new(params).with_connect_timeout(client.connect_timeout());
    Ok(Arc::new(transport.dialer(client.remote_addr()?)))
}

/// Whether a client settings change needs a new session
fn needs_redial(current: &ClientSettings, next: &ClientSettings) -> bool {
    current.server_addr != next.server_addr
        || current.keyfile != next.keyfile
        || current.protocol_id != next.protocol_id
        || current.connect_timeout_secs != next.connect_timeout_secs
}

async fn run_client(args: ClientArgs, verbose: bool) -> Result<()> {
    let overrides = SettingsOverrides {
        mode: Some(Mode::Client),
        server_addr: args.server_addr,
        local_addr: args.local_addr,
        listen_addr: None,
        log_level: args.log_level,
    };
    let (path, settings) = load_settings(args.config.as_deref(), &overrides)?;
    init_logging(&settings, verbose)?;
    let client = settings.client.clone();

    let dialer = client_dialer(&client)?;
    let policy = policy_from_retries(client.reconnect_times, client.reconnect_delay());
    let supervisor = SessionSupervisor::connect(dialer.clone(), policy)
        .await
        .with_context(|| format!("Failed to connect to tunnel server {}", client.server_addr))?;

    let (dialer_tx, dialer_rx) = watch::channel(dialer);
    let supervisor = supervisor.with_dialer_updates(dialer_rx);
    let sessions = supervisor.handle();

    let mut socks = Socks5Server::new(client.local_socket_addr()?, sessions.clone());
    socks.start().await?;
    println!("SOCKS5 proxy listening on {}", socks.listen_addr());
    println!("Press Ctrl+C to stop");

    let watcher = SettingsWatcher::spawn(path, settings, overrides);
    let mut updates = watcher.subscribe();
    let mut current = client;
    let mut supervisor_task = tokio::spawn(supervisor.run());
    let mut supervising = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            result = &mut supervisor_task, if supervising => {
                supervising = false;
                // The proxy stays up; new connections get a general failure reply
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Tunnel session lost for good: {}", e),
                    Err(e) => error!("Session supervisor stopped unexpectedly: {}", e),
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    warn!("Settings watcher stopped");
                    break;
                }
                let next = updates.borrow_and_update().client.clone();
                apply_client_settings(&current, &next, &dialer_tx, &mut socks, &sessions).await;
                current = next;
            }
        }
    }

    supervisor_task.abort();
    socks.stop();
    Ok(())
}

/// Switch to reloaded client settings. Connections already relaying keep
/// the session they started on.
async fn apply_client_settings(
    current: &ClientSettings,
    next: &ClientSettings,
    dialer_tx: &watch::Sender<Arc<dyn SessionDialer>>,
    socks: &mut Socks5Server,
    sessions: &SessionHandle,
) {
    if needs_redial(current, next) {
        match client_dialer(next) {
            Ok(dialer) => {
                info!("Tunnel settings changed, switching to {}", dialer.remote());
                dialer_tx.send_replace(dialer);
            }
            Err(e) => warn!("Keeping the current tunnel server: {:#}", e),
        }
    }

    if current.local_addr != next.local_addr {
        let addr = match next.local_socket_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Keeping SOCKS5 listener on {}: {}", socks.listen_addr(), e);
                return;
            }
        };
        let mut replacement = Socks5Server::new(addr, sessions.clone());
        match replacement.start().await {
            Ok(()) => {
                socks.stop();
                *socks = replacement;
            }
            Err(e) => warn!("Keeping SOCKS5 listener on {}: {}", socks.listen_addr(), e),
        }
    }
}

fn exit_config(server: &ServerSettings) -> ExitConfig {
    ExitConfig {
        dial_timeout: server.dial_timeout(),
    }
}

async fn run_server(args: ServerArgs, verbose: bool) -> Result<()> {
    let overrides = SettingsOverrides {
        mode: Some(Mode::Server),
        listen_addr: args.listen,
        log_level: args.log_level,
        ..Default::default()
    };
    let (path, settings) = load_settings(args.config.as_deref(), &overrides)?;
    init_logging(&settings, verbose)?;
    let server = settings.server.clone();

    let keypair = load_keypair(server.keyfile.as_deref())?;
    let params = SecurityParams::new(keypair).with_protocol(&server.protocol_id)?;
    let listen = parse_multiaddr(&server.listen_addr)?;
    let acceptor = Libp2pTransport::new(params)
        .listen(listen)
        .await
        .with_context(|| format!("Failed to listen on {}", server.listen_addr))?;

    println!("Peer ID: {}", acceptor.peer_id());
    println!("Listening on {}", acceptor.listen_multiaddr());
    println!("Press Ctrl+C to stop");

    let (config_tx, config_rx) = watch::channel(exit_config(&server));
    let exit = ExitServer::new(exit_config(&server)).with_config_updates(config_rx);
    let stats = exit.stats();

    let watcher = SettingsWatcher::spawn(path, settings, overrides);
    let mut updates = watcher.subscribe();
    let reload = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let next = updates.borrow_and_update().server.clone();
            if next.listen_addr != server.listen_addr
                || next.keyfile != server.keyfile
                || next.protocol_id != server.protocol_id
            {
                warn!("Listener settings changed; restart the server to apply them");
            }
            config_tx.send_replace(exit_config(&next));
        }
    });

    tokio::select! {
        result = exit.run(acceptor) => result.context("Exit server failed")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    reload.abort();

    let snapshot = stats.snapshot();
    println!(
        "Served {} sessions, {} streams ({} dial failures), {} bytes up, {} bytes down",
        snapshot.sessions_accepted,
        snapshot.streams_accepted,
        snapshot.dials_failed,
        snapshot.bytes_up,
        snapshot.bytes_down
    );
    Ok(())
}

fn show_node_info(keyfile: Option<PathBuf>) -> Result<()> {
    let path = keyfile.map(expand_path).unwrap_or_else(default_key_path);
    let keypair = load_or_generate_keypair(&path)
        .with_context(|| format!("Failed to load keypair from {:?}", path))?;

    println!("TunnelMux Node Info");
    println!("===================");
    println!("Peer ID: {}", keypair.public().to_peer_id());
    println!("Keyfile: {}", path.display());
    Ok(())
}

fn init_config(mode: Mode, force: bool, path: Option<PathBuf>) -> Result<()> {
    let path = path.map(expand_path).unwrap_or_else(default_settings_path);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let mut settings = Settings::default();
    settings.mode = mode;
    settings.save_to(&path)?;
    println!("Wrote {:?} settings to {}", mode, path.display());
    Ok(())
}
