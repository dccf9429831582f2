use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use stash_netd::backup::credentials::StaticCredentials;
use stash_netd::{BackupService, GatewayConfig, StorageConfig, Upstream};
use stash_netproto::limits::{DEFAULT_MAX_PAYLOAD, DEFAULT_RX_BUFFER, Limits};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

/// Backup session gateway and storage server
#[derive(Parser, Debug)]
#[command(name = "stash-netd")]
#[command(about = "Backup session gateway and storage server", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hand out session ports and relay (or serve) each session
    Gateway(GatewayArgs),
    /// Serve backup sessions from a local artifact directory
    Storage(StorageArgs),
}

#[derive(ClapArgs, Debug)]
struct LimitArgs {
    /// Maximum payload size in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD)]
    max_payload: usize,

    /// Per-connection receive buffer in bytes
    #[arg(long, default_value_t = DEFAULT_RX_BUFFER)]
    rx_buffer: usize,

    /// Seconds a session may stay silent before it is closed
    #[arg(long, default_value_t = 60)]
    idle_timeout_secs: u64,
}

impl LimitArgs {
    fn limits(&self) -> anyhow::Result<Limits> {
        let limits = Limits {
            max_payload: self.max_payload,
            rx_buffer: self.rx_buffer,
        };
        anyhow::ensure!(
            limits.is_consistent(),
            "--rx-buffer ({}) must hold a full frame with a {}-byte payload",
            self.rx_buffer,
            self.max_payload
        );
        Ok(limits)
    }
}

#[derive(ClapArgs, Debug)]
struct GatewayArgs {
    /// Well-known address for port requests
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Address session listeners bind to
    #[arg(long, default_value = "0.0.0.0")]
    session_host: IpAddr,

    /// First port of the session pool
    #[arg(long, default_value_t = 50000)]
    port_start: u16,

    /// Last port of the session pool (inclusive)
    #[arg(long, default_value_t = 50999)]
    port_end: u16,

    /// Storage server to relay sessions to. Without it the gateway serves
    /// sessions itself and needs --root and --credentials.
    #[arg(long)]
    backend: Option<SocketAddr>,

    /// Artifact directory when serving sessions locally
    #[arg(long)]
    root: Option<PathBuf>,

    /// `user:password` file when serving sessions locally
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Seconds a client has to reconnect on its session port
    #[arg(long, default_value_t = 10)]
    reconnect_timeout_secs: u64,

    /// Seconds allowed for connecting to the backend
    #[arg(long, default_value_t = 5)]
    connect_timeout_secs: u64,

    #[command(flatten)]
    limits: LimitArgs,
}

#[derive(ClapArgs, Debug)]
struct StorageArgs {
    /// TCP bind address
    #[arg(short, long, default_value = "0.0.0.0:8081")]
    bind: SocketAddr,

    /// Artifact directory
    #[arg(long, default_value = "backups")]
    root: PathBuf,

    /// `user:password` file
    #[arg(long)]
    credentials: PathBuf,

    #[command(flatten)]
    limits: LimitArgs,
}

fn load_credentials(path: &std::path::Path) -> anyhow::Result<Arc<StaticCredentials>> {
    let creds = StaticCredentials::load(path)
        .with_context(|| format!("loading credentials from {}", path.display()))?;
    if creds.is_empty() {
        tracing::warn!(
            path = %path.display(),
            "Credentials file has no users; every login will fail"
        );
    }
    Ok(Arc::new(creds))
}

async fn run_gateway(args: GatewayArgs) -> anyhow::Result<()> {
    let limits = args.limits.limits()?;
    let idle_timeout = Duration::from_secs(args.limits.idle_timeout_secs);

    let upstream = match (args.backend, &args.root, &args.credentials) {
        (Some(addr), _, _) => {
            info!(backend = %addr, "Relaying sessions to backend");
            Upstream::Backend(addr)
        }
        (None, Some(root), Some(credentials)) => {
            let storage = StorageConfig {
                listen: args.bind,
                root: root.clone(),
                idle_timeout,
                limits,
            };
            info!(root = %root.display(), "Serving sessions locally");
            Upstream::Local(Arc::new(BackupService::from_config(
                &storage,
                load_credentials(credentials)?,
            )))
        }
        (None, _, _) => anyhow::bail!("Provide --backend, or both --root and --credentials"),
    };

    let config = GatewayConfig {
        listen: args.bind,
        ephemeral_host: args.session_host,
        port_range: args.port_start..=args.port_end,
        reconnect_timeout: Duration::from_secs(args.reconnect_timeout_secs),
        connect_timeout: Duration::from_secs(args.connect_timeout_secs),
        idle_timeout,
        limits,
    };
    stash_netd::run_gateway(config, upstream).await
}

async fn run_storage(args: StorageArgs) -> anyhow::Result<()> {
    let config = StorageConfig {
        listen: args.bind,
        root: args.root,
        idle_timeout: Duration::from_secs(args.limits.idle_timeout_secs),
        limits: args.limits.limits()?,
    };
    std::fs::create_dir_all(&config.root)
        .with_context(|| format!("creating artifact root {}", config.root.display()))?;

    let service = BackupService::from_config(&config, load_credentials(&args.credentials)?);
    stash_netd::run_storage_server(config.listen, Arc::new(service)).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    info!("Log level: {}", args.log_level);

    match args.command {
        Command::Gateway(gateway) => run_gateway(gateway).await,
        Command::Storage(storage) => run_storage(storage).await,
    }
}
