use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stash_client::{ClientConfig, Route, SessionClient};
use stash_netproto::limits::{DEFAULT_MAX_PAYLOAD, Limits};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Stash backup client
#[derive(Parser, Debug)]
#[command(name = "stash")]
#[command(about = "Back up, list and fetch files through a stash gateway", long_about = None)]
struct Args {
    /// Gateway address
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    gateway: SocketAddr,

    /// Treat --gateway as a storage server and skip port negotiation
    #[arg(long)]
    direct: bool,

    /// Username
    #[arg(short, long)]
    user: String,

    /// Password
    #[arg(short, long)]
    password: String,

    /// Maximum payload size in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD)]
    max_payload: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file
    Backup { file: PathBuf },
    /// List stored artifacts
    List,
    /// Download an artifact
    Fetch {
        name: String,
        /// Destination file (defaults to the artifact name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
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

    let route = if args.direct {
        Route::Direct(args.gateway)
    } else {
        Route::Gateway(args.gateway)
    };
    let mut config = ClientConfig::new(route, args.user, args.password);
    config.limits = Limits {
        max_payload: args.max_payload,
        ..Limits::default()
    };

    let mut session = SessionClient::connect(config).await?;
    match args.command {
        Command::Backup { file } => {
            let receipt = session.backup_file(&file).await?;
            println!(
                "{}: {} bytes in {} chunks ({})",
                receipt.name, receipt.bytes, receipt.chunks, receipt.message
            );
        }
        Command::List => {
            for name in session.list().await? {
                println!("{name}");
            }
        }
        Command::Fetch { name, output } => {
            let path = output.unwrap_or_else(|| PathBuf::from(&name));
            let file = tokio::fs::File::create(&path).await?;
            let bytes = match session.fetch(&name, file).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(e.into());
                }
            };
            println!("{name}: {bytes} bytes -> {}", path.display());
        }
    }
    session.close().await;
    Ok(())
}
