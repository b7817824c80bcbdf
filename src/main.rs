use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tandem_server::{JsonFileStorage, Registry, ServerConfig, ServerError};
use tracing::{info, warn};

mod simulate;
mod track_session;

#[derive(Parser)]
#[command(author, version, about = "Collaborative editing over a versioned step log")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the collaboration server.
    Serve(ServeArgs),
    /// Run editors against an in-process server and check that they converge.
    Simulate(SimulateArgs),
    /// Run a scripted change-tracking session and print its history.
    Track(TrackArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "TANDEM_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, env = "TANDEM_PORT", default_value_t = 8000)]
    port: u16,

    /// Where instances are saved.
    #[arg(long, env = "TANDEM_SAVE_FILE", default_value = "instances.json")]
    save_file: PathBuf,

    #[arg(long, env = "TANDEM_MAX_INSTANCES", default_value_t = 20)]
    max_instances: usize,

    /// How long a long poll is held open (milliseconds).
    #[arg(long, env = "TANDEM_POLL_TIMEOUT_MS", default_value_t = 300_000)]
    poll_timeout_ms: u64,

    /// Ignore the save file and start from the example documents.
    #[arg(long)]
    fresh: bool,
}

#[derive(Args)]
struct SimulateArgs {
    #[arg(short, long, default_value_t = 4)]
    editors: usize,

    /// Edits per editor.
    #[arg(short = 'n', long, default_value_t = 100)]
    edits: usize,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args)]
struct TrackArgs {
    #[arg(short, long, default_value_t = 5)]
    commits: usize,

    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await?,
        Command::Simulate(args) => {
            let stats = simulate::simulate(args.editors, args.edits, args.seed).await?;
            stats.print();
            if !stats.converged {
                return Err("editors did not converge".into());
            }
        }
        Command::Track(args) => track_session::run(args.commits, args.seed)?,
    }
    Ok(())
}

async fn serve(args: ServeArgs) -> Result<(), ServerError> {
    let config = ServerConfig::builder()
        .host(args.host)
        .port(args.port)
        .save_file(args.save_file)
        .max_instances(args.max_instances)
        .poll_timeout(args.poll_timeout_ms)
        .build();
    info!("Loading instances from {}", config.save_file.display());
    let storage = Arc::new(JsonFileStorage::new(config.save_file.clone()));
    let registry = Registry::load(config, storage, args.fresh).await;
    tandem_server::serve(registry, shutdown_signal()).await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received interrupt"),
        Err(err) => {
            warn!("Could not listen for interrupts: {}", err);
            std::future::pending::<()>().await;
        }
    }
}
