use clap::Parser;
use log::{error, info, warn};
use server::consensus::{ConsensusConfig, ConsensusPolicy};
use server::network::{Server, ServerConfig};
use server::persistence;
use server::store::{PoiEvent, PoiStore};
use shared::{DEFAULT_PORT, SERVICE_RADIUS_METERS};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Maximum number of clients served at the same time
    #[arg(
        short = 'm',
        long,
        default_value = "32",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    max_clients: u32,

    /// Close connections idle for this many seconds (0 disables)
    #[arg(long, default_value = "300")]
    idle_timeout_secs: u64,

    /// XML file the hazards are loaded from and saved to
    #[arg(short = 'd', long)]
    data_file: Option<PathBuf>,

    /// Seconds between automatic saves of a changed store
    #[arg(long, default_value = "60")]
    autosave_secs: u64,

    /// Meters within which a submission confirms an existing hazard
    #[arg(long, default_value = "500")]
    add_precision: f64,

    /// Meters within which NOT_SEEN looks for the refuted hazard
    #[arg(long, default_value = "500")]
    precision: f64,

    /// Refutations that remove a hazard
    #[arg(long, default_value = "3")]
    delete_threshold: u32,

    /// Meters around a GET_INFOS position that are reported
    #[arg(long, default_value_t = SERVICE_RADIUS_METERS)]
    service_radius: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let store = match &args.data_file {
        Some(path) if path.exists() => {
            Arc::new(PoiStore::from_snapshot(persistence::load_from_path(path)?))
        }
        Some(path) => {
            info!("{} does not exist yet, starting empty", path.display());
            Arc::new(PoiStore::new())
        }
        None => {
            warn!("No data file given, hazards will not survive a restart");
            Arc::new(PoiStore::new())
        }
    };

    let consensus = ConsensusConfig {
        add_precision: args.add_precision,
        precision: args.precision,
        delete_threshold: args.delete_threshold,
        service_radius: args.service_radius,
    };
    let policy = ConsensusPolicy::new(Arc::clone(&store), consensus);

    let config = ServerConfig {
        host: args.host.clone(),
        port: args.port,
        max_clients: args.max_clients as usize,
        idle_timeout: (args.idle_timeout_secs > 0)
            .then(|| Duration::from_secs(args.idle_timeout_secs)),
        ..ServerConfig::default()
    };

    let autosave = args.data_file.clone().map(|path| {
        let (_, events) = store.subscribe_channel();
        let period = Duration::from_secs(args.autosave_secs.max(1));
        tokio::spawn(run_autosave(Arc::clone(&store), events, path, period))
    });

    let server = Server::bind(config, policy).await?;
    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received Ctrl+C, shutting down gracefully...");
        })
        .await?;

    if let Some(task) = autosave {
        stop_autosave(task).await;
    }
    if let Some(path) = &args.data_file {
        persistence::save_to_path(&store.snapshot(), path)?;
    }

    Ok(())
}

/// Aborts the autosave task and waits for it. A save in progress finishes
/// first. Returns false if the task had panicked.
async fn stop_autosave(task: JoinHandle<()>) -> bool {
    task.abort();
    match task.await {
        Ok(()) => true,
        Err(e) if e.is_cancelled() => true,
        Err(e) => {
            error!("Autosave task failed: {}", e);
            false
        }
    }
}

/// Saves the store every `period` if it changed since the last save.
async fn run_autosave(
    store: Arc<PoiStore>,
    mut events: mpsc::UnboundedReceiver<PoiEvent>,
    path: PathBuf,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        if !drain_changes(&mut events) {
            continue;
        }

        // No await while writing, so aborting the task never interrupts a save
        if let Err(e) = persistence::save_to_path(&store.snapshot(), &path) {
            error!("Autosave to {} failed: {}", path.display(), e);
        }
    }
}

/// Empties the event channel and reports whether anything changed
fn drain_changes(events: &mut mpsc::UnboundedReceiver<PoiEvent>) -> bool {
    let mut changed = false;
    while events.try_recv().is_ok() {
        changed = true;
    }
    changed
}
