use clap::{Parser, Subcommand};
use mtunnel::config::Settings;
use mtunnel::orchestrator::{ConnectionFilter, Event};
use mtunnel::privilege::{self, PipePaths};
use mtunnel::state::ServerCache;
use mtunnel::{Controller, Orchestrator, Paths, SettingsStore, platform};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "mtunnel")]
#[command(about = "Leak-proof VPN client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config directory (settings, certificates, cached servers)
    #[arg(long, global = true)]
    confdir: Option<PathBuf>,

    /// Directory for tunnel logs
    #[arg(long, global = true)]
    logdir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and stay connected until Ctrl-C
    Connect,
    /// Serve the orchestrator to an unprivileged UI over named pipes
    Worker {
        /// Directory holding request_pipe, reply_pipe and update_pipe
        #[arg(long)]
        pipedir: PathBuf,
    },
    /// List cached servers, marking those matching the settings
    Servers,
    /// Write the default settings file
    Init,
}

fn log_event(event: &Event) {
    match event {
        Event::Connection(state) => info!("Connection state: {}", state),
        Event::Server(Some(server)) => info!("Server: {}", server),
        Event::Server(None) => {}
        Event::Error(report) => error!("{}", report.message),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; RUST_LOG wins over --verbose when set
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let paths = Paths::resolve(cli.confdir, cli.logdir);

    match cli.command {
        Commands::Connect => {
            paths.ensure_dirs()?;
            let settings = Arc::new(SettingsStore::open(paths.settings_file())?);
            let services = platform::system_services(&paths)?;
            let orchestrator = Arc::new(Orchestrator::new(services, paths, settings));
            orchestrator.subscribe(Arc::new(log_event));

            info!("Connecting...");
            orchestrator.connect();
            tokio::signal::ctrl_c().await?;

            info!("Shutting down...");
            orchestrator.shut_down();
            tokio::task::spawn_blocking(move || orchestrator.destroy()).await?;
        }
        Commands::Worker { pipedir } => {
            paths.ensure_dirs()?;
            let pipes = PipePaths::in_dir(&pipedir);
            pipes.create()?;

            let settings = Arc::new(SettingsStore::open(paths.settings_file())?);
            let autoconnect = settings.snapshot().autoconnect_on_start;
            let services = platform::system_services(&paths)?;
            let orchestrator: Arc<dyn Controller> =
                Arc::new(Orchestrator::new(services, paths, settings));
            if autoconnect {
                orchestrator.connect();
            }

            info!("Waiting for UI on {}", pipedir.display());
            let served = Arc::clone(&orchestrator);
            let result = tokio::task::spawn_blocking(move || {
                let (requests, replies, updates) = pipes.open_worker()?;
                privilege::serve(served, requests, replies, updates)
            })
            .await?;

            // The UI may have gone away without destroying us
            orchestrator.shut_down();
            tokio::task::spawn_blocking(move || orchestrator.destroy()).await?;
            result?;
        }
        Commands::Servers => {
            let settings = SettingsStore::open(paths.settings_file())?.snapshot();
            let filter = ConnectionFilter::for_attempt(&settings, false, false);
            let servers = ServerCache::new(paths.backup_servers_file()).load()?;
            if servers.is_empty() {
                println!("No cached servers");
            }
            for server in &servers {
                let mark = if filter.matches(server) { "*" } else { " " };
                println!("{} {}", mark, server);
            }
        }
        Commands::Init => {
            info!("Generating default settings...");
            let path = paths.settings_file();
            Settings::default().save(&path)?;
            println!("Created default settings: {}", path.display());
        }
    }

    Ok(())
}
