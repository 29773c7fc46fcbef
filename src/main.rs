// StemDeck command line
use clap::{Parser, Subcommand};
use log::{error, info};

use stemdeck_lib::client::{render_line, watch, ClientState, StatusClient};
use stemdeck_lib::error::{AppError, Result};
use stemdeck_lib::logging::init_logging;
use stemdeck_lib::process_manager::{Supervisor, SupervisorConfig, SupervisorState};
use stemdeck_lib::progress::{PhaseWeights, PollBackoff};
use stemdeck_lib::queue::ClearMode;
use stemdeck_lib::utils::get_backend_log_path;
use stemdeck_lib::{run_backend, DEFAULT_HOST, DEFAULT_PORT};

#[derive(Parser)]
#[command(name = "stemdeck")]
#[command(about = "Queue and track audio stem separation jobs")]
#[command(version)]
struct Cli {
    /// Backend host
    #[arg(long, env = "STEMDECK_HOST", default_value = DEFAULT_HOST, global = true)]
    host: String,

    /// Backend port
    #[arg(long, env = "STEMDECK_PORT", default_value_t = DEFAULT_PORT, global = true)]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Status API and queue engine in the foreground
    Serve,

    /// Run the backend as a supervised child process with crash recovery
    Supervise,

    /// Enqueue URLs or local audio files
    Add {
        #[arg(required = true)]
        sources: Vec<String>,

        /// Absolute output folder (defaults to the configured one)
        #[arg(short, long)]
        folder: Option<String>,

        /// Stem mode: 2, 4 or 6
        #[arg(short, long)]
        stems: Option<String>,
    },

    /// Show live progress
    Watch {
        /// Keep polling after the queue goes idle
        #[arg(long)]
        follow: bool,
    },

    /// Cancel queued items and stop running ones
    Stop,

    /// Remove finished items (or everything not running with --reset)
    Clear {
        #[arg(long)]
        reset: bool,
    },

    /// Re-enqueue every failed item
    RetryFailed,

    /// Show or change the concurrency limit
    Concurrency { max: Option<i64> },
}

fn main() {
    init_logging("info");
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let base_url = format!("http://{}:{}", cli.host, cli.port);

    match cli.command {
        Commands::Serve => runtime()?.block_on(run_backend(&cli.host, cli.port)),
        Commands::Supervise => runtime()?.block_on(supervise(cli.host, cli.port)),
        Commands::Add { sources, folder, stems } => {
            let client = StatusClient::new(base_url);
            let added = client.enqueue(&sources, folder.as_deref(), stems.as_deref())?;
            for item in &added.added {
                match &item.error {
                    Some(error) => println!("rejected {}: {}", item.title, error),
                    None => println!("queued   {} ({})", item.title, item.id),
                }
            }
            Ok(())
        }
        Commands::Watch { follow } => {
            let client = StatusClient::new(base_url);
            let weights = client
                .get_settings()
                .ok()
                .and_then(|s| PhaseWeights::new(s.download_weight).ok())
                .unwrap_or_default();
            let mut state = ClientState::new(weights, PollBackoff::default());
            watch(&client, &mut state, !follow, |state| {
                println!("overall {:.1}%", state.global_progress() * 100.0);
                for item in state.display_items() {
                    println!("{}", render_line(item, state.item_progress(&item.id)));
                }
                println!();
            });
            Ok(())
        }
        Commands::Stop => {
            let response = StatusClient::new(base_url).stop()?;
            println!("stopping; {} queued item(s) canceled", response.canceled);
            Ok(())
        }
        Commands::Clear { reset } => {
            let mode = if reset { ClearMode::Reset } else { ClearMode::Finished };
            let response = StatusClient::new(base_url).clear(mode)?;
            println!("cleared {} item(s)", response.cleared);
            Ok(())
        }
        Commands::RetryFailed => {
            let response = StatusClient::new(base_url).retry_failed()?;
            println!("retrying {} item(s)", response.added.len());
            Ok(())
        }
        Commands::Concurrency { max } => {
            let client = StatusClient::new(base_url);
            let info = match max {
                Some(max) => client.set_concurrency(max)?,
                None => client.get_concurrency()?,
            };
            println!("{} active / {} max (server max {})", info.active, info.max, info.server_max);
            Ok(())
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

async fn supervise(host: String, port: u16) -> Result<()> {
    let exe = std::env::current_exe()?;
    let mut config = SupervisorConfig::new(exe);
    config.args = vec!["serve".to_string()];
    config.host = host;
    config.preferred_port = port;
    config.log_path = Some(get_backend_log_path());

    let supervisor = Supervisor::new(config);
    let mut states = supervisor.subscribe();
    supervisor.start().await?;
    info!("Backend at {} ({:?})", supervisor.base_url(), supervisor.state());

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            changed = states.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = *states.borrow();
                info!("Backend state: {:?}", state);
                if state == SupervisorState::Failed {
                    break Err(AppError::ProcessCrash(format!(
                        "backend crashed {} times, giving up",
                        supervisor.crash_count()
                    )));
                }
            }
        }
    };

    supervisor.stop().await;
    result
}
