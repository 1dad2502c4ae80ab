//! nmlexport - export a Traktor collection and its playlists onto a USB stick.
//!
//! This is the command line entry point. It starts an export on a background
//! thread, prints progress as it arrives and cancels cleanly on Ctrl-C.

mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use nmlexport_core::{
    ExportConfig, ExportCoordinator, ExportHandle, ExportJob, ExportReport, Library,
    ProgressEvent, ProgressPoll, available_volumes,
};
use tracing::{error, info, warn};

use crate::logging::{LoggingConfig, LoggingError};

/// How often the export is polled for progress.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(short, long, global = true, env = "NMLEXPORT_CONFIG")]
    config: Option<PathBuf>,

    /// More console output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Do not write a log file
    #[arg(long, global = true)]
    no_log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Export the collection and playlists onto a volume
    Export(ExportArgs),
    /// List volumes that can be exported to
    Volumes,
    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(clap::Args, Debug)]
struct ExportArgs {
    /// Name of the destination volume
    volume: String,

    /// Catalogue to export (defaults to `library_path` from the config)
    #[arg(short, long, env = "NMLEXPORT_LIBRARY")]
    library: Option<PathBuf>,

    /// Export to this directory instead of `<volumes_root>/<volume>`
    #[arg(short, long)]
    destination: Option<PathBuf>,

    /// Delete audio files on the volume that are no longer in the collection
    #[arg(long)]
    remove_orphans: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration as JSON
    Show,
    /// Print the path to the config file
    Path,
    /// Write the default configuration, if there is no config file yet
    Init,
}

/// Errors reported by the command line tool.
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] nmlexport_core::Error),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error("No catalogue given: pass --library or set library_path in {}", .0.display())]
    NoLibrary(PathBuf),

    #[error("Export thread failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Failed to serialise configuration: {0}")]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging_config = LoggingConfig::auto()
        .with_verbosity(cli.verbose, cli.quiet)
        .with_file_logging(!cli.no_log_file);
    let _logging_guard = match logging::init(&logging_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(ExportConfig::config_file_path);
    let config = ExportConfig::load_from(&config_path)?;

    match cli.command {
        Commands::Export(args) => run_export(args, config, config_path).await,
        Commands::Volumes => {
            for volume in available_volumes(&config.volumes_root)? {
                println!("{volume}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config(ConfigCommands::Show) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config(ConfigCommands::Path) => {
            println!("{}", config_path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config(ConfigCommands::Init) => {
            if config_path.exists() {
                warn!("{} already exists, leaving it alone", config_path.display());
            } else {
                config.save_to(&config_path)?;
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_export(
    args: ExportArgs,
    config: ExportConfig,
    config_path: PathBuf,
) -> Result<ExitCode, CliError> {
    let library_path = args
        .library
        .clone()
        .or_else(|| config.library_path.clone())
        .ok_or(CliError::NoLibrary(config_path))?;
    let job = resolve_job(&args, &config);

    info!("Loading catalogue {}", library_path.display());
    let library = tokio::task::spawn_blocking(move || Library::open(&library_path)).await??;

    let coordinator = ExportCoordinator::with_options(job, config.transfer);
    let handle = ExportHandle::start_with(coordinator, library)?;

    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancel_requested = false;

    loop {
        tokio::select! {
            _ = interval.tick() => match handle.poll() {
                ProgressPoll::Events(events) => {
                    for event in &events {
                        println!("{}", format_event(event));
                    }
                }
                ProgressPoll::Done => break,
            },
            result = &mut ctrl_c, if !cancel_requested => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {e}");
                }
                warn!("Cancelling export, waiting for the current file to finish");
                handle.cancel();
                cancel_requested = true;
            }
        }
    }

    let completed = tokio::task::spawn_blocking(move || handle.join()).await??;
    let report = completed.result?;
    print_report(&report);

    Ok(if report.is_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(130)
    })
}

/// Build the job from the command line, falling back to the config.
fn resolve_job(args: &ExportArgs, config: &ExportConfig) -> ExportJob {
    let mut job = ExportJob::for_volume(args.volume.clone(), config);
    if let Some(destination) = &args.destination {
        job.destination_root.clone_from(destination);
    }
    if args.remove_orphans {
        job.remove_orphans = true;
    }
    job
}

fn format_event(event: &ProgressEvent) -> String {
    format!("{:>8}  {}", event.action, event.item)
}

fn print_report(report: &ExportReport) {
    info!("{}", report.summary());
    if report.transfer.files_failed > 0 || report.playlists.playlists_failed > 0 {
        warn!(
            "{} files and {} playlists could not be written, see the log for details",
            report.transfer.files_failed, report.playlists.playlists_failed
        );
    }
}
