//! CLI entry point for the peak normaliser
//!
//! Loads configuration, installs logging, and runs either a single batch pass or the
//! watch loop.

use clap::{Parser, Subcommand};
use peaknorm::{Config, Daemon};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Normalise audio peaks across video libraries, only touching what changed
#[derive(Parser, Debug)]
#[command(name = "peaknorm")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Library root to process; repeat for several. Replaces configured roots.
    #[arg(short, long = "root")]
    roots: Vec<PathBuf>,

    /// Skip startup checks (ffprobe/ffmpeg availability and version)
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one pass over every root, then exit
    Scan,
    /// Watch the roots and normalise files as they arrive
    Watch {
        /// Run a full pass before watching
        #[arg(long)]
        initial_scan: bool,
    },
}

fn load_config(args: &Args) -> Result<Config, peaknorm::ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };
    if !args.roots.is_empty() {
        config.library.roots = args.roots.clone();
    }
    Ok(config)
}

fn init_logging(config: &Config) {
    let file_layer = config.logging.file.as_ref().and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            Err(e) => {
                eprintln!("Cannot open log file {}: {}", path.display(), e);
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "peaknorm=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config);

    let daemon_result = if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)
    } else {
        Daemon::new(config)
    };

    let daemon = match daemon_result {
        Ok(daemon) => Arc::new(daemon),
        Err(e) => {
            error!(error = %e, "failed to initialise");
            return ExitCode::FAILURE;
        }
    };

    {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                daemon.shutdown();
            }
        });
    }

    match args.command {
        Command::Scan => {
            let summary = daemon.run_batch().await;
            info!(
                normalised = summary.normalized(),
                already_normalised = summary.already_normalized(),
                unchanged = summary.unchanged,
                failed = summary.failed(),
                "done"
            );
            ExitCode::SUCCESS
        }
        Command::Watch { initial_scan } => match daemon.run_watch(initial_scan).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "watch failed");
                ExitCode::FAILURE
            }
        },
    }
}
