//! Jobrunner - process supervision and output event reconstruction.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use jobrunner::config::{ConfigLoader, RunnerMode};
use jobrunner::display;
use jobrunner::job::{Runner, RunnerError};
use jobrunner::plugins::{cancel_on_token, StatusUpdate};

#[derive(Parser)]
#[command(
    name = "jobrunner",
    about = "Run a command and reconstruct its structured events",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command under supervision.
    Run {
        /// Config file to load instead of the default search paths.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Base directory for job artifacts.
        #[arg(long)]
        artifact_dir: Option<PathBuf>,
        /// Job identifier.
        #[arg(long)]
        ident: Option<String>,
        /// Seconds without output before the job is killed.
        #[arg(long)]
        idle_timeout: Option<f64>,
        /// Seconds of runtime before the job is killed.
        #[arg(long)]
        job_timeout: Option<f64>,
        /// How the child is driven.
        #[arg(long, value_enum)]
        mode: Option<RunnerMode>,
        /// Write marker events as JSON lines.
        #[arg(long)]
        json: bool,
        /// Do not echo job output.
        #[arg(short, long)]
        quiet: bool,
        /// Command and arguments to run.
        #[arg(last = true)]
        argv: Vec<String>,
    },
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[allow(clippy::too_many_arguments)]
async fn run(
    config_path: Option<PathBuf>,
    artifact_dir: Option<PathBuf>,
    ident: Option<String>,
    idle_timeout: Option<f64>,
    job_timeout: Option<f64>,
    mode: Option<RunnerMode>,
    json: bool,
    quiet: bool,
    argv: Vec<String>,
) -> Result<i32, RunnerError> {
    let loader = config_path.map_or_else(ConfigLoader::new, ConfigLoader::with_path);
    let mut config = loader.load()?;
    if !argv.is_empty() {
        config.command = argv;
    }
    if let Some(dir) = artifact_dir {
        config.artifact_dir = dir;
    }
    if ident.is_some() {
        config.ident = ident;
    }
    if idle_timeout.is_some() {
        config.idle_timeout = idle_timeout;
    }
    if job_timeout.is_some() {
        config.job_timeout = job_timeout;
    }
    if let Some(mode) = mode {
        config.mode = mode;
    }
    config.json_mode |= json;
    config.suppress_output |= quiet;
    let argv = config.command.clone();
    let show_status = !config.suppress_output;

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, canceling job");
            ctrl_c.cancel();
        }
    });

    let runner = Runner::new(config)?
        .with_cancel_callback(cancel_on_token(token))
        .with_status_handler(Arc::new(move |update: &StatusUpdate| {
            tracing::debug!(ident = %update.runner_ident, status = %update.status, "Status update");
            if show_status && !update.status.is_terminal() {
                display::print_status(&update.runner_ident, update.status);
            }
        }));
    let handle = runner.handle();
    display::print_job_start(handle.ident(), &argv);

    let outcome = runner.run().await?;
    display::print_outcome(handle.ident(), &outcome);
    match handle.stats().await {
        Ok(Some(stats)) => display::print_stats(&stats),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "Could not read events"),
    }
    Ok(outcome.rc)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            artifact_dir,
            ident,
            idle_timeout,
            job_timeout,
            mode,
            json,
            quiet,
            argv,
        } => {
            let result = run(
                config,
                artifact_dir,
                ident,
                idle_timeout,
                job_timeout,
                mode,
                json,
                quiet,
                argv,
            )
            .await;
            match result {
                Ok(rc) => ExitCode::from(u8::try_from(rc).unwrap_or(1)),
                Err(e) => {
                    display::print_error(&e.to_string());
                    ExitCode::FAILURE
                }
            }
        }
    }
}
