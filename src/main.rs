use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use clap::Parser;
use lethe::{
    config::{ConfigError, LetheConfig},
    db::DbPool,
    identifiers::{IdentifierSet, read_identifier_file},
    observability,
    purge::{DeletionProcedure, HttpErasureApi},
    report::{Report, Stage, write_artifacts},
    run::{ErasureRequest, ErasureRunner},
};
use tokio_util::sync::CancellationToken;

/// CLI arguments for lethe
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Erase user identities from a relational store and an analytics API",
    long_about = None
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to config file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Execute an erasure request and write its report
    Run(RunArgs),
    /// Load and deduplicate an identifier file without touching any store
    Validate {
        /// JSON array of identifier strings
        #[arg(long)]
        identifiers: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON array of identifier strings
    #[arg(long)]
    identifiers: PathBuf,

    /// Who asked for the erasure (recorded in the report and sent to the API)
    #[arg(long)]
    requested_by: String,

    /// Request id (defaults to a random UUID)
    #[arg(long)]
    request_id: Option<String>,

    /// Stage and count without committing, and simulate the external stage
    #[arg(long)]
    dry_run: bool,

    /// Report directory (overrides output.directory)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Identifiers per relational transaction (overrides relational.chunk_size)
    #[arg(long)]
    chunk_size: Option<NonZeroUsize>,

    /// Identifiers per API call (overrides external.batch_size)
    #[arg(long)]
    batch_size: Option<NonZeroUsize>,

    /// Concurrent API batches (overrides external.concurrent_batches)
    #[arg(long)]
    concurrency: Option<NonZeroUsize>,

    /// Attempts per API batch (overrides external.retry.max_attempts)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_attempts: Option<u32>,
}

impl RunArgs {
    fn apply_overrides(&self, config: &mut LetheConfig) {
        if let Some(size) = self.chunk_size {
            config.relational.chunk_size = Some(size);
        }
        if let Some(size) = self.batch_size {
            config.external.batch_size = size.get();
        }
        if let Some(n) = self.concurrency {
            config.external.concurrent_batches = n.get();
        }
        if let Some(n) = self.max_attempts {
            config.external.retry.max_attempts = n;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = observability::init_tracing(&config.observability.logging) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    match args.command {
        Command::Validate { identifiers } => run_validate(&identifiers).await,
        Command::Run(run_args) => run_erasure(config, run_args).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<LetheConfig, ConfigError> {
    match path {
        Some(path) => LetheConfig::from_file(path),
        None => Ok(LetheConfig::default()),
    }
}

async fn run_validate(path: &Path) -> ExitCode {
    let result = match read_identifier_file(path).await {
        Ok(raw) => IdentifierSet::from_raw(raw.as_slice()),
        Err(e) => Err(e),
    };

    match result {
        Ok(set) => {
            let counts = set.counts();
            tracing::info!(
                total_requested = counts.total_requested,
                unique = counts.unique_count,
                "Identifier file is valid"
            );
            match serde_json::to_string_pretty(&counts) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::warn!(error = %e, "Failed to render counts"),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Identifier file rejected");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_erasure(mut config: LetheConfig, args: RunArgs) -> ExitCode {
    args.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.output.directory));

    let mut request = ErasureRequest::new(args.requested_by, Vec::new()).with_dry_run(args.dry_run);
    if let Some(id) = args.request_id {
        request = request.with_request_id(id);
    }

    request.identifiers = match read_identifier_file(&args.identifiers).await {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load identifiers");
            let report = Report::rejected(request.metadata(), Stage::Input, e);
            return finish(report, &output_dir).await;
        }
    };

    let (runner, db) = match build_runner(&config).await {
        Ok(parts) => parts,
        Err(e) => {
            tracing::error!(error = %e, "Erasure setup failed");
            let report = Report::rejected(request.metadata(), Stage::Setup, e);
            return finish(report, &output_dir).await;
        }
    };

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(shutdown_signal(cancel.clone()));

    let report = runner.run(request, cancel.clone()).await;

    // Stop the signal listener before releasing connections
    cancel.cancel();
    let _ = signals.await;
    db.close().await;

    finish(report, &output_dir).await
}

/// Collaborators that could not be set up. Nothing has been modified yet.
#[derive(Debug, thiserror::Error)]
enum SetupError {
    #[error("relational.procedure_path is not configured")]
    MissingProcedure,

    #[error(transparent)]
    Procedure(#[from] lethe::purge::ProcedureError),

    #[error("failed to connect to database: {0}")]
    Database(#[from] lethe::db::DbError),

    #[error(transparent)]
    Api(#[from] lethe::purge::HttpApiError),
}

async fn build_runner(config: &LetheConfig) -> Result<(ErasureRunner, DbPool), SetupError> {
    let procedure_path = config
        .relational
        .procedure_path
        .as_deref()
        .ok_or(SetupError::MissingProcedure)?;
    let procedure = DeletionProcedure::load(procedure_path).await?;
    let api = HttpErasureApi::new(&config.external)?;
    let db = DbPool::from_config(&config.database).await?;

    tracing::info!(
        procedure = %procedure.path().display(),
        sha256 = procedure.sha256(),
        "Loaded deletion procedure"
    );

    let runner = ErasureRunner::new(
        db.purge(),
        Arc::new(api),
        procedure,
        config.relational.clone(),
        &config.external,
    );
    Ok((runner, db))
}

/// Write artifacts, print the summary and map the report to an exit code.
async fn finish(report: Report, output_dir: &Path) -> ExitCode {
    print!("{}", report.summary());

    if let Err(e) = write_artifacts(&report, output_dir).await {
        tracing::error!(error = %e, "Failed to write report artifacts");
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::from(report.exit_code())
}

/// Cancel `cancel` on SIGINT or SIGTERM. Returns early if the token is
/// cancelled by the caller.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = cancel.cancelled() => return,
    }

    tracing::warn!(
        "Shutdown signal received, letting in-flight work finish and skipping the rest"
    );
    cancel.cancel();
}
