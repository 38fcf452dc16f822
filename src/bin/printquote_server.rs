//! PrintQuote server and CLI
//!
//! Commands: serve, materials, quote
//! `materials` and `quote` write JSON to stdout; logs always go to stderr
//! (or `--log-file`). Returns non-zero on failure, 2 when a quote is rejected.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use printquote_core::server::{app, AppState};
use printquote_core::slicer::SlicingEngine;
use printquote_core::uploads::UploadDir;
use printquote_core::{
    ConfigStore, FileRepository, FixtureEngine, PrusaSlicerEngine, QuoteParams, QuotePipeline,
    QuoteSigner, QuoteStore, SequentialJobQueue, SigningKey,
};

const SECRET_ENV: &str = "QUOTE_HMAC_SECRET";

#[derive(Parser)]
#[command(name = "printquote-server")]
#[command(about = "PrintQuote - 3D print quote engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the JSON configuration file (created with defaults if missing)
    #[arg(long, global = true, env = "CONFIG_FILE", default_value = "config.json")]
    config: PathBuf,

    /// Replay a recorded slicer report instead of running the slicer
    #[arg(long, global = true)]
    fixture_report: Option<PathBuf>,

    /// Slicer binary, overriding `slicer.path` from the configuration
    #[arg(long, global = true, env = "PRUSA_SLICER_PATH")]
    slicer_path: Option<String>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:5000")]
        bind: SocketAddr,

        /// Directory holding one sub-directory per quote
        #[arg(long, env = "QUOTES_DIR", default_value = "quotes")]
        quotes_dir: PathBuf,

        /// Directory models are uploaded into
        #[arg(long, env = "UPLOADS_DIR", default_value = "uploads")]
        uploads_dir: PathBuf,
    },

    /// Print the configured materials
    Materials,

    /// Slice and price one model without storing a quote
    Quote {
        /// Model file
        #[arg(short, long)]
        model: PathBuf,

        #[arg(long, default_value = "pla")]
        material: String,

        #[arg(long, default_value = "standard")]
        quality: String,

        #[arg(long, default_value = "prusa_mk3s")]
        printer: String,

        #[arg(long, default_value_t = 1)]
        quantity: u32,

        #[arg(long, default_value_t = 20)]
        infill: u8,

        #[arg(long)]
        supports: bool,

        /// Post-processing option key, repeatable
        #[arg(long = "post-processing")]
        post_processing: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli) {
        eprintln!("failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Arc::new(
        ConfigStore::load_or_init(&cli.config)
            .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?,
    );

    let choice = EngineChoice {
        fixture_report: cli.fixture_report,
        slicer_path: cli.slicer_path,
    };

    match cli.command {
        Commands::Materials => {
            let snapshot = config.snapshot();
            println!("{}", serde_json::to_string_pretty(&snapshot.materials)?);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Quote {
            model,
            material,
            quality,
            printer,
            quantity,
            infill,
            supports,
            post_processing,
        } => {
            let pipeline = build_pipeline(config, &choice)?;
            let params = QuoteParams {
                material,
                quality,
                printer,
                quantity,
                infill_percent: infill,
                supports,
                post_processing,
            }
            .normalized();

            match pipeline.calculate(&model, &params).await {
                Ok(calculation) => {
                    let output = serde_json::json!({ "success": true, "quote": calculation });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    warn!(error = %e, "quote rejected");
                    let output = serde_json::json!({ "success": false, "error": e.public_message() });
                    println!("{}", serde_json::to_string(&output)?);
                    Ok(ExitCode::from(2))
                }
            }
        }

        Commands::Serve {
            bind,
            quotes_dir,
            uploads_dir,
        } => {
            let pipeline = build_pipeline(config, &choice)?;
            for dir in [&quotes_dir, &uploads_dir] {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }

            let store = QuoteStore::new(
                Arc::clone(&pipeline),
                Arc::new(FileRepository::new(&quotes_dir)),
                UploadDir::new(&uploads_dir),
            );
            let router = app(AppState::new(Arc::new(store)));

            let listener = tokio::net::TcpListener::bind(bind)
                .await
                .with_context(|| format!("failed to bind {bind}"))?;
            info!(
                addr = %bind,
                quotes_dir = %quotes_dir.display(),
                uploads_dir = %uploads_dir.display(),
                engine = pipeline.engine_name(),
                "PrintQuote listening"
            );

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal(Arc::clone(&pipeline)))
                .await
                .context("server error")?;

            info!("server stopped");
            Ok(ExitCode::SUCCESS)
        }
    }
}

struct EngineChoice {
    fixture_report: Option<PathBuf>,
    slicer_path: Option<String>,
}

/// Fails fast on a missing secret or an unreachable slicer binary.
fn build_pipeline(config: Arc<ConfigStore>, choice: &EngineChoice) -> Result<Arc<QuotePipeline>> {
    let secret = std::env::var(SECRET_ENV).with_context(|| format!("{SECRET_ENV} must be set"))?;
    let signer = QuoteSigner::new(
        SigningKey::from_secret(&secret).with_context(|| format!("{SECRET_ENV} is not a usable key"))?,
    );

    let settings = config.snapshot().slicer.clone();
    let binary = choice.slicer_path.as_deref().unwrap_or(&settings.path);
    let engine: Arc<dyn SlicingEngine> = match choice.fixture_report.as_deref() {
        Some(path) => {
            warn!(report = %path.display(), "using recorded slicer report, prices are not real");
            Arc::new(
                FixtureEngine::from_file(path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
            )
        }
        None => Arc::new(
            PrusaSlicerEngine::locate(binary, Duration::from_secs(settings.timeout_seconds))
                .context("slicing engine unavailable")?,
        ),
    };

    let queue = Arc::new(SequentialJobQueue::from_settings(&settings));
    Ok(Arc::new(QuotePipeline::new(config, engine, queue, signer)))
}

/// Resolves on Ctrl-C or SIGTERM, then abandons queued slicing jobs.
async fn shutdown_signal(pipeline: Arc<QuotePipeline>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
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
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(queue = ?pipeline.queue().stats(), "shutdown requested, closing job queue");
    pipeline.queue().close();
}
