//! CLI entry point for the congestion pricing audit pipeline.
//!
//! Provides subcommands for running the whole pipeline, re-running a single
//! stage, summarizing ghost trip patterns, and printing the effective config.

use anyhow::Result;
use clap::{Parser, Subcommand};
use congestion_audit::cleaning::analyze_ghost_patterns;
use congestion_audit::config::PipelineConfig;
use congestion_audit::pipeline::{self, Stage};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "congestion_audit")]
#[command(about = "Audit NYC taxi trips around congestion pricing", long_about = None)]
struct Cli {
    /// JSON config file; defaults are used for anything it leaves out
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root of the data tree, overriding the config file
    #[arg(short, long, global = true, env = "AUDIT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage in order, stopping at the first failure
    Run {
        /// Start from the raw files already on disk without waiting for them
        #[arg(long, default_value_t = false)]
        skip_ingest: bool,
    },
    /// Run a single stage against existing upstream outputs
    Stage {
        #[arg(value_enum)]
        stage: Stage,
    },
    /// Summarize ghost trips by flag, pickup hour and pickup zone
    GhostPatterns,
    /// Print the effective configuration as JSON
    ShowConfig,
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/congestion_audit.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("congestion_audit.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run { skip_ingest } => {
            let runs = pipeline::run_all(&config, skip_ingest).await?;
            for run in &runs {
                info!(
                    stage = %run.stage,
                    rows = run.rows,
                    duration_ms = run.duration_ms,
                    detail = %run.detail,
                    "Stage summary"
                );
            }
        }
        Commands::Stage { stage } => {
            pipeline::run_single(&config, stage).await?;
        }
        Commands::GhostPatterns => {
            let patterns = analyze_ghost_patterns(&config).await?;
            info!(
                total_ghost_trips = patterns.total_ghost_trips,
                flags = patterns.by_flag.len(),
                "Ghost patterns written"
            );
        }
        Commands::ShowConfig => {
            let json = serde_json::to_string_pretty(&config)?;
            info!(data_dir = %config.data_dir.display(), "Effective configuration");
            println!("{json}");
        }
    }

    Ok(())
}
