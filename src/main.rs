//! oobe-harness CLI
//!
//! Runs the decile validation against a cluster, or against local files with
//! the in-process backend to check a configuration end to end.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use oobe_harness::config::HarnessConfig;
use oobe_harness::harness::Harness;
use oobe_harness::report::format_list;
use oobe_harness::service::{
    CurveEvaluator, HttpService, ImportRequest, MemoryService, TrainingService,
};
use oobe_harness::window::RowWindowTable;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "oobe-harness", about = "Decile train/score validation harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every trial
    Run {
        /// Path to the JSON config file
        #[arg(short, long, default_value = "harness.json")]
        config: PathBuf,

        /// Use the in-process backend on local files instead of the cluster
        #[arg(long)]
        local: bool,

        /// Override the report path from the config
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Load and validate a config file without running anything
    Check {
        /// Path to the JSON config file
        #[arg(short, long, default_value = "harness.json")]
        config: PathBuf,
    },

    /// Print the decile row windows for a dataset size
    Windows {
        /// Rows in the dataset
        #[arg(long)]
        rows: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            local,
            report,
        } => {
            let mut config = HarnessConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            if report.is_some() {
                config.report_path = report;
            }
            let harness = Harness::new(config)?;

            let report = if local {
                let service = local_service(harness.config()).await?;
                harness.run(service).await.into_result()?
            } else {
                let service = HttpService::new(harness.config().cluster.base_url.clone());
                harness.run(service).await.into_result()?
            };
            println!(
                "passed {} trial(s); train delta {}; score delta {}",
                report.trials_completed(),
                format_list(report.train_delta()),
                format_list(report.score_delta())
            );
        }

        Commands::Check { config } => {
            let config = HarnessConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            println!(
                "{}: {} trial(s), ntree {}, model timeout {}s, seed {}",
                config.dataset.full_path().display(),
                config.trials,
                config.hyperparameters.ntree(),
                config.model_timeout().as_secs(),
                config.seed
            );
        }

        Commands::Windows { rows } => {
            let table = RowWindowTable::new(rows)?;
            for (i, window) in table.as_array().iter().enumerate() {
                println!("T[{i:>2}] = {window:>10}  ({:.2}%)", table.pct_of_rows(i));
            }
            println!("last window shortfall: {}", table.last_window_shortfall());
        }
    }

    Ok(())
}

/// In-process backend whose model metrics follow the configured curves.
///
/// The dataset is parsed once here to size the curves; the run's own import
/// reuses the parsed frame.
async fn local_service(config: &HarnessConfig) -> anyhow::Result<MemoryService> {
    let dataset = &config.dataset;
    let request = ImportRequest::new(
        dataset.bucket.clone(),
        dataset.path.clone(),
        dataset.header,
        dataset.hex_key(),
    );
    let service = MemoryService::default();
    let frame = service
        .import_parse(&request)
        .await
        .with_context(|| format!("reading {}", dataset.full_path().display()))?;
    let table = RowWindowTable::new(frame.num_rows)?;
    Ok(service.with_evaluator(CurveEvaluator::from_expectations(
        &table,
        &config.expectations,
    )))
}
