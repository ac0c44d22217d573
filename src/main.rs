use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tcg_price_direction::config::AppConfig;
use tcg_price_direction::output;
use tcg_price_direction::pipeline::{self, RunOutput};
use tcg_price_direction::source::load_observations;
use tcg_price_direction::timeline::TimelineStore;

const DEFAULT_CONFIG_PATH: &str = "config/default.yaml";

#[derive(Parser)]
#[command(name = "tcg-backtest")]
#[command(about = "Walk-forward backtest of next-week price direction for trading cards")]
struct Cli {
    /// YAML config (defaults to $TCG_CONFIG_PATH, then config/default.yaml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest at a single decision threshold and write exports
    Run {
        /// Weekly sales records (.json array or .csv)
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory for generated files
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// P(UP) needed to call UP (overrides config)
        #[arg(short, long)]
        threshold: Option<f64>,
    },

    /// Re-run the backtest at several thresholds and compare
    Sweep {
        /// Weekly sales records (.json array or .csv)
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory for generated files
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Comma-separated thresholds, e.g. 0.4,0.5,0.6
        #[arg(short, long, value_delimiter = ',')]
        thresholds: Option<Vec<f64>>,
    },

    /// Derive feature tables and dump them to CSV
    Features {
        /// Weekly sales records (.json array or .csv)
        #[arg(short, long)]
        input: PathBuf,

        /// Destination CSV
        #[arg(short, long, default_value = "output/features.csv")]
        output: PathBuf,
    },
}

#[derive(Tabled)]
struct SweepRow {
    #[tabled(rename = "Threshold")]
    threshold: String,
    #[tabled(rename = "N")]
    predictions: usize,
    #[tabled(rename = "Accuracy")]
    accuracy: String,
    #[tabled(rename = "95% CI")]
    interval: String,
    #[tabled(rename = "Precision")]
    precision: String,
    #[tabled(rename = "Recall")]
    recall: String,
    #[tabled(rename = "F1")]
    f1: String,
    #[tabled(rename = "Called UP")]
    up_rate: String,
}

fn resolve_config(explicit: Option<PathBuf>) -> Result<AppConfig> {
    let path = explicit.or_else(|| {
        let candidate = std::env::var("TCG_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        candidate.exists().then_some(candidate)
    });

    AppConfig::load_with_env(path.as_deref()).context("Failed to load configuration")
}

fn init_logging(config: &AppConfig, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if json || config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .init();
    }
}

fn load_store(input: &Path) -> Result<TimelineStore> {
    Ok(load_observations(input)?.into_store())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = resolve_config(cli.config)?;
    init_logging(&config, cli.log_json);

    match cli.command {
        Commands::Run {
            input,
            output_dir,
            threshold,
        } => {
            let mut config = config;
            if let Some(t) = threshold {
                config.backtest.threshold = t;
            }
            run_single(&config, &input, output_dir).await?;
        }
        Commands::Sweep {
            input,
            output_dir,
            thresholds,
        } => {
            run_sweep(&config, &input, output_dir, thresholds).await?;
        }
        Commands::Features { input, output } => {
            dump_features(&config, &input, &output)?;
        }
    }

    Ok(())
}

async fn run_single(config: &AppConfig, input: &Path, output_dir: Option<PathBuf>) -> Result<()> {
    let store = load_store(input)?;
    let result = pipeline::run_store(config, store, &[])
        .await
        .context("Backtest failed")?;

    finish(config, &result, output_dir)?;
    println!("{}", output::generate_report(&result));
    Ok(())
}

async fn run_sweep(
    config: &AppConfig,
    input: &Path,
    output_dir: Option<PathBuf>,
    thresholds: Option<Vec<f64>>,
) -> Result<()> {
    let thresholds = thresholds.unwrap_or_else(|| config.sweep.thresholds.clone());
    let store = load_store(input)?;
    let result = pipeline::run_store(config, store, &thresholds)
        .await
        .context("Threshold sweep failed")?;

    finish(config, &result, output_dir)?;

    let rows: Vec<SweepRow> = result
        .evaluation
        .thresholds
        .iter()
        .map(|t| SweepRow {
            threshold: format!("{:.2}", t.threshold),
            predictions: t.predictions,
            accuracy: format!("{:.1}%", t.accuracy * 100.0),
            interval: format!("{:.1}-{:.1}%", t.accuracy_ci_lower * 100.0, t.accuracy_ci_upper * 100.0),
            precision: format!("{:.3}", t.precision),
            recall: format!("{:.3}", t.recall),
            f1: format!("{:.3}", t.f1),
            up_rate: format!("{:.1}%", t.predicted_up_rate * 100.0),
        })
        .collect();

    println!("\n📊 THRESHOLD SWEEP ({})", result.model);
    println!("{}", Table::new(rows).with(Style::rounded()));
    if let Some(best) = result.evaluation.best_by_f1() {
        println!("Best F1: {:.3} at threshold {:.2}", best.f1, best.threshold);
    }
    Ok(())
}

fn finish(config: &AppConfig, result: &RunOutput, output_dir: Option<PathBuf>) -> Result<()> {
    let dir = output_dir.unwrap_or_else(|| config.output.dir.clone());
    output::write_all(result, &dir, config.output.write_predictions)?;
    info!(dir = %dir.display(), "exports written");
    Ok(())
}

fn dump_features(config: &AppConfig, input: &Path, output_path: &Path) -> Result<()> {
    config.features.validate().context("Invalid feature configuration")?;

    let store = load_store(input)?;
    let tables = pipeline::derive_tables(&store, &config.features);
    let rows: usize = tables.iter().map(|t| t.len()).sum();
    if rows == 0 {
        warn!("no entity has enough history for a single feature row");
    }

    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    output::export_features_csv(&tables, output_path)?;

    println!(
        "✅ {} feature rows for {} entities written to {}",
        rows,
        tables.len(),
        output_path.display()
    );
    Ok(())
}
