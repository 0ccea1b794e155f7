//! Fund scoring research CLI.
//!
//! # Usage
//!
//! ```bash
//! # Build monthly feature snapshots from NAV history
//! fundfit-backtest --config config/research.toml features --start 2015-01-01 --end 2025-06-30
//!
//! # Search weights on a training range
//! fundfit-backtest --config config/research.toml optimize --start 2018-01-01 --end 2023-12-31 --output results/weights.json
//!
//! # Fit ridge weights from one snapshot to the next
//! fundfit-backtest fit --train-snapshot 2024-06-28 --target-snapshot 2024-12-31 --output results/ridge.json
//!
//! # Evaluate or rank with a weight file
//! fundfit-backtest evaluate --weights results/weights.json --start 2024-01-01
//! fundfit-backtest rank --weights results/weights.json --date 2024-12-31
//!
//! # Walk-forward and hold-out validation
//! fundfit-backtest walk-forward --method ridge --output results/walk_forward.json
//! fundfit-backtest holdout --weights results/weights.json --dates 2024-06-28,2024-12-31
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;

use fundfit_backtest::data::{parse_snapshot_date, prepare_targets};
use fundfit_backtest::scoring::{parse_grid, parse_weight_caps};
use fundfit_backtest::walkforward::HoldoutValidator;
use fundfit_backtest::{
    Feature, FeatureEngine, FeatureStore, FeatureTable, ParquetStore, PortfolioEvaluator,
    ResearchConfig, SamplingCalendar, SamplingFrequency, Scorer, SnapshotFilter,
    WalkForwardValidator, WeightFile, WeightOptimizer,
};

const SEPARATOR: &str = "============================================================";

#[derive(Parser)]
#[command(name = "fundfit-backtest")]
#[command(about = "Fund scoring research: features, weight search and walk-forward validation")]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the configured feature table
    #[arg(long, global = true)]
    table: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute feature snapshots from NAV prices and write them as a table
    Features {
        /// First price date (YYYY-MM-DD)
        #[arg(long)]
        start: String,

        /// Last price date (YYYY-MM-DD)
        #[arg(long)]
        end: String,

        /// Ignore prices after this date
        #[arg(long)]
        as_of: Option<String>,

        /// Sampling frequency: daily, weekly or monthly
        #[arg(long)]
        frequency: Option<String>,
    },

    /// Search weights maximizing the configured objective
    Optimize {
        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,

        /// Comma-separated features to search
        #[arg(long)]
        features: Option<String>,

        /// Comma-separated candidate weights, e.g. "-0.5,0,0.5"
        #[arg(long)]
        grid: Option<String>,

        /// Per-feature caps, e.g. "ret_3m=0.1,mdd_36m=0.2"
        #[arg(long)]
        caps: Option<String>,

        /// Output weight file
        #[arg(short, long, default_value = "results/weights.json")]
        output: PathBuf,
    },

    /// Fit ridge regression weights
    Fit {
        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,

        /// Fit a single snapshot against a later one instead of the whole range
        #[arg(long, requires = "target_snapshot")]
        train_snapshot: Option<String>,

        #[arg(long, requires = "train_snapshot")]
        target_snapshot: Option<String>,

        /// Override the configured regularization strength
        #[arg(long)]
        lambda: Option<f64>,

        #[arg(short, long, default_value = "results/ridge_weights.json")]
        output: PathBuf,
    },

    /// Evaluate a weight file as a top-K portfolio
    Evaluate {
        #[arg(short, long)]
        weights: PathBuf,

        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Rank funds at one snapshot date
    Rank {
        #[arg(short, long)]
        weights: PathBuf,

        #[arg(long)]
        date: String,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Run walk-forward validation
    WalkForward {
        #[arg(long, value_enum, default_value_t = Method::Grid)]
        method: Method,

        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,

        #[arg(short, long, default_value = "results/walk_forward.json")]
        output: PathBuf,
    },

    /// Compare predicted picks with realized prices
    Holdout {
        #[arg(short, long)]
        weights: PathBuf,

        /// Comma-separated prediction dates
        #[arg(long)]
        dates: String,

        #[arg(short, long, default_value = "results/holdout.json")]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Method {
    Grid,
    Ridge,
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    parse_snapshot_date(raw).with_context(|| format!("Invalid date (expected YYYY-MM-DD): {}", raw))
}

fn parse_optional(raw: Option<&str>) -> Result<Option<NaiveDate>> {
    raw.map(parse_date).transpose()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Results saved to: {}", path.display());
    Ok(())
}

/// Loads the feature table named in the config, restricted to an inclusive range.
fn load_table(
    store: &ParquetStore,
    config: &ResearchConfig,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<FeatureTable> {
    let filter = SnapshotFilter {
        start: parse_optional(start)?,
        end: parse_optional(end)?,
    };
    let table = store
        .load_features(&config.data.feature_table, &filter)
        .with_context(|| format!("Failed to load feature table {}", config.data.feature_table))?;
    info!("Loaded {} feature records", table.len());
    Ok(table)
}

fn cmd_features(
    store: &ParquetStore,
    config: &ResearchConfig,
    start: &str,
    end: &str,
    as_of: Option<&str>,
    frequency: Option<&str>,
) -> Result<()> {
    let frequency = match frequency {
        Some(raw) => SamplingFrequency::from_str(raw)?,
        None => config.features.frequency,
    };
    let mut calendar = SamplingCalendar::new(frequency);
    if let Some(as_of) = parse_optional(as_of)? {
        calendar = calendar.with_as_of(as_of);
    }

    let engine = FeatureEngine::new(config.features.engine.clone());
    let table = engine.build_from_store(store, parse_date(start)?, parse_date(end)?, &calendar)?;
    let path = store.write_features(&config.data.feature_table, &table)?;

    println!("{}", SEPARATOR);
    println!("Feature records: {}", table.len());
    println!("Instruments: {}", table.instruments().len());
    println!("Snapshots: {}", table.snapshot_dates().len());
    println!("Written to: {}", path.display());
    println!("{}", SEPARATOR);
    Ok(())
}

fn cmd_optimize(
    store: &ParquetStore,
    mut config: ResearchConfig,
    start: Option<&str>,
    end: Option<&str>,
    features: Option<&str>,
    grid: Option<&str>,
    caps: Option<&str>,
    output: &Path,
) -> Result<()> {
    if let Some(raw) = features {
        config.search.features = Feature::parse_list(raw)?;
    }
    if let Some(raw) = grid {
        config.search.grid = Some(parse_grid(raw)?);
    }
    if let Some(raw) = caps {
        config.search.optimizer.constraints.caps = parse_weight_caps(raw)?;
    }

    let optimizer = config.search.optimizer()?;
    let target = config.walk_forward.run.target()?;
    let table = prepare_targets(&load_table(store, &config, start, end)?, target);
    let outcome = optimizer.search(&table, target)?;

    println!("{}", SEPARATOR);
    println!("Best {:?}: {:.4}", outcome.objective, outcome.objective_value);
    println!("Candidates evaluated: {} ({:?})", outcome.evaluated, outcome.mode);
    println!("Weights: {}", outcome.weights);
    println!("{}", SEPARATOR);

    let file = WeightFile::new(outcome.weights.clone())
        .with_metadata("method", optimizer.name())
        .with_metadata("target", target.name())
        .with_metadata("objective", serde_json::to_value(outcome.objective)?)
        .with_metadata("objective_value", outcome.objective_value)
        .with_metadata("metrics", serde_json::to_value(outcome.metrics)?)
        .with_metadata("evaluated", outcome.evaluated);
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    file.save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Weights saved to: {}", output.display());
    Ok(())
}

fn cmd_fit(
    store: &ParquetStore,
    mut config: ResearchConfig,
    start: Option<&str>,
    end: Option<&str>,
    snapshots: Option<(&str, &str)>,
    lambda: Option<f64>,
    output: &Path,
) -> Result<()> {
    if let Some(lambda) = lambda {
        config.ridge.lambda = lambda;
    }
    let ridge = config.ridge_optimizer()?;
    let table = load_table(store, &config, start, end)?;

    if let Some((train, target)) = snapshots {
        let fit = ridge.fit_cross_section(
            &table,
            parse_date(train)?,
            parse_date(target)?,
            config.walk_forward.run.horizon_months,
            config.walk_forward.run.top_k,
        )?;
        println!("{}", SEPARATOR);
        println!("Observations: {}  R²: {:.4}", fit.fit.observations, fit.fit.r_squared);
        println!(
            "Top-{} overlap: {} ({:.2}%)",
            fit.top_k,
            fit.overlap_count,
            fit.overlap_rate * 100.0
        );
        println!("Weights: {}", fit.fit.weights);
        println!("{}", SEPARATOR);
        return write_json(output, &fit);
    }

    let target = config.walk_forward.run.target()?;
    let fit = ridge.fit_detailed(&prepare_targets(&table, target), target)?;
    println!("{}", SEPARATOR);
    println!("Observations: {}  R²: {:.4}", fit.observations, fit.r_squared);
    println!("Weights: {}", fit.weights);
    println!("{}", SEPARATOR);

    let file = WeightFile::new(fit.weights.clone())
        .with_metadata("method", ridge.name())
        .with_metadata("lambda", fit.lambda)
        .with_metadata("target", target.name())
        .with_metadata("observations", fit.observations)
        .with_metadata("r_squared", fit.r_squared);
    write_json(output, &file)
}

fn cmd_evaluate(
    store: &ParquetStore,
    config: &ResearchConfig,
    weights: &Path,
    start: Option<&str>,
    end: Option<&str>,
    output: Option<&Path>,
) -> Result<()> {
    let weights = WeightFile::load(weights)
        .with_context(|| format!("Failed to load weights {}", weights.display()))?
        .weights;
    let target = config.walk_forward.run.target()?;
    let table = prepare_targets(&load_table(store, config, start, end)?, target);

    let scored = Scorer::new(weights).score(&table)?;
    let result = PortfolioEvaluator::new(config.walk_forward.run.top_k)?.evaluate(&scored, target)?;
    println!("{}", result.summary());

    match output {
        Some(path) => write_json(path, &result),
        None => Ok(()),
    }
}

fn cmd_rank(
    store: &ParquetStore,
    config: &ResearchConfig,
    weights: &Path,
    date: &str,
    top_k: Option<usize>,
) -> Result<()> {
    let weights = WeightFile::load(weights)
        .with_context(|| format!("Failed to load weights {}", weights.display()))?
        .weights;
    let date = parse_date(date)?;
    let table = store.load_features(&config.data.feature_table, &SnapshotFilter::on(date))?;

    let top_k = top_k.unwrap_or(config.walk_forward.run.top_k);
    let ranked = Scorer::new(weights).rank_snapshot(&table, date, top_k)?;

    println!("Top {} funds at {}", ranked.len(), date);
    for (rank, scored) in ranked.iter().enumerate() {
        println!("{:>4}. {:<10} {:>10.4}", rank + 1, scored.record.instrument_id, scored.score);
    }
    Ok(())
}

fn cmd_walk_forward(
    store: &ParquetStore,
    config: &ResearchConfig,
    method: Method,
    start: Option<&str>,
    end: Option<&str>,
    output: &Path,
) -> Result<()> {
    let configured = config.walk_forward.range()?;
    let start = match parse_optional(start)? {
        Some(date) => date,
        None => match configured {
            Some((date, _)) => date,
            None => bail!("No start date: pass --start or set walk_forward.start_date"),
        },
    };
    let end = match parse_optional(end)? {
        Some(date) => date,
        None => match configured {
            Some((_, date)) => date,
            None => bail!("No end date: pass --end or set walk_forward.end_date"),
        },
    };

    let optimizer: Box<dyn WeightOptimizer> = match method {
        Method::Grid => Box::new(config.search.optimizer()?),
        Method::Ridge => Box::new(config.ridge_optimizer()?),
    };
    let report = WalkForwardValidator::new(config.walk_forward.run)?.run(
        store,
        &config.data.feature_table,
        optimizer.as_ref(),
        start,
        end,
    )?;

    println!("{}", report.report());
    write_json(output, &report)
}

fn cmd_holdout(
    store: &ParquetStore,
    config: &ResearchConfig,
    weights: &Path,
    dates: &str,
    output: &Path,
) -> Result<()> {
    let weights = WeightFile::load(weights)
        .with_context(|| format!("Failed to load weights {}", weights.display()))?
        .weights;
    let dates: Vec<NaiveDate> = dates
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_date)
        .collect::<Result<_>>()?;

    let validator = HoldoutValidator::new(weights, config.walk_forward.holdout())?;
    let report = validator.run(store, &config.data.feature_table, store, &dates)?;

    println!("{}", report.report());
    write_json(output, &report)
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fundfit_backtest=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ResearchConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ResearchConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data.data_dir = dir;
    }
    if let Some(table) = cli.table {
        config.data.feature_table = table;
    }
    let store = ParquetStore::new(&config.data.data_dir);

    match cli.command {
        Commands::Features {
            start,
            end,
            as_of,
            frequency,
        } => cmd_features(
            &store,
            &config,
            &start,
            &end,
            as_of.as_deref(),
            frequency.as_deref(),
        )?,
        Commands::Optimize {
            start,
            end,
            features,
            grid,
            caps,
            output,
        } => cmd_optimize(
            &store,
            config,
            start.as_deref(),
            end.as_deref(),
            features.as_deref(),
            grid.as_deref(),
            caps.as_deref(),
            &output,
        )?,
        Commands::Fit {
            start,
            end,
            train_snapshot,
            target_snapshot,
            lambda,
            output,
        } => {
            let snapshots = train_snapshot.as_deref().zip(target_snapshot.as_deref());
            cmd_fit(
                &store,
                config,
                start.as_deref(),
                end.as_deref(),
                snapshots,
                lambda,
                &output,
            )?
        }
        Commands::Evaluate {
            weights,
            start,
            end,
            output,
        } => cmd_evaluate(
            &store,
            &config,
            &weights,
            start.as_deref(),
            end.as_deref(),
            output.as_deref(),
        )?,
        Commands::Rank {
            weights,
            date,
            top_k,
        } => cmd_rank(&store, &config, &weights, &date, top_k)?,
        Commands::WalkForward {
            method,
            start,
            end,
            output,
        } => cmd_walk_forward(
            &store,
            &config,
            method,
            start.as_deref(),
            end.as_deref(),
            &output,
        )?,
        Commands::Holdout {
            weights,
            dates,
            output,
        } => cmd_holdout(&store, &config, &weights, &dates, &output)?,
    }

    Ok(())
}
