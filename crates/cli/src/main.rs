//! `swapshard` command line.

use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use swapshard_core::{Config, Error, TimestampSecs};
use swapshard_features::{
    build_candles_until, latest_candles, open_shards, PriceSeries, SeriesAggregator,
};
use swapshard_ingestion::shards::next_sync_delay;
use swapshard_ingestion::{
    resolve_start, FetchCursor, PaginatedFetcher, ShardOutcome, ShardStore, ShardSyncer,
    SubgraphClient, TracingObserver,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "swapshard")]
#[command(about = "Fetch DEX swaps into SQLite shards and build price series", long_about = None)]
struct Args {
    /// JSON configuration file; defaults apply when omitted
    #[arg(long, short = 'c', env = "SWAPSHARD_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch swaps backward into a single shard file
    Fetch {
        /// Shard database path
        #[arg(long)]
        db: PathBuf,

        /// Stop once the cursor reaches this timestamp (default: initial timestamp)
        #[arg(long)]
        lower_bound: Option<TimestampSecs>,

        /// Start cursor (default: earliest stored swap, else now)
        #[arg(long)]
        as_of: Option<TimestampSecs>,
    },

    /// Fetch every complete day since the initial timestamp into day shards
    Sync,

    /// Run the day-shard sync once a day at the configured hour (UTC)
    Schedule {
        /// Override the configured sync hour
        #[arg(long)]
        hour: Option<u32>,
    },

    /// Print the merged price series as CSV (timestamp,price,rolling_mad)
    Series {
        /// Shard directory (default: configured shards path)
        #[arg(long)]
        shards: Option<PathBuf>,
    },

    /// Print candles as JSON
    Candles {
        /// Shard directory (default: configured shards path)
        #[arg(long)]
        shards: Option<PathBuf>,

        /// Candle period in seconds (default: configured period)
        #[arg(long)]
        period: Option<i64>,

        /// Only the latest N candles
        #[arg(long)]
        limit: Option<usize>,

        /// Latest candle may start no later than this (default: now)
        #[arg(long)]
        reference_time: Option<TimestampSecs>,

        /// MAD outlier threshold (default: configured threshold)
        #[arg(long)]
        mad_threshold: Option<f64>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Fetch {
            db,
            lower_bound,
            as_of,
        } => fetch(&config, db, lower_bound, as_of).await,
        Command::Sync => sync(&config).await,
        Command::Schedule { hour } => {
            schedule(&config, hour.unwrap_or(config.shards.sync_hour)).await
        }
        Command::Series { shards } => series(&config, shards),
        Command::Candles {
            shards,
            period,
            limit,
            reference_time,
            mad_threshold,
        } => candles(&config, shards, period, limit, reference_time, mad_threshold),
    }
}

async fn fetch(
    config: &Config,
    db: PathBuf,
    lower_bound: Option<TimestampSecs>,
    as_of: Option<TimestampSecs>,
) -> Result<()> {
    let mut store = ShardStore::open(&db)
        .with_context(|| format!("failed to open shard {}", db.display()))?;
    let as_of = match as_of {
        Some(ts) => ts,
        None => resolve_start(&store)?,
    };
    let lower_bound = lower_bound.unwrap_or(config.shards.initial_timestamp);

    let client = SubgraphClient::new(&config.subgraph)?;
    let fetcher = PaginatedFetcher::new(client);
    let mut observer = TracingObserver::new(db.display().to_string());
    let report = fetcher
        .run(&mut store, FetchCursor::new(as_of, lower_bound), &mut observer)
        .await;
    info!(shard = %db.display(), stored = store.count()?, "shard row count");

    if report.reason.is_error() {
        bail!("fetch stopped: {}", report.reason);
    }
    Ok(())
}

async fn sync(config: &Config) -> Result<()> {
    let client = SubgraphClient::new(&config.subgraph)?;
    let syncer = ShardSyncer::new(client, &config.shards.shards_path);
    let mut observer = TracingObserver::new("shard syncer");

    let outcomes = syncer
        .sync_since(config.shards.initial_timestamp, Utc::now(), &mut observer)
        .await?;

    let mut finalized = 0;
    let mut skipped = 0;
    for (day, outcome) in &outcomes {
        match outcome {
            ShardOutcome::Finalized(_) => finalized += 1,
            ShardOutcome::Skipped => skipped += 1,
            ShardOutcome::Incomplete(report) => {
                bail!("shard {} incomplete: {}", day.name(), report.reason);
            }
        }
    }
    info!(finalized, skipped, "shard sync finished");
    Ok(())
}

async fn schedule(config: &Config, hour: u32) -> Result<()> {
    if hour > 23 {
        warn!(hour, "invalid sync hour, defaulting to 23");
    }
    let mut min_delay = Duration::ZERO;
    loop {
        let delay = next_sync_delay(Utc::now().naive_utc(), hour).max(min_delay);
        info!(wait_secs = delay.as_secs(), "next sync scheduled");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return Ok(());
            }
        }

        info!("executing shard syncer");
        if let Err(e) = sync(config).await {
            warn!(error = %e, "shard sync failed, retrying at next schedule");
        }
        // Do not fire twice within the scheduled second.
        min_delay = Duration::from_secs(1);
    }
}

fn build_series(config: &Config, shards: Option<PathBuf>) -> Result<PriceSeries> {
    let dir = shards.unwrap_or_else(|| PathBuf::from(&config.shards.shards_path));
    let stores = open_shards(&dir)
        .with_context(|| format!("failed to open shards in {}", dir.display()))?;
    let series = SeriesAggregator::from_config(config).aggregate(&stores)?;
    info!(
        trades = series.len(),
        kept = series.stats.kept,
        total = series.stats.total,
        "series built"
    );
    Ok(series)
}

fn series(config: &Config, shards: Option<PathBuf>) -> Result<()> {
    let series = build_series(config, shards)?;

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    writeln!(out, "timestamp,price,rolling_mad")?;
    for (index, point) in series.points().enumerate() {
        match series.mad_at(index) {
            Ok(mad) => writeln!(out, "{},{},{}", point.timestamp, point.price, mad)?,
            Err(Error::InsufficientData(_)) => {
                writeln!(out, "{},{},", point.timestamp, point.price)?
            }
            Err(e) => return Err(e.into()),
        }
    }
    out.flush()?;
    Ok(())
}

fn candles(
    config: &Config,
    shards: Option<PathBuf>,
    period: Option<i64>,
    limit: Option<usize>,
    reference_time: Option<TimestampSecs>,
    mad_threshold: Option<f64>,
) -> Result<()> {
    let series = build_series(config, shards)?;
    let period = period.unwrap_or(config.series.candle_period_secs);
    let threshold = mad_threshold.or(config.series.mad_filter_threshold);
    let reference = reference_time.unwrap_or_else(|| Utc::now().timestamp());
    let all = build_candles_until(&series, period, threshold, reference)?;
    let selected = latest_candles(&all, limit.unwrap_or(all.len()), reference);

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    serde_json::to_writer_pretty(&mut out, selected)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}
