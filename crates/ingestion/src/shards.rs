//! Day shards: one SQLite file per UTC day.
//!
//! A day is fetched into `<day>_temp.db` and renamed to `<day>.db` only
//! after the fetch loop ended cleanly. An interrupted day keeps its temp
//! file, and the next sync resumes from the oldest swap stored there.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use swapshard_core::{Result, TimestampSecs};
use tracing::{info, warn};

use crate::checkpoint::resolve_start_or;
use crate::fetcher::{FetchCursor, FetchObserver, FetchReport, PaginatedFetcher};
use crate::store::ShardStore;
use crate::subgraph::SwapSource;

const SECONDS_PER_DAY: i64 = 86_400;
const SHARD_EXT: &str = "db";
const TEMP_SUFFIX: &str = "_temp";

/// A single UTC day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayShard {
    pub date: NaiveDate,
}

impl DayShard {
    /// Wrap a calendar date.
    pub fn new(date: NaiveDate) -> Self {
        Self { date }
    }

    /// The day containing `ts`.
    pub fn containing(ts: TimestampSecs) -> Option<Self> {
        DateTime::from_timestamp(ts, 0).map(|dt| Self::new(dt.date_naive()))
    }

    /// First second of the day.
    pub fn start(&self) -> TimestampSecs {
        self.date.and_time(NaiveTime::MIN).and_utc().timestamp()
    }

    /// Last second of the day.
    pub fn end(&self) -> TimestampSecs {
        self.start() + SECONDS_PER_DAY - 1
    }

    /// Date as `YYYY-MM-DD`.
    pub fn name(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    /// Path of the finalized shard in `dir`.
    pub fn final_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.{}", self.name(), SHARD_EXT))
    }

    /// Path of the in-progress shard in `dir`.
    pub fn temp_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}{}.{}", self.name(), TEMP_SUFFIX, SHARD_EXT))
    }
}

/// Complete days from the one containing `initial_timestamp` up to
/// yesterday, newest first.
pub fn plan_days(initial_timestamp: TimestampSecs, now: DateTime<Utc>) -> Vec<DayShard> {
    let Some(first) = DayShard::containing(initial_timestamp) else {
        return Vec::new();
    };
    let mut days = Vec::new();
    let mut date = now.date_naive();
    while let Some(prev) = date.checked_sub_days(Days::new(1)) {
        if prev < first.date {
            break;
        }
        days.push(DayShard::new(prev));
        date = prev;
    }
    days
}

/// Time to wait from `now` until the next `hour:00:00`.
///
/// Hours past 23 are treated as 23. Returns zero when `now` is exactly on
/// the hour.
pub fn next_sync_delay(now: NaiveDateTime, hour: u32) -> Duration {
    let hour = hour.min(23);
    let at = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
    let mut next = now.date().and_time(at);
    if next < now {
        next += chrono::Duration::days(1);
    }
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

/// Finalized shard files in `dir`, sorted by name. Temp files are ignored.
pub fn list_shard_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let is_db = path.extension().and_then(|e| e.to_str()) == Some(SHARD_EXT);
        let is_temp = path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.ends_with(TEMP_SUFFIX));
        if is_db && !is_temp {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Result of syncing one day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardOutcome {
    /// A finalized shard already existed.
    Skipped,
    /// The day was fetched completely and renamed to its final path.
    Finalized(FetchReport),
    /// The run stopped on an error; the temp file was kept.
    Incomplete(FetchReport),
}

/// Fetches day shards into a directory.
pub struct ShardSyncer<S> {
    fetcher: PaginatedFetcher<S>,
    dir: PathBuf,
}

impl<S: SwapSource> ShardSyncer<S> {
    /// Create a syncer writing shards into `dir`.
    /// 
    /// Swaps older than a shard's day are dropped rather than stored.
    pub fn new(source: S, dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher: PaginatedFetcher::new(source).with_bound_clipping(true),
            dir: dir.into(),
        }
    }

    /// Fetch one day unless its final shard already exists.
    pub async fn sync_day(
        &self,
        day: DayShard,
        observer: &mut dyn FetchObserver,
    ) -> Result<ShardOutcome> {
        let final_path = day.final_path(&self.dir);
        if final_path.exists() {
            info!(shard = %day.name(), "shard exists locally, skipping");
            return Ok(ShardOutcome::Skipped);
        }
        std::fs::create_dir_all(&self.dir)?;

        let temp_path = day.temp_path(&self.dir);
        // The store must be closed before the file is renamed.
        let (report, rows) = {
            let mut store = ShardStore::open(&temp_path)?;
            let as_of = resolve_start_or(&store, day.end())?;
            let cursor = FetchCursor::new(as_of.min(day.end()), day.start() - 1);
            info!(shard = %day.name(), "creating shard from subgraph");
            let report = self.fetcher.run(&mut store, cursor, observer).await;
            (report, store.count()?)
        };

        if report.reason.is_complete() {
            std::fs::rename(&temp_path, &final_path)?;
            info!(
                shard = %day.name(),
                swaps = rows,
                inserted = report.stats.trades_inserted,
                "shard finalized"
            );
            Ok(ShardOutcome::Finalized(report))
        } else {
            warn!(
                shard = %day.name(),
                reason = %report.reason,
                "shard incomplete, temp file kept for resume"
            );
            Ok(ShardOutcome::Incomplete(report))
        }
    }

    /// Sync days in order, stopping at the first day that does not
    /// finish.
    pub async fn sync_all(
        &self,
        days: &[DayShard],
        observer: &mut dyn FetchObserver,
    ) -> Result<Vec<(DayShard, ShardOutcome)>> {
        let mut outcomes = Vec::with_capacity(days.len());
        for &day in days {
            let outcome = self.sync_day(day, observer).await?;
            let stop = matches!(outcome, ShardOutcome::Incomplete(_));
            outcomes.push((day, outcome));
            if stop {
                break;
            }
        }
        Ok(outcomes)
    }

    /// Plan and sync every complete day since `initial_timestamp`.
    pub async fn sync_since(
        &self,
        initial_timestamp: TimestampSecs,
        now: DateTime<Utc>,
        observer: &mut dyn FetchObserver,
    ) -> Result<Vec<(DayShard, ShardOutcome)>> {
        let days = plan_days(initial_timestamp, now);
        info!(days = days.len(), dir = %self.dir.display(), "syncing day shards");
        self.sync_all(&days, observer).await
    }
}
