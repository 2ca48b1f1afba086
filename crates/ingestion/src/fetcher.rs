//! Backward paginated fetch loop.
//!
//! The loop is a two-state machine (running, stopped). While running it
//! asks the source for the newest page at or below the cursor, commits the
//! whole page to the store, and only then moves the cursor down to the
//! oldest timestamp of that page. The bound is inclusive, so swaps sharing
//! the boundary second come back on the next page and are absorbed by the
//! idempotent upsert.

use swapshard_core::{RawTrade, Result, TimestampSecs};
use tracing::{debug, error, info, warn};

use crate::store::RecordStore;
use crate::subgraph::SwapSource;

/// Cursor driving backward pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchCursor {
    /// Request swaps with `timestamp <= as_of_time`.
    pub as_of_time: TimestampSecs,
    /// Stop once `as_of_time <= lower_bound`.
    pub lower_bound: TimestampSecs,
}

impl FetchCursor {
    /// Create a new cursor.
    pub fn new(as_of_time: TimestampSecs, lower_bound: TimestampSecs) -> Self {
        Self {
            as_of_time,
            lower_bound,
        }
    }

    /// Whether the cursor has reached the lower bound.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.as_of_time <= self.lower_bound
    }

    /// Move the cursor to the oldest timestamp of a committed page.
    ///
    /// Never moves forward. Returns `false` when the page did not let the
    /// cursor move at all.
    fn advance(&mut self, page_min: TimestampSecs) -> bool {
        let next = page_min.min(self.as_of_time);
        let moved = next < self.as_of_time;
        self.as_of_time = next;
        moved
    }
}

/// Why a fetch run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The cursor reached the lower bound.
    BoundReached,
    /// The source returned an empty page.
    Exhausted,
    /// Transport failure or malformed response.
    SourceFailed(String),
    /// A page could not be committed.
    StoreFailed(String),
}

impl StopReason {
    /// Whether the run ended without error.
    pub fn is_complete(&self) -> bool {
        matches!(self, StopReason::BoundReached | StopReason::Exhausted)
    }

    /// Whether the run ended because of an error.
    pub fn is_error(&self) -> bool {
        !self.is_complete()
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::BoundReached => write!(f, "lower bound reached"),
            StopReason::Exhausted => write!(f, "source exhausted"),
            StopReason::SourceFailed(e) => write!(f, "source failed: {}", e),
            StopReason::StoreFailed(e) => write!(f, "store failed: {}", e),
        }
    }
}

/// Progress events emitted by a fetch run.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    Started {
        as_of_time: TimestampSecs,
        lower_bound: TimestampSecs,
    },
    PageCommitted {
        /// Swaps returned by the source.
        fetched: usize,
        /// Swaps not seen before.
        inserted: usize,
        /// Cursor after the page.
        cursor: TimestampSecs,
    },
    Stopped {
        reason: StopReason,
        cursor: TimestampSecs,
        stats: FetchStats,
    },
}

/// Consumer of fetch progress events.
pub trait FetchObserver: Send {
    fn on_event(&mut self, event: &FetchEvent);
}

/// Observer that turns events into `tracing` records.
#[derive(Debug, Clone, Default)]
pub struct TracingObserver {
    label: String,
}

impl TracingObserver {
    /// Create an observer tagging every record with `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl FetchObserver for TracingObserver {
    fn on_event(&mut self, event: &FetchEvent) {
        match event {
            FetchEvent::Started {
                as_of_time,
                lower_bound,
            } => info!(
                source = %self.label,
                as_of = %format_ts(*as_of_time),
                lower_bound = %format_ts(*lower_bound),
                "fetch started"
            ),
            FetchEvent::PageCommitted {
                fetched,
                inserted,
                cursor,
            } => info!(
                source = %self.label,
                fetched,
                inserted,
                cursor = %format_ts(*cursor),
                "page committed"
            ),
            FetchEvent::Stopped {
                reason,
                cursor,
                stats,
            } => {
                if reason.is_error() {
                    error!(
                        source = %self.label,
                        %reason,
                        cursor = %format_ts(*cursor),
                        pages = stats.pages,
                        total = stats.trades_fetched,
                        "fetch stopped"
                    );
                } else {
                    info!(
                        source = %self.label,
                        %reason,
                        cursor = %format_ts(*cursor),
                        pages = stats.pages,
                        total = stats.trades_fetched,
                        "fetch stopped"
                    );
                }
            }
        }
    }
}

fn format_ts(ts: TimestampSecs) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%m/%d/%Y %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Pages committed.
    pub pages: usize,
    /// Swaps returned by the source.
    pub trades_fetched: usize,
    /// Swaps newly written to the store.
    pub trades_inserted: usize,
    /// Swaps dropped for being at or below the lower bound.
    pub trades_clipped: usize,
}

/// Outcome of a fetch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub reason: StopReason,
    /// Cursor when the run stopped.
    pub cursor: FetchCursor,
    pub stats: FetchStats,
}

/// Drives a [`SwapSource`] backward in time into a [`RecordStore`].
pub struct PaginatedFetcher<S> {
    source: S,
    clip_to_bound: bool,
}

impl<S: SwapSource> PaginatedFetcher<S> {
    /// Create a fetcher that stores every swap it receives.
    pub fn new(source: S) -> Self {
        Self {
            source,
            clip_to_bound: false,
        }
    }

    /// Drop swaps at or below the lower bound instead of storing them.
    ///
    /// Used for day shards, where the last page usually reaches into the
    /// previous day.
    pub fn with_bound_clipping(mut self, clip: bool) -> Self {
        self.clip_to_bound = clip;
        self
    }

    /// Run until the bound is reached, the source is exhausted, or an
    /// error stops the run. Already committed pages stay durable in every
    /// case.
    pub async fn run<R: RecordStore + ?Sized>(
        &self,
        store: &mut R,
        start: FetchCursor,
        observer: &mut dyn FetchObserver,
    ) -> FetchReport {
        let mut cursor = start;
        let mut stats = FetchStats::default();

        observer.on_event(&FetchEvent::Started {
            as_of_time: cursor.as_of_time,
            lower_bound: cursor.lower_bound,
        });

        let reason = loop {
            if cursor.is_done() {
                break StopReason::BoundReached;
            }

            let page = match self.source.fetch_page(cursor.as_of_time).await {
                Ok(page) => page,
                Err(e) => break StopReason::SourceFailed(e.to_string()),
            };
            if page.is_empty() {
                break StopReason::Exhausted;
            }
            let fetched = page.len();

            let mut rows = match page
                .into_iter()
                .map(RawTrade::from_payload)
                .collect::<Result<Vec<_>>>()
            {
                Ok(rows) => rows,
                Err(e) => break StopReason::SourceFailed(e.to_string()),
            };

            let Some(page_min) = rows.iter().map(|r| r.event_time).min() else {
                break StopReason::Exhausted;
            };

            if self.clip_to_bound {
                let before = rows.len();
                rows.retain(|r| r.event_time > cursor.lower_bound);
                stats.trades_clipped += before - rows.len();
            }

            let inserted = match store.upsert_page(&rows) {
                Ok(n) => n,
                Err(e) => break StopReason::StoreFailed(e.to_string()),
            };

            stats.pages += 1;
            stats.trades_fetched += fetched;
            stats.trades_inserted += inserted;

            if !cursor.advance(page_min) {
                // Every swap on the page shares the cursor second; step past it.
                if fetched >= self.source.page_size() {
                    warn!(
                        second = cursor.as_of_time,
                        fetched,
                        "full page within a single second, swaps beyond the page size may be missed"
                    );
                } else {
                    debug!(second = cursor.as_of_time, "page did not move cursor, stepping back");
                }
                cursor.as_of_time -= 1;
            }

            observer.on_event(&FetchEvent::PageCommitted {
                fetched,
                inserted,
                cursor: cursor.as_of_time,
            });
        };

        observer.on_event(&FetchEvent::Stopped {
            reason: reason.clone(),
            cursor: cursor.as_of_time,
            stats: stats.clone(),
        });

        FetchReport {
            reason,
            cursor,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ShardStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use swapshard_core::{AssetLeg, Error, PoolRef, SwapPayload, TransactionRef};

    fn make_swap(id: &str, ts: i64) -> SwapPayload {
        SwapPayload {
            id: id.to_string(),
            transaction: TransactionRef {
                id: format!("0x{}", id),
                block_number: None,
            },
            pool: PoolRef {
                id: "0xpool".to_string(),
                token0: AssetLeg {
                    id: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".to_string(),
                    symbol: "USDC".to_string(),
                },
                token1: AssetLeg {
                    id: "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2".to_string(),
                    symbol: "WETH".to_string(),
                },
            },
            sender: None,
            recipient: None,
            amount0: "-2000".to_string(),
            amount1: "1".to_string(),
            timestamp: ts,
        }
    }

    /// Serves pages out of a fixed history, newest first.
    struct ScriptedSource {
        history: Vec<SwapPayload>,
        page_size: usize,
        fail_on_call: Option<usize>,
        requests: Mutex<Vec<TimestampSecs>>,
    }

    impl ScriptedSource {
        fn new(mut history: Vec<SwapPayload>, page_size: usize) -> Self {
            history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            Self {
                history,
                page_size,
                fail_on_call: None,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn failing_on(mut self, call: usize) -> Self {
            self.fail_on_call = Some(call);
            self
        }

        fn requests(&self) -> Vec<TimestampSecs> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SwapSource for ScriptedSource {
        async fn fetch_page(&self, as_of_time: TimestampSecs) -> Result<Vec<SwapPayload>> {
            let call = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(as_of_time);
                requests.len() - 1
            };
            if self.fail_on_call == Some(call) {
                return Err(Error::transport("query failed with status code 502"));
            }
            Ok(self
                .history
                .iter()
                .filter(|s| s.timestamp <= as_of_time)
                .take(self.page_size)
                .cloned()
                .collect())
        }

        fn page_size(&self) -> usize {
            self.page_size
        }
    }

    /// Store whose page commits always fail.
    struct BrokenStore;

    impl RecordStore for BrokenStore {
        fn upsert(&mut self, _trade: &RawTrade) -> Result<bool> {
            Err(Error::database("disk I/O error"))
        }

        fn upsert_page(&mut self, _trades: &[RawTrade]) -> Result<usize> {
            Err(Error::database("disk I/O error"))
        }

        fn earliest_timestamp(&self) -> Result<Option<TimestampSecs>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Vec<FetchEvent>,
    }

    impl FetchObserver for RecordingObserver {
        fn on_event(&mut self, event: &FetchEvent) {
            self.events.push(event.clone());
        }
    }

    fn history(n: usize, newest: i64) -> Vec<SwapPayload> {
        (0..n)
            .map(|i| make_swap(&format!("s{}", i), newest - i as i64))
            .collect()
    }

    #[test]
    fn test_cursor_never_moves_forward() {
        let mut cursor = FetchCursor::new(100, 0);
        assert!(cursor.advance(80));
        assert_eq!(cursor.as_of_time, 80);
        assert!(!cursor.advance(95));
        assert_eq!(cursor.as_of_time, 80);
    }

    #[tokio::test]
    async fn test_runs_until_exhausted() {
        let source = ScriptedSource::new(history(25, 1_000), 10);
        let fetcher = PaginatedFetcher::new(source);
        let mut store = ShardStore::open_in_memory().unwrap();
        let mut observer = RecordingObserver::default();

        let report = fetcher
            .run(&mut store, FetchCursor::new(2_000, 0), &mut observer)
            .await;

        assert_eq!(report.reason, StopReason::Exhausted);
        assert_eq!(store.count().unwrap(), 25);
        // Boundary swaps are fetched twice and absorbed by the upsert.
        assert_eq!(report.stats.trades_inserted, 25);
        assert!(report.stats.trades_fetched > 25);
        assert_eq!(store.earliest_timestamp().unwrap(), Some(976));
    }

    #[tokio::test]
    async fn test_cursor_monotonic_across_pages() {
        let source = ScriptedSource::new(history(50, 5_000), 7);
        let fetcher = PaginatedFetcher::new(source);
        let mut store = ShardStore::open_in_memory().unwrap();
        let mut observer = RecordingObserver::default();

        fetcher
            .run(&mut store, FetchCursor::new(5_000, 0), &mut observer)
            .await;

        let requests = fetcher.source.requests();
        assert!(requests.len() > 2);
        for pair in requests.windows(2) {
            assert!(pair[1] <= pair[0], "cursor moved forward: {:?}", pair);
        }
    }

    #[tokio::test]
    async fn test_stops_at_lower_bound() {
        let source = ScriptedSource::new(history(100, 1_000), 10);
        let fetcher = PaginatedFetcher::new(source);
        let mut store = ShardStore::open_in_memory().unwrap();
        let mut observer = RecordingObserver::default();

        let report = fetcher
            .run(&mut store, FetchCursor::new(1_000, 960), &mut observer)
            .await;

        assert_eq!(report.reason, StopReason::BoundReached);
        assert!(report.cursor.as_of_time <= 960);
        // Last page may reach below the bound; those swaps are still stored.
        assert!(store.earliest_timestamp().unwrap().unwrap() <= 960);
        assert!(store.count().unwrap() < 100);
    }

    #[tokio::test]
    async fn test_bound_clipping_drops_older_swaps() {
        let source = ScriptedSource::new(history(100, 1_000), 10);
        let fetcher = PaginatedFetcher::new(source).with_bound_clipping(true);
        let mut store = ShardStore::open_in_memory().unwrap();
        let mut observer = RecordingObserver::default();

        let report = fetcher
            .run(&mut store, FetchCursor::new(1_000, 960), &mut observer)
            .await;

        assert_eq!(report.reason, StopReason::BoundReached);
        assert_eq!(store.earliest_timestamp().unwrap(), Some(961));
        assert_eq!(store.count().unwrap(), 40);
        assert!(report.stats.trades_clipped > 0);
    }

    #[tokio::test]
    async fn test_already_at_bound_makes_no_request() {
        let source = ScriptedSource::new(history(5, 1_000), 10);
        let fetcher = PaginatedFetcher::new(source);
        let mut store = ShardStore::open_in_memory().unwrap();
        let mut observer = RecordingObserver::default();

        let report = fetcher
            .run(&mut store, FetchCursor::new(500, 500), &mut observer)
            .await;

        assert_eq!(report.reason, StopReason::BoundReached);
        assert!(fetcher.source.requests().is_empty());
    }

    #[tokio::test]
    async fn test_source_failure_keeps_committed_pages() {
        let source = ScriptedSource::new(history(30, 1_000), 10).failing_on(2);
        let fetcher = PaginatedFetcher::new(source);
        let mut store = ShardStore::open_in_memory().unwrap();
        let mut observer = RecordingObserver::default();

        let report = fetcher
            .run(&mut store, FetchCursor::new(1_000, 0), &mut observer)
            .await;

        assert!(matches!(report.reason, StopReason::SourceFailed(_)));
        assert_eq!(report.stats.pages, 2);
        assert_eq!(store.count().unwrap(), 19);
        // Resuming from the store continues below what was committed.
        assert_eq!(store.earliest_timestamp().unwrap(), Some(report.cursor.as_of_time));
    }

    #[tokio::test]
    async fn test_store_failure_does_not_advance_cursor() {
        let source = ScriptedSource::new(history(30, 1_000), 10);
        let fetcher = PaginatedFetcher::new(source);
        let mut store = BrokenStore;
        let mut observer = RecordingObserver::default();

        let report = fetcher
            .run(&mut store, FetchCursor::new(1_000, 0), &mut observer)
            .await;

        assert!(matches!(report.reason, StopReason::StoreFailed(_)));
        assert_eq!(report.cursor.as_of_time, 1_000);
        assert_eq!(report.stats.pages, 0);
    }

    #[tokio::test]
    async fn test_same_second_page_steps_back() {
        let mut swaps: Vec<SwapPayload> = (0..4)
            .map(|i| make_swap(&format!("x{}", i), 700))
            .collect();
        swaps.push(make_swap("older", 650));
        let source = ScriptedSource::new(swaps, 4);
        let fetcher = PaginatedFetcher::new(source);
        let mut store = ShardStore::open_in_memory().unwrap();
        let mut observer = RecordingObserver::default();

        let report = fetcher
            .run(&mut store, FetchCursor::new(700, 0), &mut observer)
            .await;

        assert_eq!(report.reason, StopReason::Exhausted);
        assert_eq!(store.count().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_events_emitted_in_order() {
        let source = ScriptedSource::new(history(15, 1_000), 10);
        let fetcher = PaginatedFetcher::new(source);
        let mut store = ShardStore::open_in_memory().unwrap();
        let mut observer = RecordingObserver::default();

        fetcher
            .run(&mut store, FetchCursor::new(1_000, 0), &mut observer)
            .await;

        let events = &observer.events;
        assert!(matches!(events[0], FetchEvent::Started { as_of_time: 1_000, lower_bound: 0 }));
        assert!(matches!(
            events[1],
            FetchEvent::PageCommitted { fetched: 10, inserted: 10, cursor: 991 }
        ));
        match events.last() {
            Some(FetchEvent::Stopped { reason, .. }) => assert_eq!(*reason, StopReason::Exhausted),
            other => panic!("unexpected last event: {:?}", other),
        }
    }
}
