//! Swap ingestion for the swapshard system.
//!
//! This crate handles:
//! - The per-shard SQLite record store
//! - The subgraph client (query, envelope parsing, retry)
//! - Checkpoint resolution on restart
//! - The backward paginated fetch loop
//! - Day-shard planning and syncing

pub mod checkpoint;
pub mod fetcher;
pub mod retry;
pub mod shards;
pub mod store;
pub mod subgraph;

pub use checkpoint::{resolve_start, resolve_start_or};
pub use fetcher::{
    FetchCursor, FetchEvent, FetchObserver, FetchReport, FetchStats, PaginatedFetcher, StopReason,
    TracingObserver,
};
pub use retry::ExponentialBackoff;
pub use shards::{DayShard, ShardOutcome, ShardSyncer};
pub use store::{RecordStore, ShardStore, TradeReader};
pub use subgraph::{SubgraphClient, SwapSource};
