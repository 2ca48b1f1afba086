//! Resolves where a fetch run starts.
//!
//! Runs always walk backward in time, so a restart resumes from the oldest
//! trade already stored. If a run was killed after committing some pages,
//! the next run picks up right below them. Rows of a page are only ever
//! committed together, so no gap can open inside a page.

use chrono::Utc;
use swapshard_core::{Result, TimestampSecs};
use tracing::info;

use crate::store::RecordStore;

/// Starting cursor for a store: its earliest timestamp, or now if empty.
pub fn resolve_start<R: RecordStore + ?Sized>(store: &R) -> Result<TimestampSecs> {
    resolve_start_or(store, Utc::now().timestamp())
}

/// Starting cursor for a store: its earliest timestamp, or `fallback`.
pub fn resolve_start_or<R: RecordStore + ?Sized>(
    store: &R,
    fallback: TimestampSecs,
) -> Result<TimestampSecs> {
    match store.earliest_timestamp()? {
        Some(earliest) => {
            info!(start = earliest, "resuming from earliest stored swap");
            Ok(earliest)
        }
        None => {
            info!(start = fallback, "store is empty, starting fresh");
            Ok(fallback)
        }
    }
}
