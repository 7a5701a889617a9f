//! The fused read path across storage tiers.

use std::time::Instant;

use log::debug;

use crate::{
    aggmetrics::AggMetrics,
    store::{ChunkStore, SearchResult},
    StrataResult,
};

/// Answers a `[from, to)` range read by fusing ring and store chunks.
///
/// The in-memory ring is consulted first; if `from` predates its oldest
/// retained chunk (or the metric is not in RAM at all) the store fills in
/// the older part of the range. Store iterators come first, so samples flow
/// oldest to newest. Chunks are returned whole and may carry samples
/// outside the range; the caller filters.
///
/// An optional `deadline` is propagated to the store's sub-queries; an
/// expired deadline abandons them and fails the query.
pub fn query(
    metrics: &AggMetrics,
    store: &ChunkStore,
    key: &str,
    from: u32,
    to: u32,
    deadline: Option<Instant>,
) -> StrataResult<SearchResult> {
    let (oldest, ring_iters) = match metrics.get(key) {
        Ok(metric) => metric.lock().get(from, to),
        Err(_) => (None, Vec::new()),
    };

    let store_end = match oldest {
        // the ring covers the whole range
        Some(oldest) if from >= oldest => None,
        Some(oldest) => Some(to.min(oldest)),
        None => Some(to),
    };

    let mut result = match store_end {
        Some(end) if from < end => {
            debug!("{key}: extending read below t0={:?} via store", oldest);
            store.search(key, from, end, deadline)?
        }
        _ => SearchResult {
            iters: Vec::new(),
            error: None,
        },
    };
    result.iters.extend(ring_iters);
    Ok(result)
}
