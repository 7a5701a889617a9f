//! Persistent chunk store: month-sharded rows over a wide-column backend.
//!
//! One row per (metric key, 28-day epoch); cells are keyed by chunk T0 with
//! descending clustering, which makes "the chunk straddling a query start"
//! a single bounded read. The range-read planner mirrors that layout: it
//! fans sub-queries out concurrently, one per row touched, then stitches
//! the results back into global T0 order.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam::channel::{unbounded, RecvTimeoutError};
use log::{debug, error};
use parking_lot::RwLock;

use crate::{
    chunk::format, gorilla::SeriesIter, iter::Iter, StrataError, StrataResult, MONTH_SEC,
};

/// The primitive row operations a wide-column store must offer.
///
/// Rows are addressed by an ascii key, cells within a row by a u32
/// timestamp. Implementations must be safe to call from many threads; the
/// planner issues its sub-queries concurrently.
pub trait ColumnBackend: Send + Sync {
    /// Upserts one cell with a per-cell TTL in seconds.
    fn insert(&self, row_key: &str, ts: u32, payload: &[u8], ttl: u32) -> StrataResult<()>;

    /// The single cell with the largest timestamp `<= ts`, if any
    /// (descending clustering, limit 1).
    fn read_before(&self, row_key: &str, ts: u32) -> StrataResult<Option<(u32, Vec<u8>)>>;

    /// All cells within the bounds, ascending by timestamp.
    fn scan_asc(
        &self,
        row_key: &str,
        lo: Bound<u32>,
        hi: Bound<u32>,
    ) -> StrataResult<Vec<(u32, Vec<u8>)>>;
}

/// Outcome of a range read. Sub-query failures surface here next to
/// whatever was fetched before the failure; the caller decides whether
/// partial data is worth returning.
#[derive(Debug)]
pub struct SearchResult {
    pub iters: Vec<Iter>,
    pub error: Option<StrataError>,
}

enum RowQuery {
    /// The chunk straddling the query start: largest t0 `<=` the bound.
    Before(u32),
    Scan(Bound<u32>, Bound<u32>),
}

struct SubQuery {
    month: u32,
    sort_key: u32,
    row_key: String,
    query: RowQuery,
}

/// Range-keyed, append-only chunk persistence.
pub struct ChunkStore {
    backend: Arc<dyn ColumnBackend>,
    legacy_headerless_reads: bool,
}

impl ChunkStore {
    pub fn new(backend: Arc<dyn ColumnBackend>) -> Self {
        Self {
            backend,
            legacy_headerless_reads: false,
        }
    }

    /// Tolerate payloads with no format byte, decoding the whole cell as
    /// series bytes. Only meant for reading data written before the format
    /// prefix existed; leave this off otherwise.
    pub fn with_legacy_headerless_reads(mut self, enabled: bool) -> Self {
        self.legacy_headerless_reads = enabled;
        self
    }

    fn row_key(key: &str, t0: u32) -> String {
        format!("{}_{}", key, t0 / MONTH_SEC)
    }

    /// Writes one chunk payload into its month row.
    pub fn insert(&self, key: &str, t0: u32, payload: &[u8], ttl: u32) -> StrataResult<()> {
        let row_key = Self::row_key(key, t0);
        let start = Instant::now();
        let result = self.backend.insert(&row_key, t0, payload, ttl);
        debug!("insert {row_key} t0={t0}: {:?}", start.elapsed());
        result
    }

    /// Fetches every chunk that may hold samples in `[start, end)`,
    /// decoded oldest-first. `start` is inclusive, `end` exclusive.
    ///
    /// Only the chunks' T0s are known to the store, so the result starts at
    /// the last chunk with `t0 <= start` (whatever its span was) and may
    /// carry samples outside the range; the caller filters.
    pub fn search(
        &self,
        key: &str,
        start: u32,
        end: u32,
        deadline: Option<Instant>,
    ) -> StrataResult<SearchResult> {
        if start > end {
            return Err(StrataError::InvalidRange { start, end });
        }
        if start == end {
            return Ok(SearchResult {
                iters: Vec::new(),
                error: None,
            });
        }

        let queries = plan_queries(key, start, end);
        let (tx, rx) = unbounded();
        for sub in queries {
            let backend = self.backend.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                let cells = match &sub.query {
                    RowQuery::Before(ts) => backend
                        .read_before(&sub.row_key, *ts)
                        .map(|cell| cell.into_iter().collect()),
                    RowQuery::Scan(lo, hi) => backend.scan_asc(&sub.row_key, *lo, *hi),
                };
                tx.send((sub.month, sub.sort_key, cells)).ok();
            });
        }
        drop(tx);

        let mut outcomes = Vec::new();
        loop {
            let received = match deadline {
                Some(deadline) => match rx.recv_deadline(deadline) {
                    Ok(outcome) => outcome,
                    Err(RecvTimeoutError::Timeout) => return Err(StrataError::DeadlineExceeded),
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match rx.recv() {
                    Ok(outcome) => outcome,
                    Err(_) => break,
                },
            };
            outcomes.push(received);
        }
        outcomes.sort_by_key(|(_, sort_key, _)| *sort_key);

        let mut iters = Vec::new();
        for (month, _, cells) in outcomes {
            let cells = match cells {
                Ok(cells) => cells,
                Err(err) => {
                    error!("chunk store sub-query failed: {err}");
                    return Ok(SearchResult {
                        iters,
                        error: Some(err),
                    });
                }
            };
            for (ts, payload) in cells {
                match self.decode_cell(month, ts, &payload) {
                    Ok(iter) => iters.push(iter),
                    Err(err) => {
                        error!("failed to decode chunk payload at {key} t0={ts}: {err}");
                        return Ok(SearchResult {
                            iters,
                            error: Some(err),
                        });
                    }
                }
            }
        }
        debug!("search {key} [{start},{end}): {} iters", iters.len());
        Ok(SearchResult { iters, error: None })
    }

    fn decode_cell(&self, month: u32, ts: u32, payload: &[u8]) -> StrataResult<Iter> {
        if payload.len() < 2 {
            return Err(StrataError::TruncatedPayload(payload.len()));
        }
        let tag = format!("store month={month} t0={ts}");
        match payload[0] {
            format::STANDARD_GORILLA => Ok(Iter::new(SeriesIter::from_bytes(&payload[1..])?, tag)),
            code if self.legacy_headerless_reads => {
                debug!("headerless payload (first byte {code}) at t0={ts}");
                Ok(Iter::new(SeriesIter::from_bytes(payload)?, tag))
            }
            code => Err(StrataError::FormatUnknown(code)),
        }
    }
}

/// Builds the per-row sub-queries for `[start, end)`, with sort keys that
/// put the "chunk preceding start" first and everything else in month
/// order.
fn plan_queries(key: &str, start: u32, end: u32) -> Vec<SubQuery> {
    let start_month = start - start % MONTH_SEC;
    let end_month = (end - 1) - (end - 1) % MONTH_SEC;

    let row = |month: u32| format!("{}_{}", key, month / MONTH_SEC);

    // The store only knows chunk T0s. The last chunk to include is easy
    // (largest t0 < end); the first is the one straddling `start`, whose t0
    // may be anywhere below it depending on the span in use at write time.
    // Because chunk spans divide the month epoch, that straddling chunk is
    // guaranteed to live in start_month's row, so one bounded descending
    // read recovers it.
    let mut queries = vec![SubQuery {
        month: start_month,
        sort_key: start_month,
        row_key: row(start_month),
        query: RowQuery::Before(start),
    }];

    if start_month == end_month {
        queries.push(SubQuery {
            month: start_month,
            sort_key: start_month + 1,
            row_key: row(start_month),
            query: RowQuery::Scan(Bound::Excluded(start), Bound::Excluded(end)),
        });
    } else {
        let mut month = start_month;
        while month <= end_month {
            if month == start_month {
                queries.push(SubQuery {
                    month,
                    sort_key: month + 1,
                    row_key: row(month),
                    query: RowQuery::Scan(Bound::Included(start + 1), Bound::Unbounded),
                });
            } else if month == end_month {
                queries.push(SubQuery {
                    month,
                    sort_key: month,
                    row_key: row(month),
                    query: RowQuery::Scan(Bound::Unbounded, Bound::Included(end - 1)),
                });
            } else {
                queries.push(SubQuery {
                    month,
                    sort_key: month,
                    row_key: row(month),
                    query: RowQuery::Scan(Bound::Unbounded, Bound::Unbounded),
                });
            }
            month += MONTH_SEC;
        }
    }
    queries
}

/// An in-process wide-column emulation: one `BTreeMap` per row. TTLs are
/// accepted but never enforced; expiry belongs to a real backend's
/// compaction.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    rows: RwLock<HashMap<String, BTreeMap<u32, Vec<u8>>>>,
}

impl ColumnBackend for MemoryBackend {
    fn insert(&self, row_key: &str, ts: u32, payload: &[u8], _ttl: u32) -> StrataResult<()> {
        self.rows
            .write()
            .entry(row_key.to_owned())
            .or_default()
            .insert(ts, payload.to_vec());
        Ok(())
    }

    fn read_before(&self, row_key: &str, ts: u32) -> StrataResult<Option<(u32, Vec<u8>)>> {
        Ok(self.rows.read().get(row_key).and_then(|row| {
            row.range(..=ts)
                .next_back()
                .map(|(ts, payload)| (*ts, payload.clone()))
        }))
    }

    fn scan_asc(
        &self,
        row_key: &str,
        lo: Bound<u32>,
        hi: Bound<u32>,
    ) -> StrataResult<Vec<(u32, Vec<u8>)>> {
        Ok(self
            .rows
            .read()
            .get(row_key)
            .map(|row| {
                row.range((lo, hi))
                    .map(|(ts, payload)| (*ts, payload.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
