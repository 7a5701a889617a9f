#![doc = include_str!("../README.md")]

use std::time::{Duration, SystemTime};

use thiserror::Error;

pub mod aggmetric;
pub mod aggmetrics;
pub mod aggregator;
pub mod chunk;
pub mod cluster;
pub mod gorilla;
pub mod iter;
pub mod pipeline;
pub mod query;
pub mod store;

pub use aggmetric::{AggMetric, GcOutcome, IngestStats};
pub use aggmetrics::AggMetrics;
pub use chunk::{format, Chunk};
pub use cluster::{
    decode_frame, encode_frame, msg, PersistConsumer, PersistMessageBatch, Publisher,
    PublisherHandle, SavedChunk, Transport,
};
pub use gorilla::{Series, SeriesIter};
pub use iter::Iter;
pub use pipeline::{ChunkWriteRequest, PipelineOptions, PipelineStats, WritePipeline};
pub use query::query;
pub use store::{ChunkStore, ColumnBackend, MemoryBackend, SearchResult};

/// Store rows are partitioned by 28-day epochs of a chunk's T0.
///
/// Chunk spans are required to divide this evenly, which guarantees the
/// chunk straddling any query start lives in the row of the start's epoch.
pub const MONTH_SEC: u32 = 60 * 60 * 24 * 28;

pub type StrataResult<T> = Result<T, StrataError>;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("out-of-order sample: ts {ts} is not after last ts {last}")]
    OutOfOrderSample { ts: u32, last: u32 },

    #[error("chunk t0={t0} is finished and accepts no further samples")]
    ChunkFinished { t0: u32 },

    #[error("evicted unsaved chunk {key} t0={t0}")]
    UnsavedEviction { key: String, t0: u32 },

    #[error("transient store failure: {0}")]
    StoreTransient(String),

    #[error("fatal store failure: {0}")]
    StoreFatal(String),

    #[error("unknown chunk format code {0}")]
    FormatUnknown(u8),

    #[error("chunk payload too small ({0} bytes)")]
    TruncatedPayload(usize),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("metric {0} not found")]
    NotFound(String),

    #[error("unknown persist message version {0}")]
    UnknownMessageVersion(u8),

    #[error("invalid range: start {start} must be before end {end}")]
    InvalidRange { start: u32, end: u32 },

    #[error("write pipeline is stopped")]
    PipelineStopped,

    #[error("publish failed on {endpoint}: {reason}")]
    PublishFailed { endpoint: String, reason: String },

    #[error("invalid retention policy: {0}")]
    InvalidPolicy(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A single ingested measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Unix seconds.
    pub ts: u32,
    pub val: f64,
}

impl Sample {
    pub fn new(ts: u32, val: f64) -> Self {
        Self { ts, val }
    }
}

/// One rollup tier: primary samples are aggregated into `agg_span`-second
/// buckets and the resulting series are retained in their own chunk ring.
#[derive(Debug, Clone)]
pub struct RollupSpec {
    pub agg_span: u32,
    pub chunk_span: u32,
    pub num_chunks: usize,
}

/// How a metric's samples are chunked, rolled up, aged out and expired.
///
/// Build one with the fluent setters and hand it to
/// [`AggMetrics::new`](crate::AggMetrics::new), which validates it.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub(crate) chunk_span: u32,
    pub(crate) num_chunks: usize,
    pub(crate) rollups: Vec<RollupSpec>,
    pub(crate) chunk_max_stale: u32,
    pub(crate) metric_max_stale: u32,
    pub(crate) ttl: u32,
    pub(crate) gc_interval: Duration,
    pub(crate) unsaved_evict_wait: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            chunk_span: 2 * 3600,
            num_chunks: 5,
            rollups: Vec::new(),
            chunk_max_stale: 3600,
            metric_max_stale: 6 * 3600,
            ttl: 35 * 24 * 3600,
            gc_interval: Duration::from_secs(60),
            unsaved_evict_wait: Duration::from_secs(30),
        }
    }
}

impl RetentionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Duration of one chunk in seconds. Must divide [`MONTH_SEC`].
    pub fn chunk_span(self, chunk_span: u32) -> Self {
        Self { chunk_span, ..self }
    }

    /// In-RAM ring capacity per metric, in chunks. At least 2.
    pub fn num_chunks(self, num_chunks: usize) -> Self {
        Self { num_chunks, ..self }
    }

    /// Adds a rollup tier at a coarser span.
    pub fn rollup(mut self, agg_span: u32, chunk_span: u32, num_chunks: usize) -> Self {
        self.rollups.push(RollupSpec {
            agg_span,
            chunk_span,
            num_chunks,
        });
        self
    }

    /// Seconds after which an idle open chunk is force-finished by GC.
    pub fn chunk_max_stale(self, chunk_max_stale: u32) -> Self {
        Self {
            chunk_max_stale,
            ..self
        }
    }

    /// Seconds after which an idle metric is dropped entirely.
    pub fn metric_max_stale(self, metric_max_stale: u32) -> Self {
        Self {
            metric_max_stale,
            ..self
        }
    }

    /// Per-cell TTL passed to the store on insert, in seconds.
    pub fn ttl(self, ttl: u32) -> Self {
        Self { ttl, ..self }
    }

    /// How often the background sweep runs GC over all metrics.
    pub fn gc_interval(self, gc_interval: Duration) -> Self {
        Self {
            gc_interval,
            ..self
        }
    }

    /// How long an eviction waits for the victim chunk to be saved before
    /// overwriting it anyway and counting the loss.
    pub fn unsaved_evict_wait(self, unsaved_evict_wait: Duration) -> Self {
        Self {
            unsaved_evict_wait,
            ..self
        }
    }

    pub fn validate(&self) -> StrataResult<()> {
        if self.chunk_span == 0 || MONTH_SEC % self.chunk_span != 0 {
            return Err(StrataError::InvalidPolicy(format!(
                "chunk_span {} must divide {}",
                self.chunk_span, MONTH_SEC
            )));
        }
        if self.num_chunks < 2 {
            return Err(StrataError::InvalidPolicy(format!(
                "num_chunks {} must be at least 2",
                self.num_chunks
            )));
        }
        for r in &self.rollups {
            if r.chunk_span == 0 || MONTH_SEC % r.chunk_span != 0 {
                return Err(StrataError::InvalidPolicy(format!(
                    "rollup chunk_span {} must divide {}",
                    r.chunk_span, MONTH_SEC
                )));
            }
            if r.agg_span == 0 || r.chunk_span % r.agg_span != 0 {
                return Err(StrataError::InvalidPolicy(format!(
                    "agg_span {} must divide rollup chunk_span {}",
                    r.agg_span, r.chunk_span
                )));
            }
            if r.num_chunks < 2 {
                return Err(StrataError::InvalidPolicy(format!(
                    "rollup num_chunks {} must be at least 2",
                    r.num_chunks
                )));
            }
        }
        Ok(())
    }
}

/// Wall clock as unix seconds, for staleness bookkeeping.
pub(crate) fn now_unix() -> u32 {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs() as u32,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_validation() {
        assert!(RetentionPolicy::new().validate().is_ok());

        // 7000 does not divide the 28-day epoch
        let bad_span = RetentionPolicy::new().chunk_span(7000);
        assert!(matches!(
            bad_span.validate(),
            Err(StrataError::InvalidPolicy(_))
        ));

        let tiny_ring = RetentionPolicy::new().num_chunks(1);
        assert!(tiny_ring.validate().is_err());

        // agg_span must divide the rollup chunk span
        let bad_rollup = RetentionPolicy::new().rollup(700, 86400, 2);
        assert!(bad_rollup.validate().is_err());

        let good = RetentionPolicy::new()
            .chunk_span(600)
            .num_chunks(5)
            .rollup(300, 86400, 2);
        assert!(good.validate().is_ok());
    }
}
