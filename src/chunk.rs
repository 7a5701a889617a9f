//! A time-bounded, compressed, append-only segment of one metric's samples.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::{gorilla::Series, iter::Iter, now_unix, StrataError, StrataResult};

/// Format codes prefixing chunk payloads on their way to the store.
///
/// Exactly one code is currently defined. A payload whose first byte is not
/// an enumerated code is either a legacy headerless series (tolerated only
/// behind [`ChunkStore::with_legacy_headerless_reads`](crate::ChunkStore::with_legacy_headerless_reads))
/// or corrupt.
pub mod format {
    pub const STANDARD_GORILLA: u8 = 1;
}

/// One compressed sample segment covering `[t0, t0 + span)`.
///
/// A chunk is owned by its metric's ring; once sealed it is shared with the
/// write pipeline, which reads the payload and is the sole mutator of the
/// `saved` flag. Appends only ever happen under the owning metric's lock.
#[derive(Debug)]
pub struct Chunk {
    t0: u32,
    series: RwLock<Series>,
    last_ts: AtomicU32,
    finished: AtomicBool,
    saved: AtomicBool,
    /// Unix seconds of the last append or state change.
    last_write: AtomicU32,
}

impl Chunk {
    pub fn new(t0: u32) -> Self {
        Self {
            t0,
            series: RwLock::new(Series::new(t0)),
            last_ts: AtomicU32::new(0),
            finished: AtomicBool::new(false),
            saved: AtomicBool::new(false),
            last_write: AtomicU32::new(now_unix()),
        }
    }

    pub fn t0(&self) -> u32 {
        self.t0
    }

    pub fn last_ts(&self) -> u32 {
        self.last_ts.load(Ordering::Acquire)
    }

    pub fn last_write(&self) -> u32 {
        self.last_write.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.series.read().is_empty()
    }

    pub fn len(&self) -> u32 {
        self.series.read().len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_saved(&self) -> bool {
        self.saved.load(Ordering::Acquire)
    }

    /// Set by the write pipeline after a durable insert, or by the cluster
    /// consumer when a peer reports having written this chunk.
    pub fn set_saved(&self) {
        self.saved.store(true, Ordering::Release);
        self.last_write.store(now_unix(), Ordering::Release);
    }

    /// Appends a sample. Timestamps must be strictly ascending and the chunk
    /// must still be open; the caller is responsible for `ts` falling inside
    /// this chunk's span.
    pub fn push(&self, ts: u32, val: f64) -> StrataResult<()> {
        if self.is_finished() {
            return Err(StrataError::ChunkFinished { t0: self.t0 });
        }
        let mut series = self.series.write();
        if !series.is_empty() && ts <= series.last_ts() {
            return Err(StrataError::OutOfOrderSample {
                ts,
                last: series.last_ts(),
            });
        }
        series.push(ts, val);
        self.last_ts.store(ts, Ordering::Release);
        self.last_write.store(now_unix(), Ordering::Release);
        Ok(())
    }

    /// Seals the chunk; further pushes are rejected. Returns whether this
    /// call performed the transition, so callers submit a sealed chunk to
    /// the write pipeline exactly once.
    pub fn finish(&self) -> bool {
        let transitioned = !self.finished.swap(true, Ordering::AcqRel);
        if transitioned {
            self.last_write.store(now_unix(), Ordering::Release);
        }
        transitioned
    }

    /// Serialized store payload: one format byte, then the series bytes.
    /// Meaningful once the chunk is finished.
    pub fn bytes(&self) -> Vec<u8> {
        let series = self.series.read().bytes();
        let mut out = Vec::with_capacity(1 + series.len());
        out.push(format::STANDARD_GORILLA);
        out.extend_from_slice(&series);
        out
    }

    /// A fresh cursor over the samples pushed so far.
    pub fn iter(&self) -> Iter {
        Iter::new(self.series.read().iter(), format!("ring t0={}", self.t0))
    }
}
