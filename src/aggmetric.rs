//! Per-metric circular buffer of chunks, with rollup fanout.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::{
    aggregator::Aggregator,
    chunk::Chunk,
    iter::Iter,
    now_unix,
    pipeline::{ChunkWriteRequest, WritePipeline},
    RetentionPolicy, StrataError, StrataResult,
};

/// Counters for samples dropped at the ingest boundary and for chunks lost
/// to eviction-before-save. Shared by a metric and all its rollup series.
#[derive(Debug, Default)]
pub struct IngestStats {
    out_of_order: AtomicU64,
    dropped_finished: AtomicU64,
    lossy_evictions: AtomicU64,
}

impl IngestStats {
    pub fn out_of_order(&self) -> u64 {
        self.out_of_order.load(Ordering::Relaxed)
    }

    pub fn dropped_finished(&self) -> u64 {
        self.dropped_finished.load(Ordering::Relaxed)
    }

    pub fn lossy_evictions(&self) -> u64 {
        self.lossy_evictions.load(Ordering::Relaxed)
    }
}

/// What a GC pass decided about a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
    Keep,
    /// No pushes for `metric_max_stale`; the owner should remove the metric.
    Drop,
}

/// One metric's in-RAM retention: a fixed ring of chunks plus any rollup
/// aggregators, all mutated under the owner's lock.
///
/// Ring invariants: the slot at the write cursor holds the only chunk that
/// may still be open; walking the ring from just past the cursor yields
/// retained chunks in strictly ascending T0 order, with `None` slots where
/// a span had no samples.
#[derive(Debug)]
pub struct AggMetric {
    key: String,
    chunk_span: u32,
    chunks: Vec<Option<Arc<Chunk>>>,
    write_cursor: usize,
    /// Unix seconds of the last successful push.
    last_write: u32,
    ttl: u32,
    unsaved_evict_wait: Duration,
    aggregators: Vec<Aggregator>,
    pipeline: Arc<WritePipeline>,
    stats: Arc<IngestStats>,
}

impl AggMetric {
    /// A primary metric with the policy's rollup schedule attached.
    pub fn new(
        key: &str,
        policy: &RetentionPolicy,
        pipeline: Arc<WritePipeline>,
        stats: Arc<IngestStats>,
    ) -> Self {
        let mut metric = Self::derived(
            key,
            policy.chunk_span,
            policy.num_chunks,
            policy.ttl,
            policy.unsaved_evict_wait,
            pipeline.clone(),
            stats.clone(),
        );
        metric.aggregators = policy
            .rollups
            .iter()
            .map(|spec| {
                Aggregator::new(
                    key,
                    spec,
                    policy.ttl,
                    policy.unsaved_evict_wait,
                    pipeline.clone(),
                    stats.clone(),
                )
            })
            .collect();
        metric
    }

    /// A bare series with no rollups of its own, as used for the five
    /// derived series behind each [`Aggregator`].
    pub(crate) fn derived(
        key: &str,
        chunk_span: u32,
        num_chunks: usize,
        ttl: u32,
        unsaved_evict_wait: Duration,
        pipeline: Arc<WritePipeline>,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            key: key.to_owned(),
            chunk_span,
            chunks: vec![None; num_chunks],
            write_cursor: 0,
            last_write: now_unix(),
            ttl,
            unsaved_evict_wait,
            aggregators: Vec::new(),
            pipeline,
            stats,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn chunk_span(&self) -> u32 {
        self.chunk_span
    }

    /// Appends a sample.
    ///
    /// Timestamps must be strictly ascending per metric; a sample that lands
    /// in the current chunk's span is appended, a newer span seals the
    /// current chunk and rotates the ring, an older one is rejected.
    /// Rejections are also counted on the shared [`IngestStats`], so batch
    /// ingest paths can drop the `Err` without losing track.
    pub fn add(&mut self, ts: u32, val: f64) -> StrataResult<()> {
        let span = self.chunk_span;
        let target = ts - ts % span;

        let result = match self.chunks[self.write_cursor].clone() {
            None => {
                // Ring is empty; open the first chunk.
                let chunk = Arc::new(Chunk::new(target));
                let pushed = chunk.push(ts, val);
                self.chunks[self.write_cursor] = Some(chunk);
                pushed
            }
            Some(cur) if target == cur.t0() => cur.push(ts, val),
            Some(cur) if target < cur.t0() => Err(StrataError::OutOfOrderSample {
                ts,
                last: cur.last_ts(),
            }),
            Some(cur) => {
                self.seal(&cur);
                self.rotate(cur.t0(), target);
                let chunk = Arc::new(Chunk::new(target));
                let pushed = chunk.push(ts, val);
                self.chunks[self.write_cursor] = Some(chunk);
                pushed
            }
        };

        match result {
            Ok(()) => {
                self.last_write = now_unix();
                for aggregator in &mut self.aggregators {
                    aggregator.add(ts, val);
                }
                Ok(())
            }
            Err(err) => {
                match err {
                    StrataError::OutOfOrderSample { .. } => {
                        self.stats.out_of_order.fetch_add(1, Ordering::Relaxed);
                    }
                    StrataError::ChunkFinished { .. } => {
                        self.stats.dropped_finished.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                Err(err)
            }
        }
    }

    /// Seals a chunk and submits it for persistence, unless a peer already
    /// reported it saved (cluster-wide duplicate-write suppression).
    fn seal(&self, chunk: &Arc<Chunk>) {
        if !chunk.finish() {
            return;
        }
        if chunk.is_saved() {
            debug!(
                "{} t0={} already saved by a peer, suppressing write",
                self.key,
                chunk.t0()
            );
            return;
        }
        let request = ChunkWriteRequest {
            key: self.key.clone(),
            chunk: chunk.clone(),
            ttl: self.ttl,
            enqueued: Instant::now(),
        };
        if let Err(err) = self.pipeline.submit(request) {
            warn!("{} t0={}: submit failed: {err}", self.key, chunk.t0());
        }
    }

    /// Advances the cursor from the sealed chunk's span to `target`,
    /// clearing the slots of any skipped spans.
    fn rotate(&mut self, sealed_t0: u32, target: u32) {
        let len = self.chunks.len();
        let steps = ((target - sealed_t0) / self.chunk_span) as usize;
        if steps >= len {
            // The gap covers the whole ring; every slot is evicted.
            for pos in 0..len {
                self.evict(pos);
            }
            self.write_cursor = (self.write_cursor + steps) % len;
        } else {
            for _ in 1..steps {
                self.write_cursor = (self.write_cursor + 1) % len;
                self.evict(self.write_cursor);
            }
            self.write_cursor = (self.write_cursor + 1) % len;
            self.evict(self.write_cursor);
        }
    }

    /// Clears a slot, waiting (bounded) for an unsaved occupant to be
    /// persisted first. If the wait expires the chunk is dropped anyway and
    /// the loss is counted: RAM bounds win over durability here.
    fn evict(&mut self, pos: usize) {
        if let Some(old) = self.chunks[pos].take() {
            if !old.is_saved() {
                let give_up = Instant::now() + self.unsaved_evict_wait;
                while !old.is_saved() && Instant::now() < give_up {
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
            if !old.is_saved() {
                self.stats.lossy_evictions.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{}: evicting unsaved chunk t0={}, data loss",
                    self.key,
                    old.t0()
                );
            }
        }
    }

    /// Returns the T0 of the oldest retained chunk and a fresh iterator for
    /// every ring chunk whose span overlaps `[from, to)`, oldest first.
    ///
    /// Iterators may carry samples outside the requested range (chunks are
    /// returned whole); the caller filters. If `from` predates the returned
    /// oldest T0, the caller should extend the read through the store.
    pub fn get(&self, from: u32, to: u32) -> (Option<u32>, Vec<Iter>) {
        let len = self.chunks.len();
        let mut oldest = None;
        let mut iters = Vec::new();
        for step in 1..=len {
            let pos = (self.write_cursor + step) % len;
            if let Some(chunk) = &self.chunks[pos] {
                if oldest.is_none() {
                    oldest = Some(chunk.t0());
                }
                if from < to && chunk.t0() < to && chunk.t0() + self.chunk_span > from {
                    iters.push(chunk.iter());
                }
            }
        }
        (oldest, iters)
    }

    /// One GC pass: force-finish an idle open chunk, and report whether the
    /// whole metric has gone stale and should be dropped by the owner.
    pub fn gc(&mut self, now: u32, chunk_max_stale: u32, metric_max_stale: u32) -> GcOutcome {
        if let Some(cur) = self.chunks[self.write_cursor].clone() {
            if !cur.is_finished() && !cur.is_empty() && cur.last_write() + chunk_max_stale < now {
                debug!(
                    "{}: force-finishing stale open chunk t0={}",
                    self.key,
                    cur.t0()
                );
                self.seal(&cur);
            }
        }
        if self.last_write + metric_max_stale < now {
            GcOutcome::Drop
        } else {
            GcOutcome::Keep
        }
    }

    /// Shutdown path: flush rollup buckets, then seal and submit every open
    /// chunk, primary and derived.
    pub(crate) fn stop_seal(&mut self) {
        for aggregator in &mut self.aggregators {
            aggregator.stop();
        }
        if let Some(cur) = self.chunks[self.write_cursor].clone() {
            if !cur.is_empty() {
                self.seal(&cur);
            }
        }
    }

    /// Whether the retained chunk with the given T0 has been durably
    /// written (locally or by a peer). `None` if no such chunk is retained.
    pub fn is_saved(&self, t0: u32) -> Option<bool> {
        self.chunks
            .iter()
            .flatten()
            .find(|chunk| chunk.t0() == t0)
            .map(|chunk| chunk.is_saved())
    }

    /// Marks the ring chunk with the given T0 saved, if retained. Driven by
    /// persistence notifications from peers; idempotent.
    pub fn mark_saved(&self, t0: u32) -> bool {
        for chunk in self.chunks.iter().flatten() {
            if chunk.t0() == t0 {
                chunk.set_saved();
                return true;
            }
        }
        false
    }
}
