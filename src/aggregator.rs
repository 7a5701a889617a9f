//! Rollup aggregation: folds primary samples into coarser-span series.

use std::sync::Arc;

use crate::{
    aggmetric::{AggMetric, IngestStats},
    pipeline::WritePipeline,
    RollupSpec,
};

/// Running stats for one rollup bucket.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub cnt: u64,
    pub lst: f64,
}

impl Aggregation {
    fn new() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            cnt: 0,
            lst: 0.0,
        }
    }

    fn add(&mut self, val: f64) {
        self.min = self.min.min(val);
        self.max = self.max.max(val);
        self.sum += val;
        self.cnt += 1;
        self.lst = val;
    }
}

/// Buckets a metric's samples into `span`-second windows and emits one point
/// per window into each of five derived series (`_sum`, `_cnt`, `_min`,
/// `_max`, `_lst` suffixed keys), each retained in its own chunk ring.
///
/// Runs under the parent metric's lock, so rollup updates are serialized
/// with primary writes.
#[derive(Debug)]
pub struct Aggregator {
    span: u32,
    current_boundary: u32,
    agg: Aggregation,
    sum: AggMetric,
    cnt: AggMetric,
    min: AggMetric,
    max: AggMetric,
    lst: AggMetric,
}

impl Aggregator {
    pub(crate) fn new(
        key: &str,
        spec: &RollupSpec,
        ttl: u32,
        unsaved_evict_wait: std::time::Duration,
        pipeline: Arc<WritePipeline>,
        stats: Arc<IngestStats>,
    ) -> Self {
        let series = |kind: &str| {
            AggMetric::derived(
                &format!("{}_{}_{}", key, kind, spec.agg_span),
                spec.chunk_span,
                spec.num_chunks,
                ttl,
                unsaved_evict_wait,
                pipeline.clone(),
                stats.clone(),
            )
        };
        Self {
            span: spec.agg_span,
            current_boundary: 0,
            agg: Aggregation::new(),
            sum: series("sum"),
            cnt: series("cnt"),
            min: series("min"),
            max: series("max"),
            lst: series("lst"),
        }
    }

    pub fn span(&self) -> u32 {
        self.span
    }

    /// The bucket a timestamp falls in, identified by the bucket's end.
    /// A ts exactly on a boundary belongs to the bucket it closes.
    fn boundary(&self, ts: u32) -> u32 {
        if ts % self.span == 0 {
            ts
        } else {
            ts - ts % self.span + self.span
        }
    }

    pub fn add(&mut self, ts: u32, val: f64) {
        let boundary = self.boundary(ts);
        if boundary == self.current_boundary {
            self.agg.add(val);
            if ts == boundary {
                self.flush();
            }
        } else if boundary > self.current_boundary {
            self.flush();
            self.current_boundary = boundary;
            self.agg.add(val);
            if ts == boundary {
                self.flush();
            }
        }
        // Samples from an already-emitted bucket are dropped; the parent
        // rejects out-of-order timestamps before they get here.
    }

    /// Emits the pending bucket into the derived series and resets it.
    pub fn flush(&mut self) {
        if self.agg.cnt == 0 {
            return;
        }
        let ts = self.current_boundary;
        self.sum.add(ts, self.agg.sum).ok();
        self.cnt.add(ts, self.agg.cnt as f64).ok();
        self.min.add(ts, self.agg.min).ok();
        self.max.add(ts, self.agg.max).ok();
        self.lst.add(ts, self.agg.lst).ok();
        self.agg = Aggregation::new();
    }

    #[cfg(test)]
    pub(crate) fn min_series(&self) -> &AggMetric {
        &self.min
    }

    /// Flushes the pending bucket and seals every derived series' open
    /// chunk, submitting them for persistence.
    pub(crate) fn stop(&mut self) {
        self.flush();
        self.sum.stop_seal();
        self.cnt.stop_seal();
        self.min.stop_seal();
        self.max.stop_seal();
        self.lst.stop_seal();
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pipeline::PipelineOptions, store::MemoryBackend, ChunkStore, Sample};

    fn test_aggregator(span: u32, chunk_span: u32) -> Aggregator {
        let store = Arc::new(ChunkStore::new(Arc::new(MemoryBackend::default())));
        let pipeline = WritePipeline::new(store, None, PipelineOptions::default());
        Aggregator::new(
            "foo",
            &RollupSpec {
                agg_span: span,
                chunk_span,
                num_chunks: 5,
            },
            3600,
            std::time::Duration::from_millis(10),
            pipeline,
            Arc::new(IngestStats::default()),
        )
    }

    fn series_samples(metric: &AggMetric) -> Vec<Sample> {
        let (_, iters) = metric.get(0, u32::MAX);
        iters.into_iter().flatten().collect()
    }

    #[test]
    fn emits_one_point_per_closed_bucket() {
        let mut agg = test_aggregator(60, 600);
        agg.add(100, 2.0);
        agg.add(110, 6.0);
        // crossing into the next bucket closes (60, 120]
        agg.add(130, 1.0);

        assert_eq!(series_samples(&agg.sum), vec![Sample::new(120, 8.0)]);
        assert_eq!(series_samples(&agg.cnt), vec![Sample::new(120, 2.0)]);
        assert_eq!(series_samples(&agg.min), vec![Sample::new(120, 2.0)]);
        assert_eq!(series_samples(&agg.max), vec![Sample::new(120, 6.0)]);
        assert_eq!(series_samples(&agg.lst), vec![Sample::new(120, 6.0)]);
    }

    #[test]
    fn boundary_sample_closes_its_own_bucket() {
        let mut agg = test_aggregator(60, 600);
        agg.add(70, 1.0);
        agg.add(120, 3.0); // lands exactly on the boundary, bucket emits now

        assert_eq!(series_samples(&agg.sum), vec![Sample::new(120, 4.0)]);
        assert_eq!(series_samples(&agg.lst), vec![Sample::new(120, 3.0)]);
    }

    #[test]
    fn flush_emits_partial_bucket() {
        let mut agg = test_aggregator(60, 600);
        agg.add(130, 5.0);
        assert!(series_samples(&agg.sum).is_empty());
        agg.flush();
        assert_eq!(series_samples(&agg.sum), vec![Sample::new(180, 5.0)]);
        // flushing twice must not emit again
        agg.flush();
        assert_eq!(series_samples(&agg.sum).len(), 1);
    }
}
