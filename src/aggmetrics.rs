//! The full set of metrics held in RAM, with lifecycle management.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, tick, Receiver, Sender};
use crossbeam::select;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::{
    aggmetric::{AggMetric, GcOutcome, IngestStats},
    now_unix,
    pipeline::WritePipeline,
    RetentionPolicy, StrataError, StrataResult,
};

/// Maps metric ids to their [`AggMetric`]s and owns their lifecycle:
/// entries appear on first write and a background sweep garbage-collects
/// idle chunks and drops metrics nothing has written to in
/// `metric_max_stale` seconds.
///
/// Lookups take a shared lock; only insertion and removal take the
/// exclusive one.
pub struct AggMetrics {
    metrics: RwLock<HashMap<String, Arc<Mutex<AggMetric>>>>,
    policy: RetentionPolicy,
    pipeline: Arc<WritePipeline>,
    stats: Arc<IngestStats>,
    stop_tx: Sender<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AggMetrics {
    /// Validates the policy and starts the background sweep.
    ///
    /// The store and cluster handles live behind the injected `pipeline`;
    /// there is no process-global state.
    pub fn new(policy: RetentionPolicy, pipeline: Arc<WritePipeline>) -> StrataResult<Arc<Self>> {
        policy.validate()?;
        let (stop_tx, stop_rx) = bounded(1);
        let gc_interval = policy.gc_interval;
        let this = Arc::new(Self {
            metrics: RwLock::new(HashMap::new()),
            policy,
            pipeline,
            stats: Arc::new(IngestStats::default()),
            stop_tx,
            sweeper: Mutex::new(None),
        });
        let weak = Arc::downgrade(&this);
        *this.sweeper.lock() = Some(thread::spawn(move || sweep_loop(weak, gc_interval, stop_rx)));
        Ok(this)
    }

    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn get_or_create(&self, key: &str) -> Arc<Mutex<AggMetric>> {
        if let Some(metric) = self.metrics.read().get(key) {
            return metric.clone();
        }
        self.metrics
            .write()
            .entry(key.to_owned())
            .or_insert_with(|| {
                debug!("creating metric {key}");
                Arc::new(Mutex::new(AggMetric::new(
                    key,
                    &self.policy,
                    self.pipeline.clone(),
                    self.stats.clone(),
                )))
            })
            .clone()
    }

    pub fn get(&self, key: &str) -> StrataResult<Arc<Mutex<AggMetric>>> {
        self.metrics
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StrataError::NotFound(key.to_owned()))
    }

    /// Batch-ingest entry point: rejected samples are counted on
    /// [`IngestStats`] and dropped rather than surfaced per-call.
    pub fn add(&self, key: &str, ts: u32, val: f64) {
        let metric = self.get_or_create(key);
        let mut metric = metric.lock();
        metric.add(ts, val).ok();
    }

    /// Applies a peer's persistence notification. Returns whether a
    /// retained chunk matched; unknown metrics and aged-out chunks are
    /// silently fine (at-least-once delivery makes both routine).
    pub fn mark_saved(&self, key: &str, t0: u32) -> bool {
        match self.metrics.read().get(key) {
            Some(metric) => metric.lock().mark_saved(t0),
            None => false,
        }
    }

    /// One GC pass over every metric, with `now` in unix seconds.
    pub fn sweep(&self, now: u32) {
        let entries: Vec<(String, Arc<Mutex<AggMetric>>)> = self
            .metrics
            .read()
            .iter()
            .map(|(key, metric)| (key.clone(), metric.clone()))
            .collect();

        let mut dropped = Vec::new();
        for (key, metric) in entries {
            let outcome =
                metric
                    .lock()
                    .gc(now, self.policy.chunk_max_stale, self.policy.metric_max_stale);
            if outcome == GcOutcome::Drop {
                dropped.push(key);
            }
        }
        if !dropped.is_empty() {
            let mut map = self.metrics.write();
            for key in dropped {
                debug!("dropping stale metric {key}");
                map.remove(&key);
            }
        }
    }

    /// Seals and submits every open chunk (primary and rollup), then drains
    /// the write pipeline so everything submitted reaches the store.
    pub fn stop(&self) {
        self.stop_tx.send(()).ok();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.join().ok();
        }
        for metric in self.metrics.read().values() {
            metric.lock().stop_seal();
        }
        self.pipeline.stop();
    }
}

fn sweep_loop(metrics: Weak<AggMetrics>, interval: Duration, stop_rx: Receiver<()>) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => match metrics.upgrade() {
                Some(metrics) => metrics.sweep(now_unix()),
                None => return,
            },
            recv(stop_rx) -> _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::PipelineOptions,
        store::{ChunkStore, MemoryBackend},
    };

    fn test_metrics(policy: RetentionPolicy) -> Arc<AggMetrics> {
        let store = Arc::new(ChunkStore::new(Arc::new(MemoryBackend::default())));
        let pipeline = WritePipeline::new(store, None, PipelineOptions::default());
        AggMetrics::new(policy, pipeline).unwrap()
    }

    #[test]
    fn get_or_create_and_not_found() {
        let metrics = test_metrics(RetentionPolicy::new().chunk_span(600));
        assert!(matches!(
            metrics.get("nope"),
            Err(StrataError::NotFound(key)) if key == "nope"
        ));

        metrics.add("foo", 601, 1.0);
        assert_eq!(metrics.len(), 1);
        assert!(metrics.get("foo").is_ok());

        // same entry on repeat lookups
        let a = metrics.get_or_create("foo");
        let b = metrics.get_or_create("foo");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn invalid_policy_rejected_at_construction() {
        let store = Arc::new(ChunkStore::new(Arc::new(MemoryBackend::default())));
        let pipeline = WritePipeline::new(store, None, PipelineOptions::default());
        assert!(AggMetrics::new(RetentionPolicy::new().num_chunks(1), pipeline).is_err());
    }

    #[test]
    fn sweep_drops_stale_metrics() {
        let metrics = test_metrics(
            RetentionPolicy::new()
                .chunk_span(600)
                .chunk_max_stale(60)
                .metric_max_stale(300),
        );
        metrics.add("foo", 601, 1.0);

        // not stale yet
        metrics.sweep(now_unix());
        assert_eq!(metrics.len(), 1);

        // far enough in the future: force-finish and drop
        metrics.sweep(now_unix() + 301);
        assert_eq!(metrics.len(), 0);
    }

    #[test]
    fn sweep_force_finishes_idle_open_chunk() {
        let metrics = test_metrics(
            RetentionPolicy::new()
                .chunk_span(600)
                .chunk_max_stale(60)
                .metric_max_stale(1_000_000),
        );
        metrics.add("foo", 601, 1.0);
        metrics.sweep(now_unix() + 61);

        let metric = metrics.get("foo").unwrap();
        let (_, iters) = metric.lock().get(600, 1200);
        assert_eq!(iters.len(), 1);
        // the chunk was finished by the sweep even though the metric stays,
        // so a late sample for the same span is rejected
        assert!(matches!(
            metric.lock().add(650, 2.0),
            Err(StrataError::ChunkFinished { t0: 600 })
        ));
    }

    #[test]
    fn mark_saved_routes_to_ring() {
        let metrics = test_metrics(RetentionPolicy::new().chunk_span(600));
        metrics.add("foo", 601, 1.0);
        assert!(metrics.mark_saved("foo", 600));
        assert!(!metrics.mark_saved("foo", 1200));
        assert!(!metrics.mark_saved("unknown", 600));
    }
}
