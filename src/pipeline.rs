//! Asynchronous, sharded, retry-until-success write path to the chunk store.
//!
//! One ingress channel fans out to `concurrency` worker queues. Requests are
//! routed by a byte-sum hash of the metric key, so all writes for a given
//! metric land on the same worker and stay totally ordered. Workers retry
//! failed inserts forever with a capped backoff; the trade-off is occasional
//! head-of-line blocking of one metric's writer in exchange for guaranteed
//! persistence once a chunk is submitted.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::{
    chunk::Chunk,
    cluster::{PublisherHandle, SavedChunk},
    store::ChunkStore,
    StrataError, StrataResult,
};

/// A sealed chunk on its way to durable storage. Owned by the pipeline from
/// submission until the insert finally succeeds.
#[derive(Debug, Clone)]
pub struct ChunkWriteRequest {
    pub key: String,
    pub chunk: Arc<Chunk>,
    pub ttl: u32,
    pub enqueued: Instant,
}

enum Job {
    Write(ChunkWriteRequest),
    Stop,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    concurrency: usize,
    queue_size: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            queue_size: 10_000,
        }
    }
}

impl PipelineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worker queues. Writes for one metric always share a worker.
    pub fn concurrency(self, concurrency: usize) -> Self {
        Self {
            concurrency,
            ..self
        }
    }

    /// Bound of the ingress channel and of each worker queue. Submitters
    /// block once a queue fills up.
    pub fn queue_size(self, queue_size: usize) -> Self {
        Self { queue_size, ..self }
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    save_ok: AtomicU64,
    save_fail: AtomicU64,
}

impl PipelineStats {
    pub fn save_ok(&self) -> u64 {
        self.save_ok.load(Ordering::Relaxed)
    }

    /// Failed insert attempts, not failed requests; one request may fail
    /// many times before it eventually lands.
    pub fn save_fail(&self) -> u64 {
        self.save_fail.load(Ordering::Relaxed)
    }
}

/// Sharded fan-out of [`ChunkWriteRequest`]s to the store.
pub struct WritePipeline {
    ingress: Sender<Job>,
    stats: Arc<PipelineStats>,
    stopped: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WritePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritePipeline")
            .field("stats", &self.stats)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl WritePipeline {
    /// Spawns the dispatcher and worker threads. On a successful insert the
    /// chunk is flagged saved and, when a `notifier` is given, a persistence
    /// notification goes out on the cluster bus.
    pub fn new(
        store: Arc<ChunkStore>,
        notifier: Option<PublisherHandle>,
        opts: PipelineOptions,
    ) -> Arc<Self> {
        let concurrency = opts.concurrency.max(1);
        let stats = Arc::new(PipelineStats::default());
        let (ingress_tx, ingress_rx) = bounded(opts.queue_size);

        let mut threads = Vec::with_capacity(concurrency + 1);
        let mut worker_txs = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let (tx, rx) = bounded(opts.queue_size);
            worker_txs.push(tx);
            let store = store.clone();
            let notifier = notifier.clone();
            let stats = stats.clone();
            threads.push(thread::spawn(move || {
                worker_loop(rx, store, notifier, stats)
            }));
        }
        threads.push(thread::spawn(move || dispatch_loop(ingress_rx, worker_txs)));

        Arc::new(Self {
            ingress: ingress_tx,
            stats,
            stopped: AtomicBool::new(false),
            threads: Mutex::new(threads),
        })
    }

    /// Hands a sealed chunk to the pipeline. Blocks when the ingress is
    /// full; sealing is the only ingest step that may wait on the store.
    pub fn submit(&self, request: ChunkWriteRequest) -> StrataResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(StrataError::PipelineStopped);
        }
        self.ingress
            .send(Job::Write(request))
            .map_err(|_| StrataError::PipelineStopped)
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Drains every queued request, then stops all threads. Requests
    /// submitted after this call are rejected.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ingress.send(Job::Stop).ok();
        let threads = std::mem::take(&mut *self.threads.lock());
        for t in threads {
            t.join().ok();
        }
    }
}

/// All writes for one key go to the same worker: per-metric ordering with
/// roughly balanced load.
fn shard_for(key: &str, workers: usize) -> usize {
    let sum: usize = key.bytes().map(usize::from).sum();
    sum % workers
}

fn dispatch_loop(ingress: Receiver<Job>, workers: Vec<Sender<Job>>) {
    for job in ingress.iter() {
        match job {
            Job::Write(request) => {
                let shard = shard_for(&request.key, workers.len());
                if workers[shard].send(Job::Write(request)).is_err() {
                    return;
                }
            }
            Job::Stop => break,
        }
    }
    for worker in &workers {
        worker.send(Job::Stop).ok();
    }
}

fn worker_loop(
    jobs: Receiver<Job>,
    store: Arc<ChunkStore>,
    notifier: Option<PublisherHandle>,
    stats: Arc<PipelineStats>,
) {
    for job in jobs.iter() {
        let request = match job {
            Job::Write(request) => request,
            Job::Stop => return,
        };
        debug!(
            "starting to save {}:{} (queued {:?})",
            request.key,
            request.chunk.t0(),
            request.enqueued.elapsed()
        );
        let payload = request.chunk.bytes();
        let mut attempts: u32 = 0;
        loop {
            match store.insert(&request.key, request.chunk.t0(), &payload, request.ttl) {
                Ok(()) => {
                    request.chunk.set_saved();
                    stats.save_ok.fetch_add(1, Ordering::Relaxed);
                    if let Some(notifier) = &notifier {
                        notifier.send(SavedChunk {
                            key: request.key.clone(),
                            t0: request.chunk.t0(),
                        });
                    }
                    debug!("save complete {}:{}", request.key, request.chunk.t0());
                    break;
                }
                Err(err) => {
                    attempts += 1;
                    stats.save_fail.fetch_add(1, Ordering::Relaxed);
                    if attempts % 20 == 1 {
                        warn!(
                            "failed to save chunk {}:{} after {} attempts: {err}",
                            request.key,
                            request.chunk.t0(),
                            attempts
                        );
                    }
                    let backoff = (100 * attempts).min(2000);
                    thread::sleep(Duration::from_millis(u64::from(backoff)));
                }
            }
        }
    }
}
