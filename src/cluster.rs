//! Cluster-wide persistence notifications.
//!
//! Peers ingesting the same metrics tell each other which chunks they have
//! durably written, so everyone else can mark their own copy saved and skip
//! the duplicate store write. Delivery is at-least-once over an external
//! message bus; only the frame shape is specified here, the broker itself
//! hides behind [`Transport`].

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, tick, unbounded, Receiver, Sender};
use crossbeam::select;
use log::{debug, error, warn};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{aggmetrics::AggMetrics, StrataError, StrataResult};

/// Version codes prefixing cluster bus frames.
pub mod msg {
    pub const PERSIST_MESSAGE_BATCH_V1: u8 = 1;
}

/// Notifications are buffered and flushed as one frame at this size.
pub const MAX_BATCH: usize = 5000;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const PUBLISH_RETRY_SLEEP: Duration = Duration::from_secs(1);
const HOST_RETRY_AFTER: Duration = Duration::from_secs(30);

/// One durably-written chunk, identified the same way the store rows are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedChunk {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "T0")]
    pub t0: u32,
}

/// The JSON body of a bus frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistMessageBatch {
    #[serde(rename = "Instance")]
    pub instance: String,
    #[serde(rename = "SavedChunks")]
    pub saved_chunks: Vec<SavedChunk>,
}

/// Frames a batch: one version byte, then the JSON body.
pub fn encode_frame(batch: &PersistMessageBatch) -> StrataResult<Vec<u8>> {
    let body = serde_json::to_vec(batch)?;
    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(msg::PERSIST_MESSAGE_BATCH_V1);
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode_frame(frame: &[u8]) -> StrataResult<PersistMessageBatch> {
    match frame.first() {
        None => Err(StrataError::TruncatedPayload(0)),
        Some(&msg::PERSIST_MESSAGE_BATCH_V1) => Ok(serde_json::from_slice(&frame[1..])?),
        Some(&version) => Err(StrataError::UnknownMessageVersion(version)),
    }
}

/// One publishing endpoint of the message bus.
pub trait Transport: Send + Sync {
    fn endpoint(&self) -> &str;
    fn publish(&self, frame: &[u8]) -> StrataResult<()>;
}

/// Epsilon-greedy, latency-weighted endpoint selection.
///
/// Mostly exploits the host with the best observed latency, sometimes
/// explores another live one. Hosts that fail a publish are benched for
/// [`HOST_RETRY_AFTER`]; when every host is benched the pool resets them
/// all to alive, so selection always yields a host and the publish loop can
/// retry indefinitely.
pub struct HostPool {
    hosts: Vec<HostState>,
    epsilon: f64,
}

#[derive(Debug)]
struct HostState {
    dead: bool,
    retry_at: Instant,
    ewma_ms: f64,
}

impl HostPool {
    pub fn new(hosts: usize) -> Self {
        Self {
            hosts: (0..hosts)
                .map(|_| HostState {
                    dead: false,
                    retry_at: Instant::now(),
                    ewma_ms: 0.0,
                })
                .collect(),
            epsilon: 0.3,
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Picks the next host index to try.
    pub fn get(&mut self) -> usize {
        let now = Instant::now();
        let mut candidates: Vec<usize> = (0..self.hosts.len())
            .filter(|&i| !self.hosts[i].dead || self.hosts[i].retry_at <= now)
            .collect();
        if candidates.is_empty() {
            // Every host is benched: reset them all and try again.
            for host in &mut self.hosts {
                host.dead = false;
            }
            candidates = (0..self.hosts.len()).collect();
        }

        let mut rng = rand::thread_rng();
        if candidates.len() > 1 && rng.gen::<f64>() < self.epsilon {
            return candidates[rng.gen_range(0..candidates.len())];
        }
        candidates
            .into_iter()
            .min_by(|&a, &b| {
                self.hosts[a]
                    .ewma_ms
                    .total_cmp(&self.hosts[b].ewma_ms)
            })
            .unwrap_or(0)
    }

    pub fn mark_ok(&mut self, idx: usize, latency: Duration) {
        let host = &mut self.hosts[idx];
        host.dead = false;
        let ms = latency.as_secs_f64() * 1000.0;
        host.ewma_ms = if host.ewma_ms == 0.0 {
            ms
        } else {
            0.7 * host.ewma_ms + 0.3 * ms
        };
    }

    pub fn mark_err(&mut self, idx: usize) {
        let host = &mut self.hosts[idx];
        host.dead = true;
        host.retry_at = Instant::now() + HOST_RETRY_AFTER;
    }
}

/// Cheap cloneable sender the write pipeline uses to report saved chunks.
#[derive(Clone)]
pub struct PublisherHandle {
    pub(crate) tx: Sender<SavedChunk>,
}

impl PublisherHandle {
    pub fn send(&self, saved: SavedChunk) {
        self.tx.send(saved).ok();
    }
}

/// Batching publisher of persistence notifications.
///
/// Buffers incoming [`SavedChunk`]s and flushes one framed
/// [`PersistMessageBatch`] whenever the buffer reaches [`MAX_BATCH`] or
/// every second. Each flush publishes from its own thread and loops over
/// the host pool until some endpoint accepts the frame, so delivery is
/// at-least-once and a dead broker never stalls batching.
pub struct Publisher {
    handle: PublisherHandle,
    stop_tx: Sender<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
    published: Arc<AtomicU64>,
}

impl Publisher {
    pub fn new(instance: &str, transports: Vec<Arc<dyn Transport>>) -> Self {
        let (tx, rx) = unbounded();
        let (stop_tx, stop_rx) = bounded(1);
        let published = Arc::new(AtomicU64::new(0));
        let pool = Arc::new(Mutex::new(HostPool::new(transports.len())));
        let worker = FlushState {
            instance: instance.to_owned(),
            transports: Arc::new(transports),
            pool,
            published: published.clone(),
        };
        let thread = thread::spawn(move || run(worker, rx, stop_rx));
        Self {
            handle: PublisherHandle { tx },
            stop_tx,
            thread: Mutex::new(Some(thread)),
            published,
        }
    }

    pub fn handle(&self) -> PublisherHandle {
        self.handle.clone()
    }

    /// Frames published so far (not notifications; a frame batches many).
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Flushes anything buffered and stops the batching thread. In-flight
    /// publish retries keep running detached until they deliver.
    pub fn stop(&self) {
        self.stop_tx.send(()).ok();
        if let Some(thread) = self.thread.lock().take() {
            thread.join().ok();
        }
    }
}

#[derive(Clone)]
struct FlushState {
    instance: String,
    transports: Arc<Vec<Arc<dyn Transport>>>,
    pool: Arc<Mutex<HostPool>>,
    published: Arc<AtomicU64>,
}

fn run(state: FlushState, rx: Receiver<SavedChunk>, stop_rx: Receiver<()>) {
    let ticker = tick(FLUSH_INTERVAL);
    let mut buf: Vec<SavedChunk> = Vec::new();
    loop {
        select! {
            recv(rx) -> saved => match saved {
                Ok(saved) => {
                    buf.push(saved);
                    if buf.len() >= MAX_BATCH {
                        flush(&state, &mut buf);
                    }
                }
                // every sender is gone; flush what's left and wind down
                Err(_) => {
                    flush(&state, &mut buf);
                    return;
                }
            },
            recv(ticker) -> _ => flush(&state, &mut buf),
            recv(stop_rx) -> _ => {
                while let Ok(saved) = rx.try_recv() {
                    buf.push(saved);
                }
                flush(&state, &mut buf);
                return;
            }
        }
    }
}

/// Publishes the buffered batch asynchronously, retrying until a host
/// accepts it.
fn flush(state: &FlushState, buf: &mut Vec<SavedChunk>) {
    if buf.is_empty() {
        return;
    }
    let batch = PersistMessageBatch {
        instance: state.instance.clone(),
        saved_chunks: std::mem::take(buf),
    };
    let state = state.clone();
    thread::spawn(move || {
        let frame = match encode_frame(&batch) {
            Ok(frame) => frame,
            Err(err) => {
                error!("failed to encode persist batch: {err}");
                return;
            }
        };
        if state.transports.is_empty() {
            error!(
                "no bus endpoints configured, dropping {} persist notifications",
                batch.saved_chunks.len()
            );
            return;
        }
        debug!(
            "sending batch of {} persist notifications",
            batch.saved_chunks.len()
        );
        loop {
            let idx = state.pool.lock().get();
            let transport = &state.transports[idx];
            let start = Instant::now();
            match transport.publish(&frame) {
                Ok(()) => {
                    state.pool.lock().mark_ok(idx, start.elapsed());
                    state.published.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(err) => {
                    state.pool.lock().mark_err(idx);
                    warn!(
                        "marking host {} as faulty: {err}",
                        transport.endpoint()
                    );
                    thread::sleep(PUBLISH_RETRY_SLEEP);
                }
            }
        }
    });
}

/// Applies incoming persistence notifications to the local ring buffers.
pub struct PersistConsumer {
    instance: String,
    metrics: Arc<AggMetrics>,
}

impl PersistConsumer {
    pub fn new(instance: &str, metrics: Arc<AggMetrics>) -> Self {
        Self {
            instance: instance.to_owned(),
            metrics,
        }
    }

    /// Decodes one bus frame and marks every matching retained chunk saved.
    /// Self-originated frames are skipped; redelivery is harmless since
    /// marking is idempotent. Returns how many chunks were marked.
    pub fn handle(&self, frame: &[u8]) -> StrataResult<usize> {
        let batch = decode_frame(frame)?;
        if batch.instance == self.instance {
            return Ok(0);
        }
        let mut marked = 0;
        for saved in &batch.saved_chunks {
            if self.metrics.mark_saved(&saved.key, saved.t0) {
                marked += 1;
            }
        }
        debug!(
            "instance {}: marked {marked}/{} chunks from peer {}",
            self.instance,
            batch.saved_chunks.len(),
            batch.instance
        );
        Ok(marked)
    }
}
