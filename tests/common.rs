#![allow(dead_code)] // each test binary uses a subset of these helpers

use std::ops::Bound;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use strata::{
    AggMetric, ColumnBackend, MemoryBackend, PersistConsumer, Sample, StrataError, StrataResult,
    Transport,
};

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let give_up = Instant::now() + timeout;
    while Instant::now() < give_up {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Drives an [`AggMetric`] while remembering every point fed to it, so
/// range reads can be checked against ground truth.
pub struct Checker {
    metric: AggMetric,
    points: Vec<(u32, f64)>,
}

impl Checker {
    pub fn new(metric: AggMetric) -> Self {
        Self {
            metric,
            points: Vec::new(),
        }
    }

    /// Points must be added in ascending ts order, never the same ts twice.
    pub fn add(&mut self, ts: u32, val: f64) {
        self.metric.add(ts, val).expect("checker points are in order");
        self.points.push((ts, val));
    }

    /// Asserts that `get(from, to)` returns exactly the points from `first`
    /// through `last` (both inclusive, and both must be ts of real points).
    /// The two ranges differ because chunks come back whole.
    pub fn verify(&self, from: u32, to: u32, first: u32, last: u32) {
        let (_, iters) = self.metric.get(from, to);
        let got: Vec<Sample> = iters.into_iter().flatten().collect();

        let lo = self
            .points
            .iter()
            .position(|p| p.0 == first)
            .expect("first must be the ts of a point previously added");
        let hi = self
            .points
            .iter()
            .position(|p| p.0 == last)
            .expect("last must be the ts of a point previously added");
        let want: Vec<Sample> = self.points[lo..=hi]
            .iter()
            .map(|&(ts, val)| Sample::new(ts, val))
            .collect();
        assert_eq!(got, want, "get({from},{to}) should cover ts {first}..={last}");
    }

    pub fn verify_empty(&self, from: u32, to: u32) {
        let (_, iters) = self.metric.get(from, to);
        let got: Vec<Sample> = iters.into_iter().flatten().collect();
        assert!(got.is_empty(), "get({from},{to}) should be empty, got {got:?}");
    }

    pub fn metric(&self) -> &AggMetric {
        &self.metric
    }
}

/// Fails the first `failures` inserts with a transient error, then behaves
/// like a [`MemoryBackend`].
#[derive(Debug, Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    failures: AtomicU32,
}

impl FlakyBackend {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: MemoryBackend::default(),
            failures: AtomicU32::new(failures),
        }
    }
}

impl ColumnBackend for FlakyBackend {
    fn insert(&self, row_key: &str, ts: u32, payload: &[u8], ttl: u32) -> StrataResult<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StrataError::StoreTransient("injected failure".into()));
        }
        self.inner.insert(row_key, ts, payload, ttl)
    }

    fn read_before(&self, row_key: &str, ts: u32) -> StrataResult<Option<(u32, Vec<u8>)>> {
        self.inner.read_before(row_key, ts)
    }

    fn scan_asc(
        &self,
        row_key: &str,
        lo: Bound<u32>,
        hi: Bound<u32>,
    ) -> StrataResult<Vec<(u32, Vec<u8>)>> {
        self.inner.scan_asc(row_key, lo, hi)
    }
}

/// Counts and journals inserts on top of a [`MemoryBackend`].
#[derive(Debug, Default)]
pub struct CountingBackend {
    inner: MemoryBackend,
    inserts: AtomicU64,
    journal: Mutex<Vec<(String, u32)>>,
}

impl CountingBackend {
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::SeqCst)
    }

    /// `(row_key, t0)` of every insert, in arrival order.
    pub fn journal(&self) -> Vec<(String, u32)> {
        self.journal.lock().clone()
    }
}

impl ColumnBackend for CountingBackend {
    fn insert(&self, row_key: &str, ts: u32, payload: &[u8], ttl: u32) -> StrataResult<()> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.journal.lock().push((row_key.to_owned(), ts));
        self.inner.insert(row_key, ts, payload, ttl)
    }

    fn read_before(&self, row_key: &str, ts: u32) -> StrataResult<Option<(u32, Vec<u8>)>> {
        self.inner.read_before(row_key, ts)
    }

    fn scan_asc(
        &self,
        row_key: &str,
        lo: Bound<u32>,
        hi: Bound<u32>,
    ) -> StrataResult<Vec<(u32, Vec<u8>)>> {
        self.inner.scan_asc(row_key, lo, hi)
    }
}

/// Sleeps before every read, for deadline tests.
#[derive(Debug)]
pub struct SlowBackend {
    inner: MemoryBackend,
    delay: Duration,
}

impl SlowBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryBackend::default(),
            delay,
        }
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }
}

impl ColumnBackend for SlowBackend {
    fn insert(&self, row_key: &str, ts: u32, payload: &[u8], ttl: u32) -> StrataResult<()> {
        self.inner.insert(row_key, ts, payload, ttl)
    }

    fn read_before(&self, row_key: &str, ts: u32) -> StrataResult<Option<(u32, Vec<u8>)>> {
        std::thread::sleep(self.delay);
        self.inner.read_before(row_key, ts)
    }

    fn scan_asc(
        &self,
        row_key: &str,
        lo: Bound<u32>,
        hi: Bound<u32>,
    ) -> StrataResult<Vec<(u32, Vec<u8>)>> {
        std::thread::sleep(self.delay);
        self.inner.scan_asc(row_key, lo, hi)
    }
}

/// Fails any read touching one specific row, for partial-result tests.
#[derive(Debug)]
pub struct BrokenRowBackend {
    inner: MemoryBackend,
    broken_row: String,
}

impl BrokenRowBackend {
    pub fn new(broken_row: &str) -> Self {
        Self {
            inner: MemoryBackend::default(),
            broken_row: broken_row.to_owned(),
        }
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    fn check(&self, row_key: &str) -> StrataResult<()> {
        if row_key == self.broken_row {
            return Err(StrataError::StoreTransient(format!(
                "row {row_key} unavailable"
            )));
        }
        Ok(())
    }
}

impl ColumnBackend for BrokenRowBackend {
    fn insert(&self, row_key: &str, ts: u32, payload: &[u8], ttl: u32) -> StrataResult<()> {
        self.inner.insert(row_key, ts, payload, ttl)
    }

    fn read_before(&self, row_key: &str, ts: u32) -> StrataResult<Option<(u32, Vec<u8>)>> {
        self.check(row_key)?;
        self.inner.read_before(row_key, ts)
    }

    fn scan_asc(
        &self,
        row_key: &str,
        lo: Bound<u32>,
        hi: Bound<u32>,
    ) -> StrataResult<Vec<(u32, Vec<u8>)>> {
        self.check(row_key)?;
        self.inner.scan_asc(row_key, lo, hi)
    }
}

/// A bus endpoint that hands frames straight to a peer's consumer.
pub struct LoopbackTransport {
    endpoint: String,
    consumer: PersistConsumer,
}

impl LoopbackTransport {
    pub fn new(endpoint: &str, consumer: PersistConsumer) -> Self {
        Self {
            endpoint: endpoint.to_owned(),
            consumer,
        }
    }
}

impl Transport for LoopbackTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn publish(&self, frame: &[u8]) -> StrataResult<()> {
        self.consumer.handle(frame).map(|_| ())
    }
}

/// A bus endpoint that keeps every published frame.
#[derive(Default)]
pub struct CollectTransport {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl CollectTransport {
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }
}

impl Transport for CollectTransport {
    fn endpoint(&self) -> &str {
        "collect"
    }

    fn publish(&self, frame: &[u8]) -> StrataResult<()> {
        self.frames.lock().push(frame.to_vec());
        Ok(())
    }
}
