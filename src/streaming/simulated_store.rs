//! Simulated Object Store with Fault Injection
//!
//! DST-compatible wrapper that injects faults from a seeded RNG and records
//! every call made through it. Faults are injected before the call reaches
//! the inner store, so a failed operation never has a side effect.
//!
//! Besides random faults, individual calls can be failed by position with
//! `ScriptedFault`, e.g. "fail the third upload_part".

use crate::io::Rng;
use crate::streaming::object_store::{MultipartUpload, ObjectStore, PartTag, StoreFuture};
use parking_lot::Mutex;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;

/// Kinds of store operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Put,
    Get,
    Exists,
    Initiate,
    UploadPart,
    Complete,
    Abort,
}

/// One recorded call: the operation and the key it targeted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub op: StoreOp,
    pub key: String,
}

/// Fail the `nth` (zero-based) call of `op`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedFault {
    pub op: StoreOp,
    pub nth: u64,
}

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability of PUT operation failure
    pub put_fail_prob: f64,
    /// Probability of GET operation failure
    pub get_fail_prob: f64,
    /// Probability of multipart initiate failure
    pub initiate_fail_prob: f64,
    /// Probability of upload-part failure
    pub upload_part_fail_prob: f64,
    /// Probability of multipart complete failure
    pub complete_fail_prob: f64,
    /// Probability of multipart abort failure
    pub abort_fail_prob: f64,
    /// Probability of operation timeout (any operation except abort)
    pub timeout_prob: f64,
    /// Calls to fail by position
    pub scripted: Vec<ScriptedFault>,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.01,         // 1%
            get_fail_prob: 0.01,         // 1%
            initiate_fail_prob: 0.01,    // 1%
            upload_part_fail_prob: 0.02, // 2%
            complete_fail_prob: 0.01,    // 1%
            abort_fail_prob: 0.0,
            timeout_prob: 0.005, // 0.5%
            scripted: Vec::new(),
            latency_range_us: (0, 0),
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.05,
            get_fail_prob: 0.05,
            initiate_fail_prob: 0.05,
            upload_part_fail_prob: 0.08,
            complete_fail_prob: 0.05,
            abort_fail_prob: 0.0,
            timeout_prob: 0.02,
            scripted: Vec::new(),
            latency_range_us: (0, 0),
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.0,
            get_fail_prob: 0.0,
            initiate_fail_prob: 0.0,
            upload_part_fail_prob: 0.0,
            complete_fail_prob: 0.0,
            abort_fail_prob: 0.0,
            timeout_prob: 0.0,
            scripted: Vec::new(),
            latency_range_us: (0, 0),
        }
    }

    /// No random faults, fail exactly the given calls
    pub fn scripted(faults: Vec<ScriptedFault>) -> Self {
        SimulatedStoreConfig {
            scripted: faults,
            ..Self::no_faults()
        }
    }

    fn fail_prob(&self, op: StoreOp) -> f64 {
        match op {
            StoreOp::Put => self.put_fail_prob,
            StoreOp::Get => self.get_fail_prob,
            StoreOp::Exists => 0.0,
            StoreOp::Initiate => self.initiate_fail_prob,
            StoreOp::UploadPart => self.upload_part_fail_prob,
            StoreOp::Complete => self.complete_fail_prob,
            StoreOp::Abort => self.abort_fail_prob,
        }
    }
}

/// Per-operation call and failure counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedStoreStats {
    pub put_attempts: u64,
    pub put_failures: u64,
    pub get_attempts: u64,
    pub get_failures: u64,
    pub exists_attempts: u64,
    pub initiate_attempts: u64,
    pub initiate_failures: u64,
    pub upload_part_attempts: u64,
    pub upload_part_failures: u64,
    pub complete_attempts: u64,
    pub complete_failures: u64,
    pub abort_attempts: u64,
    pub abort_failures: u64,
    pub timeouts: u64,
}

impl SimulatedStoreStats {
    fn attempts_mut(&mut self, op: StoreOp) -> &mut u64 {
        match op {
            StoreOp::Put => &mut self.put_attempts,
            StoreOp::Get => &mut self.get_attempts,
            StoreOp::Exists => &mut self.exists_attempts,
            StoreOp::Initiate => &mut self.initiate_attempts,
            StoreOp::UploadPart => &mut self.upload_part_attempts,
            StoreOp::Complete => &mut self.complete_attempts,
            StoreOp::Abort => &mut self.abort_attempts,
        }
    }

    fn failures_mut(&mut self, op: StoreOp) -> Option<&mut u64> {
        match op {
            StoreOp::Put => Some(&mut self.put_failures),
            StoreOp::Get => Some(&mut self.get_failures),
            StoreOp::Exists => None,
            StoreOp::Initiate => Some(&mut self.initiate_failures),
            StoreOp::UploadPart => Some(&mut self.upload_part_failures),
            StoreOp::Complete => Some(&mut self.complete_failures),
            StoreOp::Abort => Some(&mut self.abort_failures),
        }
    }

    /// Total number of failed calls, including timeouts
    pub fn total_failures(&self) -> u64 {
        self.put_failures
            + self.get_failures
            + self.initiate_failures
            + self.upload_part_failures
            + self.complete_failures
            + self.abort_failures
            + self.timeouts
    }
}

/// Inner state for the simulated store
struct SimulatedStoreInner<R: Rng> {
    rng: R,
    stats: SimulatedStoreStats,
    calls: Vec<StoreCall>,
}

/// Simulated object store that wraps another store and injects faults
pub struct SimulatedObjectStore<S: ObjectStore + Clone, R: Rng> {
    inner_store: S,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner<R>>>,
}

impl<S: ObjectStore + Clone, R: Rng> SimulatedObjectStore<S, R> {
    /// Create a new simulated store with the given RNG
    pub fn new(inner_store: S, rng: R, config: SimulatedStoreConfig) -> Self {
        SimulatedObjectStore {
            inner_store,
            config,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng,
                stats: SimulatedStoreStats::default(),
                calls: Vec::new(),
            })),
        }
    }

    /// Get current statistics
    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    /// Calls of one kind, in order
    pub fn calls_of(&self, op: StoreOp) -> Vec<StoreCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    /// Reset statistics and the call log
    pub fn reset_stats(&self) {
        let mut s = self.state.lock();
        s.stats = SimulatedStoreStats::default();
        s.calls.clear();
    }

    /// The wrapped store
    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    /// Record the call and decide whether it fails.
    /// Returns the error to surface, if any, plus a latency to apply.
    fn admit(&self, op: StoreOp, key: &str) -> (Option<IoError>, u64) {
        let mut s = self.state.lock();
        let nth = *s.stats.attempts_mut(op);
        *s.stats.attempts_mut(op) += 1;
        s.calls.push(StoreCall {
            op,
            key: key.to_string(),
        });

        let scripted = self
            .config
            .scripted
            .iter()
            .any(|f| f.op == op && f.nth == nth);

        let timeout = op != StoreOp::Abort && s.rng.gen_bool(self.config.timeout_prob);
        let fail = scripted || s.rng.gen_bool(self.config.fail_prob(op));

        let (min, max) = self.config.latency_range_us;
        let latency_us = if max > min { s.rng.gen_range(min, max) } else { min };

        if timeout && !scripted {
            s.stats.timeouts += 1;
            return (
                Some(IoError::new(ErrorKind::TimedOut, "simulated timeout")),
                latency_us,
            );
        }
        if fail {
            if let Some(failures) = s.stats.failures_mut(op) {
                *failures += 1;
            }
            return (
                Some(IoError::new(
                    ErrorKind::Other,
                    format!("simulated {:?} failure", op),
                )),
                latency_us,
            );
        }
        (None, latency_us)
    }

    async fn simulate(&self, op: StoreOp, key: &str) -> Result<(), IoError> {
        let (fault, latency_us) = self.admit(op, key);
        if latency_us > 0 {
            tokio::time::sleep(std::time::Duration::from_micros(latency_us)).await;
        }
        match fault {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<S: ObjectStore + Clone, R: Rng> ObjectStore for SimulatedObjectStore<S, R> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.simulate(StoreOp::Put, key).await?;
            self.inner_store.put(key, data).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.simulate(StoreOp::Get, key).await?;
            self.inner_store.get(key).await
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.simulate(StoreOp::Exists, key).await?;
            self.inner_store.exists(key).await
        })
    }

    fn initiate_multipart<'a>(&'a self, key: &'a str) -> StoreFuture<'a, MultipartUpload> {
        Box::pin(async move {
            self.simulate(StoreOp::Initiate, key).await?;
            self.inner_store.initiate_multipart(key).await
        })
    }

    fn upload_part<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        part_index: usize,
        data: &'a [u8],
    ) -> StoreFuture<'a, PartTag> {
        Box::pin(async move {
            self.simulate(StoreOp::UploadPart, &upload.key).await?;
            self.inner_store.upload_part(upload, part_index, data).await
        })
    }

    fn complete_multipart<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        parts: &'a [PartTag],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.simulate(StoreOp::Complete, &upload.key).await?;
            self.inner_store.complete_multipart(upload, parts).await
        })
    }

    fn abort_multipart<'a>(&'a self, upload: &'a MultipartUpload) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.simulate(StoreOp::Abort, &upload.key).await?;
            self.inner_store.abort_multipart(upload).await
        })
    }

    fn is_not_found(&self, err: &IoError) -> bool {
        self.inner_store.is_not_found(err)
    }
}

// Implement Clone for SimulatedObjectStore
impl<S: ObjectStore + Clone, R: Rng> Clone for SimulatedObjectStore<S, R> {
    fn clone(&self) -> Self {
        SimulatedObjectStore {
            inner_store: self.inner_store.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
        }
    }
}
