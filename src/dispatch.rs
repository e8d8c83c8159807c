//! Concurrent dispatch of shards to the reasoning service.
//!
//! Every shard yields exactly one [`AnalysisOutcome`]: a cache hit, a success, or a
//! recorded failure. Failures never cancel siblings.

use crate::config::DispatchConfig;
use crate::error::{DispatchError, FailureKind};
use crate::findings;
use crate::llm::{AnalysisKind, ReasoningClient, ServiceReply, TokenUsage};
use crate::sharding::Shard;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of analyzing one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub shard_id: String,
    pub success: bool,
    pub raw_payload: String,
    pub failure_reason: Option<String>,
    pub failure_kind: Option<FailureKind>,
    /// Wall time in seconds, retries and backoff included.
    pub elapsed_secs: f64,
    pub confidence_hint: f64,
    pub token_usage: Option<TokenUsage>,
    pub attempts: usize,
    pub cached: bool,
}

impl AnalysisOutcome {
    pub fn succeeded(shard_id: &str, reply: ServiceReply, elapsed: Duration, attempts: usize) -> Self {
        Self {
            shard_id: shard_id.to_string(),
            success: true,
            confidence_hint: findings::confidence_hint(&reply.content),
            raw_payload: reply.content,
            failure_reason: None,
            failure_kind: None,
            elapsed_secs: elapsed.as_secs_f64(),
            token_usage: reply.usage,
            attempts,
            cached: false,
        }
    }

    pub fn failed(
        shard_id: &str,
        reason: impl Into<String>,
        kind: FailureKind,
        elapsed: Duration,
        attempts: usize,
    ) -> Self {
        Self {
            shard_id: shard_id.to_string(),
            success: false,
            raw_payload: String::new(),
            failure_reason: Some(reason.into()),
            failure_kind: Some(kind),
            elapsed_secs: elapsed.as_secs_f64(),
            confidence_hint: 0.0,
            token_usage: None,
            attempts,
            cached: false,
        }
    }
}

/// Successful outcomes keyed by shard fingerprint.
///
/// Entries are only ever added. The cache is shared by handle; its lifetime (one run
/// or the whole process) is up to whoever constructs it.
#[derive(Debug, Default)]
pub struct OutcomeCache {
    entries: Mutex<HashMap<String, AnalysisOutcome>>,
    hits: AtomicUsize,
}

impl OutcomeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<AnalysisOutcome> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let found = entries.get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Stores a successful outcome; failures and already-known keys are ignored.
    pub fn insert(&self, key: String, outcome: AnalysisOutcome) {
        if !outcome.success {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.entry(key).or_insert(outcome);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }
}

/// SHA-256 over the serialized shard plus the analysis kind.
pub fn fingerprint(shard: &Shard, kind: AnalysisKind) -> String {
    let mut hasher = Sha256::new();
    match serde_json::to_vec(shard) {
        Ok(serialized) => hasher.update(&serialized),
        Err(e) => {
            warn!("Could not serialize shard {} for fingerprinting: {}", shard.id, e);
            hasher.update(shard.id.as_bytes());
            for name in shard.entity_names() {
                hasher.update(name.as_bytes());
            }
        }
    }
    hasher.update(kind.as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Caps the number of service calls in flight.
#[derive(Debug, Clone)]
pub struct DispatchGate {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    limit: usize,
}

pub struct GatePermit {
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl DispatchGate {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    pub async fn acquire(&self) -> GatePermit {
        // The semaphore is never closed; acquire failures are not expected.
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("dispatch semaphore closed"));
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(now, Ordering::Relaxed);
        GatePermit {
            permit,
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Highest number of simultaneous permits seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Per-shard call loop with retry; runs inside a spawned task.
struct ShardWorker<C> {
    client: Arc<C>,
    gate: DispatchGate,
    retry_times: usize,
    retry_delay: Duration,
}

impl<C: ReasoningClient> ShardWorker<C> {
    async fn run(&self, shard: &Shard, kind: AnalysisKind) -> AnalysisOutcome {
        let started = Instant::now();
        let max_attempts = self.retry_times.max(1);
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let result: Result<ServiceReply, DispatchError> = {
                let _permit = self.gate.acquire().await;
                self.client.analyze(shard, kind).await
            };

            match result {
                Ok(reply) => {
                    debug!("Shard {} analyzed in {:?} ({} attempts)", shard.id, started.elapsed(), attempt);
                    return AnalysisOutcome::succeeded(&shard.id, reply, started.elapsed(), attempt);
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.retry_delay * attempt as u32;
                    warn!(
                        "Shard {} attempt {}/{} failed: {}; retrying in {:?}",
                        shard.id, attempt, max_attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!("Shard {} failed after {} attempts: {}", shard.id, attempt, err);
                    return AnalysisOutcome::failed(
                        &shard.id,
                        err.to_string(),
                        err.failure_kind(),
                        started.elapsed(),
                        attempt,
                    );
                }
            }
        }
    }
}

/// Runs shards through the reasoning service in batches, with caching and retry.
pub struct Orchestrator<C> {
    client: Arc<C>,
    cache: Arc<OutcomeCache>,
    gate: DispatchGate,
    config: DispatchConfig,
}

impl<C: ReasoningClient + 'static> Orchestrator<C> {
    pub fn new(client: Arc<C>, cache: Arc<OutcomeCache>, config: DispatchConfig) -> Self {
        Self {
            client,
            cache,
            gate: DispatchGate::new(config.max_concurrent_requests),
            config,
        }
    }

    pub fn gate(&self) -> &DispatchGate {
        &self.gate
    }

    pub fn cache(&self) -> &Arc<OutcomeCache> {
        &self.cache
    }

    /// One outcome per shard. Outcomes of one batch arrive in completion order.
    pub async fn dispatch(&self, shards: &[Shard], kind: AnalysisKind) -> Vec<AnalysisOutcome> {
        let batch_size = self.config.batch_size.max(1);
        let total_batches = shards.len().div_ceil(batch_size);
        let mut outcomes = Vec::with_capacity(shards.len());

        info!(
            "Dispatching {} shards in {} batches (max {} concurrent requests)",
            shards.len(),
            total_batches,
            self.gate.limit()
        );

        for (index, batch) in shards.chunks(batch_size).enumerate() {
            if index > 0 {
                debug!("Pausing {:?} before next batch", self.config.batch_delay());
                tokio::time::sleep(self.config.batch_delay()).await;
            }
            info!("Batch {}/{}: {} shards", index + 1, total_batches, batch.len());
            outcomes.extend(self.dispatch_batch(batch, kind).await);
        }

        let succeeded = outcomes.iter().filter(|o| o.success).count();
        info!("Dispatch finished: {}/{} shards succeeded", succeeded, outcomes.len());
        outcomes
    }

    async fn dispatch_batch(&self, batch: &[Shard], kind: AnalysisKind) -> Vec<AnalysisOutcome> {
        let mut outcomes = Vec::with_capacity(batch.len());
        let (tx, mut rx) = mpsc::unbounded_channel::<AnalysisOutcome>();
        let mut keys: HashMap<String, String> = HashMap::new();
        let mut handles: Vec<(String, JoinHandle<()>)> = Vec::new();

        for shard in batch {
            let key = fingerprint(shard, kind);
            if let Some(mut hit) = self.cache.get(&key) {
                debug!("Cache hit for shard {}", shard.id);
                hit.cached = true;
                outcomes.push(hit);
                continue;
            }

            let worker = ShardWorker {
                client: Arc::clone(&self.client),
                gate: self.gate.clone(),
                retry_times: self.config.retry_times,
                retry_delay: self.config.retry_delay(),
            };
            let owned = shard.clone();
            let tx = tx.clone();
            let handle = tokio::spawn(async move {
                let outcome = worker.run(&owned, kind).await;
                let _ = tx.send(outcome);
            });

            keys.insert(shard.id.clone(), key);
            handles.push((shard.id.clone(), handle));
        }
        drop(tx);

        let deadline = tokio::time::Instant::now() + self.config.collect_timeout();
        let mut received: Vec<AnalysisOutcome> = Vec::with_capacity(handles.len());
        let mut timed_out = false;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(outcome)) => received.push(outcome),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Collection deadline of {}s reached with shards still running",
                        self.config.collect_timeout_seconds
                    );
                    timed_out = true;
                    break;
                }
            }
        }

        // Abort what is still running and let every unreported task settle before classifying.
        let early: HashSet<String> = received.iter().map(|o| o.shard_id.clone()).collect();
        let mut cancelled: HashSet<String> = HashSet::new();
        for (shard_id, handle) in handles.iter_mut() {
            if early.contains(shard_id.as_str()) {
                continue;
            }
            if timed_out {
                handle.abort();
            }
            if let Err(err) = handle.await {
                if err.is_cancelled() {
                    cancelled.insert(shard_id.clone());
                }
            }
        }
        while let Ok(outcome) = rx.try_recv() {
            received.push(outcome);
        }

        let mut reported: HashSet<String> = HashSet::new();
        for outcome in received {
            if let Some(key) = keys.get(&outcome.shard_id) {
                self.cache.insert(key.clone(), outcome.clone());
            }
            reported.insert(outcome.shard_id.clone());
            outcomes.push(outcome);
        }

        for (shard_id, _) in handles {
            if reported.contains(&shard_id) {
                continue;
            }
            if cancelled.contains(&shard_id) {
                outcomes.push(AnalysisOutcome::failed(
                    &shard_id,
                    format!("timeout: no result within {}s", self.config.collect_timeout_seconds),
                    FailureKind::Timeout,
                    self.config.collect_timeout(),
                    0,
                ));
            } else {
                warn!("Worker for shard {} exited without reporting", shard_id);
                outcomes.push(AnalysisOutcome::failed(
                    &shard_id,
                    "worker exited without reporting a result",
                    FailureKind::Other,
                    Duration::ZERO,
                    0,
                ));
            }
        }

        outcomes
    }
}
