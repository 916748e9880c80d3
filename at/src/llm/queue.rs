//! Gateway task queue
//!
//! Same heap discipline as the main task queue, dedicated to inference
//! work. Concurrency is dynamic and owned by the adaptive controller; a
//! result cache keyed by (task kind, payload hash) short-circuits
//! identical submissions; tasks carry deadlines and are never
//! dispatched late.

use std::collections::{BinaryHeap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{Priority, new_id};

use super::client::LlmClient;
use super::error::LlmError;
use super::types::GenerateParams;

/// Window of recent outcomes the controller samples
const OUTCOME_WINDOW: usize = 100;

/// Kind of inference work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmTaskKind {
    Generate,
    Embed,
    SemanticDedup,
    BatchProcess,
}

impl std::fmt::Display for LlmTaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generate => write!(f, "generate"),
            Self::Embed => write!(f, "embed"),
            Self::SemanticDedup => write!(f, "semantic_dedup"),
            Self::BatchProcess => write!(f, "batch_process"),
        }
    }
}

/// Circuit breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// One queued inference task
#[derive(Debug)]
pub struct LlmTask {
    pub id: String,
    pub kind: LlmTaskKind,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub cache_key: String,
    pub deadline: Option<Instant>,
}

/// Executes one task's payload against the inference service
#[async_trait]
pub trait LlmExecutor: Send + Sync {
    async fn execute(&self, kind: LlmTaskKind, payload: &serde_json::Value) -> Result<serde_json::Value, LlmError>;
}

/// Executor backed by the real client
pub struct ClientExecutor {
    client: Arc<LlmClient>,
}

impl ClientExecutor {
    pub fn new(client: Arc<LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LlmExecutor for ClientExecutor {
    async fn execute(&self, kind: LlmTaskKind, payload: &serde_json::Value) -> Result<serde_json::Value, LlmError> {
        match kind {
            LlmTaskKind::Generate => {
                let prompt = payload["prompt"].as_str().unwrap_or_default();
                let params: GenerateParams = payload
                    .get("params")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| LlmError::Protocol(e.to_string()))?
                    .unwrap_or_default();
                let completion = self.client.generate(prompt, &params).await?;
                Ok(serde_json::json!({
                    "text": completion.text,
                    "model": completion.model,
                    "completion_tokens": completion.completion_tokens,
                }))
            }
            LlmTaskKind::Embed | LlmTaskKind::SemanticDedup => {
                let text = payload["text"].as_str().unwrap_or_default().to_string();
                let vectors = self.client.embed(&[text]).await?;
                Ok(serde_json::json!({ "embedding": vectors.into_iter().next().unwrap_or_default() }))
            }
            LlmTaskKind::BatchProcess => {
                let prompts = payload["prompts"].as_array().cloned().unwrap_or_default();
                let mut outputs = Vec::with_capacity(prompts.len());
                for prompt in prompts {
                    let prompt = prompt.as_str().unwrap_or_default();
                    let completion = self.client.generate(prompt, &GenerateParams::default()).await?;
                    outputs.push(serde_json::json!(completion.text));
                }
                Ok(serde_json::json!({ "outputs": outputs }))
            }
        }
    }
}

struct QueuedLlm {
    task: LlmTask,
    reply: oneshot::Sender<Result<serde_json::Value, LlmError>>,
    seq: u64,
}

impl Eq for QueuedLlm {}

impl PartialEq for QueuedLlm {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.seq == other.seq
    }
}

impl Ord for QueuedLlm {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .task
            .priority
            .cmp(&self.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedLlm {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Aggregate queue counters
#[derive(Debug, Default, Clone, Copy)]
pub struct LlmQueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub rejected: u64,
    pub expired: u64,
}

/// Controller-visible window sample
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowStats {
    pub error_rate: f64,
    pub p95_latency_ms: u64,
    pub depth: usize,
    pub active: usize,
}

struct Inner {
    heap: BinaryHeap<QueuedLlm>,
    seq: u64,
    concurrency: usize,
    active: usize,
    circuit: CircuitState,
    cache: LruCache<String, serde_json::Value>,
    recent: VecDeque<(bool, Duration)>,
    stats: LlmQueueStats,
    inflight_token: CancellationToken,
    shutdown: bool,
}

/// The gateway queue
pub struct LlmQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    executor: Arc<dyn LlmExecutor>,
}

/// Cache key: task kind and payload hash
pub fn cache_key(kind: LlmTaskKind, payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

impl LlmQueue {
    /// Create the queue and start its dispatcher
    pub fn start(executor: Arc<dyn LlmExecutor>, initial_concurrency: usize, cache_size: usize) -> Arc<Self> {
        let queue = Arc::new(Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                seq: 0,
                concurrency: initial_concurrency.max(1),
                active: 0,
                circuit: CircuitState::Closed,
                cache: LruCache::new(NonZeroUsize::new(cache_size.max(1)).expect("nonzero cache")),
                recent: VecDeque::new(),
                stats: LlmQueueStats::default(),
                inflight_token: CancellationToken::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
            executor,
        });

        let dispatcher = Arc::clone(&queue);
        tokio::spawn(async move { dispatcher.dispatch_loop().await });
        queue
    }

    /// Submit a task; the receiver resolves with the result
    ///
    /// Rejected immediately with `CircuitOpen` while the breaker is
    /// open. Identical cache keys share the stored result.
    pub async fn submit(
        &self,
        kind: LlmTaskKind,
        priority: Priority,
        payload: serde_json::Value,
        deadline: Option<Duration>,
    ) -> Result<oneshot::Receiver<Result<serde_json::Value, LlmError>>, LlmError> {
        let key = cache_key(kind, &payload);
        let (tx, rx) = oneshot::channel();

        {
            let mut inner = self.inner.lock().await;
            if inner.shutdown {
                return Err(LlmError::Shutdown);
            }
            if inner.circuit == CircuitState::Open {
                inner.stats.rejected += 1;
                debug!(kind = %kind, "Submission rejected, circuit open");
                return Err(LlmError::CircuitOpen);
            }
            if let Some(hit) = inner.cache.get(&key).cloned() {
                inner.stats.cache_hits += 1;
                let _ = tx.send(Ok(hit));
                return Ok(rx);
            }

            inner.seq += 1;
            inner.stats.submitted += 1;
            let seq = inner.seq;
            inner.heap.push(QueuedLlm {
                task: LlmTask {
                    id: new_id(),
                    kind,
                    priority,
                    payload,
                    cache_key: key,
                    deadline: deadline.map(|d| Instant::now() + d),
                },
                reply: tx,
                seq,
            });
        }

        self.notify.notify_one();
        Ok(rx)
    }

    /// Submit and wait for the result
    pub async fn submit_wait(
        &self,
        kind: LlmTaskKind,
        priority: Priority,
        payload: serde_json::Value,
        deadline: Option<Duration>,
    ) -> Result<serde_json::Value, LlmError> {
        let rx = self.submit(kind, priority, payload, deadline).await?;
        rx.await.map_err(|_| LlmError::Shutdown)?
    }

    async fn dispatch_loop(self: Arc<Self>) {
        debug!("Gateway dispatcher started");
        loop {
            let work = {
                let mut inner = self.inner.lock().await;
                if inner.shutdown {
                    break;
                }
                if inner.active < inner.concurrency {
                    match inner.heap.pop() {
                        Some(queued) => {
                            // Late tasks are never dispatched
                            if queued.task.deadline.is_some_and(|d| d <= Instant::now()) {
                                inner.stats.expired += 1;
                                warn!(task_id = %queued.task.id, "Task deadline elapsed, dropping");
                                let _ = queued.reply.send(Err(LlmError::DeadlineElapsed));
                                continue;
                            }
                            inner.active += 1;
                            Some((queued, inner.inflight_token.clone()))
                        }
                        None => None,
                    }
                } else {
                    None
                }
            };

            match work {
                Some((queued, token)) => {
                    let queue = Arc::clone(&self);
                    tokio::spawn(async move { queue.run_task(queued, token).await });
                }
                None => self.notify.notified().await,
            }
        }
        debug!("Gateway dispatcher stopped");
    }

    async fn run_task(self: Arc<Self>, queued: QueuedLlm, token: CancellationToken) {
        let started = Instant::now();
        let result = tokio::select! {
            _ = token.cancelled() => Err(LlmError::Shutdown),
            result = self.executor.execute(queued.task.kind, &queued.task.payload) => result,
        };
        let latency = started.elapsed();

        {
            let mut inner = self.inner.lock().await;
            inner.active -= 1;
            inner.recent.push_back((result.is_ok(), latency));
            while inner.recent.len() > OUTCOME_WINDOW {
                inner.recent.pop_front();
            }
            match &result {
                Ok(value) => {
                    inner.stats.completed += 1;
                    inner.cache.put(queued.task.cache_key.clone(), value.clone());
                }
                Err(_) => inner.stats.errors += 1,
            }
        }

        let _ = queued.reply.send(result);
        self.notify.notify_one();
    }

    /// Drop the queue: reject pending work and stop the dispatcher
    pub async fn shutdown(&self) {
        let pending: Vec<QueuedLlm> = {
            let mut inner = self.inner.lock().await;
            inner.shutdown = true;
            inner.inflight_token.cancel();
            inner.heap.drain().collect()
        };
        for queued in pending {
            let _ = queued.reply.send(Err(LlmError::Shutdown));
        }
        self.notify.notify_waiters();
    }

    pub async fn stats(&self) -> LlmQueueStats {
        self.inner.lock().await.stats
    }

    pub async fn depth(&self) -> usize {
        self.inner.lock().await.heap.len()
    }
}

/// The knobs the adaptive controller turns
#[async_trait]
pub trait GatewayControl: Send + Sync {
    async fn set_concurrency(&self, n: usize);
    async fn concurrency(&self) -> usize;
    async fn set_circuit(&self, state: CircuitState);
    async fn circuit(&self) -> CircuitState;
    async fn cancel_in_flight(&self);
    async fn window(&self) -> WindowStats;
}

#[async_trait]
impl GatewayControl for LlmQueue {
    async fn set_concurrency(&self, n: usize) {
        let mut inner = self.inner.lock().await;
        inner.concurrency = n;
        drop(inner);
        self.notify.notify_waiters();
    }

    async fn concurrency(&self) -> usize {
        self.inner.lock().await.concurrency
    }

    async fn set_circuit(&self, state: CircuitState) {
        let mut inner = self.inner.lock().await;
        inner.circuit = state;
        drop(inner);
        self.notify.notify_waiters();
    }

    async fn circuit(&self) -> CircuitState {
        self.inner.lock().await.circuit
    }

    async fn cancel_in_flight(&self) {
        let mut inner = self.inner.lock().await;
        let token = std::mem::replace(&mut inner.inflight_token, CancellationToken::new());
        drop(inner);
        token.cancel();
    }

    async fn window(&self) -> WindowStats {
        let inner = self.inner.lock().await;
        let total = inner.recent.len();
        let error_rate = if total == 0 {
            0.0
        } else {
            inner.recent.iter().filter(|(ok, _)| !ok).count() as f64 / total as f64
        };
        let p95_latency_ms = {
            let mut latencies: Vec<u64> = inner.recent.iter().map(|(_, l)| l.as_millis() as u64).collect();
            latencies.sort_unstable();
            if latencies.is_empty() {
                0
            } else {
                let idx = ((latencies.len() as f64 - 1.0) * 0.95).round() as usize;
                latencies[idx]
            }
        };
        WindowStats {
            error_rate,
            p95_latency_ms,
            depth: inner.heap.len(),
            active: inner.active,
        }
    }
}
