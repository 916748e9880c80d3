//! Adaptive LLM gateway
//!
//! A queued, concurrency-controlled front-end to the local inference
//! service: the client speaks the service's HTTP API, the queue owns
//! prioritization, caching and deadlines, and the adaptive controller
//! owns the queue's concurrency and circuit breaker.

pub mod client;
pub mod controller;
mod error;
pub mod queue;
mod types;

pub use client::LlmClient;
pub use controller::{AdaptiveController, ControllerState, HostSample, HostSampler, SysinfoSampler};
pub use error::LlmError;
pub use queue::{
    CircuitState, ClientExecutor, GatewayControl, LlmQueue, LlmQueueStats, LlmTask, LlmTaskKind, WindowStats,
};
pub use types::{Completion, GenerateChunk, GenerateParams, Health, ModelInfo};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::dedup::{DedupError, EmbeddingProvider};
use crate::domain::Priority;

/// How long a dedup embedding may wait in the gateway queue
const EMBED_DEADLINE: Duration = Duration::from_secs(30);

/// Embedding provider backed by the gateway queue
///
/// The deduplicator's semantic path: submissions carry a deadline so a
/// congested gateway makes dedup fall back instead of stalling the
/// pipeline.
pub struct GatewayEmbedder {
    queue: Arc<LlmQueue>,
}

impl GatewayEmbedder {
    pub fn new(queue: Arc<LlmQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl EmbeddingProvider for GatewayEmbedder {
    fn name(&self) -> &'static str {
        "gateway-embeddings"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, DedupError> {
        let payload = serde_json::json!({ "text": text });
        let result = self
            .queue
            .submit_wait(LlmTaskKind::SemanticDedup, Priority::High, payload, Some(EMBED_DEADLINE))
            .await
            .map_err(|e| match e {
                LlmError::CircuitOpen => DedupError::CircuitOpen,
                other => DedupError::Embedding(other.to_string()),
            })?;

        let vector: Vec<f32> = result["embedding"]
            .as_array()
            .map(|values| values.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
            .unwrap_or_default();
        if vector.is_empty() {
            return Err(DedupError::Embedding("gateway returned an empty embedding".to_string()));
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::queue::LlmExecutor;

    struct EchoExecutor;

    #[async_trait]
    impl LlmExecutor for EchoExecutor {
        async fn execute(
            &self,
            _kind: LlmTaskKind,
            _payload: &serde_json::Value,
        ) -> Result<serde_json::Value, LlmError> {
            Ok(serde_json::json!({ "embedding": [0.5, 0.5, 0.0] }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_embedder_roundtrip() {
        let queue = LlmQueue::start(Arc::new(EchoExecutor), 1, 16);
        let embedder = GatewayEmbedder::new(queue);

        let vector = embedder.embed("some text").await.unwrap();
        assert_eq!(vector, vec![0.5, 0.5, 0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_embedder_circuit_open_maps() {
        let queue = LlmQueue::start(Arc::new(EchoExecutor), 1, 16);
        queue.set_circuit(CircuitState::Open).await;
        let embedder = GatewayEmbedder::new(queue);

        let err = embedder.embed("text").await.unwrap_err();
        assert!(matches!(err, DedupError::CircuitOpen));
    }
}
