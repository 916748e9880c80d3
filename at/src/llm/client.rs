//! Client for the local inference service
//!
//! Endpoints: `/api/generate` (blocking and streaming newline-delimited
//! JSON frames, terminated by a `done: true` frame), `/api/embeddings`,
//! `/api/tags`, `/api/show`. A semaphore bounds concurrent requests;
//! only connection errors are retried here (the queue above owns task
//! retries).

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::GatewayConfig;

use super::error::LlmError;
use super::types::{
    Completion, EmbeddingsRequest, EmbeddingsResponse, GenerateChunk, GenerateFrame, GenerateParams, GenerateRequest,
    Health, ModelInfo, TagsResponse,
};

const CONNECT_RETRIES: u32 = 3;

/// Thin HTTP client for the inference service
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    embed_model: String,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

fn classify(e: reqwest::Error, timeout: Duration) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(timeout)
    } else if e.is_connect() {
        LlmError::Connection(e.to_string())
    } else if e.is_decode() {
        LlmError::Protocol(e.to_string())
    } else {
        LlmError::Connection(e.to_string())
    }
}

impl LlmClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, LlmError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Protocol(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            embed_model: config.embed_model.clone(),
            permits: Arc::new(Semaphore::new(config.max_connections)),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST with connection-error retries, returning the raw response
    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response, LlmError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LlmError::Shutdown)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.http.post(self.url(path)).json(body).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status >= 400 {
                        let message = response.text().await.unwrap_or_default();
                        if status >= 500 {
                            return Err(LlmError::ServerError { status, message });
                        }
                        return Err(LlmError::Protocol(format!("status {}: {}", status, message)));
                    }
                    return Ok(response);
                }
                Err(e) => {
                    let error = classify(e, self.timeout);
                    if error.is_retryable() && attempt < CONNECT_RETRIES {
                        warn!(path, attempt, error = %error, "Connection failed, retrying");
                        tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Blocking generation
    pub async fn generate(&self, prompt: &str, params: &GenerateParams) -> Result<Completion, LlmError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: params.to_wire(),
        };
        let body = serde_json::to_value(&request).map_err(|e| LlmError::Protocol(e.to_string()))?;

        let response = self.post_json("/api/generate", &body).await?;
        let frame: GenerateFrame = response.json().await.map_err(|e| classify(e, self.timeout))?;

        Ok(Completion {
            text: frame.response,
            model: frame.model,
            done_reason: frame.done_reason,
            prompt_tokens: frame.prompt_eval_count.unwrap_or(0),
            completion_tokens: frame.eval_count.unwrap_or(0),
            total_duration_ms: frame.total_duration.unwrap_or(0) / 1_000_000,
        })
    }

    /// Streaming generation: chunks go to `tx`, the assembled completion
    /// is returned once the terminating frame arrives
    pub async fn stream_generate(
        &self,
        prompt: &str,
        params: &GenerateParams,
        tx: mpsc::Sender<GenerateChunk>,
    ) -> Result<Completion, LlmError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: true,
            options: params.to_wire(),
        };
        let body = serde_json::to_value(&request).map_err(|e| LlmError::Protocol(e.to_string()))?;

        let response = self.post_json("/api/generate", &body).await?;
        let mut stream = response.bytes_stream();

        let mut completion = Completion::default();
        let mut buffer = Vec::new();
        let mut finished = false;

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify(e, self.timeout))?;
            buffer.extend_from_slice(&chunk);

            // Frames are newline-delimited JSON objects
            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let frame: GenerateFrame =
                    serde_json::from_str(line).map_err(|e| LlmError::Protocol(format!("bad frame: {}", e)))?;

                if !frame.response.is_empty() {
                    completion.text.push_str(&frame.response);
                    let _ = tx
                        .send(GenerateChunk {
                            text: frame.response,
                            done: false,
                        })
                        .await;
                }
                if frame.done {
                    completion.model = frame.model;
                    completion.done_reason = frame.done_reason;
                    completion.prompt_tokens = frame.prompt_eval_count.unwrap_or(0);
                    completion.completion_tokens = frame.eval_count.unwrap_or(0);
                    completion.total_duration_ms = frame.total_duration.unwrap_or(0) / 1_000_000;
                    finished = true;
                    break 'outer;
                }
            }
        }

        if !finished {
            return Err(LlmError::Protocol("stream ended without a done frame".to_string()));
        }
        let _ = tx
            .send(GenerateChunk {
                text: String::new(),
                done: true,
            })
            .await;
        Ok(completion)
    }

    /// Embed a batch of texts (the service takes one prompt at a time)
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let request = EmbeddingsRequest {
                model: &self.embed_model,
                prompt: text,
            };
            let body = serde_json::to_value(&request).map_err(|e| LlmError::Protocol(e.to_string()))?;
            let response = self.post_json("/api/embeddings", &body).await?;
            let parsed: EmbeddingsResponse = response.json().await.map_err(|e| classify(e, self.timeout))?;
            vectors.push(parsed.embedding);
        }
        Ok(vectors)
    }

    /// Probe the service
    pub async fn health(&self) -> Health {
        let started = Instant::now();
        match self.list_models().await {
            Ok(models) => Health {
                healthy: true,
                latency: started.elapsed(),
                models: models.len(),
            },
            Err(e) => {
                debug!(error = %e, "Health probe failed");
                Health {
                    healthy: false,
                    latency: started.elapsed(),
                    models: 0,
                }
            }
        }
    }

    /// Installed models
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LlmError::Shutdown)?;
        let response = self
            .http
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(|e| classify(e, self.timeout))?;
        if !response.status().is_success() {
            return Err(LlmError::ServerError {
                status: response.status().as_u16(),
                message: String::new(),
            });
        }
        let parsed: TagsResponse = response.json().await.map_err(|e| classify(e, self.timeout))?;
        Ok(parsed.models)
    }

    /// Model details passthrough
    pub async fn show_model(&self, name: &str) -> Result<serde_json::Value, LlmError> {
        let body = serde_json::json!({ "name": name });
        let response = self.post_json("/api/show", &body).await?;
        response.json().await.map_err(|e| classify(e, self.timeout))
    }
}
