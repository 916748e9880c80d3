//! Multi-strategy deduplication
//!
//! Exact hashes catch byte-identical content, SimHash narrows the field
//! to near-duplicate candidates, and a fine similarity pass decides
//! group membership. Two [`EmbeddingProvider`]s sit behind that pass:
//! the gateway-backed one when it is healthy, the local TF-IDF one
//! otherwise. Degrading to the non-semantic provider flags the
//! document.

pub mod embedding;
pub mod simhash;

pub use embedding::{EmbeddingProvider, TfIdfEmbedder, cosine};
pub use simhash::{hamming_distance, simhash};

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DedupConfig;
use crate::domain::ProcessedDocument;

/// Dedup failures that mark the candidate as failed
#[derive(Debug, Error)]
pub enum DedupError {
    #[error("empty normalized content")]
    EmptyContent,

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("llm circuit open")]
    CircuitOpen,
}

/// Strategy selector
#[derive(Debug, Clone, PartialEq)]
pub enum DedupStrategy {
    HashOnly,
    SemanticOnly {
        similarity_threshold: f64,
    },
    Hybrid {
        similarity_threshold: f64,
        simhash_threshold: u32,
    },
}

impl DedupStrategy {
    pub fn from_config(config: &DedupConfig) -> Result<Self, String> {
        match config.strategy.as_str() {
            "hash-only" => Ok(Self::HashOnly),
            "semantic-only" => Ok(Self::SemanticOnly {
                similarity_threshold: config.similarity_threshold,
            }),
            "hybrid" => Ok(Self::Hybrid {
                similarity_threshold: config.similarity_threshold,
                simhash_threshold: config.simhash_threshold,
            }),
            other => Err(format!("Unknown dedup strategy: {}", other)),
        }
    }
}

/// The four content fingerprints computed per candidate
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHashes {
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub simhash: u64,
}

impl ContentHashes {
    pub fn compute(content: &str) -> Self {
        let bytes = content.as_bytes();
        let sha1 = {
            let mut hasher = Sha1::new();
            hasher.update(bytes);
            hex::encode(hasher.finalize())
        };
        let sha256 = {
            let mut hasher = Sha256::new();
            hasher.update(bytes);
            hex::encode(hasher.finalize())
        };
        Self {
            md5: format!("{:x}", md5::compute(bytes)),
            sha1,
            sha256,
            simhash: simhash(content),
        }
    }
}

/// Outcome of one dedup decision
#[derive(Debug, Clone)]
pub struct DedupDecision {
    pub is_duplicate: bool,
    pub group_id: String,
    pub similarity: f64,
    pub degraded: bool,
    pub method: &'static str,
}

/// The dedup engine
///
/// Holds one provider of each flavor and picks at runtime: `semantic`
/// (gateway-backed) when attached and healthy, `fallback` (TF-IDF)
/// otherwise.
pub struct Deduplicator {
    strategy: DedupStrategy,
    semantic: Option<Arc<dyn EmbeddingProvider>>,
    fallback: Arc<dyn EmbeddingProvider>,
    embed_cache: Mutex<LruCache<String, Vec<f32>>>,
}

/// Group a stored document belongs to; ungrouped documents root their own
fn group_of(doc: &ProcessedDocument) -> String {
    doc.similarity_group_id.clone().unwrap_or_else(|| doc.id.clone())
}

/// Stored fingerprint, recomputed when the document predates hashing
fn stored_simhash(doc: &ProcessedDocument) -> u64 {
    doc.structured_content
        .get("simhash")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| simhash(&doc.content))
}

impl Deduplicator {
    pub fn new(config: &DedupConfig) -> Result<Self, String> {
        let cache_size = NonZeroUsize::new(config.embedding_cache_size.max(1)).expect("nonzero cache size");
        Ok(Self {
            strategy: DedupStrategy::from_config(config)?,
            semantic: None,
            fallback: Arc::new(TfIdfEmbedder::default()),
            embed_cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Attach the gateway-backed embedding provider
    pub fn with_semantic(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.semantic = Some(provider);
        self
    }

    /// Decide whether the candidate duplicates anything in the window,
    /// annotating it with group, score, fingerprints and the degraded
    /// flag
    pub async fn deduplicate(
        &self,
        candidate: &mut ProcessedDocument,
        window: &[ProcessedDocument],
    ) -> Result<DedupDecision, DedupError> {
        if candidate.content.trim().is_empty() {
            return Err(DedupError::EmptyContent);
        }

        let hashes = ContentHashes::compute(&candidate.content);
        candidate
            .structured_content
            .insert("md5".to_string(), serde_json::json!(hashes.md5));
        candidate
            .structured_content
            .insert("sha1".to_string(), serde_json::json!(hashes.sha1));
        candidate
            .structured_content
            .insert("simhash".to_string(), serde_json::json!(hashes.simhash.to_string()));

        // Exact collision on any content hash is a duplicate outright;
        // the hashes are all functions of the same bytes, so sha256
        // equality is the canonical check
        if let Some(existing) = window.iter().find(|d| d.content_hash == hashes.sha256) {
            let group = group_of(existing);
            candidate.mark_duplicate(group.clone(), 1.0);
            debug!(candidate = %candidate.id, group = %group, "Exact hash duplicate");
            return Ok(DedupDecision {
                is_duplicate: true,
                group_id: group,
                similarity: 1.0,
                degraded: false,
                method: "exact-hash",
            });
        }

        let (threshold, near): (f64, Vec<&ProcessedDocument>) = match &self.strategy {
            DedupStrategy::HashOnly => {
                let group = candidate.id.clone();
                candidate.start_group(group.clone());
                return Ok(DedupDecision {
                    is_duplicate: false,
                    group_id: group,
                    similarity: 0.0,
                    degraded: false,
                    method: "hash-only",
                });
            }
            DedupStrategy::SemanticOnly { similarity_threshold } => (*similarity_threshold, window.iter().collect()),
            DedupStrategy::Hybrid {
                similarity_threshold,
                simhash_threshold,
            } => {
                let near = window
                    .iter()
                    .filter(|d| hamming_distance(hashes.simhash, stored_simhash(d)) <= *simhash_threshold)
                    .collect();
                (*similarity_threshold, near)
            }
        };

        if near.is_empty() {
            let group = candidate.id.clone();
            candidate.start_group(group.clone());
            return Ok(DedupDecision {
                is_duplicate: false,
                group_id: group,
                similarity: 0.0,
                degraded: false,
                method: "no-candidates",
            });
        }

        let (scores, degraded, method) = self.fine_similarity(candidate, &near).await;
        candidate.dedup_degraded = degraded;

        // Best score wins; ties resolve to the smallest (oldest) group id
        let mut best: Option<(f64, String)> = None;
        for (doc, score) in near.iter().zip(scores.iter()) {
            let group = group_of(doc);
            let better = match &best {
                None => true,
                Some((best_score, best_group)) => {
                    score > best_score || (*score == *best_score && group < *best_group)
                }
            };
            if better {
                best = Some((*score, group));
            }
        }

        let (best_score, best_group) = best.expect("non-empty candidate set");
        if best_score >= threshold {
            candidate.mark_duplicate(best_group.clone(), best_score);
            debug!(
                candidate = %candidate.id,
                group = %best_group,
                score = best_score,
                method,
                "Near duplicate"
            );
            Ok(DedupDecision {
                is_duplicate: true,
                group_id: best_group,
                similarity: best_score,
                degraded,
                method,
            })
        } else {
            let group = candidate.id.clone();
            candidate.start_group(group.clone());
            Ok(DedupDecision {
                is_duplicate: false,
                group_id: group,
                similarity: best_score,
                degraded,
                method,
            })
        }
    }

    /// Score the candidate against each near neighbor
    ///
    /// Both paths speak [`EmbeddingProvider`]: the semantic provider is
    /// tried first, and any failure downgrades the whole pass to the
    /// TF-IDF provider.
    async fn fine_similarity(
        &self,
        candidate: &ProcessedDocument,
        near: &[&ProcessedDocument],
    ) -> (Vec<f64>, bool, &'static str) {
        if let Some(provider) = &self.semantic {
            match self.provider_scores(provider, candidate, near, true).await {
                Ok(scores) => return (scores, false, "embedding-cosine"),
                Err(e) => {
                    warn!(error = %e, fallback = self.fallback.name(), "Semantic similarity unavailable, degrading");
                }
            }
        }

        // TF-IDF vectors depend on the provider's running corpus stats,
        // so they skip the cache
        let scores = match self.provider_scores(&self.fallback, candidate, near, false).await {
            Ok(scores) => scores,
            Err(e) => {
                warn!(error = %e, "Fallback embedding failed, scoring zero");
                vec![0.0; near.len()]
            }
        };
        // Degraded only when the semantic path exists but failed
        (scores, self.semantic.is_some(), "tfidf-cosine")
    }

    async fn provider_scores(
        &self,
        provider: &Arc<dyn EmbeddingProvider>,
        candidate: &ProcessedDocument,
        near: &[&ProcessedDocument],
        cache: bool,
    ) -> Result<Vec<f64>, DedupError> {
        let candidate_vec = self
            .embed(provider, &candidate.content_hash, &candidate.content, cache)
            .await?;
        let mut scores = Vec::with_capacity(near.len());
        for doc in near {
            let vec = self.embed(provider, &doc.content_hash, &doc.content, cache).await?;
            scores.push(cosine(&candidate_vec, &vec));
        }
        Ok(scores)
    }

    async fn embed(
        &self,
        provider: &Arc<dyn EmbeddingProvider>,
        content_hash: &str,
        content: &str,
        cache: bool,
    ) -> Result<Vec<f32>, DedupError> {
        if cache
            && let Some(hit) = self.embed_cache.lock().expect("embed cache lock").get(content_hash)
        {
            return Ok(hit.clone());
        }
        let vector = provider.embed(content).await?;
        if cache {
            self.embed_cache
                .lock()
                .expect("embed cache lock")
                .put(content_hash.to_string(), vector.clone());
        }
        Ok(vector)
    }
}
