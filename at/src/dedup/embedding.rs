//! Embedding providers
//!
//! The fine-similarity stage works over dense vectors. Two providers
//! exist: the gateway-backed one (lives with the LLM client) and the
//! hashed TF-IDF one below, which needs no network and serves as the
//! degraded path when the circuit is open.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::DedupError;

/// Produces a dense vector for a text
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, DedupError>;
}

/// Cosine similarity between two dense vectors, clamped to [0, 1]
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

/// Feature-hashed TF-IDF embedder
///
/// Tokens hash into a fixed-width vector weighted by sublinear tf and a
/// running idf estimate accumulated from every embedded document.
pub struct TfIdfEmbedder {
    dims: usize,
    stats: Mutex<CorpusStats>,
}

#[derive(Default)]
struct CorpusStats {
    document_frequency: HashMap<String, usize>,
    documents: usize,
}

fn fnv1a(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| {
            t.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|t| t.chars().count() >= 2)
        .collect()
}

impl TfIdfEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            stats: Mutex::new(CorpusStats::default()),
        }
    }
}

impl Default for TfIdfEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingProvider for TfIdfEmbedder {
    fn name(&self) -> &'static str {
        "tfidf-hashed"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, DedupError> {
        let tokens = tokenize(text);

        let mut tf: HashMap<String, usize> = HashMap::new();
        for token in &tokens {
            *tf.entry(token.clone()).or_insert(0) += 1;
        }

        let mut stats = self.stats.lock().expect("corpus stats lock");
        stats.documents += 1;
        for term in tf.keys() {
            *stats.document_frequency.entry(term.clone()).or_insert(0) += 1;
        }

        let mut vector = vec![0.0f32; self.dims];
        for (term, count) in &tf {
            let df = stats.document_frequency.get(term).copied().unwrap_or(0);
            let idf = ((1.0 + stats.documents as f64) / (1.0 + df as f64)).ln() + 1.0;
            let weight = (1.0 + (*count as f64).ln()) * idf;
            let slot = (fnv1a(term.as_bytes()) % self.dims as u64) as usize;
            vector[slot] += weight as f32;
        }

        // L2 normalize so cosine is a pure direction comparison
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_identical_texts_embed_identically() {
        let embedder = TfIdfEmbedder::default();
        let a = embedder.embed("the pipeline normalizes content").await.unwrap();
        let b = embedder.embed("the pipeline normalizes content").await.unwrap();
        assert!(cosine(&a, &b) > 0.999);
    }

    #[tokio::test]
    async fn test_similar_texts_closer_than_unrelated() {
        let embedder = TfIdfEmbedder::default();
        let base = embedder
            .embed("the scheduler submits collection tasks to the queue")
            .await
            .unwrap();
        let near = embedder
            .embed("the scheduler submits gathering tasks to the queue")
            .await
            .unwrap();
        let far = embedder
            .embed("fresh basil and olive oil make a decent pesto")
            .await
            .unwrap();

        assert!(cosine(&base, &near) > cosine(&base, &far));
    }

    #[tokio::test]
    async fn test_empty_text_embeds_to_zero() {
        let embedder = TfIdfEmbedder::default();
        let v = embedder.embed("").await.unwrap();
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[tokio::test]
    async fn test_vector_is_normalized() {
        let embedder = TfIdfEmbedder::default();
        let v = embedder.embed("some ordinary words to embed").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
