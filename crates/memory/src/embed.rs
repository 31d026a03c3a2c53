//! Embedding capability: text → fixed-length vector.
//!
//! The store only relies on distance ranking being consistent within one
//! embedder, never on exact vector values.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding backend error: {0}")]
    Backend(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    fn dimension(&self) -> usize;
}

/// Shared embedder handle passed across the engine.
pub type SharedEmbedder = Arc<dyn Embedder>;

/// Embedder backed by an Ollama-compatible `/api/embeddings` endpoint.
pub struct ApiEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dimension: usize,
}

impl ApiEmbedder {
    pub fn new(base_url: &str, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/api/embeddings", base_url.trim_end_matches('/')),
            model: model.into(),
            dimension,
        }
    }
}

#[async_trait]
impl Embedder for ApiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let body = serde_json::json!({ "model": self.model, "prompt": text });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbedError::Backend(e.to_string()))?;
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbedError::Backend(e.to_string()))?;
        let vector = json["embedding"]
            .as_array()
            .ok_or_else(|| EmbedError::Backend("response missing embedding".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Vec<f32>>();
        if vector.len() != self.dimension {
            return Err(EmbedError::Dimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Squared L2 distance between two equal-length vectors.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

// ── Tests ────────────────────────────────────────────────────────────────────
