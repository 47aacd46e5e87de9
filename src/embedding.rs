//! Embedding providers
//!
//! The engine only needs `text -> vector` of a fixed dimensionality.
//! Failures are returned to the caller, which degrades to a cache miss.

use crate::error::EngineError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, error};

const GEMINI_EMBEDDING_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/text-embedding-004:embedContent";

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimension(&self) -> usize;
}

/// Cosine similarity in [-1, 1]; 0.0 for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

//
// ================= Hashing (offline) =================
//

/// Deterministic feature-hashed bag-of-words embeddings.
///
/// Keeps the engine functional without a model endpoint: identical token
/// multisets map to identical vectors, overlapping ones score high.
pub struct HashingEmbeddingProvider {
    dimension: usize,
}

impl HashingEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn project(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        if self.dimension == 0 {
            return vector;
        }

        let lowered = text.to_lowercase();
        let tokens = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty());

        for token in tokens {
            let digest = Sha256::digest(token.as_bytes());
            let mut index_bytes = [0u8; 8];
            index_bytes.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(index_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in vector.iter_mut() {
                *value /= norm;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EngineError::Embedding("cannot embed empty text".to_string()));
        }
        Ok(self.project(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

//
// ================= Gemini =================
//

/// Gemini `text-embedding-004` client (connection-pooled)
pub struct GeminiEmbeddingProvider {
    client: Client,
    api_key: String,
    base_url: String,
    dimension: usize,
}

impl GeminiEmbeddingProvider {
    pub fn new(api_key: String, dimension: usize) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: GEMINI_EMBEDDING_URL.to_string(),
            dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.api_key.is_empty() {
            return Err(EngineError::Embedding(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let request = EmbedRequest {
            model: "models/text-embedding-004".to_string(),
            content: EmbedContent {
                parts: vec![EmbedPart {
                    text: text.to_string(),
                }],
            },
        };

        let url = format!("{}?key={}", self.base_url, self.api_key);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Embedding request failed: {}", e);
                EngineError::Embedding(format!("request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Embedding(format!(
                "embedding endpoint returned {}: {}",
                status, body
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Embedding(format!("invalid embedding response: {}", e)))?;

        debug!(dimension = parsed.embedding.values.len(), "Embedding received");
        Ok(parsed.embedding.values)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: EmbedContent,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbedValues,
}

#[derive(Debug, Deserialize)]
struct EmbedValues {
    values: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 0.001);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_hashing_provider_is_deterministic() {
        let provider = HashingEmbeddingProvider::new(64);
        let a = provider.embed("price of AAPL").await.unwrap();
        let b = provider.embed("Price of AAPL?").await.unwrap();
        assert_eq!(a.len(), 64);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hashing_provider_separates_unrelated_text() {
        let provider = HashingEmbeddingProvider::new(256);
        let a = provider.embed("price of AAPL").await.unwrap();
        let b = provider.embed("latest filings for tesla motors").await.unwrap();
        assert!(cosine_similarity(&a, &b) < 0.5);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let provider = HashingEmbeddingProvider::new(16);
        assert!(provider.embed("   ").await.is_err());
    }

    #[test]
    fn test_request_serialization() {
        let request = EmbedRequest {
            model: "models/text-embedding-004".to_string(),
            content: EmbedContent {
                parts: vec![EmbedPart {
                    text: "What is RSI?".to_string(),
                }],
            },
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("What is RSI?"));
    }
}
