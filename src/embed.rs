//! Embedding and classification capability clients
//!
//! Two narrow interfaces consumed by the catalog, classifier service, and
//! search engine:
//! - [`Embedder`]: text -> fixed-dimension vector
//! - [`ClassifierClient`]: tool descriptor -> ranked skill predictions
//!
//! Each has a remote HTTP implementation and a deterministic local one. The
//! local embedder hashes tokens through BLAKE3's extendable output and
//! averages per-token vectors, so texts sharing vocabulary land near each
//! other and offline runs stay reproducible.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("Embedding request failed: {0}")]
    RequestFailed(String),

    #[error("Malformed embedding response: {0}")]
    BadResponse(String),

    #[error("Classification request failed: {0}")]
    ClassifyFailed(String),
}

pub type Result<T> = std::result::Result<T, EmbedError>;

/// Text embedding capability
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn dim(&self) -> usize;
}

/// Tool descriptor handed to the classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_summary: Option<String>,
}

/// Candidate skill handed to the classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub keywords: Vec<String>,
}

/// Ranked prediction returned by the classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillPrediction {
    pub skill_id: String,
    pub confidence: f64,
}

/// Skill classification capability
#[async_trait]
pub trait ClassifierClient: Send + Sync {
    async fn classify(
        &self,
        tool: &ToolDescriptor,
        candidates: &[SkillSummary],
    ) -> Result<Vec<SkillPrediction>>;
}

// ----------------------------------------------------------------------
// Remote implementations
// ----------------------------------------------------------------------

/// Remote embedding endpoint client.
///
/// POSTs `{model, input}` and expects `{embedding: [f32; dim]}`.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dim: usize,
}

impl HttpEmbedder {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, dim: usize) -> Self {
        HttpEmbedder {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            dim,
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "model": self.model,
                "input": text,
            }))
            .send()
            .await
            .map_err(|e| EmbedError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EmbedError::RequestFailed(format!(
                "HTTP {} from embedding endpoint",
                response.status()
            )));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::BadResponse(e.to_string()))?;

        if body.embedding.len() != self.dim {
            return Err(EmbedError::BadResponse(format!(
                "expected {} dimensions, got {}",
                self.dim,
                body.embedding.len()
            )));
        }
        Ok(body.embedding)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Remote classification endpoint client.
///
/// POSTs `{model, tool, candidates}` and expects
/// `{assignments: [{skill_id, confidence}]}`.
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        HttpClassifier {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
        }
    }
}

#[derive(Deserialize)]
struct ClassifyResponse {
    assignments: Vec<SkillPrediction>,
}

#[async_trait]
impl ClassifierClient for HttpClassifier {
    async fn classify(
        &self,
        tool: &ToolDescriptor,
        candidates: &[SkillSummary],
    ) -> Result<Vec<SkillPrediction>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "model": self.model,
                "tool": tool,
                "candidates": candidates,
            }))
            .send()
            .await
            .map_err(|e| EmbedError::ClassifyFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EmbedError::ClassifyFailed(format!(
                "HTTP {} from classifier endpoint",
                response.status()
            )));
        }

        let body: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::BadResponse(e.to_string()))?;
        Ok(body.assignments)
    }
}

// ----------------------------------------------------------------------
// Deterministic local implementations
// ----------------------------------------------------------------------

/// Lowercase alphanumeric tokenization shared by the local embedder and the
/// heuristic classifier.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Deterministic token-hash embedder.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        HashEmbedder { dim }
    }

    fn token_vector(&self, token: &str) -> Vec<f32> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(token.as_bytes());
        let mut reader = hasher.finalize_xof();

        let mut bytes = vec![0u8; self.dim];
        reader.fill(&mut bytes);
        bytes
            .into_iter()
            .map(|b| (b as f32 / 127.5) - 1.0)
            .collect()
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let tokens = tokenize(text);
        let mut sum = vec![0.0f32; self.dim];
        if tokens.is_empty() {
            return Ok(sum);
        }

        for token in &tokens {
            for (acc, v) in sum.iter_mut().zip(self.token_vector(token)) {
                *acc += v;
            }
        }

        let norm: f32 = sum.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in sum.iter_mut() {
                *v /= norm;
            }
        }
        Ok(sum)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Keyword-overlap heuristic classifier used when no remote endpoint is
/// configured. Confidence is the fraction of a skill's keyword set present in
/// the tool text.
pub struct KeywordClassifier;

#[async_trait]
impl ClassifierClient for KeywordClassifier {
    async fn classify(
        &self,
        tool: &ToolDescriptor,
        candidates: &[SkillSummary],
    ) -> Result<Vec<SkillPrediction>> {
        let mut text = format!("{} {}", tool.name, tool.description);
        if let Some(summary) = &tool.schema_summary {
            text.push(' ');
            text.push_str(summary);
        }
        let tool_tokens: HashSet<String> = tokenize(&text).into_iter().collect();

        let mut predictions: Vec<SkillPrediction> = candidates
            .iter()
            .filter_map(|skill| {
                let mut keywords: HashSet<String> = skill
                    .keywords
                    .iter()
                    .flat_map(|k| tokenize(k))
                    .collect();
                keywords.extend(tokenize(&skill.name));
                if keywords.is_empty() {
                    return None;
                }
                let hits = keywords.iter().filter(|k| tool_tokens.contains(*k)).count();
                if hits == 0 {
                    return None;
                }
                Some(SkillPrediction {
                    skill_id: skill.id.clone(),
                    confidence: hits as f64 / keywords.len() as f64,
                })
            })
            .collect();

        predictions.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.skill_id.cmp(&b.skill_id))
        });

        debug!(
            tool = %tool.name,
            predictions = predictions.len(),
            "heuristic classification"
        );
        Ok(predictions)
    }
}
