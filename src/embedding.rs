use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Config, EmbeddingProviderConfig};
use crate::error::StockPilotError;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StockPilotError>;
    fn model(&self) -> &str;
    fn dimension(&self) -> usize;
}

pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dim: usize,
}

pub struct OllamaEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dim: usize,
}

#[derive(Debug, Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

fn infer_default_dim(kind: &str, model: &str) -> usize {
    match kind {
        "openai" => {
            if model.contains("3-large") {
                3072
            } else {
                1536
            }
        }
        "ollama" => 768,
        _ => 1536,
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StockPilotError> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&OpenAiEmbeddingRequest {
                model: &self.model,
                input: text,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StockPilotError::LlmApi(format!(
                "embedding request failed: {body}"
            )));
        }

        let body: OpenAiEmbeddingResponse = response.json().await?;
        let embedding = body
            .data
            .into_iter()
            .next()
            .ok_or_else(|| StockPilotError::LlmApi("empty embedding response".into()))?
            .embedding;
        Ok(embedding)
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StockPilotError> {
        let url = format!("{}/api/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .json(&OllamaEmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StockPilotError::LlmApi(format!(
                "embedding request failed: {body}"
            )));
        }

        let body: OllamaEmbeddingResponse = response.json().await?;
        Ok(body.embedding)
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

/// Same fallback-chain semantics as the chat side, evaluated once at startup
/// and independent of it: chat may run against one back-end and embeddings
/// against another.
pub fn create_embedding_chain(config: &Config) -> Option<Arc<dyn EmbeddingProvider>> {
    for entry in &config.embedding_providers {
        match build_embedding_provider(entry) {
            Ok(provider) => {
                info!(
                    kind = %entry.kind,
                    model = provider.model(),
                    dimension = provider.dimension(),
                    "Selected embedding provider"
                );
                return Some(provider);
            }
            Err(reason) => {
                warn!(kind = %entry.kind, %reason, "Skipping embedding provider");
            }
        }
    }
    None
}

fn build_embedding_provider(
    entry: &EmbeddingProviderConfig,
) -> Result<Arc<dyn EmbeddingProvider>, String> {
    let dim = entry
        .dimension
        .unwrap_or_else(|| infer_default_dim(&entry.kind, &entry.model));
    let client = reqwest::Client::new();

    match entry.kind.as_str() {
        "openai" => {
            if entry.api_key.trim().is_empty() {
                return Err("missing api_key".into());
            }
            Ok(Arc::new(OpenAiEmbeddingProvider {
                client,
                base_url: entry
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".into()),
                api_key: entry.api_key.clone(),
                model: entry.model.clone(),
                dim,
            }))
        }
        "ollama" => Ok(Arc::new(OllamaEmbeddingProvider {
            client,
            base_url: entry
                .base_url
                .clone()
                .unwrap_or_else(|| "http://127.0.0.1:11434".into()),
            model: entry.model.clone(),
            dim,
        })),
        other => Err(format!("unknown provider kind: {other}")),
    }
}
