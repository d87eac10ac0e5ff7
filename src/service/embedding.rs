//! Embedding and rerank backend client.
//!
//! Speaks the OpenAI-compatible `/embeddings` endpoint plus a Cohere-style
//! `/rerank` endpoint. Vectors are 1024-dimensional.

use serde_json::{json, Value};
use std::time::Duration;

use crate::error::{AppError, Result};

pub const EMBEDDING_DIM: usize = 1024;

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub rerank_model: String,
    pub timeout_secs: u64,
}

pub struct EmbeddingClient {
    client: reqwest::Client,
    config: EmbeddingConfig,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .expect("Failed to create HTTP client"),
            config,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::embedding("empty embedding response"))
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!(
                "{}/embeddings",
                self.config.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "model": self.config.model, "input": texts }))
            .send()
            .await
            .map_err(|e| AppError::embedding(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::embedding(format!(
                "embedding backend returned {}",
                status
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| AppError::embedding(e.to_string()))?;
        let data = payload["data"]
            .as_array()
            .ok_or_else(|| AppError::embedding("response missing data array"))?;

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item["embedding"]
                .as_array()
                .ok_or_else(|| AppError::embedding("item missing embedding"))?
                .iter()
                .filter_map(Value::as_f64)
                .map(|f| f as f32)
                .collect::<Vec<f32>>();
            if embedding.len() != EMBEDDING_DIM {
                return Err(AppError::embedding(format!(
                    "expected {}-dim vector, got {}",
                    EMBEDDING_DIM,
                    embedding.len()
                )));
            }
            vectors.push(embedding);
        }

        if vectors.len() != texts.len() {
            return Err(AppError::embedding(format!(
                "asked for {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }

    /// Rerank documents against a query. Returns (document index, score)
    /// sorted by descending score.
    pub async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<(usize, f64)>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!(
                "{}/rerank",
                self.config.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.config.rerank_model,
                "query": query,
                "documents": documents,
            }))
            .send()
            .await
            .map_err(|e| AppError::embedding(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::embedding(format!(
                "rerank backend returned {}",
                status
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| AppError::embedding(e.to_string()))?;
        let results = payload["results"]
            .as_array()
            .ok_or_else(|| AppError::embedding("rerank response missing results"))?;

        let mut ranked: Vec<(usize, f64)> = results
            .iter()
            .filter_map(|item| {
                let index = item["index"].as_u64()? as usize;
                let score = item["relevance_score"].as_f64()?;
                Some((index, score))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn config(base_url: String) -> EmbeddingConfig {
        EmbeddingConfig {
            base_url,
            api_key: "test".into(),
            model: "embed-v3".into(),
            rerank_model: "rerank-v3".into(),
            timeout_secs: 10,
        }
    }

    fn vector_json() -> String {
        let vector: Vec<String> = (0..EMBEDDING_DIM).map(|i| format!("{}.0", i % 3)).collect();
        format!("[{}]", vector.join(","))
    }

    #[tokio::test]
    async fn embed_batch_returns_vectors_in_order() {
        let mut server = Server::new_async().await;
        let body = format!(
            r#"{{"data": [{{"index": 0, "embedding": {v}}}, {{"index": 1, "embedding": {v}}}]}}"#,
            v = vector_json()
        );
        let _m = server
            .mock("POST", "/embeddings")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let client = EmbeddingClient::new(config(server.url()));
        let vectors = client
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), EMBEDDING_DIM);
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/embeddings")
            .with_status(200)
            .with_body(r#"{"data": [{"index": 0, "embedding": [1.0, 2.0]}]}"#)
            .create_async()
            .await;

        let client = EmbeddingClient::new(config(server.url()));
        let err = client.embed("a").await.unwrap_err();
        assert!(matches!(err, AppError::Embedding(_)));
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let client = EmbeddingClient::new(config("http://localhost:1".into()));
        assert!(client.embed_batch(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rerank_sorts_by_score_descending() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/rerank")
            .with_status(200)
            .with_body(
                r#"{"results": [
                    {"index": 0, "relevance_score": 0.2},
                    {"index": 1, "relevance_score": 0.9},
                    {"index": 2, "relevance_score": 0.5}
                ]}"#,
            )
            .create_async()
            .await;

        let client = EmbeddingClient::new(config(server.url()));
        let ranked = client
            .rerank("query", &["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();

        assert_eq!(ranked[0], (1, 0.9));
        assert_eq!(ranked[1], (2, 0.5));
        assert_eq!(ranked[2], (0, 0.2));
    }
}
