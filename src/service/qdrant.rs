//! Vector index client (Qdrant REST API).
//!
//! Points are keyed by extraction id, which makes upserts and deletes
//! idempotent: recovery can re-upsert and cleanup can re-delete freely.

use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, Result};

pub const COLLECTION_NAME: &str = "extractions";

/// One point to upsert: vector plus filterable payload.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// One search hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: Uuid,
    pub score: f64,
}

pub struct QdrantClient {
    client: reqwest::Client,
    base_url: String,
    collection: String,
}

impl QdrantClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: COLLECTION_NAME.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_collection(mut self, collection: &str) -> Self {
        self.collection = collection.to_string();
        self
    }

    /// Create the collection if missing (cosine distance).
    pub async fn init_collection(&self, dim: usize) -> Result<()> {
        let response = self
            .client
            .put(format!("{}/collections/{}", self.base_url, self.collection))
            .json(&json!({
                "vectors": { "size": dim, "distance": "Cosine" }
            }))
            .send()
            .await
            .map_err(|e| AppError::vector(e.to_string()))?;

        let status = response.status();
        // 409 means the collection already exists.
        if status.is_success() || status.as_u16() == 409 {
            log::info!("Vector collection {} ready ({} dims)", self.collection, dim);
            Ok(())
        } else {
            Err(AppError::vector(format!(
                "init_collection returned {}",
                status
            )))
        }
    }

    pub async fn upsert_batch(&self, points: &[VectorPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let body = json!({
            "points": points
                .iter()
                .map(|p| json!({
                    "id": p.id.to_string(),
                    "vector": p.vector,
                    "payload": p.payload,
                }))
                .collect::<Vec<Value>>()
        });

        let response = self
            .client
            .put(format!(
                "{}/collections/{}/points?wait=true",
                self.base_url, self.collection
            ))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::vector(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::vector(format!("upsert returned {}", status)));
        }
        log::debug!("Upserted {} vector points", points.len());
        Ok(())
    }

    /// Search with payload filters (exact-match `must` conditions).
    pub async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filters: &Value,
    ) -> Result<Vec<VectorHit>> {
        let must: Vec<Value> = filters
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(key, value)| match value {
                        Value::Array(options) => json!({
                            "key": key,
                            "match": { "any": options }
                        }),
                        other => json!({
                            "key": key,
                            "match": { "value": other }
                        }),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut body = json!({ "vector": vector, "limit": limit });
        if !must.is_empty() {
            body["filter"] = json!({ "must": must });
        }

        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/search",
                self.base_url, self.collection
            ))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::vector(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::vector(format!("search returned {}", status)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| AppError::vector(e.to_string()))?;
        let hits = payload["result"]
            .as_array()
            .ok_or_else(|| AppError::vector("search response missing result"))?;

        Ok(hits
            .iter()
            .filter_map(|hit| {
                let id = hit["id"].as_str().and_then(|s| Uuid::parse_str(s).ok())?;
                let score = hit["score"].as_f64()?;
                Some(VectorHit { id, score })
            })
            .collect())
    }

    /// Delete points by id; deleting a missing point is not an error.
    pub async fn delete_batch(&self, ids: &[Uuid]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let body = json!({
            "points": ids.iter().map(|id| id.to_string()).collect::<Vec<String>>()
        });

        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/delete?wait=true",
                self.base_url, self.collection
            ))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::vector(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::vector(format!("delete returned {}", status)));
        }
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[tokio::test]
    async fn init_tolerates_existing_collection() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("PUT", "/collections/extractions")
            .with_status(409)
            .create_async()
            .await;

        let client = QdrantClient::new(&server.url());
        assert!(client.init_collection(1024).await.is_ok());
    }

    #[tokio::test]
    async fn upsert_sends_points_with_string_ids() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/collections/extractions/points?wait=true")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"points": [{"payload": {"source_group": "acme"}}]}"#.to_string(),
            ))
            .with_status(200)
            .create_async()
            .await;

        let client = QdrantClient::new(&server.url());
        let point = VectorPoint {
            id: Uuid::new_v4(),
            vector: vec![0.1; 4],
            payload: serde_json::json!({"source_group": "acme"}),
        };
        client.upsert_batch(&[point]).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn search_parses_hits() {
        let id = Uuid::new_v4();
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/collections/extractions/points/search")
            .with_status(200)
            .with_body(format!(
                r#"{{"result": [{{"id": "{}", "score": 0.87}}]}}"#,
                id
            ))
            .create_async()
            .await;

        let client = QdrantClient::new(&server.url());
        let hits = client
            .search(&[0.1; 4], 10, &serde_json::json!({"project_id": "p1"}))
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert!((hits[0].score - 0.87).abs() < 1e-9);
    }

    #[tokio::test]
    async fn search_failure_is_a_vector_error() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/collections/extractions/points/search")
            .with_status(503)
            .create_async()
            .await;

        let client = QdrantClient::new(&server.url());
        let err = client
            .search(&[0.1; 4], 10, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::VectorIndex(_)));
    }

    #[tokio::test]
    async fn empty_delete_is_a_noop() {
        let client = QdrantClient::new("http://localhost:1");
        assert_eq!(client.delete_batch(&[]).await.unwrap(), 0);
    }
}
