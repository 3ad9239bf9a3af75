use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use tianyi_core::config::VectorConfig;

use crate::error::{Result, StoreError};

/// One similarity-search hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub content: String,
    pub score: f64,
    /// Creation date carried in the fragment metadata.
    pub timestamp: String,
}

/// Client for the external similarity index (Chroma-compatible REST API).
///
/// One collection is shared across users; every document carries a
/// `user_id` metadata tag and every query filters on it.
pub struct VectorIndex {
    http: reqwest::Client,
    base_url: String,
    collection_id: String,
    embeddings: EmbeddingClient,
}

impl VectorIndex {
    /// Resolve (or create) the collection and keep its id for the process
    /// lifetime.
    pub async fn connect(cfg: &VectorConfig) -> Result<Self> {
        let http = reqwest::Client::new();
        let resp = http
            .post(format!("{}/api/v1/collections", cfg.base_url))
            .json(&json!({ "name": cfg.collection, "get_or_create": true }))
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(StoreError::VectorApi { status, message });
        }

        #[derive(Deserialize)]
        struct Collection {
            id: String,
        }
        let collection: Collection = resp.json().await?;
        debug!(collection = %cfg.collection, id = %collection.id, "vector collection ready");

        Ok(Self {
            http,
            base_url: cfg.base_url.clone(),
            collection_id: collection.id,
            embeddings: EmbeddingClient::new(&cfg.embedding),
        })
    }

    fn url(&self, op: &str) -> String {
        format!(
            "{}/api/v1/collections/{}/{}",
            self.base_url, self.collection_id, op
        )
    }

    async fn post(&self, op: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let resp = self.http.post(self.url(op)).json(&body).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(StoreError::VectorApi { status, message });
        }
        Ok(resp)
    }

    /// Store a fragment under a caller-chosen id. Ids are generated by the
    /// facade when the write is staged, so the durable audit row and the
    /// index entry always agree.
    pub async fn add(&self, id: &str, user_id: &str, content: &str) -> Result<()> {
        let embedding = self.embeddings.embed_one(content).await?;
        self.post(
            "add",
            json!({
                "ids": [id],
                "embeddings": [embedding],
                "documents": [content],
                "metadatas": [fragment_metadata(user_id)],
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn update(&self, id: &str, user_id: &str, content: &str) -> Result<()> {
        let embedding = self.embeddings.embed_one(content).await?;
        self.post(
            "update",
            json!({
                "ids": [id],
                "embeddings": [embedding],
                "documents": [content],
                "metadatas": [fragment_metadata(user_id)],
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.post("delete", json!({ "ids": [id] })).await?;
        Ok(())
    }

    /// Fetch fragments by id. Unknown ids are skipped.
    pub async fn get(&self, ids: &[String]) -> Result<Vec<(String, String)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        #[derive(Deserialize)]
        struct GetResponse {
            #[serde(default)]
            ids: Vec<String>,
            #[serde(default)]
            documents: Vec<Option<String>>,
        }
        let resp = self.post("get", json!({ "ids": ids })).await?;
        let body: GetResponse = resp.json().await?;
        Ok(body
            .ids
            .into_iter()
            .zip(body.documents)
            .filter_map(|(id, doc)| doc.map(|d| (id, d)))
            .collect())
    }

    /// Nearest-neighbour search filtered to one user. Distances are mapped
    /// to a similarity score via `1 / (1 + distance)`.
    pub async fn search(&self, user_id: &str, query: &str, k: usize) -> Result<Vec<VectorHit>> {
        let embedding = self.embeddings.embed_one(query).await?;

        #[derive(Deserialize)]
        struct QueryResponse {
            #[serde(default)]
            ids: Vec<Vec<String>>,
            #[serde(default)]
            documents: Vec<Vec<Option<String>>>,
            #[serde(default)]
            metadatas: Vec<Vec<Option<serde_json::Value>>>,
            #[serde(default)]
            distances: Vec<Vec<f64>>,
        }
        let resp = self
            .post(
                "query",
                json!({
                    "query_embeddings": [embedding],
                    "n_results": k,
                    "where": { "user_id": user_id },
                }),
            )
            .await?;
        let body: QueryResponse = resp.json().await?;

        let (Some(ids), Some(documents), Some(metadatas), Some(distances)) = (
            body.ids.into_iter().next(),
            body.documents.into_iter().next(),
            body.metadatas.into_iter().next(),
            body.distances.into_iter().next(),
        ) else {
            return Ok(Vec::new());
        };

        let mut hits = Vec::with_capacity(ids.len());
        for (((id, doc), meta), distance) in
            ids.into_iter().zip(documents).zip(metadatas).zip(distances)
        {
            let Some(content) = doc else { continue };
            let timestamp = meta
                .as_ref()
                .and_then(|m| m.get("timestamp"))
                .and_then(|t| t.as_str())
                .unwrap_or("unknown time")
                .to_string();
            hits.push(VectorHit {
                id,
                content,
                score: 1.0 / (1.0 + distance),
                timestamp,
            });
        }
        debug!(user_id, hits = hits.len(), "vector search complete");
        Ok(hits)
    }
}

fn fragment_metadata(user_id: &str) -> serde_json::Value {
    json!({
        "source": "memory_writer",
        "user_id": user_id,
        "timestamp": chrono::Local::now().format("%Y-%m-%d").to_string(),
    })
}

/// OpenAI-compatible embeddings endpoint.
struct EmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl EmbeddingClient {
    fn new(cfg: &tianyi_core::config::EmbeddingConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: cfg.base_url.clone(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
        }
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        #[derive(Deserialize)]
        struct EmbeddingResponse {
            data: Vec<EmbeddingData>,
        }
        #[derive(Deserialize)]
        struct EmbeddingData {
            embedding: Vec<f32>,
        }

        let resp = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": [text] }))
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            warn!(status, "embedding request failed");
            return Err(StoreError::VectorApi { status, message });
        }
        let mut body: EmbeddingResponse = resp.json().await?;
        body.data
            .pop()
            .map(|d| d.embedding)
            .ok_or_else(|| StoreError::VectorApi {
                status,
                message: "embedding response carried no vectors".to_string(),
            })
    }
}
