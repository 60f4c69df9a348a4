use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::config::StoreConfig;
use super::store::{ChunkHit, ChunkStore, DocumentChunk};

/// Chunk store backed by a PostgREST endpoint: rows live in the configured
/// table and similarity search goes through a stored RPC.
pub struct PostgrestChunkStore {
    http: reqwest::Client,
    config: StoreConfig,
}

impl PostgrestChunkStore {
    pub fn new(config: StoreConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_millis(config.http_timeout_ms.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build chunk store HTTP client")?;

        Ok(Self { http, config })
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/rest/v1/{path}")
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(key) = &self.config.api_key {
            builder.header("apikey", key).bearer_auth(key)
        } else {
            builder
        }
    }

    fn table_url(&self) -> String {
        self.endpoint(&self.config.table)
    }

    async fn read_json<R: DeserializeOwned>(
        response: reqwest::Response,
        action: &str,
    ) -> anyhow::Result<R> {
        let response = response
            .error_for_status()
            .with_context(|| format!("Chunk store {action} returned error status"))?;
        response
            .json::<R>()
            .await
            .with_context(|| format!("Failed to deserialize chunk store {action} response"))
    }
}

#[derive(Serialize)]
struct ChunkRow<'a> {
    conversation_id: &'a str,
    file_name: &'a str,
    chunk_index: usize,
    content: &'a str,
    embedding: &'a [f32],
}

impl<'a> From<&'a DocumentChunk> for ChunkRow<'a> {
    fn from(chunk: &'a DocumentChunk) -> Self {
        Self {
            conversation_id: &chunk.conversation_id,
            file_name: &chunk.file_name,
            chunk_index: chunk.chunk_index,
            content: &chunk.content,
            embedding: &chunk.embedding,
        }
    }
}

#[derive(Deserialize)]
struct MatchRow {
    file_name: String,
    chunk_index: usize,
    content: String,
    #[serde(default)]
    similarity: Option<f32>,
}

impl From<MatchRow> for ChunkHit {
    fn from(row: MatchRow) -> Self {
        Self {
            file_name: row.file_name,
            chunk_index: row.chunk_index,
            content: row.content,
            similarity: row.similarity,
        }
    }
}

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

#[async_trait]
impl ChunkStore for PostgrestChunkStore {
    async fn delete_file(&self, conversation_id: &str, file_name: &str) -> anyhow::Result<()> {
        self.apply_auth(self.http.delete(self.table_url()))
            .query(&[
                ("conversation_id", eq(conversation_id)),
                ("file_name", eq(file_name)),
            ])
            .send()
            .await
            .context("Chunk store delete request failed")?
            .error_for_status()
            .context("Chunk store delete returned error status")?;
        Ok(())
    }

    async fn insert(&self, chunks: Vec<DocumentChunk>) -> anyhow::Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let rows: Vec<ChunkRow<'_>> = chunks.iter().map(ChunkRow::from).collect();
        debug!(rows = rows.len(), "Inserting document chunks");

        self.apply_auth(self.http.post(self.table_url()))
            .header("Prefer", "return=minimal")
            .json(&rows)
            .send()
            .await
            .context("Chunk store insert request failed")?
            .error_for_status()
            .context("Chunk store insert returned error status")?;
        Ok(())
    }

    async fn all_chunks(&self, conversation_id: &str) -> anyhow::Result<Vec<ChunkHit>> {
        let response = self
            .apply_auth(self.http.get(self.table_url()))
            .query(&[
                ("select", "file_name,chunk_index,content".to_string()),
                ("conversation_id", eq(conversation_id)),
                ("order", "file_name.asc,chunk_index.asc".to_string()),
            ])
            .send()
            .await
            .context("Chunk store listing request failed")?;

        let rows: Vec<MatchRow> = Self::read_json(response, "listing").await?;
        Ok(rows.into_iter().map(ChunkHit::from).collect())
    }

    async fn search(
        &self,
        conversation_id: &str,
        query_embedding: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<ChunkHit>> {
        let url = self.endpoint(&format!("rpc/{}", self.config.match_function));
        let payload = json!({
            "query_embedding": query_embedding,
            "conversation_id_filter": conversation_id,
            "match_count": limit,
        });
        let response = self
            .apply_auth(self.http.post(url))
            .json(&payload)
            .send()
            .await
            .context("Chunk store match request failed")?;

        let rows: Vec<MatchRow> = Self::read_json(response, "match").await?;
        Ok(rows.into_iter().map(ChunkHit::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: &str, api_key: Option<&str>) -> StoreConfig {
        StoreConfig {
            base_url: base_url.into(),
            api_key: api_key.map(str::to_string),
            table: "document_chunks".into(),
            match_function: "match_document_chunks".into(),
            http_timeout_ms: 1_000,
        }
    }

    #[test]
    fn endpoints_are_joined_under_rest_prefix() {
        let store = PostgrestChunkStore::new(config("https://db.example.com/", None)).unwrap();
        assert_eq!(
            store.table_url(),
            "https://db.example.com/rest/v1/document_chunks"
        );
        assert_eq!(
            store.endpoint("/rpc/match_document_chunks"),
            "https://db.example.com/rest/v1/rpc/match_document_chunks"
        );
    }

    #[test]
    fn auth_sets_apikey_and_bearer_headers() {
        let store = PostgrestChunkStore::new(config("https://db.example.com", Some("k1"))).unwrap();
        let request = store
            .apply_auth(store.http.get(store.table_url()))
            .build()
            .unwrap();
        assert_eq!(request.headers()["apikey"], "k1");
        assert_eq!(request.headers()["authorization"], "Bearer k1");
    }

    #[test]
    fn match_rows_tolerate_missing_similarity() {
        let rows: Vec<MatchRow> = serde_json::from_str(
            r#"[{"file_name":"a.pdf","chunk_index":2,"content":"x"},
                {"file_name":"b.pdf","chunk_index":0,"content":"y","similarity":0.5}]"#,
        )
        .unwrap();
        let hits: Vec<ChunkHit> = rows.into_iter().map(ChunkHit::from).collect();
        assert_eq!(hits[0].similarity, None);
        assert_eq!(hits[1].similarity, Some(0.5));
        assert_eq!(hits[0].render(), "[a.pdf - chunk 2]\nx");
    }
}
