use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One embedded slice of an uploaded document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub conversation_id: String,
    pub file_name: String,
    pub chunk_index: usize,
    pub content: String,
    pub embedding: Vec<f32>,
}

/// Chunk returned by the store; `similarity` is set for vector search hits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkHit {
    pub file_name: String,
    pub chunk_index: usize,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

impl ChunkHit {
    /// `[file - chunk N]` header followed by the chunk text.
    pub fn render(&self) -> String {
        format!(
            "[{} - chunk {}]\n{}",
            self.file_name, self.chunk_index, self.content
        )
    }
}

impl From<&DocumentChunk> for ChunkHit {
    fn from(chunk: &DocumentChunk) -> Self {
        Self {
            file_name: chunk.file_name.clone(),
            chunk_index: chunk.chunk_index,
            content: chunk.content.clone(),
            similarity: None,
        }
    }
}

/// Persistence for document chunks, keyed by (conversation, file, index).
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Remove every chunk of `file_name` in `conversation_id`.
    async fn delete_file(&self, conversation_id: &str, file_name: &str) -> anyhow::Result<()>;

    async fn insert(&self, chunks: Vec<DocumentChunk>) -> anyhow::Result<()>;

    /// Every chunk of the conversation, ordered by file name then chunk index.
    async fn all_chunks(&self, conversation_id: &str) -> anyhow::Result<Vec<ChunkHit>>;

    /// Top `limit` chunks by similarity to `query_embedding`, best first.
    async fn search(
        &self,
        conversation_id: &str,
        query_embedding: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<ChunkHit>>;
}

pub type SharedChunkStore = Arc<dyn ChunkStore>;
