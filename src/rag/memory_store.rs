use std::cmp::Ordering;
use std::sync::Mutex;

use anyhow::anyhow;

use super::store::{ChunkHit, ChunkStore, DocumentChunk};

/// Process-local chunk store used when no remote store is configured.
#[derive(Default)]
pub struct InMemoryChunkStore {
    chunks: Mutex<Vec<DocumentChunk>>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.chunks.lock().map(|chunks| chunks.len()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn delete_file(&self, conversation_id: &str, file_name: &str) -> anyhow::Result<()> {
        let mut chunks = self
            .chunks
            .lock()
            .map_err(|_| anyhow!("in-memory chunk store lock poisoned"))?;
        chunks.retain(|chunk| {
            !(chunk.conversation_id == conversation_id && chunk.file_name == file_name)
        });
        Ok(())
    }

    async fn insert(&self, mut incoming: Vec<DocumentChunk>) -> anyhow::Result<()> {
        let mut chunks = self
            .chunks
            .lock()
            .map_err(|_| anyhow!("in-memory chunk store lock poisoned"))?;
        chunks.append(&mut incoming);
        Ok(())
    }

    async fn all_chunks(&self, conversation_id: &str) -> anyhow::Result<Vec<ChunkHit>> {
        let chunks = self
            .chunks
            .lock()
            .map_err(|_| anyhow!("in-memory chunk store lock poisoned"))?;
        let mut hits: Vec<ChunkHit> = chunks
            .iter()
            .filter(|chunk| chunk.conversation_id == conversation_id)
            .map(ChunkHit::from)
            .collect();
        hits.sort_by(|a, b| {
            a.file_name
                .cmp(&b.file_name)
                .then(a.chunk_index.cmp(&b.chunk_index))
        });
        Ok(hits)
    }

    async fn search(
        &self,
        conversation_id: &str,
        query_embedding: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<ChunkHit>> {
        let chunks = self
            .chunks
            .lock()
            .map_err(|_| anyhow!("in-memory chunk store lock poisoned"))?;
        let mut scored: Vec<ChunkHit> = chunks
            .iter()
            .filter(|chunk| chunk.conversation_id == conversation_id)
            .map(|chunk| ChunkHit {
                similarity: Some(cosine_similarity(&chunk.embedding, query_embedding)),
                ..ChunkHit::from(chunk)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }
}

/// Cosine similarity in [-1, 1]; mismatched, empty or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    (dot / denom) as f32
}
