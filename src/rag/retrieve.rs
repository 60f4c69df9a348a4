use anyhow::Context;
use tracing::{info, instrument, warn};

use super::config::RagConfig;
use super::embed::SharedEmbedder;
use super::ingest::IngestionTracker;
use super::store::{ChunkHit, SharedChunkStore};
use crate::prompt::budget::char_prefix;
use crate::prompt::stage::{is_stage_a, ConversationTurn};

pub const CHUNK_SEPARATOR: &str = "\n\n---\n\n";
pub const RAG_TRUNCATION_NOTICE: &str = "\n\n[RAG context truncated to fit system prompt budget]";
const FALLBACK_QUERY: &str = "project overview";

/// Which retrieval path produced the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    /// Every chunk of the conversation, capped.
    FullDocument,
    /// Top-K similarity search.
    Semantic,
}

/// Builds the document context block for one chat turn.
pub struct Retriever {
    embedder: SharedEmbedder,
    store: SharedChunkStore,
    config: RagConfig,
    tracker: Option<IngestionTracker>,
}

impl Retriever {
    pub fn new(embedder: SharedEmbedder, store: SharedChunkStore, config: RagConfig) -> Self {
        Self {
            embedder,
            store,
            config,
            tracker: None,
        }
    }

    pub fn with_tracker(mut self, tracker: IngestionTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Document context for `message`, or an empty string when nothing is
    /// stored or retrieval fails.
    ///
    /// While no assistant turn of `full_history` mentions "Stage B" the whole
    /// document set is returned (capped), falling back to search when nothing
    /// is stored yet. Afterwards only the top-K most similar chunks are used.
    #[instrument(skip_all, fields(conversation_id = %conversation_id))]
    pub async fn context(
        &self,
        conversation_id: &str,
        message: &str,
        full_history: &[ConversationTurn],
    ) -> String {
        self.note_pending(conversation_id);

        let mode = if is_stage_a(full_history) {
            RetrievalMode::FullDocument
        } else {
            RetrievalMode::Semantic
        };

        let result = match mode {
            RetrievalMode::FullDocument => self.full_document(conversation_id, message).await,
            RetrievalMode::Semantic => self.semantic(conversation_id, message).await,
        };

        match result {
            Ok(context) => {
                if !context.is_empty() {
                    info!(chars = context.len(), ?mode, "Injecting document context");
                }
                context
            }
            Err(err) => {
                warn!(?err, "Document retrieval failed; continuing without context");
                String::new()
            }
        }
    }

    async fn full_document(&self, conversation_id: &str, message: &str) -> anyhow::Result<String> {
        let chunks = match self.store.all_chunks(conversation_id).await {
            Ok(chunks) => chunks,
            Err(err) => {
                warn!(?err, "Failed to load conversation chunks; falling back to search");
                Vec::new()
            }
        };

        if chunks.is_empty() {
            return self.semantic(conversation_id, message).await;
        }
        info!(count = chunks.len(), "Loaded all conversation chunks");

        let context = render(&chunks);
        if context.chars().count() <= self.config.stage_a_char_limit {
            return Ok(context);
        }

        warn!(
            chars = context.len(),
            cap = self.config.stage_a_char_limit,
            "Document context truncated"
        );
        Ok(format!(
            "{}{RAG_TRUNCATION_NOTICE}",
            char_prefix(&context, self.config.stage_a_char_limit)
        ))
    }

    async fn semantic(&self, conversation_id: &str, message: &str) -> anyhow::Result<String> {
        let query = if message.trim().is_empty() {
            FALLBACK_QUERY
        } else {
            message
        };
        let embedding = self
            .embedder
            .embed(query)
            .await
            .context("Failed to embed retrieval query")?;
        let hits = self
            .store
            .search(conversation_id, &embedding, self.config.top_k)
            .await
            .context("Chunk similarity search failed")?;

        if !hits.is_empty() {
            info!(count = hits.len(), "Found relevant chunks");
        }
        Ok(render(&hits))
    }

    fn note_pending(&self, conversation_id: &str) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        match tracker.pending_files(conversation_id) {
            Ok(pending) if !pending.is_empty() => info!(
                ?pending,
                "Ingestion still running; document context may be partial"
            ),
            Ok(_) => {}
            Err(err) => warn!(?err, "Ingestion status unavailable"),
        }
    }
}

fn render(hits: &[ChunkHit]) -> String {
    hits.iter()
        .map(ChunkHit::render)
        .collect::<Vec<_>>()
        .join(CHUNK_SEPARATOR)
}
