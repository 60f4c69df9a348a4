use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, instrument, warn};

use super::config::{RagConfig, StoreConfig};
use super::embed::{HashingEmbedder, OpenAiEmbeddingsClient, SharedEmbedder};
use super::ingest::{DocumentSource, IngestJob, IngestStatus, IngestionTracker, Ingestor};
use super::memory_store::InMemoryChunkStore;
use super::postgrest::PostgrestChunkStore;
use super::retrieve::Retriever;
use super::store::SharedChunkStore;
use crate::prompt::stage::ConversationTurn;

pub type SharedRagAgent = Arc<RagAgent>;

/// Entry point for document ingestion and per-turn document context.
pub struct RagAgent {
    retriever: Retriever,
    tracker: IngestionTracker,
}

impl RagAgent {
    pub fn new(embedder: SharedEmbedder, store: SharedChunkStore, config: RagConfig) -> Self {
        let ingestor = Arc::new(Ingestor::new(
            embedder.clone(),
            store.clone(),
            config.clone(),
        ));
        let tracker = IngestionTracker::new(ingestor);
        let retriever = Retriever::new(embedder, store, config).with_tracker(tracker.clone());
        Self { retriever, tracker }
    }

    /// Offline agent: in-memory store and hashing embedder.
    pub fn in_memory(config: RagConfig) -> Self {
        Self::new(
            Arc::new(HashingEmbedder::default()),
            Arc::new(InMemoryChunkStore::new()),
            config,
        )
    }

    pub async fn context(
        &self,
        conversation_id: &str,
        message: &str,
        full_history: &[ConversationTurn],
    ) -> String {
        self.retriever
            .context(conversation_id, message, full_history)
            .await
    }

    /// Queue ingestion of `source` and return immediately.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, file_name = %file_name))]
    pub fn ingest_source(&self, conversation_id: &str, file_name: &str, source: DocumentSource) {
        match self.tracker.spawn_source(conversation_id, file_name, source) {
            Ok(_detached) => info!("Queued document ingestion"),
            Err(err) => error!(?err, "Failed to queue document ingestion"),
        }
    }

    /// Queue ingestion of extracted text and return immediately.
    pub fn ingest_text(&self, conversation_id: &str, file_name: &str, text: String) {
        if let Err(err) = self.tracker.spawn_text(conversation_id, file_name, text) {
            error!(?err, file_name, "Failed to queue document ingestion");
        }
    }

    /// Ingest `source` and wait for the result.
    pub async fn ingest_now(
        &self,
        conversation_id: &str,
        file_name: &str,
        source: DocumentSource,
    ) -> anyhow::Result<IngestStatus> {
        self.tracker
            .spawn_source(conversation_id, file_name, source)?
            .await
            .context("Ingestion task panicked")
    }

    /// Wait for the conversation's queued ingestion; `false` if `timeout` elapsed first.
    pub async fn wait_for_ingestion(
        &self,
        conversation_id: &str,
        timeout: Duration,
    ) -> anyhow::Result<bool> {
        self.tracker.wait_for(conversation_id, timeout).await
    }

    pub fn pending_ingestion(&self, conversation_id: &str) -> anyhow::Result<Vec<String>> {
        self.tracker.pending_files(conversation_id)
    }

    pub fn ingestion_jobs(&self, conversation_id: &str) -> anyhow::Result<Vec<IngestJob>> {
        self.tracker.jobs_for(conversation_id)
    }
}

/// Build the agent from env configuration. Without a configured chunk store or
/// embedding key, falls back to the in-memory store and hashing embedder when
/// `default_to_memory` is set.
pub fn build_rag_agent_from_env(default_to_memory: bool) -> anyhow::Result<Option<SharedRagAgent>> {
    let config = RagConfig::from_env()?;

    let Some(store_config) = StoreConfig::from_env() else {
        if default_to_memory {
            warn!("Chunk store not configured; using in-memory document store");
            return Ok(Some(Arc::new(RagAgent::in_memory(config))));
        }
        return Ok(None);
    };

    let embedder: SharedEmbedder = match OpenAiEmbeddingsClient::from_config(&config) {
        Ok(client) => Arc::new(client),
        Err(err) if default_to_memory => {
            warn!(?err, "Embedding client unavailable; using in-memory document store");
            return Ok(Some(Arc::new(RagAgent::in_memory(config))));
        }
        Err(err) => return Err(err),
    };

    match PostgrestChunkStore::new(store_config) {
        Ok(store) => Ok(Some(Arc::new(RagAgent::new(
            embedder,
            Arc::new(store),
            config,
        )))),
        Err(err) if default_to_memory => {
            warn!(?err, "Chunk store client init failed; using in-memory document store");
            Ok(Some(Arc::new(RagAgent::in_memory(config))))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ingested_text_feeds_stage_a_context() {
        let agent = RagAgent::in_memory(RagConfig::default());
        agent.ingest_text("c1", "bod.txt", "Two story medical office building".into());
        assert!(agent.wait_for_ingestion("c1", Duration::from_secs(5)).await.unwrap());

        let context = agent.context("c1", "", &[]).await;
        assert_eq!(context, "[bod.txt - chunk 0]\nTwo story medical office building");
        assert!(agent.context("other", "", &[]).await.is_empty());
    }

    #[tokio::test]
    async fn ingest_now_reads_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scope.md");
        std::fs::write(&path, "Scope: tilt-up warehouse shell").unwrap();

        let agent = RagAgent::in_memory(RagConfig::default());
        let status = agent
            .ingest_now("c1", "scope.md", DocumentSource::Path(path))
            .await
            .unwrap();
        assert_eq!(status, IngestStatus::Succeeded { chunks: 1 });
        assert_eq!(agent.ingestion_jobs("c1").unwrap().len(), 1);
    }
}
