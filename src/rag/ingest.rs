use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, ensure, Context};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use super::chunk::chunk_words;
use super::config::RagConfig;
use super::embed::SharedEmbedder;
use super::store::{DocumentChunk, SharedChunkStore};
use crate::knowledge::extract::{extract_text, DocumentFormat};
use crate::knowledge::reader::read_raw;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Stored { chunks: usize },
    /// Extraction produced no usable text; nothing was deleted or written.
    NothingToEmbed,
}

/// Chunks, embeds and stores one document per call.
pub struct Ingestor {
    embedder: SharedEmbedder,
    store: SharedChunkStore,
    config: RagConfig,
}

impl Ingestor {
    pub fn new(embedder: SharedEmbedder, store: SharedChunkStore, config: RagConfig) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    /// Replace every stored chunk of `file_name` in `conversation_id` with
    /// chunks of `text`.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, file_name = %file_name))]
    pub async fn ingest(
        &self,
        conversation_id: &str,
        file_name: &str,
        text: &str,
    ) -> anyhow::Result<IngestOutcome> {
        ensure!(
            !conversation_id.trim().is_empty(),
            "Ingestion requires a conversation id"
        );
        ensure!(!file_name.trim().is_empty(), "Ingestion requires a file name");

        if !text.chars().any(char::is_alphanumeric) {
            warn!("No text extracted; nothing to embed");
            return Ok(IngestOutcome::NothingToEmbed);
        }

        self.store
            .delete_file(conversation_id, file_name)
            .await
            .context("Failed to clear previous chunks")?;

        let chunks = chunk_words(text, self.config.chunk_words, self.config.chunk_overlap);
        info!(count = chunks.len(), "Chunked document");

        let batch_size = self.config.embed_batch_size.max(1);
        for (batch_no, batch) in chunks.chunks(batch_size).enumerate() {
            let vectors = self
                .embedder
                .embed_batch(batch)
                .await
                .with_context(|| format!("Failed to embed chunk batch {batch_no}"))?;
            ensure!(
                vectors.len() == batch.len(),
                "Embedder returned {} vectors for {} chunks",
                vectors.len(),
                batch.len()
            );

            let offset = batch_no * batch_size;
            let rows = batch
                .iter()
                .zip(vectors)
                .enumerate()
                .map(|(idx, (content, embedding))| DocumentChunk {
                    conversation_id: conversation_id.to_string(),
                    file_name: file_name.to_string(),
                    chunk_index: offset + idx,
                    content: content.clone(),
                    embedding,
                })
                .collect();
            self.store
                .insert(rows)
                .await
                .with_context(|| format!("Failed to store chunk batch {batch_no}"))?;
        }

        Ok(IngestOutcome::Stored {
            chunks: chunks.len(),
        })
    }
}

/// Where an uploaded document's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    Path(PathBuf),
    Url(String),
}

impl DocumentSource {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Self::Url(raw.to_string())
        } else {
            Self::Path(PathBuf::from(raw))
        }
    }

    /// Last path segment, without any query string.
    pub fn file_name(&self) -> String {
        let name = match self {
            Self::Path(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            Self::Url(url) => url
                .split(|c: char| c == '?' || c == '#')
                .next()
                .and_then(|path| path.rsplit('/').next())
                .map(str::to_string),
        };
        name.filter(|name| !name.is_empty())
            .unwrap_or_else(|| "document".to_string())
    }

    pub async fn load_text(&self, http: &reqwest::Client) -> anyhow::Result<String> {
        match self {
            Self::Path(path) => read_raw(path).await,
            Self::Url(url) => {
                let bytes = http
                    .get(url)
                    .send()
                    .await
                    .with_context(|| format!("Failed to fetch {url}"))?
                    .error_for_status()
                    .with_context(|| format!("Fetching {url} returned error status"))?
                    .bytes()
                    .await
                    .context("Failed to read document body")?;
                let format = DocumentFormat::from_name(&self.file_name());
                tokio::task::spawn_blocking(move || extract_text(format, &bytes))
                    .await
                    .context("Document extraction task panicked")?
                    .with_context(|| format!("Failed to extract text from {url}"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestStatus {
    Pending,
    Succeeded { chunks: usize },
    Empty,
    Failed { error: String },
    /// A newer upload of the same file was queued before this run started.
    Superseded,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestJob {
    pub file_name: String,
    #[serde(flatten)]
    pub status: IngestStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

type JobKey = (String, String);

struct JobEntry {
    job: IngestJob,
    /// Bumped on every upload of the key; only the newest run records status.
    generation: u64,
    running: Arc<AsyncMutex<()>>,
}

enum Payload {
    Text(String),
    Source(DocumentSource),
}

/// Runs ingestion jobs in the background and keeps their latest status per
/// (conversation, file). Jobs of the same key run one at a time.
#[derive(Clone)]
pub struct IngestionTracker {
    ingestor: Arc<Ingestor>,
    http: reqwest::Client,
    jobs: Arc<Mutex<HashMap<JobKey, JobEntry>>>,
    changed: Arc<Notify>,
}

impl IngestionTracker {
    pub fn new(ingestor: Arc<Ingestor>) -> Self {
        Self {
            ingestor,
            http: reqwest::Client::new(),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            changed: Arc::new(Notify::new()),
        }
    }

    fn jobs(&self) -> anyhow::Result<MutexGuard<'_, HashMap<JobKey, JobEntry>>> {
        self.jobs
            .lock()
            .map_err(|_| anyhow!("ingestion job table poisoned"))
    }

    /// Mark a new pending run of `key`; returns its generation and the key's run lock.
    fn begin(&self, key: &JobKey) -> anyhow::Result<(u64, Arc<AsyncMutex<()>>)> {
        let now = Utc::now();
        let run = {
            let mut jobs = self.jobs()?;
            let entry = jobs.entry(key.clone()).or_insert_with(|| JobEntry {
                job: IngestJob {
                    file_name: key.1.clone(),
                    status: IngestStatus::Pending,
                    started_at: now,
                    updated_at: now,
                },
                generation: 0,
                running: Arc::default(),
            });
            entry.generation += 1;
            entry.job.status = IngestStatus::Pending;
            entry.job.started_at = now;
            entry.job.updated_at = now;
            (entry.generation, entry.running.clone())
        };
        self.changed.notify_waiters();
        Ok(run)
    }

    fn is_current(&self, key: &JobKey, generation: u64) -> bool {
        self.jobs()
            .map(|jobs| {
                jobs.get(key)
                    .is_some_and(|entry| entry.generation == generation)
            })
            .unwrap_or(false)
    }

    /// Start ingesting already-extracted text; returns without waiting.
    pub fn spawn_text(
        &self,
        conversation_id: &str,
        file_name: &str,
        text: String,
    ) -> anyhow::Result<JoinHandle<IngestStatus>> {
        self.spawn(conversation_id, file_name, Payload::Text(text))
    }

    /// Start fetching, extracting and ingesting `source`; returns without waiting.
    pub fn spawn_source(
        &self,
        conversation_id: &str,
        file_name: &str,
        source: DocumentSource,
    ) -> anyhow::Result<JoinHandle<IngestStatus>> {
        self.spawn(conversation_id, file_name, Payload::Source(source))
    }

    fn spawn(
        &self,
        conversation_id: &str,
        file_name: &str,
        payload: Payload,
    ) -> anyhow::Result<JoinHandle<IngestStatus>> {
        let key: JobKey = (conversation_id.to_string(), file_name.to_string());
        let (generation, running) = self.begin(&key)?;
        let tracker = self.clone();

        Ok(tokio::spawn(async move {
            let _running = running.lock_owned().await;
            let (conversation_id, file_name) = &key;
            if !tracker.is_current(&key, generation) {
                info!(%conversation_id, %file_name, "Newer upload queued; skipping this run");
                return IngestStatus::Superseded;
            }

            let result = match payload {
                Payload::Text(text) => {
                    tracker
                        .ingestor
                        .ingest(conversation_id, file_name, &text)
                        .await
                }
                Payload::Source(source) => match source.load_text(&tracker.http).await {
                    Ok(text) => {
                        tracker
                            .ingestor
                            .ingest(conversation_id, file_name, &text)
                            .await
                    }
                    Err(err) => Err(err),
                },
            };
            tracker.finish(&key, generation, result)
        }))
    }

    fn finish(
        &self,
        key: &JobKey,
        generation: u64,
        result: anyhow::Result<IngestOutcome>,
    ) -> IngestStatus {
        let (conversation_id, file_name) = key;
        let status = match result {
            Ok(IngestOutcome::Stored { chunks }) => {
                info!(%conversation_id, %file_name, chunks, "Ingestion finished");
                IngestStatus::Succeeded { chunks }
            }
            Ok(IngestOutcome::NothingToEmbed) => {
                warn!(%conversation_id, %file_name, "Ingestion found no text");
                IngestStatus::Empty
            }
            Err(err) => {
                error!(?err, %conversation_id, %file_name, "Ingestion failed");
                IngestStatus::Failed {
                    error: format!("{err:#}"),
                }
            }
        };

        match self.jobs() {
            Ok(mut jobs) => {
                if let Some(entry) = jobs
                    .get_mut(key)
                    .filter(|entry| entry.generation == generation)
                {
                    entry.job.status = status.clone();
                    entry.job.updated_at = Utc::now();
                }
            }
            Err(err) => error!(?err, "Failed to record ingestion status"),
        }
        self.changed.notify_waiters();
        status
    }

    pub fn status(
        &self,
        conversation_id: &str,
        file_name: &str,
    ) -> anyhow::Result<Option<IngestJob>> {
        Ok(self
            .jobs()?
            .get(&(conversation_id.to_string(), file_name.to_string()))
            .map(|entry| entry.job.clone()))
    }

    pub fn jobs_for(&self, conversation_id: &str) -> anyhow::Result<Vec<IngestJob>> {
        let mut jobs: Vec<IngestJob> = self
            .jobs()?
            .iter()
            .filter(|((conversation, _), _)| conversation == conversation_id)
            .map(|(_, entry)| entry.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(jobs)
    }

    pub fn pending_files(&self, conversation_id: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .jobs_for(conversation_id)?
            .into_iter()
            .filter(|job| job.status == IngestStatus::Pending)
            .map(|job| job.file_name)
            .collect())
    }

    /// Wait until no job of the conversation is pending. Returns `false` if
    /// `timeout` elapsed first.
    pub async fn wait_for(&self, conversation_id: &str, timeout: Duration) -> anyhow::Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let changed = self.changed.notified();
            if self.pending_files(conversation_id)?.is_empty() {
                return Ok(true);
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Ok(self.pending_files(conversation_id)?.is_empty());
            }
        }
    }
}
