pub mod agent;
pub mod chunk;
pub mod config;
pub mod embed;
pub mod ingest;
pub mod memory_store;
pub mod postgrest;
pub mod retrieve;
pub mod store;

pub use agent::{build_rag_agent_from_env, RagAgent, SharedRagAgent};
pub use config::RagConfig;
pub use ingest::{DocumentSource, IngestOutcome, IngestStatus};
pub use store::{ChunkHit, ChunkStore, DocumentChunk};
