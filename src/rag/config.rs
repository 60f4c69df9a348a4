use std::env;

#[derive(Debug, Clone)]
pub struct RagConfig {
    pub embedding_api_key: Option<String>,
    pub embedding_base_url: Option<String>,
    pub embedding_model: String,
    pub chunk_words: usize,
    pub chunk_overlap: usize,
    pub embed_batch_size: usize,
    pub top_k: usize,
    pub stage_a_char_limit: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            embedding_api_key: None,
            embedding_base_url: None,
            embedding_model: "text-embedding-3-small".to_string(),
            chunk_words: 500,
            chunk_overlap: 50,
            embed_batch_size: 20,
            top_k: 8,
            stage_a_char_limit: 200_000,
        }
    }
}

impl RagConfig {
    const EMBEDDING_KEY_VARS: [&'static str; 3] = [
        "RAG_EMBEDDING_API_KEY",
        "ESTIMAIT_EMBEDDING_API_KEY",
        "OPENAI_API_KEY",
    ];
    const EMBEDDING_BASE_URL_VARS: [&'static str; 2] =
        ["RAG_EMBEDDING_BASE_URL", "OPENAI_BASE_URL"];
    const EMBEDDING_MODEL_VARS: [&'static str; 2] =
        ["RAG_EMBEDDING_MODEL", "ESTIMAIT_EMBEDDING_MODEL"];
    const CHUNK_WORDS_VARS: [&'static str; 1] = ["RAG_CHUNK_WORDS"];
    const CHUNK_OVERLAP_VARS: [&'static str; 1] = ["RAG_CHUNK_OVERLAP"];
    const TOP_K_VARS: [&'static str; 2] = ["RAG_TOP_K", "RAG_MATCH_COUNT"];
    const STAGE_A_LIMIT_VARS: [&'static str; 1] = ["RAG_STAGE_A_MAX_CHARS"];

    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            embedding_api_key: Self::read_env(&Self::EMBEDDING_KEY_VARS),
            embedding_base_url: Self::read_env(&Self::EMBEDDING_BASE_URL_VARS),
            embedding_model: Self::read_env(&Self::EMBEDDING_MODEL_VARS)
                .unwrap_or(defaults.embedding_model),
            chunk_words: Self::read_usize(&Self::CHUNK_WORDS_VARS).unwrap_or(defaults.chunk_words),
            chunk_overlap: Self::read_usize(&Self::CHUNK_OVERLAP_VARS)
                .unwrap_or(defaults.chunk_overlap),
            embed_batch_size: defaults.embed_batch_size,
            top_k: Self::read_usize(&Self::TOP_K_VARS).unwrap_or(defaults.top_k),
            stage_a_char_limit: Self::read_usize(&Self::STAGE_A_LIMIT_VARS)
                .unwrap_or(defaults.stage_a_char_limit),
        };

        anyhow::ensure!(config.chunk_words > 0, "RAG chunk window must be positive");
        anyhow::ensure!(
            config.chunk_overlap < config.chunk_words,
            "RAG chunk overlap ({}) must be smaller than the window ({})",
            config.chunk_overlap,
            config.chunk_words
        );
        Ok(config)
    }

    pub(crate) fn read_env(candidates: &[&'static str]) -> Option<String> {
        candidates
            .iter()
            .find_map(|key| env::var(key).ok())
            .filter(|value| !value.trim().is_empty())
    }

    fn read_usize(candidates: &[&'static str]) -> Option<usize> {
        Self::read_env(candidates).and_then(|value| value.trim().parse().ok())
    }
}

/// PostgREST endpoint of the chunk store (table `document_chunks`, RPC
/// `match_document_chunks`).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub table: String,
    pub match_function: String,
    pub http_timeout_ms: u64,
}

impl StoreConfig {
    const BASE_URL_VARS: [&'static str; 3] = [
        "CHUNK_STORE_URL",
        "SUPABASE_URL",
        "NEXT_PUBLIC_SUPABASE_URL",
    ];
    const API_KEY_VARS: [&'static str; 3] = [
        "CHUNK_STORE_KEY",
        "SUPABASE_SERVICE_ROLE_KEY",
        "NEXT_PUBLIC_SUPABASE_ANON_KEY",
    ];
    const TIMEOUT_VARS: [&'static str; 1] = ["CHUNK_STORE_HTTP_TIMEOUT_MS"];

    /// `None` when no store endpoint is configured.
    pub fn from_env() -> Option<Self> {
        let base_url = RagConfig::read_env(&Self::BASE_URL_VARS)?;
        let http_timeout_ms = RagConfig::read_env(&Self::TIMEOUT_VARS)
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(15_000);

        Some(Self {
            base_url,
            api_key: RagConfig::read_env(&Self::API_KEY_VARS),
            table: "document_chunks".to_string(),
            match_function: "match_document_chunks".to_string(),
            http_timeout_ms,
        })
    }
}
