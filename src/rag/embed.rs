use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, ensure, Context};
use async_openai::{
    config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client as OpenAiClient,
};
use async_trait::async_trait;
use blake3;

use super::config::RagConfig;

#[async_trait]
pub trait EmbeddingsProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// One vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

pub type SharedEmbedder = Arc<dyn EmbeddingsProvider>;

pub struct OpenAiEmbeddingsClient {
    client: OpenAiClient<OpenAIConfig>,
    model: String,
    cache: Mutex<HashMap<String, Vec<f32>>>,
    cache_capacity: usize,
}

impl OpenAiEmbeddingsClient {
    pub fn from_config(config: &RagConfig) -> anyhow::Result<Self> {
        let api_key = config
            .embedding_api_key
            .clone()
            .context("Embedding API key is not configured")?;
        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base_url) = &config.embedding_base_url {
            openai_config = openai_config.with_api_base(base_url.clone());
        }

        Ok(Self {
            client: OpenAiClient::with_config(openai_config),
            model: config.embedding_model.clone(),
            cache: Mutex::new(HashMap::new()),
            cache_capacity: 512,
        })
    }

    fn cache_key(text: &str) -> String {
        blake3::hash(text.as_bytes()).to_hex().to_string()
    }

    fn remember(&self, key: String, embedding: &[f32]) -> anyhow::Result<()> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("embedding cache lock poisoned"))?;
        if cache.len() >= self.cache_capacity {
            cache.clear();
        }
        cache.insert(key, embedding.to_vec());
        Ok(())
    }
}

#[async_trait]
impl EmbeddingsProvider for OpenAiEmbeddingsClient {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let cache_key = Self::cache_key(text);

        if let Some(hit) = self
            .cache
            .lock()
            .map_err(|_| anyhow!("embedding cache lock poisoned"))?
            .get(&cache_key)
            .cloned()
        {
            return Ok(hit);
        }

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(text)
            .build()?;

        let response = self.client.embeddings().create(request).await?;
        let embedding = response
            .data
            .first()
            .context("Embedding response missing data")?
            .embedding
            .clone();

        self.remember(cache_key, &embedding)?;
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(texts.to_vec())
            .build()?;

        let response = self.client.embeddings().create(request).await?;
        ensure!(
            response.data.len() == texts.len(),
            "Embedding response returned {} vectors for {} inputs",
            response.data.len(),
            texts.len()
        );

        let mut data = response.data;
        data.sort_by_key(|item| item.index);
        let vectors: Vec<Vec<f32>> = data.into_iter().map(|item| item.embedding).collect();
        for (text, vector) in texts.iter().zip(&vectors) {
            self.remember(Self::cache_key(text), vector)?;
        }
        Ok(vectors)
    }
}

/// Deterministic bag-of-words embedder for offline runs and tests.
/// Each lowercase token is hashed into one of `dim` buckets.
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingsProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            let hash = blake3::hash(token.to_lowercase().as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&hash.as_bytes()[..8]);
            let bucket = (u64::from_le_bytes(bytes) % self.dim as u64) as usize;
            vector[bucket] += 1.0;
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashing_embedder_is_deterministic_and_case_insensitive() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("Slab on Grade").await.unwrap();
        let b = embedder.embed("slab ON grade").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(a.iter().sum::<f32>(), 3.0);
    }

    #[tokio::test]
    async fn default_batch_preserves_order() {
        let embedder = HashingEmbedder::new(32);
        let texts = vec!["roof".to_string(), "footing".to_string()];
        let batch = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(batch[0], embedder.embed("roof").await.unwrap());
        assert_eq!(batch[1], embedder.embed("footing").await.unwrap());
    }
}
