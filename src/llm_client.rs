use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::{config::OpenAIConfig, Client as AsyncOpenAiClient};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{instrument, warn};

use crate::prompt::stage::{ConversationTurn, Role};
use crate::rag::config::RagConfig;

/// Text deltas of one model response, in arrival order.
pub type TextStream = BoxStream<'static, anyhow::Result<String>>;

pub type SharedLlmClient = Arc<dyn LlmClient>;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Open a streaming completion for `turns` under the `system` instructions.
    async fn stream_chat(
        &self,
        system: &str,
        turns: &[ConversationTurn],
    ) -> anyhow::Result<TextStream>;
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub request_deadline: Duration,
    pub retry: RetryPolicy,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: "gpt-4o".to_string(),
            temperature: 0.1,
            request_deadline: Duration::from_secs(290),
            retry: RetryPolicy::default(),
        }
    }
}

impl ChatConfig {
    const API_KEY_VARS: [&'static str; 2] = ["ESTIMAIT_LLM_API_KEY", "OPENAI_API_KEY"];
    const BASE_URL_VARS: [&'static str; 2] = ["ESTIMAIT_LLM_BASE_URL", "OPENAI_BASE_URL"];
    const MODEL_VARS: [&'static str; 1] = ["ESTIMAIT_LLM_MODEL"];
    const TEMPERATURE_VARS: [&'static str; 1] = ["ESTIMAIT_LLM_TEMPERATURE"];
    const DEADLINE_VARS: [&'static str; 1] = ["ESTIMAIT_REQUEST_DEADLINE_SECS"];

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: RagConfig::read_env(&Self::API_KEY_VARS),
            base_url: RagConfig::read_env(&Self::BASE_URL_VARS),
            model: RagConfig::read_env(&Self::MODEL_VARS).unwrap_or(defaults.model),
            temperature: RagConfig::read_env(&Self::TEMPERATURE_VARS)
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(defaults.temperature),
            request_deadline: RagConfig::read_env(&Self::DEADLINE_VARS)
                .and_then(|value| value.trim().parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_deadline),
            retry: defaults.retry,
        }
    }
}

/// Exponential backoff applied only to rate-limited attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            initial_backoff: Duration::from_secs(3),
        }
    }
}

pub fn is_rate_limited(err: &anyhow::Error) -> bool {
    let message = format!("{err:#}").to_lowercase();
    message.contains("429") || message.contains("rate limit") || message.contains("rate_limit")
}

/// Run `attempt` until it succeeds, fails with a non rate-limit error, or the
/// retries are used up.
pub async fn with_rate_limit_retry<T, F, Fut>(policy: RetryPolicy, mut attempt: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut delay = policy.initial_backoff;
    let mut retries_left = policy.retries;
    loop {
        match attempt().await {
            Err(err) if retries_left > 0 && is_rate_limited(&err) => {
                warn!(
                    delay_ms = delay.as_millis() as u64,
                    retries_left, "Rate limit hit; retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                retries_left -= 1;
            }
            result => return result,
        }
    }
}

/// Offline stand-in that streams back a short acknowledgement of the request.
#[derive(Debug, Default, Clone)]
pub struct EchoLlmClient;

impl EchoLlmClient {
    pub fn shared() -> SharedLlmClient {
        Arc::new(Self)
    }
}

#[async_trait]
impl LlmClient for EchoLlmClient {
    async fn stream_chat(
        &self,
        system: &str,
        turns: &[ConversationTurn],
    ) -> anyhow::Result<TextStream> {
        let last_user = turns
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(|turn| turn.content.as_str())
            .unwrap_or_default();
        let pieces = vec![
            "[offline estimator] ".to_string(),
            format!(
                "Instructions: {} chars, {} turns. ",
                system.chars().count(),
                turns.len()
            ),
            format!("I received: {last_user}"),
        ];
        Ok(stream::iter(pieces.into_iter().map(Ok)).boxed())
    }
}

/// OpenAI-compatible streaming client.
pub struct OpenAiLlmClient {
    client: AsyncOpenAiClient<OpenAIConfig>,
    config: ChatConfig,
}

impl OpenAiLlmClient {
    pub fn from_config(config: ChatConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .context("Set ESTIMAIT_LLM_API_KEY (or OPENAI_API_KEY) to use the model client")?;
        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base_url) = &config.base_url {
            openai_config = openai_config.with_api_base(base_url.clone());
        }

        Ok(Self {
            client: AsyncOpenAiClient::with_config(openai_config),
            config,
        })
    }

    fn build_request(
        &self,
        system: &str,
        turns: &[ConversationTurn],
    ) -> anyhow::Result<CreateChatCompletionRequest> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(turns.len() + 1);
        messages.push(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system)
                .build()?
                .into(),
        );
        for turn in turns {
            let message = match turn.role {
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(turn.content.as_str())
                    .build()?
                    .into(),
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(turn.content.as_str())
                    .build()?
                    .into(),
            };
            messages.push(message);
        }

        Ok(CreateChatCompletionRequestArgs::default()
            .model(&self.config.model)
            .temperature(self.config.temperature)
            .max_tokens(8192u32)
            .messages(messages)
            .build()?)
    }

    /// Open the stream and wait for its first event, so a rate-limit refusal
    /// surfaces as an error of the attempt rather than of the stream.
    async fn open(&self, request: CreateChatCompletionRequest) -> anyhow::Result<TextStream> {
        let mut raw = self
            .client
            .chat()
            .create_stream(request)
            .await
            .context("Failed to open model stream")?;
        let first = raw.next().await;
        if let Some(Err(err)) = &first {
            return Err(anyhow!("Model stream failed to start: {err}"));
        }

        let deltas = stream::iter(first).chain(raw).filter_map(|event| async move {
            match event {
                Ok(response) => response
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                    .filter(|text| !text.is_empty())
                    .map(Ok),
                Err(err) => Some(Err(anyhow!("Model stream error: {err}"))),
            }
        });
        Ok(deltas.boxed())
    }
}

#[async_trait]
impl LlmClient for OpenAiLlmClient {
    #[instrument(level = "debug", skip_all, fields(model = %self.config.model))]
    async fn stream_chat(
        &self,
        system: &str,
        turns: &[ConversationTurn],
    ) -> anyhow::Result<TextStream> {
        let request = self.build_request(system, turns)?;
        with_rate_limit_retry(self.config.retry, || self.open(request.clone())).await
    }
}

/// Attempt to build an OpenAI-compatible client, optionally falling back to the echo client.
pub fn build_llm_client_from_env(
    config: &ChatConfig,
    default_to_echo: bool,
) -> anyhow::Result<SharedLlmClient> {
    match OpenAiLlmClient::from_config(config.clone()) {
        Ok(client) => Ok(Arc::new(client)),
        Err(err) if default_to_echo => {
            warn!(?err, "Falling back to EchoLlmClient");
            Ok(EchoLlmClient::shared())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn quick_policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn rate_limit_errors_are_recognised() {
        assert!(is_rate_limited(&anyhow!("Invalid status code: 429 Too Many Requests")));
        assert!(is_rate_limited(&anyhow!("Rate limit reached for requests")));
        assert!(is_rate_limited(
            &anyhow!("rate_limit_exceeded").context("Model stream failed to start")
        ));
        assert!(!is_rate_limited(&anyhow!("invalid api key")));
    }

    #[tokio::test]
    async fn retries_rate_limited_attempts_then_succeeds() {
        let attempts = AtomicU32::new(0);
        let result = with_rate_limit_retry(quick_policy(2), || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow!("429 Too Many Requests"))
            } else {
                Ok("streamed")
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "streamed");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let attempts = AtomicU32::new(0);
        let result: anyhow::Result<()> = with_rate_limit_retry(quick_policy(2), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("rate limit"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: anyhow::Result<()> = with_rate_limit_retry(quick_policy(2), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("bad request"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn echo_client_streams_acknowledgement() {
        let turns = vec![
            ConversationTurn::user("first"),
            ConversationTurn::assistant("ok"),
            ConversationTurn::user("estimate a warehouse"),
        ];
        let text: Vec<String> = EchoLlmClient
            .stream_chat("SYSTEM", &turns)
            .await
            .unwrap()
            .map(|delta| delta.unwrap())
            .collect()
            .await;
        let text = text.concat();
        assert!(text.contains("Instructions: 6 chars, 3 turns."));
        assert!(text.ends_with("I received: estimate a warehouse"));
    }

    #[test]
    fn missing_key_is_reported() {
        let err = OpenAiLlmClient::from_config(ChatConfig::default()).err().unwrap();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
        assert!(build_llm_client_from_env(&ChatConfig::default(), true).is_ok());
    }
}
