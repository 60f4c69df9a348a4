use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::time::{timeout_at, Instant};
use tracing::{info, instrument, warn};

use super::attachments::{prepare_attachments, AttachmentLimits};
use super::traits::{AgentBehavior, ChatTurnRequest, EventStream, StreamEvent};
use crate::llm_client::{SharedLlmClient, TextStream};
use crate::prompt::{AssembledPrompt, ConversationTurn, PromptAssembler, PromptRequest};
use crate::rag::SharedRagAgent;

const DEFAULT_CONVERSATION: &str = "default";

/// Runs one estimator turn: document retrieval, prompt assembly, attachment
/// handling and the streamed model call.
pub struct EstimatorAgent {
    assembler: PromptAssembler,
    llm_client: SharedLlmClient,
    rag_agent: Option<SharedRagAgent>,
    http: reqwest::Client,
    attachment_limits: AttachmentLimits,
    request_deadline: Duration,
}

impl EstimatorAgent {
    pub fn new(
        assembler: PromptAssembler,
        llm_client: SharedLlmClient,
        rag_agent: Option<SharedRagAgent>,
        request_deadline: Duration,
    ) -> Self {
        Self {
            assembler,
            llm_client,
            rag_agent,
            http: reqwest::Client::new(),
            attachment_limits: AttachmentLimits::default(),
            request_deadline,
        }
    }

    /// Bounded instructions for `request` without calling the model.
    pub async fn prepare(&self, request: &ChatTurnRequest) -> AssembledPrompt {
        let conversation_id = conversation_id(request);
        let document_context = match &self.rag_agent {
            Some(rag) => {
                rag.context(conversation_id, &request.message, &request.history)
                    .await
            }
            None => String::new(),
        };

        self.assembler
            .assemble(&PromptRequest {
                message: &request.message,
                history: &request.history,
                building_type: request.building_type,
                document_context: Some(document_context.as_str()),
                profile: request.profile.as_ref(),
            })
            .await
    }

    async fn final_user_message(&self, request: &ChatTurnRequest) -> String {
        if request.attachments.is_empty() {
            return request.message.clone();
        }

        let prepared =
            prepare_attachments(&request.attachments, &self.http, &self.attachment_limits).await;
        match &self.rag_agent {
            Some(rag) => {
                for attachment in &prepared.to_ingest {
                    rag.ingest_source(
                        conversation_id(request),
                        &attachment.name,
                        attachment.source.clone(),
                    );
                }
            }
            None if !prepared.to_ingest.is_empty() => {
                warn!(
                    count = prepared.to_ingest.len(),
                    "Document store unavailable; attachments not ingested"
                );
            }
            None => {}
        }
        prepared.apply_to(&request.message)
    }
}

fn conversation_id(request: &ChatTurnRequest) -> &str {
    let id = request.conversation_id.trim();
    if id.is_empty() {
        DEFAULT_CONVERSATION
    } else {
        id
    }
}

/// History turns the model accepts: empty turns are dropped.
fn sendable_history(window: &[ConversationTurn]) -> Vec<ConversationTurn> {
    window
        .iter()
        .filter(|turn| {
            let keep = !turn.content.trim().is_empty();
            if !keep {
                warn!(role = ?turn.role, "Filtered empty history message");
            }
            keep
        })
        .cloned()
        .collect()
}

/// Map model deltas to events, ending with `Done`, or with `Error` on a stream
/// failure or once `deadline` passes.
fn into_events(deltas: TextStream, deadline: Instant) -> EventStream {
    stream::unfold(Some(deltas), move |state| async move {
        let mut deltas = state?;
        let event = match timeout_at(deadline, deltas.next()).await {
            Ok(Some(Ok(text))) => return Some((StreamEvent::Delta { text }, Some(deltas))),
            Ok(Some(Err(err))) => {
                warn!(?err, "Model stream failed");
                StreamEvent::Error {
                    error: format!("{err:#}"),
                }
            }
            Ok(None) => StreamEvent::Done,
            Err(_) => {
                warn!("Request deadline reached while streaming");
                StreamEvent::Error {
                    error: "Request deadline exceeded".to_string(),
                }
            }
        };
        Some((event, None))
    })
    .boxed()
}

#[async_trait]
impl AgentBehavior for EstimatorAgent {
    #[instrument(skip_all, fields(conversation_id = %conversation_id(&request)))]
    async fn run_turn(&self, request: ChatTurnRequest) -> anyhow::Result<EventStream> {
        let deadline = Instant::now() + self.request_deadline;

        let assembled = self.prepare(&request).await;
        info!(
            chars = assembled.system.len(),
            truncated = assembled.truncated,
            fragments = assembled.fragments.len(),
            "Assembled system instructions"
        );

        let mut turns = sendable_history(&assembled.history);
        turns.push(ConversationTurn::user(self.final_user_message(&request).await));

        let deltas = timeout_at(deadline, self.llm_client.stream_chat(&assembled.system, &turns))
            .await
            .context("Request deadline exceeded before the model responded")?
            .context("Model call failed")?;

        Ok(into_events(deltas, deadline))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::agents::attachments::Attachment;
    use crate::knowledge::context::tests::{knowledge_tree, load_context};
    use crate::llm_client::{EchoLlmClient, LlmClient};
    use crate::rag::config::RagConfig;
    use crate::rag::ingest::DocumentSource;
    use crate::rag::RagAgent;

    /// Records what it was asked and replays fixed deltas.
    #[derive(Default)]
    struct RecordingLlm {
        seen: Mutex<Option<(String, Vec<ConversationTurn>)>>,
        deltas: Vec<anyhow::Result<String>>,
    }

    #[async_trait]
    impl LlmClient for RecordingLlm {
        async fn stream_chat(
            &self,
            system: &str,
            turns: &[ConversationTurn],
        ) -> anyhow::Result<TextStream> {
            *self.seen.lock().unwrap() = Some((system.to_string(), turns.to_vec()));
            let deltas: Vec<anyhow::Result<String>> = self
                .deltas
                .iter()
                .map(|delta| match delta {
                    Ok(text) => Ok(text.clone()),
                    Err(err) => Err(anyhow::anyhow!("{err}")),
                })
                .collect();
            Ok(stream::iter(deltas).boxed())
        }
    }

    struct StalledLlm;

    #[async_trait]
    impl LlmClient for StalledLlm {
        async fn stream_chat(
            &self,
            _system: &str,
            _turns: &[ConversationTurn],
        ) -> anyhow::Result<TextStream> {
            Ok(stream::once(async { Ok("partial".to_string()) })
                .chain(stream::pending())
                .boxed())
        }
    }

    async fn agent(
        root: &Path,
        llm: SharedLlmClient,
        rag: Option<SharedRagAgent>,
        deadline: Duration,
    ) -> EstimatorAgent {
        let assembler = PromptAssembler::new(Arc::new(load_context(root).await));
        EstimatorAgent::new(assembler, llm, rag, deadline)
    }

    async fn collect(stream: EventStream) -> Vec<StreamEvent> {
        stream.collect().await
    }

    #[tokio::test]
    async fn streams_deltas_then_done() {
        let tmp = knowledge_tree();
        let llm = Arc::new(RecordingLlm {
            deltas: vec![Ok("Stage A".into()), Ok(": summary".into())],
            ..RecordingLlm::default()
        });
        let agent = agent(tmp.path(), llm.clone(), None, Duration::from_secs(5)).await;

        let mut request = ChatTurnRequest::new("c1", "New warehouse in Fresno");
        request.history = vec![
            ConversationTurn::user("hello"),
            ConversationTurn::assistant("   "),
        ];
        let events = collect(agent.run_turn(request).await.unwrap()).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Delta { text: "Stage A".into() },
                StreamEvent::Delta { text: ": summary".into() },
                StreamEvent::Done,
            ]
        );

        let (system, turns) = llm.seen.lock().unwrap().clone().unwrap();
        assert!(system.contains("LAYER0 BODY"));
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "hello");
        assert_eq!(turns[1], ConversationTurn::user("New warehouse in Fresno"));
    }

    #[tokio::test]
    async fn stream_failure_becomes_error_event() {
        let tmp = knowledge_tree();
        let llm = Arc::new(RecordingLlm {
            deltas: vec![Ok("partial".into()), Err(anyhow::anyhow!("connection reset"))],
            ..RecordingLlm::default()
        });
        let agent = agent(tmp.path(), llm, None, Duration::from_secs(5)).await;

        let events = collect(agent.run_turn(ChatTurnRequest::new("c1", "hi")).await.unwrap()).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], StreamEvent::Error { error: "connection reset".into() });
    }

    #[tokio::test]
    async fn deadline_ends_stream_with_error() {
        let tmp = knowledge_tree();
        let agent = agent(tmp.path(), Arc::new(StalledLlm), None, Duration::from_millis(200)).await;

        let events = collect(agent.run_turn(ChatTurnRequest::new("c1", "hi")).await.unwrap()).await;
        assert_eq!(events[0], StreamEvent::Delta { text: "partial".into() });
        assert_eq!(
            events[1],
            StreamEvent::Error { error: "Request deadline exceeded".into() }
        );
    }

    #[tokio::test]
    async fn retrieved_documents_and_attachments_reach_the_model() {
        let tmp = knowledge_tree();
        let rag: SharedRagAgent = Arc::new(RagAgent::in_memory(RagConfig::default()));
        rag.ingest_text("c1", "narrative.txt", "Owner wants a tilt-up shell".into());
        assert!(rag.wait_for_ingestion("c1", Duration::from_secs(5)).await.unwrap());

        let upload = tmp.path().join("scope.md");
        std::fs::write(&upload, "Scope: 40,000 SF").unwrap();
        let pdf = tmp.path().join("set.pdf");
        std::fs::write(&pdf, "not really a pdf").unwrap();

        let llm = Arc::new(RecordingLlm::default());
        let agent = agent(tmp.path(), llm.clone(), Some(rag.clone()), Duration::from_secs(5)).await;
        let mut request = ChatTurnRequest::new("c1", "Estimate this");
        request.attachments = vec![
            Attachment::new("scope.md", DocumentSource::Path(upload)),
            Attachment::new("set.pdf", DocumentSource::Path(pdf)),
        ];
        let events = collect(agent.run_turn(request).await.unwrap()).await;
        assert_eq!(events, vec![StreamEvent::Done]);

        let (system, turns) = llm.seen.lock().unwrap().clone().unwrap();
        assert!(system.contains("[narrative.txt - chunk 0]\nOwner wants a tilt-up shell"));
        let user = &turns.last().unwrap().content;
        assert!(user.contains("[BOD DOCUMENT CONTENT START: scope.md]\nScope: 40,000 SF"));
        assert!(user.contains("[Attached Files: set.pdf"));

        assert!(rag.wait_for_ingestion("c1", Duration::from_secs(5)).await.unwrap());
        assert_eq!(rag.ingestion_jobs("c1").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn echo_client_round_trip() {
        let tmp = knowledge_tree();
        let agent = agent(tmp.path(), EchoLlmClient::shared(), None, Duration::from_secs(5)).await;
        let events = collect(agent.run_turn(ChatTurnRequest::new("", "ping")).await.unwrap()).await;
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        assert!(events.iter().any(|event| matches!(
            event,
            StreamEvent::Delta { text } if text.contains("I received: ping")
        )));
    }
}
