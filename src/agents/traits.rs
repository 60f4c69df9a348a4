use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::attachments::Attachment;
use crate::prompt::{BuildingType, CompanyProfile, ConversationTurn};

/// One user turn entering the estimator.
#[derive(Debug, Clone, Default)]
pub struct ChatTurnRequest {
    pub conversation_id: String,
    pub message: String,
    /// Prior turns, oldest first.
    pub history: Vec<ConversationTurn>,
    /// Explicit selection that overrides text classification.
    pub building_type: Option<BuildingType>,
    pub attachments: Vec<Attachment>,
    pub profile: Option<CompanyProfile>,
}

impl ChatTurnRequest {
    pub fn new(conversation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Event of a streamed response. Serialises as `{"type": "delta", "text": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Delta { text: String },
    Done,
    Error { error: String },
}

impl StreamEvent {
    /// Server-sent-events frame: `data: {json}` plus a blank line.
    pub fn to_sse(&self) -> anyhow::Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

pub type EventStream = BoxStream<'static, StreamEvent>;

#[async_trait]
pub trait AgentBehavior: Send + Sync {
    async fn run_turn(&self, request: ChatTurnRequest) -> anyhow::Result<EventStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialise_with_type_tag() {
        let delta = StreamEvent::Delta { text: "hi".into() };
        assert_eq!(
            serde_json::to_string(&delta).unwrap(),
            r#"{"type":"delta","text":"hi"}"#
        );
        assert_eq!(
            StreamEvent::Done.to_sse().unwrap(),
            "data: {\"type\":\"done\"}\n\n"
        );
        let error: StreamEvent = serde_json::from_str(r#"{"type":"error","error":"boom"}"#).unwrap();
        assert_eq!(error, StreamEvent::Error { error: "boom".into() });
    }
}
