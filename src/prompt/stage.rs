use serde::{Deserialize, Serialize};
use tracing::info;

use super::budget::PromptLimits;

/// Workflow stages in the order the model must complete them.
pub const WORKFLOW_STAGES: [&str; 7] = ["A", "B", "C", "D-1", "D-2", "E", "F"];

pub const STEERING_START: &str = "Starting session. Begin with Stage A.";
pub const STEERING_CONTINUE: &str = "Continue the conversation based on the history above.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

/// Trailing window of `history` handed to classification and the model.
/// Drops to the fallback window when the serialized window is too large.
pub fn truncate_history<'a>(
    history: &'a [ConversationTurn],
    limits: &PromptLimits,
) -> &'a [ConversationTurn] {
    let window = tail(history, limits.history_turns);
    let serialized = serde_json::to_string(window)
        .map(|json| json.chars().count())
        .unwrap_or_default();
    let estimated_tokens = serialized / limits.chars_per_token.max(1);

    if estimated_tokens > limits.history_token_threshold {
        info!(
            estimated_tokens,
            keep = limits.history_fallback_turns,
            "History window too large; truncating further"
        );
        return tail(history, limits.history_fallback_turns);
    }
    window
}

fn tail(history: &[ConversationTurn], count: usize) -> &[ConversationTurn] {
    &history[history.len().saturating_sub(count)..]
}

/// Lowercased message plus window contents, the input to every classifier.
pub fn combined_text(message: &str, window: &[ConversationTurn]) -> String {
    let history = window
        .iter()
        .map(|turn| turn.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    format!("{message} {history}").to_lowercase()
}

/// Early-stage retrieval applies until any assistant turn mentions Stage B.
pub fn is_stage_a(full_history: &[ConversationTurn]) -> bool {
    !full_history
        .iter()
        .any(|turn| turn.is_assistant() && turn.content.contains("Stage B"))
}

/// Verification tools load once the window shows Stage A finished.
pub fn is_beyond_stage_a(window: &[ConversationTurn]) -> bool {
    window.iter().any(|turn| {
        turn.is_assistant()
            && (turn.content.contains("Stage A complete") || turn.content.contains("Stage B:"))
    })
}

/// Directive for the "current stage steering" block, driven by the most
/// recent assistant turn. When several completion markers appear the latest
/// stage wins.
pub fn steering_directive(window: &[ConversationTurn]) -> String {
    let Some(last_assistant) = window.iter().rev().find(|turn| turn.is_assistant()) else {
        return STEERING_START.to_string();
    };

    WORKFLOW_STAGES
        .windows(2)
        .rev()
        .find(|pair| {
            last_assistant
                .content
                .contains(&format!("Stage {} complete", pair[0]))
        })
        .map(|pair| {
            format!(
                "The user confirmed Stage {}. You MUST now proceed to Stage {}.",
                pair[0], pair[1]
            )
        })
        .unwrap_or_else(|| STEERING_CONTINUE.to_string())
}
