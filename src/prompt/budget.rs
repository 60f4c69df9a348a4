use std::env;

pub const TRUNCATION_NOTICE: &str =
    "\n\n[SYSTEM: Prompt was truncated to fit within token limits. Use injected context above.]";

/// Size limits that bound what reaches the model. Token figures are estimates
/// at a fixed characters-per-token ratio.
#[derive(Debug, Clone)]
pub struct PromptLimits {
    pub chars_per_token: usize,
    pub max_tokens_per_file: usize,
    pub max_system_tokens: usize,
    pub history_turns: usize,
    pub history_fallback_turns: usize,
    pub history_token_threshold: usize,
    pub domain_summary_chars: usize,
    pub decision_matrix_chars: usize,
    pub registry_index_lines: usize,
}

impl Default for PromptLimits {
    fn default() -> Self {
        Self {
            chars_per_token: 4,
            max_tokens_per_file: 10_000,
            max_system_tokens: 80_000,
            history_turns: 6,
            history_fallback_turns: 4,
            history_token_threshold: 20_000,
            domain_summary_chars: 2_000,
            decision_matrix_chars: 1_500,
            registry_index_lines: 80,
        }
    }
}

impl PromptLimits {
    const FILE_TOKEN_VARS: [&'static str; 2] =
        ["ESTIMAIT_MAX_TOKENS_PER_FILE", "MAX_TOKENS_PER_FILE"];
    const SYSTEM_TOKEN_VARS: [&'static str; 2] =
        ["ESTIMAIT_MAX_SYSTEM_TOKENS", "MAX_TOTAL_SYSTEM_TOKENS"];

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_tokens_per_file: read_usize(&Self::FILE_TOKEN_VARS)
                .unwrap_or(defaults.max_tokens_per_file),
            max_system_tokens: read_usize(&Self::SYSTEM_TOKEN_VARS)
                .unwrap_or(defaults.max_system_tokens),
            ..defaults
        }
    }

    pub fn max_chars_per_file(&self) -> usize {
        self.max_tokens_per_file * self.chars_per_token
    }

    pub fn system_prompt_char_limit(&self) -> usize {
        self.max_system_tokens * self.chars_per_token
    }

    pub fn estimate_tokens(&self, text: &str) -> usize {
        text.chars().count() / self.chars_per_token.max(1)
    }
}

fn read_usize(candidates: &[&str]) -> Option<usize> {
    candidates
        .iter()
        .find_map(|key| env::var(key).ok())
        .and_then(|value| value.trim().parse().ok())
}

/// Longest prefix of `text` holding at most `max_chars` characters.
pub fn char_prefix(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Running character counter with a hard ceiling.
///
/// Sections are appended in order; the section that crosses the ceiling is cut
/// at the ceiling, everything after it is dropped, and `finish` appends the
/// truncation notice so the model knows content was cut.
#[derive(Debug)]
pub struct PromptBudget {
    limit: usize,
    used: usize,
    text: String,
    truncated: bool,
}

impl PromptBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: 0,
            text: String::new(),
            truncated: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used)
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn push(&mut self, section: &str) {
        if self.truncated {
            return;
        }
        let len = section.chars().count();
        if len <= self.remaining() {
            self.text.push_str(section);
            self.used += len;
            return;
        }
        self.text.push_str(char_prefix(section, self.remaining()));
        self.used = self.limit;
        self.truncated = true;
    }

    pub fn finish(mut self) -> String {
        if self.truncated {
            self.text.push_str(TRUNCATION_NOTICE);
        }
        self.text
    }
}
