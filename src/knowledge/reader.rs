use std::path::Path;

use anyhow::Context;
use tracing::{error, warn};

use super::extract::{extract_text, DocumentFormat};
use crate::prompt::budget::{char_prefix, PromptLimits};

/// Loads knowledge files with a per-file character cap.
#[derive(Debug, Clone)]
pub struct KnowledgeReader {
    max_chars: usize,
    chars_per_token: usize,
}

impl KnowledgeReader {
    pub fn new(limits: &PromptLimits) -> Self {
        Self {
            max_chars: limits.max_chars_per_file(),
            chars_per_token: limits.chars_per_token,
        }
    }

    /// Capped content of `path`, or `None` when the file is missing or unreadable.
    /// Failures are logged here so a bad file never aborts prompt assembly.
    pub async fn read(&self, path: &Path) -> Option<String> {
        match read_raw(path).await {
            Ok(raw) => Some(self.cap(raw, path)),
            Err(err) => {
                if path.exists() {
                    error!(?err, path = %path.display(), "Failed to read knowledge file");
                } else {
                    warn!(path = %path.display(), "Knowledge file not found");
                }
                None
            }
        }
    }

    fn cap(&self, raw: String, path: &Path) -> String {
        let original_chars = raw.chars().count();
        if original_chars <= self.max_chars {
            return raw;
        }

        let line_count = raw.lines().count();
        warn!(
            file = %path.file_name().unwrap_or_default().to_string_lossy(),
            original_chars,
            cap = self.max_chars,
            "Truncated knowledge file"
        );
        format!(
            "{}\n\n[... Truncated at {} tokens. Original: {} chars (~{} lines). Key parameters above are sufficient for estimation. ...]",
            char_prefix(&raw, self.max_chars),
            self.max_chars / self.chars_per_token.max(1),
            original_chars,
            line_count
        )
    }
}

/// Full text of a knowledge file; rich formats are converted off the executor.
pub async fn read_raw(path: &Path) -> anyhow::Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let format = DocumentFormat::from_name(&path.to_string_lossy());

    if !format.is_binary() {
        return extract_text(format, &bytes);
    }

    tokio::task::spawn_blocking(move || extract_text(format, &bytes))
        .await
        .context("Document extraction task panicked")?
        .with_context(|| format!("Failed to extract text from {}", path.display()))
}
