use tracing::{info, warn};

use crate::knowledge::extract::DocumentFormat;
use crate::prompt::budget::char_prefix;
use crate::rag::ingest::DocumentSource;

pub const ATTACHMENTS_HEADER: &str = "[USER PROVIDED ATTACHMENTS FOR ANALYSIS]";
pub const ALL_SKIPPED_NOTE: &str = "[NOTE: All uploaded files were skipped because they exceeded size limits after truncation. Please ask the user to upload a smaller version or split the document.]";

/// A file sent with the current turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub source: DocumentSource,
}

impl Attachment {
    pub fn new(name: impl Into<String>, source: DocumentSource) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }

    /// Name taken from the last segment of `raw` (path or URL).
    pub fn parse(raw: &str) -> Self {
        let source = DocumentSource::parse(raw);
        Self {
            name: source.file_name(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AttachmentLimits {
    pub per_file_chars: usize,
    pub chars_per_token: usize,
    pub total_chars: usize,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            per_file_chars: 40_000,
            chars_per_token: 4,
            total_chars: 600_000,
        }
    }
}

/// Attachment content ready to be merged into the user message.
#[derive(Debug, Default, Clone)]
pub struct PreparedAttachments {
    /// Inline document blocks, in upload order.
    pub document_context: String,
    /// Short notes kept within the content budget.
    pub notes: Vec<String>,
    /// Documents to hand to ingestion instead of inlining.
    pub to_ingest: Vec<Attachment>,
}

impl PreparedAttachments {
    /// `message` followed by the attachment section and notes.
    pub fn apply_to(&self, message: &str) -> String {
        let mut text = message.to_string();
        if !self.document_context.trim().is_empty() {
            text.push_str(&format!(
                "\n\n{ATTACHMENTS_HEADER}\n{}\n",
                self.document_context
            ));
        }

        let mut parts: Vec<&str> = Vec::new();
        if !text.trim().is_empty() {
            parts.push(&text);
        }
        parts.extend(self.notes.iter().map(String::as_str));
        parts.join("\n\n")
    }
}

/// Turn the current turn's files into inline text, notes and ingestion work.
///
/// Plain text and DOCX files are inlined up to the per-file cap. PDFs are only
/// referenced by a note and queued for ingestion. Files of other types are
/// ignored.
pub async fn prepare_attachments(
    attachments: &[Attachment],
    http: &reqwest::Client,
    limits: &AttachmentLimits,
) -> PreparedAttachments {
    let mut prepared = PreparedAttachments::default();
    let mut blocks: Vec<String> = Vec::new();
    let mut document_context = String::new();

    for attachment in attachments {
        match DocumentFormat::from_name(&attachment.name) {
            DocumentFormat::Pdf => {
                info!(file = %attachment.name, "PDF routed to semantic search");
                blocks.push(format!(
                    "[Attached Files: {} \u{2014} content retrieved via semantic search and injected above.]",
                    attachment.name
                ));
                prepared.to_ingest.push(attachment.clone());
            }
            DocumentFormat::Docx | DocumentFormat::PlainText => {
                match attachment.source.load_text(http).await {
                    Ok(text) if !text.trim().is_empty() => {
                        document_context.push_str(&inline_block(&attachment.name, &text, limits));
                    }
                    Ok(_) => warn!(file = %attachment.name, "Attachment has no text"),
                    Err(err) => {
                        warn!(?err, file = %attachment.name, "Failed to parse attachment");
                        document_context.push_str(&format!(
                            "\n[NOTE: Failed to parse content of {} due to an error: {err}]\n",
                            attachment.name
                        ));
                    }
                }
            }
            DocumentFormat::Unsupported => {
                warn!(file = %attachment.name, "Unsupported attachment type skipped");
            }
        }
    }

    let mut used = 0usize;
    let offered = blocks.len();
    for block in blocks {
        let size = block.chars().count();
        if used + size > limits.total_chars {
            warn!(size, used, "Attachment budget exceeded; skipping block");
            continue;
        }
        used += size;
        prepared.notes.push(block);
    }
    if offered > 0 && prepared.notes.is_empty() {
        warn!("All attachment blocks were skipped");
        prepared.notes.push(ALL_SKIPPED_NOTE.to_string());
    }

    prepared.document_context = document_context;
    prepared
}

fn inline_block(name: &str, text: &str, limits: &AttachmentLimits) -> String {
    let original_chars = text.chars().count();
    let capped = if original_chars > limits.per_file_chars {
        format!(
            "{}\n[... File truncated at {} tokens. Original: {original_chars} chars ...]",
            char_prefix(text, limits.per_file_chars),
            with_thousands(limits.per_file_chars / limits.chars_per_token.max(1))
        )
    } else {
        text.to_string()
    };
    format!(
        "\n[BOD DOCUMENT CONTENT START: {name}]\n{}\n[BOD DOCUMENT CONTENT END: {name}]\n",
        capped.trim()
    )
}

fn with_thousands(value: usize) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn write(dir: &Path, name: &str, body: &str) -> Attachment {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        Attachment::new(name, DocumentSource::Path(path))
    }

    #[test]
    fn thousands_separator() {
        assert_eq!(with_thousands(10_000), "10,000");
        assert_eq!(with_thousands(999), "999");
        assert_eq!(with_thousands(1_234_567), "1,234,567");
    }

    #[tokio::test]
    async fn text_files_are_inlined_and_pdfs_queued() {
        let dir = tempfile::tempdir().unwrap();
        let attachments = vec![
            write(dir.path(), "scope.md", "  Three story lab building  \n"),
            write(dir.path(), "drawings.pdf", "%PDF-1.4"),
            write(dir.path(), "photo.png", "binary"),
        ];

        let prepared = prepare_attachments(
            &attachments,
            &reqwest::Client::new(),
            &AttachmentLimits::default(),
        )
        .await;

        assert_eq!(
            prepared.document_context,
            "\n[BOD DOCUMENT CONTENT START: scope.md]\nThree story lab building\n[BOD DOCUMENT CONTENT END: scope.md]\n"
        );
        assert_eq!(prepared.to_ingest.len(), 1);
        assert_eq!(prepared.to_ingest[0].name, "drawings.pdf");
        assert_eq!(
            prepared.notes,
            vec!["[Attached Files: drawings.pdf \u{2014} content retrieved via semantic search and injected above.]"]
        );

        let message = prepared.apply_to("Please estimate");
        assert!(message.starts_with("Please estimate\n\n[USER PROVIDED ATTACHMENTS FOR ANALYSIS]\n"));
        assert!(message.ends_with("injected above.]"));
    }

    #[tokio::test]
    async fn long_files_are_capped_with_original_length() {
        let dir = tempfile::tempdir().unwrap();
        let attachments = vec![write(dir.path(), "bod.txt", &"x".repeat(120))];
        let limits = AttachmentLimits {
            per_file_chars: 40,
            chars_per_token: 4,
            total_chars: 600_000,
        };

        let prepared = prepare_attachments(&attachments, &reqwest::Client::new(), &limits).await;
        assert!(prepared.document_context.contains(&format!(
            "{}\n[... File truncated at 10 tokens. Original: 120 chars ...]",
            "x".repeat(40)
        )));
    }

    #[tokio::test]
    async fn unreadable_files_become_notes() {
        let attachments = vec![Attachment::new(
            "missing.docx",
            DocumentSource::Path("/nope/missing.docx".into()),
        )];
        let prepared = prepare_attachments(
            &attachments,
            &reqwest::Client::new(),
            &AttachmentLimits::default(),
        )
        .await;
        assert!(prepared
            .document_context
            .starts_with("\n[NOTE: Failed to parse content of missing.docx due to an error:"));
    }

    #[tokio::test]
    async fn over_budget_blocks_are_replaced_by_notice() {
        let dir = tempfile::tempdir().unwrap();
        let attachments = vec![write(dir.path(), "set.pdf", "%PDF")];
        let limits = AttachmentLimits {
            total_chars: 10,
            ..AttachmentLimits::default()
        };
        let prepared = prepare_attachments(&attachments, &reqwest::Client::new(), &limits).await;
        assert_eq!(prepared.notes, vec![ALL_SKIPPED_NOTE.to_string()]);
        assert_eq!(prepared.apply_to(""), ALL_SKIPPED_NOTE);
    }

    #[test]
    fn attachment_names_come_from_source() {
        let attachment = Attachment::parse("https://blob.example.com/u/bod.docx?sig=1");
        assert_eq!(attachment.name, "bod.docx");
    }
}
