use std::io::{Cursor, Read};
use std::sync::OnceLock;

use anyhow::{bail, Context};
use regex::Regex;

const PLAIN_TEXT_EXTENSIONS: [&str; 9] = [
    ".txt", ".md", ".markdown", ".yaml", ".yml", ".json", ".csv", ".py", ".log",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Docx,
    PlainText,
    Unsupported,
}

impl DocumentFormat {
    /// Classify by file name; `X.md.docx` is a Word document.
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".pdf") {
            Self::Pdf
        } else if lower.ends_with(".docx") {
            Self::Docx
        } else if PLAIN_TEXT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            Self::PlainText
        } else {
            Self::Unsupported
        }
    }

    /// Formats that need a converter and should run off the async executor.
    pub fn is_binary(self) -> bool {
        matches!(self, Self::Pdf | Self::Docx)
    }
}

/// Pull raw text out of `bytes` according to `format`.
/// `Unsupported` input is decoded as lossy UTF-8.
pub fn extract_text(format: DocumentFormat, bytes: &[u8]) -> anyhow::Result<String> {
    match format {
        DocumentFormat::Pdf => extract_pdf(bytes),
        DocumentFormat::Docx => extract_docx(bytes),
        DocumentFormat::PlainText | DocumentFormat::Unsupported => {
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn extract_pdf(bytes: &[u8]) -> anyhow::Result<String> {
    let document = lopdf::Document::load_mem(bytes).context("Failed to parse PDF")?;
    let pages: Vec<u32> = document.get_pages().keys().copied().collect();
    if pages.is_empty() {
        bail!("PDF has no pages");
    }
    document
        .extract_text(&pages)
        .context("Failed to extract PDF text")
}

fn extract_docx(bytes: &[u8]) -> anyhow::Result<String> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("DOCX is not a valid zip archive")?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .context("DOCX is missing word/document.xml")?
        .read_to_string(&mut xml)
        .context("Failed to read DOCX body")?;
    Ok(docx_xml_to_text(&xml))
}

fn docx_xml_to_text(xml: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"<w:t(?:\s[^>]*)?>([^<]*)</w:t>|</w:p>|<w:tab/>|<w:br/>")
            .expect("valid docx regex")
    });

    let mut out = String::new();
    for caps in pattern.captures_iter(xml) {
        match caps.get(1) {
            Some(run) => out.push_str(&unescape_xml(run.as_str())),
            None if &caps[0] == "<w:tab/>" => out.push('\t'),
            None => out.push('\n'),
        }
    }
    out
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_bytes(body: &str) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            writer
                .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        buffer.into_inner()
    }

    #[test]
    fn formats_are_detected_by_name() {
        assert_eq!(DocumentFormat::from_name("plan.PDF"), DocumentFormat::Pdf);
        assert_eq!(DocumentFormat::from_name("list.md.docx"), DocumentFormat::Docx);
        assert_eq!(DocumentFormat::from_name("rates.yaml"), DocumentFormat::PlainText);
        assert_eq!(DocumentFormat::from_name("photo.png"), DocumentFormat::Unsupported);
        assert!(DocumentFormat::Docx.is_binary());
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let body = r#"<w:document><w:body><w:p><w:r><w:t>Slab &amp; footing</w:t></w:r></w:p><w:p><w:r><w:t xml:space="preserve">GFA </w:t><w:tab/><w:t>48,000 sf</w:t></w:r></w:p></w:body></w:document>"#;
        let text = extract_text(DocumentFormat::Docx, &docx_bytes(body)).unwrap();
        assert_eq!(text, "Slab & footing\nGFA \t48,000 sf\n");
    }

    #[test]
    fn corrupt_binary_documents_fail() {
        assert!(extract_text(DocumentFormat::Docx, b"not a zip").is_err());
        assert!(extract_text(DocumentFormat::Pdf, b"not a pdf").is_err());
    }
}
