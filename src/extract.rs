//! Text extraction for uploaded files.
//!
//! File sources supply bytes and a content type; this module returns plain
//! UTF-8 text. PDFs keep their page structure: pages are joined with the
//! page-break marker so the chunker's page mode can split on them.

use ingest_harness_core::chunk::PAGE_BREAK;
use thiserror::Error;

use crate::html::html_to_text;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_HTML: &str = "text/html";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("file is not valid UTF-8 text")]
    NotUtf8,
}

/// Text pulled from a file, plus the page count for paged formats.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    pub text: String,
    pub pages: Option<usize>,
}

impl ExtractedText {
    pub fn is_paged(&self) -> bool {
        self.pages.is_some()
    }
}

/// Extract text from `bytes` according to `content_type`.
///
/// Parameters after `;` in the content type are ignored.
pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<ExtractedText, ExtractError> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        MIME_PDF => extract_pdf(bytes),
        MIME_HTML | "application/xhtml+xml" => {
            let html = std::str::from_utf8(bytes).map_err(|_| ExtractError::NotUtf8)?;
            Ok(ExtractedText {
                text: html_to_text(html),
                pages: None,
            })
        }
        m if m.starts_with("text/") || m == "application/json" => {
            let text = std::str::from_utf8(bytes).map_err(|_| ExtractError::NotUtf8)?;
            Ok(ExtractedText {
                text: text.to_string(),
                pages: None,
            })
        }
        _ => Err(ExtractError::UnsupportedContentType(mime)),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<ExtractedText, ExtractError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let count = pages.len();
    let separator = PAGE_BREAK.to_string();
    Ok(ExtractedText {
        text: pages.join(&separator),
        pages: Some(count),
    })
}

/// Best-effort content type from a file name, for uploads without one.
pub fn guess_content_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => MIME_PDF,
        "html" | "htm" => MIME_HTML,
        "md" | "markdown" => MIME_MARKDOWN,
        "json" => "application/json",
        "csv" => "text/csv",
        _ => MIME_TEXT,
    }
}
