//! HTML page extraction.
//!
//! Turns a fetched HTML document into a title, readable text, and absolute
//! outbound links and image URLs. Uses `scraper` (html5ever) for parsing.
//!
//! Text selection:
//!
//! 1. Try each selector in [`CONTENT_SELECTORS`] in order; the first
//!    container whose text exceeds `min_container_chars` wins.
//! 2. Otherwise fall back to the whole `<body>`.
//!
//! `script`, `style`, `noscript`, `template`, `svg` and `iframe` subtrees are
//! never read. Block-level elements become paragraph breaks so the sentence
//! and paragraph chunkers see the page's structure.

use std::collections::HashSet;

use ingest_harness_core::chunk::normalize_whitespace;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Content containers tried before falling back to `<body>`, most specific first.
pub const CONTENT_SELECTORS: &[&str] = &[
    "main",
    "article",
    "[role=main]",
    "#content",
    "#main-content",
    ".main-content",
    ".content",
    ".post-content",
    ".entry-content",
    ".article-body",
    ".docs-content",
    ".documentation",
];

const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "svg", "iframe", "head", "object", "canvas",
];

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "aside", "header", "footer", "nav", "h1", "h2",
    "h3", "h4", "h5", "h6", "ul", "ol", "li", "dl", "dt", "dd", "table", "tr", "blockquote",
    "pre", "figure", "figcaption", "form", "fieldset", "address", "hr",
];

/// Extraction knobs, taken from `[crawl]` and the job flags.
#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    pub min_container_chars: usize,
    /// Skip container detection and read the whole body.
    pub full_page: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            min_container_chars: 100,
            full_page: false,
        }
    }
}

/// Everything the crawler keeps from one HTML document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedPage {
    pub title: Option<String>,
    pub content: String,
    pub links: Vec<String>,
    pub images: Vec<String>,
}

pub fn extract_page(html: &str, page_url: &Url, options: &ExtractOptions) -> ExtractedPage {
    let document = Html::parse_document(html);
    ExtractedPage {
        title: extract_title(&document),
        content: extract_content(&document, options),
        links: collect_urls(&document, "a[href]", "href", page_url),
        images: collect_urls(&document, "img[src]", "src", page_url),
    }
}

/// Readable text of a whole document, without container detection.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    extract_content(
        &document,
        &ExtractOptions {
            full_page: true,
            ..Default::default()
        },
    )
}

fn extract_title(document: &Html) -> Option<String> {
    for css in ["title", "h1"] {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        if let Some(element) = document.select(&selector).next() {
            let text = normalize_whitespace(&element.text().collect::<String>());
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn extract_content(document: &Html, options: &ExtractOptions) -> String {
    if !options.full_page {
        for css in CONTENT_SELECTORS {
            let Ok(selector) = Selector::parse(css) else {
                continue;
            };
            for container in document.select(&selector) {
                let text = element_text(container);
                if text.chars().count() > options.min_container_chars {
                    return text;
                }
            }
        }
    }

    let root = Selector::parse("body")
        .ok()
        .and_then(|s| document.select(&s).next())
        .unwrap_or_else(|| document.root_element());
    element_text(root)
}

fn element_text(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    walk(element, &mut out);
    normalize_whitespace(&out)
}

fn walk(element: ElementRef<'_>, out: &mut String) {
    let name = element.value().name();
    if SKIPPED_TAGS.contains(&name) {
        return;
    }
    if name == "br" {
        out.push('\n');
        return;
    }

    let block = BLOCK_TAGS.contains(&name);
    if block {
        out.push_str("\n\n");
    }
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                if let Some(child_element) = ElementRef::wrap(child) {
                    walk(child_element, out);
                }
            }
            _ => {}
        }
    }
    if block {
        out.push_str("\n\n");
    }
}

/// Resolve every `attr` of elements matching `css` against `base`, keeping
/// only http(s) URLs, without fragments, first occurrence wins.
fn collect_urls(document: &Html, css: &str, attr: &str, base: &Url) -> Vec<String> {
    let Ok(selector) = Selector::parse(css) else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for element in document.select(&selector) {
        let Some(raw) = element.value().attr(attr) else {
            continue;
        };
        if let Some(resolved) = resolve_url(base, raw) {
            if seen.insert(resolved.clone()) {
                out.push(resolved);
            }
        }
    }
    out
}

/// Resolve a raw href against `base`. Returns `None` for fragment-only
/// links, non-http(s) schemes, and unparseable values.
pub fn resolve_url(base: &Url, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('#') {
        return None;
    }
    let mut resolved = base.join(raw).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/docs/page").unwrap()
    }

    fn long_paragraph(word: &str) -> String {
        format!("{} ", word).repeat(40)
    }

    #[test]
    fn prefers_main_container_over_body() {
        let html = format!(
            r#"<html><head><title> My  Page </title></head><body>
               <nav>Home About Contact</nav>
               <main><p>{}</p></main>
               <footer>Copyright</footer></body></html>"#,
            long_paragraph("content")
        );
        let page = extract_page(&html, &base(), &ExtractOptions::default());
        assert_eq!(page.title.as_deref(), Some("My Page"));
        assert!(page.content.starts_with("content content"));
        assert!(!page.content.contains("Home About"));
        assert!(!page.content.contains("Copyright"));
    }

    #[test]
    fn short_container_falls_back_to_body() {
        let html = r#"<html><body><nav>Navigation</nav><main>Tiny</main><p>Body text</p></body></html>"#;
        let page = extract_page(html, &base(), &ExtractOptions::default());
        assert!(page.content.contains("Navigation"));
        assert!(page.content.contains("Body text"));
    }

    #[test]
    fn full_page_ignores_containers() {
        let html = format!(
            "<html><body><nav>Menu</nav><article>{}</article></body></html>",
            long_paragraph("story")
        );
        let options = ExtractOptions {
            full_page: true,
            ..Default::default()
        };
        let page = extract_page(&html, &base(), &options);
        assert!(page.content.starts_with("Menu"));
    }

    #[test]
    fn strips_scripts_and_styles() {
        let html = r#"<html><head><style>p{color:red}</style></head><body>
            <script>var x = 1;</script><noscript>Enable JS</noscript>
            <p>Visible text.</p></body></html>"#;
        let page = extract_page(html, &base(), &ExtractOptions::default());
        assert_eq!(page.content, "Visible text.");
    }

    #[test]
    fn blocks_become_paragraphs() {
        let html = "<body><h1>Title</h1><p>First <b>bold</b> line.</p><p>Second.</p></body>";
        let page = extract_page(html, &base(), &ExtractOptions::default());
        assert_eq!(page.content, "Title\n\nFirst bold line.\n\nSecond.");
    }

    #[test]
    fn links_resolved_filtered_and_deduped() {
        let html = r##"<body>
            <a href="/about">About</a>
            <a href="guide#intro">Guide</a>
            <a href="guide">Guide again</a>
            <a href="#top">Top</a>
            <a href="mailto:hi@example.com">Mail</a>
            <a href="tel:123">Call</a>
            <a href="javascript:void(0)">JS</a>
            <a href="https://other.org/x">Other</a>
            <img src="img/logo.png"><img src="data:image/png;base64,AAAA">
        </body>"##;
        let page = extract_page(html, &base(), &ExtractOptions::default());
        assert_eq!(
            page.links,
            vec![
                "https://example.com/about",
                "https://example.com/docs/guide",
                "https://other.org/x",
            ]
        );
        assert_eq!(page.images, vec!["https://example.com/docs/img/logo.png"]);
    }

    #[test]
    fn title_falls_back_to_h1() {
        let html = "<html><body><h1>Heading</h1><p>x</p></body></html>";
        let page = extract_page(html, &base(), &ExtractOptions::default());
        assert_eq!(page.title.as_deref(), Some("Heading"));
    }

    #[test]
    fn html_to_text_reads_everything() {
        assert_eq!(
            html_to_text("<p>One</p><div>Two</div>"),
            "One\n\nTwo"
        );
    }
}
