//! Page fetching.
//!
//! [`PageFetcher`] is the seam between the crawl loop and the network. The
//! primary implementation, [`HttpFetcher`], does a plain GET with a browser
//! User-Agent, follows redirects, rejects non-HTML responses, caps the body
//! size, and runs [`extract_page`] on the result. The headless fallback in
//! [`render`](crate::render) implements the same trait.
//!
//! Fetchers never return `Err`: every failure is folded into
//! [`FetchedPage::error`] so one bad page cannot abort a crawl.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::redirect::Policy;
use tracing::debug;
use url::Url;

use crate::config::CrawlConfig;
use crate::error::FetchError;
use crate::html::{extract_page, ExtractOptions, ExtractedPage};

/// Outcome of fetching one URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedPage {
    /// URL as requested.
    pub url: String,
    pub title: Option<String>,
    pub content: String,
    pub links: Vec<String>,
    pub images: Vec<String>,
    pub error: Option<FetchError>,
}

impl FetchedPage {
    pub fn from_extracted(url: &str, page: ExtractedPage) -> Self {
        Self {
            url: url.to_string(),
            title: page.title,
            content: page.content,
            links: page.links,
            images: page.images,
            error: None,
        }
    }

    pub fn failed(url: &str, error: FetchError) -> Self {
        Self {
            url: url.to_string(),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// A page that failed or yielded less than `min_chars` of text.
    pub fn is_weak(&self, min_chars: usize) -> bool {
        !self.is_ok() || self.content.chars().count() < min_chars
    }
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> FetchedPage;
}

/// Plain HTTP fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
    options: ExtractOptions,
    max_bytes: usize,
}

impl HttpFetcher {
    pub fn new(config: &CrawlConfig, full_page: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(Policy::limited(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            options: ExtractOptions {
                min_container_chars: config.min_container_chars,
                full_page,
            },
            max_bytes: config.max_page_bytes,
        })
    }

    async fn try_fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let parsed = parse_page_url(url)?;

        let mut response = self
            .client
            .get(parsed)
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        if let Some(content_type) = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            if !is_html_content_type(content_type) {
                return Err(FetchError::NotHtml(content_type.to_string()));
            }
        }

        let final_url = response.url().clone();
        let mut body: Vec<u8> = Vec::new();
        while let Some(bytes) = response
            .chunk()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?
        {
            let room = self.max_bytes.saturating_sub(body.len());
            if bytes.len() >= room {
                body.extend_from_slice(&bytes[..room]);
                debug!(url, limit = self.max_bytes, "response body truncated");
                break;
            }
            body.extend_from_slice(&bytes);
        }

        let html = String::from_utf8_lossy(&body);
        let page = extract_page(&html, &final_url, &self.options);
        Ok(FetchedPage::from_extracted(url, page))
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> FetchedPage {
        match self.try_fetch(url).await {
            Ok(page) => page,
            Err(e) => {
                debug!(url, error = %e, "page fetch failed");
                FetchedPage::failed(url, e)
            }
        }
    }
}

/// Parse a URL that is about to be fetched; only http(s) is allowed.
pub fn parse_page_url(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(FetchError::InvalidUrl(url.to_string()));
    }
    Ok(parsed)
}

fn is_html_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime == "text/html" || mime == "application/xhtml+xml"
}
