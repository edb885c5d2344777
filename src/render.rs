//! Headless-browser fallback.
//!
//! Client-side rendered sites come back nearly empty from a plain GET. For
//! those, the crawler re-runs the crawl through a [`Renderer`] that executes
//! JavaScript and returns the final DOM as HTML.
//!
//! Browser instances are expensive, so access goes through a [`BrowserPool`]:
//! a hard cap on concurrent instances with explicit acquire/release. A
//! [`BrowserLease`] is held for the duration of one fallback pass and
//! released when dropped.
//!
//! [`RemoteRenderer`] talks to an HTTP rendering service
//! (`POST {endpoint}/content` with `{"url": ...}`, HTML in the response body),
//! the interface exposed by hosted headless-Chrome services.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use url::Url;

use crate::config::RenderConfig;
use crate::error::FetchError;
use crate::fetch::{parse_page_url, FetchedPage, PageFetcher};
use crate::html::{extract_page, ExtractOptions};

/// Produces the rendered HTML of a page.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<String, FetchError>;
}

/// Renderer backed by an HTTP rendering service.
pub struct RemoteRenderer {
    client: reqwest::Client,
    content_url: Url,
}

impl RemoteRenderer {
    pub fn new(config: &RenderConfig, user_agent: &str) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .with_context(|| format!("invalid render endpoint: {}", config.endpoint))?;
        let content_url = endpoint
            .join("content")
            .with_context(|| format!("invalid render endpoint: {}", config.endpoint))?;
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build render client")?;
        Ok(Self {
            client,
            content_url,
        })
    }
}

#[async_trait]
impl Renderer for RemoteRenderer {
    async fn render(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .post(self.content_url.clone())
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await
            .map_err(|e| FetchError::Render(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Render(format!("render service returned HTTP {}", status)));
        }
        response
            .text()
            .await
            .map_err(|e| FetchError::Render(e.to_string()))
    }
}

/// Bounded pool of renderer instances.
#[derive(Clone)]
pub struct BrowserPool {
    renderer: Arc<dyn Renderer>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl BrowserPool {
    pub fn new(renderer: Arc<dyn Renderer>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            renderer,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn from_config(config: &RenderConfig, user_agent: &str) -> Result<Self> {
        let renderer = RemoteRenderer::new(config, user_agent)?;
        Ok(Self::new(Arc::new(renderer), config.max_instances))
    }

    /// Wait for a free instance.
    pub async fn acquire(&self) -> Result<BrowserLease> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("browser pool closed")?;
        debug!(available = self.available(), "browser instance acquired");
        Ok(BrowserLease {
            renderer: self.renderer.clone(),
            _permit: permit,
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Exclusive use of one renderer instance; released on drop.
pub struct BrowserLease {
    renderer: Arc<dyn Renderer>,
    _permit: OwnedSemaphorePermit,
}

/// [`PageFetcher`] that renders pages through a leased browser instance.
pub struct RenderedFetcher {
    lease: BrowserLease,
    options: ExtractOptions,
}

impl RenderedFetcher {
    pub fn new(lease: BrowserLease, options: ExtractOptions) -> Self {
        Self { lease, options }
    }
}

#[async_trait]
impl PageFetcher for RenderedFetcher {
    async fn fetch(&self, url: &str) -> FetchedPage {
        let parsed = match parse_page_url(url) {
            Ok(parsed) => parsed,
            Err(e) => return FetchedPage::failed(url, e),
        };
        match self.lease.renderer.render(url).await {
            Ok(html) => FetchedPage::from_extracted(url, extract_page(&html, &parsed, &self.options)),
            Err(e) => FetchedPage::failed(url, e),
        }
    }
}
