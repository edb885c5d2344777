//! Breadth-first crawl controller.
//!
//! [`CrawlController::run`] walks a site from one seed URL, one page at a
//! time, and pushes a [`CrawlEvent`] over a bounded channel before and after
//! every fetch. Consumers act on a page the moment its "after" event arrives,
//! which is what lets chunks land while the crawl is still running.
//!
//! # Rules
//!
//! - Seeds without a scheme get `https://`. A seed that still does not parse
//!   as an http(s) URL with a host fails the crawl immediately.
//! - Expansion happens only with `crawl_subpages`, and only to links on the
//!   seed's domain (a leading `www.` is ignored on both sides).
//! - Links are dropped when they look like files, point at well-known
//!   external platforms, sit under non-content prefixes (`/api/`,
//!   `/assets/`, ...), or fail the job's include/exclude globs.
//! - The frontier is deduplicated against visited and queued URLs, and new
//!   links are only queued while `visited + queued < max_pages`, so a crawl
//!   never touches more than `max_pages` distinct URLs.
//! - A failed page is recorded and skipped; it never fails the crawl.
//! - Fetches are separated by the politeness delay (longer for slow jobs).
//!
//! # Render fallback
//!
//! When a [`BrowserPool`] is attached and the HTTP pass is weak (at least
//! `weak_page_ratio` of attempted pages failed or produced fewer than
//! `weak_content_chars` characters), the controller leases one browser
//! instance and crawls again from the seed through it. Pages from that pass
//! carry `rendered`. `pages_processed` keeps counting across both passes. The lease is released as soon as the
//! second pass ends.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ingest_harness_core::models::{CrawlJob, CrawlPhase, CrawlProgress, PageError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::CrawlConfig;
use crate::error::{CrawlError, FetchError};
use crate::fetch::PageFetcher;
use crate::html::ExtractOptions;
use crate::render::{BrowserPool, RenderedFetcher};

/// File extensions that never lead to an HTML page.
const SKIPPED_EXTENSIONS: &[&str] = &[
    "pdf", "jpg", "jpeg", "png", "gif", "svg", "webp", "ico", "bmp", "tif", "tiff", "css",
    "js", "mjs", "json", "xml", "rss", "atom", "txt", "csv", "zip", "gz", "tgz", "tar", "rar",
    "7z", "mp3", "wav", "ogg", "mp4", "m4v", "avi", "mov", "wmv", "webm", "woff", "woff2",
    "ttf", "otf", "eot", "exe", "dmg", "msi", "apk", "doc", "docx", "xls", "xlsx", "ppt",
    "pptx",
];

/// Hosts whose pages are never site content.
const PLATFORM_DOMAINS: &[&str] = &[
    "facebook.com",
    "twitter.com",
    "x.com",
    "instagram.com",
    "linkedin.com",
    "youtube.com",
    "youtu.be",
    "tiktok.com",
    "pinterest.com",
    "reddit.com",
    "github.com",
    "discord.gg",
    "t.me",
    "wa.me",
];

const SKIPPED_PATH_PREFIXES: &[&str] = &[
    "/api/",
    "/assets/",
    "/static/",
    "/_next/",
    "/cdn-cgi/",
    "/wp-admin/",
    "/wp-json/",
    "/wp-content/",
    "/admin/",
    "/login",
    "/logout",
    "/signin",
    "/signup",
    "/register",
    "/cart",
    "/checkout",
    "/feed",
];

/// Per-crawl knobs, usually taken from a [`CrawlJob`].
#[derive(Debug, Clone, Default)]
pub struct CrawlOptions {
    pub max_pages: usize,
    pub crawl_subpages: bool,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub slow: bool,
    pub full_page_content: bool,
}

impl From<&CrawlJob> for CrawlOptions {
    fn from(job: &CrawlJob) -> Self {
        Self {
            max_pages: job.max_pages,
            crawl_subpages: job.crawl_subpages,
            include_paths: job.include_paths.clone(),
            exclude_paths: job.exclude_paths.clone(),
            slow: job.slow,
            full_page_content: job.full_page_content,
        }
    }
}

/// One fetched page as seen by consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawledPage {
    pub url: String,
    /// Link distance from the seed.
    pub depth: u32,
    pub title: Option<String>,
    pub content: String,
    /// In-scope links found on the page.
    pub links: Vec<String>,
    pub images: Vec<String>,
    pub error: Option<FetchError>,
    pub crawled_at: DateTime<Utc>,
    /// Fetched by the headless render pass.
    pub rendered: bool,
}

impl CrawledPage {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// A page that failed or yielded less than `min_chars` of text.
    pub fn is_weak(&self, min_chars: usize) -> bool {
        !self.is_ok() || self.content.chars().count() < min_chars
    }
}

/// Progress snapshot, plus the finished page on "after" events.
#[derive(Debug, Clone)]
pub struct CrawlEvent {
    pub progress: CrawlProgress,
    pub page: Option<CrawledPage>,
}

/// Final outcome of a crawl.
#[derive(Debug, Clone, Default)]
pub struct CrawlSummary {
    pub pages_processed: usize,
    /// Distinct URLs fetched, in first-visit order.
    pub visited: Vec<String>,
    pub discovered_links: Vec<String>,
    pub errors: Vec<PageError>,
    pub used_fallback: bool,
}

pub struct CrawlController {
    fetcher: Arc<dyn PageFetcher>,
    browser_pool: Option<BrowserPool>,
    config: CrawlConfig,
}

impl CrawlController {
    pub fn new(fetcher: Arc<dyn PageFetcher>, config: CrawlConfig) -> Self {
        Self {
            fetcher,
            browser_pool: None,
            config,
        }
    }

    pub fn with_browser_pool(mut self, pool: Option<BrowserPool>) -> Self {
        self.browser_pool = pool;
        self
    }

    /// Character count below which an HTTP page may be fetched again by the
    /// render pass. `None` without a browser pool.
    pub fn fallback_threshold(&self) -> Option<usize> {
        self.browser_pool
            .as_ref()
            .map(|_| self.config.weak_content_chars)
    }

    /// Crawl from `seed`, emitting events on `events`.
    ///
    /// Fails only on controller-level faults ([`CrawlError`]): an invalid
    /// seed or filter (a `failed` event is emitted first), or a dropped
    /// receiver.
    pub async fn run(
        &self,
        seed: &str,
        options: &CrawlOptions,
        events: mpsc::Sender<CrawlEvent>,
    ) -> Result<CrawlSummary> {
        let max_pages = options.max_pages.max(1);

        let prepared = normalize_seed(seed).and_then(|seed_url| {
            let scope = Scope::new(&seed_url, options)?;
            Ok((seed_url, scope))
        });
        let (seed_url, scope) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(seed, error = %e, "crawl failed before the first fetch");
                let mut progress = CrawlProgress::start(max_pages);
                progress.phase = CrawlPhase::Failed;
                progress.error = Some(e.to_string());
                // Best effort: the receiver may already be gone.
                let _ = events
                    .send(CrawlEvent {
                        progress,
                        page: None,
                    })
                    .await;
                return Err(e.into());
            }
        };

        info!(
            seed = %seed_url,
            max_pages,
            crawl_subpages = options.crawl_subpages,
            "starting crawl"
        );

        let mut state = CrawlState::new(max_pages, self.config.discovered_links_limit);
        send(
            &events,
            CrawlEvent {
                progress: CrawlProgress::start(max_pages),
                page: None,
            },
        )
        .await?;

        let http_pass = self
            .crawl_pass(
                self.fetcher.as_ref(),
                &seed_url,
                &scope,
                options,
                &mut state,
                &events,
            )
            .await?;

        if let Some(pool) = &self.browser_pool {
            if http_pass.is_weak(self.config.weak_page_ratio) {
                info!(
                    attempted = http_pass.attempted,
                    weak = http_pass.weak,
                    "HTTP pass produced little content, retrying with the headless renderer"
                );
                let lease = pool.acquire().await?;
                let rendered = RenderedFetcher::new(
                    lease,
                    ExtractOptions {
                        min_container_chars: self.config.min_container_chars,
                        full_page: options.full_page_content,
                    },
                );
                state.total_pages = state.pages_processed + max_pages;
                state.used_fallback = true;
                let fallback_pass = self
                    .crawl_pass(&rendered, &seed_url, &scope, options, &mut state, &events)
                    .await;
                drop(rendered);
                fallback_pass?;
            }
        }

        let summary = state.summary();
        let mut done = state.progress(None);
        done.phase = CrawlPhase::Completed;
        send(
            &events,
            CrawlEvent {
                progress: done,
                page: None,
            },
        )
        .await?;

        info!(
            pages = summary.pages_processed,
            errors = summary.errors.len(),
            fallback = summary.used_fallback,
            "crawl complete"
        );
        Ok(summary)
    }

    async fn crawl_pass(
        &self,
        fetcher: &dyn PageFetcher,
        seed: &Url,
        scope: &Scope,
        options: &CrawlOptions,
        state: &mut CrawlState,
        events: &mpsc::Sender<CrawlEvent>,
    ) -> Result<PassStats> {
        let delay = Duration::from_millis(if options.slow {
            self.config.slow_politeness_ms
        } else {
            self.config.politeness_ms
        });

        let seed_key = canonical_url(seed);
        let mut frontier: VecDeque<(String, u32)> = VecDeque::from([(seed_key.clone(), 0)]);
        let mut queued: HashSet<String> = HashSet::from([seed_key]);
        let mut pass_visited: HashSet<String> = HashSet::new();
        let mut stats = PassStats::default();

        while let Some((url, depth)) = frontier.pop_front() {
            queued.remove(&url);
            if pass_visited.len() >= state.max_pages {
                break;
            }
            if !state.distinct.contains(&url) && state.distinct.len() >= state.max_pages {
                continue;
            }
            pass_visited.insert(url.clone());
            if state.distinct.insert(url.clone()) {
                state.visited.push(url.clone());
            }

            if state.fetches > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            state.fetches += 1;

            send(
                events,
                CrawlEvent {
                    progress: state.progress(Some(&url)),
                    page: None,
                },
            )
            .await?;

            debug!(url = %url, depth, "fetching page");
            let fetched = fetcher.fetch(&url).await;
            state.pages_processed += 1;
            stats.attempted += 1;
            if fetched.is_weak(self.config.weak_content_chars) {
                stats.weak += 1;
            }

            let mut in_scope = Vec::new();
            match &fetched.error {
                Some(error) => {
                    warn!(url = %url, error = %error, "page failed, continuing");
                    state.errors.push(PageError {
                        url: url.clone(),
                        error: error.to_string(),
                    });
                }
                None => {
                    for link in &fetched.links {
                        let Ok(parsed) = Url::parse(link) else {
                            continue;
                        };
                        if !scope.accepts(&parsed) {
                            continue;
                        }
                        let key = canonical_url(&parsed);
                        state.record_discovered(&key);
                        in_scope.push(key);
                    }

                    if options.crawl_subpages {
                        let mut remaining = state
                            .max_pages
                            .saturating_sub(pass_visited.len() + frontier.len());
                        for key in &in_scope {
                            if remaining == 0 {
                                break;
                            }
                            if pass_visited.contains(key) || queued.contains(key) {
                                continue;
                            }
                            frontier.push_back((key.clone(), depth + 1));
                            queued.insert(key.clone());
                            remaining -= 1;
                        }
                    }
                }
            }

            let page = CrawledPage {
                url: url.clone(),
                depth,
                title: fetched.title,
                content: fetched.content,
                links: in_scope,
                images: fetched.images,
                error: fetched.error,
                crawled_at: Utc::now(),
                rendered: state.used_fallback,
            };
            send(
                events,
                CrawlEvent {
                    progress: state.progress(Some(&url)),
                    page: Some(page),
                },
            )
            .await?;
        }

        Ok(stats)
    }
}

async fn send(events: &mpsc::Sender<CrawlEvent>, event: CrawlEvent) -> Result<(), CrawlError> {
    events.send(event).await.map_err(|_| CrawlError::Aborted)
}

#[derive(Debug, Default, Clone, Copy)]
struct PassStats {
    attempted: usize,
    weak: usize,
}

impl PassStats {
    fn is_weak(&self, ratio: f64) -> bool {
        self.attempted > 0 && self.weak as f64 >= ratio * self.attempted as f64
    }
}

struct CrawlState {
    max_pages: usize,
    total_pages: usize,
    pages_processed: usize,
    fetches: usize,
    distinct: HashSet<String>,
    visited: Vec<String>,
    discovered: Vec<String>,
    discovered_set: HashSet<String>,
    discovered_limit: usize,
    errors: Vec<PageError>,
    used_fallback: bool,
}

impl CrawlState {
    fn new(max_pages: usize, discovered_limit: usize) -> Self {
        Self {
            max_pages,
            total_pages: max_pages,
            pages_processed: 0,
            fetches: 0,
            distinct: HashSet::new(),
            visited: Vec::new(),
            discovered: Vec::new(),
            discovered_set: HashSet::new(),
            discovered_limit,
            errors: Vec::new(),
            used_fallback: false,
        }
    }

    fn record_discovered(&mut self, url: &str) {
        if self.discovered.len() < self.discovered_limit && self.discovered_set.insert(url.to_string())
        {
            self.discovered.push(url.to_string());
        }
    }

    fn progress(&self, current_url: Option<&str>) -> CrawlProgress {
        CrawlProgress {
            phase: CrawlPhase::Processing,
            pages_processed: self.pages_processed,
            total_pages: self.total_pages,
            current_url: current_url.map(str::to_string),
            discovered_links: self.discovered.clone(),
            error: None,
        }
    }

    fn summary(&self) -> CrawlSummary {
        CrawlSummary {
            pages_processed: self.pages_processed,
            visited: self.visited.clone(),
            discovered_links: self.discovered.clone(),
            errors: self.errors.clone(),
            used_fallback: self.used_fallback,
        }
    }
}

/// Which links a crawl may follow.
struct Scope {
    domain: String,
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl Scope {
    fn new(seed: &Url, options: &CrawlOptions) -> Result<Self, CrawlError> {
        Ok(Self {
            domain: registrable_domain(seed).unwrap_or_default(),
            include: build_globset(&options.include_paths)?,
            exclude: build_globset(&options.exclude_paths)?,
        })
    }

    fn accepts(&self, url: &Url) -> bool {
        if registrable_domain(url).as_deref() != Some(self.domain.as_str()) {
            return false;
        }
        if !is_crawlable_url(url) {
            return false;
        }
        let path = url.path();
        if let Some(include) = &self.include {
            if !include.is_match(path) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(path) {
                return false;
            }
        }
        true
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>, CrawlError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| CrawlError::InvalidFilter {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| CrawlError::InvalidFilter {
            pattern: patterns.join(", "),
            reason: e.to_string(),
        })
}

/// Parse a user-supplied seed, defaulting the scheme to `https://`.
pub fn normalize_seed(seed: &str) -> Result<Url, CrawlError> {
    let trimmed = seed.trim();
    let invalid = |reason: String| CrawlError::InvalidSeed {
        url: seed.to_string(),
        reason,
    };
    if trimmed.is_empty() {
        return Err(invalid("empty URL".to_string()));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let url = Url::parse(&candidate).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

/// Identity of a page for dedup: no fragment, no trailing slash except
/// on the root path.
pub fn canonical_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    url.to_string()
}

/// Host with a leading `www.` removed, lower-cased.
pub fn registrable_domain(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").map(str::to_string).unwrap_or(host))
}

/// Reject URLs that look like files, external platforms, or non-content
/// sections.
pub fn is_crawlable_url(url: &Url) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }

    if let Some(domain) = registrable_domain(url) {
        let is_platform = PLATFORM_DOMAINS
            .iter()
            .any(|p| domain == *p || domain.ends_with(&format!(".{}", p)));
        if is_platform {
            return false;
        }
    }

    let path = url.path().to_ascii_lowercase();
    if SKIPPED_PATH_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
    {
        return false;
    }

    let last_segment = path.rsplit('/').next().unwrap_or_default();
    if let Some((_, ext)) = last_segment.rsplit_once('.') {
        if SKIPPED_EXTENSIONS.contains(&ext) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchedPage;
    use crate::render::Renderer;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory site: URL -> (html-less) page.
    struct FakeSite {
        pages: HashMap<String, FetchedPage>,
        fetched: Mutex<Vec<String>>,
    }

    impl FakeSite {
        fn new() -> Self {
            Self {
                pages: HashMap::new(),
                fetched: Mutex::new(Vec::new()),
            }
        }

        fn page(mut self, url: &str, content: &str, links: &[&str]) -> Self {
            self.pages.insert(
                url.to_string(),
                FetchedPage {
                    url: url.to_string(),
                    title: Some(format!("Title of {}", url)),
                    content: content.to_string(),
                    links: links.iter().map(|l| l.to_string()).collect(),
                    images: vec![],
                    error: None,
                },
            );
            self
        }

        fn broken(mut self, url: &str, status: u16) -> Self {
            self.pages.insert(
                url.to_string(),
                FetchedPage::failed(url, FetchError::HttpStatus(status)),
            );
            self
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for FakeSite {
        async fn fetch(&self, url: &str) -> FetchedPage {
            self.fetched.lock().unwrap().push(url.to_string());
            self.pages
                .get(url)
                .cloned()
                .unwrap_or_else(|| FetchedPage::failed(url, FetchError::HttpStatus(404)))
        }
    }

    fn config() -> CrawlConfig {
        CrawlConfig {
            politeness_ms: 0,
            slow_politeness_ms: 0,
            ..Default::default()
        }
    }

    fn options(max_pages: usize) -> CrawlOptions {
        CrawlOptions {
            max_pages,
            crawl_subpages: true,
            ..Default::default()
        }
    }

    async fn run(
        controller: &CrawlController,
        seed: &str,
        options: &CrawlOptions,
    ) -> (Result<CrawlSummary>, Vec<CrawlEvent>) {
        let (tx, mut rx) = mpsc::channel(1024);
        let result = controller.run(seed, options, tx).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (result, events)
    }

    fn five_link_site() -> FakeSite {
        FakeSite::new()
            .page(
                "https://example.com/",
                "Home page.",
                &[
                    "https://example.com/a",
                    "https://example.com/b",
                    "https://example.com/c",
                    "https://example.com/d",
                    "https://example.com/e",
                ],
            )
            .page("https://example.com/a", "Page A.", &[])
            .page("https://example.com/b", "Page B.", &[])
            .page("https://example.com/c", "Page C.", &[])
            .page("https://example.com/d", "Page D.", &[])
            .page("https://example.com/e", "Page E.", &[])
    }

    #[tokio::test]
    async fn stops_at_page_budget() {
        let site = Arc::new(five_link_site());
        let controller = CrawlController::new(site.clone(), config());
        let (result, _) = run(&controller, "example.com", &options(3)).await;
        let summary = result.unwrap();

        assert_eq!(summary.pages_processed, 3);
        assert_eq!(
            site.fetched(),
            vec![
                "https://example.com/",
                "https://example.com/a",
                "https://example.com/b"
            ]
        );
        assert_eq!(summary.discovered_links.len(), 5);
    }

    #[tokio::test]
    async fn event_sequence_brackets_each_page() {
        let site = Arc::new(five_link_site());
        let controller = CrawlController::new(site, config());
        let (result, events) = run(&controller, "https://example.com", &options(2)).await;
        result.unwrap();

        let phases: Vec<_> = events
            .iter()
            .map(|e| (e.progress.phase, e.progress.pages_processed, e.page.is_some()))
            .collect();
        assert_eq!(
            phases,
            vec![
                (CrawlPhase::Discovering, 0, false),
                (CrawlPhase::Processing, 0, false),
                (CrawlPhase::Processing, 1, true),
                (CrawlPhase::Processing, 1, false),
                (CrawlPhase::Processing, 2, true),
                (CrawlPhase::Completed, 2, false),
            ]
        );
        let second = events[4].page.as_ref().unwrap();
        assert_eq!(second.url, "https://example.com/a");
        assert_eq!(second.depth, 1);
        assert_eq!(
            events[3].progress.current_url.as_deref(),
            Some("https://example.com/a")
        );
    }

    #[tokio::test]
    async fn failed_page_is_recorded_and_crawl_continues() {
        let site = Arc::new(
            FakeSite::new()
                .page(
                    "https://example.com/",
                    "Home.",
                    &["https://example.com/2", "https://example.com/3"],
                )
                .broken("https://example.com/2", 500)
                .page("https://example.com/3", "Three.", &[]),
        );
        let controller = CrawlController::new(site.clone(), config());
        let (result, events) = run(&controller, "https://example.com/", &options(5)).await;
        let summary = result.unwrap();

        assert_eq!(summary.pages_processed, 3);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].url, "https://example.com/2");
        assert_eq!(summary.errors[0].error, "HTTP 500");
        assert_eq!(
            events.last().unwrap().progress.phase,
            CrawlPhase::Completed
        );
    }

    #[tokio::test]
    async fn without_subpages_only_the_seed_is_fetched() {
        let site = Arc::new(five_link_site());
        let controller = CrawlController::new(site.clone(), config());
        let opts = CrawlOptions {
            crawl_subpages: false,
            ..options(10)
        };
        let (result, _) = run(&controller, "https://example.com", &opts).await;
        let summary = result.unwrap();
        assert_eq!(site.fetched(), vec!["https://example.com/"]);
        assert_eq!(summary.discovered_links.len(), 5);
    }

    #[tokio::test]
    async fn cycles_and_duplicates_are_visited_once() {
        let site = Arc::new(
            FakeSite::new()
                .page(
                    "https://example.com/",
                    "Home.",
                    &[
                        "https://example.com/a",
                        "https://example.com/a/",
                        "https://example.com/a#section",
                        "https://www.example.com/b",
                        "https://other.org/x",
                        "https://example.com/file.pdf",
                        "https://example.com/api/v1/items",
                    ],
                )
                .page("https://example.com/a", "A.", &["https://example.com/"])
                .page("https://www.example.com/b", "B.", &["https://example.com/a"]),
        );
        let controller = CrawlController::new(site.clone(), config());
        let (result, _) = run(&controller, "https://example.com", &options(50)).await;
        let summary = result.unwrap();

        assert_eq!(
            site.fetched(),
            vec![
                "https://example.com/",
                "https://example.com/a",
                "https://www.example.com/b"
            ]
        );
        assert_eq!(summary.visited.len(), 3);
    }

    #[tokio::test]
    async fn include_and_exclude_globs() {
        let site = Arc::new(
            FakeSite::new()
                .page(
                    "https://example.com/",
                    "Home.",
                    &[
                        "https://example.com/docs/intro",
                        "https://example.com/docs/private/keys",
                        "https://example.com/blog/post",
                    ],
                )
                .page("https://example.com/docs/intro", "Intro.", &[]),
        );
        let controller = CrawlController::new(site.clone(), config());
        let opts = CrawlOptions {
            include_paths: vec!["/docs/**".into()],
            exclude_paths: vec!["/docs/private/**".into()],
            ..options(10)
        };
        let (result, _) = run(&controller, "https://example.com", &opts).await;
        result.unwrap();
        assert_eq!(
            site.fetched(),
            vec!["https://example.com/", "https://example.com/docs/intro"]
        );
    }

    #[tokio::test]
    async fn invalid_seed_fails_with_event() {
        let controller = CrawlController::new(Arc::new(FakeSite::new()), config());
        let (result, events) = run(&controller, "not a url at all", &options(3)).await;
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CrawlError>(),
            Some(CrawlError::InvalidSeed { .. })
        ));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].progress.phase, CrawlPhase::Failed);
        assert!(events[0].progress.error.is_some());
    }

    #[tokio::test]
    async fn invalid_glob_is_a_controller_fault() {
        let controller = CrawlController::new(Arc::new(five_link_site()), config());
        let opts = CrawlOptions {
            include_paths: vec!["/docs/[".into()],
            ..options(3)
        };
        let (result, _) = run(&controller, "https://example.com", &opts).await;
        assert!(matches!(
            result.unwrap_err().downcast_ref::<CrawlError>(),
            Some(CrawlError::InvalidFilter { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_receiver_aborts() {
        let controller = CrawlController::new(Arc::new(five_link_site()), config());
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = controller
            .run("https://example.com", &options(3), tx)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CrawlError>(),
            Some(CrawlError::Aborted)
        ));
    }

    struct SpaRenderer;

    #[async_trait]
    impl Renderer for SpaRenderer {
        async fn render(&self, url: &str) -> Result<String, FetchError> {
            Ok(format!(
                "<html><body><main><p>{}</p></main></body></html>",
                format!("Rendered content for {}. ", url).repeat(30)
            ))
        }
    }

    #[tokio::test]
    async fn weak_http_pass_triggers_render_fallback() {
        let site = Arc::new(FakeSite::new().page("https://spa.test/", "", &[]));
        let pool = BrowserPool::new(Arc::new(SpaRenderer), 1);
        let controller =
            CrawlController::new(site, config()).with_browser_pool(Some(pool.clone()));
        let (result, events) = run(&controller, "https://spa.test", &options(5)).await;
        let summary = result.unwrap();

        assert!(summary.used_fallback);
        assert_eq!(summary.pages_processed, 2);
        assert_eq!(summary.visited, vec!["https://spa.test/"]);
        assert_eq!(pool.available(), 1, "lease must be released");

        let rendered = events
            .iter()
            .filter_map(|e| e.page.as_ref())
            .find(|p| p.content.contains("Rendered content"));
        assert!(rendered.is_some_and(|p| p.rendered));
        assert!(events
            .iter()
            .filter_map(|e| e.page.as_ref())
            .filter(|p| !p.content.contains("Rendered content"))
            .all(|p| !p.rendered));

        let counts: Vec<usize> = events.iter().map(|e| e.progress.pages_processed).collect();
        assert!(counts.windows(2).all(|w| w[0] <= w[1]), "progress must be monotonic");
    }

    #[tokio::test]
    async fn healthy_http_pass_skips_fallback() {
        let body = "Plenty of server rendered text. ".repeat(30);
        let site = Arc::new(FakeSite::new().page("https://ssr.test/", &body, &[]));
        let pool = BrowserPool::new(Arc::new(SpaRenderer), 1);
        let controller = CrawlController::new(site, config()).with_browser_pool(Some(pool));
        let (result, _) = run(&controller, "https://ssr.test", &options(5)).await;
        let summary = result.unwrap();
        assert!(!summary.used_fallback);
        assert_eq!(summary.pages_processed, 1);
    }

    #[test]
    fn seed_normalization() {
        assert_eq!(
            normalize_seed("example.com").unwrap().as_str(),
            "https://example.com/"
        );
        assert_eq!(
            normalize_seed("  http://example.com/docs ").unwrap().as_str(),
            "http://example.com/docs"
        );
        assert!(normalize_seed("").is_err());
        assert!(normalize_seed("ftp://example.com").is_err());
        assert!(normalize_seed("https://").is_err());
    }

    #[test]
    fn canonical_forms() {
        let url = Url::parse("https://example.com/docs/#top").unwrap();
        assert_eq!(canonical_url(&url), "https://example.com/docs");
        let root = Url::parse("https://example.com").unwrap();
        assert_eq!(canonical_url(&root), "https://example.com/");
    }

    #[test]
    fn crawlable_url_filter() {
        let ok = |s: &str| is_crawlable_url(&Url::parse(s).unwrap());
        assert!(ok("https://example.com/docs/getting-started"));
        assert!(ok("https://example.com/v1.2/guide"));
        assert!(ok("https://example.com/page.html"));
        assert!(!ok("https://example.com/logo.PNG"));
        assert!(!ok("https://example.com/api/users"));
        assert!(!ok("https://example.com/assets/app"));
        assert!(!ok("https://www.youtube.com/watch"));
        assert!(!ok("https://m.facebook.com/page"));
    }

    #[test]
    fn www_is_ignored_for_domain_checks() {
        let a = Url::parse("https://www.Example.com/x").unwrap();
        let b = Url::parse("https://example.com/y").unwrap();
        assert_eq!(registrable_domain(&a), registrable_domain(&b));
    }
}
