//! # Ingest Harness
//!
//! Turns websites, uploaded files, free text and Q&A pairs into positioned,
//! hashed chunks ready for retrieval.
//!
//! Website sources are crawled breadth-first within their registrable
//! domain. Each page is chunked and persisted as soon as it arrives, so a
//! crawl that dies halfway still leaves every completed page searchable.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  CrawlEvent  ┌──────────────┐  append  ┌──────────┐
//! │  Crawl   │─────────────▶│ Progressive  │─────────▶│  Store   │
//! │Controller│   (mpsc)     │    Crawl     │          │ (SQLite) │
//! └────┬─────┘              └──────┬───────┘          └──────────┘
//!      │ fetch                     │ publish
//!      ▼                           ▼
//! ┌──────────┐              ┌──────────────┐
//! │HTTP/Render│             │   PubSub     │──▶ SSE / CLI progress
//! └──────────┘              └──────────────┘
//! ```
//!
//! Jobs enter through the [`queue::JobQueue`]; a bounded pool of
//! [`worker::CrawlWorker`]s runs them with retry and backoff.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the `Store` trait |
//! | [`html`] | Main-content extraction and link discovery |
//! | [`fetch`] | HTTP page fetcher |
//! | [`render`] | Headless rendering fallback and its instance pool |
//! | [`crawl`] | Bounded breadth-first crawler |
//! | [`persist`] | Chunk persistence (replace and append) |
//! | [`orchestrator`] | Progressive crawl: persist each page as it arrives |
//! | [`pubsub`] | Live progress fan-out |
//! | [`worker`] | Crawl job processing |
//! | [`queue`] | Job queue, worker pool and retries |
//! | [`objects`] | Object storage for uploaded files |
//! | [`extract`] | Text extraction from uploaded files |
//! | [`sources`] | Source creation and non-crawl ingestion |
//! | [`get`] | Source and chunk retrieval |
//! | [`progress`] | CLI progress reporters |
//! | [`server`] | HTTP API |

pub mod config;
pub mod crawl;
pub mod db;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod get;
pub mod html;
pub mod migrate;
pub mod objects;
pub mod orchestrator;
pub mod persist;
pub mod progress;
pub mod pubsub;
pub mod queue;
pub mod render;
pub mod server;
pub mod sources;
pub mod sqlite_store;
pub mod worker;

pub use ingest_harness_core::{chunk, models, store};
