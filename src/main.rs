//! # Ingest Harness CLI (`ingest`)
//!
//! ## Usage
//!
//! ```bash
//! ingest --config ./config/ingest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ingest init` | Create the SQLite database and run schema migrations |
//! | `ingest crawl <url>` | Crawl a website inline and print a summary |
//! | `ingest text <path>` | Ingest a text file as a text source |
//! | `ingest qa` | Ingest a question and answer pair |
//! | `ingest file <path>` | Upload and ingest a file (PDF, HTML, text) |
//! | `ingest chunk <path>` | Dry run: show how a file would be chunked |
//! | `ingest sources` | List sources |
//! | `ingest get <id>` | Show a source and optionally its chunks |
//! | `ingest delete <id>` | Delete a source and its chunks |
//! | `ingest serve` | Start the HTTP API and the crawl worker pool |
//!
//! Logs go to stderr and honour `RUST_LOG` (default `info`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use ingest_harness::chunk::split;
use ingest_harness::config::{self, Config};
use ingest_harness::extract::{extract_text, guess_content_type};
use ingest_harness::models::{JobRecord, SourceType};
use ingest_harness::objects::LocalObjectStore;
use ingest_harness::progress::{self, ProgressMode};
use ingest_harness::pubsub::{progress_topic, BroadcastPubSub, PubSub};
use ingest_harness::queue::{run_with_retries, JobQueue, RetryPolicy};
use ingest_harness::server::{self, AppState};
use ingest_harness::sources::{print_sources, CrawlRequest, SourceService};
use ingest_harness::sqlite_store::SqliteStore;
use ingest_harness::store::Store;
use ingest_harness::worker::CrawlWorker;
use ingest_harness::{db, get, migrate};

/// Ingest Harness: crawl websites and ingest files, text and Q&A into
/// positioned chunks.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ingest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ingest",
    about = "Crawl websites and ingest files, text and Q&A into positioned chunks",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ingest.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a TTY, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Crawl a website and chunk every page as it arrives.
    ///
    /// Runs the job inline with the configured retry policy and prints a
    /// summary when it finishes.
    Crawl {
        url: String,

        #[arg(long, default_value = "cli")]
        agent: String,

        #[arg(long, default_value = "")]
        project: String,

        /// Page budget. Defaults to `[crawl] default_max_pages`.
        #[arg(long)]
        max_pages: Option<usize>,

        /// Only crawl the seed page.
        #[arg(long)]
        no_subpages: bool,

        /// Glob on the URL path; only matching pages are crawled.
        #[arg(long = "include")]
        include_paths: Vec<String>,

        /// Glob on the URL path; matching pages are skipped.
        #[arg(long = "exclude")]
        exclude_paths: Vec<String>,

        /// Use the slow politeness delay.
        #[arg(long)]
        slow: bool,

        /// Keep the whole body instead of the main content container.
        #[arg(long)]
        full_page: bool,
    },

    /// Ingest a text file as a text source.
    Text {
        path: PathBuf,

        /// Defaults to the file name.
        #[arg(long)]
        title: Option<String>,

        #[arg(long, default_value = "cli")]
        agent: String,

        #[arg(long, default_value = "")]
        project: String,
    },

    /// Ingest a question and answer pair.
    Qa {
        #[arg(long)]
        question: String,

        #[arg(long)]
        answer: String,

        #[arg(long, default_value = "cli")]
        agent: String,

        #[arg(long, default_value = "")]
        project: String,
    },

    /// Upload a file to object storage and ingest its text.
    File {
        path: PathBuf,

        /// Overrides the content type guessed from the extension.
        #[arg(long)]
        content_type: Option<String>,

        #[arg(long, default_value = "cli")]
        agent: String,

        #[arg(long, default_value = "")]
        project: String,
    },

    /// Dry run: chunk a file with a source type's strategy and print the
    /// chunks without writing anything.
    Chunk {
        path: PathBuf,

        #[arg(long, value_enum, default_value = "text")]
        profile: ChunkProfile,
    },

    /// List sources.
    Sources {
        /// Only show sources of this agent.
        #[arg(long)]
        agent: Option<String>,
    },

    /// Show a source by ID.
    Get {
        id: String,

        /// Also print every chunk.
        #[arg(long)]
        chunks: bool,
    },

    /// Delete a source, its chunks and its stored file.
    Delete { id: String },

    /// Start the HTTP API and the crawl worker pool.
    Serve,
}

#[derive(Clone, Copy, ValueEnum)]
enum ChunkProfile {
    Website,
    Text,
    File,
    Qa,
}

impl From<ChunkProfile> for SourceType {
    fn from(profile: ChunkProfile) -> Self {
        match profile {
            ChunkProfile::Website => SourceType::Website,
            ChunkProfile::Text => SourceType::Text,
            ChunkProfile::File => SourceType::File,
            ChunkProfile::Qa => SourceType::Qa,
        }
    }
}

/// Open the database (applying migrations) and wrap it as a store.
async fn open_store(cfg: &Config) -> Result<Arc<dyn Store>> {
    let pool = db::connect(cfg).await?;
    migrate::apply(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

fn source_service(cfg: &Arc<Config>, store: Arc<dyn Store>) -> SourceService {
    let objects = Arc::new(LocalObjectStore::new(&cfg.storage.objects_root));
    SourceService::new(cfg.clone(), store, objects)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = Arc::new(config::load_config(&cli.config)?);
    let progress_mode = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Crawl {
            url,
            agent,
            project,
            max_pages,
            no_subpages,
            include_paths,
            exclude_paths,
            slow,
            full_page,
        } => {
            let request = CrawlRequest {
                url,
                agent_id: agent,
                project_id: project,
                max_pages,
                crawl_subpages: !no_subpages,
                include_paths,
                exclude_paths,
                slow,
                full_page_content: full_page,
            };
            run_crawl(cfg, &request, progress_mode).await?;
        }
        Commands::Text {
            path,
            title,
            agent,
            project,
        } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let title = title.unwrap_or_else(|| file_name_of(&path));
            let store = open_store(&cfg).await?;
            let source = source_service(&cfg, store)
                .ingest_text(&agent, &project, &title, &text)
                .await?;
            println!("source_id: {}", source.id);
            println!("status: {}", source.status);
            println!("chunks: {}", source.chunk_count);
        }
        Commands::Qa {
            question,
            answer,
            agent,
            project,
        } => {
            let store = open_store(&cfg).await?;
            let source = source_service(&cfg, store)
                .ingest_qa(&agent, &project, &question, &answer)
                .await?;
            println!("source_id: {}", source.id);
            println!("status: {}", source.status);
            println!("chunks: {}", source.chunk_count);
        }
        Commands::File {
            path,
            content_type,
            agent,
            project,
        } => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let store = open_store(&cfg).await?;
            let source = source_service(&cfg, store)
                .ingest_file(
                    &agent,
                    &project,
                    &file_name_of(&path),
                    &bytes,
                    content_type.as_deref(),
                )
                .await?;
            println!("source_id: {}", source.id);
            println!("status: {}", source.status);
            println!("chunks: {}", source.chunk_count);
            println!("size_kb: {:.1}", source.size_kb());
        }
        Commands::Chunk { path, profile } => {
            run_chunk(&cfg, &path, profile.into())?;
        }
        Commands::Sources { agent } => {
            let store = open_store(&cfg).await?;
            let sources = store.list_sources(agent.as_deref()).await?;
            print_sources(&sources);
        }
        Commands::Get { id, chunks } => {
            let store = open_store(&cfg).await?;
            get::run_get(store.as_ref(), &id, chunks).await?;
        }
        Commands::Delete { id } => {
            let store = open_store(&cfg).await?;
            if !source_service(&cfg, store).delete(&id).await? {
                bail!("source not found: {}", id);
            }
            println!("deleted: {}", id);
        }
        Commands::Serve => {
            let store = open_store(&cfg).await?;
            let pubsub = Arc::new(BroadcastPubSub::default());
            let worker = CrawlWorker::new(&cfg, store.clone(), pubsub.clone())?;
            let queue = Arc::new(JobQueue::connect(worker, &cfg.worker));
            let state = AppState {
                config: cfg.clone(),
                sources: Arc::new(source_service(&cfg, store)),
                queue,
                pubsub,
            };
            server::run_server(state).await?;
        }
    }

    Ok(())
}

/// Create a website source and run its crawl job in this process.
async fn run_crawl(cfg: Arc<Config>, request: &CrawlRequest, mode: ProgressMode) -> Result<()> {
    let store = open_store(&cfg).await?;
    let pubsub = Arc::new(BroadcastPubSub::default());
    let worker = CrawlWorker::new(&cfg, store.clone(), pubsub.clone())?;
    let service = source_service(&cfg, store.clone());

    let (source, job) = service.create_website(request).await?;
    let record = JobRecord::new(job);
    store.upsert_job(&record).await?;

    let follower = tokio::spawn(progress::follow(
        pubsub.subscribe(&progress_topic(&source.id)),
        mode.reporter(),
    ));
    let record = run_with_retries(&worker, &RetryPolicy::from_config(&cfg.worker), record).await;
    // The topic is dropped with the pub/sub, which ends the follower.
    drop(worker);
    drop(pubsub);
    let _ = follower.await;

    let source = store
        .get_source(&source.id)
        .await?
        .with_context(|| format!("source {} disappeared", source.id))?;
    let pages = source
        .metadata
        .as_website()
        .map(|m| m.pages_crawled)
        .unwrap_or_default();

    println!("source_id: {}", source.id);
    println!("job_id: {}", record.id);
    println!("status: {}", source.status);
    println!("attempts: {}", record.attempts);
    println!("pages: {}", pages);
    println!("chunks: {}", source.chunk_count);
    println!("size_kb: {:.1}", source.size_kb());
    if let Some(ref message) = source.error_message {
        println!("error: {}", message);
        bail!("crawl failed: {}", message);
    }
    Ok(())
}

/// Print how `path` would be chunked without touching the database.
fn run_chunk(cfg: &Config, path: &Path, source_type: SourceType) -> Result<()> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = file_name_of(path);
    let extracted = extract_text(&bytes, guess_content_type(&file_name))
        .with_context(|| format!("failed to extract text from {}", file_name))?;

    let mut strategy = cfg.strategy_for(source_type).clone();
    if extracted.is_paged() {
        strategy.split_on = ingest_harness::chunk::SplitOn::Page;
    }
    let output = split(&extracted.text, &strategy);

    println!("file: {}", path.display());
    println!("profile: {}", source_type);
    println!("chunks: {}", output.segments.len());
    println!("truncated: {}", output.truncated);
    println!();
    println!("{:>5} {:>8} {:>8} {:>7}  PREVIEW", "POS", "START", "END", "TOKENS");
    for (position, segment) in output.segments.iter().enumerate() {
        let preview: String = segment.text.chars().take(60).collect();
        println!(
            "{:>5} {:>8} {:>8} {:>7}  {}",
            position,
            segment.start,
            segment.end,
            ingest_harness::chunk::estimate_tokens(&segment.text),
            preview.replace('\n', " ")
        );
    }
    Ok(())
}
