//! Crawl progress reporting for the CLI.
//!
//! `ingest crawl` subscribes to the source's progress topic and hands each
//! [`ProgressMessage`] to a reporter. Progress goes to **stderr** so stdout
//! keeps the final `key: value` summary parseable for scripts.

use std::io::Write;

use ingest_harness_core::models::CrawlPhase;
use tokio::sync::broadcast;

use crate::pubsub::ProgressMessage;

/// Reports crawl progress. Implementations write to stderr (human or JSON).
pub trait CrawlProgressReporter: Send + Sync {
    fn report(&self, message: &ProgressMessage);
}

/// Human-friendly progress on stderr:
/// `crawl 3f2c…  processing  12 / 50 pages  (34 chunks)  https://…`.
pub struct StderrProgress;

impl CrawlProgressReporter for StderrProgress {
    fn report(&self, message: &ProgressMessage) {
        let line = human_line(message);
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
        let _ = stderr.flush();
    }
}

fn human_line(message: &ProgressMessage) -> String {
    let progress = &message.progress;
    let id = short_id(&message.source_id);
    match progress.phase {
        CrawlPhase::Discovering => format!("crawl {}  discovering...", id),
        CrawlPhase::Processing => {
            let mut line = format!(
                "crawl {}  processing  {} / {} pages  ({} chunks)",
                id,
                format_number(progress.pages_processed as u64),
                format_number(progress.total_pages as u64),
                format_number(message.chunk_count.max(0) as u64),
            );
            if let Some(ref url) = progress.current_url {
                line.push_str("  ");
                line.push_str(url);
            }
            line
        }
        CrawlPhase::Completed => format!(
            "crawl {}  {}  {} pages, {} chunks, {:.1} KB",
            id,
            message.status,
            format_number(progress.pages_processed as u64),
            format_number(message.chunk_count.max(0) as u64),
            message.size_kb,
        ),
        CrawlPhase::Failed => format!(
            "crawl {}  failed  {}",
            id,
            progress.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl CrawlProgressReporter for JsonProgress {
    fn report(&self, message: &ProgressMessage) {
        let obj = serde_json::json!({
            "event": "progress",
            "source_id": message.source_id,
            "status": message.status,
            "phase": message.progress.phase,
            "pages_processed": message.progress.pages_processed,
            "total_pages": message.progress.total_pages,
            "current_url": message.progress.current_url,
            "chunk_count": message.chunk_count,
            "size_kb": message.size_kb,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl CrawlProgressReporter for NoProgress {
    fn report(&self, _message: &ProgressMessage) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn CrawlProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

/// Forward progress messages from a subscription to `reporter` until the
/// channel closes or a terminal phase arrives.
///
/// Payloads that do not decode as [`ProgressMessage`] are skipped, as are
/// gaps from a lagging receiver.
pub async fn follow(
    mut rx: broadcast::Receiver<serde_json::Value>,
    reporter: Box<dyn CrawlProgressReporter>,
) {
    loop {
        match rx.recv().await {
            Ok(value) => {
                let Ok(message) = serde_json::from_value::<ProgressMessage>(value) else {
                    continue;
                };
                reporter.report(&message);
                if message.progress.phase.is_terminal() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_harness_core::models::{CrawlProgress, SourceStatus};
    use std::sync::{Arc, Mutex};

    fn message(phase: CrawlPhase, processed: usize) -> ProgressMessage {
        let mut progress = CrawlProgress::start(10);
        progress.phase = phase;
        progress.pages_processed = processed;
        ProgressMessage {
            source_id: "0123456789abcdef".into(),
            status: SourceStatus::Processing,
            progress,
            chunk_count: 1500,
            size_kb: 2.5,
        }
    }

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn human_line_shows_counts() {
        let line = human_line(&message(CrawlPhase::Processing, 3));
        assert_eq!(line, "crawl 01234567  processing  3 / 10 pages  (1,500 chunks)");
        assert!(human_line(&message(CrawlPhase::Discovering, 0)).ends_with("discovering..."));
    }

    struct Collect(Arc<Mutex<Vec<usize>>>);

    impl CrawlProgressReporter for Collect {
        fn report(&self, message: &ProgressMessage) {
            self.0.lock().unwrap().push(message.progress.pages_processed);
        }
    }

    #[tokio::test]
    async fn follow_stops_at_terminal_phase() {
        let (tx, rx) = broadcast::channel(16);
        tx.send(message(CrawlPhase::Discovering, 0).to_value()).unwrap();
        tx.send(serde_json::json!({"unrelated": true})).unwrap();
        tx.send(message(CrawlPhase::Processing, 1).to_value()).unwrap();
        tx.send(message(CrawlPhase::Completed, 2).to_value()).unwrap();
        tx.send(message(CrawlPhase::Processing, 99).to_value()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        follow(rx, Box::new(Collect(seen.clone()))).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }
}
