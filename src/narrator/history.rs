//! Session history.
//!
//! One JSON line per ended session in ~/.readaloud-history/{date}.jsonl.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::engine::EngineEvent;
use super::session::{Outcome, SessionSummary};
use super::voices::EngineKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub timestamp: String,
    #[serde(flatten)]
    pub summary: SessionSummary,
}

#[derive(Debug, Clone)]
pub struct History {
    dir: PathBuf,
}

impl History {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.readaloud-history`, if there is a home directory.
    pub fn default_location() -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(".readaloud-history")))
    }

    fn file(&self, date: &str) -> PathBuf {
        let date = if date == "today" {
            Local::now().format("%Y-%m-%d").to_string()
        } else {
            date.to_string()
        };
        self.dir.join(format!("{date}.jsonl"))
    }

    pub fn save(&self, summary: &SessionSummary) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("Failed to create history dir: {e}");
            return;
        }
        let record = SessionRecord {
            timestamp: Local::now().to_rfc3339(),
            summary: summary.clone(),
        };

        let path = self.file("today");
        let mut file = match fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("Failed to open history file: {e}");
                return;
            }
        };
        match serde_json::to_string(&record) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}") {
                    warn!("Failed to write history record: {e}");
                } else {
                    debug!("Saved session {} to {}", summary.session, path.display());
                }
            }
            Err(e) => warn!("Failed to serialize history record: {e}"),
        }
    }

    pub fn load(&self, date: &str) -> Vec<SessionRecord> {
        let Ok(contents) = fs::read_to_string(self.file(date)) else {
            return Vec::new();
        };
        contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn list_dates(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut dates: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix(".jsonl").map(String::from)
            })
            .collect();
        dates.sort();
        dates
    }

    pub fn report(&self, date: &str) -> String {
        let records = self.load(date);
        if records.is_empty() {
            return format!("No sessions recorded for {date}.");
        }

        let total = records.len();
        let count = |outcome: Outcome| records.iter().filter(|r| r.summary.outcome == outcome).count();
        let chars: usize = records.iter().map(|r| r.summary.chars_processed).sum();
        let skipped: usize = records.iter().map(|r| r.summary.skipped_chunks).sum();
        let demoted = records
            .iter()
            .filter(|r| r.summary.initial_backend != r.summary.final_backend)
            .count();
        let listening_s: f64 = records.iter().map(|r| r.summary.elapsed_ms as f64 / 1000.0).sum();

        let mut by_backend: HashMap<EngineKind, usize> = HashMap::new();
        for r in &records {
            *by_backend.entry(r.summary.final_backend).or_insert(0) += 1;
        }
        let mut backends: Vec<_> = by_backend.into_iter().collect();
        backends.sort_by_key(|(kind, _)| kind.to_string());

        let mut report = format!(
            "# Read-aloud report for {date}\n\n\
            - Sessions: {total}\n\
            - Finished: {}\n\
            - Stopped: {}\n\
            - Failed: {}\n\
            - Characters read: {chars}\n\
            - Skipped chunks: {skipped}\n\
            - Demoted sessions: {demoted}\n\
            - Listening time: {listening_s:.0}s\n\n\
            ## Backends\n",
            count(Outcome::Finished),
            count(Outcome::Stopped),
            count(Outcome::Failed),
        );
        for (kind, n) in backends {
            report.push_str(&format!("- {kind}: {n}\n"));
        }
        report
    }

    /// Save every session summary the engine publishes.
    pub fn spawn_recorder(self, mut events: broadcast::Receiver<EngineEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::Ended { summary }) => {
                        let history = self.clone();
                        let _ = tokio::task::spawn_blocking(move || history.save(&summary)).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("History recorder missed {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
