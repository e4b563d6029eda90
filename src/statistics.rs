use crate::protocol::Status;
use crate::server::{SessionObserver, SessionSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildStats {
    pub child_name: String,
    pub verdicts: BTreeMap<String, u64>,
    pub evaluation_verdicts: u64,
    pub failures: u64,
    pub last_failure: Option<String>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_sessions: u64,
    pub failed_sessions: u64,
    pub total_messages: u64,
    pub message_statuses: BTreeMap<String, u64>,
    pub total_recipients: u64,
    pub rejected_recipients: u64,
    pub total_body_bytes: u64,
    pub total_processing_time_ms: u64,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl GlobalStats {
    fn new() -> Self {
        let now = Utc::now();
        GlobalStats {
            total_sessions: 0,
            failed_sessions: 0,
            total_messages: 0,
            message_statuses: BTreeMap::new(),
            total_recipients: 0,
            rejected_recipients: 0,
            total_body_bytes: 0,
            total_processing_time_ms: 0,
            start_time: now,
            last_updated: now,
        }
    }
}

/// Contents of the statistics file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub global: GlobalStats,
    pub children: BTreeMap<String, ChildStats>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            global: GlobalStats::new(),
            children: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StatEvent {
    SessionFinished {
        elapsed_ms: u64,
        failed: bool,
    },
    MessageFinished {
        status: Status,
        recipients: u64,
        rejected_recipients: u64,
        body_size: u64,
    },
    ChildVerdict {
        child_name: String,
        status: Status,
        evaluation: bool,
    },
    ChildFailure {
        child_name: String,
        reason: String,
    },
}

enum Request {
    Event(StatEvent),
    Flush(oneshot::Sender<()>),
}

pub struct StatisticsCollector {
    path: String,
    sender: mpsc::UnboundedSender<Request>,
    _handle: tokio::task::JoinHandle<()>,
}

impl StatisticsCollector {
    pub fn new(path: String, flush_interval_seconds: u64) -> Result<Self> {
        if let Some(parent) = Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create stats directory: {}", parent.display())
                })?;
            }
        }

        let snapshot = Self::load(&path)?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let path_clone = path.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) =
                Self::stats_worker(path_clone, snapshot, receiver, flush_interval_seconds).await
            {
                log::error!("Statistics worker error: {e}");
            }
        });

        Ok(Self {
            path,
            sender,
            _handle: handle,
        })
    }

    pub fn record_event(&self, event: StatEvent) {
        if self.sender.send(Request::Event(event)).is_err() {
            log::warn!("Failed to send statistics event: worker stopped");
        }
    }

    /// Writes everything recorded so far to disk.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(Request::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    async fn stats_worker(
        path: String,
        mut snapshot: Snapshot,
        mut receiver: mpsc::UnboundedReceiver<Request>,
        flush_interval_seconds: u64,
    ) -> Result<()> {
        let mut flush_timer = interval(Duration::from_secs(flush_interval_seconds.max(1)));
        let mut dirty = false;

        loop {
            tokio::select! {
                request = receiver.recv() => {
                    match request {
                        Some(Request::Event(event)) => {
                            Self::process_event(event, &mut snapshot);
                            dirty = true;
                        }
                        Some(Request::Flush(done)) => {
                            Self::write_snapshot(&path, &snapshot)?;
                            dirty = false;
                            let _ = done.send(());
                        }
                        None => {
                            // Channel closed, flush and exit
                            Self::write_snapshot(&path, &snapshot)?;
                            break;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    if dirty {
                        if let Err(e) = Self::write_snapshot(&path, &snapshot) {
                            log::error!("Failed to flush statistics: {e}");
                        } else {
                            dirty = false;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn process_event(event: StatEvent, snapshot: &mut Snapshot) {
        let now = Utc::now();
        let global = &mut snapshot.global;
        global.last_updated = now;

        match event {
            StatEvent::SessionFinished { elapsed_ms, failed } => {
                global.total_sessions += 1;
                global.total_processing_time_ms += elapsed_ms;
                if failed {
                    global.failed_sessions += 1;
                }
            }
            StatEvent::MessageFinished {
                status,
                recipients,
                rejected_recipients,
                body_size,
            } => {
                global.total_messages += 1;
                *global
                    .message_statuses
                    .entry(status.as_str().to_string())
                    .or_default() += 1;
                global.total_recipients += recipients;
                global.rejected_recipients += rejected_recipients;
                global.total_body_bytes += body_size;
            }
            StatEvent::ChildVerdict {
                child_name,
                status,
                evaluation,
            } => {
                let stats = Self::child_entry(snapshot, child_name, now);
                if evaluation {
                    stats.evaluation_verdicts += 1;
                } else {
                    *stats.verdicts.entry(status.as_str().to_string()).or_default() += 1;
                }
            }
            StatEvent::ChildFailure { child_name, reason } => {
                let stats = Self::child_entry(snapshot, child_name, now);
                stats.failures += 1;
                stats.last_failure = Some(reason);
            }
        }
    }

    fn child_entry(snapshot: &mut Snapshot, child_name: String, now: DateTime<Utc>) -> &mut ChildStats {
        let stats = snapshot
            .children
            .entry(child_name.clone())
            .or_insert_with(|| ChildStats {
                child_name,
                first_seen: Some(now),
                ..ChildStats::default()
            });
        stats.last_seen = Some(now);
        stats
    }

    fn load(path: &str) -> Result<Snapshot> {
        if !Path::new(path).exists() {
            return Ok(Snapshot::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read statistics file: {path}"))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse statistics file: {path}"))
    }

    fn write_snapshot(path: &str, snapshot: &Snapshot) -> Result<()> {
        let content = serde_json::to_string_pretty(snapshot)?;
        let temporary = format!("{path}.tmp");
        std::fs::write(&temporary, content)
            .with_context(|| format!("Failed to write statistics file: {temporary}"))?;
        std::fs::rename(&temporary, path)?;
        Ok(())
    }

    pub fn get_stats(&self) -> Result<Snapshot> {
        Self::load(&self.path)
    }

    /// Reads a snapshot without a running collector, for `--stats`.
    pub fn read_snapshot(path: &str) -> Result<Snapshot> {
        Self::load(path)
    }

    pub fn reset_stats(path: &str) -> Result<()> {
        Self::write_snapshot(path, &Snapshot::default())
    }
}

impl SessionObserver for StatisticsCollector {
    fn on_session_finished(&self, summary: &SessionSummary) {
        for message in &summary.messages {
            self.record_event(StatEvent::MessageFinished {
                status: message.status,
                recipients: (message.recipients.len()
                    + message.rejected_recipients.len()
                    + message.temporary_failed_recipients.len()) as u64,
                rejected_recipients: message.rejected_recipients.len() as u64,
                body_size: message.body_size,
            });
        }
        self.record_event(StatEvent::SessionFinished {
            elapsed_ms: summary.elapsed_ms,
            failed: summary.error.is_some(),
        });
    }

    fn on_maintain(&self, processed: u64) {
        log::info!(
            "statistics: {} sessions processed, snapshot at {}",
            processed,
            self.path
        );
    }
}
