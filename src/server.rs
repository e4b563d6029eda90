//! Accept loop and per-session bookkeeping.

use crate::children::create_children_for_session;
use crate::condition::ConditionSet;
use crate::config::Config;
use crate::leader::{Leader, LeaderSettings};
use crate::message_result::MessageResult;
use crate::session::{run_session, SessionContext};
use crate::socket::{BoxedStream, Listener};
use crate::statistics::StatisticsCollector;
use crate::upstream::{Connector, SocketConnector};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Finished sessions kept for inspection.
const FINISHED_SESSIONS_KEPT: usize = 100;

/// What happened during one MTA connection.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: u64,
    pub peer: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub messages: Vec<MessageResult>,
    pub error: Option<String>,
}

/// Process-level hooks around sessions.
pub trait SessionObserver: Send + Sync {
    fn on_connection_established(&self, _id: u64, _peer: &str) {}

    fn on_session_finished(&self, summary: &SessionSummary);

    /// Called every `maintenance_interval` finished sessions.
    fn on_maintain(&self, _processed: u64) {}
}

#[derive(Default)]
struct TrackerState {
    n_processing_sessions: usize,
    n_processed_sessions: u64,
    finished: VecDeque<SessionSummary>,
}

/// Counts of running and finished sessions.
pub struct SessionTracker {
    state: Mutex<TrackerState>,
    idle: Notify,
    capacity: usize,
}

impl SessionTracker {
    pub fn new(capacity: usize) -> Self {
        SessionTracker {
            state: Mutex::new(TrackerState::default()),
            idle: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn begin(&self) {
        self.lock().n_processing_sessions += 1;
    }

    /// Records a finished session and returns the number processed so far.
    pub fn finish(&self, summary: SessionSummary) -> u64 {
        let mut state = self.lock();
        state.n_processing_sessions = state.n_processing_sessions.saturating_sub(1);
        state.n_processed_sessions += 1;
        if self.capacity > 0 {
            if state.finished.len() == self.capacity {
                state.finished.pop_front();
            }
            state.finished.push_back(summary);
        }
        let processed = state.n_processed_sessions;
        if state.n_processing_sessions == 0 {
            self.idle.notify_waiters();
        }
        processed
    }

    pub fn n_processing_sessions(&self) -> usize {
        self.lock().n_processing_sessions
    }

    pub fn n_processed_sessions(&self) -> u64 {
        self.lock().n_processed_sessions
    }

    /// Most recently finished sessions, oldest first.
    pub fn finished_sessions(&self) -> Vec<SessionSummary> {
        self.lock().finished.iter().cloned().collect()
    }

    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.n_processing_sessions() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// State shared by every session of the process.
pub struct ManagerContext {
    config: Config,
    conditions: Arc<ConditionSet>,
    connector: Arc<dyn Connector>,
    observers: Vec<Arc<dyn SessionObserver>>,
    statistics: Option<Arc<StatisticsCollector>>,
    tracker: SessionTracker,
    next_id: AtomicU64,
}

impl ManagerContext {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let conditions = ConditionSet::compile(&config.applicable_conditions)
            .context("Failed to compile applicable conditions")?;
        log::debug!("compiled {} applicable conditions", conditions.len());
        Ok(ManagerContext {
            config,
            conditions: Arc::new(conditions),
            connector: Arc::new(SocketConnector),
            observers: Vec::new(),
            statistics: None,
            tracker: SessionTracker::new(FINISHED_SESSIONS_KEPT),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_statistics(mut self, statistics: Arc<StatisticsCollector>) -> Self {
        self.observers.push(statistics.clone());
        self.statistics = Some(statistics);
        self
    }

    pub fn add_observer(&mut self, observer: Arc<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    async fn serve(&self, id: u64, stream: BoxedStream, peer: String) -> SessionSummary {
        let started_at = Utc::now();
        let clock = Instant::now();
        let children = create_children_for_session(
            &self.config,
            Arc::clone(&self.conditions),
            Arc::clone(&self.connector),
        );
        let mut leader = Leader::new(children, LeaderSettings::from_config(&self.config.manager));
        if let Some(statistics) = &self.statistics {
            leader = leader.with_statistics(Arc::clone(statistics));
        }
        let mut ctx = SessionContext::new(id, stream, self.config.manager.session_settings());
        log::info!("{} accepted from {}", ctx.tag(), peer);

        let result = run_session(&mut ctx, &mut leader).await;
        let summary = SessionSummary {
            id,
            peer,
            started_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
            messages: ctx.take_message_results(),
            error: result.err().map(|e| e.to_string()),
        };
        log::info!(
            "{} finished: {} messages in {}ms",
            ctx.tag(),
            summary.messages.len(),
            summary.elapsed_ms
        );
        summary
    }

    fn session_finished(&self, summary: SessionSummary) {
        for observer in &self.observers {
            observer.on_session_finished(&summary);
        }
        let processed = self.tracker.finish(summary);
        let interval = u64::from(self.config.manager.maintenance_interval);
        if interval > 0 && processed % interval == 0 {
            log::debug!("maintenance after {} sessions", processed);
            for observer in &self.observers {
                observer.on_maintain(processed);
            }
        }
    }
}

fn spawn_session(manager: &Arc<ManagerContext>, stream: BoxedStream, peer: String) {
    let id = manager.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    manager.tracker.begin();
    for observer in &manager.observers {
        observer.on_connection_established(id, &peer);
    }
    let manager = Arc::clone(manager);
    tokio::spawn(async move {
        let summary = manager.serve(id, stream, peer).await;
        manager.session_finished(summary);
    });
}

/// Accepts MTA connections until `shutdown` resolves, then waits for the
/// running sessions, at most `shutdown_timeout` seconds.
pub async fn run<F>(listener: Listener, manager: Arc<ManagerContext>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let settings = &manager.config.manager;
    let suspend = Duration::from_secs(settings.suspend_time_on_unacceptable);
    match listener.local_spec() {
        Ok(spec) => log::info!("listening on {}", spec),
        Err(e) => log::warn!("listening on an unknown address: {}", e),
    }

    tokio::pin!(shutdown);
    loop {
        let running = manager.tracker.n_processing_sessions();
        if settings.max_connections > 0 && running >= settings.max_connections {
            log::warn!(
                "{} sessions running, suspending accept for {}s",
                running,
                suspend.as_secs()
            );
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(suspend) => continue,
            }
        }

        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => spawn_session(&manager, stream, peer),
                Err(e) => {
                    log::error!("failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }

    drop(listener);
    let running = manager.tracker.n_processing_sessions();
    log::info!("shutting down, waiting for {} sessions", running);
    let drain = manager.tracker.wait_idle();
    if tokio::time::timeout(Duration::from_secs(settings.shutdown_timeout), drain)
        .await
        .is_err()
    {
        log::warn!(
            "{} sessions still running after {}s",
            manager.tracker.n_processing_sessions(),
            settings.shutdown_timeout
        );
    }
    if let Some(statistics) = &manager.statistics {
        statistics.flush().await;
    }
    Ok(())
}
