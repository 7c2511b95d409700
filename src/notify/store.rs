use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::notify::types::{FailureRecord, QueueState};
use crate::storage::file_store;

const PERSIST_DEBOUNCE: Duration = Duration::from_millis(300);

/// Debounced, atomic persistence of queue snapshots.
///
/// Snapshots land in a single-slot mailbox: the writer always persists the
/// latest state, callers never block, and older pending snapshots are
/// discarded as strictly less up to date.
pub struct QueueStore {
    path: PathBuf,
    pending: Arc<StdMutex<Option<QueueState>>>,
    kick: Arc<Notify>,
    worker: StdMutex<Option<JoinHandle<Option<anyhow::Error>>>>,
    cancel: StdMutex<Option<CancellationToken>>,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pending: Arc::new(StdMutex::new(None)),
            kick: Arc::new(Notify::new()),
            worker: StdMutex::new(None),
            cancel: StdMutex::new(None),
        }
    }

    /// Load the snapshot, repairing invariants in place. A corrupt file is
    /// replaced with a default state; the prior content is logged so the
    /// operator can recover it from the logs.
    pub fn load(&self) -> QueueState {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("no queue snapshot at {}, starting empty", self.path.display());
                return QueueState::default();
            }
            Err(err) => {
                error!(
                    "failed to read queue snapshot {}: {err}, starting empty",
                    self.path.display()
                );
                return QueueState::default();
            }
        };

        match serde_json::from_str::<QueueState>(&text) {
            Ok(mut state) => {
                if state.repair() {
                    warn!("queue snapshot needed invariant repair, rewriting");
                    self.rewrite(&state);
                }
                info!(
                    urgent = state.urgent.len(),
                    regular = state.regular.len(),
                    next_id = state.next_id,
                    "queue snapshot loaded"
                );
                state
            }
            Err(err) => {
                error!("corrupt queue snapshot ({err}), resetting; prior content: {text}");
                let state = QueueState::default();
                self.rewrite(&state);
                state
            }
        }
    }

    fn rewrite(&self, state: &QueueState) {
        match serde_json::to_vec_pretty(state) {
            Ok(bytes) => {
                if let Err(err) = file_store::write_atomic_sync(&self.path, &bytes) {
                    error!("failed to rewrite queue snapshot: {err:#}");
                }
            }
            Err(err) => error!("failed to encode queue snapshot: {err}"),
        }
    }

    /// Place a deep clone of `state` into the mailbox. Never blocks.
    pub fn schedule_persist(&self, state: &QueueState) {
        *self.pending.lock().unwrap() = Some(state.clone());
        self.kick.notify_one();
    }

    pub fn start(&self, parent: &CancellationToken) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let cancel = parent.child_token();
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        let path = self.path.clone();
        let pending = self.pending.clone();
        let kick = self.kick.clone();
        *worker = Some(tokio::spawn(async move {
            let mut first_error: Option<anyhow::Error> = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = kick.notified() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(PERSIST_DEBOUNCE) => {}
                }
                Self::write_pending(&path, &pending, &mut first_error).await;
            }
            // Shutdown drains whatever is still pending.
            Self::write_pending(&path, &pending, &mut first_error).await;
            first_error
        }));
    }

    async fn write_pending(
        path: &std::path::Path,
        pending: &StdMutex<Option<QueueState>>,
        first_error: &mut Option<anyhow::Error>,
    ) {
        let Some(mut state) = pending.lock().unwrap().take() else {
            return;
        };
        state.last_flush_at = Some(Utc::now());
        let result = async {
            let bytes = serde_json::to_vec_pretty(&state)?;
            file_store::write_atomic(path, bytes).await
        }
        .await;
        if let Err(err) = result {
            if first_error.is_some() {
                error!("queue snapshot write failed: {err:#}");
            } else {
                *first_error = Some(err);
            }
        }
    }

    /// Stop the writer, draining any pending snapshot. The first write
    /// error seen over the worker's lifetime is returned here.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        let worker = self.worker.lock().unwrap().take();
        let Some(worker) = worker else {
            return Ok(());
        };
        match worker.await.context("queue store worker panicked")? {
            Some(err) => Err(err.context("queue snapshot persistence failed")),
            None => Ok(()),
        }
    }
}

/// Append-only journal of permanently failed deliveries, kept as a single
/// JSON array so the operator can inspect it with standard tooling.
pub struct FailureJournal {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FailureJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn append(&self, record: FailureRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_unlocked()?;
        records.push(record);
        let bytes = serde_json::to_vec_pretty(&records)?;
        file_store::write_atomic(&self.path, bytes).await
    }

    pub async fn read_all(&self) -> Result<Vec<FailureRecord>> {
        let _guard = self.lock.lock().await;
        self.read_unlocked()
    }

    fn read_unlocked(&self) -> Result<Vec<FailureRecord>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        }
    }
}
