use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::file_store;

const FLUSH_DEBOUNCE: Duration = Duration::from_secs(10);
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// TTL'd set of `(peer, message, filter)` keys that already produced an
/// accepted enqueue. Consulted before enqueue and marked right after, so
/// an edit of the same message never re-derives a notification, even
/// across restarts, via debounced persistence to a JSON map.
pub struct NotifiedCache {
    path: PathBuf,
    ttl_secs: i64,
    entries: StdMutex<HashMap<String, i64>>,
    dirty: AtomicBool,
    kick: Arc<Notify>,
    cancel: StdMutex<Option<CancellationToken>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

fn cache_key(peer_id: i64, msg_id: i32, filter_id: &str) -> String {
    format!("{peer_id}:{msg_id}:{filter_id}")
}

impl NotifiedCache {
    /// Load the cache, discarding entries that outlived the TTL.
    pub fn load(path: impl Into<PathBuf>, ttl_days: u32) -> Result<Self> {
        let path = path.into();
        let ttl_secs = i64::from(ttl_days) * 86_400;
        let mut entries: HashMap<String, i64> = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        let cutoff = Utc::now().timestamp() - ttl_secs;
        let before = entries.len();
        entries.retain(|_, &mut stamped| stamped >= cutoff);
        if entries.len() != before {
            info!(
                discarded = before - entries.len(),
                kept = entries.len(),
                "expired notified entries discarded at load"
            );
        }

        Ok(Self {
            path,
            ttl_secs,
            entries: StdMutex::new(entries),
            dirty: AtomicBool::new(false),
            kick: Arc::new(Notify::new()),
            cancel: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    pub fn has(&self, peer_id: i64, msg_id: i32, filter_id: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .contains_key(&cache_key(peer_id, msg_id, filter_id))
    }

    /// Stamp acceptance with wall time and schedule a debounced flush.
    pub fn mark(&self, peer_id: i64, msg_id: i32, filter_id: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(cache_key(peer_id, msg_id, filter_id), Utc::now().timestamp());
        self.dirty.store(true, Ordering::SeqCst);
        self.kick.notify_one();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Evict entries older than the TTL; returns how many were removed.
    pub fn sweep_once(&self) -> usize {
        let cutoff = Utc::now().timestamp() - self.ttl_secs;
        let removed = {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|_, &mut stamped| stamped >= cutoff);
            before - entries.len()
        };
        if removed > 0 {
            debug!(removed, "notified cache swept");
            self.dirty.store(true, Ordering::SeqCst);
            self.kick.notify_one();
        }
        removed
    }

    /// Persist the current entries if dirty. A failed write re-raises the
    /// dirty flag so a later flush retries.
    pub async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let snapshot = self.entries.lock().unwrap().clone();
        let result = async {
            let bytes = serde_json::to_vec_pretty(&snapshot)?;
            file_store::write_atomic(&self.path, bytes).await
        }
        .await;
        if let Err(err) = result {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(err).with_context(|| format!("failed to flush {}", self.path.display()));
        }
        Ok(())
    }

    pub fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.is_empty() {
            return;
        }
        let cancel = parent.child_token();
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        let persister = {
            let cache = self.clone();
            let cancel = cancel.clone();
            let kick = self.kick.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = kick.notified() => {}
                    }
                    // Debounce: coalesce a burst of marks into one write.
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(FLUSH_DEBOUNCE) => {}
                    }
                    if let Err(err) = cache.flush().await {
                        warn!("notified cache flush failed: {err:#}");
                    }
                }
                if let Err(err) = cache.flush().await {
                    warn!("final notified cache flush failed: {err:#}");
                }
            })
        };

        let sweeper = {
            let cache = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                    }
                    cache.sweep_once();
                }
            })
        };

        tasks.push(persister);
        tasks.push(sweeper);
    }

    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for result in futures::future::join_all(tasks).await {
            let _ = result;
        }
    }
}
