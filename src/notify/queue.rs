use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::filters::Match;
use crate::net::monitor::ConnectionGate;
use crate::notify::schedule::{self, Slot, TzSpec};
use crate::notify::store::{FailureJournal, QueueStore};
use crate::notify::types::{
    CopyPayload, FailureRecord, ForwardSpec, Job, Payload, QueueState, Recipient, SourceMessage,
};
use crate::render;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Process-wide delivery slots, used when a recipient has none.
    pub schedule: Vec<Slot>,
    pub timezone: TzSpec,
    /// Combined backlog depth that triggers a warning on enqueue.
    pub backlog_warn: usize,
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub urgent: usize,
    pub regular: usize,
    pub next_id: i64,
    pub last_regular_drain_at: Option<DateTime<Utc>>,
}

enum Flow {
    Continue,
    Interrupted,
}

/// Two-backlog notification scheduler.
///
/// Urgent jobs are delivered as soon as the worker wakes; regular jobs
/// wait for the recipient's next schedule slot. State lives in memory
/// under one mutex, with every change shadowed to the queue store's
/// debounced persister. The worker holds no lock across a suspension
/// point.
pub struct NotificationQueue {
    config: QueueConfig,
    state: StdMutex<QueueState>,
    store: QueueStore,
    journal: FailureJournal,
    transport: Arc<dyn Transport>,
    gate: ConnectionGate,
    urgent_tx: mpsc::Sender<()>,
    regular_tx: mpsc::Sender<()>,
    urgent_rx: StdMutex<Option<mpsc::Receiver<()>>>,
    regular_rx: StdMutex<Option<mpsc::Receiver<()>>>,
    cancel: StdMutex<Option<CancellationToken>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl NotificationQueue {
    pub fn new(
        config: QueueConfig,
        store: QueueStore,
        journal: FailureJournal,
        transport: Arc<dyn Transport>,
        gate: ConnectionGate,
    ) -> Self {
        let state = store.load();
        let (urgent_tx, urgent_rx) = mpsc::channel(1);
        let (regular_tx, regular_rx) = mpsc::channel(1);
        Self {
            config,
            state: StdMutex::new(state),
            store,
            journal,
            transport,
            gate,
            urgent_tx,
            regular_tx,
            urgent_rx: StdMutex::new(Some(urgent_rx)),
            regular_rx: StdMutex::new(Some(regular_rx)),
            cancel: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Derive one job per recipient from a filter match and enqueue them.
    /// Returns the assigned job ids in recipient declaration order.
    pub fn enqueue_match(&self, message: &SourceMessage, matched: &Match) -> Vec<i64> {
        let now = Utc::now();
        let text = render::render_template(&matched.template, message, &matched.info);

        let forward = matched.forward.then(|| ForwardSpec {
            enabled: true,
            from_peer: Recipient {
                id: format!("source-{}", message.peer.id),
                kind: message.peer.kind,
                peer_id: message.peer.id,
                tz: None,
                schedule: None,
            },
            message_ids: vec![message.id],
        });
        // The copy fallback carries the original text and entity spans for
        // transports that cannot forward as the user.
        let copy = matched.forward.then(|| CopyPayload {
            text: message.text.clone(),
            entities: message.entities.clone(),
        });

        let mut ids = Vec::with_capacity(matched.recipients.len());
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            for recipient in &matched.recipients {
                let scheduled_at = if matched.urgent {
                    now
                } else {
                    self.next_regular_slot(now, recipient)
                };
                let id = state.next_id;
                state.next_id += 1;
                let job = Job {
                    id,
                    created_at: now,
                    scheduled_at,
                    urgent: matched.urgent,
                    recipient: recipient.clone(),
                    payload: Payload {
                        text: text.clone(),
                        forward: forward.clone(),
                        copy: copy.clone(),
                    },
                };
                debug!(
                    job = id,
                    filter = %matched.filter_id,
                    recipient = %recipient.id,
                    urgent = matched.urgent,
                    scheduled_at = %scheduled_at,
                    "job enqueued"
                );
                if matched.urgent {
                    state.urgent.push_back(job);
                } else {
                    state.regular.push_back(job);
                }
                ids.push(id);
            }
            if state.backlog_len() > self.config.backlog_warn {
                warn!(
                    backlog = state.backlog_len(),
                    threshold = self.config.backlog_warn,
                    "notification backlog above warn threshold"
                );
            }
            state.clone()
        };
        self.store.schedule_persist(&snapshot);

        if matched.urgent && !ids.is_empty() {
            let _ = self.urgent_tx.try_send(());
        }
        ids
    }

    /// Enqueue a plain urgent text for one recipient, bypassing the
    /// filter pipeline. Used for operator notices.
    pub fn enqueue_direct(&self, recipient: &Recipient, text: &str) -> i64 {
        let now = Utc::now();
        let snapshot;
        let id;
        {
            let mut state = self.state.lock().unwrap();
            id = state.next_id;
            state.next_id += 1;
            state.urgent.push_back(Job {
                id,
                created_at: now,
                scheduled_at: now,
                urgent: true,
                recipient: recipient.clone(),
                payload: Payload::text_only(text),
            });
            snapshot = state.clone();
        }
        self.store.schedule_persist(&snapshot);
        let _ = self.urgent_tx.try_send(());
        id
    }

    /// Pull every regular job's eligibility into the past and wake the
    /// worker. The only path that moves `scheduled_at` backwards.
    pub fn flush_now(&self, reason: &str) {
        info!(reason, "flushing regular backlog");
        let just_past = Utc::now() - chrono::Duration::seconds(1);
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            for job in state.regular.iter_mut() {
                job.scheduled_at = just_past;
            }
            state.clone()
        };
        self.store.schedule_persist(&snapshot);
        let _ = self.regular_tx.try_send(());
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap();
        QueueStats {
            urgent: state.urgent.len(),
            regular: state.regular.len(),
            next_id: state.next_id,
            last_regular_drain_at: state.last_regular_drain_at,
        }
    }

    fn next_regular_slot(&self, now: DateTime<Utc>, recipient: &Recipient) -> DateTime<Utc> {
        let tz = recipient.tz.unwrap_or(self.config.timezone);
        let slots = recipient
            .schedule
            .as_deref()
            .filter(|slots| !slots.is_empty())
            .unwrap_or(&self.config.schedule);
        schedule::next_slot_after(now, tz, slots)
    }

    pub fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.is_empty() {
            return;
        }
        let cancel = parent.child_token();
        *self.cancel.lock().unwrap() = Some(cancel.clone());
        self.store.start(parent);

        // Restart recovery: a surviving urgent backlog is drained right
        // away, and a regular window the previous process never drained
        // is caught up on.
        let (urgent_pending, missed_window) = {
            let state = self.state.lock().unwrap();
            let previous_slot = schedule::prev_slot_at_or_before(
                Utc::now(),
                self.config.timezone,
                &self.config.schedule,
            );
            (
                !state.urgent.is_empty(),
                state
                    .last_regular_drain_at
                    .map_or(true, |at| at < previous_slot),
            )
        };
        if urgent_pending {
            info!("restart recovery: urgent backlog pending");
            let _ = self.urgent_tx.try_send(());
        }
        if missed_window {
            info!("restart recovery: regular window missed, signalling drain");
            let _ = self.regular_tx.try_send(());
        }

        let urgent_rx = self.urgent_rx.lock().unwrap().take();
        let regular_rx = self.regular_rx.lock().unwrap().take();
        let (Some(urgent_rx), Some(regular_rx)) = (urgent_rx, regular_rx) else {
            warn!("queue worker already consumed its signal channels");
            return;
        };

        let worker = {
            let queue = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                queue.worker_loop(cancel, urgent_rx, regular_rx).await;
            })
        };
        let scheduler = {
            let queue = self.clone();
            tokio::spawn(async move {
                queue.scheduler_loop(cancel).await;
            })
        };
        tasks.push(worker);
        tasks.push(scheduler);
    }

    /// Stop the worker and flush the final snapshot. Returns the first
    /// persistence error the store captured, if any.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for result in futures::future::join_all(tasks).await {
            let _ = result;
        }
        let snapshot = self.state.lock().unwrap().clone();
        self.store.schedule_persist(&snapshot);
        self.store.stop().await
    }

    async fn worker_loop(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut urgent_rx: mpsc::Receiver<()>,
        mut regular_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                Some(_) = urgent_rx.recv() => {
                    self.drain_urgent(&cancel).await;
                }
                Some(_) = regular_rx.recv() => {
                    self.drain_regular(&cancel).await;
                }
            }
        }
    }

    /// Fires at every wall-clock minute boundary, self-correcting by
    /// recomputing the delay each iteration, and wakes the worker when a
    /// regular job has become eligible.
    async fn scheduler_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let now = Utc::now();
            let into_minute =
                (now.timestamp().rem_euclid(60)) * 1000 + i64::from(now.timestamp_subsec_millis());
            let delay = (60_000 - into_minute).clamp(1, 60_000) as u64;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }

            let due = {
                let state = self.state.lock().unwrap();
                let now = Utc::now();
                state.regular.iter().any(|job| job.scheduled_at <= now)
            };
            if due {
                let _ = self.regular_tx.try_send(());
            }
        }
    }

    async fn drain_urgent(&self, cancel: &CancellationToken) {
        let mut first = true;
        loop {
            let job = { self.state.lock().unwrap().urgent.pop_front() };
            let Some(job) = job else { return };
            if first {
                self.transport.before_drain(cancel).await;
                first = false;
            }
            if matches!(self.handle_job(cancel, job).await, Flow::Interrupted) {
                return;
            }
        }
    }

    async fn drain_regular(&self, cancel: &CancellationToken) {
        loop {
            let now = Utc::now();
            let job = {
                let mut state = self.state.lock().unwrap();
                let index = state.regular.iter().position(|job| job.scheduled_at <= now);
                match index {
                    Some(index) => state.regular.remove(index),
                    None => None,
                }
            };
            let Some(job) = job else {
                // Clean drain: nothing eligible left, stamp the window.
                let snapshot = {
                    let mut state = self.state.lock().unwrap();
                    state.last_regular_drain_at = Some(now);
                    state.clone()
                };
                self.store.schedule_persist(&snapshot);
                return;
            };

            if matches!(self.handle_job(cancel, job).await, Flow::Interrupted) {
                return;
            }

            // Urgent pre-emption between regular jobs.
            let urgent = { self.state.lock().unwrap().urgent.pop_front() };
            if let Some(urgent_job) = urgent {
                if matches!(self.handle_job(cancel, urgent_job).await, Flow::Interrupted) {
                    return;
                }
            }
        }
    }

    async fn handle_job(&self, cancel: &CancellationToken, job: Job) -> Flow {
        let was_urgent = job.urgent;
        debug!(job = job.id, recipient = %job.recipient.id, "delivering");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = self.transport.deliver(cancel, &job) => Some(outcome),
        };
        let Some(outcome) = outcome else {
            self.requeue_front(job);
            return Flow::Interrupted;
        };

        if cancel.is_cancelled() {
            self.requeue_front(job);
            return Flow::Interrupted;
        }

        if outcome.network_down {
            warn!(job = job.id, "network down, parking job at the front");
            self.requeue_front(job);
            if self.gate.wait_online(cancel).await.is_ok() {
                // Back online: resume the interrupted drain.
                let tx = if was_urgent {
                    &self.urgent_tx
                } else {
                    &self.regular_tx
                };
                let _ = tx.try_send(());
            }
            return Flow::Interrupted;
        }

        if !outcome.permanent_failures.is_empty() || outcome.permanent_error.is_some() {
            let error = outcome.permanent_error.clone().unwrap_or_else(|| {
                outcome
                    .permanent_failures
                    .iter()
                    .map(|f| f.error.clone())
                    .collect::<Vec<_>>()
                    .join("; ")
            });
            let recipients = if outcome.permanent_failures.is_empty() {
                vec![job.recipient.id.clone()]
            } else {
                outcome
                    .permanent_failures
                    .iter()
                    .map(|f| f.recipient_id.clone())
                    .collect()
            };
            error!(job = job.id, %error, "permanent delivery failure, journalling");
            let record = FailureRecord {
                job: job.clone(),
                failed_at: Utc::now(),
                error,
                recipients,
            };
            if let Err(err) = self.journal.append(record).await {
                error!("failed to append failure record: {err:#}");
            }
            self.persist();
            return Flow::Continue;
        }

        if outcome.retry {
            debug!(job = job.id, "transport asked for a retry, requeueing at the back");
            self.requeue_back(job);
            return Flow::Interrupted;
        }

        debug!(job = job.id, "delivered");
        self.persist();
        Flow::Continue
    }

    fn requeue_front(&self, job: Job) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            if job.urgent {
                state.urgent.push_front(job);
            } else {
                state.regular.push_front(job);
            }
            state.clone()
        };
        self.store.schedule_persist(&snapshot);
    }

    fn requeue_back(&self, job: Job) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            if job.urgent {
                state.urgent.push_back(job);
            } else {
                state.regular.push_back(job);
            }
            state.clone()
        };
        self.store.schedule_persist(&snapshot);
    }

    fn persist(&self) {
        let snapshot = self.state.lock().unwrap().clone();
        self.store.schedule_persist(&snapshot);
    }
}
