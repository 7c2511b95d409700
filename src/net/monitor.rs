use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::net::is_network_error;
use crate::utils::errors::Cancelled;

const PROBE_INTERVAL: Duration = Duration::from_secs(10);
const PROBE_DEADLINE: Duration = Duration::from_secs(5);

/// Lightweight session liveness check, typically the platform's
/// who-am-I RPC. Implemented by the session collaborator.
#[async_trait]
pub trait LivenessProbe: Send + Sync + 'static {
    async fn probe(&self) -> Result<()>;
}

struct GenState {
    /// Bumped on every offline transition; one wait-channel per generation.
    generation: u64,
    release: Arc<Notify>,
    monitor: Option<JoinHandle<()>>,
    monitor_cancel: Option<CancellationToken>,
}

struct GateInner {
    online: AtomicBool,
    state: StdMutex<GenState>,
    probe: Arc<dyn LivenessProbe>,
    root: CancellationToken,
}

/// Process-wide online/offline gate, passed around as an explicit handle
/// so tests can instantiate independent gates.
///
/// Delivery paths call [`ConnectionGate::wait_online`] before touching the
/// platform; transports report suspicious errors through
/// [`ConnectionGate::handle_error`], which flips the gate offline and
/// starts the probe loop for network-class failures.
#[derive(Clone)]
pub struct ConnectionGate {
    inner: Arc<GateInner>,
}

impl ConnectionGate {
    /// A new gate starts online: it is created right after a successful
    /// login, and the first failing call flips it.
    pub fn new(probe: Arc<dyn LivenessProbe>, root: CancellationToken) -> Self {
        Self {
            inner: Arc::new(GateInner {
                online: AtomicBool::new(true),
                state: StdMutex::new(GenState {
                    generation: 0,
                    release: Arc::new(Notify::new()),
                    monitor: None,
                    monitor_cancel: None,
                }),
                probe,
                root,
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Idempotent transition to Online: stops the monitor loop and
    /// releases every waiter of the current generation.
    pub fn mark_connected(&self) {
        let was_online = self.inner.online.swap(true, Ordering::SeqCst);
        let (release, monitor_cancel) = {
            let mut state = self.inner.state.lock().unwrap();
            // Detach rather than await: the monitor task itself calls
            // mark_connected on probe success.
            state.monitor.take();
            (state.release.clone(), state.monitor_cancel.take())
        };
        if let Some(cancel) = monitor_cancel {
            cancel.cancel();
        }
        if !was_online {
            info!("session back online, releasing delivery waiters");
            release.notify_waiters();
        }
    }

    /// Idempotent transition to Offline: installs a new wait-channel
    /// generation and starts the probe loop.
    pub fn mark_disconnected(&self) {
        let was_online = self.inner.online.swap(false, Ordering::SeqCst);
        if !was_online {
            return;
        }

        let mut state = self.inner.state.lock().unwrap();
        state.generation += 1;
        state.release = Arc::new(Notify::new());
        let cancel = self.inner.root.child_token();
        state.monitor_cancel = Some(cancel.clone());
        let gate = self.clone();
        state.monitor = Some(tokio::spawn(async move {
            gate.monitor_loop(cancel).await;
        }));
        warn!(
            generation = state.generation,
            "session offline, connection monitor started"
        );
    }

    /// Block until the gate is Online. Waiters woken on a stale generation
    /// loop until the current one releases, so a transient offline/online
    /// flap never leaves a waiter asleep.
    pub async fn wait_online(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            let release = { self.inner.state.lock().unwrap().release.clone() };
            let notified = release.notified();
            tokio::pin!(notified);
            // Register interest before re-checking the flag, otherwise a
            // release between check and await is lost.
            notified.as_mut().enable();

            if self.inner.online.load(Ordering::SeqCst) {
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = self.inner.root.cancelled() => return Err(Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Returns true iff `err` is network-class; flips the gate offline
    /// when it is. Cancellation never counts.
    pub fn handle_error(&self, err: &anyhow::Error) -> bool {
        if is_network_error(err) {
            debug!("network-class error observed: {err:#}");
            self.mark_disconnected();
            true
        } else {
            false
        }
    }

    async fn monitor_loop(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(PROBE_INTERVAL) => {}
            }

            // The probe runs in its own task so a panicking implementation
            // is contained and read as a failed attempt.
            let probe = self.inner.probe.clone();
            let attempt = tokio::spawn(async move {
                tokio::time::timeout(PROBE_DEADLINE, probe.probe()).await
            });

            match attempt.await {
                Ok(Ok(Ok(()))) => {
                    info!("liveness probe succeeded");
                    self.mark_connected();
                    return;
                }
                Ok(Ok(Err(err))) => debug!("liveness probe failed: {err:#}"),
                Ok(Err(_)) => debug!("liveness probe timed out"),
                Err(join_err) if join_err.is_panic() => {
                    warn!("liveness probe panicked, treating as network failure");
                }
                Err(_) => return,
            }
        }
    }
}
