use std::fmt;
use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::utils::errors::{Cancelled, RetryExhausted};

const MAX_BACKOFF_SECS: u64 = 60;

/// Maps a transport error to a server-mandated wait. Extractors run in
/// registration order; the first match wins and its sleep does not count
/// as a retry attempt.
pub type WaitExtractor = Box<dyn Fn(&anyhow::Error) -> Option<Duration> + Send + Sync>;

/// Capability wrapper: an error the throttler must give up on immediately.
/// The reason tells the transport how to classify the outcome.
#[derive(Debug)]
pub struct StopRetry {
    pub reason: StopReason,
    pub source: anyhow::Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Network,
    Permanent,
}

impl StopRetry {
    pub fn network(source: impl Into<anyhow::Error>) -> anyhow::Error {
        anyhow::Error::from(Self {
            reason: StopReason::Network,
            source: source.into(),
        })
    }

    pub fn permanent(source: impl Into<anyhow::Error>) -> anyhow::Error {
        anyhow::Error::from(Self {
            reason: StopReason::Permanent,
            source: source.into(),
        })
    }
}

impl fmt::Display for StopRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self.reason {
            StopReason::Network => "network",
            StopReason::Permanent => "permanent",
        };
        write!(f, "stop retry ({reason}): {:#}", self.source)
    }
}

impl std::error::Error for StopRetry {}

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Platform calls per second.
    pub rate: f64,
    /// Bucket capacity; defaults to `2 * rate`.
    pub burst: Option<usize>,
    /// Generic-error retries before giving up; unlimited when absent.
    pub max_retries: Option<u32>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            rate: 1.0,
            burst: None,
            max_retries: None,
        }
    }
}

impl ThrottleConfig {
    fn capacity(&self) -> usize {
        self.burst
            .unwrap_or_else(|| (self.rate * 2.0).ceil() as usize)
            .max(1)
    }

    fn refill_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate.max(0.01))
    }
}

/// Token-bucket rate limiter with a retry policy.
///
/// Every platform call funnels through [`Throttler::run`]: one token per
/// call, server-driven waits honoured via extractors, everything else
/// retried with jittered exponential backoff.
pub struct Throttler {
    config: ThrottleConfig,
    tokens_tx: mpsc::Sender<()>,
    tokens_rx: Mutex<mpsc::Receiver<()>>,
    extractors: Vec<WaitExtractor>,
    root: StdMutex<Option<CancellationToken>>,
    refill: StdMutex<Option<JoinHandle<()>>>,
}

impl Throttler {
    pub fn new(config: ThrottleConfig) -> Self {
        let (tokens_tx, tokens_rx) = mpsc::channel(config.capacity());
        Self {
            config,
            tokens_tx,
            tokens_rx: Mutex::new(tokens_rx),
            extractors: Vec::new(),
            root: StdMutex::new(None),
            refill: StdMutex::new(None),
        }
    }

    pub fn with_extractor(mut self, extractor: WaitExtractor) -> Self {
        self.extractors.push(extractor);
        self
    }

    /// Pre-fill the bucket and launch the refill loop. Idempotent.
    pub fn start(&self, parent: &CancellationToken) {
        let mut refill = self.refill.lock().unwrap();
        if refill.is_some() {
            return;
        }

        for _ in 0..self.config.capacity() {
            let _ = self.tokens_tx.try_send(());
        }

        let cancel = parent.child_token();
        *self.root.lock().unwrap() = Some(cancel.clone());

        let tx = self.tokens_tx.clone();
        let interval = self.config.refill_interval();
        *refill = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                // A full bucket just drops the token.
                let _ = tx.try_send(());
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(cancel) = self.root.lock().unwrap().take() {
            cancel.cancel();
        }
        let handle = self.refill.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Run `op` under the rate limit with the retry policy applied.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let root = self.root.lock().unwrap().clone().unwrap_or_default();
        let max_retries = self.config.max_retries;
        let mut attempt: u32 = 0;

        loop {
            self.acquire(cancel, &root).await?;

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is::<StopRetry>() {
                return Err(err);
            }
            if err.chain().any(|c| c.downcast_ref::<Cancelled>().is_some()) {
                return Err(err);
            }

            if let Some(wait) = self.server_wait(&err) {
                debug!("server asked to wait {:?} before retrying: {err:#}", wait);
                sleep_cancellable(wait, cancel, &root).await?;
                // Server-mandated waits do not consume an attempt.
                continue;
            }

            if let Some(max) = max_retries {
                if attempt >= max {
                    warn!("giving up after {attempt} retries: {err:#}");
                    return Err(err.context(RetryExhausted { attempts: attempt }));
                }
            }

            let delay = backoff_delay(attempt);
            debug!(
                "attempt {} failed, backing off {:?}: {err:#}",
                attempt + 1,
                delay
            );
            attempt += 1;
            sleep_cancellable(delay, cancel, &root).await?;
        }
    }

    async fn acquire(
        &self,
        cancel: &CancellationToken,
        root: &CancellationToken,
    ) -> Result<(), Cancelled> {
        let mut rx = self.tokens_rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(Cancelled),
            _ = root.cancelled() => Err(Cancelled),
            token = rx.recv() => token.map(|_| ()).ok_or(Cancelled),
        }
    }

    fn server_wait(&self, err: &anyhow::Error) -> Option<Duration> {
        self.extractors.iter().find_map(|extract| extract(err))
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = 2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS);
    let jitter = rand::thread_rng().gen_range(0.85..1.15);
    Duration::from_secs_f64(base as f64 * jitter)
}

async fn sleep_cancellable(
    duration: Duration,
    cancel: &CancellationToken,
    root: &CancellationToken,
) -> Result<(), Cancelled> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled),
        _ = root.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("flood wait {0:?}")]
    struct FloodWait(Duration);

    fn throttler(config: ThrottleConfig) -> Throttler {
        let t = Throttler::new(config);
        t.start(&CancellationToken::new());
        t
    }

    fn fast_config() -> ThrottleConfig {
        ThrottleConfig {
            rate: 1000.0,
            burst: Some(4),
            max_retries: Some(3),
        }
    }

    #[tokio::test]
    async fn success_passes_through() {
        let t = throttler(fast_config());
        let result: i32 = t
            .run(&CancellationToken::new(), || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(result, 42);
        t.stop().await;
    }

    #[tokio::test]
    async fn stop_retry_returns_immediately() {
        let t = throttler(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<()> = t
            .run(&CancellationToken::new(), move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StopRetry::permanent(anyhow::anyhow!("peer is gone")))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(
            err.downcast_ref::<StopRetry>().unwrap().reason,
            StopReason::Permanent
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        t.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn extractor_wait_does_not_consume_attempts() {
        let t = Throttler::new(ThrottleConfig {
            rate: 1000.0,
            burst: Some(16),
            max_retries: Some(0),
        })
        .with_extractor(Box::new(|err| {
            err.downcast_ref::<FloodWait>().map(|f| f.0)
        }));
        t.start(&CancellationToken::new());

        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        // Fails with a server wait 5 times, then succeeds. With
        // max_retries=0 any generic failure would abort, so success
        // proves extractor sleeps bypass the attempt counter.
        let result: &str = t
            .run(&CancellationToken::new(), move || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 5 {
                        Err(anyhow::Error::from(FloodWait(Duration::from_secs(3))))
                    } else {
                        Ok("delivered")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "delivered");
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        t.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn generic_errors_exhaust_retry_limit() {
        let t = throttler(ThrottleConfig {
            rate: 1000.0,
            burst: Some(16),
            max_retries: Some(2),
        });
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<()> = t
            .run(&CancellationToken::new(), move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("transient glitch"))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.chain().any(|c| c.downcast_ref::<RetryExhausted>().is_some()));
        // initial call + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        t.stop().await;
    }

    #[tokio::test]
    async fn cancellation_interrupts_token_wait() {
        // burst=1 and no refill to speak of: the second run blocks on the
        // token and must observe cancellation.
        let t = throttler(ThrottleConfig {
            rate: 0.01,
            burst: Some(1),
            max_retries: None,
        });
        let _: i32 = t
            .run(&CancellationToken::new(), || async { Ok(1) })
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<i32> = t.run(&cancel, || async { Ok(2) }).await;
        assert!(result
            .unwrap_err()
            .chain()
            .any(|c| c.downcast_ref::<Cancelled>().is_some()));
        t.stop().await;
    }
}
