use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::net::monitor::{ConnectionGate, LivenessProbe};
use crate::net::throttle::{StopReason, StopRetry, Throttler};
use crate::notify::random_id;
use crate::notify::types::{Job, Recipient, RecipientKind};
use crate::transport::{Outcome, Transport};
use crate::utils::errors::Cancelled;

/// Extra de-sync added on top of a server flood wait so concurrent
/// workers do not stampede back in lockstep.
const FLOOD_JITTER_MAX_MS: u64 = 3000;

/// Where a session call should land: the peer cache behind the session
/// API resolves this to a full input peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub kind: RecipientKind,
    pub peer_id: i64,
}

impl From<&Recipient> for PeerAddr {
    fn from(recipient: &Recipient) -> Self {
        Self {
            kind: recipient.kind,
            peer_id: recipient.peer_id,
        }
    }
}

/// Errors crossing the session-API seam, already shaped for
/// classification: RPC code/name/value for platform errors, explicit
/// variants for resolution failures and dead sessions.
#[derive(Debug, Clone, Error)]
pub enum SessionCallError {
    #[error("rpc error {code}: {name}")]
    Rpc {
        code: i32,
        name: String,
        value: Option<u32>,
    },

    #[error("peer {kind} {peer_id} not found in cache")]
    UnknownPeer { kind: RecipientKind, peer_id: i64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("session engine closed")]
    Closed,
}

impl SessionCallError {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Closed)
    }

    /// The server-mandated wait carried by flood-class RPC errors.
    pub fn flood_wait(&self) -> Option<Duration> {
        match self {
            Self::Rpc { name, value, .. }
                if name == "FLOOD_WAIT"
                    || name == "FLOOD_PREMIUM_WAIT"
                    || name == "SLOWMODE_WAIT" =>
            {
                value.map(|secs| Duration::from_secs(secs.into()))
            }
            _ => None,
        }
    }

    /// Platform 4xx (flood variants excepted) and PEER_FLOOD are terminal
    /// for the recipient; so is a peer the cache cannot resolve.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::UnknownPeer { .. } => true,
            Self::Rpc { code, name, .. } => {
                (400..500).contains(code) && (self.flood_wait().is_none() || name == "PEER_FLOOD")
            }
            _ => false,
        }
    }
}

/// Narrow contract over the authenticated MTProto client. The login flow
/// and the peer-metadata cache live with the implementor; this transport
/// only needs five calls.
#[async_trait]
pub trait SessionApi: Send + Sync + 'static {
    async fn send_text(
        &self,
        peer: &PeerAddr,
        text: &str,
        random_id: i64,
        disable_preview: bool,
    ) -> Result<(), SessionCallError>;

    async fn forward_messages(
        &self,
        to: &PeerAddr,
        from: &PeerAddr,
        message_ids: &[i32],
        random_ids: &[i64],
    ) -> Result<(), SessionCallError>;

    async fn set_typing(&self, peer: &PeerAddr, typing: bool) -> Result<(), SessionCallError>;

    async fn set_online(&self, online: bool) -> Result<(), SessionCallError>;

    /// Lightweight who-am-I RPC, used as the liveness probe.
    async fn check_self(&self) -> Result<(), SessionCallError>;
}

/// Adapts the session API's who-am-I call to the connection gate.
pub struct SessionProbe(pub Arc<dyn SessionApi>);

#[async_trait]
impl LivenessProbe for SessionProbe {
    async fn probe(&self) -> Result<()> {
        self.0.check_self().await.map_err(Into::into)
    }
}

/// Session-authenticated delivery with flood-wait-aware throttling,
/// deterministic random ids and native forward support.
pub struct MtprotoTransport {
    api: Arc<dyn SessionApi>,
    gate: ConnectionGate,
    throttler: Arc<Throttler>,
}

impl MtprotoTransport {
    pub fn new(api: Arc<dyn SessionApi>, gate: ConnectionGate, throttler: Throttler) -> Self {
        let throttler = Arc::new(throttler.with_extractor(Box::new(|err| {
            err.chain()
                .find_map(|cause| cause.downcast_ref::<SessionCallError>())
                .and_then(SessionCallError::flood_wait)
                .map(|wait| {
                    wait + Duration::from_millis(
                        rand::thread_rng().gen_range(0..FLOOD_JITTER_MAX_MS),
                    )
                })
        })));
        Self {
            api,
            gate,
            throttler,
        }
    }

    pub fn start(&self, parent: &CancellationToken) {
        self.throttler.start(parent);
    }

    pub async fn stop(&self) {
        self.throttler.stop().await;
    }

    fn outcome_from_error(&self, job: &Job, err: anyhow::Error) -> Outcome {
        if err.chain().any(|c| c.downcast_ref::<Cancelled>().is_some()) {
            return Outcome::retry();
        }
        if let Some(stop) = err.downcast_ref::<StopRetry>() {
            if stop.reason == StopReason::Permanent {
                warn!(
                    job = job.id,
                    recipient = %job.recipient.id,
                    "permanent session failure: {:#}",
                    stop.source
                );
                return Outcome::permanent(&job.recipient.id, format!("{:#}", stop.source));
            }
        }
        if self.gate.handle_error(&err) {
            return Outcome::network_down();
        }
        warn!(job = job.id, "session delivery failed, will retry: {err:#}");
        Outcome::retry()
    }

    async fn throttled_send_text(
        &self,
        cancel: &CancellationToken,
        job: &Job,
        random_id: i64,
        disable_preview: bool,
    ) -> Result<()> {
        let peer = PeerAddr::from(&job.recipient);
        self.throttler
            .run(cancel, || {
                let api = self.api.clone();
                let peer = peer.clone();
                let text = job.payload.text.clone();
                async move {
                    api.send_text(&peer, &text, random_id, disable_preview)
                        .await
                        .map_err(classify)
                }
            })
            .await
    }

    async fn throttled_forward(
        &self,
        cancel: &CancellationToken,
        job: &Job,
        from: PeerAddr,
        message_ids: Vec<i32>,
        random_ids: Vec<i64>,
    ) -> Result<()> {
        let to = PeerAddr::from(&job.recipient);
        self.throttler
            .run(cancel, || {
                let api = self.api.clone();
                let to = to.clone();
                let from = from.clone();
                // Fresh copies per attempt so a retry never observes a
                // slice another task mutated.
                let message_ids = message_ids.clone();
                let random_ids = random_ids.clone();
                async move {
                    api.forward_messages(&to, &from, &message_ids, &random_ids)
                        .await
                        .map_err(classify)
                }
            })
            .await
    }

    /// Mimic a human sender: flag typing for a moment proportional to the
    /// text length before the message appears.
    async fn simulate_typing(&self, cancel: &CancellationToken, job: &Job) {
        let peer = PeerAddr::from(&job.recipient);
        if let Err(err) = self.api.set_typing(&peer, true).await {
            debug!("typing signal failed: {err}");
            return;
        }
        let seconds = (job.payload.text.chars().count() as u64 / 25).clamp(1, 5);
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
        }
        if let Err(err) = self.api.set_typing(&peer, false).await {
            debug!("typing reset failed: {err}");
        }
    }
}

fn classify(err: SessionCallError) -> anyhow::Error {
    if err.is_network() {
        StopRetry::network(err)
    } else if err.is_permanent() {
        StopRetry::permanent(err)
    } else {
        // Flood waits and server-side 5xx stay retryable; the wait
        // extractor picks the flood duration out of the chain.
        err.into()
    }
}

#[async_trait]
impl Transport for MtprotoTransport {
    fn name(&self) -> &'static str {
        "mtproto"
    }

    async fn before_drain(&self, cancel: &CancellationToken) {
        if let Err(err) = self.api.set_online(true).await {
            debug!("presence nudge failed: {err}");
        }
        let pause = rand::thread_rng().gen_range(400..=1500);
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(pause)) => {}
        }
    }

    async fn deliver(&self, cancel: &CancellationToken, job: &Job) -> Outcome {
        if self.gate.wait_online(cancel).await.is_err() {
            return Outcome::retry();
        }

        self.simulate_typing(cancel, job).await;

        let forward = job
            .payload
            .forward
            .as_ref()
            .filter(|f| f.enabled && !f.message_ids.is_empty());

        // A forward right after the text would visually clash with a link
        // preview, so the preview is dropped when one follows.
        let message_random_id = random_id::for_message(job, &job.recipient);
        if let Err(err) = self
            .throttled_send_text(cancel, job, message_random_id, forward.is_some())
            .await
        {
            return self.outcome_from_error(job, err);
        }

        if let Some(forward) = forward {
            let message_ids = forward.message_ids.clone();
            let random_ids: Vec<i64> = message_ids
                .iter()
                .enumerate()
                .map(|(index, &mid)| {
                    random_id::for_forward(
                        job,
                        &job.recipient,
                        forward.from_peer.kind,
                        forward.from_peer.peer_id,
                        mid,
                        index,
                    )
                })
                .collect();
            if let Err(err) = self
                .throttled_forward(
                    cancel,
                    job,
                    PeerAddr::from(&forward.from_peer),
                    message_ids,
                    random_ids,
                )
                .await
            {
                return self.outcome_from_error(job, err);
            }
        }

        debug!(job = job.id, recipient = %job.recipient.id, "session delivery complete");
        Outcome::delivered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::throttle::ThrottleConfig;
    use crate::notify::types::{ForwardSpec, Payload};
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockApi {
        send_script: StdMutex<VecDeque<Result<(), SessionCallError>>>,
        forward_script: StdMutex<VecDeque<Result<(), SessionCallError>>>,
        sent: StdMutex<Vec<(PeerAddr, String, i64, bool)>>,
        forwarded: StdMutex<Vec<(PeerAddr, PeerAddr, Vec<i32>, Vec<i64>)>>,
    }

    impl MockApi {
        fn script_send(&self, results: Vec<Result<(), SessionCallError>>) {
            *self.send_script.lock().unwrap() = results.into();
        }
    }

    #[async_trait]
    impl SessionApi for MockApi {
        async fn send_text(
            &self,
            peer: &PeerAddr,
            text: &str,
            random_id: i64,
            disable_preview: bool,
        ) -> Result<(), SessionCallError> {
            self.sent.lock().unwrap().push((
                peer.clone(),
                text.to_string(),
                random_id,
                disable_preview,
            ));
            self.send_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn forward_messages(
            &self,
            to: &PeerAddr,
            from: &PeerAddr,
            message_ids: &[i32],
            random_ids: &[i64],
        ) -> Result<(), SessionCallError> {
            self.forwarded.lock().unwrap().push((
                to.clone(),
                from.clone(),
                message_ids.to_vec(),
                random_ids.to_vec(),
            ));
            self.forward_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn set_typing(&self, _peer: &PeerAddr, _typing: bool) -> Result<(), SessionCallError> {
            Ok(())
        }

        async fn set_online(&self, _online: bool) -> Result<(), SessionCallError> {
            Ok(())
        }

        async fn check_self(&self) -> Result<(), SessionCallError> {
            Ok(())
        }
    }

    fn recipient(id: &str, kind: RecipientKind, peer_id: i64) -> Recipient {
        Recipient {
            id: id.into(),
            kind,
            peer_id,
            tz: None,
            schedule: None,
        }
    }

    fn job_with(payload: Payload) -> Job {
        Job {
            id: 17,
            created_at: Utc.timestamp_opt(1_700_000_000, 42).unwrap(),
            scheduled_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            urgent: true,
            recipient: recipient("me", RecipientKind::User, 100),
            payload,
        }
    }

    fn transport(api: Arc<MockApi>) -> MtprotoTransport {
        let gate = ConnectionGate::new(
            Arc::new(SessionProbe(api.clone())),
            CancellationToken::new(),
        );
        let transport = MtprotoTransport::new(
            api,
            gate,
            Throttler::new(ThrottleConfig {
                rate: 1000.0,
                burst: Some(32),
                max_retries: Some(3),
            }),
        );
        transport.start(&CancellationToken::new());
        transport
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_text_with_deterministic_random_id() {
        let api = Arc::new(MockApi::default());
        let t = transport(api.clone());
        let job = job_with(Payload::text_only("hello there"));

        let first = t.deliver(&CancellationToken::new(), &job).await;
        assert!(first.is_success());
        let second = t.deliver(&CancellationToken::new(), &job).await;
        assert!(second.is_success());

        let sent = api.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].2, sent[1].2);
        assert!(sent[0].2 > 0);
        assert!(!sent[0].3);
    }

    #[tokio::test(start_paused = true)]
    async fn flood_wait_sleeps_and_retries_without_burning_attempts() {
        let api = Arc::new(MockApi::default());
        api.script_send(vec![
            Err(SessionCallError::Rpc {
                code: 420,
                name: "FLOOD_WAIT".into(),
                value: Some(7),
            }),
            Ok(()),
        ]);
        let t = transport(api.clone());
        let job = job_with(Payload::text_only("x"));

        let started = tokio::time::Instant::now();
        let outcome = t.deliver(&CancellationToken::new(), &job).await;
        assert!(outcome.is_success());
        assert_eq!(api.sent.lock().unwrap().len(), 2);

        // Server wait plus up to 3s of jitter, plus the typing pause.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(7), "slept only {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(12), "slept {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn platform_4xx_is_permanent_for_the_recipient() {
        let api = Arc::new(MockApi::default());
        api.script_send(vec![Err(SessionCallError::Rpc {
            code: 403,
            name: "CHAT_WRITE_FORBIDDEN".into(),
            value: None,
        })]);
        let t = transport(api.clone());
        let job = job_with(Payload::text_only("x"));

        let outcome = t.deliver(&CancellationToken::new(), &job).await;
        assert_eq!(outcome.permanent_failures.len(), 1);
        assert_eq!(outcome.permanent_failures[0].recipient_id, "me");
        assert!(!outcome.network_down);
        // No extra attempts for a permanent error.
        assert_eq!(api.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_flood_is_permanent() {
        let api = Arc::new(MockApi::default());
        api.script_send(vec![Err(SessionCallError::Rpc {
            code: 400,
            name: "PEER_FLOOD".into(),
            value: None,
        })]);
        let t = transport(api.clone());
        let job = job_with(Payload::text_only("x"));

        let outcome = t.deliver(&CancellationToken::new(), &job).await;
        assert_eq!(outcome.permanent_failures.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn network_error_reports_network_down_and_trips_gate() {
        let api = Arc::new(MockApi::default());
        api.script_send(vec![Err(SessionCallError::Network("socket closed".into()))]);
        let t = transport(api.clone());
        let job = job_with(Payload::text_only("x"));

        let outcome = t.deliver(&CancellationToken::new(), &job).await;
        assert!(outcome.network_down);
        assert!(!t.gate.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn forward_sends_per_message_random_ids() {
        let api = Arc::new(MockApi::default());
        let t = transport(api.clone());
        let source = recipient("src", RecipientKind::Channel, 555);
        let job = job_with(Payload {
            text: "matched".into(),
            forward: Some(ForwardSpec {
                enabled: true,
                from_peer: source,
                message_ids: vec![1000, 1000, 1001],
            }),
            copy: None,
        });

        let outcome = t.deliver(&CancellationToken::new(), &job).await;
        assert!(outcome.is_success());

        let sent = api.sent.lock().unwrap();
        assert!(sent[0].3, "link preview must be disabled before a forward");

        let forwarded = api.forwarded.lock().unwrap();
        assert_eq!(forwarded.len(), 1);
        let (_, from, ids, random_ids) = &forwarded[0];
        assert_eq!(from.peer_id, 555);
        assert_eq!(ids, &vec![1000, 1000, 1001]);
        // Same source message id, distinct index, distinct random id.
        assert_ne!(random_ids[0], random_ids[1]);
        assert_eq!(random_ids.len(), 3);
    }

    #[test]
    fn classification_table() {
        let flood = SessionCallError::Rpc {
            code: 420,
            name: "FLOOD_WAIT".into(),
            value: Some(30),
        };
        assert_eq!(flood.flood_wait(), Some(Duration::from_secs(30)));
        assert!(!flood.is_permanent());

        let forbidden = SessionCallError::Rpc {
            code: 403,
            name: "CHAT_WRITE_FORBIDDEN".into(),
            value: None,
        };
        assert!(forbidden.is_permanent());
        assert_eq!(forbidden.flood_wait(), None);

        let internal = SessionCallError::Rpc {
            code: 500,
            name: "INTERNAL".into(),
            value: None,
        };
        assert!(!internal.is_permanent());

        let unknown = SessionCallError::UnknownPeer {
            kind: RecipientKind::User,
            peer_id: 9,
        };
        assert!(unknown.is_permanent());

        assert!(SessionCallError::Closed.is_network());
        assert!(SessionCallError::Network("reset".into()).is_network());
    }
}
