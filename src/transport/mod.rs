pub mod bot_api;
pub mod mtproto;

pub use bot_api::{BotApiConfig, BotApiTransport};
pub use mtproto::{MtprotoTransport, PeerAddr, SessionApi, SessionCallError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::notify::types::Job;

/// Per-recipient terminal failure, destined for the failure journal.
#[derive(Debug, Clone)]
pub struct RecipientFailure {
    pub recipient_id: String,
    pub error: String,
}

/// What a delivery attempt amounted to, after the throttler has already
/// absorbed every transient error it could.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Recipients that will never accept this job (platform 4xx, banned
    /// peer). The queue journals these and moves on.
    pub permanent_failures: Vec<RecipientFailure>,
    /// Job-level terminal error not tied to one recipient.
    pub permanent_error: Option<String>,
    /// The session is unusable; the queue requeues front and blocks on
    /// the connection gate.
    pub network_down: bool,
    /// Worth another pass on the next wake-up.
    pub retry: bool,
}

impl Outcome {
    pub fn delivered() -> Self {
        Self::default()
    }

    pub fn network_down() -> Self {
        Self {
            network_down: true,
            ..Self::default()
        }
    }

    pub fn retry() -> Self {
        Self {
            retry: true,
            ..Self::default()
        }
    }

    pub fn permanent(recipient_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            permanent_failures: vec![RecipientFailure {
                recipient_id: recipient_id.into(),
                error: error.into(),
            }],
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.permanent_failures.is_empty()
            && self.permanent_error.is_none()
            && !self.network_down
            && !self.retry
    }
}

/// A delivery channel for jobs. Implementations classify their own errors
/// into the [`Outcome`] taxonomy; the queue never inspects raw errors.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once per urgent drain burst, before the first real attempt.
    async fn before_drain(&self, _cancel: &CancellationToken) {}

    async fn deliver(&self, cancel: &CancellationToken, job: &Job) -> Outcome;
}
