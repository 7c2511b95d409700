use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::net::throttle::{StopReason, StopRetry, Throttler};
use crate::notify::types::{CopyPayload, Job, Recipient, RecipientKind};
use crate::transport::{Outcome, Transport};
use crate::utils::errors::Cancelled;

/// The supergroup/channel marker Bot API chat ids carry.
const CHANNEL_ID_OFFSET: i64 = -1_000_000_000_000;

#[derive(Debug, Clone)]
pub struct BotApiConfig {
    pub token: String,
    /// Route calls to the test data-centre.
    pub test_dc: bool,
}

/// A classified Bot API failure. `retry_after` carries the server's
/// cool-off window when it announced one; the throttler honours it
/// verbatim, without jitter, to track the window exactly.
#[derive(Debug, Error)]
#[error("bot api error {code}: {description}")]
pub struct BotApiError {
    pub code: i32,
    pub description: String,
    pub retry_after: Option<Duration>,
}

impl BotApiError {
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after.filter(|d| !d.is_zero())
    }

    /// Any 4xx is terminal for the recipient unless the server hinted at
    /// a retry window; 429 and every 5xx are transient.
    pub fn is_permanent(&self) -> bool {
        (400..500).contains(&self.code)
            && self.code != 429
            && self.retry_after().is_none()
            && !self.description.to_ascii_lowercase().contains("retry_after")
    }
}

#[derive(Debug, Default, Deserialize)]
struct ApiReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error_code: Option<i32>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ApiParameters>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiParameters {
    #[serde(default)]
    retry_after: Option<i64>,
}

/// Map a recipient to the Bot API chat id convention: users keep their
/// id, legacy groups are negated, channels/supergroups get the `-100`
/// prefix offset.
pub fn chat_id_for(recipient: &Recipient) -> i64 {
    match recipient.kind {
        RecipientKind::User => recipient.peer_id,
        RecipientKind::Chat => -recipient.peer_id,
        RecipientKind::Channel => CHANNEL_ID_OFFSET - recipient.peer_id,
    }
}

/// HTTPS delivery through a bot credential.
///
/// Sends the rendered text first; when the filter wanted a forward the
/// bot cannot impersonate, a copy with the original entity spans follows
/// to preserve the rich formatting.
pub struct BotApiTransport {
    http: reqwest::Client,
    base: String,
    throttler: Arc<Throttler>,
}

impl BotApiTransport {
    pub fn new(config: BotApiConfig, throttler: Throttler) -> Self {
        let suffix = if config.test_dc { "/test" } else { "" };
        let throttler = Arc::new(throttler.with_extractor(Box::new(|err| {
            err.chain()
                .find_map(|cause| cause.downcast_ref::<BotApiError>())
                .and_then(BotApiError::retry_after)
        })));
        Self {
            http: reqwest::Client::new(),
            base: format!("https://api.telegram.org/bot{}{}", config.token, suffix),
            throttler,
        }
    }

    pub fn start(&self, parent: &CancellationToken) {
        self.throttler.start(parent);
    }

    pub async fn stop(&self) {
        self.throttler.stop().await;
    }

    async fn call_send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/sendMessage", self.base))
            .query(&[
                ("chat_id", chat_id.to_string()),
                ("text", text.to_string()),
                ("disable_web_page_preview", "true".to_string()),
            ])
            .send()
            .await?;
        interpret(response).await
    }

    async fn call_send_copy(&self, chat_id: i64, copy: &CopyPayload) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/sendMessage", self.base))
            .json(&json!({
                "chat_id": chat_id,
                "text": copy.text,
                "entities": copy.entities,
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;
        interpret(response).await
    }

    /// Cheap who-am-I call, usable as a liveness probe.
    pub async fn check_self(&self) -> Result<()> {
        let response = self.http.get(format!("{}/getMe", self.base)).send().await?;
        interpret(response).await
    }

    fn outcome_from_error(&self, job: &Job, err: anyhow::Error) -> Outcome {
        if let Some(stop) = err.downcast_ref::<StopRetry>() {
            return match stop.reason {
                StopReason::Permanent => {
                    warn!(
                        job = job.id,
                        recipient = %job.recipient.id,
                        "permanent bot api failure: {:#}",
                        stop.source
                    );
                    Outcome::permanent(&job.recipient.id, format!("{:#}", stop.source))
                }
                StopReason::Network => Outcome::network_down(),
            };
        }
        if err.chain().any(|c| c.downcast_ref::<Cancelled>().is_some()) {
            return Outcome::retry();
        }
        warn!(job = job.id, "bot api delivery failed, will retry: {err:#}");
        Outcome::retry()
    }
}

/// Classify an HTTP response per the platform's conventions.
async fn interpret(response: reqwest::Response) -> Result<()> {
    let status = response.status().as_u16() as i32;
    let header_retry = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok());

    let reply: ApiReply = response.json().await.unwrap_or_default();
    if status == 200 && reply.ok {
        return Ok(());
    }

    let code = reply.error_code.unwrap_or(status);
    let retry_after = header_retry
        .or(reply.parameters.and_then(|p| p.retry_after))
        // A non-positive hint is no hint at all.
        .filter(|&secs| secs > 0)
        .map(|secs| Duration::from_secs(secs as u64));

    let api_err = BotApiError {
        code,
        description: reply.description.unwrap_or_else(|| "unknown error".into()),
        retry_after,
    };

    if api_err.is_permanent() {
        Err(StopRetry::permanent(api_err))
    } else {
        debug!("transient bot api error: {api_err}");
        Err(api_err.into())
    }
}

#[async_trait]
impl crate::net::monitor::LivenessProbe for BotApiTransport {
    async fn probe(&self) -> Result<()> {
        self.check_self().await
    }
}

#[async_trait]
impl Transport for BotApiTransport {
    fn name(&self) -> &'static str {
        "bot-api"
    }

    async fn deliver(&self, cancel: &CancellationToken, job: &Job) -> Outcome {
        let chat_id = chat_id_for(&job.recipient);

        // Text first, copy second, so the notification reads before the
        // quoted original.
        if let Err(err) = self
            .throttler
            .run(cancel, || self.call_send_message(chat_id, &job.payload.text))
            .await
        {
            return self.outcome_from_error(job, err);
        }

        if let Some(copy) = &job.payload.copy {
            if let Err(err) = self
                .throttler
                .run(cancel, || self.call_send_copy(chat_id, copy))
                .await
            {
                return self.outcome_from_error(job, err);
            }
        }

        debug!(job = job.id, chat_id, "bot api delivery complete");
        Outcome::delivered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient(kind: RecipientKind, peer_id: i64) -> Recipient {
        Recipient {
            id: "r".into(),
            kind,
            peer_id,
            tz: None,
            schedule: None,
        }
    }

    #[test]
    fn chat_id_mapping_follows_kind() {
        assert_eq!(chat_id_for(&recipient(RecipientKind::User, 12345)), 12345);
        assert_eq!(chat_id_for(&recipient(RecipientKind::Chat, 67890)), -67890);
        assert_eq!(
            chat_id_for(&recipient(RecipientKind::Channel, 1234567890)),
            -1_001_234_567_890
        );
    }

    #[test]
    fn permanent_classification() {
        let forbidden = BotApiError {
            code: 403,
            description: "Forbidden: bot was blocked by the user".into(),
            retry_after: None,
        };
        assert!(forbidden.is_permanent());

        let too_many = BotApiError {
            code: 429,
            description: "Too Many Requests: retry after 14".into(),
            retry_after: Some(Duration::from_secs(14)),
        };
        assert!(!too_many.is_permanent());
        assert_eq!(too_many.retry_after(), Some(Duration::from_secs(14)));

        let server = BotApiError {
            code: 502,
            description: "Bad Gateway".into(),
            retry_after: None,
        };
        assert!(!server.is_permanent());

        // A 4xx whose description mentions retry_after stays transient.
        let flood = BotApiError {
            code: 400,
            description: "Bad Request: retry_after extension suggested".into(),
            retry_after: None,
        };
        assert!(!flood.is_permanent());
    }

    #[test]
    fn zero_retry_after_is_no_hint() {
        let err = BotApiError {
            code: 429,
            description: "Too Many Requests".into(),
            retry_after: Some(Duration::ZERO),
        };
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn reply_parses_nested_retry_after() {
        let reply: ApiReply = serde_json::from_str(
            r#"{"ok": false, "error_code": 429,
                "description": "Too Many Requests: retry after 7",
                "parameters": {"retry_after": 7}}"#,
        )
        .unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.error_code, Some(429));
        assert_eq!(reply.parameters.unwrap().retry_after, Some(7));
    }
}
