use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::notify::schedule::{Slot, TzSpec};
use crate::utils::errors::SentinelError;

/// Kind of a Telegram peer a notification can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientKind {
    User,
    Chat,
    Channel,
}

impl RecipientKind {
    /// Fixed wire codes feeding the deterministic random-id hash.
    /// These are part of persistent identity and must never be renumbered.
    pub fn code(self) -> u64 {
        match self {
            RecipientKind::User => 1,
            RecipientKind::Chat => 2,
            RecipientKind::Channel => 3,
        }
    }
}

impl fmt::Display for RecipientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecipientKind::User => write!(f, "user"),
            RecipientKind::Chat => write!(f, "chat"),
            RecipientKind::Channel => write!(f, "channel"),
        }
    }
}

/// A delivery target referenced from filters by its stable string id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub kind: RecipientKind,
    pub peer_id: i64,
    /// IANA zone or UTC offset ("+03:00", "UTC+3", "Z").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<TzSpec>,
    /// "HH:MM" slots in the recipient's tz; falls back to the
    /// process-wide schedule when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Vec<Slot>>,
}

impl Recipient {
    pub fn validate(&self) -> Result<(), SentinelError> {
        if self.id.is_empty() {
            return Err(SentinelError::Validation("recipient id is empty".into()));
        }
        if self.peer_id <= 0 {
            return Err(SentinelError::Validation(format!(
                "recipient {}: peer_id must be positive, got {}",
                self.id, self.peer_id
            )));
        }
        Ok(())
    }
}

/// Rich-text entity span, kept verbatim so a copy send preserves formatting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySpan {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: i64,
    pub length: i64,
}

/// The monitored side of a message: the chat it arrived in, with the
/// metadata the peer cache hands us for link building.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePeer {
    pub id: i64,
    pub kind: RecipientKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// An incoming or edited message as handed to the ingest path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMessage {
    pub peer: SourcePeer,
    pub id: i32,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub entities: Vec<EntitySpan>,
    #[serde(default)]
    pub edited: bool,
}

/// Native platform forward of the original messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub enabled: bool,
    pub from_peer: Recipient,
    pub message_ids: Vec<i32>,
}

/// Fallback for transports that cannot forward as the user: the original
/// text plus its entity spans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyPayload {
    pub text: String,
    #[serde(default)]
    pub entities: Vec<EntitySpan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<ForwardSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy: Option<CopyPayload>,
}

impl Payload {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            forward: None,
            copy: None,
        }
    }
}

/// A single queued unit targeting one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    /// UTC instant from which the job becomes eligible for delivery.
    pub scheduled_at: DateTime<Utc>,
    pub urgent: bool,
    pub recipient: Recipient,
    pub payload: Payload,
}

impl Job {
    /// Creation instant in nanoseconds, as fed into the random-id hash.
    pub fn created_at_ns(&self) -> i64 {
        self.created_at.timestamp_nanos_opt().unwrap_or_default()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The queue's complete persistent state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueState {
    #[serde(default = "default_next_id")]
    pub next_id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub urgent: VecDeque<Job>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub regular: VecDeque<Job>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flush_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_regular_drain_at: Option<DateTime<Utc>>,
}

fn default_next_id() -> i64 {
    1
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            next_id: 1,
            urgent: VecDeque::new(),
            regular: VecDeque::new(),
            last_flush_at: None,
            last_regular_drain_at: None,
        }
    }
}

impl QueueState {
    /// Repair loader invariants in place; returns true when anything changed.
    /// Entries with an invalid recipient are dropped rather than kept broken.
    pub fn repair(&mut self) -> bool {
        let mut changed = false;

        if self.next_id < 1 {
            self.next_id = 1;
            changed = true;
        }

        for backlog in [&mut self.urgent, &mut self.regular] {
            let before = backlog.len();
            backlog.retain(|job| job.recipient.validate().is_ok());
            if backlog.len() != before {
                changed = true;
            }
        }

        changed
    }

    pub fn backlog_len(&self) -> usize {
        self.urgent.len() + self.regular.len()
    }
}

/// Append-only record of a job that permanently failed for a recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job: Job,
    pub failed_at: DateTime<Utc>,
    pub error: String,
    pub recipients: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient(id: &str, peer_id: i64) -> Recipient {
        Recipient {
            id: id.to_string(),
            kind: RecipientKind::User,
            peer_id,
            tz: None,
            schedule: None,
        }
    }

    fn job(id: i64, peer_id: i64) -> Job {
        Job {
            id,
            created_at: Utc::now(),
            scheduled_at: Utc::now(),
            urgent: false,
            recipient: recipient("r1", peer_id),
            payload: Payload::text_only("hi"),
        }
    }

    #[test]
    fn recipient_rejects_non_positive_peer_id() {
        assert!(recipient("a", 1).validate().is_ok());
        assert!(recipient("a", 0).validate().is_err());
        assert!(recipient("a", -5).validate().is_err());
        assert!(recipient("", 1).validate().is_err());
    }

    #[test]
    fn kind_codes_are_fixed() {
        assert_eq!(RecipientKind::User.code(), 1);
        assert_eq!(RecipientKind::Chat.code(), 2);
        assert_eq!(RecipientKind::Channel.code(), 3);
    }

    #[test]
    fn repair_fixes_next_id_and_drops_invalid_jobs() {
        let mut state = QueueState {
            next_id: 0,
            ..Default::default()
        };
        state.urgent.push_back(job(1, 42));
        state.urgent.push_back(job(2, 0));
        state.regular.push_back(job(3, 7));

        assert!(state.repair());
        assert_eq!(state.next_id, 1);
        assert_eq!(state.urgent.len(), 1);
        assert_eq!(state.regular.len(), 1);
        assert!(!state.repair());
    }

    #[test]
    fn queue_state_tolerates_null_backlogs() {
        let state: QueueState =
            serde_json::from_str(r#"{"next_id": 7, "urgent": null, "regular": null}"#).unwrap();
        assert_eq!(state.next_id, 7);
        assert!(state.urgent.is_empty());
        assert!(state.regular.is_empty());
    }

    #[test]
    fn queue_state_round_trips() {
        let mut state = QueueState::default();
        state.next_id = 12;
        state.regular.push_back(job(11, 99));

        let text = serde_json::to_string(&state).unwrap();
        let back: QueueState = serde_json::from_str(&text).unwrap();
        assert_eq!(back.next_id, 12);
        assert_eq!(back.regular.len(), 1);
        assert_eq!(back.regular[0].id, 11);
    }
}
