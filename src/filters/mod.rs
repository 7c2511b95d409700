pub mod rules;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::filters::rules::{CompiledRuleSet, MatchInfo, RuleSet};
use crate::notify::schedule;
use crate::notify::types::{Recipient, SourceMessage};
use crate::utils::errors::SentinelError;

/// One entry of filters.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub id: String,
    /// Source peers this filter watches.
    #[serde(default)]
    pub chats: Vec<i64>,
    #[serde(default, rename = "match")]
    pub rules: RuleSet,
    /// Urgent matches bypass the recipient schedule.
    #[serde(default)]
    pub urgent: bool,
    pub notify: NotifySpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySpec {
    pub recipients: Vec<String>,
    /// Forward the original message natively alongside the rendered text.
    #[serde(default)]
    pub forward: bool,
    #[serde(default)]
    pub template: String,
}

/// A filter compiled and resolved against the recipient table.
#[derive(Debug)]
pub struct LoadedFilter {
    pub id: String,
    pub chats: Vec<i64>,
    pub urgent: bool,
    pub forward: bool,
    pub template: String,
    pub rules: CompiledRuleSet,
    pub recipients: Vec<Recipient>,
}

/// The result of evaluating one filter against one message.
#[derive(Debug, Clone)]
pub struct Match {
    pub filter_id: String,
    pub urgent: bool,
    pub forward: bool,
    pub template: String,
    pub recipients: Vec<Recipient>,
    pub info: MatchInfo,
}

#[derive(Default)]
struct Snapshot {
    filters: Vec<LoadedFilter>,
    by_chat: HashMap<i64, Vec<usize>>,
    chats: Vec<i64>,
    recipients: HashMap<String, Recipient>,
}

/// Loads rules and recipients, evaluates messages into matches.
///
/// A successful [`FilterEngine::load`] swaps the whole snapshot
/// atomically; any failure leaves the previous snapshot serving.
pub struct FilterEngine {
    recipients_path: PathBuf,
    filters_path: PathBuf,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl FilterEngine {
    pub fn new(recipients_path: impl Into<PathBuf>, filters_path: impl Into<PathBuf>) -> Self {
        Self {
            recipients_path: recipients_path.into(),
            filters_path: filters_path.into(),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// Read and validate both config files, then swap the snapshot in.
    pub fn load(&self) -> Result<()> {
        let recipients = self.load_recipients()?;
        let filters = self.load_filters(&recipients)?;

        let mut by_chat: HashMap<i64, Vec<usize>> = HashMap::new();
        let mut chat_set = HashSet::new();
        for (index, filter) in filters.iter().enumerate() {
            for &chat in &filter.chats {
                by_chat.entry(chat).or_default().push(index);
                chat_set.insert(chat);
            }
        }
        let mut chats: Vec<i64> = chat_set.into_iter().collect();
        chats.sort_unstable();

        let referenced: HashSet<&str> = filters
            .iter()
            .flat_map(|f| f.recipients.iter().map(|r| r.id.as_str()))
            .collect();
        for id in recipients.keys() {
            if !referenced.contains(id.as_str()) {
                warn!("recipient {id} is not referenced by any filter");
            }
        }

        info!(
            filters = filters.len(),
            recipients = recipients.len(),
            chats = chats.len(),
            "filter config loaded"
        );

        let next = Arc::new(Snapshot {
            filters,
            by_chat,
            chats,
            recipients,
        });
        *self.snapshot.write().unwrap() = next;
        Ok(())
    }

    fn load_recipients(&self) -> Result<HashMap<String, Recipient>> {
        let text = fs::read_to_string(&self.recipients_path).with_context(|| {
            format!("failed to read {}", self.recipients_path.display())
        })?;
        let parsed: Vec<Recipient> = serde_json::from_str(&text).with_context(|| {
            format!("failed to parse {}", self.recipients_path.display())
        })?;

        let mut recipients = HashMap::new();
        for mut recipient in parsed {
            recipient.validate()?;
            if let Some(slots) = recipient.schedule.take() {
                let normalized = schedule::normalize(slots);
                if normalized.is_empty() {
                    warn!(
                        "recipient {}: empty schedule, falling back to the process-wide one",
                        recipient.id
                    );
                } else {
                    recipient.schedule = Some(normalized);
                }
            }
            if let Some(previous) = recipients.insert(recipient.id.clone(), recipient) {
                return Err(SentinelError::Validation(format!(
                    "duplicate recipient id {:?}",
                    previous.id
                ))
                .into());
            }
        }
        Ok(recipients)
    }

    fn load_filters(
        &self,
        recipients: &HashMap<String, Recipient>,
    ) -> Result<Vec<LoadedFilter>> {
        let text = fs::read_to_string(&self.filters_path)
            .with_context(|| format!("failed to read {}", self.filters_path.display()))?;
        let parsed: Vec<FilterConfig> = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", self.filters_path.display()))?;

        let mut seen_ids = HashSet::new();
        for filter in &parsed {
            if !seen_ids.insert(filter.id.clone()) {
                return Err(
                    SentinelError::Validation(format!("duplicate filter id {:?}", filter.id))
                        .into(),
                );
            }
        }

        let mut loaded = Vec::with_capacity(parsed.len());
        for filter in parsed {
            // A broken filter is dropped whole, never partially kept.
            let rules = match CompiledRuleSet::compile(&filter.rules) {
                Ok(rules) => rules,
                Err(err) => {
                    warn!("dropping filter {}: {err}", filter.id);
                    continue;
                }
            };

            if filter.notify.recipients.is_empty() {
                warn!("dropping filter {}: no recipients configured", filter.id);
                continue;
            }

            let mut resolved = Vec::with_capacity(filter.notify.recipients.len());
            let mut missing = None;
            for id in &filter.notify.recipients {
                match recipients.get(id) {
                    Some(recipient) => resolved.push(recipient.clone()),
                    None => {
                        missing = Some(id.clone());
                        break;
                    }
                }
            }
            if let Some(id) = missing {
                warn!("dropping filter {}: unknown recipient {id:?}", filter.id);
                continue;
            }

            if filter.chats.is_empty() {
                warn!("filter {} watches no chats and will never match", filter.id);
            }

            loaded.push(LoadedFilter {
                id: filter.id,
                chats: filter.chats,
                urgent: filter.urgent,
                forward: filter.notify.forward,
                template: filter.notify.template,
                rules,
                recipients: resolved,
            });
        }
        Ok(loaded)
    }

    /// Evaluate a message against the filters watching its source chat.
    /// Matches come back in filter declaration order.
    pub fn process(&self, message: &SourceMessage) -> Vec<Match> {
        let snapshot = self.snapshot.read().unwrap().clone();
        let Some(candidates) = snapshot.by_chat.get(&message.peer.id) else {
            return Vec::new();
        };

        let mut matches = Vec::new();
        for &index in candidates {
            let filter = &snapshot.filters[index];
            if let Some(info) = filter.rules.matches(&message.text) {
                debug!(
                    filter = %filter.id,
                    chat = message.peer.id,
                    msg = message.id,
                    "filter matched"
                );
                matches.push(Match {
                    filter_id: filter.id.clone(),
                    urgent: filter.urgent,
                    forward: filter.forward,
                    template: filter.template.clone(),
                    recipients: filter.recipients.clone(),
                    info,
                });
            }
        }
        matches
    }

    /// Deduplicated, sorted set of all watched source chats.
    pub fn watched_chats(&self) -> Vec<i64> {
        self.snapshot.read().unwrap().chats.clone()
    }

    pub fn recipient(&self, id: &str) -> Option<Recipient> {
        self.snapshot.read().unwrap().recipients.get(id).cloned()
    }
}
