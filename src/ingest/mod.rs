use std::sync::Arc;

use tracing::{debug, instrument};

use crate::filters::FilterEngine;
use crate::notify::notified::NotifiedCache;
use crate::notify::queue::NotificationQueue;
use crate::notify::types::SourceMessage;

/// Ties the stream of incoming and edited messages to the queue.
///
/// The notified cache is consulted before enqueue and marked right after
/// a successful one (not after delivery), so an accepted job is never
/// re-derived when the same message is edited later, even across a
/// restart.
pub struct Ingestor {
    engine: Arc<FilterEngine>,
    notified: Arc<NotifiedCache>,
    queue: Arc<NotificationQueue>,
}

impl Ingestor {
    pub fn new(
        engine: Arc<FilterEngine>,
        notified: Arc<NotifiedCache>,
        queue: Arc<NotificationQueue>,
    ) -> Self {
        Self {
            engine,
            notified,
            queue,
        }
    }

    /// Evaluate one message and enqueue jobs for every fresh match.
    /// Returns how many jobs were enqueued.
    #[instrument(skip(self, message), fields(chat = message.peer.id, msg = message.id, edited = message.edited))]
    pub fn handle_message(&self, message: &SourceMessage) -> usize {
        let matches = self.engine.process(message);
        let mut enqueued = 0;
        for matched in &matches {
            if self
                .notified
                .has(message.peer.id, message.id, &matched.filter_id)
            {
                debug!(filter = %matched.filter_id, "already notified, skipping");
                continue;
            }
            let ids = self.queue.enqueue_match(message, matched);
            if !ids.is_empty() {
                self.notified
                    .mark(message.peer.id, message.id, &matched.filter_id);
                enqueued += ids.len();
            }
        }
        enqueued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::monitor::{ConnectionGate, LivenessProbe};
    use crate::notify::queue::QueueConfig;
    use crate::notify::schedule::TzSpec;
    use crate::notify::store::{FailureJournal, QueueStore};
    use crate::notify::types::{Job, RecipientKind, SourcePeer};
    use crate::transport::{Outcome, Transport};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        fn name(&self) -> &'static str {
            "null"
        }

        async fn deliver(&self, _cancel: &CancellationToken, _job: &Job) -> Outcome {
            Outcome::delivered()
        }
    }

    struct NullProbe;

    #[async_trait]
    impl LivenessProbe for NullProbe {
        async fn probe(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn write_configs(dir: &tempfile::TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
        let recipients = dir.path().join("recipients.json");
        std::fs::write(
            &recipients,
            r#"[{"id": "me", "kind": "user", "peer_id": 100}]"#,
        )
        .unwrap();
        let filters = dir.path().join("filters.json");
        std::fs::write(
            &filters,
            r#"[{"id": "F1", "chats": [42], "urgent": false,
                 "match": {"allow": {"keyword": "rust"}},
                 "notify": {"recipients": ["me"]}}]"#,
        )
        .unwrap();
        (recipients, filters)
    }

    fn message(text: &str) -> SourceMessage {
        SourceMessage {
            peer: SourcePeer {
                id: 42,
                kind: RecipientKind::Channel,
                username: None,
                title: None,
            },
            id: 1000,
            text: text.to_string(),
            entities: Vec::new(),
            edited: false,
        }
    }

    fn ingestor(dir: &tempfile::TempDir) -> (Ingestor, Arc<NotificationQueue>) {
        let (recipients, filters) = write_configs(dir);
        let engine = Arc::new(FilterEngine::new(recipients, filters));
        engine.load().unwrap();

        let notified =
            Arc::new(NotifiedCache::load(dir.path().join("notified.json"), 30).unwrap());
        let queue = Arc::new(NotificationQueue::new(
            QueueConfig {
                schedule: vec!["09:00".parse().unwrap()],
                timezone: TzSpec::UTC,
                backlog_warn: 100,
            },
            QueueStore::new(dir.path().join("queue.json")),
            FailureJournal::new(dir.path().join("failures.json")),
            Arc::new(NullTransport),
            ConnectionGate::new(Arc::new(NullProbe), CancellationToken::new()),
        ));
        (
            Ingestor::new(engine, notified, queue.clone()),
            queue,
        )
    }

    #[tokio::test]
    async fn matching_message_enqueues_once() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, queue) = ingestor(&dir);

        assert_eq!(ingestor.handle_message(&message("rust is hiring")), 1);
        assert_eq!(queue.stats().regular, 1);

        // An edit of the same message re-matches but must not duplicate.
        let mut edited = message("rust is hiring, updated");
        edited.edited = true;
        assert_eq!(ingestor.handle_message(&edited), 0);
        assert_eq!(queue.stats().regular, 1);
    }

    #[tokio::test]
    async fn non_matching_message_enqueues_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, queue) = ingestor(&dir);

        assert_eq!(ingestor.handle_message(&message("golang only")), 0);
        assert_eq!(queue.stats().regular, 0);
    }

    #[tokio::test]
    async fn different_message_ids_notify_separately() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, queue) = ingestor(&dir);

        ingestor.handle_message(&message("rust one"));
        let mut second = message("rust two");
        second.id = 1001;
        ingestor.handle_message(&second);
        assert_eq!(queue.stats().regular, 2);
    }
}
