pub mod config;
pub mod filters;
pub mod ingest;
pub mod net;
pub mod notify;
pub mod render;
pub mod storage;
pub mod transport;
pub mod utils;

pub use config::Config;
pub use filters::FilterEngine;
pub use ingest::Ingestor;
pub use net::monitor::{ConnectionGate, LivenessProbe};
pub use net::throttle::{ThrottleConfig, Throttler};
pub use notify::notified::NotifiedCache;
pub use notify::queue::{NotificationQueue, QueueConfig, QueueStats};
pub use notify::store::{FailureJournal, QueueStore};
pub use notify::types::{Job, Recipient, RecipientKind, SourceMessage};
pub use transport::{BotApiConfig, BotApiTransport, MtprotoTransport, SessionApi, Transport};
pub use utils::errors::SentinelError;
pub use utils::setup_logging;
