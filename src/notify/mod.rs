pub mod notified;
pub mod queue;
pub mod random_id;
pub mod schedule;
pub mod store;
pub mod types;

pub use notified::NotifiedCache;
pub use queue::{NotificationQueue, QueueConfig, QueueStats};
pub use store::{FailureJournal, QueueStore};
