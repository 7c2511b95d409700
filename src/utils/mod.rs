pub mod errors;
pub mod logger;

pub use errors::{Cancelled, RetryExhausted, SentinelError};
pub use logger::setup_logging;
