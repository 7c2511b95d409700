use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default directives when `RUST_LOG` is unset: this crate at info,
/// everything else at warn, so hyper/reqwest connection chatter does not
/// drown the delivery log.
const DEFAULT_FILTER: &str = "warn,tg_sentinel=info";

pub fn setup_logging() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // One worker task multiplexes every delivery; the module target is
    // what ties a log line back to a pipeline stage.
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).compact())
        .with(env_filter)
        .init();

    Ok(())
}
