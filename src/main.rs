use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncBufReadExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tg_sentinel::net::throttle::{ThrottleConfig, Throttler};
use tg_sentinel::notify::queue::QueueConfig;
use tg_sentinel::notify::store::{FailureJournal, QueueStore};
use tg_sentinel::storage::file_store;
use tg_sentinel::transport::{BotApiConfig, BotApiTransport};
use tg_sentinel::{
    Config, ConnectionGate, FilterEngine, Ingestor, LivenessProbe, NotificationQueue,
    NotifiedCache, SourceMessage,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists.
    if let Err(e) = dotenv::dotenv() {
        if !e.to_string().contains("No such file or directory") {
            eprintln!("failed to load .env file: {e}");
        }
    }

    tg_sentinel::setup_logging()?;
    info!("starting tg-sentinel v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    for path in [
        &config.paths.queue_file,
        &config.paths.failures_file,
        &config.paths.notified_file,
    ] {
        file_store::ensure_dir(path)?;
    }

    let root = CancellationToken::new();

    let engine = Arc::new(FilterEngine::new(
        &config.paths.recipients_file,
        &config.paths.filters_file,
    ));
    engine
        .load()
        .context("failed to load filter configuration")?;

    let notified = Arc::new(NotifiedCache::load(
        &config.paths.notified_file,
        config.delivery.notified_ttl_days,
    )?);
    notified.start(&root);

    if config.bot.token.is_empty() {
        anyhow::bail!(
            "no delivery credential configured: set TG_BOT_TOKEN \
             (the MTProto transport is wired in by the embedding login flow)"
        );
    }
    let transport = Arc::new(BotApiTransport::new(
        BotApiConfig {
            token: config.bot.token.clone(),
            test_dc: config.bot.test_dc,
        },
        Throttler::new(ThrottleConfig {
            rate: config.delivery.rate,
            burst: None,
            max_retries: Some(5),
        }),
    ));
    transport.start(&root);

    let probe: Arc<dyn LivenessProbe> = transport.clone();
    let gate = ConnectionGate::new(probe, root.clone());

    let queue = Arc::new(NotificationQueue::new(
        QueueConfig {
            schedule: config.schedule_slots()?,
            timezone: config.timezone()?,
            backlog_warn: config.delivery.backlog_warn,
        },
        QueueStore::new(&config.paths.queue_file),
        FailureJournal::new(&config.paths.failures_file),
        transport.clone(),
        gate,
    ));
    queue.start(&root);
    info!(
        urgent = queue.stats().urgent,
        regular = queue.stats().regular,
        "notification queue running"
    );

    let ingestor = Arc::new(Ingestor::new(
        engine.clone(),
        notified.clone(),
        queue.clone(),
    ));

    if let Some(admin) = &config.delivery.admin_recipient {
        match engine.recipient(admin) {
            Some(recipient) => {
                queue.enqueue_direct(
                    &recipient,
                    &format!("tg-sentinel {} started", env!("CARGO_PKG_VERSION")),
                );
            }
            None => warn!("admin recipient {admin:?} is not in recipients.json"),
        }
    }

    // The update-stream collaborator pipes messages in as NDJSON on
    // stdin, one SourceMessage object per line.
    {
        let cancel = root.child_token();
        let ingestor = ingestor.clone();
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<SourceMessage>(line) {
                                Ok(message) => {
                                    ingestor.handle_message(&message);
                                }
                                Err(err) => warn!("unparseable message on stdin: {err}"),
                            }
                        }
                        Ok(None) => {
                            info!("ingest stream closed");
                            return;
                        }
                        Err(err) => {
                            warn!("ingest stream read error: {err}");
                            return;
                        }
                    }
                }
            }
        });
    }

    // SIGHUP reloads the filter configuration in place.
    #[cfg(unix)]
    {
        let engine = engine.clone();
        let cancel = root.child_token();
        tokio::spawn(async move {
            let mut hangup =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                    Ok(signal) => signal,
                    Err(err) => {
                        warn!("failed to install SIGHUP handler: {err}");
                        return;
                    }
                };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = hangup.recv() => {
                        info!("SIGHUP received, reloading filter configuration");
                        if let Err(err) = engine.load() {
                            error!("reload failed, keeping previous config: {err:#}");
                        }
                    }
                }
            }
        });
    }

    signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    // Reverse-of-start order: stop intake, then flush state, then tear
    // down the transport.
    root.cancel();
    if let Err(err) = queue.stop().await {
        error!("queue shutdown error: {err:#}");
    }
    notified.stop().await;
    transport.stop().await;
    info!("tg-sentinel stopped");
    Ok(())
}
