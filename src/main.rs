use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use mail_triage::config::TriageConfig;
use mail_triage::pipeline::digest::{self, DigestAggregator};
use mail_triage::sink::{DigestSink, LogDigestSink, WebhookDigestSink};
use mail_triage::store::{Ledger, LibSqlStore, StateStore};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = TriageConfig::from_env().context("Invalid configuration")?;

    eprintln!("📬 Mail Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Responder: {}", config.responder.email);
    eprintln!("   State DB: {}", config.db_path);
    eprintln!("   Digest schedule: {}", config.digest_schedule);

    // ── State store ──────────────────────────────────────────────────────
    let store: Arc<dyn StateStore> = Arc::new(
        LibSqlStore::new_local(Path::new(&config.db_path))
            .await
            .with_context(|| format!("Failed to open state store at {}", config.db_path))?,
    );
    let ledger = Arc::new(Ledger::new(store, config.reply_log_mode));

    // ── Digest sink ──────────────────────────────────────────────────────
    let sink: Arc<dyn DigestSink> = match config.digest_webhook_url.clone() {
        Some(url) => Arc::new(WebhookDigestSink::new(url)),
        None => {
            info!("TRIAGE_DIGEST_WEBHOOK_URL not set, digests go to the log");
            Arc::new(LogDigestSink)
        }
    };
    let aggregator = Arc::new(DigestAggregator::new(ledger, sink));

    // `digest-now` publishes a single digest and exits.
    if std::env::args().nth(1).as_deref() == Some("digest-now") {
        digest::run_and_announce(&aggregator, None).await;
        return Ok(());
    }

    let (handle, shutdown) = digest::spawn_digest_job(aggregator, &config.digest_schedule, None)
        .context("Failed to start digest job")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    shutdown.store(true, Ordering::Relaxed);
    handle.abort();

    Ok(())
}
