//! mailsync - Entry point for the sync daemon
//!
//! Usage: `mailsync [settings.json]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use mailsync::config::Settings;
use mailsync::providers::email::ImapConnector;
use mailsync::services::{
    IndexingSink, KeywordClassifier, SinkWorker, SyncOrchestrator, WebhookNotifier,
};
use mailsync::storage::{Database, KeychainAccess};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting mailsync");

    if let Err(e) = run().await {
        tracing::error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(Settings::default_path)
        .context("no settings path given and no config directory available")?;

    let mut settings = Settings::load_or_default(&path)?;
    settings.apply_env();
    settings.resolve_secrets(&KeychainAccess::new()).await;

    let db_path = settings.storage.resolved_database_path();
    let db = Database::open(&db_path)
        .await
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "Database ready");

    let mut sink = IndexingSink::new(db).with_classifier(Arc::new(KeywordClassifier));
    if settings.notifications.is_enabled() {
        let notifier = WebhookNotifier::new(&settings.notifications)?;
        sink = sink.with_notifier(Arc::new(notifier), settings.notifications.notify_label);
    }

    let (orchestrator, events) =
        SyncOrchestrator::new(Arc::new(ImapConnector::new()), &settings.sync);
    let sink_task = tokio::spawn(SinkWorker::new(sink, settings.sync.dedup_capacity).run(events));

    let report = orchestrator.start_all(&settings.accounts).await?;
    for skipped in &report.skipped {
        tracing::warn!(error = %skipped, "Account not started");
    }

    wait_for_shutdown(&orchestrator).await;

    if let Err(e) = orchestrator.shutdown_all().await {
        tracing::error!(error = %e, "Shutdown incomplete");
    }
    drop(orchestrator);

    let stats = sink_task.await.context("event sink task failed")?;
    tracing::info!(handled = stats.handled, "mailsync stopped");
    Ok(())
}

/// Waits for Ctrl-C or SIGTERM. SIGHUP reconnects every account.
#[cfg(unix)]
async fn wait_for_shutdown(orchestrator: &SyncOrchestrator) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut hangup, mut terminate) = match (
        signal(SignalKind::hangup()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(hangup), Ok(terminate)) => (hangup, terminate),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Signal handlers unavailable, waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => {
                tracing::info!("SIGHUP received");
                orchestrator.reconnect_all();
            }
        }
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_orchestrator: &SyncOrchestrator) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
