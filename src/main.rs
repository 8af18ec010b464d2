use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use mail_autopilot::channels::console::{spawn_command_reader, spawn_event_printer};
use mail_autopilot::channels::{SpoolConfig, SpoolMailbox};
use mail_autopilot::config::PipelineConfig;
use mail_autopilot::events::EventBus;
use mail_autopilot::pipeline::{IngestSettings, MailboxProvider, MessageProcessor, spawn_ingest};
use mail_autopilot::responder::spawn_reply_scheduler;
use mail_autopilot::store::{
    CalendarStore, HistoryStore, LibSqlBackend, MemoryCalendarStore, MemoryHistoryStore,
};

/// Stderr logging, plus a daily log file when `MAIL_AUTOPILOT_LOG_DIR` is set.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("MAIL_AUTOPILOT_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "mail-autopilot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = PipelineConfig::load().context("invalid configuration")?;

    eprintln!("📬 Mail Autopilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Inbox:  {}", config.inbox_dir.display());
    eprintln!("   Outbox: {}", config.outbox_dir.display());
    eprintln!(
        "   Auto-respond: {} ({:?})",
        if config.auto_respond_enabled { "on" } else { "off" },
        config.auto_respond_categories
    );
    eprintln!("   Commands: one JSON object per line on stdin.\n");

    // ── Stores ──────────────────────────────────────────────────────────
    let (history, calendar): (Arc<dyn HistoryStore>, Arc<dyn CalendarStore>) =
        match &config.database_path {
            Some(path) => {
                let db = Arc::new(
                    LibSqlBackend::new_local(path)
                        .await
                        .with_context(|| format!("failed to open database at {}", path.display()))?,
                );
                eprintln!("   Database: {}", path.display());
                let history: Arc<dyn HistoryStore> = db.clone();
                let calendar: Arc<dyn CalendarStore> = db;
                (history, calendar)
            }
            None => {
                warn!("No database path configured; reply history will not survive a restart");
                let history: Arc<dyn HistoryStore> = Arc::new(MemoryHistoryStore::new());
                let calendar: Arc<dyn CalendarStore> = Arc::new(MemoryCalendarStore::new());
                (history, calendar)
            }
        };

    // ── Mailbox ─────────────────────────────────────────────────────────
    let mailbox: Arc<dyn MailboxProvider> = Arc::new(
        SpoolMailbox::open(SpoolConfig::from_config(&config))
            .await
            .context("failed to open spool mailbox")?,
    );

    // ── Pipeline ────────────────────────────────────────────────────────
    let events = EventBus::new();
    let _printer = spawn_event_printer(&events);

    let processor = Arc::new(MessageProcessor::from_config(
        &config,
        calendar,
        history,
        Arc::clone(&mailbox),
        events,
    ));
    let _commands = spawn_command_reader(Arc::clone(&processor));

    let (scheduler_handle, scheduler_shutdown) = spawn_reply_scheduler(processor.responder());
    let (ingest_handles, ingest_shutdown) = spawn_ingest(
        mailbox,
        Arc::clone(&processor),
        IngestSettings::from_config(&config),
    );

    info!(workers = config.workers, "Mail Autopilot running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    ingest_shutdown.store(true, Ordering::Relaxed);
    for handle in ingest_handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Ingest task ended abnormally");
        }
    }
    scheduler_shutdown.store(true, Ordering::Relaxed);
    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "Reply scheduler ended abnormally");
    }

    info!("Mail Autopilot stopped");
    Ok(())
}
