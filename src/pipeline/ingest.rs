//! Background ingest: polls the mailbox and feeds a bounded worker pool.
//!
//! Timer-based loop:
//! 1. `fetch_new()` with bounded exponential backoff
//! 2. Each message goes onto a bounded queue (backpressure on the poller)
//! 3. N workers take messages off the queue and run them end to end
//!    through `MessageProcessor::process()`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::TransportError;
use crate::pipeline::processor::{MessageProcessor, ProcessedMessage};
use crate::pipeline::types::{MailboxProvider, Message};

/// Ingest loop settings.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub poll_interval: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_fetch_attempts: u32,
    pub fetch_retry_base: Duration,
}

impl IngestSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            workers: config.workers.max(1),
            queue_capacity: config.queue_capacity.max(1),
            max_fetch_attempts: config.max_fetch_attempts.max(1),
            fetch_retry_base: Duration::from_secs(1),
        }
    }
}

/// How often a sleeping poller looks at its shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

async fn shutdown_requested(flag: &AtomicBool) {
    while !flag.load(Ordering::Relaxed) {
        tokio::time::sleep(SHUTDOWN_POLL).await;
    }
}

/// Fetch new messages, retrying transport failures with exponential backoff.
pub async fn fetch_with_retry(
    mailbox: &dyn MailboxProvider,
    max_attempts: u32,
    base: Duration,
) -> Result<Vec<Message>, TransportError> {
    let mut backoff = base;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match mailbox.fetch_new().await {
            Ok(messages) => return Ok(messages),
            Err(e) if attempt < max_attempts => {
                warn!(
                    provider = mailbox.name(),
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Mailbox fetch failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                error!(provider = mailbox.name(), attempt, error = %e, "Mailbox fetch failed");
                return Err(TransportError::Exhausted {
                    attempts: attempt,
                    backoff,
                });
            }
        }
    }
}

/// Fetch once and process everything sequentially.
pub async fn ingest_once(
    mailbox: &dyn MailboxProvider,
    processor: &MessageProcessor,
    settings: &IngestSettings,
) -> Result<Vec<ProcessedMessage>, TransportError> {
    let messages =
        fetch_with_retry(mailbox, settings.max_fetch_attempts, settings.fetch_retry_base).await?;
    Ok(processor.process_batch(&messages, Utc::now()).await)
}

/// Spawn the poller and its worker pool.
///
/// Setting the shutdown flag stops the poller; workers drain what is already
/// queued and exit once the queue closes.
///
/// Returns the `JoinHandle`s (poller first) and the shutdown flag.
pub fn spawn_ingest(
    mailbox: Arc<dyn MailboxProvider>,
    processor: Arc<MessageProcessor>,
    settings: IngestSettings,
) -> (Vec<JoinHandle<()>>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let (tx, rx) = mpsc::channel::<Message>(settings.queue_capacity);
    let rx = Arc::new(Mutex::new(rx));

    let mut handles = Vec::with_capacity(settings.workers + 1);

    let poller_settings = settings.clone();
    handles.push(tokio::spawn(async move {
        info!(
            provider = mailbox.name(),
            interval_secs = poller_settings.poll_interval.as_secs(),
            workers = poller_settings.workers,
            "Mailbox poller started"
        );
        let mut tick = tokio::time::interval(poller_settings.poll_interval);

        // Run immediately on first tick
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown_requested(&shutdown) => {}
            }

            if shutdown.load(Ordering::Relaxed) {
                info!("Mailbox poller shutting down");
                return;
            }

            let messages = match fetch_with_retry(
                mailbox.as_ref(),
                poller_settings.max_fetch_attempts,
                poller_settings.fetch_retry_base,
            )
            .await
            {
                Ok(messages) => messages,
                // Try again next tick
                Err(_) => continue,
            };

            if messages.is_empty() {
                continue;
            }
            debug!(count = messages.len(), "Queueing fetched messages");
            for message in messages {
                if tx.send(message).await.is_err() {
                    warn!("Worker queue closed; poller stopping");
                    return;
                }
            }
        }
    }));

    for worker in 0..settings.workers {
        let rx = Arc::clone(&rx);
        let processor = Arc::clone(&processor);
        handles.push(tokio::spawn(async move {
            loop {
                let next = rx.lock().await.recv().await;
                let Some(message) = next else {
                    debug!(worker, "Worker queue closed");
                    return;
                };
                // Errors are recorded by the processor.
                let _ = processor.process(&message, Utc::now()).await;
            }
        }));
    }

    (handles, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::events::EventBus;
    use crate::pipeline::types::{MessageHeaders, OutboundReply};
    use crate::store::memory::{MemoryCalendarStore, MemoryHistoryStore};

    struct FlakyMailbox {
        failures_left: AtomicU32,
        calls: AtomicU32,
        batch: std::sync::Mutex<Vec<Message>>,
    }

    impl FlakyMailbox {
        fn new(failures: u32, batch: Vec<Message>) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                batch: std::sync::Mutex::new(batch),
            }
        }
    }

    #[async_trait]
    impl MailboxProvider for FlakyMailbox {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn fetch_new(&self) -> Result<Vec<Message>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(TransportError::Fetch {
                    reason: "timeout".into(),
                });
            }
            Ok(std::mem::take(&mut *self.batch.lock().unwrap()))
        }

        async fn send_reply(&self, _reply: &OutboundReply) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn message(id: &str, thread: &str) -> Message {
        Message {
            id: id.into(),
            thread_id: thread.into(),
            sender: "carol@client.io".into(),
            sender_name: None,
            recipients: vec![],
            subject: "Support".into(),
            body: "The export is broken".into(),
            received_at: Utc.with_ymd_and_hms(2026, 3, 9, 8, 0, 0).unwrap(),
            headers: MessageHeaders::default(),
        }
    }

    fn settings() -> IngestSettings {
        IngestSettings {
            poll_interval: Duration::from_millis(10),
            workers: 3,
            queue_capacity: 2,
            max_fetch_attempts: 3,
            fetch_retry_base: Duration::from_millis(1),
        }
    }

    fn processor(mailbox: Arc<dyn MailboxProvider>) -> Arc<MessageProcessor> {
        Arc::new(MessageProcessor::from_config(
            &PipelineConfig::default(),
            Arc::new(MemoryCalendarStore::new()),
            Arc::new(MemoryHistoryStore::new()),
            mailbox,
            EventBus::new(),
        ))
    }

    #[tokio::test]
    async fn fetch_recovers_from_transient_failure() {
        let mailbox = FlakyMailbox::new(2, vec![message("m1", "t1")]);
        let messages = fetch_with_retry(&mailbox, 3, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(mailbox.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fetch_gives_up_after_max_attempts() {
        let mailbox = FlakyMailbox::new(5, vec![]);
        let err = fetch_with_retry(&mailbox, 3, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Exhausted { attempts: 3, .. }));
        assert_eq!(mailbox.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn ingest_once_processes_batch() {
        let mailbox: Arc<dyn MailboxProvider> =
            Arc::new(FlakyMailbox::new(0, vec![message("m1", "t1"), message("m2", "t2")]));
        let processor = processor(Arc::clone(&mailbox));
        let processed = ingest_once(mailbox.as_ref(), &processor, &settings())
            .await
            .unwrap();
        assert_eq!(processed.len(), 2);
    }

    #[tokio::test]
    async fn workers_drain_queue() {
        let batch: Vec<Message> = (0..8)
            .map(|i| message(&format!("m{i}"), &format!("t{i}")))
            .collect();
        let mailbox: Arc<dyn MailboxProvider> = Arc::new(FlakyMailbox::new(1, batch));
        let processor = processor(Arc::clone(&mailbox));
        let (handles, shutdown) = spawn_ingest(Arc::clone(&mailbox), Arc::clone(&processor), settings());

        let responder = processor.responder();
        let mut seen = 0;
        for _ in 0..200 {
            seen = 0;
            for i in 0..8 {
                if !responder.tasks_for_thread(&format!("t{i}")).await.is_empty() {
                    seen += 1;
                }
            }
            if seen == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen, 8);

        shutdown.store(true, Ordering::Relaxed);
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
