//! End-to-end pipeline scenarios.
//!
//! Each test wires a `MessageProcessor` to in-memory stores and a recording
//! mailbox, feeds it messages with explicit timestamps, and drives the reply
//! schedule by calling `fire_due` with a chosen "now".

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;

use mail_autopilot::calendar::{CalendarEvent, Decision, EventSource, TimeWindow};
use mail_autopilot::config::PipelineConfig;
use mail_autopilot::error::TransportError;
use mail_autopilot::events::{Command, EventBus};
use mail_autopilot::pipeline::types::MessageHeaders;
use mail_autopilot::pipeline::{
    Category, MailboxProvider, Message, MessageProcessor, OutboundReply,
};
use mail_autopilot::responder::{FireOutcome, InboundOutcome, ReplyStatus, TaskReason};
use mail_autopilot::store::{HistoryStore, MemoryCalendarStore, MemoryHistoryStore};

/// Mailbox that keeps every reply it is asked to send.
#[derive(Default)]
struct RecordingMailbox {
    sent: Mutex<Vec<OutboundReply>>,
}

impl RecordingMailbox {
    fn sent(&self) -> Vec<OutboundReply> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailboxProvider for RecordingMailbox {
    fn name(&self) -> &str {
        "recording"
    }

    async fn fetch_new(&self) -> Result<Vec<Message>, TransportError> {
        Ok(Vec::new())
    }

    async fn send_reply(&self, reply: &OutboundReply) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(reply.clone());
        Ok(())
    }
}

struct Harness {
    processor: MessageProcessor,
    mailbox: Arc<RecordingMailbox>,
    history: Arc<MemoryHistoryStore>,
}

fn harness_with(config: PipelineConfig, calendar: MemoryCalendarStore) -> Harness {
    let mailbox = Arc::new(RecordingMailbox::default());
    let history = Arc::new(MemoryHistoryStore::new());
    let processor = MessageProcessor::from_config(
        &config,
        Arc::new(calendar),
        history.clone(),
        mailbox.clone(),
        EventBus::new(),
    );
    Harness {
        processor,
        mailbox,
        history,
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        user_address: Some("me@example.org".into()),
        user_name: "Sam Doe".into(),
        timezone: Tz::UTC,
        ..PipelineConfig::default()
    }
}

fn harness() -> Harness {
    harness_with(config(), MemoryCalendarStore::new())
}

/// March 2026; the 9th is a Monday.
fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, d, h, m, 0).unwrap()
}

fn message(id: &str, thread: &str, subject: &str, body: &str, received: DateTime<Utc>) -> Message {
    Message {
        id: id.into(),
        thread_id: thread.into(),
        sender: "carol@client.io".into(),
        sender_name: Some("Carol".into()),
        recipients: vec!["me@example.org".into()],
        subject: subject.into(),
        body: body.into(),
        received_at: received,
        headers: MessageHeaders::default(),
    }
}

fn support(id: &str, thread: &str, received: DateTime<Utc>) -> Message {
    message(
        id,
        thread,
        "Support request",
        "The export is broken, please help",
        received,
    )
}

fn meeting(id: &str, thread: &str, body: &str) -> Message {
    message(id, thread, "Meeting request", body, at(9, 8, 0))
}

// ── Classification ──────────────────────────────────────────────────

#[tokio::test]
async fn classification_is_deterministic() {
    let msg = support("m1", "t1", at(9, 8, 0));
    let a = harness().processor.classifier().classify(&msg).unwrap();
    let b = harness().processor.classifier().classify(&msg).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.dominant, Category::Support);
    assert!(a.confidences.values().all(|c| (0.0..=1.0).contains(c)));
}

// ── Loop avoidance ──────────────────────────────────────────────────

#[tokio::test]
async fn reply_count_never_exceeds_cap() {
    let h = harness_with(
        PipelineConfig {
            min_reply_interval_minutes: 0,
            ..config()
        },
        MemoryCalendarStore::new(),
    );
    let cap = config().max_auto_replies_per_thread;

    for i in 0..(cap + 3) {
        let received = at(9, 9, 0) + Duration::minutes(10 * i as i64);
        h.processor
            .process(&support(&format!("m{i}"), "t1", received), received)
            .await
            .unwrap();
        h.processor
            .responder()
            .fire_due(received + Duration::minutes(6))
            .await;

        let history = h.history.get_history("t1").await.unwrap();
        assert!(history.auto_reply_count <= cap);
    }

    assert_eq!(h.mailbox.sent().len(), cap as usize);
    let suppressed = h
        .processor
        .responder()
        .tasks_with_status(ReplyStatus::Suppressed)
        .await;
    assert_eq!(suppressed.len(), 3);
    assert!(suppressed
        .iter()
        .all(|t| matches!(t.reason, Some(TaskReason::ReplyCapReached { .. }))));
}

#[tokio::test]
async fn human_reply_cancels_pending_reply() {
    let h = harness();
    h.processor
        .process(&support("m1", "t1", at(9, 9, 0)), at(9, 9, 0))
        .await
        .unwrap();

    let mut mine = support("m2", "t1", at(9, 9, 1));
    mine.sender = "me@example.org".into();
    mine.subject = "Re: Support request".into();
    let processed = h.processor.process(&mine, at(9, 9, 1)).await.unwrap();
    assert!(processed.manual_reply);

    let outcomes = h.processor.responder().fire_due(at(9, 9, 30)).await;
    assert!(outcomes.iter().all(|o| matches!(o, FireOutcome::Stale { .. })));
    assert!(h.mailbox.sent().is_empty());

    let tasks = h.processor.responder().tasks_for_thread("t1").await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, ReplyStatus::Cancelled);
    assert!(matches!(tasks[0].reason, Some(TaskReason::HumanReplied { .. })));

    let history = h.history.get_history("t1").await.unwrap();
    assert_eq!(history.auto_reply_count, 0);
    assert_eq!(history.last_human_reply_at, Some(at(9, 9, 1)));
}

#[tokio::test]
async fn auto_submitted_support_message_is_suppressed() {
    let h = harness();
    let mut msg = support("m1", "t1", at(9, 9, 0));
    msg.headers.auto_submitted = Some("auto-replied".into());

    let processed = h.processor.process(&msg, at(9, 9, 0)).await.unwrap();
    assert!(matches!(
        processed.reply,
        Some(InboundOutcome::Suppressed {
            reason: TaskReason::AutoSubmitted,
            ..
        })
    ));

    h.processor.responder().fire_due(at(9, 10, 0)).await;
    assert!(h.mailbox.sent().is_empty());
    assert_eq!(h.history.get_history("t1").await.unwrap().auto_reply_count, 0);
}

#[tokio::test]
async fn burst_on_one_thread_sends_one_reply() {
    let h = harness();
    h.processor
        .process(&support("m1", "t1", at(9, 9, 0)), at(9, 9, 0))
        .await
        .unwrap();
    let second = h
        .processor
        .process(&support("m2", "t1", at(9, 9, 1)), at(9, 9, 1))
        .await
        .unwrap();
    assert!(matches!(
        second.reply,
        Some(InboundOutcome::Scheduled {
            superseded: Some(_),
            ..
        })
    ));

    let responder = h.processor.responder();
    responder.fire_due(at(9, 9, 5)).await;
    assert!(h.mailbox.sent().is_empty());
    responder.fire_due(at(9, 9, 6)).await;
    responder.fire_due(at(9, 9, 30)).await;

    let sent = h.mailbox.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].in_reply_to, "m2");
    assert_eq!(sent[0].subject, "Re: Support request");
    assert_eq!(h.history.get_history("t1").await.unwrap().auto_reply_count, 1);
}

#[tokio::test]
async fn out_of_order_delivery_answers_the_newest_message() {
    let h = harness();
    h.processor
        .process(&support("m2", "t1", at(9, 9, 1)), at(9, 9, 1))
        .await
        .unwrap();
    let late = h
        .processor
        .process(&support("m1", "t1", at(9, 9, 0)), at(9, 9, 2))
        .await
        .unwrap();
    assert!(matches!(
        late.reply,
        Some(InboundOutcome::Outdated { ref newer_message_id, .. }) if newer_message_id == "m2"
    ));

    h.processor.responder().fire_due(at(9, 9, 30)).await;
    let sent = h.mailbox.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].in_reply_to, "m2");
    assert_eq!(h.history.get_history("t1").await.unwrap().auto_reply_count, 1);
}

// ── Calendar ────────────────────────────────────────────────────────

#[tokio::test]
async fn conflict_offers_alternatives_clear_of_buffer() {
    let board = CalendarEvent::new(
        "Board review",
        TimeWindow::new(at(10, 15, 30), at(10, 16, 30)).unwrap(),
        EventSource::Confirmed,
    );
    let h = harness_with(config(), MemoryCalendarStore::with_events([board.clone()]));

    let processed = h
        .processor
        .process(
            &meeting("m1", "t1", "Could we schedule a meeting on Tuesday 3-4pm?"),
            at(9, 8, 0),
        )
        .await
        .unwrap();

    let (requested, overlapping, alternatives) = match processed.decision {
        Some(Decision::Conflict {
            requested,
            overlapping,
            alternatives,
        }) => (requested, overlapping, alternatives),
        other => panic!("expected a conflict, got {other:?}"),
    };
    assert_eq!(requested.start(), at(10, 15, 0));
    assert_eq!(overlapping.len(), 1);
    assert_eq!(overlapping[0].id, board.id);

    let buffer = Duration::minutes(config().calendar_buffer_minutes);
    assert!(!alternatives.is_empty());
    for slot in &alternatives {
        assert_eq!(slot.duration(), Duration::hours(1));
        assert!(!slot.overlaps_with_buffer(&board.window, buffer));
    }

    // Nothing is held for a conflicting request.
    let held = h
        .processor
        .calendar()
        .events_between(at(10, 0, 0), at(11, 0, 0))
        .await
        .unwrap();
    assert_eq!(held.len(), 1);
}

#[tokio::test]
async fn ambiguous_dates_are_not_scheduled() {
    let h = harness();
    let processed = h
        .processor
        .process(
            &meeting("m1", "t1", "Could we schedule a meeting, maybe Monday or Wednesday?"),
            at(9, 8, 0),
        )
        .await
        .unwrap();

    let candidates = match processed.decision {
        Some(Decision::Ambiguous { candidates }) => candidates,
        other => panic!("expected ambiguity, got {other:?}"),
    };
    assert_eq!(candidates.len(), 2);
    assert!(
        h.processor
            .calendar()
            .events_between(at(9, 0, 0), at(20, 0, 0))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn confirmed_events_never_overlap() {
    let h = harness();
    let requests = [
        ("m1", "t1", "Could we schedule a meeting on Tuesday 3-4pm?"),
        ("m2", "t2", "Could we schedule a meeting on Tuesday 3-4pm?"),
        ("m3", "t3", "Could we schedule a meeting on Tuesday 5-6pm?"),
    ];

    for (id, thread, body) in requests {
        let processed = h
            .processor
            .process(&meeting(id, thread, body), at(9, 8, 0))
            .await
            .unwrap();
        if let Some(Decision::Confirm { event }) = processed.decision {
            h.processor
                .apply_command(Command::ConfirmEvent { event_id: event.id })
                .await
                .unwrap();
        }
    }

    let calendar = h.processor.calendar();
    let manual = TimeWindow::new(at(10, 15, 45), at(10, 16, 15)).unwrap();
    assert!(calendar.add_manual("Dentist", manual).await.is_err());

    let events = calendar
        .events_between(at(9, 0, 0), at(20, 0, 0))
        .await
        .unwrap();
    let confirmed: Vec<_> = events
        .iter()
        .filter(|e| e.source == EventSource::Confirmed)
        .collect();
    assert_eq!(confirmed.len(), 2);

    let buffer = Duration::minutes(config().calendar_buffer_minutes);
    for (i, a) in confirmed.iter().enumerate() {
        for b in &confirmed[i + 1..] {
            assert!(!a.window.overlaps_with_buffer(&b.window, buffer));
        }
    }
}
