//! Reply composition: per-category templates filled from the inbound
//! message, the calendar decision and the user's identity.

use chrono_tz::Tz;

use crate::calendar::model::TimeWindow;
use crate::calendar::resolver::Decision;
use crate::config::PipelineConfig;
use crate::pipeline::meeting::strip_reply_prefixes;
use crate::pipeline::types::{Category, Message, OutboundReply};

/// Fills reply templates.
#[derive(Debug, Clone)]
pub struct ReplyComposer {
    user_name: String,
    signature: String,
    timezone: Tz,
}

impl ReplyComposer {
    pub fn new(user_name: impl Into<String>, signature: impl Into<String>, timezone: Tz) -> Self {
        Self {
            user_name: user_name.into(),
            signature: signature.into(),
            timezone,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.user_name.clone(),
            config.signature.clone(),
            config.timezone,
        )
    }

    /// Build the reply to `message` for its dominant `category`.
    pub fn compose(
        &self,
        message: &Message,
        category: Category,
        decision: Option<&Decision>,
    ) -> OutboundReply {
        let greeting = match category {
            Category::Application => format!("Dear {},", message.sender_display()),
            _ => format!("Hello {},", message.sender_display()),
        };
        let content = match category {
            Category::Application => application_body(),
            Category::MeetingRequest => self.meeting_body(message, decision),
            Category::Support => support_body(),
            Category::Invoice => invoice_body(),
            _ => default_body(),
        };

        let mut body = format!("{greeting}\n\n{content}\n\nBest regards,\n{}", self.user_name);
        if !self.signature.trim().is_empty() {
            body.push('\n');
            body.push_str(self.signature.trim());
        }

        let mut references = message.headers.references.clone();
        if !references.contains(&message.id) {
            references.push(message.id.clone());
        }

        OutboundReply {
            thread_id: message.thread_id.clone(),
            in_reply_to: message.id.clone(),
            to: message
                .headers
                .reply_to
                .clone()
                .unwrap_or_else(|| message.sender.clone()),
            subject: reply_subject(&message.subject),
            body,
            references,
        }
    }

    fn meeting_body(&self, message: &Message, decision: Option<&Decision>) -> String {
        let topic = strip_reply_prefixes(&message.subject);
        let topic = if topic.is_empty() { "our meeting" } else { topic };
        match decision {
            Some(Decision::Confirm { event }) => format!(
                "Thank you for the invitation to \"{topic}\" on {}.\n\n\
                 The slot is free in my calendar and I have pencilled it in.",
                self.format_window(&event.window)
            ),
            Some(Decision::Conflict { alternatives, .. }) if !alternatives.is_empty() => {
                let options = alternatives
                    .iter()
                    .map(|w| format!("  - {}", self.format_window(w)))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!(
                    "Thank you for the invitation to \"{topic}\". Unfortunately I am not \
                     available at the proposed time.\n\nWould one of these work instead?\n{options}"
                )
            }
            Some(Decision::Conflict { .. }) => format!(
                "Thank you for the invitation to \"{topic}\". Unfortunately I am not \
                 available at the proposed time. I will come back to you with another slot."
            ),
            Some(Decision::Ambiguous { candidates }) => {
                let options = candidates
                    .iter()
                    .map(|w| format!("  - {}", self.format_window(w)))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!(
                    "Thank you for the invitation to \"{topic}\". I noted these options:\n{options}\n\n\
                     I will confirm which one suits me shortly."
                )
            }
            None => format!(
                "Thank you for the invitation to \"{topic}\". I will check my calendar \
                 and get back to you."
            ),
        }
    }

    fn format_window(&self, window: &TimeWindow) -> String {
        let start = window.start().with_timezone(&self.timezone);
        let end = window.end().with_timezone(&self.timezone);
        if start.date_naive() == end.date_naive() {
            format!(
                "{} from {} to {}",
                start.format("%A %-d %B %Y"),
                start.format("%H:%M"),
                end.format("%H:%M")
            )
        } else {
            format!(
                "{} to {}",
                start.format("%A %-d %B %Y %H:%M"),
                end.format("%A %-d %B %Y %H:%M")
            )
        }
    }
}

/// `Re: <subject>` with exactly one prefix.
pub fn reply_subject(subject: &str) -> String {
    let base = strip_reply_prefixes(subject);
    if base.is_empty() {
        "Re: your message".to_string()
    } else {
        format!("Re: {base}")
    }
}

fn application_body() -> String {
    "We acknowledge receipt of your application. It has been registered and will be \
     reviewed by our recruitment team as soon as possible. We will contact you if your \
     profile matches our needs."
        .to_string()
}

fn support_body() -> String {
    "Thank you for reaching out. Your request has been received and we will get back \
     to you as soon as possible."
        .to_string()
}

fn invoice_body() -> String {
    "Thank you for your invoice. It has been received and forwarded for processing.".to_string()
}

fn default_body() -> String {
    "Thank you for your email. I have received it and will reply as soon as possible."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use crate::calendar::model::{CalendarEvent, EventSource};
    use crate::pipeline::types::MessageHeaders;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, 0, 0).unwrap()
    }

    fn message(subject: &str) -> Message {
        Message {
            id: "<m2@acme.com>".into(),
            thread_id: "t1".into(),
            sender: "bob@acme.com".into(),
            sender_name: Some("Bob Stone".into()),
            recipients: vec![],
            subject: subject.into(),
            body: String::new(),
            received_at: at(9, 8),
            headers: MessageHeaders {
                references: vec!["<m1@acme.com>".into()],
                ..MessageHeaders::default()
            },
        }
    }

    fn composer() -> ReplyComposer {
        ReplyComposer::new("Ada", "-- \nAda Lovelace", Tz::UTC)
    }

    #[test]
    fn subject_has_single_prefix() {
        assert_eq!(reply_subject("Re: RE: Help"), "Re: Help");
        assert_eq!(reply_subject("Help"), "Re: Help");
        assert_eq!(reply_subject(""), "Re: your message");
    }

    #[test]
    fn threading_headers_extend_chain() {
        let reply = composer().compose(&message("Help"), Category::Support, None);
        assert_eq!(reply.in_reply_to, "<m2@acme.com>");
        assert_eq!(reply.references, vec!["<m1@acme.com>", "<m2@acme.com>"]);
        assert_eq!(reply.to, "bob@acme.com");
        assert!(reply.body.starts_with("Hello Bob Stone,"));
        assert!(reply.body.ends_with("Ada Lovelace"));
    }

    #[test]
    fn reply_to_header_wins() {
        let mut msg = message("Help");
        msg.headers.reply_to = Some("support-desk@acme.com".into());
        let reply = composer().compose(&msg, Category::Support, None);
        assert_eq!(reply.to, "support-desk@acme.com");
    }

    #[test]
    fn meeting_reply_lists_alternatives() {
        let requested = TimeWindow::starting_at(at(10, 15), Duration::hours(1)).unwrap();
        let alt = TimeWindow::starting_at(at(10, 9), Duration::hours(1)).unwrap();
        let decision = Decision::Conflict {
            requested,
            overlapping: vec![],
            alternatives: vec![alt],
        };
        let reply = composer().compose(&message("Re: Sync"), Category::MeetingRequest, Some(&decision));
        assert!(reply.body.contains("\"Sync\""));
        assert!(reply.body.contains("Tuesday 10 March 2026 from 09:00 to 10:00"));
    }

    #[test]
    fn meeting_reply_confirms_slot() {
        let window = TimeWindow::starting_at(at(10, 15), Duration::hours(1)).unwrap();
        let decision = Decision::Confirm {
            event: CalendarEvent::new("Sync", window, EventSource::Proposed),
        };
        let reply = composer().compose(&message("Sync"), Category::MeetingRequest, Some(&decision));
        assert!(reply.body.contains("pencilled it in"));
        assert!(reply.body.contains("15:00 to 16:00"));
    }

    #[test]
    fn application_uses_formal_greeting() {
        let reply = composer().compose(&message("Application"), Category::Application, None);
        assert!(reply.body.starts_with("Dear Bob Stone,"));
        assert!(reply.body.contains("recruitment team"));
    }
}
