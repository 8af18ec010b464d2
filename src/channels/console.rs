//! Console presentation: pipeline events as JSON lines on stdout, commands
//! as JSON lines on stdin.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::events::{Command, EventBus};
use crate::pipeline::processor::MessageProcessor;

/// Print every pipeline event as one JSON line.
pub fn spawn_event_printer(events: &EventBus) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "Failed to serialize event"),
                },
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Event printer lagged behind");
                }
                Err(RecvError::Closed) => return,
            }
        }
    })
}

/// Parse one command line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Option<Result<Command, serde_json::Error>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_str(line))
}

/// Read JSON commands from stdin until EOF and apply them.
pub fn spawn_command_reader(processor: Arc<MessageProcessor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stdin = tokio::io::stdin();
        let reader = BufReader::new(stdin);
        let mut lines = reader.lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_command(&line) {
                    None => continue,
                    Some(Ok(command)) => {
                        if let Err(e) = processor.apply_command(command).await {
                            error!(error = %e, "Command failed");
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "Unrecognised command"),
                },
                Ok(None) => {
                    debug!("Command input closed");
                    break;
                }
                Err(e) => {
                    error!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_skipped() {
        assert!(parse_command("   ").is_none());
    }

    #[test]
    fn commands_parse() {
        let cmd = parse_command(r#"{"action":"set_spam_threshold","value":0.8}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(cmd, Command::SetSpamThreshold { value } if value == 0.8));
        assert!(parse_command("approve everything").unwrap().is_err());
    }
}
