use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::common::NetworkEvent;

const PROMPT: &str = "You: ";

/// Forwards stdin lines to the chat write loop until stdin closes.
pub fn spawn_stdin_reader(lines: mpsc::Sender<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match stdin.next_line().await {
                Ok(Some(line)) => {
                    if lines.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    log::warn!("Input error: {err}");
                    break;
                }
            }
        }
    })
}

/// Prints events for the user until the channel closes.
pub async fn render_events(mut events: mpsc::Receiver<NetworkEvent>) {
    while let Some(event) = events.recv().await {
        if let Some(text) = format_event(&event) {
            println!("\n{text}");
            print!("{PROMPT}");
            let _ = std::io::stdout().flush();
        }
    }
}

pub fn format_event(event: &NetworkEvent) -> Option<String> {
    match event {
        NetworkEvent::Paired(peer) => Some(format!("🤝 Matched with {peer}")),
        NetworkEvent::SessionStarted(peer) => Some(format!("📤 Chat started with {peer}")),
        NetworkEvent::MessageReceived {
            message,
            received_at,
            ..
        } => Some(format!(
            "[{}] 👤 {}: {}",
            received_at.format("%H:%M:%S"),
            message.username,
            message.text
        )),
        NetworkEvent::PeerLeft(peer) => Some(format!("📴 {peer} left the chat")),
        NetworkEvent::SessionEnded(_) => None,
        NetworkEvent::Notice(text) => Some(text.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ChatMessage;
    use chrono::{TimeZone, Utc};
    use libp2p::PeerId;

    #[test]
    fn message_is_shown_with_sender_name() {
        let event = NetworkEvent::MessageReceived {
            from: PeerId::random(),
            message: ChatMessage::new("alice", "hello"),
            received_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 5).unwrap(),
        };
        assert_eq!(
            format_event(&event).unwrap(),
            "[09:30:05] 👤 alice: hello"
        );
    }

    #[test]
    fn session_end_is_silent() {
        assert!(format_event(&NetworkEvent::SessionEnded(PeerId::random())).is_none());
    }
}
