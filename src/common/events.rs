use chrono::{DateTime, Utc};
use libp2p::PeerId;

use super::types::ChatMessage;

/// Events surfaced from the networking side to the console.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// Handshake finished, `peer` is our chat partner for this run.
    Paired(PeerId),
    /// Our outgoing chat stream to `peer` is open.
    SessionStarted(PeerId),
    MessageReceived {
        from: PeerId,
        message: ChatMessage,
        received_at: DateTime<Utc>,
    },
    /// The remote side closed (or broke) its chat stream.
    PeerLeft(PeerId),
    /// Our write loop towards `peer` stopped.
    SessionEnded(PeerId),
    Notice(String),
}
