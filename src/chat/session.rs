use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use chrono::Utc;
use libp2p::{PeerId, StreamProtocol};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::common::{ChatMessage, NetworkEvent};
use crate::network::{ConnectError, PeerConnector};

pub const CHAT_PROTOCOL: StreamProtocol = StreamProtocol::new("/chat/1.0.0");

/// Longest chat record accepted from a peer, newline included.
pub const MAX_RECORD_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("already chatting with {0}")]
    AlreadyActive(PeerId),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// One outgoing write loop per peer, one read loop per inbound chat stream.
pub struct ChatSessions<C> {
    connector: C,
    username: Arc<str>,
    /// Peers with a running write loop
    active: Arc<Mutex<HashSet<PeerId>>>,
    /// Lines typed by the user
    outgoing: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    events: mpsc::Sender<NetworkEvent>,
}

impl<C: Clone> Clone for ChatSessions<C> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            username: Arc::clone(&self.username),
            active: Arc::clone(&self.active),
            outgoing: Arc::clone(&self.outgoing),
            events: self.events.clone(),
        }
    }
}

impl<C: PeerConnector> ChatSessions<C> {
    pub fn new(
        connector: C,
        username: impl Into<String>,
        outgoing: mpsc::Receiver<String>,
        events: mpsc::Sender<NetworkEvent>,
    ) -> Self {
        let username: String = username.into();
        Self {
            connector,
            username: username.into(),
            active: Arc::new(Mutex::new(HashSet::new())),
            outgoing: Arc::new(tokio::sync::Mutex::new(outgoing)),
            events,
        }
    }

    pub fn is_active(&self, peer: &PeerId) -> bool {
        self.active.lock().contains(peer)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Opens our chat stream to `peer` and starts the write loop on it.
    /// A second call for a peer whose write loop is still running is refused.
    pub async fn start_session(&self, peer: PeerId) -> Result<JoinHandle<()>, SessionError> {
        if !self.active.lock().insert(peer) {
            log::info!("Already chatting with {peer}");
            return Err(SessionError::AlreadyActive(peer));
        }

        let stream = match self.open_chat_stream(peer).await {
            Ok(stream) => stream,
            Err(err) => {
                self.active.lock().remove(&peer);
                return Err(err.into());
            }
        };

        log::info!("Chat started with {peer}");
        let _ = self.events.send(NetworkEvent::SessionStarted(peer)).await;

        let username = Arc::clone(&self.username);
        let outgoing = Arc::clone(&self.outgoing);
        let active = Arc::clone(&self.active);
        let events = self.events.clone();
        Ok(tokio::spawn(async move {
            if let Err(err) = write_loop(stream, &username, &outgoing).await {
                log::debug!("Write loop to {peer} stopped: {err}");
            }
            active.lock().remove(&peer);
            let _ = events.send(NetworkEvent::SessionEnded(peer)).await;
        }))
    }

    async fn open_chat_stream(&self, peer: PeerId) -> Result<C::Stream, ConnectError> {
        self.connector.connect(peer).await?;
        self.connector.open_stream(peer, CHAT_PROTOCOL).await
    }

    /// Starts the read loop for a chat stream `peer` opened to us.
    pub fn on_incoming_stream<S>(&self, peer: PeerId, stream: S) -> JoinHandle<()>
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        log::info!("Incoming chat stream from {peer}");
        let events = self.events.clone();
        tokio::spawn(read_loop(peer, stream, events))
    }
}

/// Sends every non-empty input line as one JSON record per line. Returns
/// when the input ends or a write fails.
async fn write_loop<W>(
    mut stream: W,
    username: &str,
    outgoing: &tokio::sync::Mutex<mpsc::Receiver<String>>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = outgoing.lock().await.recv().await;
        let Some(line) = line else {
            let _ = stream.shutdown().await;
            return Ok(());
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        let mut record = serde_json::to_vec(&ChatMessage::new(username, text))?;
        record.push(b'\n');
        stream.write_all(&record).await?;
        stream.flush().await?;
    }
}

/// Surfaces each decoded message until the stream ends. Errors here mean the
/// peer went away, and so does a record longer than [`MAX_RECORD_LEN`].
async fn read_loop<R>(peer: PeerId, stream: R, events: mpsc::Sender<NetworkEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut record = Vec::new();
    loop {
        record.clear();
        let read = (&mut reader)
            .take(MAX_RECORD_LEN as u64)
            .read_until(b'\n', &mut record)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                if !record.ends_with(b"\n") && record.len() >= MAX_RECORD_LEN {
                    log::debug!("Oversized message from {peer}, closing");
                    break;
                }
                if record.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<ChatMessage>(&record) {
                    Ok(message) => {
                        let event = NetworkEvent::MessageReceived {
                            from: peer,
                            message,
                            received_at: Utc::now(),
                        };
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        log::debug!("Undecodable message from {peer}: {err}");
                        break;
                    }
                }
            }
            Err(err) => {
                log::debug!("Chat stream from {peer} failed: {err}");
                break;
            }
        }
    }
    log::info!("{peer} left the chat");
    let _ = events.send(NetworkEvent::PeerLeft(peer)).await;
}
