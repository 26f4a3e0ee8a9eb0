use std::error::Error;

use futures::{Stream, StreamExt};
use libp2p::PeerId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chat::{CHAT_PROTOCOL, ChatSessions, console};
use crate::common::NetworkEvent;
use crate::config::AppConfig;
use crate::network::{PeerConnector, PeerHost, TopicId};
use crate::pairing::{
    DiscoveryConfig, DiscoveryOutcome, MATCH_PROTOCOL, Matchmaker, MatchmakerConfig,
    run_discovery,
};

const EVENT_CHANNEL_SIZE: usize = 100;
const INPUT_CHANNEL_SIZE: usize = 16;

pub struct FindOptions {
    pub token: String,
    pub name: String,
}

/// Runs the `find` command until Ctrl+C. Only failures to bring up the
/// network layer are returned; everything after that is handled in place.
pub async fn run_find(config: AppConfig, options: FindOptions) -> Result<(), Box<dyn Error>> {
    let (host, handle) = PeerHost::start(&config)?;
    let host_task = tokio::spawn(host.run());

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let console_task = tokio::spawn(console::render_events(event_rx));
    let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_SIZE);
    let stdin_task = console::spawn_stdin_reader(input_tx);

    let sessions = ChatSessions::new(handle.clone(), options.name, input_rx, event_tx.clone());
    let (matchmaker, paired) = Matchmaker::new(
        handle.clone(),
        MatchmakerConfig {
            handshake_timeout: config.handshake_timeout(),
        },
    );

    let handshakes = serve_handshakes(handle.accept(MATCH_PROTOCOL)?, matchmaker.clone());
    let chats = serve_chat_streams(handle.accept(CHAT_PROTOCOL)?, sessions.clone());
    let pairing = start_sessions_when_paired(paired, sessions, event_tx.clone());

    log::info!(
        "Waiting {:?} for the DHT routing table to fill",
        config.bootstrap_wait()
    );
    tokio::time::sleep(config.bootstrap_wait()).await;
    for addr in handle.listen_addrs().await {
        log::info!("Listening on {addr}");
    }

    let topic = TopicId::from_token(&options.token);
    let discovery_config = DiscoveryConfig {
        poll_interval: config.poll_interval(),
        poll_jitter: config.poll_jitter(),
        search_window: config.search_window(),
        retry_backoff: config.retry_backoff(),
        lookup_timeout: config.lookup_timeout(),
    };
    let _ = event_tx
        .send(NetworkEvent::Notice(format!(
            "🔍 Searching for a partner with token \"{}\"...",
            options.token
        )))
        .await;
    let discovery = tokio::spawn({
        let event_tx = event_tx.clone();
        let handle = handle.clone();
        async move {
            let notice = match run_discovery(handle, matchmaker, topic, discovery_config).await {
                Ok(DiscoveryOutcome::Paired(peer)) => format!("Pairing done with {peer}"),
                Ok(DiscoveryOutcome::WindowElapsed) => {
                    "No partner found. Waiting for someone to reach out; Ctrl+C to exit.".to_string()
                }
                Err(err) => format!("Discovery stopped: {err}"),
            };
            let _ = event_tx.send(NetworkEvent::Notice(notice)).await;
        }
    });

    println!("P2P chat is running. Press Ctrl+C to exit.");
    signal::ctrl_c().await?;
    log::info!("Received shutdown signal, shutting down...");

    for task in [discovery, pairing, handshakes, chats, stdin_task, console_task] {
        task.abort();
    }
    drop(handle);
    host_task.abort();
    Ok(())
}

/// Runs the responder side of the handshake for every inbound handshake
/// stream, each in its own task.
pub fn serve_handshakes<C, S, I>(mut incoming: I, matchmaker: Matchmaker<C>) -> JoinHandle<()>
where
    C: PeerConnector,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    I: Stream<Item = (PeerId, S)> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some((peer, stream)) = incoming.next().await {
            let matchmaker = matchmaker.clone();
            tokio::spawn(async move {
                match matchmaker.handle_inbound(peer, stream).await {
                    Ok(peer) => log::info!("Paired with {peer} (inbound)"),
                    Err(err) => log::info!("Inbound pairing from {peer} ended: {err}"),
                }
            });
        }
    })
}

/// Starts a read loop for every inbound chat stream.
pub fn serve_chat_streams<C, S, I>(mut incoming: I, sessions: ChatSessions<C>) -> JoinHandle<()>
where
    C: PeerConnector,
    S: AsyncRead + Unpin + Send + 'static,
    I: Stream<Item = (PeerId, S)> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some((peer, stream)) = incoming.next().await {
            sessions.on_incoming_stream(peer, stream);
        }
    })
}

/// Opens the chat session once the matchmaker reports a partner.
pub fn start_sessions_when_paired<C: PeerConnector>(
    mut paired: mpsc::UnboundedReceiver<PeerId>,
    sessions: ChatSessions<C>,
    events: mpsc::Sender<NetworkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(peer) = paired.recv().await {
            let _ = events.send(NetworkEvent::Paired(peer)).await;
            if let Err(err) = sessions.start_session(peer).await {
                log::warn!("Could not start chat with {peer}: {err}");
                let _ = events
                    .send(NetworkEvent::Notice(format!("❌ Could not start chat: {err}")))
                    .await;
            }
        }
    })
}
