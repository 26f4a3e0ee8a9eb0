//! In-memory stand-ins for the peer-networking layer, backed by
//! `tokio::io::duplex`, plus end-to-end scenarios built on them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use libp2p::{PeerId, StreamProtocol};
use parking_lot::Mutex;
use tokio::io::{DuplexStream, duplex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::app::serve_handshakes;
use crate::network::{ConnectError, DirectoryError, PeerConnector, RendezvousDirectory, TopicId};
use crate::pairing::{MATCH_PROTOCOL, Matchmaker};

const PIPE_CAPACITY: usize = 64 * 1024;

type Inbound = (PeerId, DuplexStream);

#[derive(Default)]
struct Registry {
    peers: HashSet<PeerId>,
    handlers: HashMap<(PeerId, StreamProtocol), mpsc::UnboundedSender<Inbound>>,
    providers: HashMap<TopicId, Vec<PeerId>>,
    /// Streams can only be opened over an existing connection.
    connections: HashSet<(PeerId, PeerId)>,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self) -> MemoryPeer {
        let id = PeerId::random();
        self.registry.lock().peers.insert(id);
        MemoryPeer {
            id,
            net: self.clone(),
        }
    }

    /// Streams other peers open to `peer` for `protocol`. Holding the
    /// receiver without reading from the streams simulates a silent peer.
    pub fn accept(
        &self,
        peer: &MemoryPeer,
        protocol: StreamProtocol,
    ) -> mpsc::UnboundedReceiver<Inbound> {
        self.register(peer.id, protocol)
    }

    pub fn is_connected(&self, a: PeerId, b: PeerId) -> bool {
        self.registry.lock().connections.contains(&(a, b))
    }

    pub fn incoming(&self, peer: PeerId, protocol: StreamProtocol) -> BoxStream<'static, Inbound> {
        let mut receiver = self.register(peer, protocol);
        stream::poll_fn(move |cx| receiver.poll_recv(cx)).boxed()
    }

    fn register(&self, peer: PeerId, protocol: StreamProtocol) -> mpsc::UnboundedReceiver<Inbound> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.registry.lock().handlers.insert((peer, protocol), sender);
        receiver
    }
}

#[derive(Clone)]
pub struct MemoryPeer {
    id: PeerId,
    net: MemoryNetwork,
}

#[async_trait]
impl PeerConnector for MemoryPeer {
    type Stream = DuplexStream;

    fn local_peer_id(&self) -> PeerId {
        self.id
    }

    async fn connect(&self, peer: PeerId) -> Result<(), ConnectError> {
        let mut registry = self.net.registry.lock();
        if registry.peers.contains(&peer) {
            registry.connections.insert((self.id, peer));
            registry.connections.insert((peer, self.id));
            Ok(())
        } else {
            Err(ConnectError::Dial {
                peer,
                reason: "unknown peer".to_string(),
            })
        }
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Self::Stream, ConnectError> {
        let (local, remote) = duplex(PIPE_CAPACITY);
        let registry = self.net.registry.lock();
        if !registry.connections.contains(&(self.id, peer)) {
            return Err(ConnectError::OpenStream {
                peer,
                protocol,
                reason: "no connection to peer".to_string(),
            });
        }
        let delivered = registry
            .handlers
            .get(&(peer, protocol.clone()))
            .map(|handler| handler.send((self.id, remote)).is_ok())
            .unwrap_or(false);
        if delivered {
            Ok(local)
        } else {
            Err(ConnectError::OpenStream {
                peer,
                protocol,
                reason: "protocol not supported".to_string(),
            })
        }
    }
}

#[async_trait]
impl RendezvousDirectory for MemoryPeer {
    async fn advertise(&self, topic: &TopicId) -> Result<(), DirectoryError> {
        let mut registry = self.net.registry.lock();
        let providers = registry.providers.entry(topic.clone()).or_default();
        if !providers.contains(&self.id) {
            providers.push(self.id);
        }
        Ok(())
    }

    async fn find_providers(
        &self,
        topic: &TopicId,
    ) -> Result<BoxStream<'static, PeerId>, DirectoryError> {
        let providers = self
            .net
            .registry
            .lock()
            .providers
            .get(topic)
            .cloned()
            .unwrap_or_default();
        Ok(stream::iter(providers).boxed())
    }
}

/// Answers handshakes opened to `matchmaker`'s peer.
pub fn spawn_handshake_acceptor(
    net: &MemoryNetwork,
    matchmaker: &Matchmaker<MemoryPeer>,
) -> JoinHandle<()> {
    let incoming = net.incoming(matchmaker.local_peer_id(), MATCH_PROTOCOL);
    serve_handshakes(incoming, matchmaker.clone())
}

mod scenarios {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::app::{serve_chat_streams, start_sessions_when_paired};
    use crate::chat::console::format_event;
    use crate::chat::{CHAT_PROTOCOL, ChatSessions};
    use crate::common::NetworkEvent;
    use crate::pairing::{
        DiscoveryConfig, DiscoveryOutcome, MatchmakerConfig, PairingError, PairingState,
        run_discovery,
    };

    /// A fully wired process on the in-memory network.
    struct Node {
        peer: MemoryPeer,
        matchmaker: Matchmaker<MemoryPeer>,
        input: mpsc::Sender<String>,
        events: mpsc::Receiver<NetworkEvent>,
    }

    impl Node {
        fn spawn(net: &MemoryNetwork, name: &str) -> Self {
            let peer = net.add_peer();
            let (events_tx, events) = mpsc::channel(64);
            let (input, input_rx) = mpsc::channel(16);
            let sessions = ChatSessions::new(peer.clone(), name, input_rx, events_tx.clone());
            let (matchmaker, paired) = Matchmaker::new(peer.clone(), MatchmakerConfig::default());

            spawn_handshake_acceptor(net, &matchmaker);
            serve_chat_streams(net.incoming(peer.local_peer_id(), CHAT_PROTOCOL), sessions.clone());
            start_sessions_when_paired(paired, sessions, events_tx);

            Self {
                peer,
                matchmaker,
                input,
                events,
            }
        }

        fn id(&self) -> PeerId {
            self.peer.local_peer_id()
        }

        async fn next_message(&mut self) -> String {
            loop {
                match self.events.recv().await {
                    Some(event @ NetworkEvent::MessageReceived { .. }) => {
                        return format_event(&event).unwrap_or_default();
                    }
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        }
    }

    fn discovery_config() -> DiscoveryConfig {
        DiscoveryConfig {
            poll_interval: Duration::from_millis(200),
            poll_jitter: Duration::from_millis(100),
            search_window: Duration::from_secs(20),
            retry_backoff: Duration::from_secs(1),
            lookup_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn discovered_peers_pair_and_chat() {
        let net = MemoryNetwork::new();
        let alice = Node::spawn(&net, "alice");
        let mut bob = Node::spawn(&net, "bob");
        let topic = TopicId::from_token("t1");
        alice.peer.advertise(&topic).await.unwrap();

        let outcome = run_discovery(bob.peer.clone(), bob.matchmaker.clone(), topic, discovery_config())
            .await
            .unwrap();
        assert_eq!(outcome, DiscoveryOutcome::Paired(alice.id()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(alice.matchmaker.state(), PairingState::Paired);
        assert_eq!(alice.matchmaker.matched_to(), Some(bob.id()));

        alice.input.send("hello".to_string()).await.unwrap();
        let shown = bob.next_message().await;
        assert!(shown.ends_with("alice: hello"), "got {shown:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn third_peer_is_rejected_by_paired_peer() {
        let net = MemoryNetwork::new();
        let alice = Node::spawn(&net, "alice");
        let bob = Node::spawn(&net, "bob");
        let carol = Node::spawn(&net, "carol");

        bob.matchmaker.try_pair(alice.id()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(alice.matchmaker.state(), PairingState::Paired);

        let err = carol.matchmaker.try_pair(alice.id()).await.unwrap_err();
        assert!(matches!(err, PairingError::Rejected));
        assert_eq!(carol.matchmaker.state(), PairingState::Idle);
        assert_eq!(alice.matchmaker.matched_to(), Some(bob.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_candidate_frees_initiator_after_deadline() {
        let net = MemoryNetwork::new();
        let alice = Node::spawn(&net, "alice");
        let carol = Node::spawn(&net, "carol");
        let silent = net.add_peer();
        let _unanswered = net.accept(&silent, MATCH_PROTOCOL);

        let started = tokio::time::Instant::now();
        assert!(alice.matchmaker.try_pair(silent.local_peer_id()).await.is_err());
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(alice.matchmaker.state(), PairingState::Idle);

        alice.matchmaker.try_pair(carol.id()).await.unwrap();
        assert_eq!(alice.matchmaker.state(), PairingState::Paired);
    }

    #[tokio::test(start_paused = true)]
    async fn both_sides_searching_end_up_paired_with_each_other() {
        let net = MemoryNetwork::new();
        let alice = Node::spawn(&net, "alice");
        let bob = Node::spawn(&net, "bob");
        let topic = TopicId::from_token("shared");

        let (a, b) = tokio::join!(
            run_discovery(alice.peer.clone(), alice.matchmaker.clone(), topic.clone(), discovery_config()),
            run_discovery(bob.peer.clone(), bob.matchmaker.clone(), topic, discovery_config()),
        );

        assert_eq!(a.unwrap(), DiscoveryOutcome::Paired(bob.id()));
        assert_eq!(b.unwrap(), DiscoveryOutcome::Paired(alice.id()));
    }
}
