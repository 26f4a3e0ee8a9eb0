use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use libp2p::kad;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{Config as SwarmConfig, DialError, SwarmEvent};
use libp2p::{Multiaddr, PeerId, StreamProtocol, Swarm, identify, relay};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};

use crate::common::NetworkCommand;
use crate::config::AppConfig;

use super::behavior::{PairingBehavior, PairingBehaviorEvent, build_behavior};
use super::connector::{ConnectError, PeerConnector};
use super::identity::load_or_generate_key;
use super::nat_traversal::NatTraversal;
use super::rendezvous::{DirectoryError, RendezvousDirectory, TopicId};
use super::transport::build_transport;

/// Public IPFS DHT bootstrap peers.
const DEFAULT_BOOTSTRAP_NODES: [&str; 5] = [
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

const COMMAND_CHANNEL_SIZE: usize = 64;
const PROVIDER_CHANNEL_SIZE: usize = 64;
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Owns the swarm. Everything else reaches it through a [`HostHandle`].
pub struct PeerHost {
    swarm: Swarm<PairingBehavior>,
    command_receiver: mpsc::Receiver<NetworkCommand>,
    local_peer_id: PeerId,
    nat: NatTraversal,
    /// Addresses learned for peers outside the routing table (providers, identify)
    address_book: HashMap<PeerId, HashSet<Multiaddr>>,
    pending_providing: HashMap<kad::QueryId, oneshot::Sender<Result<(), String>>>,
    pending_providers: HashMap<kad::QueryId, mpsc::Sender<PeerId>>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), String>>>>,
}

impl PeerHost {
    /// Creates the swarm, starts listening and kicks off the DHT bootstrap.
    ///
    /// Failing here means the network layer is unusable; the caller is
    /// expected to give up.
    pub fn start(config: &AppConfig) -> Result<(Self, HostHandle), Box<dyn Error>> {
        let local_key = load_or_generate_key(&config.key_path)?;
        let local_peer_id = PeerId::from(local_key.public());
        log::info!("Local PeerID: {local_peer_id}");

        let (transport, relay_behaviour) = build_transport(&local_key, local_peer_id)?;
        let behavior = build_behavior(&local_key, local_peer_id, relay_behaviour)?;
        let control = behavior.stream.new_control();

        let mut swarm = Swarm::new(
            transport,
            behavior,
            local_peer_id,
            SwarmConfig::with_tokio_executor().with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT),
        );

        swarm.listen_on(format!("/ip4/0.0.0.0/tcp/{}", config.listen_port).parse()?)?;

        let mut entries: Vec<String> = config.bootstrap_nodes.clone();
        if !config.disable_default_bootstrap {
            entries.extend(DEFAULT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()));
        }
        let bootstrap_peers = parse_bootstrap_peers(&entries);
        if bootstrap_peers.is_empty() {
            return Err("no usable bootstrap peers configured".into());
        }

        let mut dialed = 0usize;
        for (peer_id, addr) in bootstrap_peers {
            log::info!("Adding bootstrap peer {peer_id} at {addr}");
            swarm.behaviour_mut().kad.add_address(&peer_id, addr.clone());
            match swarm.dial(addr.with(Protocol::P2p(peer_id))) {
                Ok(()) => dialed += 1,
                Err(err) => log::warn!("Failed to dial bootstrap peer {peer_id}: {err}"),
            }
        }
        if dialed == 0 {
            return Err("could not dial any bootstrap peer".into());
        }

        swarm
            .behaviour_mut()
            .kad
            .bootstrap()
            .map_err(|err| format!("failed to bootstrap DHT: {err:?}"))?;
        log::info!("Kademlia DHT bootstrap started ({dialed} peers dialed)");

        let (command_sender, command_receiver) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let handle = HostHandle {
            local_peer_id,
            commands: command_sender,
            control,
            open_stream_timeout: config.open_stream_timeout(),
        };
        let host = Self {
            swarm,
            command_receiver,
            local_peer_id,
            nat: NatTraversal::new(config.max_relays),
            address_book: HashMap::new(),
            pending_providing: HashMap::new(),
            pending_providers: HashMap::new(),
            pending_dials: HashMap::new(),
        };
        Ok((host, handle))
    }

    /// Runs until every [`HostHandle`] has been dropped.
    pub async fn run(mut self) {
        log::info!("Network event loop started");
        loop {
            tokio::select! {
                command = self.command_receiver.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
            }
        }
        log::info!("Network event loop stopped");
    }

    fn handle_command(&mut self, command: NetworkCommand) {
        match command {
            NetworkCommand::StartProviding { key, reply } => {
                match self.swarm.behaviour_mut().kad.start_providing(key) {
                    Ok(query_id) => {
                        self.pending_providing.insert(query_id, reply);
                    }
                    Err(err) => {
                        let _ = reply.send(Err(format!("{err:?}")));
                    }
                }
            }
            NetworkCommand::GetProviders { key, providers } => {
                let query_id = self.swarm.behaviour_mut().kad.get_providers(key);
                self.pending_providers.insert(query_id, providers);
            }
            NetworkCommand::Dial { peer, reply } => self.dial(peer, reply),
            NetworkCommand::ListenAddrs { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
        }
    }

    fn dial(&mut self, peer: PeerId, reply: oneshot::Sender<Result<(), String>>) {
        if self.swarm.is_connected(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }

        let known: Vec<Multiaddr> = self
            .address_book
            .get(&peer)
            .map(|addrs| addrs.iter().cloned().collect())
            .unwrap_or_default();
        let opts = DialOpts::peer_id(peer)
            .addresses(known)
            .extend_addresses_through_behaviour()
            .build();

        match self.swarm.dial(opts) {
            Ok(()) => self.pending_dials.entry(peer).or_default().push(reply),
            // A dial to this peer is already in flight; wait for it.
            Err(DialError::DialPeerConditionFalse(_)) => {
                self.pending_dials.entry(peer).or_default().push(reply)
            }
            Err(err) => {
                let _ = reply.send(Err(err.to_string()));
            }
        }
    }

    fn resolve_dials(&mut self, peer: &PeerId, result: Result<(), String>) {
        if let Some(waiters) = self.pending_dials.remove(peer) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<PairingBehaviorEvent>) {
        match event {
            SwarmEvent::Behaviour(PairingBehaviorEvent::Kad(event)) => self.handle_kad_event(event),
            SwarmEvent::Behaviour(PairingBehaviorEvent::Identify(event)) => {
                self.handle_identify_event(event)
            }
            SwarmEvent::Behaviour(PairingBehaviorEvent::Autonat(event)) => {
                if let libp2p::autonat::Event::StatusChanged { old, new } = event {
                    log::info!("AutoNAT status changed: {old:?} -> {new:?}");
                    let circuits = self.nat.on_status_changed(&new);
                    self.listen_on_circuits(circuits);
                } else {
                    log::debug!("AutoNAT event: {event:?}");
                }
            }
            SwarmEvent::Behaviour(PairingBehaviorEvent::Relay(event)) => {
                if let relay::client::Event::ReservationReqAccepted { relay_peer_id, .. } = event {
                    log::info!("Relay reservation accepted by {relay_peer_id}");
                    self.nat.on_reservation_accepted(relay_peer_id);
                } else {
                    log::debug!("Relay client event: {event:?}");
                }
            }
            SwarmEvent::Behaviour(PairingBehaviorEvent::Dcutr(event)) => {
                match &event.result {
                    Ok(_) => log::info!("Hole punch to {} succeeded", event.remote_peer_id),
                    Err(err) => log::debug!("Hole punch to {} failed: {err}", event.remote_peer_id),
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                let full_addr = address.with(Protocol::P2p(self.local_peer_id));
                log::info!("Listening on {full_addr}");
            }
            SwarmEvent::NewExternalAddrOfPeer { peer_id, address } => {
                self.address_book.entry(peer_id).or_default().insert(address);
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                log::debug!("Connected to {peer_id}");
                self.resolve_dials(&peer_id, Ok(()));
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                log::debug!("Outgoing connection to {peer_id} failed: {error}");
                self.resolve_dials(&peer_id, Err(error.to_string()));
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                log::debug!("Connection to {peer_id} closed");
                if !self.swarm.is_connected(&peer_id) {
                    self.nat.on_relay_lost(&peer_id);
                }
            }
            _ => {}
        }
    }

    fn handle_identify_event(&mut self, event: identify::Event) {
        if let identify::Event::Received { peer_id, info, .. } = event {
            log::debug!(
                "Identify info from {peer_id}: protocols={:?}",
                info.protocols
            );

            for addr in &info.listen_addrs {
                self.swarm
                    .behaviour_mut()
                    .kad
                    .add_address(&peer_id, addr.clone());
            }
            let circuits = self
                .nat
                .on_identify(peer_id, &info.protocols, &info.listen_addrs);
            self.listen_on_circuits(circuits);
        }
    }

    fn listen_on_circuits(&mut self, circuits: Vec<(PeerId, Multiaddr)>) {
        for (relay, addr) in circuits {
            match self.swarm.listen_on(addr.clone()) {
                Ok(_) => log::info!("Listening via relay circuit {addr}"),
                Err(err) => {
                    log::warn!("Failed to listen on relay circuit {addr}: {err}");
                    self.nat.on_circuit_failed(&relay);
                }
            }
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => match result {
                kad::QueryResult::Bootstrap(res) => match res {
                    Ok(kad::BootstrapOk { num_remaining, .. }) => {
                        log::debug!("Kademlia bootstrap ok, remaining peers: {num_remaining}");
                    }
                    Err(err) => log::warn!("Kademlia bootstrap error: {err:?}"),
                },
                kad::QueryResult::StartProviding(res) => {
                    if let Some(reply) = self.pending_providing.remove(&id) {
                        let _ = reply.send(res.map(|_| ()).map_err(|err| format!("{err:?}")));
                    }
                }
                kad::QueryResult::GetProviders(res) => {
                    self.handle_providers(id, res);
                    if step.last {
                        // Dropping the sender ends the caller's stream.
                        self.pending_providers.remove(&id);
                    }
                }
                _ => {}
            },
            kad::Event::RoutingUpdated {
                peer, addresses, ..
            } => {
                log::debug!("Kademlia routing table updated for {peer} (addresses: {addresses:?})");
            }
            _ => {}
        }
    }

    fn handle_providers(
        &mut self,
        id: kad::QueryId,
        result: Result<kad::GetProvidersOk, kad::GetProvidersError>,
    ) {
        let providers = match result {
            Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => providers,
            Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => return,
            Err(err) => {
                log::debug!("Provider lookup ended with error: {err:?}");
                return;
            }
        };
        let Some(sender) = self.pending_providers.get(&id) else {
            return;
        };

        let mut receiver_gone = false;
        for provider in providers {
            match sender.try_send(provider) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::debug!("Provider channel full, dropping {provider}");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    receiver_gone = true;
                    break;
                }
            }
        }
        if receiver_gone {
            self.pending_providers.remove(&id);
            if let Some(mut query) = self.swarm.behaviour_mut().kad.query_mut(&id) {
                query.finish();
            }
        }
    }
}

/// Clonable access to the network task.
#[derive(Clone)]
pub struct HostHandle {
    local_peer_id: PeerId,
    commands: mpsc::Sender<NetworkCommand>,
    control: libp2p_stream::Control,
    open_stream_timeout: Duration,
}

impl HostHandle {
    /// Registers `protocol` and returns the stream of inbound `(peer, stream)`
    /// pairs for it.
    pub fn accept(
        &self,
        protocol: StreamProtocol,
    ) -> Result<BoxStream<'static, (PeerId, Compat<libp2p::Stream>)>, Box<dyn Error>> {
        let incoming = self
            .control
            .clone()
            .accept(protocol.clone())
            .map_err(|err| format!("cannot accept {protocol}: {err}"))?;
        Ok(incoming
            .map(|(peer, stream)| (peer, stream.compat()))
            .boxed())
    }

    pub async fn listen_addrs(&self) -> Vec<Multiaddr> {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(NetworkCommand::ListenAddrs { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }
}

#[async_trait]
impl PeerConnector for HostHandle {
    type Stream = Compat<libp2p::Stream>;

    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn connect(&self, peer: PeerId) -> Result<(), ConnectError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(NetworkCommand::Dial { peer, reply })
            .await
            .map_err(|_| ConnectError::HostClosed)?;
        response
            .await
            .map_err(|_| ConnectError::HostClosed)?
            .map_err(|reason| ConnectError::Dial { peer, reason })
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Self::Stream, ConnectError> {
        let mut control = self.control.clone();
        let open = control.open_stream(peer, protocol.clone());
        match tokio::time::timeout(self.open_stream_timeout, open).await {
            Ok(Ok(stream)) => Ok(stream.compat()),
            Ok(Err(err)) => Err(ConnectError::OpenStream {
                peer,
                protocol,
                reason: err.to_string(),
            }),
            Err(_) => Err(ConnectError::OpenStream {
                peer,
                protocol,
                reason: "timed out".to_string(),
            }),
        }
    }
}

#[async_trait]
impl RendezvousDirectory for HostHandle {
    async fn advertise(&self, topic: &TopicId) -> Result<(), DirectoryError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(NetworkCommand::StartProviding {
                key: topic.record_key(),
                reply,
            })
            .await
            .map_err(|_| DirectoryError::HostClosed)?;
        response
            .await
            .map_err(|_| DirectoryError::HostClosed)?
            .map_err(DirectoryError::Advertise)
    }

    async fn find_providers(
        &self,
        topic: &TopicId,
    ) -> Result<BoxStream<'static, PeerId>, DirectoryError> {
        let (providers, mut receiver) = mpsc::channel(PROVIDER_CHANNEL_SIZE);
        self.commands
            .send(NetworkCommand::GetProviders {
                key: topic.record_key(),
                providers,
            })
            .await
            .map_err(|_| DirectoryError::HostClosed)?;
        Ok(stream::poll_fn(move |cx| receiver.poll_recv(cx)).boxed())
    }
}

/// Parses `/.../p2p/<PeerId>` entries, skipping malformed ones.
pub fn parse_bootstrap_peers(entries: &[String]) -> Vec<(PeerId, Multiaddr)> {
    entries
        .iter()
        .filter_map(|entry| {
            let mut addr: Multiaddr = match entry.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    log::warn!("Invalid multiaddr `{entry}`: {err}");
                    return None;
                }
            };

            let peer_id = match addr.pop() {
                Some(Protocol::P2p(peer)) => peer,
                _ => {
                    log::warn!("Multiaddr `{entry}` missing /p2p/PeerId suffix");
                    return None;
                }
            };

            Some((peer_id, addr))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_entries_need_peer_id_suffix() {
        let peer = PeerId::random();
        let entries = vec![
            format!("/ip4/10.0.0.1/tcp/4001/p2p/{peer}"),
            "/ip4/10.0.0.2/tcp/4001".to_string(),
            "not a multiaddr".to_string(),
        ];

        let parsed = parse_bootstrap_peers(&entries);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, peer);
        assert_eq!(parsed[0].1, "/ip4/10.0.0.1/tcp/4001".parse::<Multiaddr>().unwrap());
    }

    #[test]
    fn default_bootstrap_list_parses() {
        let entries: Vec<String> = DEFAULT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect();
        assert_eq!(parse_bootstrap_peers(&entries).len(), DEFAULT_BOOTSTRAP_NODES.len());
    }
}
