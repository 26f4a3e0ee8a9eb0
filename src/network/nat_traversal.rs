use std::collections::{HashMap, HashSet};

use libp2p::autonat::NatStatus;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId, StreamProtocol};

const RELAY_HOP_PROTOCOL: StreamProtocol = StreamProtocol::new("/libp2p/circuit/relay/0.2.0/hop");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Unknown,
    Public,
    Private,
}

/// Decides when to listen through a relay circuit.
///
/// Relay-capable peers are learned from identify; once AutoNAT says we are
/// behind a NAT, up to `max_relays` of them are used. DCUtR upgrades the
/// resulting relayed connections on its own.
pub struct NatTraversal {
    reachability: Reachability,
    /// Relay-capable peers and one address to reach each of them
    relay_candidates: HashMap<PeerId, Multiaddr>,
    /// Relays we asked for a reservation (or got one from)
    active_relays: HashSet<PeerId>,
    max_relays: usize,
}

impl NatTraversal {
    pub fn new(max_relays: usize) -> Self {
        Self {
            reachability: Reachability::Unknown,
            relay_candidates: HashMap::new(),
            active_relays: HashSet::new(),
            max_relays,
        }
    }

    pub fn reachability(&self) -> Reachability {
        self.reachability
    }

    /// Returns the relays and circuit addresses to start listening on.
    pub fn on_identify(
        &mut self,
        peer_id: PeerId,
        protocols: &[StreamProtocol],
        listen_addrs: &[Multiaddr],
    ) -> Vec<(PeerId, Multiaddr)> {
        if !protocols.contains(&RELAY_HOP_PROTOCOL) {
            return Vec::new();
        }
        let Some(addr) = listen_addrs.iter().find(|addr| is_dialable(addr)) else {
            return Vec::new();
        };
        self.relay_candidates.insert(peer_id, addr.clone());
        self.select_relays()
    }

    /// Returns the relays and circuit addresses to start listening on.
    pub fn on_status_changed(&mut self, status: &NatStatus) -> Vec<(PeerId, Multiaddr)> {
        self.reachability = match status {
            NatStatus::Public(_) => Reachability::Public,
            NatStatus::Private => Reachability::Private,
            NatStatus::Unknown => Reachability::Unknown,
        };
        match self.reachability {
            Reachability::Public => log::info!("Node is publicly reachable"),
            Reachability::Private => log::info!("Node is behind NAT, will listen via relays"),
            Reachability::Unknown => log::debug!("NAT status unknown"),
        }
        self.select_relays()
    }

    pub fn on_reservation_accepted(&mut self, relay: PeerId) {
        self.active_relays.insert(relay);
    }

    pub fn on_relay_lost(&mut self, relay: &PeerId) {
        self.active_relays.remove(relay);
    }

    /// Listening through `relay` could not start. Frees its slot and stops
    /// offering it.
    pub fn on_circuit_failed(&mut self, relay: &PeerId) {
        self.active_relays.remove(relay);
        self.relay_candidates.remove(relay);
    }

    fn select_relays(&mut self) -> Vec<(PeerId, Multiaddr)> {
        if self.reachability != Reachability::Private {
            return Vec::new();
        }
        let mut circuits = Vec::new();
        let mut candidates: Vec<_> = self
            .relay_candidates
            .iter()
            .filter(|(peer, _)| !self.active_relays.contains(peer))
            .map(|(peer, addr)| (*peer, addr.clone()))
            .collect();
        candidates.sort_by_key(|(peer, _)| *peer);

        for (peer, addr) in candidates {
            if self.active_relays.len() >= self.max_relays {
                break;
            }
            self.active_relays.insert(peer);
            circuits.push((peer, addr.with(Protocol::P2p(peer)).with(Protocol::P2pCircuit)));
        }
        circuits
    }
}

fn is_dialable(addr: &Multiaddr) -> bool {
    !addr.iter().any(|p| match p {
        Protocol::Ip4(ip) => ip.is_loopback() || ip.is_unspecified(),
        Protocol::Ip6(ip) => ip.is_loopback() || ip.is_unspecified(),
        Protocol::P2pCircuit => true,
        _ => false,
    })
}
