use std::error::Error;

use libp2p::autonat;
use libp2p::dcutr;
use libp2p::identify;
use libp2p::kad::{self, Mode as KadMode, store::MemoryStore};
use libp2p::ping;
use libp2p::relay::client;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{PeerId, identity};

const IDENTIFY_PROTOCOL_VERSION: &str = "p2pchat/1.0.0";

#[derive(NetworkBehaviour)]
pub struct PairingBehavior {
    pub kad: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
    pub relay: client::Behaviour,
    pub autonat: autonat::Behaviour,
    pub dcutr: dcutr::Behaviour,
    pub ping: ping::Behaviour,
    /// Raw streams for the handshake and chat protocols.
    pub stream: libp2p_stream::Behaviour,
}

pub fn build_behavior(
    local_key: &identity::Keypair,
    local_peer_id: PeerId,
    relay_behaviour: client::Behaviour,
) -> Result<PairingBehavior, Box<dyn Error>> {
    let store = MemoryStore::new(local_peer_id);
    let mut kad = kad::Behaviour::new(local_peer_id, store);
    kad.set_mode(Some(KadMode::Server));

    let identify_config =
        identify::Config::new(IDENTIFY_PROTOCOL_VERSION.into(), local_key.public());
    let identify = identify::Behaviour::new(identify_config);

    let autonat = autonat::Behaviour::new(local_peer_id, autonat::Config::default());
    let dcutr = dcutr::Behaviour::new(local_peer_id);
    let ping = ping::Behaviour::new(ping::Config::default());

    Ok(PairingBehavior {
        kad,
        identify,
        relay: relay_behaviour,
        autonat,
        dcutr,
        ping,
        stream: libp2p_stream::Behaviour::new(),
    })
}
