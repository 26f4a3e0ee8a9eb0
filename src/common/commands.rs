use libp2p::kad::RecordKey;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot};

/// Requests sent to the task that owns the swarm.
#[derive(Debug)]
pub enum NetworkCommand {
    /// Announce the local peer as a provider of `key` on the DHT.
    StartProviding {
        key: RecordKey,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Look up providers of `key`. Every provider found is pushed into
    /// `providers`; the sender is dropped when the query finishes.
    GetProviders {
        key: RecordKey,
        providers: mpsc::Sender<PeerId>,
    },
    /// Make sure a connection to `peer` exists, dialing it if needed.
    Dial {
        peer: PeerId,
        reply: oneshot::Sender<Result<(), String>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}
