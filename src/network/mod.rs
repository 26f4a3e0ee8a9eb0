pub mod behavior;
pub mod connector;
pub mod host;
pub mod identity;
pub mod nat_traversal;
pub mod rendezvous;
pub mod transport;

pub use connector::{ConnectError, PeerConnector};
pub use host::{HostHandle, PeerHost};
pub use rendezvous::{DirectoryError, RendezvousDirectory, TopicId};
