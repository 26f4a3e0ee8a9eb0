use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use libp2p::PeerId;
use libp2p::kad::RecordKey;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Multihash code for SHA2-256 followed by the digest length.
const SHA2_256_MULTIHASH_PREFIX: [u8; 2] = [0x12, 0x20];

/// Content-addressed DHT key for a rendezvous token.
///
/// The key is the SHA2-256 multihash of the token, the same bytes a CIDv1
/// (raw codec) provider record is stored under, so peers on other libp2p
/// implementations advertising the same token land on the same key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TopicId {
    multihash: Vec<u8>,
}

impl TopicId {
    pub fn from_token(token: &str) -> Self {
        let digest = Sha256::digest(token.as_bytes());
        let mut multihash = Vec::with_capacity(SHA2_256_MULTIHASH_PREFIX.len() + digest.len());
        multihash.extend_from_slice(&SHA2_256_MULTIHASH_PREFIX);
        multihash.extend_from_slice(&digest);
        Self { multihash }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.multihash
    }

    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(&self.multihash)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.multihash))
    }
}

impl fmt::Debug for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicId({self})")
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to advertise topic: {0}")]
    Advertise(String),
    #[error("network task has shut down")]
    HostClosed,
}

/// Provider directory for rendezvous topics.
#[async_trait]
pub trait RendezvousDirectory: Clone + Send + Sync + 'static {
    async fn advertise(&self, topic: &TopicId) -> Result<(), DirectoryError>;

    /// Lazily yields providers of `topic` as the lookup finds them. The stream
    /// ends when the lookup is exhausted; calling again starts a new lookup.
    async fn find_providers(
        &self,
        topic: &TopicId,
    ) -> Result<BoxStream<'static, PeerId>, DirectoryError>;
}
