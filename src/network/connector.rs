use async_trait::async_trait;
use libp2p::{PeerId, StreamProtocol};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot connect to {peer}: {reason}")]
    Dial { peer: PeerId, reason: String },
    #[error("cannot open {protocol} stream to {peer}: {reason}")]
    OpenStream {
        peer: PeerId,
        protocol: StreamProtocol,
        reason: String,
    },
    #[error("network task has shut down")]
    HostClosed,
}

/// Connect-by-id and open-stream, the part of the peer-networking layer the
/// matchmaker and chat sessions depend on.
#[async_trait]
pub trait PeerConnector: Clone + Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn local_peer_id(&self) -> PeerId;

    async fn connect(&self, peer: PeerId) -> Result<(), ConnectError>;

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<Self::Stream, ConnectError>;
}
