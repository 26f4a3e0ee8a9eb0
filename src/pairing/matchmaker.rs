use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::network::{ConnectError, PeerConnector};

use super::handshake::{
    HandshakeError, HandshakeToken, MATCH_PROTOCOL, expect_token, read_line, write_token,
};
use super::state::{AttemptId, Pairing, PairingEvent, PairingState, TransitionError};

#[derive(Debug, Error)]
pub enum PairingError {
    /// Another handshake owns the state, or we are already paired.
    #[error("busy with another pairing")]
    Busy,
    #[error("peer is busy and rejected the request")]
    Rejected,
    #[error("handshake failed: {0}")]
    Handshake(HandshakeError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl From<HandshakeError> for PairingError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Rejected => PairingError::Rejected,
            other => PairingError::Handshake(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MatchmakerConfig {
    /// Deadline for every handshake read.
    pub handshake_timeout: Duration,
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

struct Shared {
    pairing: Mutex<Pairing>,
    state_tx: watch::Sender<PairingState>,
    paired_tx: mpsc::UnboundedSender<PeerId>,
}

/// Negotiates a single pairing with one remote peer.
///
/// The lock only guards the decision ("am I idle?") and the transitions; all
/// handshake I/O happens outside of it. The three-round exchange makes both
/// sides commit before either treats the pairing as final.
pub struct Matchmaker<C> {
    connector: C,
    config: MatchmakerConfig,
    shared: Arc<Shared>,
}

impl<C: Clone> Clone for Matchmaker<C> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            config: self.config,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: PeerConnector> Matchmaker<C> {
    /// The receiver yields the partner once, when the state reaches `Paired`.
    pub fn new(connector: C, config: MatchmakerConfig) -> (Self, mpsc::UnboundedReceiver<PeerId>) {
        let (state_tx, _) = watch::channel(PairingState::Idle);
        let (paired_tx, paired_rx) = mpsc::unbounded_channel();
        let matchmaker = Self {
            connector,
            config,
            shared: Arc::new(Shared {
                pairing: Mutex::new(Pairing::new()),
                state_tx,
                paired_tx,
            }),
        };
        (matchmaker, paired_rx)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.connector.local_peer_id()
    }

    pub fn state(&self) -> PairingState {
        self.shared.pairing.lock().state()
    }

    pub fn matched_to(&self) -> Option<PeerId> {
        self.shared.pairing.lock().matched_to()
    }

    pub fn subscribe(&self) -> watch::Receiver<PairingState> {
        self.shared.state_tx.subscribe()
    }

    /// Outbound attempt. Returns [`PairingError::Busy`] without touching the
    /// network when another attempt owns the state. The candidate is dialed
    /// first so addresses learned from the provider lookup are used.
    pub async fn try_pair(&self, candidate: PeerId) -> Result<PeerId, PairingError> {
        if self.state() != PairingState::Idle {
            return Err(PairingError::Busy);
        }

        self.connector.connect(candidate).await?;
        let mut stream = self.connector.open_stream(candidate, MATCH_PROTOCOL).await?;

        let attempt = match self.begin(PairingEvent::SendMatch, candidate) {
            Some(attempt) => attempt,
            None => {
                let _ = stream.shutdown().await;
                return Err(PairingError::Busy);
            }
        };

        log::debug!("Sending MATCH to {candidate}");
        let result = self.run_initiator(attempt, &mut stream).await;
        let _ = stream.shutdown().await;
        self.conclude(attempt, candidate, result)
    }

    async fn run_initiator<S>(&self, attempt: AttemptId, stream: &mut S) -> Result<(), PairingError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let deadline = self.config.handshake_timeout;
        write_token(stream, HandshakeToken::Match).await?;
        expect_token(stream, HandshakeToken::Accept, deadline).await?;
        self.advance(attempt, PairingEvent::ReceiveAccept)?;
        write_token(stream, HandshakeToken::Accepted).await?;
        expect_token(stream, HandshakeToken::Accepted, deadline).await?;
        Ok(())
    }

    /// Responder side, for a handshake stream opened by `peer`.
    pub async fn handle_inbound<S>(&self, peer: PeerId, mut stream: S) -> Result<PeerId, PairingError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.run_responder(peer, &mut stream).await;
        let _ = stream.shutdown().await;
        result
    }

    async fn run_responder<S>(&self, peer: PeerId, stream: &mut S) -> Result<PeerId, PairingError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let deadline = self.config.handshake_timeout;
        let first = read_line(stream, deadline).await?;
        log::debug!("Received {first:?} from {peer}");
        if HandshakeToken::parse(&first) != Some(HandshakeToken::Match) {
            return Err(HandshakeError::Unexpected {
                expected: HandshakeToken::Match,
                got: first,
            }
            .into());
        }

        let Some(attempt) = self.begin(PairingEvent::ReceiveMatch, peer) else {
            log::info!("Busy, rejecting MATCH from {peer}");
            write_token(stream, HandshakeToken::Reject).await?;
            return Err(PairingError::Busy);
        };

        let result = async {
            write_token(stream, HandshakeToken::Accept).await?;
            expect_token(stream, HandshakeToken::Accepted, deadline).await?;
            write_token(stream, HandshakeToken::Accepted).await?;
            Ok::<(), PairingError>(())
        }
        .await;
        self.conclude(attempt, peer, result)
    }

    fn begin(&self, event: PairingEvent, peer: PeerId) -> Option<AttemptId> {
        let mut pairing = self.shared.pairing.lock();
        let attempt = pairing.begin(event, peer).ok()?;
        self.shared.state_tx.send_replace(pairing.state());
        Some(attempt)
    }

    fn advance(&self, attempt: AttemptId, event: PairingEvent) -> Result<PairingState, TransitionError> {
        let mut pairing = self.shared.pairing.lock();
        let state = pairing.advance(attempt, event)?;
        self.shared.state_tx.send_replace(state);
        Ok(state)
    }

    /// Moves to `Paired` on success, back to `Idle` on failure.
    fn conclude(
        &self,
        attempt: AttemptId,
        peer: PeerId,
        result: Result<(), PairingError>,
    ) -> Result<PeerId, PairingError> {
        match result {
            Ok(()) => {
                self.advance(attempt, PairingEvent::Confirm)?;
                log::info!("Handshake complete, matched with {peer}");
                let _ = self.shared.paired_tx.send(peer);
                Ok(peer)
            }
            Err(err) => {
                log::info!("Pairing with {peer} failed: {err}");
                if let Err(reset) = self.advance(attempt, PairingEvent::Fail) {
                    log::warn!("Could not reset pairing state: {reset}");
                }
                Err(err)
            }
        }
    }
}
