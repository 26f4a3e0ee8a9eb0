use libp2p::PeerId;
use thiserror::Error;

/// Where this process is in the pairing handshake. There is one per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    /// We sent `MATCH` and wait for `ACCEPT`.
    Requesting,
    /// We got `MATCH`, answered `ACCEPT` and wait for `ACCEPTED`.
    RequestReceived,
    /// Initiator got `ACCEPT`, sent `ACCEPTED`, waits for the final `ACCEPTED`.
    Accepted,
    /// Terminal for this run.
    Paired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingEvent {
    SendMatch,
    ReceiveMatch,
    ReceiveAccept,
    Confirm,
    Fail,
}

impl PairingState {
    /// The whole transition table. `None` means the event is refused.
    pub fn next(self, event: PairingEvent) -> Option<PairingState> {
        use PairingEvent::*;
        use PairingState::*;

        match (self, event) {
            (Idle, SendMatch) => Some(Requesting),
            (Idle, ReceiveMatch) => Some(RequestReceived),
            (Requesting, ReceiveAccept) => Some(Accepted),
            (Accepted | RequestReceived, Confirm) => Some(Paired),
            (Requesting | RequestReceived | Accepted, Fail) => Some(Idle),
            _ => None,
        }
    }
}

/// Identifies the handshake that currently owns the pairing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{event:?} is not allowed in state {state:?}")]
    Invalid {
        state: PairingState,
        event: PairingEvent,
    },
    #[error("attempt no longer owns the pairing state")]
    NotOwner,
}

/// The pairing state plus the peer it refers to. Not synchronized; the
/// matchmaker keeps it behind a lock.
#[derive(Debug)]
pub struct Pairing {
    state: PairingState,
    matched_to: Option<PeerId>,
    owner: Option<AttemptId>,
    next_attempt: u64,
}

impl Default for Pairing {
    fn default() -> Self {
        Self::new()
    }
}

impl Pairing {
    pub fn new() -> Self {
        Self {
            state: PairingState::Idle,
            matched_to: None,
            owner: None,
            next_attempt: 0,
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn matched_to(&self) -> Option<PeerId> {
        self.matched_to
    }

    /// Claims the state for a new handshake with `peer`. Only succeeds from
    /// `Idle`, with `SendMatch` or `ReceiveMatch`.
    pub fn begin(&mut self, event: PairingEvent, peer: PeerId) -> Result<AttemptId, TransitionError> {
        let invalid = TransitionError::Invalid {
            state: self.state,
            event,
        };
        if !matches!(event, PairingEvent::SendMatch | PairingEvent::ReceiveMatch) {
            return Err(invalid);
        }
        let next = self.state.next(event).ok_or(invalid)?;

        let attempt = AttemptId(self.next_attempt);
        self.next_attempt += 1;
        self.state = next;
        self.matched_to = Some(peer);
        self.owner = Some(attempt);
        Ok(attempt)
    }

    /// Applies `event` on behalf of `attempt`. `Fail` releases the state back
    /// to `Idle` and forgets the peer.
    pub fn advance(
        &mut self,
        attempt: AttemptId,
        event: PairingEvent,
    ) -> Result<PairingState, TransitionError> {
        if self.owner != Some(attempt) {
            return Err(TransitionError::NotOwner);
        }
        let next = self.state.next(event).ok_or(TransitionError::Invalid {
            state: self.state,
            event,
        })?;

        self.state = next;
        if next == PairingState::Idle {
            self.matched_to = None;
            self.owner = None;
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_path() {
        let mut pairing = Pairing::new();
        let peer = PeerId::random();

        let attempt = pairing.begin(PairingEvent::SendMatch, peer).unwrap();
        assert_eq!(pairing.state(), PairingState::Requesting);
        assert_eq!(pairing.matched_to(), Some(peer));

        assert_eq!(
            pairing.advance(attempt, PairingEvent::ReceiveAccept),
            Ok(PairingState::Accepted)
        );
        assert_eq!(
            pairing.advance(attempt, PairingEvent::Confirm),
            Ok(PairingState::Paired)
        );
        assert_eq!(pairing.matched_to(), Some(peer));
    }

    #[test]
    fn responder_path() {
        let mut pairing = Pairing::new();
        let attempt = pairing
            .begin(PairingEvent::ReceiveMatch, PeerId::random())
            .unwrap();
        assert_eq!(pairing.state(), PairingState::RequestReceived);
        assert_eq!(
            pairing.advance(attempt, PairingEvent::Confirm),
            Ok(PairingState::Paired)
        );
    }

    #[test]
    fn only_one_attempt_at_a_time() {
        let mut pairing = Pairing::new();
        pairing.begin(PairingEvent::SendMatch, PeerId::random()).unwrap();

        let second = pairing.begin(PairingEvent::ReceiveMatch, PeerId::random());
        assert_eq!(
            second,
            Err(TransitionError::Invalid {
                state: PairingState::Requesting,
                event: PairingEvent::ReceiveMatch,
            })
        );
    }

    #[test]
    fn fail_resets_and_clears_peer() {
        let mut pairing = Pairing::new();
        let attempt = pairing.begin(PairingEvent::SendMatch, PeerId::random()).unwrap();
        assert_eq!(pairing.advance(attempt, PairingEvent::Fail), Ok(PairingState::Idle));
        assert_eq!(pairing.matched_to(), None);

        // The old attempt cannot touch the state of a newer one.
        let newer = pairing.begin(PairingEvent::ReceiveMatch, PeerId::random()).unwrap();
        assert_eq!(
            pairing.advance(attempt, PairingEvent::Fail),
            Err(TransitionError::NotOwner)
        );
        assert_eq!(pairing.state(), PairingState::RequestReceived);
        assert!(pairing.advance(newer, PairingEvent::Fail).is_ok());
    }

    #[test]
    fn paired_is_terminal() {
        let mut pairing = Pairing::new();
        let attempt = pairing.begin(PairingEvent::ReceiveMatch, PeerId::random()).unwrap();
        pairing.advance(attempt, PairingEvent::Confirm).unwrap();

        assert!(pairing.advance(attempt, PairingEvent::Fail).is_err());
        assert!(pairing.begin(PairingEvent::SendMatch, PeerId::random()).is_err());
        assert_eq!(pairing.state(), PairingState::Paired);
    }

    #[test]
    fn responder_cannot_skip_to_accepted() {
        assert_eq!(
            PairingState::RequestReceived.next(PairingEvent::ReceiveAccept),
            None
        );
        assert_eq!(PairingState::Idle.next(PairingEvent::Confirm), None);
        assert_eq!(PairingState::Idle.next(PairingEvent::Fail), None);
    }
}
