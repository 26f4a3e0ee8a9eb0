//! Turning "several peers advertising the same token" into exactly one
//! confirmed partner.

pub mod discovery;
pub mod handshake;
pub mod matchmaker;
pub mod state;

pub use discovery::{DiscoveryConfig, DiscoveryOutcome, run_discovery};
pub use handshake::MATCH_PROTOCOL;
pub use matchmaker::{Matchmaker, MatchmakerConfig, PairingError};
pub use state::PairingState;
