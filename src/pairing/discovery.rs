use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::StreamExt;
use libp2p::PeerId;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};

use crate::network::{DirectoryError, PeerConnector, RendezvousDirectory, TopicId};

use super::matchmaker::{Matchmaker, PairingError};
use super::state::PairingState;

#[derive(Debug, Clone, Copy)]
pub struct DiscoveryConfig {
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to every poll sleep.
    pub poll_jitter: Duration,
    /// Total time spent looking for candidates.
    pub search_window: Duration,
    /// How long a candidate is left alone after an attempt with it failed.
    pub retry_backoff: Duration,
    /// Upper bound on one provider lookup; lookups may never end on their own.
    pub lookup_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(500),
            search_window: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(3),
            lookup_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    Paired(PeerId),
    WindowElapsed,
}

/// Advertises `topic`, then polls the directory for other providers and
/// tries to pair with each of them until the matchmaker reports `Paired` or
/// the search window closes.
pub async fn run_discovery<D, C>(
    directory: D,
    matchmaker: Matchmaker<C>,
    topic: TopicId,
    config: DiscoveryConfig,
) -> Result<DiscoveryOutcome, DirectoryError>
where
    D: RendezvousDirectory,
    C: PeerConnector,
{
    let local = matchmaker.local_peer_id();
    let deadline = Instant::now() + config.search_window;

    log::info!("Providing topic {topic} on the DHT");
    match directory.advertise(&topic).await {
        Ok(()) => log::info!("Topic advertised"),
        Err(DirectoryError::HostClosed) => return Err(DirectoryError::HostClosed),
        Err(err) => log::warn!("{err}; continuing to search anyway"),
    }
    let mut states = matchmaker.subscribe();
    let verify_deadline = (Instant::now() + config.lookup_timeout).min(deadline);
    tokio::select! {
        verified = verify_advertisement(&directory, &topic, local, verify_deadline) => verified?,
        _ = wait_until_paired(&mut states) => {}
    }

    log::info!("Searching for peers on topic {topic}");
    let mut tried = TriedPeers::new(config.retry_backoff);
    let mut attempts: JoinSet<(PeerId, Result<PeerId, PairingError>)> = JoinSet::new();

    loop {
        reap_attempts(&mut attempts, &mut tried);
        if let Some(peer) = paired_with(&matchmaker) {
            attempts.detach_all();
            return Ok(DiscoveryOutcome::Paired(peer));
        }
        if Instant::now() >= deadline {
            break;
        }

        let lookup_deadline = (Instant::now() + config.lookup_timeout).min(deadline);
        let mut providers = directory.find_providers(&topic).await?;
        loop {
            let candidate = tokio::select! {
                biased;
                _ = wait_until_paired(&mut states) => break,
                next = timeout_at(lookup_deadline, providers.next()) => match next {
                    Ok(Some(candidate)) => candidate,
                    _ => break,
                },
            };
            if candidate == local {
                continue;
            }
            if !tried.start(candidate) {
                continue;
            }
            log::info!("Found candidate {candidate}");
            let matchmaker = matchmaker.clone();
            attempts.spawn(async move { (candidate, matchmaker.try_pair(candidate).await) });
        }

        let jitter_ms = config.poll_jitter.as_millis() as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        let wake = (Instant::now() + config.poll_interval + jitter).min(deadline);
        tokio::select! {
            _ = tokio::time::sleep_until(wake) => {}
            _ = wait_until_paired(&mut states) => {}
        }
    }

    // Attempts still running may yet succeed.
    while let Some(joined) = attempts.join_next().await {
        log_attempt(joined);
    }
    match paired_with(&matchmaker) {
        Some(peer) => Ok(DiscoveryOutcome::Paired(peer)),
        None => {
            log::info!("Search window elapsed without a match");
            Ok(DiscoveryOutcome::WindowElapsed)
        }
    }
}

/// One lookup to confirm our own provider record is visible, given up at
/// `deadline`.
async fn verify_advertisement<D: RendezvousDirectory>(
    directory: &D,
    topic: &TopicId,
    local: PeerId,
    deadline: Instant,
) -> Result<(), DirectoryError> {
    let mut providers = directory.find_providers(topic).await?;
    while let Ok(Some(provider)) = timeout_at(deadline, providers.next()).await {
        if provider == local {
            log::info!("Verified: this node is discoverable under topic {topic}");
            return Ok(());
        }
    }
    log::warn!("Own provider record not yet discoverable, searching anyway");
    Ok(())
}

/// Candidates with an attempt running, and those waiting out a backoff after
/// a failed one.
struct TriedPeers {
    in_flight: HashSet<PeerId>,
    retry_at: HashMap<PeerId, Instant>,
    backoff: Duration,
}

impl TriedPeers {
    fn new(backoff: Duration) -> Self {
        Self {
            in_flight: HashSet::new(),
            retry_at: HashMap::new(),
            backoff,
        }
    }

    /// Insert-if-absent: false when an attempt with `peer` is running or
    /// backing off.
    fn start(&mut self, peer: PeerId) -> bool {
        if let Some(retry_at) = self.retry_at.get(&peer) {
            if Instant::now() < *retry_at {
                return false;
            }
            self.retry_at.remove(&peer);
        }
        self.in_flight.insert(peer)
    }

    fn finish(&mut self, peer: PeerId, result: &Result<PeerId, PairingError>) {
        self.in_flight.remove(&peer);
        match result {
            // Busy attempts never reached the peer.
            Ok(_) | Err(PairingError::Busy) => {}
            Err(_) => {
                self.retry_at.insert(peer, Instant::now() + self.backoff);
            }
        }
    }
}

async fn wait_until_paired(states: &mut watch::Receiver<PairingState>) {
    loop {
        if *states.borrow_and_update() == PairingState::Paired {
            return;
        }
        if states.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn paired_with<C: PeerConnector>(matchmaker: &Matchmaker<C>) -> Option<PeerId> {
    if matchmaker.state() == PairingState::Paired {
        matchmaker.matched_to()
    } else {
        None
    }
}

fn reap_attempts(
    attempts: &mut JoinSet<(PeerId, Result<PeerId, PairingError>)>,
    tried: &mut TriedPeers,
) {
    while let Some(joined) = attempts.try_join_next() {
        if let Ok((candidate, result)) = &joined {
            tried.finish(*candidate, result);
        }
        log_attempt(joined);
    }
}

fn log_attempt(joined: Result<(PeerId, Result<PeerId, PairingError>), tokio::task::JoinError>) {
    match joined {
        Ok((candidate, Ok(_))) => log::info!("Paired with candidate {candidate}"),
        Ok((candidate, Err(PairingError::Busy))) => {
            log::debug!("Skipped {candidate}, pairing already in progress")
        }
        Ok((candidate, Err(err))) => log::info!("Attempt with {candidate} failed: {err}"),
        Err(err) => log::warn!("Pairing task failed: {err}"),
    }
}
