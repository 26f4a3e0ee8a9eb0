use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/p2pchat.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Extra bootstrap peers, `/ip4/.../tcp/.../p2p/<PeerId>`.
    pub bootstrap_nodes: Vec<String>,
    /// Skip the public IPFS bootstrap list (useful on a private network).
    pub disable_default_bootstrap: bool,
    pub listen_port: u16,
    pub key_path: String,
    pub bootstrap_wait_secs: u64,
    pub handshake_timeout_secs: u64,
    pub open_stream_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub poll_jitter_ms: u64,
    pub search_window_secs: u64,
    /// How long a candidate that failed a handshake is skipped.
    pub retry_backoff_secs: u64,
    /// Cap on a single provider lookup.
    pub lookup_timeout_secs: u64,
    pub max_relays: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bootstrap_nodes: Vec::new(),
            disable_default_bootstrap: false,
            listen_port: 10000,
            key_path: "peerkey".to_string(),
            bootstrap_wait_secs: 10,
            handshake_timeout_secs: 5,
            open_stream_timeout_secs: 10,
            poll_interval_ms: 1000,
            poll_jitter_ms: 500,
            search_window_secs: 30,
            retry_backoff_secs: 3,
            lookup_timeout_secs: 5,
            max_relays: 2,
        }
    }
}

impl AppConfig {
    pub fn bootstrap_wait(&self) -> Duration {
        Duration::from_secs(self.bootstrap_wait_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn open_stream_timeout(&self) -> Duration {
        Duration::from_secs(self.open_stream_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_jitter(&self) -> Duration {
        Duration::from_millis(self.poll_jitter_ms)
    }

    pub fn search_window(&self) -> Duration {
        Duration::from_secs(self.search_window_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }
}

pub fn load_config(path: &str) -> AppConfig {
    let path = Path::new(path);
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Failed to parse config file {}: {err}", path.display());
                AppConfig::default()
            }
        },
        Err(err) => {
            log::info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            AppConfig::default()
        }
    }
}
