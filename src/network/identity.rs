use std::error::Error;
use std::fs;
use std::path::Path;

use libp2p::identity;

/// Reads the node key from `path`, or generates an Ed25519 key and writes it
/// there once so the PeerId stays stable across restarts.
pub fn load_or_generate_key(path: impl AsRef<Path>) -> Result<identity::Keypair, Box<dyn Error>> {
    let path = path.as_ref();
    if path.exists() {
        let bytes = fs::read(path)?;
        let keypair = identity::Keypair::from_protobuf_encoding(&bytes)
            .map_err(|e| format!("Failed to decode identity key: {}", e))?;
        log::info!("Loaded persisted identity key from {}", path.display());
        Ok(keypair)
    } else {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let keypair = identity::Keypair::generate_ed25519();
        let encoded = keypair
            .to_protobuf_encoding()
            .map_err(|e| format!("Failed to encode identity key: {}", e))?;
        fs::write(path, encoded)?;
        log::info!("Generated new identity key and saved to {}", path.display());
        Ok(keypair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::PeerId;

    #[test]
    fn key_is_created_once_and_reused() {
        let dir = std::env::temp_dir().join(format!("p2pmatch-key-{}", std::process::id()));
        let path = dir.join("peerkey");
        let _ = fs::remove_dir_all(&dir);

        let first = load_or_generate_key(&path).unwrap();
        assert!(path.exists());
        let second = load_or_generate_key(&path).unwrap();

        assert_eq!(
            PeerId::from(first.public()),
            PeerId::from(second.public())
        );
        let _ = fs::remove_dir_all(&dir);
    }
}
