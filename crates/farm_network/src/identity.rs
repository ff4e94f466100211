//! Peer identity: unique node identification and persistence.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::NetworkError;

/// A unique identifier for a farm node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer ID (eight hex characters).
    pub fn generate() -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self(id)
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// The full identity of a farm node on the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub peer_id: PeerId,
    /// Human-readable name for the site (e.g. "north-greenhouse").
    pub name: String,
    /// Version of the software that created the identity.
    pub version: String,
}

impl NodeIdentity {
    /// Create a new identity with a fresh PeerId.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::with_peer_id(PeerId::generate(), name)
    }

    /// Create an identity with a caller-chosen PeerId (simulations, tests).
    pub fn with_peer_id(peer_id: PeerId, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Write the identity as pretty JSON, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read a previously saved identity.
    pub fn load(path: &Path) -> Result<Self, NetworkError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// The saved identity at `path`, or a fresh one named `name` that is
    /// persisted for the next start. A site keeps its peer id across
    /// restarts so neighbors and stored message ids stay valid.
    pub fn load_or_generate(path: &Path, name: impl Into<String>) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(identity) => return identity,
                Err(e) => warn!("Unusable identity file {}, generating new: {e}", path.display()),
            }
        }

        let identity = Self::generate(name);
        info!("Generated site identity {}", identity.peer_id);
        if let Err(e) = identity.save_to_file(path) {
            warn!("Failed to persist new identity: {e}");
        }
        identity
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_generation() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 8);
    }

    #[test]
    fn test_peer_id_serializes_as_plain_string() {
        let id = PeerId::from_string("farm-a");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"farm-a\"");
        assert_eq!(format!("{id}"), "farm-a");
    }

    #[test]
    fn test_saved_identity_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let saved = NodeIdentity::generate("north-field");
        saved.save_to_file(&path).unwrap();

        let loaded = NodeIdentity::load_or_generate(&path, "fallback-name");
        assert_eq!(loaded.peer_id, saved.peer_id);
        assert_eq!(loaded.name, "north-field");
    }

    #[test]
    fn test_identity_load_missing_generates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity.json");

        let first = NodeIdentity::load_or_generate(&path, "new-node");
        assert_eq!(first.name, "new-node");
        assert!(path.exists());

        let second = NodeIdentity::load_or_generate(&path, "other-name");
        assert_eq!(second.peer_id, first.peer_id);
    }

    #[test]
    fn test_corrupt_identity_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(NodeIdentity::load(&path).is_err());

        let fresh = NodeIdentity::load_or_generate(&path, "rebuilt");
        assert_eq!(fresh.name, "rebuilt");
        assert_eq!(NodeIdentity::load(&path).unwrap().peer_id, fresh.peer_id);
    }
}
