//! Peer registry: the node's view of its direct neighbors and their liveness.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::NetworkError;
use crate::identity::PeerId;

/// Liveness of a neighbor as judged from heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerStatus {
    /// Answered the last heartbeat (or just talked to us).
    Alive,
    /// Missed one heartbeat; still a routing candidate.
    Suspect,
    /// Missed two in a row; excluded from routing, kept for a grace period.
    Dead,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Self::Alive => "ALIVE",
            Self::Suspect => "SUSPECT",
            Self::Dead => "DEAD",
        })
    }
}

/// A known neighbor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    /// Transport address the neighbor listens on.
    pub address: String,
    pub last_seen_at: DateTime<Utc>,
    pub status: PeerStatus,
    #[serde(default)]
    pub consecutive_misses: u32,
}

/// Registry of direct neighbors.
///
/// Mutated only by the node runtime; the router reads
/// [`alive_peers`](PeerRegistry::alive_peers).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerEntry>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a neighbor and mark it `ALIVE`.
    ///
    /// Returns `true` if the peer was not known before.
    pub fn upsert(&mut self, peer_id: PeerId, address: impl Into<String>) -> bool {
        let address = address.into();
        let now = Utc::now();
        match self.peers.get_mut(&peer_id) {
            Some(entry) => {
                if entry.status != PeerStatus::Alive {
                    info!("Peer {peer_id} is back ({} -> ALIVE)", entry.status);
                }
                entry.address = address;
                entry.last_seen_at = now;
                entry.status = PeerStatus::Alive;
                entry.consecutive_misses = 0;
                false
            }
            None => {
                info!("New peer {peer_id} at {address}");
                self.peers.insert(
                    peer_id.clone(),
                    PeerEntry {
                        peer_id,
                        address,
                        last_seen_at: now,
                        status: PeerStatus::Alive,
                        consecutive_misses: 0,
                    },
                );
                true
            }
        }
    }

    /// Record a missed heartbeat: `ALIVE` → `SUSPECT` → `DEAD`.
    ///
    /// Returns the resulting status, or `None` for an unknown peer.
    pub fn on_heartbeat_timeout(&mut self, peer_id: &PeerId) -> Option<PeerStatus> {
        let entry = self.peers.get_mut(peer_id)?;
        entry.consecutive_misses = entry.consecutive_misses.saturating_add(1);
        let next = match entry.status {
            PeerStatus::Alive => PeerStatus::Suspect,
            PeerStatus::Suspect | PeerStatus::Dead => PeerStatus::Dead,
        };
        if next != entry.status {
            info!("Peer {peer_id}: {} -> {next}", entry.status);
        }
        entry.status = next;
        Some(next)
    }

    /// Routing candidates: every neighbor that is not `DEAD`.
    pub fn alive_peers(&self) -> BTreeSet<PeerId> {
        self.peers
            .values()
            .filter(|e| e.status != PeerStatus::Dead)
            .map(|e| e.peer_id.clone())
            .collect()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerEntry> {
        self.peers.get(peer_id)
    }

    pub fn address_of(&self, peer_id: &PeerId) -> Option<&str> {
        self.peers.get(peer_id).map(|e| e.address.as_str())
    }

    pub fn status_of(&self, peer_id: &PeerId) -> Option<PeerStatus> {
        self.peers.get(peer_id).map(|e| e.status)
    }

    /// All entries, sorted by peer id.
    pub fn list_all(&self) -> Vec<&PeerEntry> {
        let mut entries: Vec<&PeerEntry> = self.peers.values().collect();
        entries.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        entries
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerEntry> {
        self.peers.remove(peer_id)
    }

    /// Drop `DEAD` entries not heard from for longer than `grace`.
    pub fn prune_dead(&mut self, grace: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(grace)
            .ok()
            .and_then(|g| Utc::now().checked_sub_signed(g))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let before = self.peers.len();
        self.peers
            .retain(|_, e| !(e.status == PeerStatus::Dead && e.last_seen_at <= cutoff));
        let pruned = before - self.peers.len();
        if pruned > 0 {
            info!("Pruned {pruned} dead peers");
        }
        pruned
    }

    pub fn count(&self, status: PeerStatus) -> usize {
        self.peers.values().filter(|e| e.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Save the registry to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load the registry from a JSON file, or return an empty one.
    ///
    /// Liveness from a previous run is unconfirmed, so loaded `ALIVE`
    /// entries start as `SUSPECT`.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<PeerRegistry>(&data) {
                    Ok(mut registry) => {
                        for entry in registry.peers.values_mut() {
                            if entry.status == PeerStatus::Alive {
                                entry.status = PeerStatus::Suspect;
                            }
                        }
                        return registry;
                    }
                    Err(e) => {
                        warn!("Corrupt peer registry file: {e}");
                    }
                },
                Err(e) => {
                    warn!("Cannot read peer registry file: {e}");
                }
            }
        }
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> PeerId {
        PeerId::from_string(s)
    }

    #[test]
    fn test_upsert_adds_and_refreshes() {
        let mut registry = PeerRegistry::new();
        assert!(registry.upsert(pid("b"), "10.0.0.2:9470"));
        assert!(!registry.upsert(pid("b"), "10.0.0.9:9470"));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.address_of(&pid("b")), Some("10.0.0.9:9470"));
        assert_eq!(registry.status_of(&pid("b")), Some(PeerStatus::Alive));
    }

    #[test]
    fn test_missed_heartbeats_degrade_status() {
        let mut registry = PeerRegistry::new();
        registry.upsert(pid("b"), "b:1");

        assert_eq!(registry.on_heartbeat_timeout(&pid("b")), Some(PeerStatus::Suspect));
        assert!(registry.alive_peers().contains(&pid("b")));

        assert_eq!(registry.on_heartbeat_timeout(&pid("b")), Some(PeerStatus::Dead));
        assert!(!registry.alive_peers().contains(&pid("b")));
        // Retained, not deleted.
        assert!(registry.get(&pid("b")).is_some());
        assert_eq!(registry.get(&pid("b")).unwrap().consecutive_misses, 2);

        assert_eq!(registry.on_heartbeat_timeout(&pid("b")), Some(PeerStatus::Dead));
        assert_eq!(registry.on_heartbeat_timeout(&pid("zz")), None);
    }

    #[test]
    fn test_upsert_revives_dead_peer() {
        let mut registry = PeerRegistry::new();
        registry.upsert(pid("b"), "b:1");
        registry.on_heartbeat_timeout(&pid("b"));
        registry.on_heartbeat_timeout(&pid("b"));

        registry.upsert(pid("b"), "b:1");
        let entry = registry.get(&pid("b")).unwrap();
        assert_eq!(entry.status, PeerStatus::Alive);
        assert_eq!(entry.consecutive_misses, 0);
    }

    #[test]
    fn test_prune_dead_respects_grace() {
        let mut registry = PeerRegistry::new();
        registry.upsert(pid("b"), "b:1");
        registry.upsert(pid("c"), "c:1");
        registry.on_heartbeat_timeout(&pid("b"));
        registry.on_heartbeat_timeout(&pid("b"));

        assert_eq!(registry.prune_dead(Duration::from_secs(600)), 0);
        assert_eq!(registry.prune_dead(Duration::ZERO), 1);
        assert!(registry.get(&pid("b")).is_none());
        assert!(registry.get(&pid("c")).is_some());
    }

    #[test]
    fn test_counts_and_listing() {
        let mut registry = PeerRegistry::new();
        registry.upsert(pid("c"), "c:1");
        registry.upsert(pid("a"), "a:1");
        registry.on_heartbeat_timeout(&pid("c"));

        assert_eq!(registry.count(PeerStatus::Alive), 1);
        assert_eq!(registry.count(PeerStatus::Suspect), 1);
        let ids: Vec<&str> = registry.list_all().iter().map(|e| e.peer_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_registry_save_load_demotes_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");

        let mut registry = PeerRegistry::new();
        registry.upsert(pid("b"), "b:1");
        registry.upsert(pid("c"), "c:1");
        registry.on_heartbeat_timeout(&pid("c"));
        registry.on_heartbeat_timeout(&pid("c"));
        registry.save_to_file(&path).unwrap();

        let loaded = PeerRegistry::load_or_default(&path);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.status_of(&pid("b")), Some(PeerStatus::Suspect));
        assert_eq!(loaded.status_of(&pid("c")), Some(PeerStatus::Dead));
    }

    #[test]
    fn test_registry_load_corrupt_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(PeerRegistry::load_or_default(&path).is_empty());
    }
}
