//! Durable message store: the node's record of every message it has seen.
//!
//! Records live in memory behind one lock each, so transitions on
//! different message ids never contend and transitions on the same id are
//! linearized. Every change is written through to SQLite as one JSON row
//! per message; on open, each row is parsed on its own and a row that
//! fails to parse is dropped without affecting the rest.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::message::{Envelope, MessageId};

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

/// Lifecycle of a stored message. Variants are ordered; state only moves
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    /// Seen for the first time, nothing decided yet.
    New,
    /// Accepted for relay; the retry cycle owns it.
    Queued,
    /// All delivery work at this node is done.
    Delivered,
    /// Hop budget or retries exhausted, or aged out.
    Expired,
}

impl RecordState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Expired)
    }
}

/// One stored message with its delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRecord {
    pub message_id: MessageId,
    /// The envelope as first seen (or as originated here).
    pub envelope: Envelope,
    pub state: RecordState,
    pub first_seen_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub delivered_locally: bool,
    pub state_changed_at: DateTime<Utc>,
    /// Peers that accepted a relay copy or are known to hold the message.
    #[serde(default)]
    pub reached: Vec<PeerId>,
    /// Relay targets not reached yet.
    #[serde(default)]
    pub pending: Vec<PeerId>,
}

impl StoreRecord {
    fn new(envelope: &Envelope) -> Self {
        let now = Utc::now();
        Self {
            message_id: envelope.id().clone(),
            envelope: envelope.clone(),
            state: RecordState::New,
            first_seen_at: now,
            last_attempt_at: None,
            attempt_count: 0,
            delivered_locally: false,
            state_changed_at: now,
            reached: Vec::new(),
            pending: Vec::new(),
        }
    }

    fn advance(&mut self, to: RecordState) -> bool {
        if to <= self.state {
            return false;
        }
        self.state = to;
        self.state_changed_at = Utc::now();
        true
    }
}

/// Result of [`MessageStore::record`].
#[derive(Debug, Clone)]
pub struct Recorded {
    pub record: StoreRecord,
    /// `false` when the message was already known; `record` is then the
    /// existing, unchanged record.
    pub inserted: bool,
}

/// Record counts per state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub new: usize,
    pub queued: usize,
    pub delivered: usize,
    pub expired: usize,
}

impl StoreStats {
    pub fn total(&self) -> usize {
        self.new + self.queued + self.delivered + self.expired
    }
}

type Slot = Arc<Mutex<StoreRecord>>;

// ---------------------------------------------------------------------------
// MessageStore
// ---------------------------------------------------------------------------

/// SQLite-backed store of [`StoreRecord`]s keyed by message id.
pub struct MessageStore {
    records: RwLock<HashMap<MessageId, Slot>>,
    db: Mutex<Connection>,
}

impl MessageStore {
    /// Opens (or creates) the store at the given path and loads every
    /// readable record.
    pub fn open(path: &Path) -> Result<Self, NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self::from_connection(conn)?;
        info!(
            "Message store opened at {} ({} records)",
            path.display(),
            store.len()
        );
        Ok(store)
    }

    /// Opens an in-memory store (for tests and simulations).
    pub fn open_in_memory() -> Result<Self, NetworkError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, NetworkError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS message_records (
                message_id TEXT PRIMARY KEY,
                record TEXT NOT NULL
            );
            ",
        )?;
        let records = load_records(&conn)?;
        Ok(Self {
            records: RwLock::new(records),
            db: Mutex::new(conn),
        })
    }

    fn slot(&self, id: &MessageId) -> Option<Slot> {
        self.records.read().get(id).cloned()
    }

    /// True if any record with that id exists, whatever its state.
    pub fn has_seen(&self, id: &MessageId) -> bool {
        self.records.read().contains_key(id)
    }

    /// Snapshot of one record.
    pub fn get(&self, id: &MessageId) -> Option<StoreRecord> {
        self.slot(id).map(|slot| slot.lock().clone())
    }

    /// Insert a `NEW` record unless one already exists.
    ///
    /// Check and insert happen under the index write lock, so two
    /// concurrent receptions of the same message see exactly one insert.
    pub fn record(&self, envelope: &Envelope) -> Recorded {
        if let Some(slot) = self.slot(envelope.id()) {
            let record = slot.lock().clone();
            return Recorded {
                record,
                inserted: false,
            };
        }

        let mut records = self.records.write();
        if let Some(slot) = records.get(envelope.id()) {
            let record = slot.lock().clone();
            return Recorded {
                record,
                inserted: false,
            };
        }

        let slot: Slot = Arc::new(Mutex::new(StoreRecord::new(envelope)));
        let guard = slot.lock();
        records.insert(envelope.id().clone(), Arc::clone(&slot));
        drop(records);

        self.persist(&guard);
        debug!("Recorded new message {}", envelope.id());
        Recorded {
            record: guard.clone(),
            inserted: true,
        }
    }

    /// `NEW` → `QUEUED`. No-op from any later state.
    pub fn mark_queued(&self, id: &MessageId) -> bool {
        self.advance(id, RecordState::Queued)
    }

    /// Move to `DELIVERED`. No-op once `DELIVERED` or `EXPIRED`.
    pub fn mark_delivered(&self, id: &MessageId) -> bool {
        self.advance(id, RecordState::Delivered)
    }

    /// Move to `EXPIRED`. No-op once `EXPIRED`.
    pub fn mark_expired(&self, id: &MessageId) -> bool {
        self.advance(id, RecordState::Expired)
    }

    fn advance(&self, id: &MessageId, to: RecordState) -> bool {
        self.update(id, |record| {
            let changed = record.advance(to);
            (changed, changed)
        })
        .unwrap_or(false)
    }

    /// Claim the single local hand-off of this message.
    ///
    /// Returns `true` only for the first caller; the caller then owns the
    /// delivery to the local bridge.
    pub fn mark_delivered_locally(&self, id: &MessageId) -> bool {
        self.update(id, |record| {
            if record.delivered_locally {
                (false, false)
            } else {
                record.delivered_locally = true;
                (true, true)
            }
        })
        .unwrap_or(false)
    }

    /// Book one relay attempt: `reached` accepted the copy, `pending` still
    /// needs it. Terminal records are left untouched.
    pub fn record_attempt(
        &self,
        id: &MessageId,
        reached: &[PeerId],
        pending: Vec<PeerId>,
    ) -> Option<StoreRecord> {
        self.update(id, |record| {
            if record.state.is_terminal() {
                return (false, record.clone());
            }
            record.attempt_count = record.attempt_count.saturating_add(1);
            record.last_attempt_at = Some(Utc::now());
            for peer in reached {
                if !record.reached.contains(peer) {
                    record.reached.push(peer.clone());
                }
            }
            record.pending = pending
                .into_iter()
                .filter(|peer| !record.reached.contains(peer))
                .collect();
            record.pending.dedup();
            (true, record.clone())
        })
    }

    /// Note peers known to already hold the message (from a duplicate's
    /// path), so they are never retried.
    pub fn note_holders(&self, id: &MessageId, holders: &[PeerId]) -> Option<StoreRecord> {
        self.update(id, |record| {
            let mut changed = false;
            for peer in holders {
                if !record.reached.contains(peer) {
                    record.reached.push(peer.clone());
                    changed = true;
                }
            }
            let before = record.pending.len();
            record.pending.retain(|peer| !holders.contains(peer));
            changed |= record.pending.len() != before;
            (changed, record.clone())
        })
    }

    /// Snapshot of every `QUEUED` record.
    pub fn queued(&self) -> Vec<StoreRecord> {
        self.with_state(RecordState::Queued)
    }

    /// Snapshot of every record currently in `state`.
    pub fn with_state(&self, state: RecordState) -> Vec<StoreRecord> {
        let slots: Vec<Slot> = self.records.read().values().cloned().collect();
        slots
            .iter()
            .map(|slot| slot.lock().clone())
            .filter(|record| record.state == state)
            .collect()
    }

    /// Age `DELIVERED` records untouched for `retention` into `EXPIRED`.
    pub fn expire_stale(&self, retention: Duration) -> usize {
        let cutoff = cutoff(retention);
        let slots: Vec<(MessageId, Slot)> = self
            .records
            .read()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut expired = 0;
        for (id, slot) in slots {
            let mut record = slot.lock();
            if record.state == RecordState::Delivered && record.state_changed_at <= cutoff {
                record.advance(RecordState::Expired);
                self.persist(&record);
                debug!("Aged out delivered message {id}");
                expired += 1;
            }
        }
        expired
    }

    /// Remove `DELIVERED`/`EXPIRED` records whose last transition is older
    /// than `retention`. `NEW` and `QUEUED` records are never removed.
    pub fn sweep(&self, retention: Duration) -> usize {
        let cutoff = cutoff(retention);
        let mut records = self.records.write();
        let doomed: Vec<MessageId> = records
            .iter()
            .filter(|(_, slot)| {
                let record = slot.lock();
                record.state.is_terminal() && record.state_changed_at <= cutoff
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &doomed {
            records.remove(id);
        }
        drop(records);

        if !doomed.is_empty() {
            let mut db = self.db.lock();
            let result = db.transaction().and_then(|tx| {
                for id in &doomed {
                    tx.execute(
                        "DELETE FROM message_records WHERE message_id = ?1",
                        params![id.as_str()],
                    )?;
                }
                tx.commit()
            });
            if let Err(e) = result {
                warn!("Failed to delete swept records: {e}");
            }
            info!("Swept {} terminal records", doomed.len());
        }
        doomed.len()
    }

    /// Rewrite every record to disk in one transaction.
    pub fn checkpoint(&self) -> Result<(), NetworkError> {
        let snapshot: Vec<StoreRecord> = {
            let slots: Vec<Slot> = self.records.read().values().cloned().collect();
            slots.iter().map(|slot| slot.lock().clone()).collect()
        };

        let mut db = self.db.lock();
        let tx = db.transaction()?;
        for record in &snapshot {
            let body = serde_json::to_string(record)?;
            tx.execute(UPSERT_SQL, params![record.message_id.as_str(), body])?;
        }
        tx.commit()?;
        debug!("Checkpointed {} records", snapshot.len());
        Ok(())
    }

    /// Highest sequence number stored for messages from `origin`.
    pub fn max_sequence(&self, origin: &PeerId) -> Option<u64> {
        self.records
            .read()
            .keys()
            .filter(|id| id.origin() == Some(origin.as_str()))
            .filter_map(|id| id.sequence())
            .max()
    }

    pub fn stats(&self) -> StoreStats {
        let slots: Vec<Slot> = self.records.read().values().cloned().collect();
        let mut stats = StoreStats::default();
        for slot in slots {
            match slot.lock().state {
                RecordState::New => stats.new += 1,
                RecordState::Queued => stats.queued += 1,
                RecordState::Delivered => stats.delivered += 1,
                RecordState::Expired => stats.expired += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Apply `f` under the record's lock; persist when it reports a change.
    fn update<T>(
        &self,
        id: &MessageId,
        f: impl FnOnce(&mut StoreRecord) -> (bool, T),
    ) -> Option<T> {
        let slot = self.slot(id)?;
        let mut record = slot.lock();
        let (changed, out) = f(&mut record);
        if changed {
            self.persist(&record);
        }
        Some(out)
    }

    /// Write one record through to disk. Failures are logged; the in-memory
    /// state stays authoritative until the next successful write.
    fn persist(&self, record: &StoreRecord) {
        let body = match serde_json::to_string(record) {
            Ok(body) => body,
            Err(e) => {
                warn!("Cannot serialize record {}: {e}", record.message_id);
                return;
            }
        };
        let db = self.db.lock();
        if let Err(e) = db.execute(UPSERT_SQL, params![record.message_id.as_str(), body]) {
            warn!("Cannot persist record {}: {e}", record.message_id);
        }
    }
}

const UPSERT_SQL: &str = "INSERT INTO message_records (message_id, record) VALUES (?1, ?2)
     ON CONFLICT(message_id) DO UPDATE SET record = excluded.record";

fn cutoff(retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Load every row, isolating rows that fail to parse.
fn load_records(conn: &Connection) -> Result<HashMap<MessageId, Slot>, NetworkError> {
    let mut records = HashMap::new();
    let mut corrupt_rows = Vec::new();
    {
        let mut stmt = conn.prepare("SELECT rowid, message_id, record FROM message_records")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1).ok(),
                row.get::<_, String>(2).ok(),
            ))
        })?;

        for row in rows {
            let (rowid, key, body) = row?;
            match parse_row(key.as_deref(), body.as_deref()) {
                Ok(record) => {
                    records.insert(record.message_id.clone(), Arc::new(Mutex::new(record)));
                }
                Err(e) => {
                    warn!("{e}; dropping record");
                    corrupt_rows.push(rowid);
                }
            }
        }
    }

    for rowid in corrupt_rows {
        conn.execute(
            "DELETE FROM message_records WHERE rowid = ?1",
            params![rowid],
        )?;
    }
    Ok(records)
}

fn parse_row(key: Option<&str>, body: Option<&str>) -> Result<StoreRecord, NetworkError> {
    let corruption = |reason: String| NetworkError::StoreCorruption {
        message_id: key.unwrap_or("<unreadable>").to_string(),
        reason,
    };
    let key = key.ok_or_else(|| corruption("unreadable key".to_string()))?;
    let body = body.ok_or_else(|| corruption("unreadable body".to_string()))?;
    let record: StoreRecord =
        serde_json::from_str(body).map_err(|e| corruption(e.to_string()))?;
    if record.message_id.as_str() != key || record.envelope.id() != &record.message_id {
        return Err(corruption("record does not match its key".to_string()));
    }
    Ok(record)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Severity;
    use crate::message::{Payload, PestAlert};

    fn alert(seq: u64) -> Envelope {
        Envelope::new(
            PeerId::from_string("farm-a"),
            seq,
            Payload::PestAlert(PestAlert::new(Severity::High, "north")),
            3,
        )
    }

    fn peers(names: &[&str]) -> Vec<PeerId> {
        names.iter().map(|n| PeerId::from_string(*n)).collect()
    }

    #[test]
    fn test_record_is_idempotent() {
        let store = MessageStore::open_in_memory().unwrap();
        let env = alert(1);

        let first = store.record(&env);
        assert!(first.inserted);
        assert_eq!(first.record.state, RecordState::New);
        assert!(store.has_seen(env.id()));

        store.mark_queued(env.id());

        // A copy that took a different path is the same message.
        let copy = env.forwarded_by(&PeerId::from_string("farm-b"));
        let second = store.record(&copy);
        assert!(!second.inserted);
        assert_eq!(second.record.state, RecordState::Queued);
        assert!(second.record.envelope.path().is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_has_seen_in_every_state() {
        let store = MessageStore::open_in_memory().unwrap();
        let env = alert(2);
        assert!(!store.has_seen(env.id()));
        store.record(&env);
        store.mark_expired(env.id());
        assert!(store.has_seen(env.id()));
    }

    #[test]
    fn test_transitions_only_move_forward() {
        let store = MessageStore::open_in_memory().unwrap();
        let env = alert(3);
        store.record(&env);

        assert!(store.mark_queued(env.id()));
        assert!(!store.mark_queued(env.id()));
        assert!(store.mark_delivered(env.id()));
        assert!(!store.mark_queued(env.id()));
        assert_eq!(store.get(env.id()).unwrap().state, RecordState::Delivered);

        assert!(store.mark_expired(env.id()));
        assert!(!store.mark_delivered(env.id()));
        assert!(!store.mark_queued(env.id()));
        assert_eq!(store.get(env.id()).unwrap().state, RecordState::Expired);
    }

    #[test]
    fn test_transitions_on_unknown_id_are_noops() {
        let store = MessageStore::open_in_memory().unwrap();
        let id = MessageId::from("ghost:1");
        assert!(!store.mark_queued(&id));
        assert!(!store.mark_delivered(&id));
        assert!(!store.mark_expired(&id));
        assert!(!store.mark_delivered_locally(&id));
        assert!(store.record_attempt(&id, &[], Vec::new()).is_none());
    }

    #[test]
    fn test_local_delivery_claimed_once() {
        let store = MessageStore::open_in_memory().unwrap();
        let env = alert(4);
        store.record(&env);
        assert!(store.mark_delivered_locally(env.id()));
        assert!(!store.mark_delivered_locally(env.id()));
        assert!(store.get(env.id()).unwrap().delivered_locally);
    }

    #[test]
    fn test_record_attempt_tracks_reached_and_pending() {
        let store = MessageStore::open_in_memory().unwrap();
        let env = alert(5);
        store.record(&env);
        store.mark_queued(env.id());

        let rec = store
            .record_attempt(env.id(), &peers(&["b"]), peers(&["c", "d"]))
            .unwrap();
        assert_eq!(rec.attempt_count, 1);
        assert!(rec.last_attempt_at.is_some());
        assert_eq!(rec.reached, peers(&["b"]));
        assert_eq!(rec.pending, peers(&["c", "d"]));

        let rec = store
            .record_attempt(env.id(), &peers(&["c"]), peers(&["b", "d"]))
            .unwrap();
        assert_eq!(rec.attempt_count, 2);
        assert_eq!(rec.reached, peers(&["b", "c"]));
        assert_eq!(rec.pending, peers(&["d"]));

        store.mark_expired(env.id());
        let rec = store.record_attempt(env.id(), &[], Vec::new()).unwrap();
        assert_eq!(rec.attempt_count, 2);
        assert_eq!(rec.pending, peers(&["d"]));
    }

    #[test]
    fn test_note_holders_clears_pending() {
        let store = MessageStore::open_in_memory().unwrap();
        let env = alert(6);
        store.record(&env);
        store.record_attempt(env.id(), &[], peers(&["b", "c"]));

        let rec = store.note_holders(env.id(), &peers(&["a", "b"])).unwrap();
        assert_eq!(rec.pending, peers(&["c"]));
        assert!(rec.reached.contains(&PeerId::from_string("a")));
    }

    #[test]
    fn test_sweep_never_removes_open_records() {
        let store = MessageStore::open_in_memory().unwrap();
        let (new, queued, delivered, expired) = (alert(10), alert(11), alert(12), alert(13));
        for env in [&new, &queued, &delivered, &expired] {
            store.record(env);
        }
        store.mark_queued(queued.id());
        store.mark_delivered(delivered.id());
        store.mark_expired(expired.id());

        // A generous window keeps everything.
        assert_eq!(store.sweep(Duration::from_secs(3600)), 0);
        assert_eq!(store.len(), 4);

        // A zero window drops terminal records only.
        assert_eq!(store.sweep(Duration::ZERO), 2);
        assert!(store.has_seen(new.id()));
        assert!(store.has_seen(queued.id()));
        assert!(!store.has_seen(delivered.id()));
        assert!(!store.has_seen(expired.id()));
    }

    #[test]
    fn test_expire_stale_ages_delivered_records() {
        let store = MessageStore::open_in_memory().unwrap();
        let env = alert(20);
        store.record(&env);
        store.mark_delivered(env.id());

        assert_eq!(store.expire_stale(Duration::from_secs(3600)), 0);
        assert_eq!(store.expire_stale(Duration::ZERO), 1);
        assert_eq!(store.get(env.id()).unwrap().state, RecordState::Expired);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let env = alert(30);
        {
            let store = MessageStore::open(&path).unwrap();
            store.record(&env);
            store.mark_queued(env.id());
            store.mark_delivered_locally(env.id());
            store.record_attempt(env.id(), &peers(&["b"]), peers(&["c"]));
        }

        let reopened = MessageStore::open(&path).unwrap();
        let rec = reopened.get(env.id()).unwrap();
        assert_eq!(rec.state, RecordState::Queued);
        assert!(rec.delivered_locally);
        assert_eq!(rec.attempt_count, 1);
        assert_eq!(rec.pending, peers(&["c"]));
        assert_eq!(rec.envelope, env);
    }

    #[test]
    fn test_corrupt_row_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let good = alert(40);
        {
            let store = MessageStore::open(&path).unwrap();
            store.record(&good);
        }
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "INSERT INTO message_records (message_id, record) VALUES ('farm-a:41', '{not json')",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO message_records (message_id, record) VALUES ('farm-a:42', ?1)",
                params![serde_json::to_string(&StoreRecord::new(&alert(99))).unwrap()],
            )
            .unwrap();
        }

        let store = MessageStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.has_seen(good.id()));

        // The bad rows were removed from disk as well.
        drop(store);
        let conn = Connection::open(&path).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM message_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_open_fails_on_unusable_path() {
        let dir = tempfile::tempdir().unwrap();
        let result = MessageStore::open(dir.path());
        assert!(matches!(result, Err(NetworkError::Storage(_))));
    }

    #[test]
    fn test_checkpoint_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let store = MessageStore::open(&path).unwrap();
        for seq in 0..3 {
            store.record(&alert(seq));
        }
        store.mark_queued(alert(1).id());
        store.mark_expired(alert(2).id());
        store.checkpoint().unwrap();

        let stats = store.stats();
        assert_eq!(stats.new, 1);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.total(), 3);
        assert_eq!(store.queued().len(), 1);
        assert_eq!(store.max_sequence(&PeerId::from_string("farm-a")), Some(2));
        assert_eq!(store.max_sequence(&PeerId::from_string("farm-z")), None);
    }
}
