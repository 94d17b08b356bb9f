//! The replica: an in-memory key/value map with the bookkeeping that feeds
//! replication. Mutations tag a bit per slot in every registered per-peer
//! modification bitset; incoming entries pass through the last-writer-wins
//! merge rule and are never re-broadcast by the receiver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use hashbrown::HashMap;

use ember::{time, valid_peer_id, PeerId};

mod dirty;

pub use self::dirty::ModificationIterator;

/// Identifier reserved for the datagram channel's private cursor. Never
/// valid on the wire.
pub const DATAGRAM_ID: PeerId = 0;

/// Smallest entry the wire format can express: empty key, tombstone.
const MIN_ENTRY_SIZE: usize = 12;

/// One slot of the replica. `value == None` is the tombstone: invisible to
/// readers, visible to replication until a later entry supersedes it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Entry {
    pub key: Box<[u8]>,
    pub value: Option<Box<[u8]>>,
    pub timestamp: u64,
    pub modifier: PeerId,
}

impl Entry {
    /// Returns true if the entry carries a value rather than a tombstone.
    #[inline]
    pub fn live(&self) -> bool {
        self.value.is_some()
    }

    /// The merge rule: an incoming entry replaces a local one only if its
    /// `(timestamp, modifier)` pair is strictly greater. Deterministic
    /// regardless of delivery order, which is what makes the slot-ordered
    /// iterator safe.
    #[inline]
    pub fn supersedes(&self, other: &Entry) -> bool {
        (self.timestamp, self.modifier) > (other.timestamp, other.modifier)
    }

    /// Exact size of the entry in the external (wire) representation.
    #[inline]
    pub fn external_size(&self) -> usize {
        external_size(self.key.len(), self.value.as_ref().map(|value| value.len()))
    }
}

/// Wire size of an entry with the given key and optional value lengths:
/// key length prefix, key, flags, optional value length prefix and value,
/// timestamp, modifier identifier.
#[inline]
pub fn external_size(key_len: usize, value_len: Option<usize>) -> usize {
    2 + key_len + 1 + value_len.map(|len| 4 + len).unwrap_or(0) + 8 + 1
}

#[derive(Debug, Eq, PartialEq)]
pub enum StoreError {
    /// The serialized entry would exceed the configured maximum.
    EntryTooLarge,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared handle to a replica. Cloning is cheap; the application context
/// mutates through one clone while the replication reactor reads and applies
/// through another.
#[derive(Clone)]
pub struct MapStore {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    identifier: PeerId,
    entry_max_size: usize,

    /// Last locally issued timestamp; never hands out a repeat.
    clock: AtomicU64,
    /// Highest timestamp ever installed, local or incoming.
    peak: AtomicU64,

    state: RwLock<State>,
    iters: Mutex<HashMap<PeerId, Arc<ModificationIterator>>>,
}

struct State {
    slots: Vec<Entry>,
    index: HashMap<Box<[u8]>, usize>,
    live: usize,
}

impl MapStore {
    /// Creates an empty replica owned by `identifier`. Entries whose wire
    /// representation exceeds `entry_max_size` are refused at the door.
    pub fn new(identifier: PeerId, entry_max_size: usize) -> MapStore {
        if !valid_peer_id(identifier) {
            panic!("Identifier must be in 1..=127, got {}", identifier);
        }

        if entry_max_size < MIN_ENTRY_SIZE || entry_max_size > u16::max_value() as usize {
            panic!(
                "Entry max size must be within {}..={}, got {}",
                MIN_ENTRY_SIZE,
                u16::max_value(),
                entry_max_size
            );
        }

        MapStore {
            shared: Arc::new(Shared {
                identifier,
                entry_max_size,
                clock: AtomicU64::new(0),
                peak: AtomicU64::new(0),
                state: RwLock::new(State {
                    slots: Vec::new(),
                    index: HashMap::new(),
                    live: 0,
                }),
                iters: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Identifier of the local node.
    #[inline]
    pub fn identifier(&self) -> PeerId {
        self.shared.identifier
    }

    /// The configured per-entry size ceiling.
    #[inline]
    pub fn entry_max_size(&self) -> usize {
        self.shared.entry_max_size
    }

    /// Highest modification timestamp ever installed locally. Announced in
    /// the welcome so a reconnecting peer can replay everything we missed.
    #[inline]
    pub fn last_modification(&self) -> u64 {
        self.shared.peak.load(Ordering::Acquire)
    }

    /// Stores `value` under `key`, stamped with a fresh local timestamp.
    pub fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.mutate(key, Some(value))
    }

    /// Installs a tombstone for `key`. The key disappears from readers but
    /// keeps replicating until a later entry supersedes the tombstone.
    pub fn remove(&self, key: &[u8]) -> StoreResult<()> {
        self.mutate(key, None)
    }

    /// Returns the live value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let state = self.shared.state.read().expect("Map lock poisoned");
        let &slot = state.index.get(key)?;

        state.slots[slot].value.as_ref().map(|value| value.to_vec())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.shared.state.read().expect("Map lock poisoned").live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live entries, sorted by key. Replicas that have converged return
    /// equal snapshots.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let state = self.shared.state.read().expect("Map lock poisoned");

        let mut entries: Vec<_> = state
            .slots
            .iter()
            .filter_map(|entry| {
                entry
                    .value
                    .as_ref()
                    .map(|value| (entry.key.to_vec(), value.to_vec()))
            })
            .collect();

        entries.sort();
        entries
    }

    /// The modification iterator bound to `remote`. Idempotent: the same
    /// identifier always maps to the same iterator, surviving session
    /// reconnects so undelivered bits are not lost.
    pub fn modification_iterator(&self, remote: PeerId) -> Arc<ModificationIterator> {
        let mut iters = self.shared.iters.lock().expect("Iterator registry poisoned");

        iters
            .entry(remote)
            .or_insert_with(|| Arc::new(ModificationIterator::new(Arc::downgrade(&self.shared))))
            .clone()
    }

    /// Reads one slot out of the replica.
    pub fn read_slot(&self, slot: usize) -> Option<Entry> {
        self.shared.read_slot(slot)
    }

    /// Applies an entry received from a peer under the merge rule. Returns
    /// true if the entry was installed. Incoming installs never tag
    /// modification bits; the receiver does not re-broadcast.
    pub fn apply_incoming(&self, entry: Entry) -> StoreResult<bool> {
        if entry.external_size() > self.shared.entry_max_size {
            return Err(StoreError::EntryTooLarge);
        }

        let timestamp = entry.timestamp;
        let mut state = self.shared.state.write().expect("Map lock poisoned");

        let installed = match state.index.get(&entry.key[..]).cloned() {
            Some(slot) => {
                if entry.supersedes(&state.slots[slot]) {
                    state.replace(slot, entry);
                    true
                } else {
                    false
                }
            }
            None => {
                state.insert(entry);
                true
            }
        };

        if installed {
            self.shared.peak.fetch_max(timestamp, Ordering::AcqRel);
        }

        Ok(installed)
    }

    fn mutate(&self, key: &[u8], value: Option<&[u8]>) -> StoreResult<()> {
        if external_size(key.len(), value.map(|value| value.len())) > self.shared.entry_max_size {
            return Err(StoreError::EntryTooLarge);
        }

        let timestamp = self.shared.next_timestamp();
        let entry = Entry {
            key: key.into(),
            value: value.map(Into::into),
            timestamp,
            modifier: self.shared.identifier,
        };

        let mut state = self.shared.state.write().expect("Map lock poisoned");

        let slot = match state.index.get(key).cloned() {
            Some(slot) => {
                state.replace(slot, entry);
                slot
            }
            None => state.insert(entry),
        };

        self.shared.peak.fetch_max(timestamp, Ordering::AcqRel);

        // Tag every per-peer bitset before releasing the map lock, so the
        // mutation is never observable to an iterator with its bit unset.
        let iters = self.shared.iters.lock().expect("Iterator registry poisoned");

        for iter in iters.values() {
            iter.tag(slot);
        }

        drop(state);
        Ok(())
    }
}

impl Shared {
    fn next_timestamp(&self) -> u64 {
        let now = time::timestamp_millis();
        let mut last = self.clock.load(Ordering::Relaxed);

        loop {
            let next = if now > last { now } else { last + 1 };

            match self
                .clock
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    pub(crate) fn read_slot(&self, slot: usize) -> Option<Entry> {
        let state = self.state.read().expect("Map lock poisoned");

        state.slots.get(slot).cloned()
    }

    /// Visits `(slot, timestamp)` for every occupied slot under one read
    /// lock. Used to seed a bitset at bootstrap.
    pub(crate) fn scan_timestamps<F: FnMut(usize, u64)>(&self, mut visit: F) {
        let state = self.state.read().expect("Map lock poisoned");

        for (slot, entry) in state.slots.iter().enumerate() {
            visit(slot, entry.timestamp);
        }
    }
}

impl State {
    /// Overwrites an occupied slot, keeping the live-entry count straight.
    fn replace(&mut self, slot: usize, entry: Entry) {
        match (self.slots[slot].live(), entry.live()) {
            (false, true) => self.live += 1,
            (true, false) => self.live -= 1,
            _ => (),
        }

        self.slots[slot] = entry;
    }

    /// Assigns a fresh slot. Slots are never reclaimed, so the index stays
    /// stable for the lifetime of the key.
    fn insert(&mut self, entry: Entry) -> usize {
        let slot = self.slots.len();

        if entry.live() {
            self.live += 1;
        }

        self.index.insert(entry.key.clone(), slot);
        self.slots.push(entry);
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(key: &[u8], value: Option<&[u8]>, timestamp: u64, modifier: PeerId) -> Entry {
        Entry {
            key: key.into(),
            value: value.map(Into::into),
            timestamp,
            modifier,
        }
    }

    #[test]
    fn test_put_get_remove() {
        let map = MapStore::new(1, 1024);

        map.put(b"alpha", b"one").unwrap();

        assert_eq!(map.get(b"alpha"), Some(b"one".to_vec()));
        assert_eq!(map.len(), 1);

        map.remove(b"alpha").unwrap();

        assert_eq!(map.get(b"alpha"), None);
        assert_eq!(map.len(), 0);

        // The tombstone still occupies its slot for replication.
        assert!(!map.read_slot(0).unwrap().live());
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let map = MapStore::new(1, 1024);

        map.put(b"a", b"1").unwrap();
        map.put(b"b", b"2").unwrap();
        map.put(b"a", b"3").unwrap();

        let first = map.read_slot(0).unwrap().timestamp;
        let second = map.read_slot(1).unwrap().timestamp;

        assert!(second > first);
        assert!(map.read_slot(0).unwrap().timestamp > second);
        assert_eq!(map.last_modification(), map.read_slot(0).unwrap().timestamp);
    }

    #[test]
    fn test_merge_rule_older_loses() {
        let map = MapStore::new(1, 1024);

        map.put(b"k", b"local").unwrap();
        let local_ts = map.read_slot(0).unwrap().timestamp;

        let installed = map
            .apply_incoming(incoming(b"k", Some(b"stale"), local_ts - 1, 2))
            .unwrap();

        assert!(!installed);
        assert_eq!(map.get(b"k"), Some(b"local".to_vec()));
    }

    #[test]
    fn test_merge_rule_newer_wins() {
        let map = MapStore::new(1, 1024);

        map.put(b"k", b"local").unwrap();
        let local_ts = map.read_slot(0).unwrap().timestamp;

        let installed = map
            .apply_incoming(incoming(b"k", Some(b"fresh"), local_ts + 1, 2))
            .unwrap();

        assert!(installed);
        assert_eq!(map.get(b"k"), Some(b"fresh".to_vec()));
        assert_eq!(map.last_modification(), local_ts + 1);
    }

    #[test]
    fn test_merge_rule_identifier_tiebreak() {
        // Two replicas observe the same two concurrent writes in opposite
        // orders; both must settle on the higher modifier identifier.
        let first = incoming(b"k", Some(b"from-1"), 5000, 1);
        let second = incoming(b"k", Some(b"from-2"), 5000, 2);

        let forward = MapStore::new(3, 1024);
        forward.apply_incoming(first.clone()).unwrap();
        forward.apply_incoming(second.clone()).unwrap();

        let backward = MapStore::new(4, 1024);
        backward.apply_incoming(second).unwrap();
        backward.apply_incoming(first).unwrap();

        assert_eq!(forward.get(b"k"), Some(b"from-2".to_vec()));
        assert_eq!(backward.get(b"k"), Some(b"from-2".to_vec()));
    }

    #[test]
    fn test_no_resurrection() {
        let map = MapStore::new(1, 1024);

        map.apply_incoming(incoming(b"k", None, 9000, 2)).unwrap();

        let installed = map
            .apply_incoming(incoming(b"k", Some(b"zombie"), 8000, 3))
            .unwrap();

        assert!(!installed);
        assert_eq!(map.get(b"k"), None);
    }

    #[test]
    fn test_incoming_is_not_rebroadcast() {
        let map = MapStore::new(1, 1024);
        let iter = map.modification_iterator(2);

        map.apply_incoming(incoming(b"k", Some(b"v"), 100, 3)).unwrap();

        assert!(!iter.has_work());

        map.put(b"local", b"v").unwrap();

        assert!(iter.has_work());
    }

    #[test]
    fn test_entry_too_large() {
        let map = MapStore::new(1, 64);
        let value = vec![0u8; 64];

        assert_eq!(map.put(b"k", &value), Err(StoreError::EntryTooLarge));
        assert_eq!(map.get(b"k"), None);
    }

    #[test]
    fn test_snapshot_sorted_and_live_only() {
        let map = MapStore::new(1, 1024);

        map.put(b"b", b"2").unwrap();
        map.put(b"a", b"1").unwrap();
        map.put(b"c", b"3").unwrap();
        map.remove(b"b").unwrap();

        assert_eq!(
            map.snapshot(),
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn test_modification_iterator_idempotent() {
        let map = MapStore::new(1, 1024);

        let first = map.modification_iterator(2);
        let second = map.modification_iterator(2);

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    #[should_panic(expected = "Identifier must be in 1..=127")]
    fn test_rejects_out_of_range_identifier() {
        let _ = MapStore::new(128, 1024);
    }
}
