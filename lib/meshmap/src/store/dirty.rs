use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{RwLock, Weak};

use crate::net::shared::NetworkResult;
use crate::store::{Entry, Shared};

const WORD_BITS: usize = 64;

/// Per-remote cursor over locally changed slots. The application context
/// sets bits (under the map write lock); the replication context clears
/// them, one entry per `next_entry` call. A bit survives until a sink
/// accepts the slot, so delivery is at-least-once across reconnects.
pub struct ModificationIterator {
    map: Weak<Shared>,

    /// One bit per slot, in 64-bit words. Grows with the slot slab; growth
    /// takes the write lock, set/clear go through the read lock + atomics.
    bits: RwLock<Vec<AtomicU64>>,

    /// Next slot to scan. Fairness is by slot order, not mutation order;
    /// the merge rule makes that safe.
    cursor: AtomicUsize,
}

impl ModificationIterator {
    pub(crate) fn new(map: Weak<Shared>) -> ModificationIterator {
        ModificationIterator {
            map,
            bits: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Marks a slot as pending transmission.
    pub(crate) fn tag(&self, slot: usize) {
        self.ensure(slot);

        let words = self.bits.read().expect("Bitset lock poisoned");
        words[slot / WORD_BITS].fetch_or(1 << (slot % WORD_BITS), Ordering::AcqRel);
    }

    /// Bulk-tags every slot whose entry was modified at or after
    /// `timestamp`. Seeds the backlog when a peer reconnects and announces
    /// the last modification it has seen.
    pub fn dirty_from(&self, timestamp: u64) {
        if let Some(map) = self.map.upgrade() {
            map.scan_timestamps(|slot, modified| {
                if modified >= timestamp {
                    self.tag(slot);
                }
            });
        }
    }

    /// Returns true if any slot is pending transmission.
    pub fn has_work(&self) -> bool {
        let words = self.bits.read().expect("Bitset lock poisoned");

        words.iter().any(|word| word.load(Ordering::Acquire) != 0)
    }

    /// Scans for the next pending slot, starting at the cursor and wrapping
    /// once. The slot's bit is cleared before its entry is handed to the
    /// sink; a sink that declines (`Err`) gets the bit restored and the
    /// entry retried later. Returns true if an entry was delivered.
    pub fn next_entry<S>(&self, mut sink: S) -> bool
    where
        S: FnMut(&Entry) -> NetworkResult<usize>,
    {
        let map = match self.map.upgrade() {
            Some(map) => map,
            None => return false,
        };

        let total = self.word_count() * WORD_BITS;
        if total == 0 {
            return false;
        }

        let start = self.cursor.load(Ordering::Relaxed) % total;
        let mut offset = 0;

        while offset < total {
            let slot = (start + offset) % total;
            let word = self.load_word(slot / WORD_BITS);

            if word == 0 {
                // Skip to the next word boundary.
                offset += WORD_BITS - (slot % WORD_BITS);
                continue;
            }

            if word & (1 << (slot % WORD_BITS)) == 0 || !self.claim(slot) {
                offset += 1;
                continue;
            }

            let entry = match map.read_slot(slot) {
                Some(entry) => entry,
                // The bit outlived its slot; nothing to send.
                None => {
                    offset += 1;
                    continue;
                }
            };

            match sink(&entry) {
                Ok(_) => {
                    self.cursor.store((slot + 1) % total, Ordering::Relaxed);
                    return true;
                }
                Err(_) => {
                    self.tag(slot);
                    return false;
                }
            }
        }

        false
    }

    fn ensure(&self, slot: usize) {
        let needed = slot / WORD_BITS + 1;

        if self.word_count() < needed {
            let mut words = self.bits.write().expect("Bitset lock poisoned");

            while words.len() < needed {
                words.push(AtomicU64::new(0));
            }
        }
    }

    /// Clears the slot's bit; true if it was set.
    fn claim(&self, slot: usize) -> bool {
        let words = self.bits.read().expect("Bitset lock poisoned");
        let mask = 1u64 << (slot % WORD_BITS);

        words[slot / WORD_BITS].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    fn word_count(&self) -> usize {
        self.bits.read().expect("Bitset lock poisoned").len()
    }

    fn load_word(&self, word: usize) -> u64 {
        let words = self.bits.read().expect("Bitset lock poisoned");

        words.get(word).map(|word| word.load(Ordering::Acquire)).unwrap_or(0)
    }
}
