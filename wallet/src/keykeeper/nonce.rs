//! Persistent pool of single-use signing nonces.
//!
//! A sender commits to its public nonce long before it produces the partial
//! signature, possibly across a restart. The secret behind that nonce lives
//! here, in a fixed ring of seeds addressed by an ever-growing slot id.
//!
//! A slot stops being usable when it is consumed by a final signature, or
//! when the ring wraps around and its position is handed to a newer slot.
//! Either way the nonce can never sign twice.

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::KeeperError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NonceError {
    #[error("nonce slot {0} was never allocated")]
    Unallocated(u64),

    #[error("nonce slot {0} has already signed")]
    Consumed(u64),

    #[error("nonce slot {0} was overwritten by a newer allocation")]
    Overwritten(u64),

    #[error("nonce ring has no entries")]
    EmptyRing,

    #[error("nonce slot {0} is stored at the wrong ring position")]
    Misplaced(u64),
}

impl From<NonceError> for KeeperError {
    fn from(e: NonceError) -> Self {
        KeeperError::State(e.to_string())
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct NonceEntry {
    slot: u64,
    seed: [u8; 32],
    consumed: bool,
}

/// Ring of nonce seeds. Slot ids start at 1 and are never reused.
#[derive(Clone, Serialize, Deserialize)]
pub struct NoncePool {
    last_allocated: u64,
    entries: Vec<Option<NonceEntry>>,
}

impl NoncePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            last_allocated: 0,
            entries: vec![None; capacity.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn last_allocated(&self) -> u64 {
        self.last_allocated
    }

    /// Structural check for a pool read back from storage.
    pub fn check(&self) -> Result<(), NonceError> {
        if self.entries.is_empty() {
            return Err(NonceError::EmptyRing);
        }
        for (pos, entry) in self.entries.iter().enumerate() {
            if let Some(entry) = entry {
                if entry.slot == 0 || entry.slot > self.last_allocated || self.position(entry.slot) != pos {
                    return Err(NonceError::Misplaced(entry.slot));
                }
            }
        }
        Ok(())
    }

    fn position(&self, slot: u64) -> usize {
        (slot % self.entries.len() as u64) as usize
    }

    /// Draw a fresh seed into the next slot, evicting whatever occupied its
    /// ring position.
    pub fn allocate<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> u64 {
        self.last_allocated += 1;
        let slot = self.last_allocated;
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        let pos = self.position(slot);
        self.entries[pos] = Some(NonceEntry {
            slot,
            seed,
            consumed: false,
        });
        slot
    }

    /// Seed behind a live slot.
    pub fn seed(&self, slot: u64) -> Result<[u8; 32], NonceError> {
        if slot == 0 || slot > self.last_allocated {
            return Err(NonceError::Unallocated(slot));
        }
        match &self.entries[self.position(slot)] {
            Some(entry) if entry.slot == slot && entry.consumed => Err(NonceError::Consumed(slot)),
            Some(entry) if entry.slot == slot => Ok(entry.seed),
            _ => Err(NonceError::Overwritten(slot)),
        }
    }

    /// Mark a slot as used. The seed is wiped; the slot stays recorded so a
    /// second attempt reports `Consumed` rather than `Overwritten`.
    pub fn consume(&mut self, slot: u64) -> Result<(), NonceError> {
        self.seed(slot)?;
        let pos = self.position(slot);
        if let Some(entry) = self.entries[pos].as_mut() {
            entry.seed = [0u8; 32];
            entry.consumed = true;
        }
        Ok(())
    }
}

impl std::fmt::Debug for NoncePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoncePool")
            .field("last_allocated", &self.last_allocated)
            .field("capacity", &self.entries.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn slots_are_strictly_increasing() {
        let mut pool = NoncePool::new(4);
        let a = pool.allocate(&mut OsRng);
        let b = pool.allocate(&mut OsRng);
        assert_eq!((a, b), (1, 2));
        assert_ne!(pool.seed(a).unwrap(), pool.seed(b).unwrap());
    }

    #[test]
    fn consumed_slot_cannot_sign_again() {
        let mut pool = NoncePool::new(4);
        let slot = pool.allocate(&mut OsRng);
        pool.consume(slot).unwrap();
        assert_eq!(pool.seed(slot), Err(NonceError::Consumed(slot)));
        assert_eq!(pool.consume(slot), Err(NonceError::Consumed(slot)));
    }

    #[test]
    fn wrapped_slot_is_overwritten() {
        let mut pool = NoncePool::new(2);
        let first = pool.allocate(&mut OsRng);
        pool.allocate(&mut OsRng);
        pool.allocate(&mut OsRng);
        assert_eq!(pool.seed(first), Err(NonceError::Overwritten(first)));
    }

    #[test]
    fn unallocated_slots_are_rejected() {
        let pool = NoncePool::new(2);
        assert_eq!(pool.seed(0), Err(NonceError::Unallocated(0)));
        assert_eq!(pool.seed(7), Err(NonceError::Unallocated(7)));
    }

    #[test]
    fn pool_survives_serialization() {
        let mut pool = NoncePool::new(8);
        let slot = pool.allocate(&mut OsRng);
        let seed = pool.seed(slot).unwrap();
        let bytes = bincode::serialize(&pool).unwrap();
        let restored: NoncePool = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.seed(slot).unwrap(), seed);
        assert_eq!(restored.last_allocated(), slot);
    }

    #[test]
    fn empty_or_shuffled_ring_fails_the_check() {
        let bytes = bincode::serialize(&(3u64, Vec::<u8>::new())).unwrap();
        let empty: NoncePool = bincode::deserialize(&bytes).unwrap();
        assert_eq!(empty.capacity(), 0);
        assert_eq!(empty.check(), Err(NonceError::EmptyRing));

        let mut pool = NoncePool::new(3);
        let slot = pool.allocate(&mut OsRng);
        assert_eq!(pool.check(), Ok(()));
        pool.entries.rotate_left(1);
        assert_eq!(pool.check(), Err(NonceError::Misplaced(slot)));
    }

    #[test]
    fn debug_hides_seeds() {
        let mut pool = NoncePool::new(2);
        let slot = pool.allocate(&mut OsRng);
        let seed = hex::encode(pool.seed(slot).unwrap());
        assert!(!format!("{pool:?}").contains(&seed));
    }
}
