//! Hash-chained log of contributions submitted while offline
//!
//! ```text
//! GENESIS ◄── entry 1 ◄── entry 2 ◄── ... ◄── head
//!
//! entry_hash = H(payload ∥ proof ∥ sequence ∥ timestamp)
//! chain_hash = H(entry_hash ∥ previous_hash)
//! ```
//!
//! Every entry binds to its predecessor, so deleting, reordering or editing
//! any entry breaks the chain at that sequence number.

use serde::{Deserialize, Serialize};
use sovereign_core::{ChainHash, SovereignError, Timestamp};
use sovereign_crypto::{IncrementalHasher, Proof};

const ENTRY_DOMAIN: &str = "sovereign.island.entry.v1";
const CHAIN_DOMAIN: &str = "sovereign.island.chain.v1";

/// One queued contribution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IslandLogEntry {
    /// Position in the log, starting at 1
    pub sequence: u64,
    pub timestamp: Timestamp,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub proof: Proof,
    /// Chain hash of the preceding entry, or `GENESIS`
    pub previous_hash: ChainHash,
    pub entry_hash: [u8; 32],
    pub chain_hash: ChainHash,
}

impl IslandLogEntry {
    fn compute_entry_hash(
        payload: &[u8],
        proof: &Proof,
        sequence: u64,
        timestamp: Timestamp,
    ) -> [u8; 32] {
        IncrementalHasher::with_domain(ENTRY_DOMAIN)
            .update_framed(payload)
            .update_framed(proof.as_bytes())
            .update_u64(sequence)
            .update_i64(timestamp)
            .finalize()
    }

    fn compute_chain_hash(entry_hash: &[u8; 32], previous: &ChainHash) -> ChainHash {
        let hash = IncrementalHasher::with_domain(CHAIN_DOMAIN)
            .update(entry_hash)
            .update(previous.as_bytes())
            .finalize();
        ChainHash::new(hash)
    }

    /// Whether both stored hashes match the entry's content and `previous`
    pub fn is_consistent(&self, previous: &ChainHash) -> bool {
        let entry_hash =
            Self::compute_entry_hash(&self.payload, &self.proof, self.sequence, self.timestamp);
        entry_hash == self.entry_hash
            && self.previous_hash == *previous
            && Self::compute_chain_hash(&entry_hash, previous) == self.chain_hash
    }
}

/// Append-only hash chain
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IslandLog {
    entries: Vec<IslandLogEntry>,
    head: ChainHash,
}

impl IslandLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a contribution and return the new entry
    pub fn append(&mut self, payload: Vec<u8>, proof: Proof, timestamp: Timestamp) -> &IslandLogEntry {
        let sequence = self.next_sequence();
        let previous_hash = self.head;
        let entry_hash = IslandLogEntry::compute_entry_hash(&payload, &proof, sequence, timestamp);
        let chain_hash = IslandLogEntry::compute_chain_hash(&entry_hash, &previous_hash);

        self.entries.push(IslandLogEntry {
            sequence,
            timestamp,
            payload,
            proof,
            previous_hash,
            entry_hash,
            chain_hash,
        });
        self.head = chain_hash;
        &self.entries[self.entries.len() - 1]
    }

    /// Drop the most recent entry, restoring the previous head
    pub(crate) fn pop(&mut self) -> Option<IslandLogEntry> {
        let entry = self.entries.pop()?;
        self.head = entry.previous_hash;
        Some(entry)
    }

    /// Walk the chain from genesis, recomputing every hash.
    ///
    /// Fails on the first entry that does not match with
    /// `ChainIntegrityViolation` carrying its expected sequence number.
    pub fn verify(&self) -> Result<(), SovereignError> {
        let mut previous = ChainHash::GENESIS;
        for (index, entry) in self.entries.iter().enumerate() {
            let expected = index as u64 + 1;
            if entry.sequence != expected || !entry.is_consistent(&previous) {
                return Err(SovereignError::ChainIntegrityViolation { sequence: expected });
            }
            previous = entry.chain_hash;
        }
        if previous != self.head {
            return Err(SovereignError::ChainIntegrityViolation {
                sequence: self.next_sequence(),
            });
        }
        Ok(())
    }

    pub fn entries(&self) -> &[IslandLogEntry] {
        &self.entries
    }

    /// Chain hash of the last entry, `GENESIS` when empty
    pub fn head(&self) -> ChainHash {
        self.head
    }

    pub fn next_sequence(&self) -> u64 {
        self.entries.len() as u64 + 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry and reset the head to genesis
    pub fn clear(&mut self) {
        self.entries.clear();
        self.head = ChainHash::GENESIS;
    }

    #[cfg(test)]
    pub(crate) fn entries_mut(&mut self) -> &mut Vec<IslandLogEntry> {
        &mut self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(n: u8) -> IslandLog {
        let mut log = IslandLog::new();
        for i in 1..=n {
            log.append(vec![i; 4], Proof::from_bytes(vec![i]), 1_000 + i as i64);
        }
        log
    }

    #[test]
    fn test_empty_log_is_genesis() {
        let log = IslandLog::new();
        assert!(log.head().is_genesis());
        assert_eq!(log.next_sequence(), 1);
        assert!(log.verify().is_ok());
    }

    #[test]
    fn test_append_links_entries() {
        let log = log_with(3);
        let entries = log.entries();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].sequence, 1);
        assert!(entries[0].previous_hash.is_genesis());
        assert_eq!(entries[1].previous_hash, entries[0].chain_hash);
        assert_eq!(entries[2].previous_hash, entries[1].chain_hash);
        assert_eq!(log.head(), entries[2].chain_hash);
        assert!(log.verify().is_ok());
    }

    #[test]
    fn test_modified_payload_detected() {
        let mut log = log_with(3);
        log.entries_mut()[1].payload[0] ^= 0xFF;

        assert_eq!(
            log.verify(),
            Err(SovereignError::ChainIntegrityViolation { sequence: 2 })
        );
    }

    #[test]
    fn test_deleted_entry_detected() {
        let mut log = log_with(4);
        log.entries_mut().remove(1);

        assert_eq!(
            log.verify(),
            Err(SovereignError::ChainIntegrityViolation { sequence: 2 })
        );
    }

    #[test]
    fn test_reordered_entries_detected() {
        let mut log = log_with(3);
        log.entries_mut().swap(0, 1);

        assert_eq!(
            log.verify(),
            Err(SovereignError::ChainIntegrityViolation { sequence: 1 })
        );
    }

    #[test]
    fn test_truncated_tail_detected() {
        let mut log = log_with(3);
        log.entries_mut().pop();

        // The remaining prefix is consistent but no longer reaches the head
        assert_eq!(
            log.verify(),
            Err(SovereignError::ChainIntegrityViolation { sequence: 3 })
        );
    }

    #[test]
    fn test_pop_restores_head() {
        let mut log = log_with(2);
        let first_head = log.entries()[0].chain_hash;

        log.pop();
        assert_eq!(log.head(), first_head);
        assert!(log.verify().is_ok());

        log.clear();
        assert!(log.head().is_genesis());
        assert!(log.is_empty());
    }

    #[test]
    fn test_hashes_depend_on_timestamp() {
        let mut a = IslandLog::new();
        let mut b = IslandLog::new();
        a.append(vec![1], Proof::default(), 10);
        b.append(vec![1], Proof::default(), 11);
        assert_ne!(a.head(), b.head());
    }
}
