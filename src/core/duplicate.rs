// Duplicate detection for the migration pass:
// - exact duplicates (same fingerprint)
// - near duplicates (Hamming distance within a caller threshold)
// The index is append-only and keeps first-seen ownership of a fingerprint.

use crate::core::hash::{DHash, HashError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateRelation {
    pub original: String,
    pub original_index: usize,
    pub duplicate: String,
    pub duplicate_index: usize,
    pub distance: u32,
}

impl DuplicateRelation {
    pub fn is_exact(&self) -> bool {
        self.distance == 0
    }
}

/// Where an incoming fingerprint matched an earlier entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateMatch {
    pub name: String,
    pub index: usize,
    pub distance: u32,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    hash: DHash,
    name: String,
    index: usize,
}

/// Insertion-ordered map from fingerprint to first-seen component.
#[derive(Debug, Default)]
pub struct DuplicateIndex {
    entries: Vec<IndexEntry>,
    exact: HashMap<DHash, usize>,
}

impl DuplicateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up `hash` against everything inserted so far.
    ///
    /// An exact match wins. Otherwise the entries are scanned in insertion
    /// order and the first one within `threshold` is returned, even if a
    /// closer one was inserted later.
    pub fn find(&self, hash: &DHash, threshold: u32) -> Result<Option<DuplicateMatch>, HashError> {
        if let Some(&slot) = self.exact.get(hash) {
            let entry = &self.entries[slot];
            return Ok(Some(DuplicateMatch {
                name: entry.name.clone(),
                index: entry.index,
                distance: 0,
            }));
        }

        for entry in &self.entries {
            let distance = entry.hash.distance(hash)?;
            if distance > 0 && distance <= threshold {
                return Ok(Some(DuplicateMatch {
                    name: entry.name.clone(),
                    index: entry.index,
                    distance,
                }));
            }
        }

        Ok(None)
    }

    /// Record a fingerprint. Re-inserting a known fingerprint keeps the
    /// original owner.
    pub fn insert(&mut self, hash: DHash, name: &str, index: usize) {
        if self.exact.contains_key(&hash) {
            return;
        }
        self.exact.insert(hash.clone(), self.entries.len());
        self.entries.push(IndexEntry {
            hash,
            name: name.to_string(),
            index,
        });
    }

    /// Find, then insert; returns the relation if `hash` duplicates an
    /// earlier entry.
    pub fn observe(
        &mut self,
        hash: DHash,
        name: &str,
        index: usize,
        threshold: u32,
    ) -> Result<Option<DuplicateRelation>, HashError> {
        let found = self.find(&hash, threshold)?;
        self.insert(hash, name, index);

        Ok(found.map(|m| DuplicateRelation {
            original: m.name,
            original_index: m.index,
            duplicate: name.to_string(),
            duplicate_index: index,
            distance: m.distance,
        }))
    }

    /// Owner of an exact fingerprint, if any.
    pub fn owner(&self, hash: &DHash) -> Option<&str> {
        self.exact
            .get(hash)
            .map(|&slot| self.entries[slot].name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(hex: &str) -> DHash {
        hex.parse().unwrap()
    }

    #[test]
    fn test_exact_match_reports_first_seen() {
        let mut index = DuplicateIndex::new();
        assert!(index
            .observe(hash("00000000000000ff"), "a", 0, 5)
            .unwrap()
            .is_none());

        let relation = index
            .observe(hash("00000000000000ff"), "b", 1, 5)
            .unwrap()
            .unwrap();
        assert_eq!(relation.original, "a");
        assert_eq!(relation.duplicate, "b");
        assert_eq!(relation.distance, 0);
        assert!(relation.is_exact());

        // third copy still points at the first owner
        let relation = index
            .observe(hash("00000000000000ff"), "c", 2, 5)
            .unwrap()
            .unwrap();
        assert_eq!(relation.original, "a");
        assert_eq!(index.len(), 1);
        assert_eq!(index.owner(&hash("00000000000000ff")), Some("a"));
    }

    #[test]
    fn test_near_match_is_first_found_not_closest() {
        let mut index = DuplicateIndex::new();
        index.insert(hash("0000000000000007"), "three-bits", 0);
        index.insert(hash("0000000000000001"), "one-bit", 1);

        let found = index.find(&hash("0000000000000000"), 5).unwrap().unwrap();
        assert_eq!(found.name, "three-bits");
        assert_eq!(found.distance, 3);
    }

    #[test]
    fn test_exact_match_beats_earlier_near_match() {
        let mut index = DuplicateIndex::new();
        index.insert(hash("0000000000000001"), "near", 0);
        index.insert(hash("0000000000000000"), "exact", 1);

        let found = index.find(&hash("0000000000000000"), 5).unwrap().unwrap();
        assert_eq!(found.name, "exact");
        assert_eq!(found.distance, 0);
    }

    #[test]
    fn test_threshold_bounds_near_match() {
        let mut index = DuplicateIndex::new();
        index.insert(hash("000000000000000f"), "a", 0);

        assert!(index.find(&hash("0000000000000000"), 3).unwrap().is_none());
        assert_eq!(
            index
                .find(&hash("0000000000000000"), 4)
                .unwrap()
                .unwrap()
                .distance,
            4
        );
    }

    #[test]
    fn test_length_mismatch_propagates() {
        let mut index = DuplicateIndex::new();
        index.insert(hash("0000000000000000"), "a", 0);

        let result = index.find(&hash("00000000"), 5);
        assert!(matches!(result, Err(HashError::LengthMismatch { .. })));
    }
}
