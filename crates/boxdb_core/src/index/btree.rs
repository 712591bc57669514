//! Ordered index.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::index::traits::{Index, IndexKey};

/// BTree-based index for equality and range lookups.
///
/// Each key maps object IDs to the commit that retired the entry, `None`
/// while the entry is current.
#[derive(Default)]
pub struct BTreeIndex {
    entries: BTreeMap<IndexKey, BTreeMap<u64, Option<u64>>>,
    retired: Vec<(IndexKey, u64, u64)>,
    count: usize,
}

impl BTreeIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Index for BTreeIndex {
    fn insert(&mut self, key: IndexKey, id: u64) {
        if self.entries.entry(key).or_default().insert(id, None).is_none() {
            self.count += 1;
        }
    }

    fn retire(&mut self, key: &IndexKey, id: u64, end_seq: u64) {
        if let Some(slot) = self.entries.get_mut(key).and_then(|ids| ids.get_mut(&id)) {
            if slot.is_none() {
                *slot = Some(end_seq);
                self.retired.push((key.clone(), id, end_seq));
            }
        }
    }

    fn lookup(&self, key: &IndexKey) -> Vec<u64> {
        self.entries
            .get(key)
            .map(|ids| ids.keys().copied().collect())
            .unwrap_or_default()
    }

    fn range(&self, lower: Bound<&IndexKey>, upper: Bound<&IndexKey>) -> Option<Vec<u64>> {
        if let (Bound::Included(l) | Bound::Excluded(l), Bound::Included(u) | Bound::Excluded(u)) =
            (lower, upper)
        {
            let open_end = matches!(lower, Bound::Excluded(_)) || matches!(upper, Bound::Excluded(_));
            if l > u || (l == u && open_end) {
                return Some(Vec::new());
            }
        }
        Some(
            self.entries
                .range((lower, upper))
                .flat_map(|(_, ids)| ids.keys().copied())
                .collect(),
        )
    }

    fn prune(&mut self, watermark: u64) {
        let mut keep = Vec::new();
        for (key, id, end) in std::mem::take(&mut self.retired) {
            if end > watermark {
                keep.push((key, id, end));
                continue;
            }
            let Some(ids) = self.entries.get_mut(&key) else {
                continue;
            };
            // re-inserted since: the entry is current again
            if ids.get(&id) == Some(&Some(end)) {
                ids.remove(&id);
                self.count -= 1;
                if ids.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
        self.retired = keep;
    }

    fn len(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> BTreeIndex {
        BTreeIndex::new()
    }

    #[test]
    fn lookup_and_range() {
        let mut idx = index();
        for (age, id) in [(20, 1), (30, 2), (30, 3), (40, 4)] {
            idx.insert(IndexKey::Int(age), id);
        }
        assert_eq!(idx.lookup(&IndexKey::Int(30)), vec![2, 3]);
        let mut hits = idx
            .range(Bound::Excluded(&IndexKey::Int(20)), Bound::Included(&IndexKey::Int(40)))
            .unwrap();
        hits.sort_unstable();
        assert_eq!(hits, vec![2, 3, 4]);
        assert_eq!(idx.entries.keys().next(), Some(&IndexKey::Int(20)));
        assert_eq!(idx.len(), 4);
    }

    #[test]
    fn inverted_range_is_empty() {
        let mut idx = index();
        idx.insert(IndexKey::Int(5), 1);
        let hits = idx
            .range(Bound::Included(&IndexKey::Int(9)), Bound::Included(&IndexKey::Int(1)))
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn retired_entries_survive_until_watermark() {
        let mut idx = index();
        idx.insert(IndexKey::Int(1), 7);
        idx.retire(&IndexKey::Int(1), 7, 5);
        idx.prune(4);
        assert_eq!(idx.lookup(&IndexKey::Int(1)), vec![7]);
        idx.prune(5);
        assert!(idx.lookup(&IndexKey::Int(1)).is_empty());
        assert!(idx.is_empty());
    }

    #[test]
    fn reinsert_cancels_retirement() {
        let mut idx = index();
        idx.insert(IndexKey::Int(1), 7);
        idx.retire(&IndexKey::Int(1), 7, 3);
        idx.insert(IndexKey::Int(1), 7);
        idx.prune(10);
        assert_eq!(idx.lookup(&IndexKey::Int(1)), vec![7]);
        assert_eq!(idx.len(), 1);
    }
}
