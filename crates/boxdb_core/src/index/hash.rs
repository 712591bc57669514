//! Hash index.

use std::collections::HashMap;
use std::ops::Bound;

use crate::index::traits::{Index, IndexKey};

/// Equality-only index for `INDEX_HASH` / `INDEX_HASH64` properties.
///
/// Keys are hashes, so hits can be false positives; callers verify every
/// candidate anyway.
#[derive(Default)]
pub struct HashIndex {
    entries: HashMap<IndexKey, HashMap<u64, Option<u64>>>,
    retired: Vec<(IndexKey, u64, u64)>,
    count: usize,
}

impl HashIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Index for HashIndex {
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
        let mut ids: Vec<u64> = self
            .entries
            .get(key)
            .map(|ids| ids.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    fn range(&self, _lower: Bound<&IndexKey>, _upper: Bound<&IndexKey>) -> Option<Vec<u64>> {
        None
    }

    fn prune(&mut self, watermark: u64) {
        let (ready, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retired)
            .into_iter()
            .partition(|(_, _, end)| *end <= watermark);
        self.retired = keep;
        for (key, id, end) in ready {
            let Some(ids) = self.entries.get_mut(&key) else {
                continue;
            };
            if ids.get(&id) == Some(&Some(end)) {
                ids.remove(&id);
                self.count -= 1;
                if ids.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.count
    }
}
