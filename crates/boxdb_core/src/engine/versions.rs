//! In-memory version chains.

use std::collections::{BTreeMap, BTreeSet};

use crate::segment::RecordLocation;
use crate::types::RecordKey;

/// One committed version of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Commit that wrote the version.
    pub seq: u64,
    /// Where the bytes live; `None` for a deletion.
    pub location: Option<RecordLocation>,
}

/// Maps every record key to its versions, oldest first.
///
/// A snapshot at sequence `s` sees the newest version with `seq <= s`.
/// Chains are shortened by [`VersionIndex::prune`] once the oldest active
/// snapshot has moved past them.
#[derive(Debug, Default)]
pub struct VersionIndex {
    chains: BTreeMap<RecordKey, Vec<Version>>,
    prunable: BTreeSet<RecordKey>,
}

impl VersionIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a version. Versions of a key must arrive in commit order.
    pub fn push(&mut self, key: RecordKey, version: Version) {
        let chain = self.chains.entry(key).or_default();
        chain.push(version);
        if chain.len() > 1 || version.location.is_none() {
            self.prunable.insert(key);
        }
    }

    /// Location of the version visible at `snapshot`.
    #[must_use]
    pub fn visible(&self, key: &RecordKey, snapshot: u64) -> Option<RecordLocation> {
        Self::visible_in(self.chains.get(key)?, snapshot)
    }

    fn visible_in(chain: &[Version], snapshot: u64) -> Option<RecordLocation> {
        chain.iter().rev().find(|v| v.seq <= snapshot)?.location
    }

    /// Location of the newest committed version.
    #[must_use]
    pub fn latest(&self, key: &RecordKey) -> Option<RecordLocation> {
        self.chains.get(key)?.last()?.location
    }

    /// Keys of a table in `[from, to]` order visible at `snapshot`.
    pub fn visible_keys(
        &self,
        from: RecordKey,
        to: RecordKey,
        snapshot: u64,
    ) -> impl Iterator<Item = (RecordKey, RecordLocation)> + '_ {
        self.chains
            .range(from..=to)
            .filter_map(move |(key, chain)| Some((*key, Self::visible_in(chain, snapshot)?)))
    }

    /// Newest committed versions of every live record.
    pub fn latest_entries(&self) -> impl Iterator<Item = (RecordKey, RecordLocation)> + '_ {
        self.chains
            .iter()
            .filter_map(|(key, chain)| Some((*key, chain.last()?.location?)))
    }

    /// Drops versions no snapshot at or above `watermark` can see.
    pub fn prune(&mut self, watermark: u64) {
        let mut settled = Vec::new();
        for key in &self.prunable {
            let Some(chain) = self.chains.get_mut(key) else {
                settled.push(*key);
                continue;
            };
            if let Some(pos) = chain.iter().rposition(|v| v.seq <= watermark) {
                chain.drain(..pos);
            }
            match chain.as_slice() {
                [only] if only.location.is_none() && only.seq <= watermark => {
                    self.chains.remove(key);
                    settled.push(*key);
                }
                [only] if only.location.is_some() => settled.push(*key),
                _ => {}
            }
        }
        for key in settled {
            self.prunable.remove(&key);
        }
    }

}
