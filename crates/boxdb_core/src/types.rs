//! Core type definitions for boxdb.

use std::fmt;

/// Unique identifier for a write transaction in the WAL.
///
/// Transaction IDs are monotonically increasing and never reused within
/// one store lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Commit sequence number.
///
/// Every committed write transaction gets the next sequence number; read
/// snapshots are identified by the sequence they observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// A keyspace inside the store.
///
/// Objects of one entity live in their own table; each standalone relation
/// has a forward table (source to target) and a backlink table (target to
/// source) that are always written together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableId {
    /// Objects of an entity.
    Objects(u32),
    /// Standalone relation, keyed by source then target.
    Relation(u32),
    /// Standalone relation, keyed by target then source.
    Backlink(u32),
}

impl TableId {
    /// Splits into the on-disk `(kind, schema id)` pair.
    #[must_use]
    pub const fn to_parts(self) -> (u8, u32) {
        match self {
            Self::Objects(id) => (1, id),
            Self::Relation(id) => (2, id),
            Self::Backlink(id) => (3, id),
        }
    }

    /// Rebuilds a table ID from its on-disk pair.
    #[must_use]
    pub const fn from_parts(kind: u8, id: u32) -> Option<Self> {
        match kind {
            1 => Some(Self::Objects(id)),
            2 => Some(Self::Relation(id)),
            3 => Some(Self::Backlink(id)),
            _ => None,
        }
    }

    /// Entity or relation ID this table belongs to.
    #[must_use]
    pub const fn schema_id(self) -> u32 {
        match self {
            Self::Objects(id) | Self::Relation(id) | Self::Backlink(id) => id,
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Objects(id) => write!(f, "entity:{id}"),
            Self::Relation(id) => write!(f, "rel:{id}"),
            Self::Backlink(id) => write!(f, "backlink:{id}"),
        }
    }
}

/// Address of one stored record.
///
/// Objects use `(Objects(entity), object id, 0)`; relation rows use
/// `(Relation(rel), source, target)` and `(Backlink(rel), target, source)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    /// Keyspace.
    pub table: TableId,
    /// Object ID, or the first relation endpoint.
    pub primary: u64,
    /// Zero for objects, the second relation endpoint otherwise.
    pub secondary: u64,
}

impl RecordKey {
    /// Key of an object.
    #[must_use]
    pub const fn object(entity: u32, id: u64) -> Self {
        Self {
            table: TableId::Objects(entity),
            primary: id,
            secondary: 0,
        }
    }

    /// Forward row of a standalone relation.
    #[must_use]
    pub const fn relation(relation: u32, source: u64, target: u64) -> Self {
        Self {
            table: TableId::Relation(relation),
            primary: source,
            secondary: target,
        }
    }

    /// Backlink row of a standalone relation.
    #[must_use]
    pub const fn backlink(relation: u32, target: u64, source: u64) -> Self {
        Self {
            table: TableId::Backlink(relation),
            primary: target,
            secondary: source,
        }
    }

    /// First key of a table.
    #[must_use]
    pub const fn table_start(table: TableId) -> Self {
        Self {
            table,
            primary: 0,
            secondary: 0,
        }
    }

    /// Last key of a table.
    #[must_use]
    pub const fn table_end(table: TableId) -> Self {
        Self {
            table,
            primary: u64::MAX,
            secondary: u64::MAX,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.table {
            TableId::Objects(_) => write!(f, "{}/{}", self.table, self.primary),
            _ => write!(f, "{}/{}/{}", self.table, self.primary, self.secondary),
        }
    }
}
