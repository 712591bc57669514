//! Schema element types: property types, flags and the model tree.

use std::fmt;
use std::ops::BitOr;

/// Numeric ID of an entity, property, index or relation.
pub type SchemaId = u32;

/// Globally unique identifier of a schema element across model versions.
pub type Uid = u64;

/// An ID paired with its UID, as used by the "last ID" watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdUid {
    /// Numeric ID.
    pub id: SchemaId,
    /// Unique identifier.
    pub uid: Uid,
}

impl IdUid {
    /// Creates a pair.
    #[must_use]
    pub const fn new(id: SchemaId, uid: Uid) -> Self {
        Self { id, uid }
    }

    /// Returns true when the pair was never set.
    #[must_use]
    pub const fn is_unset(self) -> bool {
        self.id == 0 && self.uid == 0
    }
}

impl fmt::Display for IdUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.uid)
    }
}

/// Value type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyType {
    /// Boolean.
    Bool = 1,
    /// 8-bit integer.
    Byte = 2,
    /// 16-bit integer.
    Short = 3,
    /// 16-bit character.
    Char = 4,
    /// 32-bit integer.
    Int = 5,
    /// 64-bit integer.
    Long = 6,
    /// 32-bit float.
    Float = 7,
    /// 64-bit float.
    Double = 8,
    /// UTF-8 string.
    String = 9,
    /// Milliseconds since the unix epoch.
    Date = 10,
    /// To-one relation holding the target object ID.
    Relation = 11,
    /// Nanoseconds since the unix epoch.
    DateNano = 12,
    /// Any CBOR value.
    Flex = 13,
    /// Vector of booleans.
    BoolVector = 22,
    /// Byte string.
    ByteVector = 23,
    /// Vector of 16-bit integers.
    ShortVector = 24,
    /// Vector of 16-bit characters.
    CharVector = 25,
    /// Vector of 32-bit integers.
    IntVector = 26,
    /// Vector of 64-bit integers.
    LongVector = 27,
    /// Vector of 32-bit floats.
    FloatVector = 28,
    /// Vector of 64-bit floats.
    DoubleVector = 29,
    /// Vector of strings.
    StringVector = 30,
    /// Vector of millisecond dates.
    DateVector = 31,
    /// Vector of nanosecond dates.
    DateNanoVector = 32,
}

impl PropertyType {
    /// Converts a numeric code to a type.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Bool,
            2 => Self::Byte,
            3 => Self::Short,
            4 => Self::Char,
            5 => Self::Int,
            6 => Self::Long,
            7 => Self::Float,
            8 => Self::Double,
            9 => Self::String,
            10 => Self::Date,
            11 => Self::Relation,
            12 => Self::DateNano,
            13 => Self::Flex,
            22 => Self::BoolVector,
            23 => Self::ByteVector,
            24 => Self::ShortVector,
            25 => Self::CharVector,
            26 => Self::IntVector,
            27 => Self::LongVector,
            28 => Self::FloatVector,
            29 => Self::DoubleVector,
            30 => Self::StringVector,
            31 => Self::DateVector,
            32 => Self::DateNanoVector,
            _ => return None,
        })
    }

    /// Numeric code of the type.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Scalar types stored as CBOR integers.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Bool
                | Self::Byte
                | Self::Short
                | Self::Char
                | Self::Int
                | Self::Long
                | Self::Date
                | Self::Relation
                | Self::DateNano
        )
    }

    /// Scalar floating point types.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    /// Integer or floating point scalar.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float()
    }

    /// Any of the vector types.
    #[must_use]
    pub const fn is_vector(self) -> bool {
        self as u8 >= 22
    }

    /// Short name used in descriptions and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "Bool",
            Self::Byte => "Byte",
            Self::Short => "Short",
            Self::Char => "Char",
            Self::Int => "Int",
            Self::Long => "Long",
            Self::Float => "Float",
            Self::Double => "Double",
            Self::String => "String",
            Self::Date => "Date",
            Self::Relation => "Relation",
            Self::DateNano => "DateNano",
            Self::Flex => "Flex",
            Self::BoolVector => "BoolVector",
            Self::ByteVector => "ByteVector",
            Self::ShortVector => "ShortVector",
            Self::CharVector => "CharVector",
            Self::IntVector => "IntVector",
            Self::LongVector => "LongVector",
            Self::FloatVector => "FloatVector",
            Self::DoubleVector => "DoubleVector",
            Self::StringVector => "StringVector",
            Self::DateVector => "DateVector",
            Self::DateNanoVector => "DateNanoVector",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Behavior flags of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PropertyFlags(u32);

impl PropertyFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// The object ID.
    pub const ID: Self = Self(1);
    /// Nullable wrapper type in the host language.
    pub const NON_PRIMITIVE_TYPE: Self = Self(2);
    /// Puts without a value are rejected.
    pub const NOT_NULL: Self = Self(4);
    /// Value index.
    pub const INDEXED: Self = Self(8);
    /// Unique index.
    pub const UNIQUE: Self = Self(32);
    /// IDs are never reused.
    pub const ID_MONOTONIC_SEQUENCE: Self = Self(64);
    /// Callers may choose object IDs.
    pub const ID_SELF_ASSIGNABLE: Self = Self(128);
    /// Null values are left out of the index.
    pub const INDEX_PARTIAL_SKIP_NULL: Self = Self(256);
    /// Zero values are left out of the index.
    pub const INDEX_PARTIAL_SKIP_ZERO: Self = Self(512);
    /// No dedicated field in the host language type.
    pub const VIRTUAL: Self = Self(1024);
    /// Hash index (equality lookups only).
    pub const INDEX_HASH: Self = Self(2048);
    /// 64-bit hash index (equality lookups only).
    pub const INDEX_HASH64: Self = Self(4096);
    /// Integer values are unsigned.
    pub const UNSIGNED: Self = Self(8192);
    /// Companion of the ID property.
    pub const ID_COMPANION: Self = Self(16384);
    /// A put replaces the object holding a conflicting unique value.
    pub const UNIQUE_ON_CONFLICT_REPLACE: Self = Self(32768);

    /// Creates flags from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true when every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true when any flag in `other` is set.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// The property has some kind of index.
    #[must_use]
    pub const fn is_indexed(self) -> bool {
        self.intersects(Self(
            Self::INDEXED.0 | Self::UNIQUE.0 | Self::INDEX_HASH.0 | Self::INDEX_HASH64.0,
        ))
    }

    /// The index only supports equality lookups.
    #[must_use]
    pub const fn is_hash_indexed(self) -> bool {
        self.intersects(Self(Self::INDEX_HASH.0 | Self::INDEX_HASH64.0))
    }
}

impl BitOr for PropertyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Behavior flags of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EntityFlags(u32);

impl EntityFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Objects are meant to be synchronized by an external sync layer.
    pub const SYNC_ENABLED: Self = Self(2);
    /// Object IDs are global across sync peers.
    pub const SHARED_GLOBAL_IDS: Self = Self(4);

    /// Creates flags from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true when every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EntityFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A typed field of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    /// Property ID, unique within its entity.
    pub id: SchemaId,
    /// Property UID.
    pub uid: Uid,
    /// Name, unique within its entity.
    pub name: String,
    /// Value type.
    pub ptype: PropertyType,
    /// Flags.
    pub flags: PropertyFlags,
    /// Index ID when the property is indexed.
    pub index: Option<IdUid>,
    /// Target entity of a to-one relation property.
    pub target_entity: Option<SchemaId>,
}

impl Property {
    /// Returns true for the object ID property.
    #[must_use]
    pub fn is_id(&self) -> bool {
        self.flags.contains(PropertyFlags::ID)
    }

    /// Returns true when integer values are unsigned.
    #[must_use]
    pub fn is_unsigned(&self) -> bool {
        self.flags.contains(PropertyFlags::UNSIGNED) || self.is_id() || self.ptype == PropertyType::Relation
    }
}

/// A standalone many-to-many relation owned by its source entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    /// Relation ID, unique within the model.
    pub id: SchemaId,
    /// Relation UID.
    pub uid: Uid,
    /// Target entity.
    pub target: IdUid,
}

/// A schema-defined object type.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    /// Entity ID.
    pub id: SchemaId,
    /// Entity UID.
    pub uid: Uid,
    /// Name, unique within the model.
    pub name: String,
    /// Flags.
    pub flags: EntityFlags,
    /// Properties in declaration order.
    pub properties: Vec<Property>,
    /// Standalone relations with this entity as source.
    pub relations: Vec<Relation>,
    /// Highest property ID ever used by this entity.
    pub last_property: IdUid,
}

impl Entity {
    /// Looks up a property by ID.
    #[must_use]
    pub fn property(&self, id: SchemaId) -> Option<&Property> {
        self.properties.iter().find(|p| p.id == id)
    }

    /// Looks up a property by name.
    #[must_use]
    pub fn property_by_name(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// The ID property. Every built model has exactly one.
    #[must_use]
    pub fn id_property(&self) -> Option<&Property> {
        self.properties.iter().find(|p| p.is_id())
    }

    /// Properties carrying a unique index.
    pub fn unique_properties(&self) -> impl Iterator<Item = &Property> {
        self.properties
            .iter()
            .filter(|p| p.flags.contains(PropertyFlags::UNIQUE))
    }
}

/// An immutable, validated schema.
///
/// Built with [`crate::ModelBuilder`] and consumed when a store opens.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Model {
    /// Entities in declaration order.
    pub entities: Vec<Entity>,
    /// Highest entity ID ever used.
    pub last_entity: IdUid,
    /// Highest index ID ever used.
    pub last_index: IdUid,
    /// Highest relation ID ever used.
    pub last_relation: IdUid,
}

impl Model {
    /// Looks up an entity by ID.
    #[must_use]
    pub fn entity(&self, id: SchemaId) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    /// Looks up an entity by name.
    #[must_use]
    pub fn entity_by_name(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// ID of the entity with the given name.
    #[must_use]
    pub fn entity_id(&self, name: &str) -> Option<SchemaId> {
        self.entity_by_name(name).map(|e| e.id)
    }

    /// ID of a property of an entity.
    #[must_use]
    pub fn property_id(&self, entity: SchemaId, name: &str) -> Option<SchemaId> {
        self.entity(entity)?.property_by_name(name).map(|p| p.id)
    }

    /// Looks up a standalone relation and its source entity.
    #[must_use]
    pub fn relation(&self, id: SchemaId) -> Option<(&Entity, &Relation)> {
        self.entities
            .iter()
            .find_map(|e| e.relations.iter().find(|r| r.id == id).map(|r| (e, r)))
    }
}
