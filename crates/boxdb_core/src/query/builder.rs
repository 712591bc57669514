//! Query builder.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::model::{Property, PropertyType, SchemaId};
use crate::query::compiled::Query;
use crate::query::condition::{Expr, Leaf, Op, Operand};
use crate::query::executor::{LinkKind, Plan};
use crate::query::order::{OrderBy, OrderFlags};
use crate::store::StoreShared;

static NEXT_BUILDER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle of a condition added to a [`QueryBuilder`].
///
/// A handle is consumed when passed to [`QueryBuilder::all`] or
/// [`QueryBuilder::any`]; passing it again is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConditionId {
    builder: u64,
    index: usize,
}

/// Collects conditions for one entity and builds a [`Query`].
///
/// The first failing call is remembered: every later call fails with
/// [`CoreError::IllegalState`] and [`QueryBuilder::build`] returns the
/// original error. Conditions that are not combined with `all` or `any`
/// are joined with AND.
///
/// Link builders returned by the `link_*`/`backlink_*` methods add
/// conditions on related objects; a parent object matches if at least one
/// related object matches the link's conditions.
pub struct QueryBuilder {
    store: Arc<StoreShared>,
    entity: SchemaId,
    id: u64,
    slots: Vec<Option<Expr>>,
    last_leaf: Option<usize>,
    orders: Vec<OrderBy>,
    links: Vec<(LinkKind, QueryBuilder)>,
    is_link: bool,
    error: Option<CoreError>,
    _not_sync: PhantomData<Cell<()>>,
}

fn duplicate(err: &CoreError) -> CoreError {
    match err {
        CoreError::IllegalArgument { message } => CoreError::illegal_argument(message.clone()),
        CoreError::IllegalState { message } => CoreError::illegal_state(message.clone()),
        CoreError::PropertyTypeMismatch { message } => CoreError::type_mismatch(message.clone()),
        CoreError::SchemaObjectNotFound { message } => CoreError::not_in_schema(message.clone()),
        other => CoreError::general(other.to_string()),
    }
}

impl QueryBuilder {
    pub(crate) fn new(store: Arc<StoreShared>, entity: SchemaId) -> CoreResult<Self> {
        store.check_open()?;
        if store.model.entity(entity).is_none() {
            return Err(CoreError::not_in_schema(format!("entity {entity}")));
        }
        Ok(Self::with_entity(store, entity, false))
    }

    fn with_entity(store: Arc<StoreShared>, entity: SchemaId, is_link: bool) -> Self {
        Self {
            store,
            entity,
            id: NEXT_BUILDER_ID.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
            last_leaf: None,
            orders: Vec::new(),
            links: Vec::new(),
            is_link,
            error: None,
            _not_sync: PhantomData,
        }
    }

    /// Entity the builder queries.
    #[must_use]
    pub fn entity_id(&self) -> SchemaId {
        self.entity
    }

    /// The first error, if any call failed.
    #[must_use]
    pub fn error(&self) -> Option<&CoreError> {
        self.error.as_ref()
    }

    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> CoreResult<T>) -> CoreResult<T> {
        if let Some(first) = &self.error {
            return Err(CoreError::illegal_state(format!(
                "query builder failed earlier: {first}"
            )));
        }
        let result = f(self);
        if let Err(err) = &result {
            self.error = Some(duplicate(err));
        }
        result
    }

    fn property_of(&self, entity: SchemaId, property: SchemaId) -> CoreResult<Property> {
        let entity = self
            .store
            .model
            .entity(entity)
            .ok_or_else(|| CoreError::not_in_schema(format!("entity {entity}")))?;
        entity.property(property).cloned().ok_or_else(|| {
            CoreError::illegal_argument(format!(
                "entity {} has no property with ID {property}",
                entity.name
            ))
        })
    }

    fn condition(
        &mut self,
        property: SchemaId,
        accepts: fn(PropertyType) -> bool,
        expected: &str,
        op: Op,
        operand: Operand,
        case_sensitive: bool,
    ) -> CoreResult<ConditionId> {
        let expected = expected.to_string();
        self.guarded(move |qb| {
            let prop = qb.property_of(qb.entity, property)?;
            if !accepts(prop.ptype) {
                return Err(CoreError::type_mismatch(format!(
                    "{} {op:?} needs {expected}, property is {}",
                    prop.name, prop.ptype
                )));
            }
            let mut leaf = Leaf::new(qb.entity, &prop, op, operand);
            leaf.case_sensitive = case_sensitive;
            Ok(qb.push_leaf(leaf))
        })
    }

    fn push_leaf(&mut self, leaf: Leaf) -> ConditionId {
        self.slots.push(Some(Expr::Leaf(leaf)));
        let index = self.slots.len() - 1;
        self.last_leaf = Some(index);
        ConditionId {
            builder: self.id,
            index,
        }
    }

    fn string(
        &mut self,
        property: SchemaId,
        op: Op,
        value: &str,
        case_sensitive: bool,
    ) -> CoreResult<ConditionId> {
        self.condition(
            property,
            |t| t == PropertyType::String,
            "a string property",
            op,
            Operand::Text(value.to_string()),
            case_sensitive,
        )
    }

    fn int(&mut self, property: SchemaId, op: Op, operand: Operand) -> CoreResult<ConditionId> {
        self.condition(property, PropertyType::is_integer, "an integer property", op, operand, true)
    }

    fn double(&mut self, property: SchemaId, op: Op, operand: Operand) -> CoreResult<ConditionId> {
        self.condition(property, PropertyType::is_float, "a float property", op, operand, true)
    }

    fn bytes(&mut self, property: SchemaId, op: Op, value: &[u8]) -> CoreResult<ConditionId> {
        self.condition(
            property,
            |t| t == PropertyType::ByteVector,
            "a byte vector property",
            op,
            Operand::Bytes(value.to_vec()),
            true,
        )
    }

    /// Matches objects where the property is null or missing.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] for an unknown property.
    pub fn is_null(&mut self, property: SchemaId) -> CoreResult<ConditionId> {
        self.condition(property, |_| true, "any property", Op::IsNull, Operand::None, true)
    }

    /// Matches objects where the property has a value.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] for an unknown property.
    pub fn not_null(&mut self, property: SchemaId) -> CoreResult<ConditionId> {
        self.condition(property, |_| true, "any property", Op::NotNull, Operand::None, true)
    }

    /// String equality.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] unless the property is a
    /// string.
    pub fn equals_string(&mut self, property: SchemaId, value: &str, case_sensitive: bool) -> CoreResult<ConditionId> {
        self.string(property, Op::Equal, value, case_sensitive)
    }

    /// String inequality.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_string`].
    pub fn not_equals_string(&mut self, property: SchemaId, value: &str, case_sensitive: bool) -> CoreResult<ConditionId> {
        self.string(property, Op::NotEqual, value, case_sensitive)
    }

    /// Substring match; for string vectors, any element containing `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] unless the property is a
    /// string or string vector.
    pub fn contains_string(&mut self, property: SchemaId, value: &str, case_sensitive: bool) -> CoreResult<ConditionId> {
        self.condition(
            property,
            |t| matches!(t, PropertyType::String | PropertyType::StringVector),
            "a string or string vector property",
            Op::Contains,
            Operand::Text(value.to_string()),
            case_sensitive,
        )
    }

    /// A string vector element equal to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] unless the property is a
    /// string vector.
    pub fn contains_element_string(
        &mut self,
        property: SchemaId,
        value: &str,
        case_sensitive: bool,
    ) -> CoreResult<ConditionId> {
        self.string_vector(property, Op::ContainsElement, value, case_sensitive)
    }

    /// Matches if at least one string vector element equals `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] unless the property is a
    /// string vector.
    pub fn any_equals_string(&mut self, property: SchemaId, value: &str, case_sensitive: bool) -> CoreResult<ConditionId> {
        self.string_vector(property, Op::AnyEquals, value, case_sensitive)
    }

    fn string_vector(&mut self, property: SchemaId, op: Op, value: &str, case_sensitive: bool) -> CoreResult<ConditionId> {
        self.condition(
            property,
            |t| t == PropertyType::StringVector,
            "a string vector property",
            op,
            Operand::Text(value.to_string()),
            case_sensitive,
        )
    }

    /// String prefix match.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_string`].
    pub fn starts_with_string(&mut self, property: SchemaId, value: &str, case_sensitive: bool) -> CoreResult<ConditionId> {
        self.string(property, Op::StartsWith, value, case_sensitive)
    }

    /// String suffix match.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_string`].
    pub fn ends_with_string(&mut self, property: SchemaId, value: &str, case_sensitive: bool) -> CoreResult<ConditionId> {
        self.string(property, Op::EndsWith, value, case_sensitive)
    }

    /// Strings ordered after `value`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_string`].
    pub fn greater_string(&mut self, property: SchemaId, value: &str, case_sensitive: bool) -> CoreResult<ConditionId> {
        self.string(property, Op::Greater, value, case_sensitive)
    }

    /// Strings equal to or ordered after `value`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_string`].
    pub fn greater_or_equal_string(
        &mut self,
        property: SchemaId,
        value: &str,
        case_sensitive: bool,
    ) -> CoreResult<ConditionId> {
        self.string(property, Op::GreaterOrEqual, value, case_sensitive)
    }

    /// Strings ordered before `value`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_string`].
    pub fn less_string(&mut self, property: SchemaId, value: &str, case_sensitive: bool) -> CoreResult<ConditionId> {
        self.string(property, Op::Less, value, case_sensitive)
    }

    /// Strings equal to or ordered before `value`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_string`].
    pub fn less_or_equal_string(&mut self, property: SchemaId, value: &str, case_sensitive: bool) -> CoreResult<ConditionId> {
        self.string(property, Op::LessOrEqual, value, case_sensitive)
    }

    /// Strings equal to one of `values`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_string`].
    pub fn in_strings(&mut self, property: SchemaId, values: &[&str], case_sensitive: bool) -> CoreResult<ConditionId> {
        self.condition(
            property,
            |t| t == PropertyType::String,
            "a string property",
            Op::In,
            Operand::Texts(values.iter().map(|v| (*v).to_string()).collect()),
            case_sensitive,
        )
    }

    /// Integer equality; also for booleans, dates and relations.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] unless the property is
    /// integer-like.
    pub fn equals_int(&mut self, property: SchemaId, value: i64) -> CoreResult<ConditionId> {
        self.int(property, Op::Equal, Operand::Int(value))
    }

    /// Integer inequality.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_int`].
    pub fn not_equals_int(&mut self, property: SchemaId, value: i64) -> CoreResult<ConditionId> {
        self.int(property, Op::NotEqual, Operand::Int(value))
    }

    /// Integers above `value`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_int`].
    pub fn greater_int(&mut self, property: SchemaId, value: i64) -> CoreResult<ConditionId> {
        self.int(property, Op::Greater, Operand::Int(value))
    }

    /// Integers at or above `value`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_int`].
    pub fn greater_or_equal_int(&mut self, property: SchemaId, value: i64) -> CoreResult<ConditionId> {
        self.int(property, Op::GreaterOrEqual, Operand::Int(value))
    }

    /// Integers below `value`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_int`].
    pub fn less_int(&mut self, property: SchemaId, value: i64) -> CoreResult<ConditionId> {
        self.int(property, Op::Less, Operand::Int(value))
    }

    /// Integers at or below `value`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_int`].
    pub fn less_or_equal_int(&mut self, property: SchemaId, value: i64) -> CoreResult<ConditionId> {
        self.int(property, Op::LessOrEqual, Operand::Int(value))
    }

    /// Integers in `low..=high`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_int`].
    pub fn between_ints(&mut self, property: SchemaId, low: i64, high: i64) -> CoreResult<ConditionId> {
        self.int(property, Op::Between, Operand::IntPair(low, high))
    }

    /// Integers contained in `values`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_int`].
    pub fn in_int64s(&mut self, property: SchemaId, values: &[i64]) -> CoreResult<ConditionId> {
        self.int(property, Op::In, Operand::Int64s(values.to_vec()))
    }

    /// Integers not contained in `values`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_int`].
    pub fn not_in_int64s(&mut self, property: SchemaId, values: &[i64]) -> CoreResult<ConditionId> {
        self.int(property, Op::NotIn, Operand::Int64s(values.to_vec()))
    }

    /// Integers contained in a 32-bit list.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_int`].
    pub fn in_int32s(&mut self, property: SchemaId, values: &[i32]) -> CoreResult<ConditionId> {
        self.int(property, Op::In, Operand::Int32s(values.to_vec()))
    }

    /// Integers not contained in a 32-bit list.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_int`].
    pub fn not_in_int32s(&mut self, property: SchemaId, values: &[i32]) -> CoreResult<ConditionId> {
        self.int(property, Op::NotIn, Operand::Int32s(values.to_vec()))
    }

    /// Floating point values above `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] unless the property is
    /// Float or Double.
    pub fn greater_double(&mut self, property: SchemaId, value: f64) -> CoreResult<ConditionId> {
        self.double(property, Op::Greater, Operand::Double(value))
    }

    /// Floating point values at or above `value`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::greater_double`].
    pub fn greater_or_equal_double(&mut self, property: SchemaId, value: f64) -> CoreResult<ConditionId> {
        self.double(property, Op::GreaterOrEqual, Operand::Double(value))
    }

    /// Floating point values below `value`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::greater_double`].
    pub fn less_double(&mut self, property: SchemaId, value: f64) -> CoreResult<ConditionId> {
        self.double(property, Op::Less, Operand::Double(value))
    }

    /// Floating point values at or below `value`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::greater_double`].
    pub fn less_or_equal_double(&mut self, property: SchemaId, value: f64) -> CoreResult<ConditionId> {
        self.double(property, Op::LessOrEqual, Operand::Double(value))
    }

    /// Floating point values in `low..=high`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::greater_double`].
    pub fn between_doubles(&mut self, property: SchemaId, low: f64, high: f64) -> CoreResult<ConditionId> {
        self.double(property, Op::Between, Operand::DoublePair(low, high))
    }

    /// Byte string equality.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] unless the property is a
    /// byte vector.
    pub fn equals_bytes(&mut self, property: SchemaId, value: &[u8]) -> CoreResult<ConditionId> {
        self.bytes(property, Op::Equal, value)
    }

    /// Byte strings ordered after `value`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_bytes`].
    pub fn greater_bytes(&mut self, property: SchemaId, value: &[u8]) -> CoreResult<ConditionId> {
        self.bytes(property, Op::Greater, value)
    }

    /// Byte strings equal to or ordered after `value`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_bytes`].
    pub fn greater_or_equal_bytes(&mut self, property: SchemaId, value: &[u8]) -> CoreResult<ConditionId> {
        self.bytes(property, Op::GreaterOrEqual, value)
    }

    /// Byte strings ordered before `value`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_bytes`].
    pub fn less_bytes(&mut self, property: SchemaId, value: &[u8]) -> CoreResult<ConditionId> {
        self.bytes(property, Op::Less, value)
    }

    /// Byte strings equal to or ordered before `value`.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::equals_bytes`].
    pub fn less_or_equal_bytes(&mut self, property: SchemaId, value: &[u8]) -> CoreResult<ConditionId> {
        self.bytes(property, Op::LessOrEqual, value)
    }

    /// Matches objects that exactly `count` objects of `source_entity`
    /// point at through the to-one relation `source_property`.
    ///
    /// The count cannot be changed through parameters.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] unless the property is a
    /// relation targeting this builder's entity.
    pub fn relation_count(
        &mut self,
        source_entity: SchemaId,
        source_property: SchemaId,
        count: u32,
    ) -> CoreResult<ConditionId> {
        self.guarded(|qb| {
            let prop = qb.property_of(source_entity, source_property)?;
            if prop.ptype != PropertyType::Relation || prop.target_entity != Some(qb.entity) {
                return Err(CoreError::illegal_argument(format!(
                    "property {} is not a relation to entity {}",
                    prop.name, qb.entity
                )));
            }
            let leaf = Leaf::new(source_entity, &prop, Op::RelationCount, Operand::Int(i64::from(count)));
            Ok(qb.push_leaf(leaf))
        })
    }

    fn combine(&mut self, conditions: &[ConditionId], all: bool) -> CoreResult<ConditionId> {
        self.guarded(|qb| {
            if conditions.is_empty() {
                return Err(CoreError::illegal_argument("no conditions to combine"));
            }
            for (i, cond) in conditions.iter().enumerate() {
                let live = cond.builder == qb.id && qb.slots.get(cond.index).is_some_and(Option::is_some);
                if !live || conditions[..i].contains(cond) {
                    return Err(CoreError::illegal_argument(format!(
                        "condition {} is unknown or already combined",
                        cond.index
                    )));
                }
            }
            let children = conditions
                .iter()
                .filter_map(|cond| qb.slots[cond.index].take())
                .collect();
            qb.slots.push(Some(if all { Expr::All(children) } else { Expr::Any(children) }));
            qb.last_leaf = None;
            Ok(ConditionId {
                builder: qb.id,
                index: qb.slots.len() - 1,
            })
        })
    }

    /// Combines conditions with AND; their handles become invalid.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] for an empty list or a
    /// handle that is unknown or already combined.
    pub fn all(&mut self, conditions: &[ConditionId]) -> CoreResult<ConditionId> {
        self.combine(conditions, true)
    }

    /// Combines conditions with OR; their handles become invalid.
    ///
    /// # Errors
    ///
    /// See [`QueryBuilder::all`].
    pub fn any(&mut self, conditions: &[ConditionId]) -> CoreResult<ConditionId> {
        self.combine(conditions, false)
    }

    /// Names the condition added last, for [`Query::set_param_alias`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] for an empty alias, and
    /// [`CoreError::IllegalState`] unless the previous call added a
    /// condition.
    pub fn alias(&mut self, alias: &str) -> CoreResult<()> {
        self.guarded(|qb| {
            if alias.is_empty() {
                return Err(CoreError::illegal_argument("alias must not be empty"));
            }
            let slot = qb
                .last_leaf
                .and_then(|index| qb.slots.get_mut(index))
                .and_then(Option::as_mut);
            match slot {
                Some(Expr::Leaf(leaf)) => {
                    leaf.alias = Some(alias.to_string());
                    Ok(())
                }
                _ => Err(CoreError::illegal_state(
                    "an alias must directly follow the condition it names",
                )),
            }
        })
    }

    /// Orders results by a property; later calls break ties of earlier ones.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] for an unknown property or on
    /// a link builder.
    pub fn order(&mut self, property: SchemaId, flags: OrderFlags) -> CoreResult<()> {
        self.guarded(|qb| {
            if qb.is_link {
                return Err(CoreError::illegal_argument(
                    "ordering only applies to the root query builder",
                ));
            }
            let prop = qb.property_of(qb.entity, property)?;
            qb.orders.push(OrderBy::new(&prop, flags));
            qb.last_leaf = None;
            Ok(())
        })
    }

    fn add_link(&mut self, kind: LinkKind, entity: SchemaId) -> &mut QueryBuilder {
        let child = Self::with_entity(Arc::clone(&self.store), entity, true);
        self.links.push((kind, child));
        let index = self.links.len() - 1;
        &mut self.links[index].1
    }

    /// Adds conditions on the object a to-one relation property points at.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] unless `property` is a
    /// relation property of this entity.
    pub fn link_property(&mut self, property: SchemaId) -> CoreResult<&mut QueryBuilder> {
        let target = self.guarded(|qb| {
            let prop = qb.property_of(qb.entity, property)?;
            match (prop.ptype, prop.target_entity) {
                (PropertyType::Relation, Some(target)) => Ok(target),
                _ => Err(CoreError::illegal_argument(format!(
                    "property {} is not a relation",
                    prop.name
                ))),
            }
        })?;
        Ok(self.add_link(LinkKind::Property(property), target))
    }

    /// Adds conditions on objects of `source_entity` whose relation
    /// property points at the queried object.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] unless the property is a
    /// relation targeting this entity.
    pub fn backlink_property(
        &mut self,
        source_entity: SchemaId,
        source_property: SchemaId,
    ) -> CoreResult<&mut QueryBuilder> {
        self.guarded(|qb| {
            let prop = qb.property_of(source_entity, source_property)?;
            if prop.ptype == PropertyType::Relation && prop.target_entity == Some(qb.entity) {
                Ok(())
            } else {
                Err(CoreError::illegal_argument(format!(
                    "property {} is not a relation to entity {}",
                    prop.name, qb.entity
                )))
            }
        })?;
        Ok(self.add_link(
            LinkKind::BacklinkProperty {
                entity: source_entity,
                property: source_property,
            },
            source_entity,
        ))
    }

    /// Adds conditions on the targets of a standalone relation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] unless the relation starts
    /// at this entity.
    pub fn link_standalone(&mut self, relation: SchemaId) -> CoreResult<&mut QueryBuilder> {
        let target = self.guarded(|qb| {
            let (owner, rel) = qb.standalone(relation)?;
            if owner == qb.entity {
                Ok(rel)
            } else {
                Err(CoreError::illegal_argument(format!(
                    "relation {relation} does not start at entity {}",
                    qb.entity
                )))
            }
        })?;
        Ok(self.add_link(LinkKind::Standalone(relation), target))
    }

    /// Adds conditions on the sources of a standalone relation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] unless the relation ends at
    /// this entity.
    pub fn backlink_standalone(&mut self, relation: SchemaId) -> CoreResult<&mut QueryBuilder> {
        let source = self.guarded(|qb| {
            let (owner, target) = qb.standalone(relation)?;
            if target == qb.entity {
                Ok(owner)
            } else {
                Err(CoreError::illegal_argument(format!(
                    "relation {relation} does not end at entity {}",
                    qb.entity
                )))
            }
        })?;
        Ok(self.add_link(LinkKind::BacklinkStandalone(relation), source))
    }

    /// Source and target entity of a standalone relation.
    fn standalone(&self, relation: SchemaId) -> CoreResult<(SchemaId, SchemaId)> {
        self.store
            .model
            .relation(relation)
            .map(|(owner, rel)| (owner.id, rel.target.id))
            .ok_or_else(|| CoreError::not_in_schema(format!("relation {relation}")))
    }

    /// Builds the query.
    ///
    /// # Errors
    ///
    /// Returns the first error of this builder or one of its links.
    pub fn build(self) -> CoreResult<Query> {
        let store = Arc::clone(&self.store);
        store.check_open()?;
        Ok(Query::new(store, self.into_plan()?))
    }

    fn into_plan(mut self) -> CoreResult<Plan> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        let mut remaining: Vec<Expr> = self.slots.into_iter().flatten().collect();
        let root = match remaining.len() {
            0 => None,
            1 => remaining.pop(),
            _ => Some(Expr::All(remaining)),
        };
        let links = self
            .links
            .into_iter()
            .map(|(kind, child)| Ok((kind, child.into_plan()?)))
            .collect::<CoreResult<Vec<_>>>()?;
        let entity_name = self
            .store
            .model
            .entity(self.entity)
            .map(|e| e.name.clone())
            .unwrap_or_default();
        Ok(Plan {
            entity: self.entity,
            entity_name,
            root,
            links,
            orders: self.orders,
        })
    }
}

impl std::fmt::Debug for QueryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("entity", &self.entity)
            .field("conditions", &self.slots.iter().flatten().count())
            .field("links", &self.links.len())
            .field("failed", &self.error.is_some())
            .finish()
    }
}
