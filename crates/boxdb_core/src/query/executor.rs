//! Query execution: candidate selection, filtering, links and ordering.
//!
//! The executor picks candidates from a secondary index when the condition
//! tree has a required leaf an index can answer: equality on an integer,
//! byte or case-sensitive string property, an `in` list of integers, or a
//! range on an ordered index. Otherwise every object is a candidate. Each
//! candidate is then decoded and checked against the full tree, so index
//! entries only ever narrow the scan.

use std::collections::HashSet;
use std::ops::Bound;

use boxdb_codec::{ObjectRecord, Value};
use bytes::Bytes;

use crate::cursor::Cursor;
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexKey, IndexSet};
use crate::model::{Property, PropertyFlags, SchemaId};
use crate::object;
use crate::query::condition::{Expr, Leaf, Op, Operand};
use crate::query::order::{sort_rows, OrderBy};
use crate::transaction::Transaction;

/// A matching object: ID, decoded fields and stored bytes.
pub(crate) type Row = (u64, ObjectRecord, Bytes);

/// How a linked builder relates to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkKind {
    /// The parent's to-one relation property points at the linked object.
    Property(SchemaId),
    /// The linked entity's to-one relation property points at the parent.
    BacklinkProperty {
        entity: SchemaId,
        property: SchemaId,
    },
    /// The parent is the source of a standalone relation.
    Standalone(SchemaId),
    /// The parent is the target of a standalone relation.
    BacklinkStandalone(SchemaId),
}

/// Executable form of a query builder.
#[derive(Debug, Clone)]
pub(crate) struct Plan {
    pub(crate) entity: SchemaId,
    pub(crate) entity_name: String,
    pub(crate) root: Option<Expr>,
    pub(crate) links: Vec<(LinkKind, Plan)>,
    pub(crate) orders: Vec<OrderBy>,
}

impl Plan {
    pub(crate) fn leaves(&self) -> Vec<&Leaf> {
        let mut out = self.root.as_ref().map(Expr::leaves).unwrap_or_default();
        for (_, child) in &self.links {
            out.extend(child.leaves());
        }
        out
    }

    pub(crate) fn leaves_mut(&mut self) -> Vec<&mut Leaf> {
        let mut out = self.root.as_mut().map(Expr::leaves_mut).unwrap_or_default();
        for (_, child) in &mut self.links {
            out.extend(child.leaves_mut());
        }
        out
    }

    /// Condition tree as text, links included.
    pub(crate) fn describe_conditions(&self) -> String {
        let mut out = match &self.root {
            Some(expr) => expr.to_string(),
            None => "(all)".to_string(),
        };
        for (kind, child) in &self.links {
            let label = match kind {
                LinkKind::Property(_) => "link",
                LinkKind::BacklinkProperty { .. } => "backlink",
                LinkKind::Standalone(_) => "link relation",
                LinkKind::BacklinkStandalone(_) => "backlink relation",
            };
            out.push_str(&format!(" {label} {} {}", child.entity_name, child.describe_conditions()));
        }
        out
    }
}

/// Narrows parents by the objects a link found.
enum LinkFilter {
    /// Parents whose relation property holds one of `targets`.
    TargetOf { property: SchemaId, targets: HashSet<u64> },
    /// Parents determined up front.
    Parents(HashSet<u64>),
}

impl LinkFilter {
    #[allow(clippy::cast_sign_loss)]
    fn admits(&self, id: u64, record: &ObjectRecord) -> bool {
        match self {
            Self::TargetOf { property, targets } => record
                .get(*property)
                .and_then(Value::as_integer)
                .is_some_and(|target| target != 0 && targets.contains(&(target as u64))),
            Self::Parents(ids) => ids.contains(&id),
        }
    }
}

/// Runs plans inside one transaction.
pub(crate) struct Evaluator<'tx> {
    txn: &'tx Transaction,
}

impl<'tx> Evaluator<'tx> {
    pub(crate) fn new(txn: &'tx Transaction) -> Self {
        Self { txn }
    }

    /// Matching rows in result order.
    pub(crate) fn rows(&self, plan: &Plan) -> CoreResult<Vec<Row>> {
        let (mut rows, used_index) = self.matching(plan)?;
        sort_rows(&mut rows, &plan.orders);
        let store = self.txn.store();
        store.stats.record_query(used_index);
        if store.debug_enabled(crate::options::DebugFlags::LOG_QUERIES) {
            tracing::debug!(
                entity = %plan.entity_name,
                conditions = %plan.describe_conditions(),
                results = rows.len(),
                used_index,
                "query executed"
            );
        }
        Ok(rows)
    }

    fn matching(&self, plan: &Plan) -> CoreResult<(Vec<Row>, bool)> {
        let cursor = Cursor::new(self.txn, plan.entity)?;
        let filters = plan
            .links
            .iter()
            .map(|(kind, child)| self.link_filter(plan, *kind, child))
            .collect::<CoreResult<Vec<_>>>()?;

        let (candidates, used_index) = match self.index_candidates(plan)? {
            Some(ids) => (ids, true),
            None => (cursor.ids()?, false),
        };

        let mut rows = Vec::new();
        for id in candidates {
            let Some(bytes) = cursor.get(id)? else {
                continue;
            };
            let record = object::decode_stored(&bytes)?;
            if !filters.iter().all(|f| f.admits(id, &record)) {
                continue;
            }
            let hit = match &plan.root {
                Some(expr) => self.eval(expr, id, &record)?,
                None => true,
            };
            if hit {
                rows.push((id, record, bytes));
            }
        }
        Ok((rows, used_index))
    }

    fn link_filter(&self, parent: &Plan, kind: LinkKind, child: &Plan) -> CoreResult<LinkFilter> {
        let (found, _) = self.matching(child)?;
        let mut parents = HashSet::new();
        match kind {
            LinkKind::Property(property) => {
                return Ok(LinkFilter::TargetOf {
                    property,
                    targets: found.into_iter().map(|(id, _, _)| id).collect(),
                });
            }
            LinkKind::BacklinkProperty { property, .. } => {
                for (_, record, _) in &found {
                    if let Some(target) = record.get(property).and_then(Value::as_integer) {
                        parents.insert(u64::from_ne_bytes(target.to_ne_bytes()));
                    }
                }
            }
            LinkKind::Standalone(relation) => {
                let cursor = Cursor::new(self.txn, parent.entity)?;
                for (target, _, _) in &found {
                    parents.extend(cursor.rel_backlink_ids(relation, *target)?);
                }
            }
            LinkKind::BacklinkStandalone(relation) => {
                let cursor = Cursor::new(self.txn, child.entity)?;
                for (source, _, _) in &found {
                    parents.extend(cursor.rel_ids(relation, *source)?);
                }
            }
        }
        Ok(LinkFilter::Parents(parents))
    }

    fn eval(&self, expr: &Expr, id: u64, record: &ObjectRecord) -> CoreResult<bool> {
        match expr {
            Expr::Leaf(leaf) if leaf.op == Op::RelationCount => self.relation_count(leaf, id),
            Expr::Leaf(leaf) => Ok(leaf.matches(record.get(leaf.property))),
            Expr::All(children) => {
                for child in children {
                    if !self.eval(child, id, record)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::Any(children) => {
                for child in children {
                    if self.eval(child, id, record)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn relation_count(&self, leaf: &Leaf, id: u64) -> CoreResult<bool> {
        let Operand::Int(wanted) = leaf.operand else {
            return Err(CoreError::illegal_state("relation count without a count"));
        };
        let sources = Cursor::new(self.txn, leaf.entity)?.backlink_ids(leaf.property, id)?;
        Ok(i64::try_from(sources.len()).is_ok_and(|n| n == wanted))
    }

    /// IDs an index yields for a required leaf, pending changes included.
    fn index_candidates(&self, plan: &Plan) -> CoreResult<Option<Vec<u64>>> {
        let Some(root) = &plan.root else {
            return Ok(None);
        };
        let store = self.txn.store();
        let Some(entity) = store.model.entity(plan.entity) else {
            return Ok(None);
        };
        let found = {
            let indexes = store.indexes.read();
            root.required_leaves()
                .into_iter()
                .filter(|leaf| leaf.entity == plan.entity && leaf.op != Op::RelationCount)
                .find_map(|leaf| {
                    let property = entity.property(leaf.property)?;
                    index_lookup(&indexes, plan.entity, property, leaf)
                })
        };
        let Some(mut ids) = found else {
            return Ok(None);
        };
        let ctx = self.txn.context()?;
        if ctx.is_write() {
            ids.extend(ctx.writes()?.borrow().changed_ids(plan.entity));
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(Some(ids))
    }
}

fn index_lookup(indexes: &IndexSet, entity: SchemaId, property: &Property, leaf: &Leaf) -> Option<Vec<u64>> {
    let key = |value: Value| IndexKey::for_field(property, &value);
    let any_of = |values: Vec<i64>| -> Option<Vec<u64>> {
        let mut ids = Vec::new();
        for n in values {
            ids.extend(indexes.lookup(entity, property.id, &key(Value::Integer(n))?)?);
        }
        Some(ids)
    };
    match (&leaf.op, &leaf.operand) {
        (Op::Equal, Operand::Int(n)) => indexes.lookup(entity, property.id, &key(Value::Integer(*n))?),
        (Op::Equal, Operand::Text(s)) if leaf.case_sensitive => {
            indexes.lookup(entity, property.id, &key(Value::Text(s.clone()))?)
        }
        (Op::Equal, Operand::Bytes(b)) => indexes.lookup(entity, property.id, &key(Value::Bytes(b.clone()))?),
        (Op::In, Operand::Int64s(values)) => any_of(values.clone()),
        (Op::In, Operand::Int32s(values)) => any_of(values.iter().map(|&n| i64::from(n)).collect()),
        _ => range_lookup(indexes, entity, property, leaf),
    }
}

fn range_lookup(indexes: &IndexSet, entity: SchemaId, property: &Property, leaf: &Leaf) -> Option<Vec<u64>> {
    // skipped zeros and unsigned values are missing from the signed key order
    if leaf.unsigned || property.flags.contains(PropertyFlags::INDEX_PARTIAL_SKIP_ZERO) {
        return None;
    }
    let (low, high) = match &leaf.operand {
        Operand::Int(n) => (IndexKey::Int(*n), IndexKey::Int(*n)),
        Operand::IntPair(a, b) => (IndexKey::Int(*a), IndexKey::Int(*b)),
        Operand::Double(d) => (IndexKey::Float(*d), IndexKey::Float(*d)),
        Operand::DoublePair(a, b) => (IndexKey::Float(*a), IndexKey::Float(*b)),
        Operand::Text(s) if leaf.case_sensitive => (IndexKey::Text(s.clone()), IndexKey::Text(s.clone())),
        _ => return None,
    };
    let (lower, upper) = match leaf.op {
        Op::Greater => (Bound::Excluded(&low), Bound::Unbounded),
        Op::GreaterOrEqual => (Bound::Included(&low), Bound::Unbounded),
        Op::Less => (Bound::Unbounded, Bound::Excluded(&high)),
        Op::LessOrEqual => (Bound::Unbounded, Bound::Included(&high)),
        Op::Between => (Bound::Included(&low), Bound::Included(&high)),
        _ => return None,
    };
    indexes.range(entity, property.id, lower, upper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, ModelBuilder, PropertyType};

    fn model() -> Model {
        ModelBuilder::new()
            .entity("Item", 1, 100)
            .property("id", PropertyType::Long, 1, 101)
            .property_flags(PropertyFlags::ID)
            .property("rank", PropertyType::Int, 2, 102)
            .property_flags(PropertyFlags::INDEXED)
            .property_index_id(1, 103)
            .property("code", PropertyType::String, 3, 104)
            .property_flags(PropertyFlags::INDEXED | PropertyFlags::INDEX_HASH)
            .property_index_id(2, 105)
            .build()
            .unwrap()
    }

    fn leaf(property: &Property, op: Op, operand: Operand) -> Leaf {
        Leaf::new(1, property, op, operand)
    }

    #[test]
    fn index_answers_equality_and_ranges() {
        let model = model();
        let entity = model.entity(1).unwrap();
        let mut indexes = IndexSet::for_model(&model);
        for (id, rank) in [(1u64, 5i64), (2, 7), (3, 9)] {
            let record = ObjectRecord::new()
                .with(2, Value::Integer(rank))
                .with(3, format!("c{id}"));
            indexes.apply(entity, id, None, Some(&record), id);
        }
        let rank = entity.property(2).unwrap();
        let code = entity.property(3).unwrap();

        let eq = leaf(rank, Op::Equal, Operand::Int(7));
        assert_eq!(index_lookup(&indexes, 1, rank, &eq), Some(vec![2]));
        let gt = leaf(rank, Op::Greater, Operand::Int(5));
        assert_eq!(index_lookup(&indexes, 1, rank, &gt), Some(vec![2, 3]));
        let within = leaf(rank, Op::Between, Operand::IntPair(6, 9));
        assert_eq!(index_lookup(&indexes, 1, rank, &within), Some(vec![2, 3]));
        let listed = leaf(rank, Op::In, Operand::Int32s(vec![5, 9]));
        assert_eq!(index_lookup(&indexes, 1, rank, &listed), Some(vec![1, 3]));

        let text = leaf(code, Op::Equal, Operand::Text("c3".into()));
        assert_eq!(index_lookup(&indexes, 1, code, &text), Some(vec![3]));
        let mut folded = text.clone();
        folded.case_sensitive = false;
        assert_eq!(index_lookup(&indexes, 1, code, &folded), None);
        // hash indexes keep no order
        let after = leaf(code, Op::Greater, Operand::Text("c1".into()));
        assert_eq!(index_lookup(&indexes, 1, code, &after), None);
    }

    #[test]
    fn unindexed_operators_scan() {
        let model = model();
        let entity = model.entity(1).unwrap();
        let indexes = IndexSet::for_model(&model);
        let rank = entity.property(2).unwrap();
        let ne = leaf(rank, Op::NotEqual, Operand::Int(1));
        assert_eq!(index_lookup(&indexes, 1, rank, &ne), None);
        let id = entity.property(1).unwrap();
        let by_id = leaf(id, Op::Equal, Operand::Int(1));
        assert_eq!(index_lookup(&indexes, 1, id, &by_id), None);
    }
}
