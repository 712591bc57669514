//! Built, reusable queries.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;

use crate::cursor::Cursor;
use crate::error::{CoreError, CoreResult};
use crate::model::SchemaId;
use crate::options::DebugFlags;
use crate::query::executor::{Evaluator, Plan, Row};
use crate::query::params::{self, ParamValue};
use crate::query::property::PropertyQuery;
use crate::store::StoreShared;
use crate::transaction::Transaction;

/// A built query.
///
/// Queries run in the transaction the calling thread has open on the
/// store, or in a transaction of their own. Without an order clause
/// results come in ascending ID order. Offset and limit apply after
/// ordering; a limit of 0 means no limit.
///
/// A query may be moved to another thread but not shared; clone it to run
/// the same conditions on several threads.
#[derive(Clone)]
pub struct Query {
    store: Arc<StoreShared>,
    plan: Plan,
    offset: usize,
    limit: usize,
    _not_sync: PhantomData<Cell<()>>,
}

impl Query {
    pub(crate) fn new(store: Arc<StoreShared>, plan: Plan) -> Self {
        Self {
            store,
            plan,
            offset: 0,
            limit: 0,
            _not_sync: PhantomData,
        }
    }

    /// Entity the query returns.
    #[must_use]
    pub fn entity_id(&self) -> SchemaId {
        self.plan.entity
    }

    /// Skips the first `offset` results.
    pub fn offset(&mut self, offset: usize) -> &mut Self {
        self.offset = offset;
        self
    }

    /// Returns at most `limit` results; 0 removes the limit.
    pub fn limit(&mut self, limit: usize) -> &mut Self {
        self.limit = limit;
        self
    }

    fn read<T>(&self, f: impl FnOnce(&Transaction) -> CoreResult<T>) -> CoreResult<T> {
        self.store.check_open()?;
        let mut txn = Transaction::begin(&self.store, false)?;
        let result = f(&txn);
        txn.close()?;
        result
    }

    fn window(&self, rows: Vec<Row>) -> Vec<Row> {
        let limit = if self.limit == 0 { usize::MAX } else { self.limit };
        rows.into_iter().skip(self.offset).take(limit).collect()
    }

    /// Matching rows after offset and limit.
    pub(crate) fn rows(&self) -> CoreResult<Vec<Row>> {
        self.read(|txn| Ok(self.window(Evaluator::new(txn).rows(&self.plan)?)))
    }

    /// Stored bytes of all matching objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or data is corrupt.
    pub fn find(&self) -> CoreResult<Vec<Bytes>> {
        Ok(self.rows()?.into_iter().map(|(_, _, bytes)| bytes).collect())
    }

    /// IDs of all matching objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or data is corrupt.
    pub fn find_ids(&self) -> CoreResult<Vec<u64>> {
        Ok(self.rows()?.into_iter().map(|(id, _, _)| id).collect())
    }

    /// The first match in result order, ignoring offset and limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or data is corrupt.
    pub fn find_first(&self) -> CoreResult<Option<Bytes>> {
        self.read(|txn| {
            let rows = Evaluator::new(txn).rows(&self.plan)?;
            Ok(rows.into_iter().next().map(|(_, _, bytes)| bytes))
        })
    }

    /// The only match, ignoring offset and limit.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NonUniqueResult`] if several objects match.
    pub fn find_unique(&self) -> CoreResult<Option<Bytes>> {
        self.read(|txn| {
            let mut rows = Evaluator::new(txn).rows(&self.plan)?;
            if rows.len() > 1 {
                return Err(CoreError::NonUniqueResult {
                    count: rows.len() as u64,
                });
            }
            Ok(rows.pop().map(|(_, _, bytes)| bytes))
        })
    }

    /// Calls `visitor` with each match until it returns false.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or data is corrupt.
    pub fn visit(&self, mut visitor: impl FnMut(u64, Bytes) -> bool) -> CoreResult<()> {
        for (id, _, bytes) in self.rows()? {
            if !visitor(id, bytes) {
                break;
            }
        }
        Ok(())
    }

    /// Number of matches within offset and limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or data is corrupt.
    pub fn count(&self) -> CoreResult<u64> {
        Ok(self.rows()?.len() as u64)
    }

    /// Removes the matches within offset and limit and returns how many
    /// were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or read-only, or if the
    /// calling thread has a read transaction open.
    pub fn remove(&self) -> CoreResult<u64> {
        self.store.check_open()?;
        let mut txn = Transaction::begin(&self.store, true)?;
        match self.remove_in(&txn) {
            Ok(removed) => {
                txn.success()?;
                Ok(removed)
            }
            Err(err) => {
                txn.fail_outer();
                txn.abort()?;
                Err(err)
            }
        }
    }

    fn remove_in(&self, txn: &Transaction) -> CoreResult<u64> {
        let rows = self.window(Evaluator::new(txn).rows(&self.plan)?);
        let mut cursor = Cursor::new(txn, self.plan.entity)?;
        let mut removed = 0;
        for (id, _, _) in rows {
            if cursor.remove(id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// One-line summary of the query.
    #[must_use]
    pub fn describe(&self) -> String {
        let leaves = self.plan.leaves();
        let mut names: Vec<&str> = leaves.iter().map(|leaf| leaf.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        let mut out = format!(
            "Query for entity {} with {} conditions",
            self.plan.entity_name,
            leaves.len()
        );
        if !names.is_empty() {
            out.push_str(&format!(" with properties {}", names.join(", ")));
        }
        if !self.plan.orders.is_empty() {
            let orders: Vec<&str> = self.plan.orders.iter().map(|o| o.name.as_str()).collect();
            out.push_str(&format!(" ordered by {}", orders.join(", ")));
        }
        out
    }

    /// The condition tree with current parameter values.
    #[must_use]
    pub fn describe_params(&self) -> String {
        self.plan.describe_conditions()
    }

    /// Replaces the operand of the condition on `entity`/`property`.
    ///
    /// `entity` is the queried entity, the entity of a link, or the source
    /// entity of a relation count.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] if no condition or more than
    /// one uses the property, or if the value kind does not match.
    pub fn set_param(&mut self, entity: SchemaId, property: SchemaId, value: ParamValue) -> CoreResult<()> {
        let leaves = self
            .plan
            .leaves_mut()
            .into_iter()
            .filter(|leaf| leaf.entity == entity && leaf.property == property)
            .collect();
        let leaf = params::single(leaves, || format!("entity {entity} property {property}"))?;
        let name = leaf.name.clone();
        params::apply(leaf, value.clone())?;
        self.log_param(&name, &value);
        Ok(())
    }

    /// Replaces the operand of the condition named `alias`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] for an unknown alias or a
    /// value of the wrong kind.
    pub fn set_param_alias(&mut self, alias: &str, value: ParamValue) -> CoreResult<()> {
        let leaves = self
            .plan
            .leaves_mut()
            .into_iter()
            .filter(|leaf| leaf.alias.as_deref() == Some(alias))
            .collect();
        let leaf = params::single(leaves, || format!("alias {alias:?}"))?;
        params::apply(leaf, value.clone())?;
        self.log_param(alias, &value);
        Ok(())
    }

    fn log_param(&self, target: &str, value: &ParamValue) {
        if self.store.debug_enabled(DebugFlags::LOG_QUERY_PARAMETERS) {
            tracing::debug!(entity = %self.plan.entity_name, target, ?value, "query parameter set");
        }
    }

    /// Reads a single property of the matches.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] for an unknown property.
    pub fn property(&self, property: SchemaId) -> CoreResult<PropertyQuery> {
        PropertyQuery::new(self.clone(), property)
    }

    pub(crate) fn store(&self) -> &Arc<StoreShared> {
        &self.store
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("entity", &self.plan.entity_name)
            .field("conditions", &self.plan.describe_conditions())
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, ModelBuilder, PropertyFlags, PropertyType};
    use crate::options::StoreOptions;
    use crate::query::OrderFlags;
    use crate::store::Store;
    use boxdb_codec::{ObjectRecord, Value};

    const PERSON: SchemaId = 1;
    const NAME: SchemaId = 2;
    const AGE: SchemaId = 3;
    const SCORE: SchemaId = 4;
    const TAGS: SchemaId = 5;
    const TEAM: SchemaId = 6;
    const NICK: SchemaId = 7;
    const TEAM_ENTITY: SchemaId = 2;
    const TITLE: SchemaId = 2;
    const FANS: SchemaId = 1;

    fn model() -> Model {
        ModelBuilder::new()
            .entity("Person", PERSON, 100)
            .property("id", PropertyType::Long, 1, 101)
            .property_flags(PropertyFlags::ID)
            .property("name", PropertyType::String, NAME, 102)
            .property("age", PropertyType::Int, AGE, 103)
            .property_flags(PropertyFlags::INDEXED)
            .property_index_id(1, 110)
            .property("score", PropertyType::Double, SCORE, 104)
            .property("tags", PropertyType::StringVector, TAGS, 105)
            .property("team", PropertyType::Relation, TEAM, 106)
            .property_relation("Team", 2, 111)
            .property("nick", PropertyType::String, NICK, 107)
            .property_flags(PropertyFlags::INDEX_HASH)
            .property_index_id(3, 112)
            .relation(FANS, 300, TEAM_ENTITY, 200)
            .entity("Team", TEAM_ENTITY, 200)
            .property("id", PropertyType::Long, 1, 201)
            .property_flags(PropertyFlags::ID)
            .property("title", PropertyType::String, TITLE, 202)
            .build()
            .unwrap()
    }

    fn store(name: &str) -> Store {
        Store::open(StoreOptions::new().directory(format!("memory:{name}")).model(model())).unwrap()
    }

    fn person(name: &str, age: i64, score: f64, team: u64) -> Vec<u8> {
        let mut record = ObjectRecord::new()
            .with(NAME, Value::from(name))
            .with(AGE, Value::Integer(age))
            .with(SCORE, Value::Float(score))
            .with(TAGS, Value::from(vec![format!("{name}-tag"), "all".to_string()]));
        if team != 0 {
            record.set(TEAM, Value::from(team));
        }
        record.encode_padded()
    }

    fn nicked(name: &str, nick: &str, age: i64) -> Vec<u8> {
        ObjectRecord::new()
            .with(NAME, Value::from(name))
            .with(NICK, Value::from(nick))
            .with(AGE, Value::Integer(age))
            .encode_padded()
    }

    /// Ann 31, Bob 25, carl 40, Dora (no age) 19 with teams Red=1 and Blue=2.
    fn populated(name: &str) -> Store {
        let store = store(name);
        let teams = store.entity_box(TEAM_ENTITY).unwrap();
        for title in ["Red", "Blue"] {
            teams
                .put(0, ObjectRecord::new().with(TITLE, title).encode_padded())
                .unwrap();
        }
        let people = store.entity_box(PERSON).unwrap();
        people.put(0, person("Ann", 31, 1.5, 1)).unwrap();
        people.put(0, person("Bob", 25, 2.5, 2)).unwrap();
        people.put(0, person("carl", 40, 0.5, 1)).unwrap();
        people
            .put(0, ObjectRecord::new().with(NAME, "Dora").encode_padded())
            .unwrap();
        store
    }

    fn names(query: &Query) -> Vec<String> {
        query
            .find()
            .unwrap()
            .iter()
            .map(|data| {
                ObjectRecord::decode(data).unwrap().get(NAME).unwrap().as_text().unwrap().to_string()
            })
            .collect()
    }

    #[test]
    fn case_insensitive_equality_finds_first_person() {
        let store = store("scenario");
        let people = store.entity_box(PERSON).unwrap();
        people.put(0, person("Ann", 1, 0.0, 0)).unwrap();
        people.put(0, person("Bob", 2, 0.0, 0)).unwrap();

        let mut qb = people.query().unwrap();
        qb.equals_string(NAME, "ann", false).unwrap();
        let query = qb.build().unwrap();
        assert_eq!(query.find_ids().unwrap(), vec![1]);
        assert_eq!(names(&query), vec!["Ann"]);
    }

    #[test]
    fn indexed_and_scanned_conditions_agree() {
        let store = populated("index");
        let people = store.entity_box(PERSON).unwrap();

        let mut qb = people.query().unwrap();
        qb.greater_int(AGE, 26).unwrap();
        let by_index = qb.build().unwrap();
        assert_eq!(by_index.find_ids().unwrap(), vec![1, 3]);

        let mut qb = people.query().unwrap();
        qb.greater_double(SCORE, 1.0).unwrap();
        assert_eq!(qb.build().unwrap().find_ids().unwrap(), vec![1, 2]);

        let before = store.stats();
        by_index.count().unwrap();
        let after = store.stats();
        assert_eq!(after.index_lookups, before.index_lookups + 1);
    }

    #[test]
    fn any_all_and_stale_handles() {
        let store = populated("combine");
        let people = store.entity_box(PERSON).unwrap();
        let mut qb = people.query().unwrap();
        let young = qb.less_int(AGE, 30).unwrap();
        let old = qb.greater_int(AGE, 35).unwrap();
        let either = qb.any(&[young, old]).unwrap();
        let named = qb.starts_with_string(NAME, "b", false).unwrap();

        let err = qb.all(&[young, named]).unwrap_err();
        assert!(matches!(err, CoreError::IllegalArgument { .. }));
        assert!(qb.error().is_some());
        assert!(matches!(
            qb.all(&[either, named]),
            Err(CoreError::IllegalState { .. })
        ));
        assert!(qb.build().is_err());

        let mut qb = people.query().unwrap();
        let young = qb.less_int(AGE, 30).unwrap();
        let old = qb.greater_int(AGE, 35).unwrap();
        let either = qb.any(&[young, old]).unwrap();
        let named = qb.starts_with_string(NAME, "b", false).unwrap();
        qb.all(&[either, named]).unwrap();
        assert_eq!(qb.build().unwrap().find_ids().unwrap(), vec![2]);
    }

    #[test]
    fn type_checks() {
        let store = populated("types");
        let people = store.entity_box(PERSON).unwrap();
        let mut qb = people.query().unwrap();
        assert!(matches!(
            qb.equals_int(NAME, 1),
            Err(CoreError::PropertyTypeMismatch { .. })
        ));
        let mut qb = people.query().unwrap();
        assert!(matches!(
            qb.greater_double(AGE, 1.0),
            Err(CoreError::PropertyTypeMismatch { .. })
        ));
        let mut qb = people.query().unwrap();
        assert!(matches!(qb.is_null(99), Err(CoreError::IllegalArgument { .. })));
    }

    #[test]
    fn ordering_offset_limit() {
        let store = populated("order");
        let people = store.entity_box(PERSON).unwrap();
        let mut qb = people.query().unwrap();
        qb.order(AGE, OrderFlags::DESCENDING | OrderFlags::NULLS_LAST).unwrap();
        let mut query = qb.build().unwrap();
        assert_eq!(names(&query), vec!["carl", "Ann", "Bob", "Dora"]);
        query.offset(1).limit(2);
        assert_eq!(names(&query), vec!["Ann", "Bob"]);
        assert_eq!(query.count().unwrap(), 2);
        // first ignores the window
        let first = query.find_first().unwrap().unwrap();
        assert_eq!(ObjectRecord::decode(&first).unwrap().get(NAME), Some(&Value::from("carl")));

        let mut qb = people.query().unwrap();
        qb.order(NAME, OrderFlags::NONE).unwrap();
        assert_eq!(names(&qb.build().unwrap()), vec!["Ann", "Bob", "carl", "Dora"]);
        let mut qb = people.query().unwrap();
        qb.order(NAME, OrderFlags::CASE_SENSITIVE).unwrap();
        assert_eq!(names(&qb.build().unwrap()), vec!["Ann", "Bob", "Dora", "carl"]);
    }

    #[test]
    fn nulls_and_string_vectors() {
        let store = populated("nulls");
        let people = store.entity_box(PERSON).unwrap();
        let mut qb = people.query().unwrap();
        qb.is_null(AGE).unwrap();
        assert_eq!(qb.build().unwrap().find_ids().unwrap(), vec![4]);

        let mut qb = people.query().unwrap();
        qb.not_equals_int(AGE, 31).unwrap();
        assert_eq!(qb.build().unwrap().find_ids().unwrap(), vec![2, 3]);

        let mut qb = people.query().unwrap();
        qb.any_equals_string(TAGS, "BOB-TAG", false).unwrap();
        assert_eq!(qb.build().unwrap().find_ids().unwrap(), vec![2]);
    }

    #[test]
    fn unique_and_visit() {
        let store = populated("unique");
        let people = store.entity_box(PERSON).unwrap();
        let mut qb = people.query().unwrap();
        qb.in_int64s(AGE, &[25, 40]).unwrap();
        let query = qb.build().unwrap();
        assert!(matches!(
            query.find_unique(),
            Err(CoreError::NonUniqueResult { count: 2 })
        ));
        let mut seen = Vec::new();
        query
            .visit(|id, _| {
                seen.push(id);
                false
            })
            .unwrap();
        assert_eq!(seen, vec![2]);

        let mut qb = people.query().unwrap();
        qb.equals_string(NAME, "nobody", true).unwrap();
        assert_eq!(qb.build().unwrap().find_unique().unwrap(), None);
    }

    #[test]
    fn parameters_by_property_and_alias() {
        let store = populated("params");
        let people = store.entity_box(PERSON).unwrap();
        let mut qb = people.query().unwrap();
        qb.greater_int(AGE, 0).unwrap();
        qb.alias("min").unwrap();
        qb.less_int(AGE, 100).unwrap();
        qb.alias("max").unwrap();
        qb.equals_string(NAME, "x", false).unwrap();
        let mut query = qb.build().unwrap();
        assert!(query.find_ids().unwrap().is_empty());

        query.set_param(PERSON, NAME, ParamValue::String("BOB".into())).unwrap();
        assert_eq!(query.find_ids().unwrap(), vec![2]);

        // two conditions on age need aliases
        assert!(query.set_param(PERSON, AGE, ParamValue::Int(1)).is_err());
        query.set_param(PERSON, NAME, ParamValue::String("carl".into())).unwrap();
        query.set_param_alias("max", ParamValue::Int(35)).unwrap();
        assert!(query.find_ids().unwrap().is_empty());
        query.set_param_alias("max", ParamValue::Int(45)).unwrap();
        assert_eq!(query.find_ids().unwrap(), vec![3]);

        let err = query.set_param_alias("min", ParamValue::Double(1.0)).unwrap_err();
        assert!(matches!(err, CoreError::IllegalArgument { .. }));
        assert!(query.set_param_alias("nope", ParamValue::Int(1)).is_err());
        assert!(query.describe_params().contains("age < 45 as max"));
    }

    #[test]
    fn deterministic_and_cloneable() {
        let store = populated("clone");
        let people = store.entity_box(PERSON).unwrap();
        let mut qb = people.query().unwrap();
        qb.not_null(NAME).unwrap();
        qb.order(SCORE, OrderFlags::NONE).unwrap();
        let query = qb.build().unwrap();
        let first = query.find_ids().unwrap();
        assert_eq!(first, query.find_ids().unwrap());

        let copy = query.clone();
        let handle = std::thread::spawn(move || copy.find_ids().unwrap());
        assert_eq!(handle.join().unwrap(), first);
        assert!(query.describe().starts_with("Query for entity Person with 1 conditions"));
    }

    #[test]
    fn property_and_standalone_links() {
        let store = populated("links");
        let people = store.entity_box(PERSON).unwrap();
        let teams = store.entity_box(TEAM_ENTITY).unwrap();

        let mut qb = people.query().unwrap();
        qb.link_property(TEAM).unwrap().equals_string(TITLE, "red", false).unwrap();
        assert_eq!(qb.build().unwrap().find_ids().unwrap(), vec![1, 3]);

        let mut qb = teams.query().unwrap();
        qb.backlink_property(PERSON, TEAM).unwrap().less_int(AGE, 30).unwrap();
        assert_eq!(qb.build().unwrap().find_ids().unwrap(), vec![2]);

        people.rel_put(FANS, 4, 2).unwrap();
        let mut qb = people.query().unwrap();
        qb.link_standalone(FANS).unwrap().equals_string(TITLE, "Blue", true).unwrap();
        assert_eq!(qb.build().unwrap().find_ids().unwrap(), vec![4]);

        let mut qb = teams.query().unwrap();
        qb.backlink_standalone(FANS).unwrap().equals_string(NAME, "Dora", true).unwrap();
        assert_eq!(qb.build().unwrap().find_ids().unwrap(), vec![2]);

        let mut qb = people.query().unwrap();
        assert!(qb.link_property(NAME).is_err());
        let mut qb = people.query().unwrap();
        assert!(qb.backlink_standalone(FANS).is_err());
    }

    #[test]
    fn relation_count_condition() {
        let store = populated("count");
        let teams = store.entity_box(TEAM_ENTITY).unwrap();
        let mut qb = teams.query().unwrap();
        qb.relation_count(PERSON, TEAM, 2).unwrap();
        let query = qb.build().unwrap();
        assert_eq!(query.find_ids().unwrap(), vec![1]);

        let mut qb = teams.query().unwrap();
        qb.relation_count(PERSON, TEAM, 0).unwrap();
        assert!(qb.build().unwrap().find_ids().unwrap().is_empty());

        let mut qb = teams.query().unwrap();
        assert!(qb.relation_count(PERSON, NAME, 1).is_err());
    }

    #[test]
    fn remove_matches_and_sees_pending_writes() {
        let store = populated("remove");
        let people = store.entity_box(PERSON).unwrap();
        let mut qb = people.query().unwrap();
        qb.greater_or_equal_int(AGE, 31).unwrap();
        let query = qb.build().unwrap();
        assert_eq!(query.remove().unwrap(), 2);
        assert_eq!(people.count(0).unwrap(), 2);

        store
            .run_in_write_tx(|_| {
                people.put(0, person("Eve", 50, 0.0, 0))?;
                assert_eq!(query.find_ids()?, vec![5]);
                Ok(())
            })
            .unwrap();
        assert_eq!(query.count().unwrap(), 1);
    }

    #[test]
    fn indexed_queries_see_pending_puts_and_removes() {
        let store = populated("pending");
        let people = store.entity_box(PERSON).unwrap();
        assert_eq!(people.put(0, nicked("Eve", "ev", 52)).unwrap(), 5);

        let mut qb = people.query().unwrap();
        qb.greater_or_equal_int(AGE, 31).unwrap();
        let by_age = qb.build().unwrap();
        let mut qb = people.query().unwrap();
        qb.equals_string(NICK, "ev", true).unwrap();
        let by_nick = qb.build().unwrap();
        assert_eq!(by_age.find_ids().unwrap(), vec![1, 3, 5]);
        assert_eq!(by_nick.find_ids().unwrap(), vec![5]);

        store
            .run_in_write_tx(|_| {
                assert_eq!(people.put(0, nicked("Finn", "ev", 60))?, 6);
                people.remove(1)?;
                people.put(3, person("carl", 20, 0.5, 1))?;

                // ordered index: new match, removed match, match moved out
                assert_eq!(by_age.find_ids()?, vec![5, 6]);
                assert_eq!(by_age.count()?, 2);
                let oldest = by_age.property(AGE)?.max_int()?;
                assert_eq!((oldest.value, oldest.count), (60, 2));
                assert_eq!(by_age.property(AGE)?.sum_int()?.value, 112);

                // hash index
                assert_eq!(by_nick.find_ids()?, vec![5, 6]);
                people.remove(5)?;
                assert_eq!(by_nick.find_ids()?, vec![6]);
                assert_eq!(by_nick.count()?, 1);
                assert_eq!(by_nick.property(NAME)?.find_strings(None)?, vec!["Finn"]);

                assert_eq!(by_age.remove()?, 1);
                assert!(by_nick.find_ids()?.is_empty());
                Ok(())
            })
            .unwrap();

        assert!(by_age.find_ids().unwrap().is_empty());
        assert!(by_nick.find_ids().unwrap().is_empty());
        assert_eq!(people.count(0).unwrap(), 3);
    }

    #[test]
    fn aborted_transaction_hides_pending_writes_from_later_queries() {
        let store = populated("pending_abort");
        let people = store.entity_box(PERSON).unwrap();
        let mut qb = people.query().unwrap();
        qb.equals_int(AGE, 77).unwrap();
        let query = qb.build().unwrap();

        let mut txn = store.begin_write().unwrap();
        people.put(0, person("Gus", 77, 0.0, 0)).unwrap();
        assert_eq!(query.count().unwrap(), 1);
        txn.abort().unwrap();
        assert_eq!(query.count().unwrap(), 0);
    }

    #[test]
    fn debug_logging_does_not_change_results() {
        let store = populated("debug");
        store.set_debug_flags(DebugFlags::LOG_QUERIES | DebugFlags::LOG_QUERY_PARAMETERS);
        let people = store.entity_box(PERSON).unwrap();
        let mut qb = people.query().unwrap();
        qb.between_ints(AGE, 20, 30).unwrap();
        let mut query = qb.build().unwrap();
        assert_eq!(query.find_ids().unwrap(), vec![2]);
        query.set_param(PERSON, AGE, ParamValue::Ints(30, 45)).unwrap();
        assert_eq!(query.find_ids().unwrap(), vec![1, 3]);
    }

    #[test]
    fn closed_store_rejects_queries() {
        let store = populated("closed");
        let people = store.entity_box(PERSON).unwrap();
        let query = people.query().unwrap().build().unwrap();
        store.close().unwrap();
        assert!(matches!(query.find(), Err(CoreError::StoreClosed)));
        assert!(people.query().is_err());
    }
}
