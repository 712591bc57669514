//! Single-property reads and aggregates over query results.

use std::collections::HashSet;

use boxdb_codec::Value;

use crate::error::{CoreError, CoreResult};
use crate::model::{Property, PropertyType, SchemaId};
use crate::query::compiled::Query;

/// Result of an aggregate together with the number of values it covered.
///
/// `count` is -1 when a floating point aggregate hit NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate<T> {
    /// Aggregated value; 0 when no value was seen.
    pub value: T,
    /// Number of non-null values aggregated.
    pub count: i64,
}

/// Reads one property of the objects a [`Query`] matches.
///
/// Null and missing values are skipped unless a replacement is given.
#[derive(Debug, Clone)]
pub struct PropertyQuery {
    query: Query,
    property: Property,
    distinct: bool,
    case_sensitive: bool,
}

impl PropertyQuery {
    pub(crate) fn new(query: Query, property: SchemaId) -> CoreResult<Self> {
        let entity = query.entity_id();
        let property = query
            .store()
            .model
            .entity(entity)
            .and_then(|e| e.property(property))
            .cloned()
            .ok_or_else(|| {
                CoreError::illegal_argument(format!("entity {entity} has no property {property}"))
            })?;
        Ok(Self {
            query,
            property,
            distinct: false,
            case_sensitive: true,
        })
    }

    /// Returns each value once.
    pub fn distinct(&mut self, distinct: bool) -> &mut Self {
        self.distinct = distinct;
        self
    }

    /// Returns each string once, comparing case-insensitively unless
    /// `case_sensitive`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] unless the property is a
    /// string.
    pub fn distinct_case(&mut self, distinct: bool, case_sensitive: bool) -> CoreResult<&mut Self> {
        if self.property.ptype != PropertyType::String {
            return Err(CoreError::illegal_argument(format!(
                "case-sensitivity applies to string properties, {} is {}",
                self.property.name, self.property.ptype
            )));
        }
        self.distinct = distinct;
        self.case_sensitive = case_sensitive;
        Ok(self)
    }

    fn values(&self) -> CoreResult<Vec<Option<Value>>> {
        Ok(self
            .query
            .rows()?
            .into_iter()
            .map(|(_, record, _)| record.get(self.property.id).filter(|v| !v.is_null()).cloned())
            .collect())
    }

    fn require(&self, ok: bool, expected: &str) -> CoreResult<()> {
        if ok {
            Ok(())
        } else {
            Err(CoreError::type_mismatch(format!(
                "{} needs {expected}, property {} is {}",
                if self.distinct { "distinct read" } else { "read" },
                self.property.name,
                self.property.ptype
            )))
        }
    }

    /// Number of non-null values, or of distinct values.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count(&self) -> CoreResult<u64> {
        let values = self.values()?.into_iter().flatten();
        if !self.distinct {
            return Ok(values.count() as u64);
        }
        let mut seen = HashSet::new();
        for value in values {
            seen.insert(self.distinct_key(&value));
        }
        Ok(seen.len() as u64)
    }

    fn distinct_key(&self, value: &Value) -> String {
        match value {
            Value::Text(s) if !self.case_sensitive => s.to_lowercase(),
            Value::Float(f) => f.to_bits().to_string(),
            other => format!("{other:?}"),
        }
    }

    /// Values of a string property.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] for other properties.
    pub fn find_strings(&self, null_value: Option<&str>) -> CoreResult<Vec<String>> {
        self.require(self.property.ptype == PropertyType::String, "a string property")?;
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for value in self.values()? {
            let text = match value {
                Some(Value::Text(s)) => s,
                _ => match null_value {
                    Some(s) => s.to_string(),
                    None => continue,
                },
            };
            let key = if self.case_sensitive { text.clone() } else { text.to_lowercase() };
            if self.distinct && !seen.insert(key) {
                continue;
            }
            out.push(text);
        }
        Ok(out)
    }

    /// Values of an integer property.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] for other properties.
    pub fn find_ints(&self, null_value: Option<i64>) -> CoreResult<Vec<i64>> {
        self.require(self.property.ptype.is_integer(), "an integer property")?;
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for value in self.values()? {
            let n = match value.as_ref().and_then(Value::as_integer) {
                Some(n) => n,
                None => match null_value {
                    Some(n) => n,
                    None => continue,
                },
            };
            if self.distinct && !seen.insert(n) {
                continue;
            }
            out.push(n);
        }
        Ok(out)
    }

    /// Values of a floating point property.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] for other properties.
    pub fn find_doubles(&self, null_value: Option<f64>) -> CoreResult<Vec<f64>> {
        self.require(self.property.ptype.is_float(), "a float property")?;
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for value in self.values()? {
            let f = match value.as_ref().and_then(Value::as_float) {
                Some(f) => f,
                None => match null_value {
                    Some(f) => f,
                    None => continue,
                },
            };
            if self.distinct && !seen.insert(f.to_bits()) {
                continue;
            }
            out.push(f);
        }
        Ok(out)
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
    fn numbers(&self) -> CoreResult<Vec<f64>> {
        self.require(self.property.ptype.is_numeric(), "a numeric property")?;
        let unsigned = self.property.is_unsigned();
        Ok(self
            .values()?
            .into_iter()
            .flatten()
            .filter_map(|value| match value {
                Value::Integer(n) if unsigned => Some(n as u64 as f64),
                other => other.as_float(),
            })
            .collect())
    }

    fn fold(values: Vec<f64>, f: impl Fn(f64, f64) -> f64) -> Aggregate<f64> {
        let count = values.len() as i64;
        let mut iter = values.into_iter();
        let Some(first) = iter.next() else {
            return Aggregate { value: 0.0, count: 0 };
        };
        let value = iter.fold(first, f);
        Aggregate {
            value,
            count: if value.is_nan() { -1 } else { count },
        }
    }

    /// Sum of a numeric property as a double.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] for non-numeric
    /// properties.
    pub fn sum(&self) -> CoreResult<Aggregate<f64>> {
        Ok(Self::fold(self.numbers()?, |a, b| a + b))
    }

    /// Mean of a numeric property.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] for non-numeric
    /// properties.
    #[allow(clippy::cast_precision_loss)]
    pub fn avg(&self) -> CoreResult<Aggregate<f64>> {
        let sum = self.sum()?;
        if sum.count <= 0 {
            return Ok(sum);
        }
        Ok(Aggregate {
            value: sum.value / sum.count as f64,
            count: sum.count,
        })
    }

    /// Smallest value of a numeric property.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] for non-numeric
    /// properties.
    pub fn min(&self) -> CoreResult<Aggregate<f64>> {
        Ok(Self::fold(self.numbers()?, |a, b| if a.is_nan() || b.is_nan() { f64::NAN } else { a.min(b) }))
    }

    /// Largest value of a numeric property.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] for non-numeric
    /// properties.
    pub fn max(&self) -> CoreResult<Aggregate<f64>> {
        Ok(Self::fold(self.numbers()?, |a, b| if a.is_nan() || b.is_nan() { f64::NAN } else { a.max(b) }))
    }

    #[allow(clippy::cast_sign_loss)]
    fn integers(&self) -> CoreResult<Vec<i128>> {
        self.require(self.property.ptype.is_integer(), "an integer property")?;
        let unsigned = self.property.is_unsigned();
        Ok(self
            .values()?
            .into_iter()
            .flatten()
            .filter_map(|value| value.as_integer())
            .map(|n| if unsigned { i128::from(n as u64) } else { i128::from(n) })
            .collect())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn narrow(&self, value: i128) -> CoreResult<i64> {
        if self.property.is_unsigned() {
            return u64::try_from(value)
                .map(|n| n as i64)
                .map_err(|_| CoreError::numeric_overflow(format!("{} aggregate out of range", self.property.name)));
        }
        i64::try_from(value)
            .map_err(|_| CoreError::numeric_overflow(format!("{} aggregate out of range", self.property.name)))
    }

    /// Exact sum of an integer property.
    ///
    /// Unsigned properties return the sum's bit pattern.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NumericOverflow`] if the sum leaves the
    /// property's 64-bit range.
    pub fn sum_int(&self) -> CoreResult<Aggregate<i64>> {
        let values = self.integers()?;
        let count = values.len() as i64;
        let mut total: i128 = 0;
        for n in values {
            total = total
                .checked_add(n)
                .ok_or_else(|| CoreError::numeric_overflow("integer sum overflowed"))?;
        }
        Ok(Aggregate {
            value: self.narrow(total)?,
            count,
        })
    }

    /// Integer mean, rounded toward zero.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] for non-integer
    /// properties.
    pub fn avg_int(&self) -> CoreResult<Aggregate<i64>> {
        let values = self.integers()?;
        let count = values.len() as i64;
        if count == 0 {
            return Ok(Aggregate { value: 0, count });
        }
        let total: i128 = values.iter().sum();
        Ok(Aggregate {
            value: self.narrow(total / i128::from(count))?,
            count,
        })
    }

    /// Smallest value of an integer property.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] for non-integer
    /// properties.
    pub fn min_int(&self) -> CoreResult<Aggregate<i64>> {
        let values = self.integers()?;
        let count = values.len() as i64;
        match values.into_iter().min() {
            Some(n) => Ok(Aggregate { value: self.narrow(n)?, count }),
            None => Ok(Aggregate { value: 0, count }),
        }
    }

    /// Largest value of an integer property.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PropertyTypeMismatch`] for non-integer
    /// properties.
    pub fn max_int(&self) -> CoreResult<Aggregate<i64>> {
        let values = self.integers()?;
        let count = values.len() as i64;
        match values.into_iter().max() {
            Some(n) => Ok(Aggregate { value: self.narrow(n)?, count }),
            None => Ok(Aggregate { value: 0, count }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, ModelBuilder, PropertyFlags};
    use crate::options::StoreOptions;
    use crate::store::Store;
    use boxdb_codec::ObjectRecord;

    const CITY: SchemaId = 2;
    const POP: SchemaId = 3;
    const AREA: SchemaId = 4;
    const CODE: SchemaId = 5;

    fn model() -> Model {
        ModelBuilder::new()
            .entity("City", 1, 100)
            .property("id", PropertyType::Long, 1, 101)
            .property_flags(PropertyFlags::ID)
            .property("name", PropertyType::String, CITY, 102)
            .property("population", PropertyType::Long, POP, 103)
            .property("area", PropertyType::Double, AREA, 104)
            .property("code", PropertyType::Long, CODE, 105)
            .property_flags(PropertyFlags::UNSIGNED)
            .build()
            .unwrap()
    }

    fn store(name: &str, rows: &[(&str, Option<i64>, Option<f64>)]) -> Store {
        let store = Store::open(StoreOptions::new().directory(format!("memory:{name}")).model(model())).unwrap();
        let cities = store.entity_box(1).unwrap();
        for (city, pop, area) in rows {
            let mut record = ObjectRecord::new().with(CITY, *city);
            if let Some(pop) = pop {
                record.set(POP, Value::Integer(*pop));
            }
            if let Some(area) = area {
                record.set(AREA, Value::Float(*area));
            }
            cities.put(0, record.encode_padded()).unwrap();
        }
        store
    }

    fn property(store: &Store, property: SchemaId) -> PropertyQuery {
        store.entity_box(1).unwrap().query().unwrap().build().unwrap().property(property).unwrap()
    }

    #[test]
    fn strings_with_distinct_and_nulls() {
        let store = store(
            "strings",
            &[("Oslo", Some(700), None), ("oslo", None, Some(2.0)), ("Bergen", Some(285), Some(4.0))],
        );
        let mut names = property(&store, CITY);
        assert_eq!(names.find_strings(None).unwrap(), vec!["Oslo", "oslo", "Bergen"]);
        names.distinct_case(true, false).unwrap();
        assert_eq!(names.find_strings(None).unwrap(), vec!["Oslo", "Bergen"]);
        assert_eq!(names.count().unwrap(), 2);
        names.distinct_case(true, true).unwrap();
        assert_eq!(names.count().unwrap(), 3);

        assert!(property(&store, POP).distinct_case(true, false).is_err());
        assert_eq!(property(&store, POP).find_ints(Some(-1)).unwrap(), vec![700, -1, 285]);
        assert_eq!(property(&store, POP).count().unwrap(), 2);
        assert!(matches!(
            property(&store, POP).find_strings(None),
            Err(CoreError::PropertyTypeMismatch { .. })
        ));
    }

    #[test]
    fn float_aggregates() {
        let store = store("floats", &[("a", Some(1), Some(2.0)), ("b", Some(2), None), ("c", Some(6), Some(4.0))]);
        let area = property(&store, AREA);
        assert_eq!(area.sum().unwrap(), Aggregate { value: 6.0, count: 2 });
        assert_eq!(area.avg().unwrap(), Aggregate { value: 3.0, count: 2 });
        assert_eq!(area.min().unwrap().value, 2.0);
        assert_eq!(area.max().unwrap().value, 4.0);
        assert_eq!(property(&store, POP).avg().unwrap(), Aggregate { value: 3.0, count: 3 });
        assert_eq!(property(&store, AREA).find_doubles(Some(0.0)).unwrap(), vec![2.0, 0.0, 4.0]);

        let empty = store.entity_box(1).unwrap();
        let mut qb = empty.query().unwrap();
        qb.equals_string(CITY, "none", true).unwrap();
        let none = qb.build().unwrap().property(AREA).unwrap();
        assert_eq!(none.avg().unwrap(), Aggregate { value: 0.0, count: 0 });
    }

    #[test]
    fn nan_marks_count() {
        let store = store("nan", &[("a", None, Some(f64::NAN)), ("b", None, Some(1.0))]);
        assert_eq!(property(&store, AREA).max().unwrap().count, -1);
        assert_eq!(property(&store, AREA).sum().unwrap().count, -1);
    }

    #[test]
    fn integer_aggregates() {
        let store = store("ints", &[("a", Some(-5), None), ("b", Some(10), None), ("c", Some(2), None)]);
        let pop = property(&store, POP);
        assert_eq!(pop.sum_int().unwrap(), Aggregate { value: 7, count: 3 });
        assert_eq!(pop.min_int().unwrap().value, -5);
        assert_eq!(pop.max_int().unwrap().value, 10);
        assert_eq!(pop.avg_int().unwrap().value, 2);
        assert!(matches!(
            property(&store, AREA).sum_int(),
            Err(CoreError::PropertyTypeMismatch { .. })
        ));
    }

    #[test]
    fn integer_sum_overflow() {
        let store = store("overflow", &[("a", Some(i64::MAX), None), ("b", Some(1), None)]);
        assert!(matches!(
            property(&store, POP).sum_int(),
            Err(CoreError::NumericOverflow { .. })
        ));
        // the double sum does not overflow
        assert_eq!(property(&store, POP).sum().unwrap().count, 2);
    }

    #[test]
    fn unsigned_values() {
        let store = store("unsigned", &[]);
        let cities = store.entity_box(1).unwrap();
        for code in [-1_i64, 1] {
            cities
                .put(0, ObjectRecord::new().with(CODE, Value::Integer(code)).encode_padded())
                .unwrap();
        }
        let code = property(&store, CODE);
        assert_eq!(code.max_int().unwrap().value, -1);
        assert_eq!(code.min_int().unwrap().value, 1);
        assert!(code.sum_int().is_err());
    }

    #[test]
    fn window_applies() {
        let store = store("window", &[("a", Some(1), None), ("b", Some(2), None), ("c", Some(3), None)]);
        let mut query = store.entity_box(1).unwrap().query().unwrap().build().unwrap();
        query.offset(1).limit(1);
        assert_eq!(query.property(POP).unwrap().find_ints(None).unwrap(), vec![2]);
        assert!(query.property(99).is_err());
    }
}
