//! Condition tree of a query.

use std::cmp::Ordering;
use std::fmt;

use boxdb_codec::Value;

use crate::model::{Property, PropertyType, SchemaId};

/// Comparison applied by a leaf condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    IsNull,
    NotNull,
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Between,
    In,
    NotIn,
    Contains,
    ContainsElement,
    StartsWith,
    EndsWith,
    AnyEquals,
    RelationCount,
}

impl Op {
    fn symbol(self) -> &'static str {
        match self {
            Self::IsNull => "is null",
            Self::NotNull => "is not null",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Between => "between",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Contains => "contains",
            Self::ContainsElement => "contains element",
            Self::StartsWith => "starts with",
            Self::EndsWith => "ends with",
            Self::AnyEquals => "any ==",
            Self::RelationCount => "relation count ==",
        }
    }
}

/// Literal compared against, replaceable through query parameters.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    None,
    Int(i64),
    IntPair(i64, i64),
    Int64s(Vec<i64>),
    Int32s(Vec<i32>),
    Double(f64),
    DoublePair(f64, f64),
    Text(String),
    Texts(Vec<String>),
    Bytes(Vec<u8>),
}

impl Operand {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::None => "nothing",
            Self::Int(_) => "int",
            Self::IntPair(..) => "int pair",
            Self::Int64s(_) => "int64 list",
            Self::Int32s(_) => "int32 list",
            Self::Double(_) => "double",
            Self::DoublePair(..) => "double pair",
            Self::Text(_) => "string",
            Self::Texts(_) => "string list",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::Int(n) => write!(f, "{n}"),
            Self::IntPair(a, b) => write!(f, "{a} and {b}"),
            Self::Int64s(values) => write!(f, "{values:?}"),
            Self::Int32s(values) => write!(f, "{values:?}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::DoublePair(a, b) => write!(f, "{a} and {b}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Texts(values) => write!(f, "{values:?}"),
            Self::Bytes(b) => write!(f, "byte[{}]", b.len()),
        }
    }
}

/// A single comparison on one property.
///
/// For [`Op::RelationCount`] `entity` and `property` name the to-one
/// relation in the source entity, not a property of the queried one.
#[derive(Debug, Clone)]
pub(crate) struct Leaf {
    pub(crate) entity: SchemaId,
    pub(crate) property: SchemaId,
    pub(crate) name: String,
    pub(crate) ptype: PropertyType,
    pub(crate) unsigned: bool,
    pub(crate) op: Op,
    pub(crate) operand: Operand,
    pub(crate) case_sensitive: bool,
    pub(crate) alias: Option<String>,
}

impl Leaf {
    pub(crate) fn new(entity: SchemaId, property: &Property, op: Op, operand: Operand) -> Self {
        Self {
            entity,
            property: property.id,
            name: property.name.clone(),
            ptype: property.ptype,
            unsigned: property.is_unsigned(),
            op,
            operand,
            case_sensitive: true,
            alias: None,
        }
    }

    /// Evaluates the condition on a field value; `None` is a missing field.
    ///
    /// Null fields only ever match [`Op::IsNull`]. Relation counts are
    /// not decided here.
    pub(crate) fn matches(&self, value: Option<&Value>) -> bool {
        let value = value.filter(|v| !v.is_null());
        match (self.op, value) {
            (Op::IsNull, v) => v.is_none(),
            (Op::NotNull, v) => v.is_some(),
            (_, None) | (Op::RelationCount, _) => false,
            (_, Some(value)) => self.matches_present(value),
        }
    }

    fn matches_present(&self, value: &Value) -> bool {
        match &self.operand {
            Operand::Int(n) => integer(value).is_some_and(|v| self.compare_int(v, *n)),
            Operand::IntPair(low, high) => integer(value).is_some_and(|v| {
                self.order_int(v, *low) != Ordering::Less && self.order_int(v, *high) != Ordering::Greater
            }),
            Operand::Int64s(values) => integer(value).is_some_and(|v| {
                let found = values.contains(&v);
                if self.op == Op::NotIn {
                    !found
                } else {
                    found
                }
            }),
            Operand::Int32s(values) => integer(value).is_some_and(|v| {
                let found = values.iter().any(|&x| i64::from(x) == v);
                if self.op == Op::NotIn {
                    !found
                } else {
                    found
                }
            }),
            Operand::Double(d) => value.as_float().is_some_and(|v| compare(self.op, v.total_cmp(d))),
            Operand::DoublePair(low, high) => value.as_float().is_some_and(|v| v >= *low && v <= *high),
            Operand::Text(s) => self.matches_text(value, s),
            Operand::Texts(values) => value.as_text().is_some_and(|v| {
                values.iter().any(|candidate| self.text_order(v, candidate) == Ordering::Equal)
            }),
            Operand::Bytes(b) => value
                .as_bytes()
                .is_some_and(|v| compare(self.op, v.cmp(b.as_slice()))),
            Operand::None => false,
        }
    }

    fn matches_text(&self, value: &Value, wanted: &str) -> bool {
        if let Some(items) = value.as_array() {
            let mut texts = items.iter().filter_map(Value::as_text);
            return match self.op {
                Op::ContainsElement | Op::AnyEquals => {
                    texts.any(|item| self.text_order(item, wanted) == Ordering::Equal)
                }
                Op::Contains => texts.any(|item| self.contains(item, wanted)),
                _ => false,
            };
        }
        let Some(text) = value.as_text() else {
            return false;
        };
        match self.op {
            Op::Contains => self.contains(text, wanted),
            Op::StartsWith => self.fold(text).starts_with(&self.fold(wanted)),
            Op::EndsWith => self.fold(text).ends_with(&self.fold(wanted)),
            op => compare(op, self.text_order(text, wanted)),
        }
    }

    fn contains(&self, text: &str, wanted: &str) -> bool {
        self.fold(text).contains(&self.fold(wanted))
    }

    fn fold(&self, text: &str) -> String {
        if self.case_sensitive {
            text.to_string()
        } else {
            text.to_lowercase()
        }
    }

    fn text_order(&self, a: &str, b: &str) -> Ordering {
        if self.case_sensitive {
            a.cmp(b)
        } else {
            a.to_lowercase().cmp(&b.to_lowercase())
        }
    }

    #[allow(clippy::cast_sign_loss)]
    fn order_int(&self, value: i64, operand: i64) -> Ordering {
        if self.unsigned {
            (value as u64).cmp(&(operand as u64))
        } else {
            value.cmp(&operand)
        }
    }

    fn compare_int(&self, value: i64, operand: i64) -> bool {
        compare(self.op, self.order_int(value, operand))
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(n) => Some(*n),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn compare(op: Op, order: Ordering) -> bool {
    match op {
        Op::Equal | Op::AnyEquals | Op::ContainsElement | Op::In => order == Ordering::Equal,
        Op::NotEqual => order != Ordering::Equal,
        Op::Greater => order == Ordering::Greater,
        Op::GreaterOrEqual => order != Ordering::Less,
        Op::Less => order == Ordering::Less,
        Op::LessOrEqual => order != Ordering::Greater,
        _ => false,
    }
}

/// A node of the condition tree.
#[derive(Debug, Clone)]
pub(crate) enum Expr {
    Leaf(Leaf),
    All(Vec<Expr>),
    Any(Vec<Expr>),
}

impl Expr {
    /// Leaves of the tree, depth first.
    pub(crate) fn leaves(&self) -> Vec<&Leaf> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a Leaf>) {
        match self {
            Self::Leaf(leaf) => out.push(leaf),
            Self::All(children) | Self::Any(children) => {
                for child in children {
                    child.collect(out);
                }
            }
        }
    }

    pub(crate) fn leaves_mut(&mut self) -> Vec<&mut Leaf> {
        match self {
            Self::Leaf(leaf) => vec![leaf],
            Self::All(children) | Self::Any(children) => {
                children.iter_mut().flat_map(Self::leaves_mut).collect()
            }
        }
    }

    /// Leaves that every match must satisfy.
    pub(crate) fn required_leaves(&self) -> Vec<&Leaf> {
        match self {
            Self::Leaf(leaf) => vec![leaf],
            Self::All(children) => children.iter().flat_map(Self::required_leaves).collect(),
            Self::Any(children) if children.len() == 1 => children[0].required_leaves(),
            Self::Any(_) => Vec::new(),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaf(leaf) => {
                write!(f, "{} {}", leaf.name, leaf.op.symbol())?;
                if leaf.operand != Operand::None {
                    write!(f, " {}", leaf.operand)?;
                }
                if !leaf.case_sensitive {
                    f.write_str(" (case insensitive)")?;
                }
                if let Some(alias) = &leaf.alias {
                    write!(f, " as {alias}")?;
                }
                Ok(())
            }
            Self::All(children) | Self::Any(children) => {
                let joiner = if matches!(self, Self::All(_)) { " AND " } else { " OR " };
                f.write_str("(")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(joiner)?;
                    }
                    write!(f, "{child}")?;
                }
                f.write_str(")")
            }
        }
    }
}
