//! Query parameters: new operands for conditions of a built query.

use crate::error::{CoreError, CoreResult};
use crate::query::condition::{Leaf, Op, Operand};

/// A replacement value for a condition's operand.
///
/// The variant must match the operand the condition was built with, e.g.
/// [`ParamValue::Ints`] for a `between` condition on an integer property.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Single string.
    String(String),
    /// String list of an `in` condition.
    Strings(Vec<String>),
    /// Single integer.
    Int(i64),
    /// Bounds of an integer `between`.
    Ints(i64, i64),
    /// 64-bit list of an `in`/`not in` condition.
    Int64s(Vec<i64>),
    /// 32-bit list of an `in`/`not in` condition.
    Int32s(Vec<i32>),
    /// Single floating point value.
    Double(f64),
    /// Bounds of a floating point `between`.
    Doubles(f64, f64),
    /// Byte string.
    Bytes(Vec<u8>),
}

impl ParamValue {
    fn name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Strings(_) => "string list",
            Self::Int(_) => "int",
            Self::Ints(..) => "int pair",
            Self::Int64s(_) => "int64 list",
            Self::Int32s(_) => "int32 list",
            Self::Double(_) => "double",
            Self::Doubles(..) => "double pair",
            Self::Bytes(_) => "bytes",
        }
    }

    fn into_operand(self) -> Operand {
        match self {
            Self::String(s) => Operand::Text(s),
            Self::Strings(v) => Operand::Texts(v),
            Self::Int(n) => Operand::Int(n),
            Self::Ints(a, b) => Operand::IntPair(a, b),
            Self::Int64s(v) => Operand::Int64s(v),
            Self::Int32s(v) => Operand::Int32s(v),
            Self::Double(d) => Operand::Double(d),
            Self::Doubles(a, b) => Operand::DoublePair(a, b),
            Self::Bytes(b) => Operand::Bytes(b),
        }
    }
}

/// Replaces the operand of `leaf`, keeping its kind.
pub(crate) fn apply(leaf: &mut Leaf, value: ParamValue) -> CoreResult<()> {
    if leaf.op == Op::RelationCount {
        return Err(CoreError::illegal_argument(format!(
            "the relation count condition on {} takes no parameters",
            leaf.name
        )));
    }
    let operand = value.clone().into_operand();
    if std::mem::discriminant(&operand) != std::mem::discriminant(&leaf.operand) {
        return Err(CoreError::illegal_argument(format!(
            "condition on {} expects a {} parameter, got {}",
            leaf.name,
            leaf.operand.kind(),
            value.name()
        )));
    }
    leaf.operand = operand;
    Ok(())
}

/// Picks the single leaf a parameter addresses.
pub(crate) fn single<'a>(
    mut leaves: Vec<&'a mut Leaf>,
    what: impl Fn() -> String,
) -> CoreResult<&'a mut Leaf> {
    match leaves.len() {
        0 => Err(CoreError::illegal_argument(format!("no condition for {}", what()))),
        1 => Ok(leaves.remove(0)),
        n => Err(CoreError::illegal_argument(format!(
            "{n} conditions match {}; set an alias to tell them apart",
            what()
        ))),
    }
}
