//! Validation and preparation of object records before they are stored.

use boxdb_codec::{padding_for, ObjectRecord, Value, RECORD_ALIGNMENT};

use crate::error::{CoreError, CoreResult};
use crate::model::{Entity, Property, PropertyFlags, PropertyType};
use crate::options::PaddingMode;

/// Applies the padding policy to caller bytes.
pub(crate) fn apply_padding(mut data: Vec<u8>, mode: PaddingMode) -> CoreResult<Vec<u8>> {
    let missing = padding_for(data.len());
    if missing == 0 {
        return Ok(data);
    }
    match mode {
        PaddingMode::Automatic => {}
        PaddingMode::AllowedByBuffer => {
            if data.capacity() < data.len() + missing {
                return Err(CoreError::illegal_argument(format!(
                    "object of {} bytes needs {missing} padding bytes but the buffer has no spare capacity",
                    data.len()
                )));
            }
        }
        PaddingMode::ByCaller => {
            return Err(CoreError::illegal_argument(format!(
                "object size {} is not a multiple of {RECORD_ALIGNMENT}",
                data.len()
            )));
        }
    }
    data.resize(data.len() + missing, 0);
    Ok(data)
}

/// Decodes caller bytes into a record.
pub(crate) fn decode(data: &[u8]) -> CoreResult<ObjectRecord> {
    ObjectRecord::decode(data)
        .map_err(|err| CoreError::illegal_argument(format!("malformed object: {err}")))
}

/// Decodes stored bytes; failures mean the data file is damaged.
pub(crate) fn decode_stored(data: &[u8]) -> CoreResult<ObjectRecord> {
    ObjectRecord::decode(data)
        .map_err(|err| CoreError::pages_corrupt(format!("stored object does not decode: {err}")))
}

/// Checks every field of `record` against the entity's properties.
pub(crate) fn validate(entity: &Entity, record: &ObjectRecord) -> CoreResult<()> {
    for (id, value) in record.fields() {
        let property = entity.property(id).ok_or_else(|| {
            CoreError::illegal_argument(format!(
                "entity {} has no property with ID {id}",
                entity.name
            ))
        })?;
        if !value_fits(property, value) {
            return Err(CoreError::type_mismatch(format!(
                "{}.{} is {} but got {}",
                entity.name,
                property.name,
                property.ptype,
                value.type_name()
            )));
        }
    }
    for property in &entity.properties {
        if property.is_id() || !property.flags.contains(PropertyFlags::NOT_NULL) {
            continue;
        }
        if record.get(property.id).map_or(true, Value::is_null) {
            return Err(CoreError::ConstraintViolated {
                message: format!("{}.{} must not be null", entity.name, property.name),
            });
        }
    }
    Ok(())
}

/// Returns true if `value` may be stored in `property`.
pub(crate) fn value_fits(property: &Property, value: &Value) -> bool {
    let unsigned = property.is_unsigned();
    match (property.ptype, value) {
        (_, Value::Null) | (PropertyType::Flex, _) => true,
        (PropertyType::Bool, Value::Bool(_)) => true,
        (PropertyType::Bool, Value::Integer(n)) => matches!(n, 0 | 1),
        (ptype, Value::Integer(n)) if ptype.is_integer() => integer_fits(ptype, *n, unsigned),
        (ptype, Value::Integer(_) | Value::Float(_)) if ptype.is_float() => true,
        (PropertyType::String, Value::Text(_)) | (PropertyType::ByteVector, Value::Bytes(_)) => {
            true
        }
        (ptype, Value::Array(items)) if ptype.is_vector() => items.iter().all(|item| element_fits(ptype, item)),
        _ => false,
    }
}

fn element_fits(vector: PropertyType, item: &Value) -> bool {
    match (vector, item) {
        (PropertyType::BoolVector, Value::Bool(_)) => true,
        (PropertyType::ShortVector, Value::Integer(n)) => i16::try_from(*n).is_ok(),
        (PropertyType::CharVector, Value::Integer(n)) => u16::try_from(*n).is_ok(),
        (PropertyType::IntVector, Value::Integer(n)) => i32::try_from(*n).is_ok(),
        (
            PropertyType::LongVector | PropertyType::DateVector | PropertyType::DateNanoVector,
            Value::Integer(_),
        ) => true,
        (PropertyType::FloatVector | PropertyType::DoubleVector, Value::Integer(_) | Value::Float(_)) => {
            true
        }
        (PropertyType::StringVector, Value::Text(_)) => true,
        _ => false,
    }
}

fn integer_fits(ptype: PropertyType, n: i64, unsigned: bool) -> bool {
    match (ptype, unsigned) {
        (PropertyType::Byte, false) => i8::try_from(n).is_ok(),
        (PropertyType::Byte, true) => u8::try_from(n).is_ok(),
        (PropertyType::Short, false) => i16::try_from(n).is_ok(),
        (PropertyType::Short, true) | (PropertyType::Char, _) => u16::try_from(n).is_ok(),
        (PropertyType::Int, false) => i32::try_from(n).is_ok(),
        (PropertyType::Int, true) => u32::try_from(n).is_ok(),
        _ => true,
    }
}

/// ID stored in the record's ID field, if any.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn stored_id(entity: &Entity, record: &ObjectRecord) -> Option<u64> {
    let id_property = entity.id_property()?;
    record
        .get(id_property.id)
        .and_then(Value::as_integer)
        .map(|n| n as u64)
}

/// Writes `id` into the record's ID field.
pub(crate) fn set_id(entity: &Entity, record: &mut ObjectRecord, id: u64) {
    if let Some(id_property) = entity.id_property() {
        record.set(id_property.id, Value::from(id));
    }
}
