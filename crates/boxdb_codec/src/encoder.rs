//! CBOR encoder.

use crate::value::Value;

/// Encodes `value` into a fresh buffer.
///
/// Integers take their shortest form, floats are always written at double
/// precision and map keys are emitted in canonical order, so equal values
/// always produce equal bytes.
#[must_use]
pub fn to_cbor(value: &Value) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.value(value);
    encoder.into_bytes()
}

/// Sort key giving the canonical order of map keys: encoded length first,
/// then the encoded bytes.
pub(crate) fn canonical_key(key: &Value) -> (usize, Vec<u8>) {
    let bytes = to_cbor(key);
    (bytes.len(), bytes)
}

/// Streaming CBOR writer.
///
/// Besides whole [`Value`]s it exposes the primitive writers, so the record
/// format can emit a map header followed by fields without building an
/// intermediate tree.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Creates an empty encoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an encoder with a preallocated buffer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Returns the encoded bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Returns the bytes written so far.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Writes a complete value.
    pub fn value(&mut self, value: &Value) {
        match value {
            Value::Null => self.buf.push(0xf6),
            Value::Bool(b) => self.buf.push(if *b { 0xf5 } else { 0xf4 }),
            Value::Integer(n) => self.integer(*n),
            Value::Float(f) => self.float(*f),
            Value::Bytes(b) => {
                self.head(2, b.len() as u64);
                self.buf.extend_from_slice(b);
            }
            Value::Text(s) => {
                self.head(3, s.len() as u64);
                self.buf.extend_from_slice(s.as_bytes());
            }
            Value::Array(items) => {
                self.head(4, items.len() as u64);
                for item in items {
                    self.value(item);
                }
            }
            Value::Map(pairs) => {
                let mut keyed: Vec<_> = pairs
                    .iter()
                    .map(|(key, value)| (canonical_key(key), value))
                    .collect();
                keyed.sort_by(|a, b| a.0.cmp(&b.0));
                self.map_header(keyed.len());
                for ((_, key_bytes), value) in keyed {
                    self.buf.extend_from_slice(&key_bytes);
                    self.value(value);
                }
            }
        }
    }

    /// Writes a map header announcing `len` pairs.
    pub fn map_header(&mut self, len: usize) {
        self.head(5, len as u64);
    }

    /// Writes a signed integer in its shortest form.
    #[allow(clippy::cast_sign_loss)]
    pub fn integer(&mut self, n: i64) {
        if n >= 0 {
            self.head(0, n as u64);
        } else {
            // major type 1 carries -1 - n
            self.head(1, !(n as u64));
        }
    }

    /// Writes a double-precision float.
    pub fn float(&mut self, f: f64) {
        self.buf.push(0xfb);
        self.buf.extend_from_slice(&f.to_bits().to_be_bytes());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn head(&mut self, major: u8, arg: u64) {
        let major = major << 5;
        match arg {
            0..=23 => self.buf.push(major | arg as u8),
            24..=0xff => {
                self.buf.push(major | 24);
                self.buf.push(arg as u8);
            }
            0x100..=0xffff => {
                self.buf.push(major | 25);
                self.buf.extend_from_slice(&(arg as u16).to_be_bytes());
            }
            0x1_0000..=0xffff_ffff => {
                self.buf.push(major | 26);
                self.buf.extend_from_slice(&(arg as u32).to_be_bytes());
            }
            _ => {
                self.buf.push(major | 27);
                self.buf.extend_from_slice(&arg.to_be_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_use_shortest_head() {
        assert_eq!(to_cbor(&Value::Integer(0)), [0x00]);
        assert_eq!(to_cbor(&Value::Integer(23)), [0x17]);
        assert_eq!(to_cbor(&Value::Integer(24)), [0x18, 24]);
        assert_eq!(to_cbor(&Value::Integer(1000)), [0x19, 0x03, 0xe8]);
        assert_eq!(to_cbor(&Value::Integer(70_000)), [0x1a, 0x00, 0x01, 0x11, 0x70]);
        assert_eq!(to_cbor(&Value::Integer(-1)), [0x20]);
        assert_eq!(to_cbor(&Value::Integer(-100)), [0x38, 99]);
        assert_eq!(
            to_cbor(&Value::Integer(i64::MIN)),
            [0x3b, 0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn floats_are_double_precision() {
        assert_eq!(
            to_cbor(&Value::Float(1.5)),
            [0xfb, 0x3f, 0xf8, 0, 0, 0, 0, 0, 0]
        );
        let nan = to_cbor(&Value::Float(f64::NAN));
        assert_eq!(nan.len(), 9);
        assert_eq!(nan[0], 0xfb);
    }

    #[test]
    fn strings_and_simple_values() {
        assert_eq!(to_cbor(&Value::Text("ab".into())), [0x62, b'a', b'b']);
        assert_eq!(to_cbor(&Value::Bytes(vec![9])), [0x41, 9]);
        assert_eq!(to_cbor(&Value::Null), [0xf6]);
        assert_eq!(to_cbor(&Value::Bool(true)), [0xf5]);
        assert_eq!(to_cbor(&Value::Array(vec![])), [0x80]);
    }

    #[test]
    fn map_output_does_not_depend_on_pair_order() {
        let a = Value::Map(vec![
            (Value::Integer(2), Value::Bool(false)),
            (Value::Integer(1), Value::Null),
        ]);
        let b = Value::Map(vec![
            (Value::Integer(1), Value::Null),
            (Value::Integer(2), Value::Bool(false)),
        ]);
        assert_eq!(to_cbor(&a), to_cbor(&b));
        assert_eq!(to_cbor(&a), [0xa2, 0x01, 0xf6, 0x02, 0xf4]);
    }
}
