//! CBOR decoder.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Longest byte or text string accepted.
const MAX_STRING_LEN: u64 = 256 * 1024 * 1024;

/// Largest element count accepted for arrays and maps.
const MAX_ITEMS: u64 = 16 * 1024 * 1024;

/// Deepest nesting accepted.
const MAX_DEPTH: usize = 64;

/// Decodes exactly one item from `bytes`, rejecting trailing data.
///
/// # Errors
///
/// Fails on malformed input, unsupported items or trailing bytes.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = Decoder::new(bytes);
    let value = decoder.value()?;
    if !decoder.is_empty() {
        return Err(CodecError::invalid_structure(format!(
            "{} trailing bytes",
            decoder.remaining().len()
        )));
    }
    Ok(value)
}

/// Pull decoder over a byte slice.
///
/// Accepts any definite-length CBOR: non-shortest integer heads and
/// unsorted map keys are tolerated, half and single precision floats are
/// widened to `f64`, and tags are skipped.
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder positioned at the start of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    /// Returns true when all input has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Returns the bytes not consumed yet.
    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    /// Returns the current byte offset.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Reads a map header and returns the number of pairs that follow.
    ///
    /// # Errors
    ///
    /// Fails if the next item is not a definite-length map.
    pub fn map_header(&mut self) -> CodecResult<u64> {
        let start = self.pos;
        let (major, info) = self.initial()?;
        if major != 5 {
            self.pos = start;
            return Err(CodecError::invalid_structure(format!(
                "expected map, found major type {major}"
            )));
        }
        let len = self.argument(info)?;
        Self::check_len(len, MAX_ITEMS)?;
        Ok(len)
    }

    /// Decodes the next item.
    ///
    /// # Errors
    ///
    /// Fails on malformed or unsupported input.
    pub fn value(&mut self) -> CodecResult<Value> {
        if self.depth >= MAX_DEPTH {
            return Err(CodecError::DepthLimitExceeded {
                max_depth: MAX_DEPTH,
            });
        }
        let (major, info) = self.initial()?;
        match major {
            0 => {
                let arg = self.argument(info)?;
                // u64 above i64::MAX keeps its bit pattern
                #[allow(clippy::cast_possible_wrap)]
                Ok(Value::Integer(arg as i64))
            }
            1 => {
                let arg = self.argument(info)?;
                #[allow(clippy::cast_possible_wrap)]
                Ok(Value::Integer(!arg as i64))
            }
            2 => Ok(Value::Bytes(self.string_body(info)?.to_vec())),
            3 => {
                let body = self.string_body(info)?;
                let text = std::str::from_utf8(body).map_err(|_| CodecError::InvalidUtf8)?;
                Ok(Value::Text(text.to_owned()))
            }
            4 => {
                let len = self.container_len(info)?;
                self.depth += 1;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.value()?);
                }
                self.depth -= 1;
                Ok(Value::Array(items))
            }
            5 => {
                let len = self.container_len(info)?;
                self.depth += 1;
                let mut pairs = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    let key = self.value()?;
                    let value = self.value()?;
                    pairs.push((key, value));
                }
                self.depth -= 1;
                Ok(Value::Map(pairs))
            }
            6 => {
                self.argument(info)?;
                self.depth += 1;
                let inner = self.value();
                self.depth -= 1;
                inner
            }
            _ => self.simple(info),
        }
    }

    fn initial(&mut self) -> CodecResult<(u8, u8)> {
        let byte = self.byte()?;
        Ok((byte >> 5, byte & 0x1f))
    }

    fn byte(&mut self) -> CodecResult<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(CodecError::UnexpectedEof { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(CodecError::UnexpectedEof { offset: self.pos })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn fixed<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn argument(&mut self, info: u8) -> CodecResult<u64> {
        match info {
            0..=23 => Ok(u64::from(info)),
            24 => Ok(u64::from(self.byte()?)),
            25 => Ok(u64::from(u16::from_be_bytes(self.fixed()?))),
            26 => Ok(u64::from(u32::from_be_bytes(self.fixed()?))),
            27 => Ok(u64::from_be_bytes(self.fixed()?)),
            31 => Err(CodecError::IndefiniteLength),
            _ => Err(CodecError::invalid_structure(format!(
                "reserved additional information {info}"
            ))),
        }
    }

    fn check_len(len: u64, max: u64) -> CodecResult<()> {
        if len > max {
            Err(CodecError::SizeLimitExceeded {
                claimed: len,
                max_allowed: max,
            })
        } else {
            Ok(())
        }
    }

    fn string_body(&mut self, info: u8) -> CodecResult<&'a [u8]> {
        let len = self.argument(info)?;
        Self::check_len(len, MAX_STRING_LEN)?;
        self.take(usize::try_from(len).map_err(|_| CodecError::UnexpectedEof { offset: self.pos })?)
    }

    fn container_len(&mut self, info: u8) -> CodecResult<usize> {
        let len = self.argument(info)?;
        Self::check_len(len, MAX_ITEMS)?;
        usize::try_from(len).map_err(|_| CodecError::SizeLimitExceeded {
            claimed: len,
            max_allowed: MAX_ITEMS,
        })
    }

    fn simple(&mut self, info: u8) -> CodecResult<Value> {
        match info {
            20 => Ok(Value::Bool(false)),
            21 => Ok(Value::Bool(true)),
            22 | 23 => Ok(Value::Null),
            25 => Ok(Value::Float(half_to_f64(u16::from_be_bytes(self.fixed()?)))),
            26 => Ok(Value::Float(f64::from(f32::from_be_bytes(self.fixed()?)))),
            27 => Ok(Value::Float(f64::from_be_bytes(self.fixed()?))),
            31 => Err(CodecError::invalid_structure("unexpected break")),
            _ => Err(CodecError::invalid_structure(format!(
                "unsupported simple value {info}"
            ))),
        }
    }
}

/// Widens an IEEE 754 half-precision float.
fn half_to_f64(bits: u16) -> f64 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = i32::from((bits >> 10) & 0x1f);
    let mantissa = f64::from(bits & 0x3ff);
    let magnitude = match exponent {
        0 => mantissa * 2f64.powi(-24),
        31 if mantissa == 0.0 => f64::INFINITY,
        31 => f64::NAN,
        _ => (1.0 + mantissa / 1024.0) * 2f64.powi(exponent - 15),
    };
    sign * magnitude
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::to_cbor;
    use proptest::prelude::*;

    #[test]
    fn decodes_integers_of_every_width() {
        assert_eq!(from_cbor(&[0x17]).unwrap(), Value::Integer(23));
        assert_eq!(from_cbor(&[0x18, 0x05]).unwrap(), Value::Integer(5));
        assert_eq!(from_cbor(&[0x19, 0x01, 0x00]).unwrap(), Value::Integer(256));
        assert_eq!(from_cbor(&[0x38, 99]).unwrap(), Value::Integer(-100));
        assert_eq!(
            from_cbor(&[0x1b, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]).unwrap(),
            Value::Integer(-1)
        );
    }

    #[test]
    fn widens_short_floats() {
        assert_eq!(from_cbor(&[0xf9, 0x3c, 0x00]).unwrap(), Value::Float(1.0));
        assert_eq!(from_cbor(&[0xf9, 0xc4, 0x00]).unwrap(), Value::Float(-4.0));
        assert_eq!(
            from_cbor(&[0xfa, 0x3f, 0xc0, 0x00, 0x00]).unwrap(),
            Value::Float(1.5)
        );
        assert_eq!(
            from_cbor(&[0xf9, 0x7c, 0x00]).unwrap(),
            Value::Float(f64::INFINITY)
        );
    }

    #[test]
    fn skips_tags() {
        // tag 1 (epoch time) around an integer
        assert_eq!(from_cbor(&[0xc1, 0x0a]).unwrap(), Value::Integer(10));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(
            from_cbor(&[0x62, b'a']),
            Err(CodecError::UnexpectedEof { .. })
        ));
        assert_eq!(from_cbor(&[0x5f]), Err(CodecError::IndefiniteLength));
        assert_eq!(from_cbor(&[0x62, 0xff, 0xfe]), Err(CodecError::InvalidUtf8));
        assert!(from_cbor(&[0x01, 0x02]).is_err());
        assert!(from_cbor(&[]).is_err());
    }

    #[test]
    fn rejects_huge_declared_lengths() {
        let bytes = [0x9b, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            from_cbor(&bytes),
            Err(CodecError::SizeLimitExceeded { .. })
        ));
    }

    #[test]
    fn rejects_deep_nesting() {
        let mut bytes = vec![0x81; MAX_DEPTH + 1];
        bytes.push(0x00);
        assert_eq!(
            from_cbor(&bytes),
            Err(CodecError::DepthLimitExceeded {
                max_depth: MAX_DEPTH
            })
        );
    }

    #[test]
    fn map_header_rejects_other_items() {
        let mut decoder = Decoder::new(&[0x80]);
        assert!(decoder.map_header().is_err());
        assert_eq!(decoder.position(), 0);
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Integer),
            any::<f64>()
                .prop_filter("NaN never compares equal", |f| !f.is_nan())
                .prop_map(Value::Float),
            ".{0,12}".prop_map(Value::Text),
            prop::collection::vec(any::<u8>(), 0..12).prop_map(Value::Bytes),
        ]
    }

    fn nested() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::vec((any::<u16>().prop_map(|k| Value::Integer(i64::from(k))), inner), 0..4)
                    .prop_map(|pairs| {
                        let mut pairs = pairs;
                        pairs.sort_by(|a, b| a.0.as_integer().cmp(&b.0.as_integer()));
                        pairs.dedup_by(|a, b| a.0 == b.0);
                        Value::Map(pairs)
                    }),
            ]
        })
    }

    proptest! {
        #[test]
        fn decoding_inverts_encoding(value in nested()) {
            prop_assert_eq!(from_cbor(&to_cbor(&value)).unwrap(), value);
        }

        #[test]
        fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = from_cbor(&bytes);
        }
    }
}
