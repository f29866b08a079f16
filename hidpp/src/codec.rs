//! Encodes [`Container`]s into bit images and decodes them back.
//!
//! Both directions walk the field table in declaration order. Integer fields
//! are read and written big-endian; little-endian fields get their byte window
//! reversed on the wire. Fields with a custom [`FieldCodec`] delegate to it,
//! which is how nested containers and repeated records are expressed.

use std::{borrow::Cow, sync::Arc};

use thiserror::Error;

use crate::{
    bits::{BitBuffer, BitsError},
    container::{Container, FieldTable, Value},
    field::{Endianness, FieldDescriptor, FieldLength, ValidationError},
};

/// Controls how decoding treats input that ends before the table does.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Overflow {
    /// Missing mandatory input fails with [`CodecError::Truncated`].
    #[default]
    Reject,

    /// A field cut short by the end of the input is zero-filled to its
    /// declared length and decoding stops there.
    Allow,
}

/// Everything a [`FieldCodec`] needs to decode its field.
pub struct DecodeContext<'a> {
    /// The container decoded so far. Fields after the current one are unset.
    pub container: &'a Container,

    /// The field being decoded.
    pub field: &'a FieldDescriptor,

    /// The whole input.
    pub input: &'a BitBuffer,

    /// Where the field starts.
    pub offset: usize,

    /// The first bit past the window this container may consume.
    pub limit: usize,

    pub overflow: Overflow,
}

impl DecodeContext<'_> {
    /// Bits left between the current offset and the limit.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.offset)
    }

    /// Resolves the declared length of the current field.
    pub fn field_length(&self) -> Result<usize, CodecError> {
        resolve_length(self.field, self.container, self.remaining())
    }
}

/// A custom encoder/decoder pair attached to a [`FieldDescriptor`].
pub trait FieldCodec: Send + Sync {
    /// A short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Decodes the field starting at [`DecodeContext::offset`].
    ///
    /// Returns the offset just past the consumed bits and the decoded value.
    fn decode(&self, ctx: &DecodeContext<'_>) -> Result<(usize, Value), CodecError>;

    /// Produces the wire image of a value.
    fn encode(&self, field: &FieldDescriptor, value: &Value) -> Result<BitBuffer, CodecError>;
}

/// Encodes a container into its wire image.
pub fn encode(container: &Container) -> Result<BitBuffer, CodecError> {
    let mut out = BitBuffer::new();

    for (field, value) in container.fields() {
        let value = match value {
            Some(value) => Cow::Borrowed(value),
            None => match &field.default {
                Some(default) => Cow::Owned(Value::Bits(default.clone())),
                None if field.optional => continue,
                None => return Err(CodecError::MissingValue(field.name)),
            },
        };

        field.validate(&value)?;

        let image = match &field.codec {
            Some(codec) => apply_endianness(field, codec.encode(field, &value)?)?,
            None => encode_plain(field, &value)?,
        };

        out.append(&image);
    }

    Ok(out)
}

fn encode_plain(field: &FieldDescriptor, value: &Value) -> Result<BitBuffer, CodecError> {
    let bits = match value {
        Value::Bits(bits) => bits.clone(),
        Value::Container(inner) => encode(inner)?,
        Value::List(items) => {
            let images = items.iter().map(encode).collect::<Result<Vec<_>, _>>()?;
            BitBuffer::concat(&images)
        },
    };

    if let Some(expected) = field.length.fixed() {
        if bits.len() != expected {
            return Err(CodecError::Overflow {
                field: field.name,
                reason: ValidationError::BadLength {
                    actual: bits.len().div_ceil(8),
                    min: expected / 8,
                    max: expected.div_ceil(8),
                },
            });
        }
    }

    apply_endianness(field, bits)
}

/// Encodes a container and returns its bytes.
pub fn encode_bytes(container: &Container) -> Result<Vec<u8>, CodecError> {
    Ok(encode(container)?.into_bytes())
}

/// Decodes a whole input buffer against a table.
///
/// Trailing input past the last field is ignored.
pub fn decode(table: &Arc<FieldTable>, input: &BitBuffer) -> Result<Container, CodecError> {
    decode_with(table, input, Overflow::Reject)
}

/// Decodes a byte slice against a table.
pub fn decode_bytes(table: &Arc<FieldTable>, input: &[u8]) -> Result<Container, CodecError> {
    decode(table, &BitBuffer::from_bytes(input))
}

/// Like [`decode`], with an explicit overflow policy.
pub fn decode_with(
    table: &Arc<FieldTable>,
    input: &BitBuffer,
    overflow: Overflow,
) -> Result<Container, CodecError> {
    decode_window(table, input, 0, input.len(), overflow).map(|(container, _)| container)
}

/// Decodes a container from `input[offset..limit]`.
///
/// Returns the container and the offset just past the last consumed bit.
pub fn decode_window(
    table: &Arc<FieldTable>,
    input: &BitBuffer,
    offset: usize,
    limit: usize,
    overflow: Overflow,
) -> Result<(Container, usize), CodecError> {
    let limit = limit.min(input.len());
    let mut container = Container::new(table);
    let mut offset = offset;

    for (pos, field) in table.fields().iter().enumerate() {
        let remaining = limit.saturating_sub(offset);

        if remaining == 0 && field.optional {
            continue;
        }

        if let Some(codec) = &field.codec {
            let ctx = DecodeContext {
                container: &container,
                field,
                input,
                offset,
                limit,
                overflow,
            };
            let (next, value) = codec.decode(&ctx)?;
            let value = match value {
                Value::Bits(bits) => Value::Bits(apply_endianness(field, bits)?),
                other => other,
            };
            container.store_decoded(pos, value);
            offset = next;
            continue;
        }

        let length = resolve_length(field, &container, remaining)?;

        if length > remaining && field.optional {
            continue;
        }

        if length > remaining {
            if overflow == Overflow::Reject {
                return Err(CodecError::Truncated {
                    field: field.name,
                    needed: length,
                    available: remaining,
                });
            }

            let partial = input.slice_lenient(offset, remaining).pad_right(length);
            container.store_decoded(pos, Value::Bits(apply_endianness(field, partial)?));
            offset = limit;
            break;
        }

        let raw = input
            .slice(offset, length)
            .map_err(|source| CodecError::Bits {
                field: field.name,
                source,
            })?;
        let bits = apply_endianness(field, raw)?;
        field.check_decoded(&bits)?;

        container.store_decoded(pos, Value::Bits(bits));
        offset += length;
    }

    Ok((container, offset))
}

/// Determines how many bits a field spans at decode time.
fn resolve_length(
    field: &FieldDescriptor,
    container: &Container,
    remaining: usize,
) -> Result<usize, CodecError> {
    match field.length {
        FieldLength::Bits(bits) => Ok(bits),
        FieldLength::Variable => Ok(remaining),
        FieldLength::SizedBy { field: sibling, unit_bits } => {
            let count = container.get_uint(sibling)?;
            usize::try_from(count)
                .ok()
                .and_then(|count| count.checked_mul(unit_bits))
                .ok_or(CodecError::Truncated {
                    field: field.name,
                    needed: usize::MAX,
                    available: remaining,
                })
        },
    }
}

/// Converts between the logical and the wire image of a field.
///
/// Reversing the byte window is its own inverse, so this serves both
/// directions.
fn apply_endianness(field: &FieldDescriptor, bits: BitBuffer) -> Result<BitBuffer, CodecError> {
    match field.endianness {
        Endianness::Big => Ok(bits),
        Endianness::Little => bits.reverse_bytes().map_err(|source| CodecError::Bits {
            field: field.name,
            source,
        }),
    }
}

/// Decodes a field as a nested container.
///
/// The window given to the nested table is the field's declared length. A
/// [`FieldLength::Variable`] field uses the nested table's static length if it
/// has one and the rest of the input otherwise.
#[derive(Clone, Debug)]
pub struct Nested {
    pub table: Arc<FieldTable>,
}

impl Nested {
    pub fn new(table: &Arc<FieldTable>) -> Self {
        Self {
            table: Arc::clone(table),
        }
    }
}

impl FieldCodec for Nested {
    fn name(&self) -> &'static str {
        self.table.name()
    }

    fn decode(&self, ctx: &DecodeContext<'_>) -> Result<(usize, Value), CodecError> {
        let window = match ctx.field.length {
            FieldLength::Variable => self
                .table
                .static_bit_length()
                .unwrap_or_else(|| ctx.remaining()),
            _ => ctx.field_length()?,
        };

        if window > ctx.remaining() && ctx.overflow == Overflow::Reject {
            return Err(CodecError::Truncated {
                field: ctx.field.name,
                needed: window,
                available: ctx.remaining(),
            });
        }

        let end = (ctx.offset + window).min(ctx.limit);
        let (inner, consumed) = decode_window(&self.table, ctx.input, ctx.offset, end, ctx.overflow)?;
        let next = if self.table.static_bit_length().is_some() {
            end
        } else {
            consumed
        };

        Ok((next, Value::Container(Box::new(inner))))
    }

    fn encode(&self, field: &FieldDescriptor, value: &Value) -> Result<BitBuffer, CodecError> {
        match value {
            Value::Container(inner) => encode(inner),
            Value::Bits(bits) => Ok(bits.clone()),
            Value::List(_) => Err(CodecError::WrongKind(field.name)),
        }
    }
}

/// How many records a [`Repeated`] field holds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RepeatCount {
    /// The count is the value of a sibling field decoded earlier.
    FromField(&'static str),

    /// Records of the table's static length are read while they fit.
    WhileFits,
}

/// Decodes a field as a list of records sharing one table.
#[derive(Clone, Debug)]
pub struct Repeated {
    pub table: Arc<FieldTable>,
    pub count: RepeatCount,
}

impl Repeated {
    pub fn new(table: &Arc<FieldTable>, count: RepeatCount) -> Self {
        Self {
            table: Arc::clone(table),
            count,
        }
    }
}

impl FieldCodec for Repeated {
    fn name(&self) -> &'static str {
        self.table.name()
    }

    fn decode(&self, ctx: &DecodeContext<'_>) -> Result<(usize, Value), CodecError> {
        let mut items = Vec::new();
        let mut offset = ctx.offset;

        match self.count {
            RepeatCount::FromField(sibling) => {
                let count = ctx.container.get_uint(sibling)?;
                for _ in 0..count {
                    let (item, next) =
                        decode_window(&self.table, ctx.input, offset, ctx.limit, ctx.overflow)?;
                    items.push(item);
                    offset = next;
                }
            },
            RepeatCount::WhileFits => {
                let stride = self
                    .table
                    .static_bit_length()
                    .filter(|&stride| stride > 0)
                    .ok_or(CodecError::UnsizedRecord(self.table.name()))?;
                while offset + stride <= ctx.limit {
                    let (item, next) =
                        decode_window(&self.table, ctx.input, offset, offset + stride, ctx.overflow)?;
                    items.push(item);
                    offset = next;
                }
            },
        }

        Ok((offset, Value::List(items)))
    }

    fn encode(&self, field: &FieldDescriptor, value: &Value) -> Result<BitBuffer, CodecError> {
        let Value::List(items) = value else {
            return Err(CodecError::WrongKind(field.name));
        };
        let images = items.iter().map(encode).collect::<Result<Vec<_>, _>>()?;
        Ok(BitBuffer::concat(&images))
    }
}

/// Represents an error raised while encoding, decoding or accessing a
/// container.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// The input ended before a mandatory field could be read.
    #[error("input ended inside field `{field}`: {needed} bits needed, {available} available")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    /// A value exceeds its declared length or violates a validator.
    #[error("field `{field}` rejected its value: {reason}")]
    Overflow {
        field: &'static str,
        reason: ValidationError,
    },

    /// A mandatory field has neither a value nor a default.
    #[error("field `{0}` has no value and no default")]
    MissingValue(&'static str),

    /// No field answers to the given name.
    #[error("no field answers to `{0}`")]
    UnknownField(String),

    /// The field holds a different kind of value than requested.
    #[error("field `{0}` holds a different kind of value")]
    WrongKind(&'static str),

    /// A repeated record has no static length to step by.
    #[error("records of `{0}` have no static length")]
    UnsizedRecord(&'static str),

    /// A malformed nested structure, described by the field's codec.
    #[error("field `{field}` is malformed: {detail}")]
    Malformed {
        field: &'static str,
        detail: String,
    },

    #[error("bit access failed in field `{field}`")]
    Bits {
        field: &'static str,
        #[source]
        source: BitsError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        container::TableBuilder,
        field::{FieldDescriptor, Validator},
    };

    fn sample_table() -> Arc<FieldTable> {
        TableBuilder::new("Sample")
            .field(FieldDescriptor::bits(0, "kind", 4))
            .field(FieldDescriptor::bits(1, "flags", 4).default_uint(0))
            .field(FieldDescriptor::bits(2, "size", 16).little_endian())
            .field(FieldDescriptor::bits(3, "count", 8))
            .field(FieldDescriptor::new(
                4,
                "data",
                FieldLength::SizedBy {
                    field: "count",
                    unit_bits: 8,
                },
            ))
            .field(FieldDescriptor::bytes(5, "tail", 1).optional())
            .build()
    }

    #[test]
    fn round_trips_a_populated_instance() {
        let table = sample_table();
        let mut original = Container::new(&table);
        original.set_uint("kind", 0xa).unwrap();
        original.set_uint("size", 0x1234).unwrap();
        original.set_uint("count", 3).unwrap();
        original.set_bytes("data", &[1, 2, 3]).unwrap();
        original.set_uint("tail", 0xee).unwrap();

        let image = encode(&original).unwrap();
        assert_eq!(image.to_hex(), "A0341203010203EE");
        assert_eq!(decode(&table, &image).unwrap(), original);
    }

    #[test]
    fn optional_trailing_field_may_be_absent() {
        let table = sample_table();
        let decoded = decode_bytes(&table, &[0xa0, 0x34, 0x12, 0x01, 0x99]).unwrap();
        assert_eq!(decoded.get_uint("size").unwrap(), 0x1234);
        assert_eq!(decoded.get_bytes("data").unwrap(), vec![0x99]);
        assert!(!decoded.is_set("tail").unwrap());
    }

    #[test]
    fn optional_field_longer_than_the_rest_is_skipped() {
        let table = TableBuilder::new("Short")
            .field(FieldDescriptor::bits(0, "head", 8))
            .field(FieldDescriptor::bits(1, "tail", 16).optional())
            .build();

        let decoded = decode_bytes(&table, &[0x12, 0x34]).unwrap();
        assert_eq!(decoded.get_uint("head").unwrap(), 0x12);
        assert!(!decoded.is_set("tail").unwrap());
    }

    #[test]
    fn truncated_mandatory_field_fails() {
        let table = sample_table();
        let err = decode_bytes(&table, &[0xa0, 0x34]).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                field: "size",
                needed: 16,
                available: 8
            }
        );
    }

    #[test]
    fn allowed_overflow_zero_fills_the_cut_field() {
        let table = sample_table();
        let decoded = decode_with(&table, &BitBuffer::from_bytes(&[0xa0, 0x34]), Overflow::Allow).unwrap();
        assert_eq!(decoded.get_uint("size").unwrap(), 0x0034);
        assert!(!decoded.is_set("count").unwrap());
    }

    #[test]
    fn default_only_encoding_is_stable() {
        let table = TableBuilder::new("Defaults")
            .field(FieldDescriptor::bits(0, "magic", 32).little_endian().default_uint(0x5afe_da7a))
            .field(FieldDescriptor::bits(1, "reserved", 16).default_uint(0))
            .build();

        let container = Container::new(&table);
        let first = encode(&container).unwrap();
        let second = encode(&container).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_hex(), "7ADAFE5A0000");
    }

    #[test]
    fn encode_runs_validators_on_defaults_and_values() {
        let table = TableBuilder::new("Checked")
            .field(FieldDescriptor::bits(0, "level", 8).default_uint(200).validator(Validator::Range {
                min: 0,
                max: 100,
            }))
            .build();
        assert!(matches!(
            encode(&Container::new(&table)),
            Err(CodecError::Overflow { field: "level", .. })
        ));
    }

    #[test]
    fn missing_mandatory_value_fails_encoding() {
        let table = sample_table();
        assert_eq!(
            encode(&Container::new(&table)).unwrap_err(),
            CodecError::MissingValue("kind")
        );
    }

    #[test]
    fn toggling_endianness_reverses_the_value() {
        let little = TableBuilder::new("Little")
            .field(FieldDescriptor::bits(0, "value", 32).little_endian())
            .build();
        let big = little
            .derive("Big")
            .edit("value", |field| field.endianness = field.endianness.toggled())
            .build();
        let restored = big
            .derive("Little again")
            .edit("value", |field| field.endianness = field.endianness.toggled())
            .build();

        let wire = BitBuffer::from_bytes(&[0x3d, 0xb8, 0xf3, 0x96]);
        let as_little = decode(&little, &wire).unwrap().get_uint("value").unwrap();
        let as_big = decode(&big, &wire).unwrap().get_uint("value").unwrap();
        let as_restored = decode(&restored, &wire).unwrap().get_uint("value").unwrap();

        assert_eq!(as_little, 0x96f3_b83d);
        assert_eq!(as_big, 0x3db8_f396);
        assert_eq!((as_big as u32).swap_bytes(), as_little as u32);
        assert_eq!(as_restored, as_little);
    }

    /// Reads and writes a fixed 16-bit window untouched.
    struct Word;

    impl FieldCodec for Word {
        fn name(&self) -> &'static str {
            "Word"
        }

        fn decode(&self, ctx: &DecodeContext<'_>) -> Result<(usize, Value), CodecError> {
            let bits = ctx.input.slice(ctx.offset, 16).map_err(|source| CodecError::Bits {
                field: ctx.field.name,
                source,
            })?;
            Ok((ctx.offset + 16, Value::Bits(bits)))
        }

        fn encode(&self, _field: &FieldDescriptor, value: &Value) -> Result<BitBuffer, CodecError> {
            match value {
                Value::Bits(bits) => Ok(bits.clone()),
                _ => Err(CodecError::WrongKind("word")),
            }
        }
    }

    #[test]
    fn custom_codec_output_honours_endianness() {
        let table = TableBuilder::new("Custom")
            .field(FieldDescriptor::bits(0, "word", 16).little_endian().codec(Word))
            .build();

        let mut container = Container::new(&table);
        container.set_uint("word", 0x1234).unwrap();
        let image = encode(&container).unwrap();
        assert_eq!(image.to_hex(), "3412");

        let decoded = decode(&table, &image).unwrap();
        assert_eq!(decoded.get_uint("word").unwrap(), 0x1234);
    }

    #[test]
    fn padding_is_verified_only_when_requested() {
        let lax = TableBuilder::new("Lax")
            .field(FieldDescriptor::bits(0, "pad", 8).default_uint(0))
            .build();
        let strict = lax
            .derive("Strict")
            .edit("pad", |field| field.validators.push(Validator::MatchesDefault))
            .build();

        assert!(decode_bytes(&lax, &[0xff]).is_ok());
        assert!(matches!(
            decode_bytes(&strict, &[0xff]),
            Err(CodecError::Overflow { field: "pad", .. })
        ));
    }

    #[test]
    fn nested_and_repeated_records() {
        let record = TableBuilder::new("Record")
            .field(FieldDescriptor::bits(0, "a", 8))
            .field(FieldDescriptor::bits(1, "b", 8))
            .build();
        let outer = TableBuilder::new("Outer")
            .field(FieldDescriptor::new(0, "head", FieldLength::Variable).codec(Nested::new(&record)))
            .field(FieldDescriptor::bits(1, "count", 8))
            .field(
                FieldDescriptor::new(2, "records", FieldLength::Variable)
                    .codec(Repeated::new(&record, RepeatCount::FromField("count"))),
            )
            .field(
                FieldDescriptor::new(3, "rest", FieldLength::Variable)
                    .codec(Repeated::new(&record, RepeatCount::WhileFits)),
            )
            .build();

        let input = [0x01, 0x02, 0x02, 0x10, 0x11, 0x20, 0x21, 0x30, 0x31, 0x40];
        let decoded = decode_bytes(&outer, &input).unwrap();

        assert_eq!(decoded.get_container("head").unwrap().get_uint("b").unwrap(), 0x02);
        let records = decoded.get_list("records").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get_uint("a").unwrap(), 0x20);
        assert_eq!(decoded.get_list("rest").unwrap().len(), 1);

        assert_eq!(encode_bytes(&decoded).unwrap(), input[..9].to_vec());
    }
}
