//! Field descriptors: the immutable declarations a container is built from.

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::{
    bits::BitBuffer,
    codec::{CodecError, FieldCodec},
    container::Value,
};

/// How the integer image of a field is laid out on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Endianness {
    #[default]
    Big,

    /// The byte window is reversed on the wire. Only valid for fields whose
    /// length is a whole number of bytes.
    Little,
}

impl Endianness {
    /// The opposite byte order.
    pub fn toggled(self) -> Self {
        match self {
            Self::Big => Self::Little,
            Self::Little => Self::Big,
        }
    }
}

/// The declared length of a field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FieldLength {
    /// A fixed amount of bits.
    Bits(usize),

    /// Resolved at decode time: the field reads to the end of the input.
    Variable,

    /// Resolved at decode time from a sibling field decoded earlier.
    ///
    /// The sibling's integer value is multiplied by `unit_bits`.
    SizedBy {
        field: &'static str,
        unit_bits: usize,
    },
}

impl FieldLength {
    /// Shorthand for a fixed length given in bytes.
    pub const fn bytes(count: usize) -> Self {
        Self::Bits(count * 8)
    }

    /// The fixed bit length, if any.
    pub fn fixed(self) -> Option<usize> {
        match self {
            Self::Bits(bits) => Some(bits),
            _ => None,
        }
    }
}

/// A check applied to a field value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Validator {
    /// The integer value must lie within `min..=max`.
    Range { min: u64, max: u64 },

    /// The value must span between `min` and `max` bytes.
    ByteLength { min: usize, max: usize },

    /// On decode, the value read must equal the declared default.
    MatchesDefault,
}

impl Validator {
    /// Shorthand for an exact byte length.
    pub const fn exact_bytes(count: usize) -> Self {
        Self::ByteLength {
            min: count,
            max: count,
        }
    }
}

/// The reason a [`Validator`] rejected a value.
#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum ValidationError {
    #[error("value {value:#x} is outside {min:#x}..={max:#x}")]
    OutOfRange { value: u64, min: u64, max: u64 },

    #[error("{actual} bytes given, expected {min}..={max}")]
    BadLength { actual: usize, min: usize, max: usize },

    #[error("value {actual} differs from the required default {expected}")]
    DefaultMismatch {
        actual: BitBuffer,
        expected: BitBuffer,
    },

    #[error("value {value:#x} does not fit into {bits} bits")]
    TooWide { value: u64, bits: usize },
}

/// Declares a single field of a container.
///
/// Descriptors are assembled with the builder-style methods below and become
/// frozen once they are part of a [`crate::container::FieldTable`]. A
/// specialised table gets its own deep copy of the descriptor to edit.
#[derive(Clone)]
pub struct FieldDescriptor {
    /// The identifier, unique within its container.
    pub id: u16,

    /// The canonical name used for accessor lookup.
    pub name: &'static str,

    /// A human-readable title for diagnostics.
    pub title: &'static str,

    /// Additional accessor names resolving to this field.
    pub aliases: Vec<&'static str>,

    pub length: FieldLength,

    /// The value used when the instance does not set the field.
    pub default: Option<BitBuffer>,

    /// Checks applied on write and on encode.
    pub validators: Vec<Validator>,

    pub endianness: Endianness,

    /// Whether the field may be missing at the end of the input.
    pub optional: bool,

    /// Overrides the default integer codec, e.g. for nested containers.
    pub codec: Option<Arc<dyn FieldCodec>>,
}

impl FieldDescriptor {
    /// Starts a new descriptor.
    pub fn new(id: u16, name: &'static str, length: FieldLength) -> Self {
        Self {
            id,
            name,
            title: name,
            aliases: Vec::new(),
            length,
            default: None,
            validators: Vec::new(),
            endianness: Endianness::Big,
            optional: false,
            codec: None,
        }
    }

    /// Shorthand for a fixed-width field of `bits` bits.
    pub fn bits(id: u16, name: &'static str, bits: usize) -> Self {
        Self::new(id, name, FieldLength::Bits(bits))
    }

    /// Shorthand for a fixed-width field of `count` bytes.
    pub fn bytes(id: u16, name: &'static str, count: usize) -> Self {
        Self::new(id, name, FieldLength::bytes(count))
    }

    pub fn title(mut self, title: &'static str) -> Self {
        self.title = title;
        self
    }

    pub fn alias(mut self, alias: &'static str) -> Self {
        self.aliases.push(alias);
        self
    }

    /// Sets an integer default, sized to the declared length.
    ///
    /// Fields of variable length get the narrowest byte-aligned image.
    pub fn default_uint(mut self, value: u64) -> Self {
        let bits = self.length.fixed().unwrap_or_else(|| {
            let needed = (u64::BITS - value.leading_zeros()) as usize;
            needed.div_ceil(8).max(1) * 8
        });
        self.default = BitBuffer::from_uint(value, bits).ok();
        self
    }

    pub fn default_bytes(mut self, bytes: &[u8]) -> Self {
        self.default = Some(BitBuffer::from_bytes(bytes));
        self
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    /// Adds a range validator spanning every value the field can hold.
    pub fn full_range(self) -> Self {
        let max = match self.length.fixed() {
            Some(bits) if bits < 64 => (1u64 << bits) - 1,
            _ => u64::MAX,
        };
        self.validator(Validator::Range { min: 0, max })
    }

    pub fn little_endian(mut self) -> Self {
        self.endianness = Endianness::Little;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn codec(mut self, codec: impl FieldCodec + 'static) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    /// Whether `name` is the canonical name or one of the aliases.
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|alias| *alias == name)
    }

    /// Applies all validators to a value about to be written.
    ///
    /// [`Validator::MatchesDefault`] only runs on decode, see
    /// [`Self::check_decoded`].
    pub fn validate(&self, value: &Value) -> Result<(), CodecError> {
        let Value::Bits(bits) = value else {
            return Ok(());
        };

        for validator in &self.validators {
            let outcome = match *validator {
                Validator::Range { min, max } => {
                    let int = self.integer(bits)?;
                    if int < min || int > max {
                        Err(ValidationError::OutOfRange {
                            value: int,
                            min,
                            max,
                        })
                    } else {
                        Ok(())
                    }
                },
                Validator::ByteLength { min, max } => {
                    let actual = bits.len().div_ceil(8);
                    if actual < min || actual > max {
                        Err(ValidationError::BadLength { actual, min, max })
                    } else {
                        Ok(())
                    }
                },
                Validator::MatchesDefault => Ok(()),
            };

            outcome.map_err(|reason| CodecError::Overflow {
                field: self.name,
                reason,
            })?;
        }

        Ok(())
    }

    /// Runs the decode-time checks on a freshly read value.
    pub fn check_decoded(&self, bits: &BitBuffer) -> Result<(), CodecError> {
        if !self.validators.contains(&Validator::MatchesDefault) {
            return Ok(());
        }
        match &self.default {
            Some(expected) if expected != bits => Err(CodecError::Overflow {
                field: self.name,
                reason: ValidationError::DefaultMismatch {
                    actual: bits.clone(),
                    expected: expected.clone(),
                },
            }),
            _ => Ok(()),
        }
    }

    fn integer(&self, bits: &BitBuffer) -> Result<u64, CodecError> {
        bits.read(0, bits.len()).map_err(|source| CodecError::Bits {
            field: self.name,
            source,
        })
    }
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("length", &self.length)
            .field("default", &self.default)
            .field("validators", &self.validators)
            .field("endianness", &self.endianness)
            .field("optional", &self.optional)
            .field("codec", &self.codec.as_ref().map(|codec| codec.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sized_to_the_field() {
        let field = FieldDescriptor::bits(1, "flags", 16).default_uint(0x12);
        assert_eq!(field.default.unwrap().to_hex(), "0012");

        let field = FieldDescriptor::new(2, "blob", FieldLength::Variable).default_uint(0x1234);
        assert_eq!(field.default.unwrap().to_hex(), "1234");
    }

    #[test]
    fn range_validator_rejects_out_of_range_values() {
        let field = FieldDescriptor::bits(1, "level", 8).validator(Validator::Range { min: 1, max: 10 });

        let ok = Value::Bits(BitBuffer::from_uint(5, 8).unwrap());
        assert!(field.validate(&ok).is_ok());

        let bad = Value::Bits(BitBuffer::from_uint(11, 8).unwrap());
        assert!(matches!(
            field.validate(&bad),
            Err(CodecError::Overflow {
                reason: ValidationError::OutOfRange { value: 11, .. },
                ..
            })
        ));
    }

    #[test]
    fn length_validator_counts_bytes() {
        let field = FieldDescriptor::new(1, "signature", FieldLength::Variable)
            .validator(Validator::ByteLength { min: 70, max: 72 });

        assert!(field.validate(&Value::Bits(BitBuffer::zeroed(71 * 8))).is_ok());
        assert!(field.validate(&Value::Bits(BitBuffer::zeroed(64 * 8))).is_err());
    }

    #[test]
    fn matches_default_only_applies_on_decode() {
        let field = FieldDescriptor::bits(1, "reserved", 8)
            .default_uint(0)
            .validator(Validator::MatchesDefault);

        let dirty = BitBuffer::from_uint(1, 8).unwrap();
        assert!(field.validate(&Value::Bits(dirty.clone())).is_ok());
        assert!(field.check_decoded(&dirty).is_err());
        assert!(field.check_decoded(&BitBuffer::zeroed(8)).is_ok());
    }

    #[test]
    fn aliases_answer_to_their_names() {
        let field = FieldDescriptor::bits(1, "header_size", 16).alias("hdr_size");
        assert!(field.answers_to("header_size"));
        assert!(field.answers_to("hdr_size"));
        assert!(!field.answers_to("size"));
    }
}
