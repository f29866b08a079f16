//! The container meta-model.
//!
//! A [`FieldTable`] is the ordered, frozen list of [`FieldDescriptor`]s that
//! defines an entity's wire image. A [`Container`] is one instance of such an
//! entity holding a value per field.
//!
//! Specialised variants of an entity never mutate the parent table. Instead,
//! [`FieldTable::derive`] produces a [`TableBuilder`] over a deep copy of the
//! parent's fields to which targeted edits are applied:
//!
//! ```
//! use hidpp::{
//!     container::TableBuilder,
//!     field::{FieldDescriptor, FieldLength},
//! };
//!
//! let pair = TableBuilder::new("KeyPair")
//!     .field(FieldDescriptor::new(0, "public_key", FieldLength::Variable))
//!     .field(FieldDescriptor::new(1, "signature", FieldLength::Variable))
//!     .build();
//!
//! let ec_pair = pair
//!     .derive("EcPair")
//!     .length("public_key", FieldLength::bytes(65))
//!     .length("signature", FieldLength::bytes(64))
//!     .build();
//!
//! assert_eq!(ec_pair.static_bit_length(), Some(129 * 8));
//! assert_eq!(pair.static_bit_length(), None);
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use thiserror::Error;

use crate::{
    bits::BitBuffer,
    codec::{self, CodecError},
    field::{Endianness, FieldDescriptor, FieldLength, ValidationError},
};

/// The value held by a single field of a [`Container`].
#[derive(Clone, PartialEq, Debug)]
pub enum Value {
    /// A plain bit pattern, stored in its logical (big-endian) form.
    Bits(BitBuffer),

    /// A nested container.
    Container(Box<Container>),

    /// A sequence of nested containers sharing one table.
    List(Vec<Container>),
}

impl Value {
    pub fn as_bits(&self) -> Option<&BitBuffer> {
        match self {
            Self::Bits(bits) => Some(bits),
            _ => None,
        }
    }
}

/// An ordered, immutable list of field descriptors.
pub struct FieldTable {
    name: &'static str,
    fields: Vec<FieldDescriptor>,
    lookup: HashMap<&'static str, usize>,
}

impl FieldTable {
    /// The name of the entity the table describes.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The descriptors in declaration order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Resolves a canonical name or alias to a field position.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.lookup.get(name).copied()
    }

    /// Resolves a canonical name or alias to its descriptor.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.position(name).map(|pos| &self.fields[pos])
    }

    /// The total bit length if every field is statically sized.
    pub fn static_bit_length(&self) -> Option<usize> {
        self.fields
            .iter()
            .map(|field| field.length.fixed())
            .sum::<Option<usize>>()
    }

    /// The sum of all statically sized, non-optional fields.
    pub fn min_bit_length(&self) -> usize {
        self.fields
            .iter()
            .filter(|field| !field.optional)
            .filter_map(|field| field.length.fixed())
            .sum()
    }

    /// Starts a new table from a deep copy of this one.
    pub fn derive(&self, name: &'static str) -> TableBuilder {
        TableBuilder {
            name,
            fields: self.fields.clone(),
            unknown_edits: Vec::new(),
        }
    }
}

impl fmt::Debug for FieldTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldTable")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .finish()
    }
}

/// Assembles a [`FieldTable`], either from scratch or from a parent table.
#[derive(Debug)]
pub struct TableBuilder {
    name: &'static str,
    fields: Vec<FieldDescriptor>,

    /// Edits that referenced a field the table does not have. These are
    /// reported by [`Self::try_build`].
    unknown_edits: Vec<&'static str>,
}

impl TableBuilder {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: Vec::new(),
            unknown_edits: Vec::new(),
        }
    }

    /// Appends a field.
    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    /// Applies an arbitrary edit to the field answering to `name`.
    pub fn edit(mut self, name: &'static str, edit: impl FnOnce(&mut FieldDescriptor)) -> Self {
        match self.fields.iter_mut().find(|field| field.answers_to(name)) {
            Some(field) => edit(field),
            None => self.unknown_edits.push(name),
        }
        self
    }

    /// Replaces the length of a field.
    pub fn length(self, name: &'static str, length: FieldLength) -> Self {
        self.edit(name, |field| field.length = length)
    }

    /// Replaces the default of a field with an integer sized to its length.
    pub fn default_uint(self, name: &'static str, value: u64) -> Self {
        self.edit(name, |field| {
            let edited = field.clone().default_uint(value);
            field.default = edited.default;
        })
    }

    /// Adds an alias to a field.
    pub fn alias(self, name: &'static str, alias: &'static str) -> Self {
        self.edit(name, |field| field.aliases.push(alias))
    }

    /// Validates the declaration and freezes it.
    pub fn try_build(self) -> Result<Arc<FieldTable>, TableError> {
        if let Some(name) = self.unknown_edits.first() {
            return Err(TableError::UnknownField(name.to_string()));
        }

        let mut lookup = HashMap::<&'static str, usize>::new();
        let mut ids = Vec::<u16>::with_capacity(self.fields.len());

        for (pos, field) in self.fields.iter().enumerate() {
            if ids.contains(&field.id) {
                return Err(TableError::DuplicateId(field.id));
            }
            ids.push(field.id);

            for name in std::iter::once(&field.name).chain(field.aliases.iter()) {
                if lookup.insert(*name, pos).is_some() {
                    return Err(TableError::NameCollision(*name));
                }
            }

            if field.endianness == Endianness::Little
                && field.length.fixed().is_some_and(|bits| bits % 8 != 0)
            {
                return Err(TableError::MisalignedLittleEndian(field.name));
            }

            if let FieldLength::SizedBy { field: sibling, .. } = field.length {
                let declared_before = self.fields[..pos]
                    .iter()
                    .any(|earlier| earlier.answers_to(sibling));
                if !declared_before {
                    return Err(TableError::UnknownSizeField {
                        field: field.name,
                        sibling,
                    });
                }
            }
        }

        Ok(Arc::new(FieldTable {
            name: self.name,
            fields: self.fields,
            lookup,
        }))
    }

    /// Like [`Self::try_build`], but panics on an invalid declaration.
    ///
    /// Meant for tables declared once at start-up, where an invalid
    /// declaration is a programming error.
    pub fn build(self) -> Arc<FieldTable> {
        let name = self.name;
        self.try_build()
            .unwrap_or_else(|err| panic!("invalid field table `{name}`: {err}"))
    }
}

/// Represents an error in a field table declaration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("field id {0} is declared twice")]
    DuplicateId(u16),

    #[error("the name `{0}` is used by more than one field")]
    NameCollision(&'static str),

    #[error("no field answers to `{0}`")]
    UnknownField(String),

    #[error("little-endian field `{0}` is not a whole number of bytes")]
    MisalignedLittleEndian(&'static str),

    #[error("field `{field}` takes its size from `{sibling}`, which is not declared before it")]
    UnknownSizeField {
        field: &'static str,
        sibling: &'static str,
    },
}

/// An instance of the entity described by a [`FieldTable`].
///
/// Fields that were never set fall back to their declared default on read
/// and on encode.
#[derive(Clone)]
pub struct Container {
    table: Arc<FieldTable>,
    values: Vec<Option<Value>>,
}

impl Container {
    /// Creates an instance with no field set.
    pub fn new(table: &Arc<FieldTable>) -> Self {
        Self {
            table: Arc::clone(table),
            values: vec![None; table.fields.len()],
        }
    }

    pub fn table(&self) -> &Arc<FieldTable> {
        &self.table
    }

    pub fn name(&self) -> &'static str {
        self.table.name
    }

    fn position(&self, name: &str) -> Result<usize, CodecError> {
        self.table
            .position(name)
            .ok_or_else(|| CodecError::UnknownField(name.to_string()))
    }

    /// Whether the instance holds an explicit value for the field.
    pub fn is_set(&self, name: &str) -> Result<bool, CodecError> {
        Ok(self.values[self.position(name)?].is_some())
    }

    /// Iterates over descriptors together with their explicit values.
    pub fn fields(&self) -> impl Iterator<Item = (&FieldDescriptor, Option<&Value>)> {
        self.table.fields.iter().zip(self.values.iter().map(Option::as_ref))
    }

    /// The explicit value at `pos`, if any.
    pub fn value_at(&self, pos: usize) -> Option<&Value> {
        self.values.get(pos).and_then(Option::as_ref)
    }

    /// The bit pattern of a field, falling back to its default.
    pub fn get_bits(&self, name: &str) -> Result<&BitBuffer, CodecError> {
        let pos = self.position(name)?;
        let field = &self.table.fields[pos];
        match &self.values[pos] {
            Some(Value::Bits(bits)) => Ok(bits),
            Some(_) => Err(CodecError::WrongKind(field.name)),
            None => field
                .default
                .as_ref()
                .ok_or(CodecError::MissingValue(field.name)),
        }
    }

    /// The value of a field as an unsigned integer.
    pub fn get_uint(&self, name: &str) -> Result<u64, CodecError> {
        let field = self.table.fields[self.position(name)?].name;
        let bits = self.get_bits(name)?;
        bits.read(0, bits.len())
            .map_err(|source| CodecError::Bits { field, source })
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, CodecError> {
        Ok(self.get_uint(name)? != 0)
    }

    /// The value of a field as bytes.
    pub fn get_bytes(&self, name: &str) -> Result<Vec<u8>, CodecError> {
        Ok(self.get_bits(name)?.as_bytes().to_vec())
    }

    /// The nested container stored in a field.
    pub fn get_container(&self, name: &str) -> Result<&Container, CodecError> {
        let pos = self.position(name)?;
        match &self.values[pos] {
            Some(Value::Container(inner)) => Ok(inner),
            Some(_) => Err(CodecError::WrongKind(self.table.fields[pos].name)),
            None => Err(CodecError::MissingValue(self.table.fields[pos].name)),
        }
    }

    /// The list of nested containers stored in a field.
    pub fn get_list(&self, name: &str) -> Result<&[Container], CodecError> {
        let pos = self.position(name)?;
        match &self.values[pos] {
            Some(Value::List(items)) => Ok(items),
            Some(_) => Err(CodecError::WrongKind(self.table.fields[pos].name)),
            None => Err(CodecError::MissingValue(self.table.fields[pos].name)),
        }
    }

    /// Sets an integer, sized to the field's declared length.
    ///
    /// Fields without a fixed length store the narrowest byte-aligned image,
    /// unless the field already holds a value, whose width is then kept.
    pub fn set_uint(&mut self, name: &str, value: u64) -> Result<(), CodecError> {
        let pos = self.position(name)?;
        let field = &self.table.fields[pos];

        let bits = match field.length.fixed() {
            Some(bits) => bits,
            None => match &self.values[pos] {
                Some(Value::Bits(current)) if !current.is_empty() => current.len(),
                _ => {
                    let needed = (u64::BITS - value.leading_zeros()) as usize;
                    needed.div_ceil(8).max(1) * 8
                },
            },
        };

        let image = BitBuffer::from_uint(value, bits).map_err(|_| CodecError::Overflow {
            field: field.name,
            reason: ValidationError::TooWide { value, bits },
        })?;

        self.store(pos, Value::Bits(image))
    }

    pub fn set_bool(&mut self, name: &str, value: bool) -> Result<(), CodecError> {
        self.set_uint(name, value.into())
    }

    /// Sets a byte sequence. Fixed-length fields require an exact fit.
    pub fn set_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<(), CodecError> {
        self.set_bits(name, BitBuffer::from_bytes(bytes))
    }

    /// Sets a raw bit pattern. Fixed-length fields require an exact fit.
    pub fn set_bits(&mut self, name: &str, bits: BitBuffer) -> Result<(), CodecError> {
        let pos = self.position(name)?;
        let field = &self.table.fields[pos];

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

        self.store(pos, Value::Bits(bits))
    }

    /// Stores a nested container.
    pub fn set_container(&mut self, name: &str, inner: Container) -> Result<(), CodecError> {
        let pos = self.position(name)?;
        self.store(pos, Value::Container(Box::new(inner)))
    }

    /// Stores a list of nested containers.
    pub fn set_list(&mut self, name: &str, items: Vec<Container>) -> Result<(), CodecError> {
        let pos = self.position(name)?;
        self.store(pos, Value::List(items))
    }

    /// Removes the explicit value of a field.
    pub fn clear(&mut self, name: &str) -> Result<(), CodecError> {
        let pos = self.position(name)?;
        self.values[pos] = None;
        Ok(())
    }

    fn store(&mut self, pos: usize, value: Value) -> Result<(), CodecError> {
        self.table.fields[pos].validate(&value)?;
        self.values[pos] = Some(value);
        Ok(())
    }

    /// Stores a decoded value without running write-time validators.
    pub(crate) fn store_decoded(&mut self, pos: usize, value: Value) {
        self.values[pos] = Some(value);
    }

    /// Chaining variant of [`Self::set_uint`].
    pub fn with_uint(mut self, name: &str, value: u64) -> Result<Self, CodecError> {
        self.set_uint(name, value)?;
        Ok(self)
    }

    /// Chaining variant of [`Self::set_bytes`].
    pub fn with_bytes(mut self, name: &str, bytes: &[u8]) -> Result<Self, CodecError> {
        self.set_bytes(name, bytes)?;
        Ok(self)
    }

    /// Encodes the instance and renders it as hex.
    pub fn to_hex(&self) -> Result<String, CodecError> {
        Ok(codec::encode(self)?.to_hex())
    }

    /// The value of every field, explicit or default.
    fn resolved(&self) -> impl Iterator<Item = Option<Value>> + '_ {
        self.fields().map(|(field, value)| {
            value
                .cloned()
                .or_else(|| field.default.clone().map(Value::Bits))
        })
    }
}

impl PartialEq for Container {
    fn eq(&self, other: &Self) -> bool {
        self.table.name == other.table.name
            && self.values.len() == other.values.len()
            && self.resolved().eq(other.resolved())
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct(self.table.name);
        for (field, value) in self.fields() {
            match value {
                Some(Value::Bits(bits)) => out.field(field.name, &format_args!("{bits}")),
                Some(Value::Container(inner)) => out.field(field.name, inner),
                Some(Value::List(items)) => out.field(field.name, items),
                None => out.field(field.name, &format_args!("<default>")),
            };
        }
        out.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Validator;

    fn pair_table() -> Arc<FieldTable> {
        TableBuilder::new("Pair")
            .field(FieldDescriptor::new(0, "public_key", FieldLength::Variable))
            .field(FieldDescriptor::new(1, "signature", FieldLength::Variable))
            .build()
    }

    #[test]
    fn derived_tables_do_not_touch_their_parent() {
        let parent = pair_table();
        let rsa = parent
            .derive("Rsa2048Pair")
            .length("public_key", FieldLength::bytes(256))
            .length("signature", FieldLength::bytes(256))
            .build();

        assert_eq!(rsa.static_bit_length(), Some(512 * 8));
        assert_eq!(parent.fields()[0].length, FieldLength::Variable);
        assert_eq!(parent.static_bit_length(), None);
    }

    #[test]
    fn rejects_colliding_names() {
        let result = TableBuilder::new("Broken")
            .field(FieldDescriptor::bits(0, "a", 8))
            .field(FieldDescriptor::bits(1, "b", 8).alias("a"))
            .try_build();
        assert_eq!(result.unwrap_err(), TableError::NameCollision("a"));
    }

    #[test]
    fn rejects_duplicate_ids_and_unknown_edits() {
        let result = TableBuilder::new("Broken")
            .field(FieldDescriptor::bits(0, "a", 8))
            .field(FieldDescriptor::bits(0, "b", 8))
            .try_build();
        assert_eq!(result.unwrap_err(), TableError::DuplicateId(0));

        let result = pair_table().derive("Broken").length("nope", FieldLength::Bits(8)).try_build();
        assert_eq!(result.unwrap_err(), TableError::UnknownField("nope".into()));
    }

    #[test]
    fn rejects_misaligned_little_endian_fields() {
        let result = TableBuilder::new("Broken")
            .field(FieldDescriptor::bits(0, "a", 12).little_endian())
            .try_build();
        assert_eq!(result.unwrap_err(), TableError::MisalignedLittleEndian("a"));
    }

    #[test]
    fn aliases_resolve_to_the_same_value() {
        let table = TableBuilder::new("Header")
            .field(
                FieldDescriptor::bits(0, "header_size", 16)
                    .alias("hdr_size")
                    .alias("ih_hdr_size"),
            )
            .build();

        let mut container = Container::new(&table);
        container.set_uint("hdr_size", 512).unwrap();
        assert_eq!(container.get_uint("header_size").unwrap(), 512);
        assert_eq!(container.get_uint("ih_hdr_size").unwrap(), 512);

        container.set_uint("ih_hdr_size", 32).unwrap();
        assert_eq!(container.get_uint("hdr_size").unwrap(), 32);
    }

    #[test]
    fn unset_fields_fall_back_to_defaults() {
        let table = TableBuilder::new("Defaults")
            .field(FieldDescriptor::bits(0, "magic", 32).default_uint(0x96f3_b83d))
            .field(FieldDescriptor::bits(1, "size", 32))
            .build();

        let container = Container::new(&table);
        assert_eq!(container.get_uint("magic").unwrap(), 0x96f3_b83d);
        assert!(matches!(
            container.get_uint("size"),
            Err(CodecError::MissingValue("size"))
        ));
    }

    #[test]
    fn writes_are_validated() {
        let table = TableBuilder::new("Checked")
            .field(FieldDescriptor::bits(0, "level", 8).validator(Validator::Range { min: 0, max: 100 }))
            .field(FieldDescriptor::bytes(1, "hash", 4))
            .build();

        let mut container = Container::new(&table);
        assert!(container.set_uint("level", 100).is_ok());
        assert!(container.set_uint("level", 101).is_err());
        assert!(container.set_uint("level", 0x100).is_err());
        assert!(container.set_bytes("hash", &[1, 2, 3]).is_err());
        assert!(container.set_bytes("hash", &[1, 2, 3, 4]).is_ok());
    }

    #[test]
    fn equality_compares_resolved_values() {
        let table = TableBuilder::new("Eq")
            .field(FieldDescriptor::bits(0, "reserved", 8).default_uint(0))
            .build();

        let implicit = Container::new(&table);
        let explicit = Container::new(&table).with_uint("reserved", 0).unwrap();
        assert_eq!(implicit, explicit);

        let other = Container::new(&table).with_uint("reserved", 1).unwrap();
        assert_ne!(implicit, other);
    }
}
