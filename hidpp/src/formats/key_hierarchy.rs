//! The bootloader's chain of trust: the key hierarchy table, the root of
//! trust and the structure the bootloader shares with the running image.

use std::sync::Arc;

use lazy_static::lazy_static;

use super::{BOOT_IMAGE_COMMUNICATION_MAGIC, KEY_HIERARCHY_MAGIC};
use crate::{
    bits::BitBuffer,
    codec::{self, CodecError, DecodeContext, FieldCodec, Nested, RepeatCount, Repeated},
    container::{Container, FieldTable, TableBuilder, Value},
    field::{FieldDescriptor, FieldLength, Validator},
};

lazy_static! {
    pub static ref KEY_HIERARCHY_HEADER: Arc<FieldTable> = TableBuilder::new("KeyHierarchyHeader")
        .field(
            FieldDescriptor::bits(1, "magic_number", 32)
                .alias("magic")
                .little_endian()
                .default_uint(KEY_HIERARCHY_MAGIC.into())
                .validator(Validator::MatchesDefault),
        )
        .field(FieldDescriptor::bits(2, "root_of_trust_index", 8))
        .field(FieldDescriptor::bits(3, "key_count", 8))
        .field(FieldDescriptor::bits(4, "reserved", 16).little_endian().default_uint(0))
        .build();

    /// A public key with the signature vouching for it. The sizes depend on
    /// the key flavour, see the derived tables below.
    pub static ref KEY_PAIR: Arc<FieldTable> = TableBuilder::new("KeyHierarchyPair")
        .field(FieldDescriptor::new(1, "public_key", FieldLength::Variable))
        .field(FieldDescriptor::new(2, "signature", FieldLength::Variable))
        .build();

    /// An uncompressed SEC 1 P-256 key and a raw `R || S` signature.
    pub static ref EC_PAIR: Arc<FieldTable> = KEY_PAIR
        .derive("EcPair")
        .length("public_key", FieldLength::bytes(65))
        .length("signature", FieldLength::bytes(64))
        .build();

    /// A modulus and a RSA-PSS signature of the same size.
    pub static ref RSA2048_PAIR: Arc<FieldTable> = KEY_PAIR
        .derive("Rsa2048Pair")
        .length("public_key", FieldLength::bytes(256))
        .length("signature", FieldLength::bytes(256))
        .build();

    pub static ref RSA3072_PAIR: Arc<FieldTable> = KEY_PAIR
        .derive("Rsa3072Pair")
        .length("public_key", FieldLength::bytes(384))
        .length("signature", FieldLength::bytes(384))
        .build();

    static ref EC_KEY_HIERARCHY: Arc<FieldTable> = hierarchy("EcKeyHierarchy", &EC_PAIR);
    static ref RSA2048_KEY_HIERARCHY: Arc<FieldTable> = hierarchy("Rsa2048KeyHierarchy", &RSA2048_PAIR);
    static ref RSA3072_KEY_HIERARCHY: Arc<FieldTable> = hierarchy("Rsa3072KeyHierarchy", &RSA3072_PAIR);

    static ref EC_PAIRS_TABLE: Arc<FieldTable> = pairs_table("EcPairsTable", &EC_PAIR);
    static ref RSA2048_PAIRS_TABLE: Arc<FieldTable> = pairs_table("Rsa2048PairsTable", &RSA2048_PAIR);
    static ref RSA3072_PAIRS_TABLE: Arc<FieldTable> = pairs_table("Rsa3072PairsTable", &RSA3072_PAIR);

    /// A single DER encoded certificate.
    pub static ref X509_CERTIFICATE: Arc<FieldTable> = TableBuilder::new("X509Certificate")
        .field(FieldDescriptor::new(1, "raw", FieldLength::Variable).alias("der"))
        .build();

    pub static ref X509_CERTIFICATES_TABLE: Arc<FieldTable> = TableBuilder::new("X509CertificatesTable")
        .field(FieldDescriptor::new(1, "certificates", FieldLength::Variable).codec(DerCertificates))
        .build();

    /// A key hierarchy carrying certificates instead of raw pairs.
    pub static ref X509_KEY_HIERARCHY: Arc<FieldTable> = KEY_HIERARCHY_HEADER
        .derive("X509KeyHierarchy")
        .field(FieldDescriptor::new(5, "certificates", FieldLength::Variable).codec(DerCertificates))
        .build();

    pub static ref ROOT_OF_TRUST: Arc<FieldTable> = TableBuilder::new("RootOfTrust")
        .field(FieldDescriptor::bits(1, "encoded_flags", 32).little_endian())
        .field(FieldDescriptor::bits(2, "public_key_address", 32).little_endian())
        .build();

    pub static ref BUILD_FLAGS: Arc<FieldTable> = TableBuilder::new("BuildFlags")
        .field(FieldDescriptor::bits(1, "reserved_4_7", 4).default_uint(0))
        .field(FieldDescriptor::bits(2, "development_credentials", 1).default_uint(0))
        .field(FieldDescriptor::bits(3, "reserved_2", 1).default_uint(0))
        .field(FieldDescriptor::bits(4, "debug_build", 1).default_uint(0))
        .field(FieldDescriptor::bits(5, "dirty_build", 1).default_uint(0))
        .build();

    /// The fields both communication structure layouts start with.
    static ref BOOT_IMAGE_COMMUNICATION_PREFIX: Arc<FieldTable> =
        TableBuilder::new("BootImageCommunicationPrefix")
            .field(
                FieldDescriptor::bits(1, "magic_number", 32)
                    .alias("magic")
                    .little_endian()
                    .default_uint(BOOT_IMAGE_COMMUNICATION_MAGIC.into())
                    .validator(Validator::MatchesDefault),
            )
            .field(FieldDescriptor::bits(2, "version", 8))
            .field(FieldDescriptor::bits(3, "prefix", 24).little_endian())
            .field(FieldDescriptor::bits(4, "fw_number", 8))
            .field(FieldDescriptor::bits(5, "fw_version", 8))
            .field(FieldDescriptor::bits(6, "fw_build_number", 16).little_endian())
            .field(FieldDescriptor::bits(7, "git_hash", 32).little_endian())
            .field(FieldDescriptor::bits(8, "build_flags", 8).default_uint(0).codec(Nested::new(&BUILD_FLAGS)))
            .build();

    pub static ref BOOT_IMAGE_COMMUNICATION: Arc<FieldTable> = BOOT_IMAGE_COMMUNICATION_PREFIX
        .derive("BootImageCommunication")
        .field(FieldDescriptor::bits(9, "reserved", 24).little_endian().default_uint(0))
        .field(FieldDescriptor::bits(10, "bl_to_img_flags", 16).little_endian().default_uint(0))
        .field(FieldDescriptor::bits(11, "img_to_bl_flags", 16).little_endian().default_uint(0))
        .build();

    pub static ref BOOT_IMAGE_COMMUNICATION_WITH_ROOT_OF_TRUST: Arc<FieldTable> =
        BOOT_IMAGE_COMMUNICATION_PREFIX
            .derive("BootImageCommunicationWithRootOfTrust")
            .field(FieldDescriptor::bits(9, "reserved", 16).little_endian().default_uint(0))
            .field(FieldDescriptor::bits(10, "root_of_trust_count", 8))
            .field(FieldDescriptor::bits(11, "root_of_trust_addr", 32).little_endian())
            .field(FieldDescriptor::bits(12, "bl_to_img_flags", 16).little_endian().default_uint(0))
            .field(FieldDescriptor::bits(13, "img_to_bl_flags", 16).little_endian().default_uint(0))
            .build();
}

/// The header followed by `key_count` pairs.
fn hierarchy(name: &'static str, pair: &Arc<FieldTable>) -> Arc<FieldTable> {
    KEY_HIERARCHY_HEADER
        .derive(name)
        .field(
            FieldDescriptor::new(5, "pairs", FieldLength::Variable)
                .codec(Repeated::new(pair, RepeatCount::FromField("key_count"))),
        )
        .build()
}

/// Pairs read one after another while they fit.
fn pairs_table(name: &'static str, pair: &Arc<FieldTable>) -> Arc<FieldTable> {
    TableBuilder::new(name)
        .field(
            FieldDescriptor::new(1, "pairs", FieldLength::Variable)
                .codec(Repeated::new(pair, RepeatCount::WhileFits)),
        )
        .build()
}

/// The cryptographic flavour of the pairs in a key hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum KeyFlavour {
    Ec,
    Rsa2048,
    Rsa3072,
}

impl KeyFlavour {
    pub fn pair_table(self) -> &'static Arc<FieldTable> {
        match self {
            Self::Ec => &EC_PAIR,
            Self::Rsa2048 => &RSA2048_PAIR,
            Self::Rsa3072 => &RSA3072_PAIR,
        }
    }

    /// The table of a whole hierarchy: header and pairs.
    pub fn hierarchy_table(self) -> &'static Arc<FieldTable> {
        match self {
            Self::Ec => &EC_KEY_HIERARCHY,
            Self::Rsa2048 => &RSA2048_KEY_HIERARCHY,
            Self::Rsa3072 => &RSA3072_KEY_HIERARCHY,
        }
    }

    /// The table of a bare run of pairs without a header.
    pub fn pairs_table(self) -> &'static Arc<FieldTable> {
        match self {
            Self::Ec => &EC_PAIRS_TABLE,
            Self::Rsa2048 => &RSA2048_PAIRS_TABLE,
            Self::Rsa3072 => &RSA3072_PAIRS_TABLE,
        }
    }

    /// The size of one pair in bytes.
    pub fn pair_size(self) -> usize {
        self.pair_table().static_bit_length().unwrap_or_default() / 8
    }
}

/// Represents a public key and the signature vouching for it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct KeyPair {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl TryFrom<&Container> for KeyPair {
    type Error = CodecError;

    fn try_from(pair: &Container) -> Result<Self, Self::Error> {
        Ok(Self {
            public_key: pair.get_bytes("public_key")?,
            signature: pair.get_bytes("signature")?,
        })
    }
}

/// Represents a decoded key hierarchy.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct KeyHierarchy {
    pub flavour: KeyFlavour,

    /// The index of the root of trust the first pair is signed with.
    pub root_of_trust_index: u8,

    pub pairs: Vec<KeyPair>,
}

impl KeyHierarchy {
    pub fn parse(bytes: &[u8], flavour: KeyFlavour) -> Result<Self, CodecError> {
        let hierarchy = codec::decode_bytes(flavour.hierarchy_table(), bytes)?;
        Ok(Self {
            flavour,
            root_of_trust_index: hierarchy.get_uint("root_of_trust_index")? as u8,
            pairs: hierarchy
                .get_list("pairs")?
                .iter()
                .map(KeyPair::try_from)
                .collect::<Result<_, _>>()?,
        })
    }
}

/// Splits a flat buffer into the DER certificates it holds.
pub fn parse_certificates(bytes: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    let table = codec::decode_bytes(&X509_CERTIFICATES_TABLE, bytes)?;
    certificates(&table)
}

/// The raw certificates of a decoded certificates table or X.509 hierarchy.
pub fn certificates(container: &Container) -> Result<Vec<Vec<u8>>, CodecError> {
    container
        .get_list("certificates")?
        .iter()
        .map(|certificate| certificate.get_bytes("raw"))
        .collect()
}

/// Reads DER certificates back to back until the input ends or only `0xFF`
/// padding is left.
struct DerCertificates;

impl FieldCodec for DerCertificates {
    fn name(&self) -> &'static str {
        "DerCertificates"
    }

    fn decode(&self, ctx: &DecodeContext<'_>) -> Result<(usize, Value), CodecError> {
        let mut items = Vec::new();
        let mut offset = ctx.offset;

        while offset < ctx.limit {
            let rest = ctx
                .input
                .slice(offset, ctx.limit - offset)
                .map_err(|source| CodecError::Bits {
                    field: ctx.field.name,
                    source,
                })?;
            let bytes = rest.as_bytes();

            if bytes.iter().all(|&byte| byte == 0xff) {
                offset = ctx.limit;
                break;
            }

            let length = der_length(bytes).ok_or_else(|| CodecError::Malformed {
                field: ctx.field.name,
                detail: format!("no DER sequence at byte {}", offset / 8),
            })?;
            if length > bytes.len() {
                return Err(CodecError::Malformed {
                    field: ctx.field.name,
                    detail: format!(
                        "certificate at byte {} spans {length} bytes, {} left",
                        offset / 8,
                        bytes.len()
                    ),
                });
            }

            let end = offset + length * 8;
            let (certificate, next) =
                codec::decode_window(&X509_CERTIFICATE, ctx.input, offset, end, ctx.overflow)?;
            items.push(certificate);
            offset = next;
        }

        Ok((offset, Value::List(items)))
    }

    fn encode(&self, field: &FieldDescriptor, value: &Value) -> Result<BitBuffer, CodecError> {
        let Value::List(items) = value else {
            return Err(CodecError::WrongKind(field.name));
        };
        let images = items.iter().map(codec::encode).collect::<Result<Vec<_>, _>>()?;
        Ok(BitBuffer::concat(&images))
    }
}

/// The total size of the DER SEQUENCE at the start of `bytes`, header
/// included.
fn der_length(bytes: &[u8]) -> Option<usize> {
    const SEQUENCE: u8 = 0x30;

    let (&tag, rest) = bytes.split_first()?;
    if tag != SEQUENCE {
        return None;
    }

    let (&first, rest) = rest.split_first()?;
    if first & 0x80 == 0 {
        return Some(2 + usize::from(first));
    }

    let count = usize::from(first & 0x7f);
    if count == 0 || count > 4 || rest.len() < count {
        return None;
    }
    let content = rest[..count]
        .iter()
        .fold(0usize, |acc, &byte| acc << 8 | usize::from(byte));
    Some(2 + count + content)
}

/// Whether a root of trust may still be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Validity {
    Valid,
    Invalid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum RootOfTrustType {
    Development,
    Production,
}

/// Represents a root of trust, the key the bootloader trusts a priori.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RootOfTrust {
    pub validity: Validity,
    pub typ: RootOfTrustType,

    /// Where the public key is stored in flash.
    pub public_key_address: u32,
}

impl RootOfTrust {
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::try_from(&codec::decode_bytes(&ROOT_OF_TRUST, bytes)?)
    }
}

impl TryFrom<&Container> for RootOfTrust {
    type Error = CodecError;

    fn try_from(root: &Container) -> Result<Self, Self::Error> {
        let flags = root.get_uint("encoded_flags")?;
        Ok(Self {
            validity: if flags & (1 << 1) != 0 {
                Validity::Invalid
            } else {
                Validity::Valid
            },
            typ: if flags & 1 != 0 {
                RootOfTrustType::Production
            } else {
                RootOfTrustType::Development
            },
            public_key_address: root.get_uint("public_key_address")? as u32,
        })
    }
}

/// Properties of the build the bootloader was produced by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BuildFlags {
    pub dirty: bool,
    pub debug: bool,
    pub development_credentials: bool,
}

impl TryFrom<&Container> for BuildFlags {
    type Error = CodecError;

    fn try_from(flags: &Container) -> Result<Self, Self::Error> {
        Ok(Self {
            dirty: flags.get_bool("dirty_build")?,
            debug: flags.get_bool("debug_build")?,
            development_credentials: flags.get_bool("development_credentials")?,
        })
    }
}

/// The state the bootloader hands over to the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BootloaderToImageFlags {
    /// Set for a cold boot, clear for a warm boot.
    pub cold_boot: bool,

    /// Set if the alternate slot was booted.
    pub alternate_slot: bool,

    pub slot_available: bool,
}

impl From<u16> for BootloaderToImageFlags {
    fn from(value: u16) -> Self {
        Self {
            cold_boot: value & 1 != 0,
            alternate_slot: value & (1 << 1) != 0,
            slot_available: value & (1 << 2) != 0,
        }
    }
}

/// Requests of the image for the next boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ImageToBootloaderFlags {
    pub cold_boot_request: bool,
    pub alternate_slot_request: bool,
}

impl From<u16> for ImageToBootloaderFlags {
    fn from(value: u16) -> Self {
        Self {
            cold_boot_request: value & 1 != 0,
            alternate_slot_request: value & (1 << 1) != 0,
        }
    }
}

/// Where the roots of trust are stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RootOfTrustLocation {
    pub count: u8,
    pub address: u32,
}

/// Represents the structure shared between the bootloader and the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BootImageCommunication {
    pub version: u8,
    pub prefix: u32,
    pub fw_number: u8,
    pub fw_version: u8,
    pub fw_build_number: u16,
    pub git_hash: u32,
    pub build_flags: BuildFlags,
    pub bootloader_to_image: BootloaderToImageFlags,
    pub image_to_bootloader: ImageToBootloaderFlags,

    /// Only present in the layout carrying a root of trust.
    pub root_of_trust: Option<RootOfTrustLocation>,
}

impl BootImageCommunication {
    /// Decodes the layout without a root of trust.
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::try_from(&codec::decode_bytes(&BOOT_IMAGE_COMMUNICATION, bytes)?)
    }

    /// Decodes the layout carrying a root of trust.
    pub fn parse_with_root_of_trust(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::try_from(&codec::decode_bytes(&BOOT_IMAGE_COMMUNICATION_WITH_ROOT_OF_TRUST, bytes)?)
    }
}

impl TryFrom<&Container> for BootImageCommunication {
    type Error = CodecError;

    fn try_from(comm: &Container) -> Result<Self, Self::Error> {
        let root_of_trust = if comm.table().field("root_of_trust_count").is_some() {
            Some(RootOfTrustLocation {
                count: comm.get_uint("root_of_trust_count")? as u8,
                address: comm.get_uint("root_of_trust_addr")? as u32,
            })
        } else {
            None
        };

        Ok(Self {
            version: comm.get_uint("version")? as u8,
            prefix: comm.get_uint("prefix")? as u32,
            fw_number: comm.get_uint("fw_number")? as u8,
            fw_version: comm.get_uint("fw_version")? as u8,
            fw_build_number: comm.get_uint("fw_build_number")? as u16,
            git_hash: comm.get_uint("git_hash")? as u32,
            build_flags: BuildFlags::try_from(comm.get_container("build_flags")?)?,
            bootloader_to_image: (comm.get_uint("bl_to_img_flags")? as u16).into(),
            image_to_bootloader: (comm.get_uint("img_to_bl_flags")? as u16).into(),
            root_of_trust,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: [u8; 8] = [0x7a, 0xda, 0xfe, 0x5a, 0x00, 0x02, 0x00, 0x00];

    fn ec_pair(seed: u8) -> Vec<u8> {
        [vec![seed; 65], vec![!seed; 64]].concat()
    }

    #[test]
    fn decodes_an_ec_key_hierarchy() {
        let bytes = [HEADER.to_vec(), ec_pair(0x04), ec_pair(0x10)].concat();
        let hierarchy = codec::decode_bytes(KeyFlavour::Ec.hierarchy_table(), &bytes).unwrap();

        assert_eq!(hierarchy.get_uint("magic_number").unwrap(), 0x5afe_da7a);
        assert_eq!(hierarchy.get_uint("root_of_trust_index").unwrap(), 0);
        assert_eq!(hierarchy.get_uint("key_count").unwrap(), 2);

        let pairs = hierarchy.get_list("pairs").unwrap();
        assert_eq!(pairs.len(), 2);
        for pair in pairs {
            assert_eq!(pair.get_bytes("public_key").unwrap().len(), 65);
            assert_eq!(pair.get_bytes("signature").unwrap().len(), 64);
        }

        let typed = KeyHierarchy::parse(&bytes, KeyFlavour::Ec).unwrap();
        assert_eq!(typed.pairs[1].public_key, vec![0x10; 65]);
        assert_eq!(typed.pairs[1].signature, vec![0xef; 64]);
    }

    #[test]
    fn pair_strides_depend_on_the_flavour() {
        assert_eq!(KeyFlavour::Ec.pair_size(), 129);
        assert_eq!(KeyFlavour::Rsa2048.pair_size(), 512);
        assert_eq!(KeyFlavour::Rsa3072.pair_size(), 768);
        assert_eq!(KEY_PAIR.static_bit_length(), None);

        let mut header = HEADER;
        header[5] = 1;
        let bytes = [header.to_vec(), vec![0x01; 256], vec![0x02; 256]].concat();
        let hierarchy = KeyHierarchy::parse(&bytes, KeyFlavour::Rsa2048).unwrap();
        assert_eq!(hierarchy.pairs.len(), 1);
        assert_eq!(hierarchy.pairs[0].signature, vec![0x02; 256]);
    }

    #[test]
    fn missing_pairs_are_reported() {
        let bytes = [HEADER.to_vec(), ec_pair(0x04)].concat();
        let err = KeyHierarchy::parse(&bytes, KeyFlavour::Ec).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { field: "public_key", .. }));
    }

    #[test]
    fn rejects_a_foreign_magic() {
        let mut bytes = [HEADER.to_vec(), ec_pair(0x04), ec_pair(0x10)].concat();
        bytes[3] = 0x5b;
        assert!(KeyHierarchy::parse(&bytes, KeyFlavour::Ec).is_err());
    }

    #[test]
    fn pairs_tables_stop_when_the_next_pair_does_not_fit() {
        let bytes = [ec_pair(1), ec_pair(2), vec![0; 100]].concat();
        let table = codec::decode_bytes(KeyFlavour::Ec.pairs_table(), &bytes).unwrap();
        assert_eq!(table.get_list("pairs").unwrap().len(), 2);
    }

    #[test]
    fn splits_der_certificates_until_the_padding() {
        let short = vec![0x30, 0x03, 0x01, 0x02, 0x03];
        let long = [vec![0x30, 0x81, 0x80], vec![0x42; 128]].concat();
        let bytes = [short.clone(), long.clone(), vec![0xff; 10]].concat();

        let certificates = parse_certificates(&bytes).unwrap();
        assert_eq!(certificates, vec![short.clone(), long]);

        let hierarchy = codec::decode_bytes(&X509_KEY_HIERARCHY, &[HEADER.to_vec(), short].concat()).unwrap();
        assert_eq!(super::certificates(&hierarchy).unwrap().len(), 1);
    }

    #[test]
    fn rejects_garbage_between_certificates() {
        let bytes = [vec![0x30, 0x01, 0x00], vec![0x12, 0xff]].concat();
        assert!(matches!(
            parse_certificates(&bytes),
            Err(CodecError::Malformed { field: "certificates", .. })
        ));

        let truncated = vec![0x30, 0x10, 0x00];
        assert!(parse_certificates(&truncated).is_err());
    }

    #[test]
    fn decodes_a_root_of_trust() {
        let root = RootOfTrust::parse(&[0x03, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x08]).unwrap();
        assert_eq!(root.validity, Validity::Invalid);
        assert_eq!(root.typ, RootOfTrustType::Production);
        assert_eq!(root.public_key_address, 0x0800_1000);

        let root = RootOfTrust::parse(&[0x00; 8]).unwrap();
        assert_eq!(root.validity, Validity::Valid);
        assert_eq!(root.typ, RootOfTrustType::Development);
    }

    fn communication_prefix() -> Vec<u8> {
        vec![
            0xad, 0x10, 0x07, 0xb0, // magic
            0x01, // version
            0x01, 0x02, 0x03, // prefix
            0x05, 0x07, // fw number, fw version
            0x02, 0x01, // build number
            0x78, 0x56, 0x34, 0x12, // git hash
            0b0000_1011, // build flags
        ]
    }

    #[test]
    fn decodes_the_boot_image_communication() {
        let bytes = [communication_prefix(), vec![0, 0, 0, 0x05, 0x00, 0x02, 0x00]].concat();
        let comm = BootImageCommunication::parse(&bytes).unwrap();

        assert_eq!(comm.version, 1);
        assert_eq!(comm.prefix, 0x03_0201);
        assert_eq!(comm.fw_build_number, 0x0102);
        assert_eq!(comm.git_hash, 0x1234_5678);
        assert_eq!(
            comm.build_flags,
            BuildFlags {
                dirty: true,
                debug: true,
                development_credentials: true,
            }
        );
        assert!(comm.bootloader_to_image.cold_boot);
        assert!(!comm.bootloader_to_image.alternate_slot);
        assert!(comm.bootloader_to_image.slot_available);
        assert!(comm.image_to_bootloader.alternate_slot_request);
        assert!(!comm.image_to_bootloader.cold_boot_request);
        assert_eq!(comm.root_of_trust, None);
    }

    #[test]
    fn decodes_the_layout_with_a_root_of_trust() {
        let tail = vec![0, 0, 0x02, 0x00, 0x40, 0x00, 0x08, 0x01, 0x00, 0x00, 0x00];
        let bytes = [communication_prefix(), tail].concat();
        let comm = BootImageCommunication::parse_with_root_of_trust(&bytes).unwrap();

        assert_eq!(
            comm.root_of_trust,
            Some(RootOfTrustLocation {
                count: 2,
                address: 0x0800_4000,
            })
        );
        assert!(comm.bootloader_to_image.cold_boot);
        assert_eq!(comm.image_to_bootloader, ImageToBootloaderFlags::default());
    }
}
