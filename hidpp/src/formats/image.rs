//! The header and trailer of signed firmware images as handled by the
//! bootloader.
//!
//! All integers are little-endian on the wire. Hashes and signatures are
//! plain byte arrays and keep their big-endian order.

use std::{fmt, sync::Arc};

use lazy_static::lazy_static;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{IMAGE_MAGIC, IMAGE_TLV_INFO_MAGIC, IMAGE_TLV_PROT_INFO_MAGIC};
use crate::{
    bits::BitBuffer,
    codec::{self, CodecError, DecodeContext, FieldCodec, Nested, Overflow},
    container::{Container, FieldTable, TableBuilder, Value},
    field::{FieldDescriptor, FieldLength, Validator},
};

/// The size of a TLV carrying a SHA-256 hash, header included.
const HASH_TLV_BITS: usize = (4 + 32) * 8;

lazy_static! {
    pub static ref IMAGE_VERSION: Arc<FieldTable> = TableBuilder::new("ImageVersion")
        .field(FieldDescriptor::bits(1, "major", 8).alias("iv_major"))
        .field(FieldDescriptor::bits(2, "minor", 8).alias("iv_minor"))
        .field(FieldDescriptor::bits(3, "revision", 16).alias("iv_revision").little_endian())
        .field(
            FieldDescriptor::bits(4, "build_num", 32)
                .alias("iv_build_num")
                .alias("build_number")
                .little_endian(),
        )
        .build();

    pub static ref IMAGE_HEADER: Arc<FieldTable> = TableBuilder::new("ImageHeader")
        .field(
            FieldDescriptor::bits(1, "magic", 32)
                .alias("ih_magic")
                .little_endian()
                .default_uint(IMAGE_MAGIC.into())
                .validator(Validator::MatchesDefault),
        )
        .field(FieldDescriptor::bits(2, "load_addr", 32).alias("ih_load_addr").little_endian())
        .field(
            FieldDescriptor::bits(3, "header_size", 16)
                .alias("hdr_size")
                .alias("ih_hdr_size")
                .little_endian(),
        )
        .field(
            FieldDescriptor::bits(4, "protect_tlv_size", 16)
                .alias("ih_protect_tlv_size")
                .little_endian(),
        )
        .field(
            FieldDescriptor::bits(5, "image_size", 32)
                .alias("img_size")
                .alias("ih_img_size")
                .little_endian(),
        )
        .field(FieldDescriptor::bits(6, "flags", 32).alias("ih_flags").little_endian().default_uint(0))
        .field(
            FieldDescriptor::bits(7, "image_version", 64)
                .alias("ih_ver")
                .default_bytes(&[0; 8])
                .codec(Nested::new(&IMAGE_VERSION)),
        )
        .field(FieldDescriptor::bits(8, "pad_1", 32).alias("_pad1").default_uint(0))
        .build();

    pub static ref IMAGE_TLV_INFO: Arc<FieldTable> = TableBuilder::new("ImageTlvInfo")
        .field(
            FieldDescriptor::bits(1, "magic", 16)
                .alias("it_magic")
                .little_endian()
                .default_uint(IMAGE_TLV_INFO_MAGIC.into()),
        )
        .field(FieldDescriptor::bits(2, "tlv_tot", 16).alias("it_tlv_tot").little_endian())
        .build();

    /// A TLV of any type. The value spans `length` bytes.
    pub static ref IMAGE_TLV: Arc<FieldTable> = TableBuilder::new("ImageTlv")
        .field(FieldDescriptor::bits(1, "type", 16).alias("it_type").little_endian())
        .field(FieldDescriptor::bits(2, "length", 16).alias("it_len").little_endian())
        .field(FieldDescriptor::new(
            3,
            "value",
            FieldLength::SizedBy {
                field: "length",
                unit_bits: 8,
            },
        ))
        .build();

    /// SHA-256 hash of the public signing key.
    pub static ref KEY_HASH_TLV: Arc<FieldTable> = fixed_variant("ImageTlvKeyHash", TlvType::KeyHash, 32)
        .alias("value", "sha_256_hash")
        .alias("value", "key_hash")
        .build();

    /// SHA-256 hash of the header, the image and the protected TLVs.
    pub static ref SLOT_HASH_TLV: Arc<FieldTable> = fixed_variant("ImageTlvSlotHash", TlvType::Sha256, 32)
        .alias("value", "sha_256_hash")
        .alias("value", "slot_hash")
        .build();

    /// A DER encoded ECDSA-P-256 signature, which varies between 70 and 72
    /// bytes.
    pub static ref ECDSA256_TLV: Arc<FieldTable> = variant("ImageTlvSignatureEcdsa256", TlvType::Ecdsa256)
        .alias("value", "signature")
        .alias("value", "ecdsa_p_256_signature")
        .edit("value", |field| field.validators.push(Validator::ByteLength { min: 70, max: 72 }))
        .build();

    pub static ref RSA2048_TLV: Arc<FieldTable> =
        fixed_variant("ImageTlvSignatureRsa2048", TlvType::Rsa2048Pss, 256)
            .alias("value", "signature")
            .alias("value", "rsa_2048_signature")
            .build();

    pub static ref RSA3072_TLV: Arc<FieldTable> =
        fixed_variant("ImageTlvSignatureRsa3072", TlvType::Rsa3072Pss, 384)
            .alias("value", "signature")
            .alias("value", "rsa_3072_signature")
            .build();

    /// The trailer appended to a signed image.
    pub static ref IMAGE_TLV_LIST: Arc<FieldTable> = TableBuilder::new("ImageTlvList")
        .field(FieldDescriptor::bits(1, "info", 32).alias("tlv_info").codec(Nested::new(&IMAGE_TLV_INFO)))
        .field(FieldDescriptor::bits(2, "slot_hash", HASH_TLV_BITS).codec(Nested::new(&SLOT_HASH_TLV)))
        .field(FieldDescriptor::bits(3, "key_hash", HASH_TLV_BITS).codec(Nested::new(&KEY_HASH_TLV)))
        .field(FieldDescriptor::new(4, "signature", FieldLength::Variable).codec(SignatureTlv))
        .build();
}

/// A TLV table whose type is pinned to `kind`.
fn variant(name: &'static str, kind: TlvType) -> TableBuilder {
    IMAGE_TLV
        .derive(name)
        .default_uint("type", u16::from(kind).into())
        .edit("type", |field| field.validators.push(Validator::MatchesDefault))
}

/// Like [`variant`], with a value of exactly `bytes` bytes.
fn fixed_variant(name: &'static str, kind: TlvType, bytes: usize) -> TableBuilder {
    variant(name, kind)
        .length("value", FieldLength::bytes(bytes))
        .default_uint("length", bytes as u64)
        .edit("length", |field| field.validators.push(Validator::MatchesDefault))
}

/// The table of a signature TLV, if `kind` is a supported signature.
pub fn signature_table(kind: TlvType) -> Option<&'static Arc<FieldTable>> {
    match kind {
        TlvType::Ecdsa256 => Some(&ECDSA256_TLV),
        TlvType::Rsa2048Pss => Some(&RSA2048_TLV),
        TlvType::Rsa3072Pss => Some(&RSA3072_TLV),
        _ => None,
    }
}

/// Decodes a signature TLV with the table matching its type.
struct SignatureTlv;

impl FieldCodec for SignatureTlv {
    fn name(&self) -> &'static str {
        "SignatureTlv"
    }

    fn decode(&self, ctx: &DecodeContext<'_>) -> Result<(usize, Value), CodecError> {
        let (generic, _) =
            codec::decode_window(&IMAGE_TLV, ctx.input, ctx.offset, ctx.limit, ctx.overflow)?;
        let raw = generic.get_uint("type")? as u16;

        let table = TlvType::try_from(raw)
            .ok()
            .and_then(signature_table)
            .ok_or_else(|| CodecError::Malformed {
                field: ctx.field.name,
                detail: format!("unsupported signature type {raw:#06x}"),
            })?;

        let (tlv, next) = codec::decode_window(table, ctx.input, ctx.offset, ctx.limit, ctx.overflow)?;
        if let Some(field) = table.field("value") {
            field.validate(&Value::Bits(tlv.get_bits("value")?.clone()))?;
        }

        Ok((next, Value::Container(Box::new(tlv))))
    }

    fn encode(&self, field: &FieldDescriptor, value: &Value) -> Result<BitBuffer, CodecError> {
        match value {
            Value::Container(tlv) => codec::encode(tlv),
            _ => Err(CodecError::WrongKind(field.name)),
        }
    }
}

/// Represents the type of a trailer TLV.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[non_exhaustive]
#[repr(u16)]
pub enum TlvType {
    KeyHash = 0x01,
    Sha256 = 0x10,
    Rsa2048Pss = 0x20,
    Ecdsa224 = 0x21,
    Ecdsa256 = 0x22,
    Rsa3072Pss = 0x23,
    Ed25519 = 0x24,
    EncRsa2048 = 0x30,
    EncKw = 0x31,
    EncEc256 = 0x32,
    EncX25519 = 0x33,
    Dependency = 0x40,
    SecurityCounter = 0x50,
}

/// Represents a single bit of [`ImageHeader::flags`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u32)]
pub enum ImageFlag {
    /// Position independent code. Not supported by the bootloader.
    Pic = 0x01,
    EncryptedAes128 = 0x04,
    EncryptedAes256 = 0x08,
    NonBootable = 0x10,
    RamLoad = 0x20,
}

impl ImageFlag {
    pub const ALL: [Self; 5] = [
        Self::Pic,
        Self::EncryptedAes128,
        Self::EncryptedAes256,
        Self::NonBootable,
        Self::RamLoad,
    ];
}

/// Represents the version of an image, rendered as
/// `major.minor.revision+build`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build_num: u32,
}

impl TryFrom<&Container> for ImageVersion {
    type Error = CodecError;

    fn try_from(version: &Container) -> Result<Self, Self::Error> {
        Ok(Self {
            major: version.get_uint("major")? as u8,
            minor: version.get_uint("minor")? as u8,
            revision: version.get_uint("revision")? as u16,
            build_num: version.get_uint("build_num")? as u32,
        })
    }
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}+{}", self.major, self.minor, self.revision, self.build_num)
    }
}

/// Represents the header in front of every image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ImageHeader {
    pub load_addr: u32,

    /// The size of the header in bytes, padding included.
    pub header_size: u16,

    pub protect_tlv_size: u16,

    /// The size of the image in bytes, not including the header.
    pub image_size: u32,

    pub flags: u32,
    pub version: ImageVersion,
}

impl ImageHeader {
    /// The size of the header on the wire.
    pub const SIZE: usize = 32;

    /// Decodes a header, rejecting a wrong magic number.
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::try_from(&codec::decode_bytes(&IMAGE_HEADER, bytes)?)
    }

    pub fn has_flag(&self, flag: ImageFlag) -> bool {
        self.flags & u32::from(flag) != 0
    }

    /// Every known flag set in the header.
    pub fn flag_set(&self) -> Vec<ImageFlag> {
        ImageFlag::ALL
            .into_iter()
            .filter(|&flag| self.has_flag(flag))
            .collect()
    }
}

impl TryFrom<&Container> for ImageHeader {
    type Error = CodecError;

    fn try_from(header: &Container) -> Result<Self, Self::Error> {
        Ok(Self {
            load_addr: header.get_uint("load_addr")? as u32,
            header_size: header.get_uint("header_size")? as u16,
            protect_tlv_size: header.get_uint("protect_tlv_size")? as u16,
            image_size: header.get_uint("image_size")? as u32,
            flags: header.get_uint("flags")? as u32,
            version: ImageVersion::try_from(header.get_container("image_version")?)?,
        })
    }
}

/// Represents the TLV trailer of a signed image.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ImageTrailer {
    /// Whether the info header marks the protected TLV area.
    pub protected: bool,

    /// The size of the TLV area in bytes, info header included.
    pub tlv_tot: u16,

    pub slot_hash: Vec<u8>,
    pub key_hash: Vec<u8>,
    pub signature_type: TlvType,
    pub signature: Vec<u8>,
}

impl ImageTrailer {
    /// Decodes a trailer and checks its info header against the TLVs read.
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        let input = BitBuffer::from_bytes(bytes);
        let (list, end) = codec::decode_window(&IMAGE_TLV_LIST, &input, 0, input.len(), Overflow::Reject)?;
        let trailer = Self::try_from(&list)?;

        if usize::from(trailer.tlv_tot) != end / 8 {
            return Err(CodecError::Malformed {
                field: "tlv_tot",
                detail: format!(
                    "the info header announces {} bytes, the TLVs span {}",
                    trailer.tlv_tot,
                    end / 8
                ),
            });
        }

        Ok(trailer)
    }
}

impl TryFrom<&Container> for ImageTrailer {
    type Error = CodecError;

    fn try_from(list: &Container) -> Result<Self, Self::Error> {
        let info = list.get_container("info")?;
        let protected = match info.get_uint("magic")? as u16 {
            IMAGE_TLV_INFO_MAGIC => false,
            IMAGE_TLV_PROT_INFO_MAGIC => true,
            other => {
                return Err(CodecError::Malformed {
                    field: "info",
                    detail: format!("unknown TLV info magic {other:#06x}"),
                });
            },
        };

        let signature = list.get_container("signature")?;
        let raw = signature.get_uint("type")? as u16;
        let signature_type = TlvType::try_from(raw).map_err(|_| CodecError::Malformed {
            field: "signature",
            detail: format!("unknown TLV type {raw:#06x}"),
        })?;

        Ok(Self {
            protected,
            tlv_tot: info.get_uint("tlv_tot")? as u16,
            slot_hash: list.get_container("slot_hash")?.get_bytes("slot_hash")?,
            key_hash: list.get_container("key_hash")?.get_bytes("key_hash")?,
            signature_type,
            signature: signature.get_bytes("signature")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::decode_bytes, field::ValidationError};

    const S3_HEADER: &str = "3DB8F39600000000000200000010000001000000010000000000000000000000";

    fn tlv(kind: u16, value: &[u8]) -> Vec<u8> {
        let mut out = kind.to_le_bytes().to_vec();
        out.extend((value.len() as u16).to_le_bytes());
        out.extend_from_slice(value);
        out
    }

    fn trailer(signature_type: u16, signature: &[u8]) -> Vec<u8> {
        let body = [
            tlv(0x10, &[0xaa; 32]),
            tlv(0x01, &[0xbb; 32]),
            tlv(signature_type, signature),
        ]
        .concat();

        let mut out = IMAGE_TLV_INFO_MAGIC.to_le_bytes().to_vec();
        out.extend(((body.len() + 4) as u16).to_le_bytes());
        out.extend(body);
        out
    }

    #[test]
    fn decodes_an_image_header() {
        let bytes = hex::decode(S3_HEADER).unwrap();
        let header = decode_bytes(&IMAGE_HEADER, &bytes).unwrap();

        assert_eq!(header.get_uint("magic").unwrap(), 0x96f3_b83d);
        assert_eq!(header.get_uint("load_addr").unwrap(), 0);
        assert_eq!(header.get_uint("hdr_size").unwrap(), 512);
        assert_eq!(header.get_uint("protect_tlv_size").unwrap(), 0);
        assert_eq!(header.get_uint("ih_img_size").unwrap(), 4096);
        assert_eq!(header.get_uint("flags").unwrap(), 1);
        assert_eq!(header.get_uint("pad_1").unwrap(), 0);

        let version = header.get_container("image_version").unwrap();
        assert_eq!(version.get_uint("iv_major").unwrap(), 1);
        assert_eq!(version.get_uint("minor").unwrap(), 0);
        assert_eq!(version.get_uint("revision").unwrap(), 0);
        assert_eq!(version.get_uint("build_number").unwrap(), 0);

        let typed = ImageHeader::parse(&bytes).unwrap();
        assert_eq!(typed.version.to_string(), "1.0.0+0");
        assert_eq!(typed.flag_set(), vec![ImageFlag::Pic]);
    }

    #[test]
    fn encodes_a_header_from_defaults() {
        let version = Container::new(&IMAGE_VERSION)
            .with_uint("major", 1)
            .unwrap()
            .with_uint("minor", 0)
            .unwrap()
            .with_uint("revision", 0)
            .unwrap()
            .with_uint("build_num", 0)
            .unwrap();
        let mut header = Container::new(&IMAGE_HEADER)
            .with_uint("load_addr", 0)
            .unwrap()
            .with_uint("header_size", 512)
            .unwrap()
            .with_uint("protect_tlv_size", 0)
            .unwrap()
            .with_uint("image_size", 4096)
            .unwrap()
            .with_uint("flags", u32::from(ImageFlag::Pic).into())
            .unwrap();
        header.set_container("image_version", version).unwrap();

        assert_eq!(header.to_hex().unwrap(), S3_HEADER);
    }

    #[test]
    fn rejects_a_foreign_magic() {
        let mut bytes = hex::decode(S3_HEADER).unwrap();
        bytes[0] = 0x3e;

        let err = ImageHeader::parse(&bytes).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Overflow {
                field: "magic",
                reason: ValidationError::DefaultMismatch { .. },
            }
        ));
    }

    #[test]
    fn decodes_a_trailer_with_an_ecdsa_signature() {
        let bytes = trailer(0x22, &[0xcc; 71]);
        let parsed = ImageTrailer::parse(&bytes).unwrap();

        assert!(!parsed.protected);
        assert_eq!(usize::from(parsed.tlv_tot), bytes.len());
        assert_eq!(parsed.slot_hash, vec![0xaa; 32]);
        assert_eq!(parsed.key_hash, vec![0xbb; 32]);
        assert_eq!(parsed.signature_type, TlvType::Ecdsa256);
        assert_eq!(parsed.signature, vec![0xcc; 71]);
    }

    #[test]
    fn dispatches_rsa_signatures_on_their_type() {
        let parsed = ImageTrailer::parse(&trailer(0x23, &[0x11; 384])).unwrap();
        assert_eq!(parsed.signature_type, TlvType::Rsa3072Pss);
        assert_eq!(parsed.signature.len(), 384);

        let parsed = ImageTrailer::parse(&trailer(0x20, &[0x22; 256])).unwrap();
        assert_eq!(parsed.signature_type, TlvType::Rsa2048Pss);
    }

    #[test]
    fn rejects_unsupported_and_malformed_signatures() {
        let err = ImageTrailer::parse(&trailer(0x24, &[0; 64])).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { field: "signature", .. }));

        let err = ImageTrailer::parse(&trailer(0x22, &[0; 64])).unwrap_err();
        assert!(matches!(err, CodecError::Overflow { field: "value", .. }));
    }

    #[test]
    fn swapped_hashes_are_detected() {
        let body = [tlv(0x01, &[0xbb; 32]), tlv(0x10, &[0xaa; 32]), tlv(0x22, &[0; 70])].concat();
        let mut bytes = IMAGE_TLV_INFO_MAGIC.to_le_bytes().to_vec();
        bytes.extend(((body.len() + 4) as u16).to_le_bytes());
        bytes.extend(body);

        let err = ImageTrailer::parse(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Overflow { field: "type", .. }));
    }

    #[test]
    fn wrong_tlv_totals_are_rejected() {
        let mut bytes = trailer(0x22, &[0; 72]);
        bytes[2] += 1;

        let err = ImageTrailer::parse(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { field: "tlv_tot", .. }));
    }

    #[test]
    fn variants_leave_the_generic_tlv_untouched() {
        assert_eq!(
            IMAGE_TLV.field("value").unwrap().length,
            FieldLength::SizedBy {
                field: "length",
                unit_bits: 8
            }
        );
        assert_eq!(KEY_HASH_TLV.static_bit_length(), Some(HASH_TLV_BITS));
        assert_eq!(RSA3072_TLV.static_bit_length(), Some((4 + 384) * 8));

        let key_hash = Container::new(&KEY_HASH_TLV).with_bytes("key_hash", &[0x5a; 32]).unwrap();
        assert!(key_hash.to_hex().unwrap().starts_with("010020005A5A"));
    }

    #[test]
    fn ecdsa_values_are_length_checked_on_write() {
        let mut tlv = Container::new(&ECDSA256_TLV);
        assert!(tlv.set_bytes("signature", &[0; 71]).is_ok());
        assert!(tlv.set_bytes("ecdsa_p_256_signature", &[0; 73]).is_err());
    }
}
