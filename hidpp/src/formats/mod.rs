//! Containers for structures that travel inside HID++ transfers rather than
//! being HID++ messages themselves: signed firmware images, the bootloader's
//! key hierarchy and keyboard key bitmaps.

pub mod image;
pub mod key_hierarchy;
pub mod keyboard;

/// Marks the start of an image header.
pub const IMAGE_MAGIC: u32 = 0x96f3_b83d;

/// Marks the start of the unprotected TLV area of an image trailer.
pub const IMAGE_TLV_INFO_MAGIC: u16 = 0x6907;

/// Marks the start of the protected TLV area of an image trailer.
pub const IMAGE_TLV_PROT_INFO_MAGIC: u16 = 0x6908;

/// Marks a bootloader image communication structure.
pub const BOOT_IMAGE_COMMUNICATION_MAGIC: u32 = 0xb007_10ad;

/// Marks a key hierarchy header.
pub const KEY_HIERARCHY_MAGIC: u32 = 0x5afe_da7a;
