//! The 128-key bitmap reported by keyboards, one bit per key.
//!
//! Keys are listed in HID usage order starting with the modifiers. On the
//! wire, the first key of every group of eight sits in the least significant
//! bit of its byte, so the bit order of every byte is mirrored before
//! decoding and again after encoding.

use std::sync::Arc;

use lazy_static::lazy_static;

use crate::{
    bits::BitBuffer,
    codec::{self, CodecError},
    container::{Container, FieldTable, TableBuilder},
    field::FieldDescriptor,
};

/// The size of the bitmap on the wire.
pub const BITMAP_SIZE: usize = 16;

const KEYS: [&str; BITMAP_SIZE * 8] = [
    "keyboard_left_control",
    "keyboard_left_shift",
    "keyboard_left_alt",
    "keyboard_left_gui",
    "keyboard_right_control",
    "keyboard_right_shift",
    "keyboard_right_alt",
    "keyboard_right_gui",
    "keyboard_a",
    "keyboard_b",
    "keyboard_c",
    "keyboard_d",
    "keyboard_e",
    "keyboard_f",
    "keyboard_g",
    "keyboard_h",
    "keyboard_i",
    "keyboard_j",
    "keyboard_k",
    "keyboard_l",
    "keyboard_m",
    "keyboard_n",
    "keyboard_o",
    "keyboard_p",
    "keyboard_q",
    "keyboard_r",
    "keyboard_s",
    "keyboard_t",
    "keyboard_u",
    "keyboard_v",
    "keyboard_w",
    "keyboard_x",
    "keyboard_y",
    "keyboard_z",
    "keyboard_1",
    "keyboard_2",
    "keyboard_3",
    "keyboard_4",
    "keyboard_5",
    "keyboard_6",
    "keyboard_7",
    "keyboard_8",
    "keyboard_9",
    "keyboard_0",
    "keyboard_return_enter",
    "keyboard_escape",
    "keyboard_delete_backspace",
    "keyboard_tab",
    "keyboard_space_bar",
    "keyboard_dash_and_underscore",
    "keyboard_equal_and_plus",
    "keyboard_left_bracket_and_brace",
    "keyboard_right_bracket_and_brace",
    "keyboard_backslash_and_pipe",
    "keyboard_non_us_and_tilde",
    "keyboard_semicolon_and_colon",
    "keyboard_apostrophe_and_quotation_mark",
    "keyboard_grave_accent_and_tilde",
    "keyboard_comma_and_less",
    "keyboard_period_and_more",
    "keyboard_forward_slash_and_question_mark",
    "keyboard_caps_lock",
    "keyboard_f1",
    "keyboard_f2",
    "keyboard_f3",
    "keyboard_f4",
    "keyboard_f5",
    "keyboard_f6",
    "keyboard_f7",
    "keyboard_f8",
    "keyboard_f9",
    "keyboard_f10",
    "keyboard_f11",
    "keyboard_f12",
    "keyboard_print_screen",
    "keyboard_scroll_lock",
    "keyboard_pause",
    "keyboard_insert",
    "keyboard_home",
    "keyboard_page_up",
    "keyboard_delete_forward",
    "keyboard_end",
    "keyboard_page_down",
    "keyboard_right_arrow",
    "keyboard_left_arrow",
    "keyboard_down_arrow",
    "keyboard_up_arrow",
    "keypad_num_lock_and_clear",
    "keypad_forward_slash",
    "keypad_asterisk",
    "keypad_minus",
    "keypad_plus",
    "keypad_enter",
    "keypad_1_and_end",
    "keypad_2_and_down_arrow",
    "keypad_3_and_page_dn",
    "keypad_4_and_left_arrow",
    "keypad_5",
    "keypad_6_and_right_arrow",
    "keypad_7_and_home",
    "keypad_8_and_up_arrow",
    "keypad_9_and_page_up",
    "keypad_0_and_insert",
    "keypad_comma_and_delete",
    "keyboard_non_us_backslash_and_pipe",
    "keyboard_menu",
    "keyboard_power",
    "keypad_equal",
    "keyboard_f13",
    "keyboard_f14",
    "keyboard_f15",
    "keyboard_f16",
    "keyboard_f17",
    "keyboard_f18",
    "keyboard_f19",
    "keyboard_f20",
    "keyboard_f21",
    "keyboard_f22",
    "keyboard_f23",
    "keyboard_f24",
    "keyboard_international1",
    "keyboard_international2",
    "keyboard_international3",
    "keyboard_international4",
    "keyboard_international5",
    "keyboard_lang1",
    "keyboard_lang2",
    "keyboard_lang3",
];

lazy_static! {
    /// One released-by-default bit per key, in logical (mirrored) order.
    pub static ref KEY_BITMAP: Arc<FieldTable> = KEYS
        .iter()
        .zip(0u16..)
        .fold(TableBuilder::new("HidKeyboardBitmap"), |table, (&name, id)| {
            table.field(FieldDescriptor::bits(id, name, 1).default_uint(0))
        })
        .alias("keypad_num_lock_and_clear", "keyboard_locking_num_lock")
        .alias("keyboard_menu", "keyboard_application")
        .build();
}

/// Decodes a bitmap as read from the wire.
pub fn decode(bytes: &[u8]) -> Result<Container, CodecError> {
    codec::decode(&KEY_BITMAP, &mirrored(bytes))
}

/// Encodes a bitmap into its wire image.
pub fn encode(keys: &Container) -> Result<Vec<u8>, CodecError> {
    let wire = codec::encode(keys)?
        .reverse_bits_per_byte()
        .map_err(|source| CodecError::Bits {
            field: KEY_BITMAP.name(),
            source,
        })?;
    Ok(wire.into_bytes())
}

/// The names of all pressed keys, in bitmap order.
pub fn pressed(keys: &Container) -> Result<Vec<&'static str>, CodecError> {
    let mut names = Vec::new();
    for (field, _) in keys.fields() {
        if keys.get_bool(field.name)? {
            names.push(field.name);
        }
    }
    Ok(names)
}

/// The logical positions of all pressed keys in a wire bitmap.
pub fn pressed_positions(bytes: &[u8]) -> Vec<usize> {
    mirrored(bytes).ones().collect()
}

/// Wire bytes carry the first key of each byte in the least significant bit.
fn mirrored(bytes: &[u8]) -> BitBuffer {
    BitBuffer::from(bytes.iter().map(|byte| byte.reverse_bits()).collect::<Vec<u8>>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(first: u8) -> [u8; BITMAP_SIZE] {
        let mut bytes = [0; BITMAP_SIZE];
        bytes[0] = first;
        bytes
    }

    #[test]
    fn mirrors_every_byte() {
        assert_eq!(pressed_positions(&bitmap(0x81)), vec![0, 7]);
        assert_eq!(pressed_positions(&bitmap(0x02)), vec![1]);

        let keys = decode(&bitmap(0x81)).unwrap();
        assert_eq!(pressed(&keys).unwrap(), vec!["keyboard_left_control", "keyboard_right_gui"]);
    }

    #[test]
    fn the_least_significant_bit_is_the_first_key() {
        let keys = decode(&bitmap(0x01)).unwrap();
        assert!(keys.get_bool("keyboard_left_control").unwrap());
        assert!(!keys.get_bool("keyboard_right_gui").unwrap());

        let mut bytes = [0; BITMAP_SIZE];
        bytes[1] = 0x01;
        assert_eq!(pressed(&decode(&bytes).unwrap()).unwrap(), vec!["keyboard_a"]);

        bytes = [0; BITMAP_SIZE];
        bytes[15] = 0x80;
        assert_eq!(pressed(&decode(&bytes).unwrap()).unwrap(), vec!["keyboard_lang3"]);
    }

    #[test]
    fn encoding_mirrors_back() {
        let mut keys = Container::new(&KEY_BITMAP);
        keys.set_bool("keyboard_a", true).unwrap();
        keys.set_bool("keyboard_left_shift", true).unwrap();

        let mut expected = [0; BITMAP_SIZE];
        expected[0] = 0x02;
        expected[1] = 0x01;
        assert_eq!(encode(&keys).unwrap(), expected);
    }

    #[test]
    fn renamed_keys_are_pure_aliases() {
        let mut keys = Container::new(&KEY_BITMAP);
        keys.set_bool("keyboard_locking_num_lock", true).unwrap();
        assert!(keys.get_bool("keypad_num_lock_and_clear").unwrap());

        keys.set_bool("keyboard_application", true).unwrap();
        assert!(keys.get_bool("keyboard_menu").unwrap());

        assert_eq!(KEY_BITMAP.fields().len(), 128);
        assert_eq!(KEY_BITMAP.static_bit_length(), Some(128));
        assert_eq!(
            pressed(&keys).unwrap(),
            vec!["keypad_num_lock_and_clear", "keyboard_menu"]
        );
    }
}
