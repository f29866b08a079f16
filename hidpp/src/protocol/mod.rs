//! Implements the protocol-specific parts of HID++.

use crate::{
    channel::{ChannelError, HidppChannel},
    nibble::U4,
    protocol::error::{DeviceErrorKind, ErrorFamily},
};

pub mod error;
pub mod v10;
pub mod v20;

/// Represents the protocol version a device supports.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ProtocolVersion {
    /// The older HID++1.0 protocol. Mostly used for receivers.
    V10,

    /// All newer protocols starting from HID+2.0.
    ///
    /// Traditionally, the version was split into a major and a minor version,
    /// defining the concrete protocol version. These two values were later
    /// redefined to serve the purpose of indicating which host software to
    /// target.
    V20 {
        /// The protocol number is a field that hints the host software if it
        /// should support the device.
        ///
        /// `protocol_num = 2` : Intended target SW is Logitech SetPoint\
        /// `protocol_num = 3` : Intended OEM SW described in `target_sw` field\
        /// `protocol_num = 4` : Intended target SW described in `target_sw`
        /// field
        protocol_num: u8,

        /// When `protocol_num >= 3` this field further hints at which software
        /// should support the device. Otherwise the value is zero.
        target_sw: u8,
    },
}

/// The data byte sent along with the version ping and expected back.
const PING_DATA: u8 = 0x5a;

/// Tries to determine the protocol version of a specific device.
///
/// Returns `Ok(None)` if no device was found for the given device index.
pub async fn determine_version(
    chan: &HidppChannel,
    device_index: u8,
) -> Result<Option<ProtocolVersion>, ChannelError> {
    // To determine the protocol version, we send a HID++2.0 ping message
    // (feature index 0x00, function 0x01).
    // Devices supporting protocol >=2.0 respond with the protocol version.
    // Devices only supporting protocol 1.0 respond with an error message
    // indicating 0x00 is no valid sub ID, which pins them to version 1.0.
    let msg = v20::Message::new(
        v20::MessageHeader {
            device_index,
            feature_index: 0x00,
            function_id: U4::from_lo(0x1),
            software_id: chan.get_sw_id(),
        },
        &[0x00, 0x00, PING_DATA],
    )?;

    match chan.request(msg.into()).await {
        Ok(response) => {
            let payload = response.payload();
            Ok(Some(ProtocolVersion::V20 {
                protocol_num: payload.first().copied().unwrap_or_default(),
                target_sw: payload.get(1).copied().unwrap_or_default(),
            }))
        },
        Err(ChannelError::Device(err))
            if err.family == ErrorFamily::Hidpp10 && err.kind == DeviceErrorKind::InvalidSubId =>
        {
            Ok(Some(ProtocolVersion::V10))
        },
        Err(ChannelError::Device(err)) => {
            tracing::debug!(device_index, error = %err, "no device answered the version ping");
            Ok(None)
        },
        Err(other) => Err(other),
    }
}
