//! Implements functionality specific to HID++1.0.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::report::{
    FrameError,
    HEADER_LENGTH,
    LONG_REPORT_LENGTH,
    Report,
    ReportHeader,
    SHORT_REPORT_LENGTH,
};

/// Represents the header that every HID++1.0 message starts with.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MessageHeader {
    /// The index of the device involved in the communication.
    pub device_index: u8,

    /// The sub ID of the message.
    pub sub_id: u8,
}

/// Represents a HID++1.0 message.
///
/// HID++1.0 has no function/software ID byte, so the payload starts right
/// after the sub ID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Message {
    /// Represents a short HID++1.0 message with 4 bytes of payload.
    Short(MessageHeader, [u8; SHORT_REPORT_LENGTH - 3]),

    /// Represents a long HID++1.0 message with 17 bytes of payload.
    Long(MessageHeader, [u8; LONG_REPORT_LENGTH - 3]),
}

impl Message {
    /// Builds a register read request.
    pub fn get_register(device_index: u8, address: u8, params: [u8; 3]) -> Self {
        Self::Short(
            MessageHeader {
                device_index,
                sub_id: MessageType::GetRegister.into(),
            },
            [address, params[0], params[1], params[2]],
        )
    }

    /// Builds a register write request.
    pub fn set_register(device_index: u8, address: u8, value: [u8; 3]) -> Self {
        Self::Short(
            MessageHeader {
                device_index,
                sub_id: MessageType::SetRegister.into(),
            },
            [address, value[0], value[1], value[2]],
        )
    }

    /// Builds a long register read request.
    pub fn get_long_register(device_index: u8, address: u8) -> Self {
        Self::Short(
            MessageHeader {
                device_index,
                sub_id: MessageType::GetLongRegister.into(),
            },
            [address, 0x00, 0x00, 0x00],
        )
    }

    /// Extracts the header of the message.
    pub fn header(&self) -> MessageHeader {
        match *self {
            Message::Short(header, _) => header,
            Message::Long(header, _) => header,
        }
    }

    /// The register address, for messages of the register sub IDs.
    pub fn address(&self) -> u8 {
        self.extend_payload()[0]
    }

    /// Extracts the payload of the message and fits it into an array capable of
    /// containing the longest possible payload, filling the rest up with
    /// zeroes.
    pub fn extend_payload(&self) -> [u8; LONG_REPORT_LENGTH - 3] {
        match *self {
            Message::Short(_, payload) => {
                let mut data = [0; LONG_REPORT_LENGTH - 3];
                data[..SHORT_REPORT_LENGTH - 3].copy_from_slice(&payload);
                data
            },
            Message::Long(_, payload) => payload,
        }
    }
}

impl TryFrom<Report> for Message {
    type Error = FrameError;

    /// Reinterprets a report as HID++1.0. Very long reports do not exist in
    /// HID++1.0.
    fn try_from(report: Report) -> Result<Self, FrameError> {
        let header = report.header();
        let msg_header = MessageHeader {
            device_index: header.device_index,
            sub_id: header.feature_index,
        };

        match report {
            Report::Short(_, payload) => {
                let mut data = [0u8; SHORT_REPORT_LENGTH - 3];
                data[0] = header.function_and_sw_id;
                data[1..].copy_from_slice(&payload);
                Ok(Message::Short(msg_header, data))
            },
            Report::Long(_, payload) => {
                let mut data = [0u8; LONG_REPORT_LENGTH - 3];
                data[0] = header.function_and_sw_id;
                data[1..].copy_from_slice(&payload);
                Ok(Message::Long(msg_header, data))
            },
            Report::VeryLong(..) => Err(FrameError::UnknownReport(report.report_id())),
        }
    }
}

impl From<Message> for Report {
    fn from(msg: Message) -> Self {
        let header = msg.header();
        let payload = msg.extend_payload();
        let report_header = ReportHeader {
            device_index: header.device_index,
            feature_index: header.sub_id,
            function_and_sw_id: payload[0],
        };

        match msg {
            Message::Short(..) => {
                let mut data = [0u8; SHORT_REPORT_LENGTH - HEADER_LENGTH];
                data.copy_from_slice(&payload[1..SHORT_REPORT_LENGTH - 3]);
                Report::Short(report_header, data)
            },
            Message::Long(..) => {
                let mut data = [0u8; LONG_REPORT_LENGTH - HEADER_LENGTH];
                data.copy_from_slice(&payload[1..]);
                Report::Long(report_header, data)
            },
        }
    }
}

/// Represents a globally defined sub ID of a HID++1.0 message.
///
/// This enum only includes sub IDs that are defined globally across all
/// devices. Most devices (e.g. the Unifying Receiver) define additional sub IDs
/// specific to their functionality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum MessageType {
    /// Sent by a device when its battery level or charging status changes.
    BatteryStatus = 0x07,

    /// Sent by a device reporting its battery charge in percent.
    BatteryMileage = 0x0d,

    /// Sent by a receiver when a paired device disconnects.
    DeviceDisconnection = 0x40,

    /// Sent by a receiver when a paired device connects, or when the link to
    /// it could not be established.
    DeviceConnection = 0x41,

    /// Used to set a 3-byte register value. A sent message of this type is
    /// usually responded with a response message of the same type (or
    /// [`Self::Error`]).
    SetRegister = 0x80,

    /// Used to retrieve a 3-byte register value. A sent message of this type is
    /// usually responded with a response message of the same type (or
    /// [`Self::Error`]).
    GetRegister = 0x81,

    /// Used to set a 16-byte register value. A sent message of this type is
    /// usually responded with a response message of the same type (or
    /// [`Self::Error`]).
    SetLongRegister = 0x82,

    /// Used to retrieve a 16-byte register value. A sent message of this type
    /// is usually responded with a response message of the same type (or
    /// [`Self::Error`]).
    GetLongRegister = 0x83,

    /// Used to indicate an error response. The error code usually included in
    /// the message can be mapped using [`ErrorType::try_from`].
    Error = 0x8f,
}

impl MessageType {
    /// Whether the sub ID is one of the register access messages.
    pub fn is_register(sub_id: u8) -> bool {
        (0x80..=0x83).contains(&sub_id)
    }

    /// Whether the sub ID is a receiver notification.
    pub fn is_notification(sub_id: u8) -> bool {
        (0x40..=0x4f).contains(&sub_id)
    }

    /// Whether the sub ID is a battery notification sent by a device.
    pub fn is_battery_notification(sub_id: u8) -> bool {
        sub_id == u8::from(Self::BatteryStatus) || sub_id == u8::from(Self::BatteryMileage)
    }
}

/// Represents the type of an error a HID++1.0 device returns as part of a
/// message with the [`MessageType::Error`] type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorType {
    /// No error.
    Success = 0x00,

    /// The sub ID of a sent message is invalid.
    InvalidSubId = 0x01,

    /// The address included in a sent message is invalid.
    InvalidAddress = 0x02,

    /// The value included in a sent message is invalid.
    InvalidValue = 0x03,

    /// A connection request failed on the receiver's side.
    ConnectFail = 0x04,

    /// The receiver indicates that too many devices are connected to it.
    TooManyDevices = 0x05,

    /// The receiver indicates that something already exists.
    AlreadyExists = 0x06,

    /// The receiver is currently handling a downstream (to device) message and
    /// cannot process a second one.
    Busy = 0x07,

    /// Trying to send a message to a device (device index) where there is no
    /// device paired.
    UnknownDevice = 0x08,

    /// Returned when a command was sent to a device that is in disconnected
    /// mode. Such a device only reconnects once the user interacts with it.
    ResourceError = 0x09,

    /// A sent request is not available in the current context.
    RequestUnavailable = 0x0a,

    /// A request parameter has an unsupported value.
    InvalidParamValue = 0x0b,

    /// The PIN code a device was wrong.
    WrongPinCode = 0x0c,

    /// The wireless link to the device failed.
    Wireless = 0x0d,
}

/// A parsed [`MessageType::DeviceConnection`] notification.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceConnection {
    pub device_index: u8,

    /// The radio protocol the device connected with.
    pub protocol_type: u8,

    /// The device kind as encoded by the receiver (lower nibble of the info
    /// byte).
    pub device_type: u8,

    pub encrypted: bool,

    /// `false` if the receiver reports that the link could not be
    /// established.
    pub link_established: bool,

    /// The wireless product ID.
    pub wpid: u16,
}

impl DeviceConnection {
    /// Tries to read a connection notification.
    pub fn from_message(msg: &Message) -> Option<Self> {
        let header = msg.header();
        if header.sub_id != u8::from(MessageType::DeviceConnection) {
            return None;
        }

        let payload = msg.extend_payload();
        Some(Self {
            device_index: header.device_index,
            protocol_type: payload[0],
            device_type: payload[1] & 0x0f,
            encrypted: payload[1] & (1 << 5) != 0,
            link_established: payload[1] & (1 << 6) == 0,
            wpid: u16::from_le_bytes([payload[2], payload[3]]),
        })
    }
}
