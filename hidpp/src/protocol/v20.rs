//! Implements functionality specific to HID++2.0.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    nibble::{self, U4},
    report::{Report, ReportHeader, ReportKind, VERY_LONG_REPORT_LENGTH, HEADER_LENGTH},
};

/// The feature index that marks a HID++2.0 error report.
pub const ERROR_FEATURE_INDEX: u8 = 0xff;

/// Represents the header that every HID++2.0 message starts with.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MessageHeader {
    /// The index of the device involved in the communication.
    pub device_index: u8,

    /// The index of the feature the message belongs to.
    ///
    /// This is not the same as the feature ID, but the index returned from a
    /// feature enumeration request.
    pub feature_index: u8,

    /// The ID of the function involved in the communication.
    pub function_id: U4,

    /// The ID of the software communicating with the device.
    ///
    /// `0` is reserved for unsolicited events.
    pub software_id: U4,
}

impl From<ReportHeader> for MessageHeader {
    fn from(header: ReportHeader) -> Self {
        Self {
            device_index: header.device_index,
            feature_index: header.feature_index,
            function_id: U4::from_hi(header.function_and_sw_id),
            software_id: U4::from_lo(header.function_and_sw_id),
        }
    }
}

impl From<MessageHeader> for ReportHeader {
    fn from(header: MessageHeader) -> Self {
        Self {
            device_index: header.device_index,
            feature_index: header.feature_index,
            function_and_sw_id: nibble::combine(header.function_id, header.software_id),
        }
    }
}

/// Represents a HID++2.0 message: a [`Report`] with its fn/sw byte split
/// into nibbles.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Message {
    report: Report,
}

impl Message {
    /// Builds a message in the smallest report format fitting the payload.
    pub fn new(header: MessageHeader, payload: &[u8]) -> Result<Self, crate::report::FrameError> {
        Report::fitting(header.into(), payload).map(|report| Self { report })
    }

    /// Builds a message in a specific report format.
    pub fn with_kind(
        kind: ReportKind,
        header: MessageHeader,
        payload: &[u8],
    ) -> Result<Self, crate::report::FrameError> {
        Report::new(kind, header.into(), payload).map(|report| Self { report })
    }

    /// Extracts the header of the message.
    pub fn header(&self) -> MessageHeader {
        self.report.header().into()
    }

    pub fn payload(&self) -> &[u8] {
        self.report.payload()
    }

    /// Extracts the payload of the message and fits it into an array capable of
    /// containing the longest possible payload, filling the rest up with
    /// zeroes.
    pub fn extend_payload(&self) -> [u8; VERY_LONG_REPORT_LENGTH - HEADER_LENGTH] {
        self.report.extend_payload()
    }

    /// Whether this is an error report.
    pub fn is_error(&self) -> bool {
        self.report.header().feature_index == ERROR_FEATURE_INDEX
    }

    /// Whether this is an unsolicited event.
    pub fn is_event(&self) -> bool {
        !self.is_error() && self.header().software_id.get() == 0
    }

    pub fn report(&self) -> Report {
        self.report
    }
}

impl From<Report> for Message {
    fn from(report: Report) -> Self {
        Self { report }
    }
}

impl From<Message> for Report {
    fn from(msg: Message) -> Self {
        msg.report
    }
}

/// Represents the type of an error a HID++2.0 device returns in a report
/// with the feature index [`ERROR_FEATURE_INDEX`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorType {
    NoError = 0x00,

    /// An error not covered by any other code.
    Unknown = 0x01,

    /// A request argument is invalid.
    InvalidArgument = 0x02,

    /// A request argument is outside the accepted range.
    OutOfRange = 0x03,

    HardwareError = 0x04,

    /// The request is not allowed in the current state of the device.
    NotAllowed = 0x05,

    /// The feature index of the request does not exist.
    InvalidFeatureIndex = 0x06,

    /// The function ID of the request is not defined by the feature.
    InvalidFunctionId = 0x07,

    /// The device is busy and cannot answer right now.
    Busy = 0x08,

    Unsupported = 0x09,

    /// The request does not fit into the memory available to the feature.
    OutOfMemory = 0x0a,

    /// An address in the request does not exist.
    InvalidAddress = 0x0b,
}
