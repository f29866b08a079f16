//! Raw HID++ report framing.
//!
//! HID++ uses three fixed-size report formats sharing a 4-byte header:
//!
//! - short (report ID `0x10`): 7 bytes in total
//! - long (report ID `0x11`): 20 bytes in total
//! - very long (report ID `0x12`): 64 bytes in total
//!
//! VLP transfers use the separate report IDs `0x13` and `0x14` with a variable
//! length, see [`crate::vlp`].

use thiserror::Error;

use crate::vlp::VlpFrame;

pub const SHORT_REPORT_ID: u8 = 0x10;
pub const SHORT_REPORT_LENGTH: usize = 7;

pub const LONG_REPORT_ID: u8 = 0x11;
pub const LONG_REPORT_LENGTH: usize = 20;

pub const VERY_LONG_REPORT_ID: u8 = 0x12;
pub const VERY_LONG_REPORT_LENGTH: usize = 64;

pub const VLP_NORMAL_REPORT_ID: u8 = 0x13;
pub const VLP_EXTENDED_REPORT_ID: u8 = 0x14;

/// The length of the header preceding the payload of every HID++ report:
/// report ID, device index, feature index (or sub ID) and the function/software
/// ID byte.
pub const HEADER_LENGTH: usize = 4;

/// The largest report this crate reads or writes.
pub const MAX_REPORT_LENGTH: usize = 4096;

/// The device index addressing a receiver itself rather than a device behind
/// it.
pub const RECEIVER_DEVICE_INDEX: u8 = 0xff;

/// One of the three fixed HID++ report formats.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ReportKind {
    Short,
    Long,
    VeryLong,
}

impl ReportKind {
    /// Maps a report ID to its format.
    pub fn from_id(report_id: u8) -> Option<Self> {
        match report_id {
            SHORT_REPORT_ID => Some(Self::Short),
            LONG_REPORT_ID => Some(Self::Long),
            VERY_LONG_REPORT_ID => Some(Self::VeryLong),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Self::Short => SHORT_REPORT_ID,
            Self::Long => LONG_REPORT_ID,
            Self::VeryLong => VERY_LONG_REPORT_ID,
        }
    }

    /// The total length of the report, including the header.
    pub fn length(self) -> usize {
        match self {
            Self::Short => SHORT_REPORT_LENGTH,
            Self::Long => LONG_REPORT_LENGTH,
            Self::VeryLong => VERY_LONG_REPORT_LENGTH,
        }
    }

    pub fn payload_length(self) -> usize {
        self.length() - HEADER_LENGTH
    }

    /// The smallest format whose payload fits `len` bytes.
    pub fn fitting(len: usize) -> Option<Self> {
        [Self::Short, Self::Long, Self::VeryLong]
            .into_iter()
            .find(|kind| kind.payload_length() >= len)
    }
}

/// Represents the header that starts every HID++ report after its report ID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ReportHeader {
    /// The index of the device involved in the communication.
    pub device_index: u8,

    /// The index of the feature the message belongs to (HID++2.0) or the sub
    /// ID of the message (HID++1.0).
    pub feature_index: u8,

    /// The function (leftmost 4 bits) and software (rightmost 4 bits) IDs in
    /// HID++2.0, the register address in HID++1.0.
    pub function_and_sw_id: u8,
}

/// Represents a HID++ report consisting of a header and payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Report {
    /// A short report with 3 bytes of payload.
    Short(ReportHeader, [u8; SHORT_REPORT_LENGTH - HEADER_LENGTH]),

    /// A long report with 16 bytes of payload.
    Long(ReportHeader, [u8; LONG_REPORT_LENGTH - HEADER_LENGTH]),

    /// A very long report with 60 bytes of payload.
    VeryLong(ReportHeader, [u8; VERY_LONG_REPORT_LENGTH - HEADER_LENGTH]),
}

impl Report {
    /// Builds a report of the given format, zero-padding the payload.
    pub fn new(kind: ReportKind, header: ReportHeader, payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() > kind.payload_length() {
            return Err(FrameError::PayloadTooLong {
                kind,
                actual: payload.len(),
            });
        }

        Ok(match kind {
            ReportKind::Short => Self::Short(header, padded(payload)),
            ReportKind::Long => Self::Long(header, padded(payload)),
            ReportKind::VeryLong => Self::VeryLong(header, padded(payload)),
        })
    }

    /// Builds the smallest report fitting the payload.
    pub fn fitting(header: ReportHeader, payload: &[u8]) -> Result<Self, FrameError> {
        let kind = ReportKind::fitting(payload.len()).ok_or(FrameError::PayloadTooLong {
            kind: ReportKind::VeryLong,
            actual: payload.len(),
        })?;
        Self::new(kind, header, payload)
    }

    /// Tries to read a HID++ report from raw data.
    ///
    /// The data must start with the report ID and match the format's length
    /// exactly.
    pub fn read_raw(data: &[u8]) -> Result<Self, FrameError> {
        let Some(&report_id) = data.first() else {
            return Err(FrameError::Empty);
        };
        let kind = ReportKind::from_id(report_id).ok_or(FrameError::UnknownReport(report_id))?;

        if data.len() != kind.length() {
            return Err(FrameError::BadLength {
                report_id,
                expected: kind.length(),
                actual: data.len(),
            });
        }

        let header = ReportHeader {
            device_index: data[1],
            feature_index: data[2],
            function_and_sw_id: data[3],
        };
        Self::new(kind, header, &data[HEADER_LENGTH..])
    }

    /// Writes the report in its raw byte form into a buffer.
    ///
    /// Returns the amount of written bytes, or `None` if the buffer is too
    /// small.
    pub fn write_raw(&self, buf: &mut [u8]) -> Option<usize> {
        let len = self.kind().length();
        let out = buf.get_mut(..len)?;

        let header = self.header();
        out[0] = self.kind().id();
        out[1] = header.device_index;
        out[2] = header.feature_index;
        out[3] = header.function_and_sw_id;
        out[HEADER_LENGTH..].copy_from_slice(self.payload());

        Some(len)
    }

    /// The raw bytes of the report, starting with the report ID.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.kind().length()];
        let _ = self.write_raw(&mut buf);
        buf
    }

    pub fn kind(&self) -> ReportKind {
        match self {
            Self::Short(..) => ReportKind::Short,
            Self::Long(..) => ReportKind::Long,
            Self::VeryLong(..) => ReportKind::VeryLong,
        }
    }

    pub fn report_id(&self) -> u8 {
        self.kind().id()
    }

    /// Extracts the header of the report.
    pub fn header(&self) -> ReportHeader {
        match *self {
            Self::Short(header, _) | Self::Long(header, _) | Self::VeryLong(header, _) => header,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Short(_, payload) => payload,
            Self::Long(_, payload) => payload,
            Self::VeryLong(_, payload) => payload,
        }
    }

    /// Extracts the payload and fits it into an array capable of containing
    /// the longest possible payload, filling the rest up with zeroes.
    pub fn extend_payload(&self) -> [u8; VERY_LONG_REPORT_LENGTH - HEADER_LENGTH] {
        padded(self.payload())
    }
}

fn padded<const N: usize>(payload: &[u8]) -> [u8; N] {
    let mut data = [0u8; N];
    let len = payload.len().min(N);
    data[..len].copy_from_slice(&payload[..len]);
    data
}

/// Any inbound frame, classified by its report ID.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Frame {
    /// A short, long or very long HID++ report.
    Hidpp(Report),

    /// A VLP frame.
    Vlp(VlpFrame),

    /// A plain HID input report whose ID was declared as HID traffic.
    Hid { report_id: u8, data: Vec<u8> },
}

impl Frame {
    /// Classifies raw inbound data.
    ///
    /// Report IDs that are neither HID++ nor VLP are accepted as
    /// [`Frame::Hid`] only if they are listed in `hid_report_ids`.
    pub fn parse(data: &[u8], hid_report_ids: &[u8]) -> Result<Self, FrameError> {
        let Some(&report_id) = data.first() else {
            return Err(FrameError::Empty);
        };

        match report_id {
            SHORT_REPORT_ID | LONG_REPORT_ID | VERY_LONG_REPORT_ID => {
                Report::read_raw(data).map(Self::Hidpp)
            },
            VLP_NORMAL_REPORT_ID | VLP_EXTENDED_REPORT_ID => VlpFrame::read_raw(data).map(Self::Vlp),
            id if hid_report_ids.contains(&id) => Ok(Self::Hid {
                report_id,
                data: data[1..].to_vec(),
            }),
            id => Err(FrameError::UnknownReport(id)),
        }
    }

    /// The raw bytes of the frame, starting with the report ID.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Hidpp(report) => report.to_bytes(),
            Self::Vlp(frame) => frame.to_bytes(),
            Self::Hid { report_id, data } => {
                let mut out = Vec::with_capacity(data.len() + 1);
                out.push(*report_id);
                out.extend_from_slice(data);
                out
            },
        }
    }
}

/// Represents an error that occurred while framing or unframing a report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("the frame is empty")]
    Empty,

    /// The report ID is neither HID++, VLP nor declared HID traffic.
    #[error("unknown report ID {0:#04x}")]
    UnknownReport(u8),

    #[error("report {report_id:#04x} must be {expected} bytes long, got {actual}")]
    BadLength {
        report_id: u8,
        expected: usize,
        actual: usize,
    },

    #[error("a payload of {actual} bytes does not fit into a {kind:?} report")]
    PayloadTooLong { kind: ReportKind, actual: usize },
}
