//! Fragmented transfers over VLP reports.
//!
//! A VLP frame looks like this on the wire:
//!
//! ```text
//! <report id><device index><feature index><fn/sw><flags|seqn><content...>
//! ```
//!
//! The flags nibble carries `BEGIN` (bit 7), `END` (bit 6) and `ACK` (bit 5);
//! bit 4 is reserved and bits 3..0 hold the sequence number. A frame with
//! neither `BEGIN` nor `END` continues the transfer opened by the last
//! `BEGIN`. A transfer spans at most 16 frames, one per sequence number.
//!
//! The sending side splits a payload with [`fragment`]; the receiving side
//! feeds every data frame into a [`Reassembler`], which validates the
//! sequence and hands out the complete payload once `END` arrives.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::{
    nibble::U4,
    report::{FrameError, HEADER_LENGTH, MAX_REPORT_LENGTH, ReportHeader, VLP_EXTENDED_REPORT_ID, VLP_NORMAL_REPORT_ID},
};

/// The length of a VLP frame without content.
pub const VLP_HEADER_LENGTH: usize = HEADER_LENGTH + 1;

/// The largest amount of frames a single transfer may use.
pub const MAX_FRAMES: usize = 16;

/// Content bytes per frame unless configured otherwise: a 64-byte frame minus
/// its header.
pub const DEFAULT_FRAGMENT_PAYLOAD: usize = 64 - VLP_HEADER_LENGTH;

const FLAG_BEGIN: u8 = 1 << 7;
const FLAG_END: u8 = 1 << 6;
const FLAG_ACK: u8 = 1 << 5;

/// The control flags of a VLP frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct VlpFlags {
    /// Opens a transfer, discarding any partial one for the same feature.
    pub begin: bool,

    /// Closes a transfer.
    pub end: bool,

    /// Requests an acknowledgement before the next frame is sent. On a frame
    /// without content, marks the frame as the acknowledgement itself.
    pub ack: bool,
}

impl VlpFlags {
    /// Whether the frame continues an open transfer.
    pub fn is_continuation(self) -> bool {
        !self.begin && !self.end
    }

    fn from_raw(raw: u8) -> Self {
        Self {
            begin: raw & FLAG_BEGIN != 0,
            end: raw & FLAG_END != 0,
            ack: raw & FLAG_ACK != 0,
        }
    }

    fn to_raw(self) -> u8 {
        let mut raw = 0;
        if self.begin {
            raw |= FLAG_BEGIN;
        }
        if self.end {
            raw |= FLAG_END;
        }
        if self.ack {
            raw |= FLAG_ACK;
        }
        raw
    }
}

/// A single VLP frame.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct VlpFrame {
    /// [`VLP_NORMAL_REPORT_ID`] or [`VLP_EXTENDED_REPORT_ID`].
    pub report_id: u8,
    pub header: ReportHeader,
    pub flags: VlpFlags,
    pub seqn: U4,
    pub content: Vec<u8>,
}

impl VlpFrame {
    /// Tries to read a VLP frame from raw data.
    pub fn read_raw(data: &[u8]) -> Result<Self, FrameError> {
        let Some(&report_id) = data.first() else {
            return Err(FrameError::Empty);
        };
        if report_id != VLP_NORMAL_REPORT_ID && report_id != VLP_EXTENDED_REPORT_ID {
            return Err(FrameError::UnknownReport(report_id));
        }
        if data.len() < VLP_HEADER_LENGTH || data.len() > MAX_REPORT_LENGTH {
            return Err(FrameError::BadLength {
                report_id,
                expected: VLP_HEADER_LENGTH,
                actual: data.len(),
            });
        }

        Ok(Self {
            report_id,
            header: ReportHeader {
                device_index: data[1],
                feature_index: data[2],
                function_and_sw_id: data[3],
            },
            flags: VlpFlags::from_raw(data[4]),
            seqn: U4::from_lo(data[4]),
            content: data[VLP_HEADER_LENGTH..].to_vec(),
        })
    }

    /// The raw bytes of the frame, starting with the report ID.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(VLP_HEADER_LENGTH + self.content.len());
        out.push(self.report_id);
        out.push(self.header.device_index);
        out.push(self.header.feature_index);
        out.push(self.header.function_and_sw_id);
        out.push(self.flags.to_raw() | self.seqn.to_lo());
        out.extend_from_slice(&self.content);
        out
    }

    pub fn function_id(&self) -> U4 {
        U4::from_hi(self.header.function_and_sw_id)
    }

    pub fn software_id(&self) -> U4 {
        U4::from_lo(self.header.function_and_sw_id)
    }

    /// Whether this frame acknowledges a frame rather than carrying data.
    pub fn is_ack(&self) -> bool {
        self.flags.ack && self.flags.is_continuation() && self.content.is_empty()
    }

    /// Builds the acknowledgement for this frame.
    pub fn ack(&self) -> Self {
        Self {
            report_id: self.report_id,
            header: self.header,
            flags: VlpFlags {
                begin: false,
                end: false,
                ack: true,
            },
            seqn: self.seqn,
            content: Vec::new(),
        }
    }
}

/// A complete payload carried by one or more VLP frames.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct VlpMessage {
    pub report_id: u8,
    pub header: ReportHeader,
    pub payload: Vec<u8>,
}

impl VlpMessage {
    pub fn function_id(&self) -> U4 {
        U4::from_hi(self.header.function_and_sw_id)
    }

    pub fn software_id(&self) -> U4 {
        U4::from_lo(self.header.function_and_sw_id)
    }
}

/// Splits a payload into the frames of a single transfer.
///
/// Every frame carries at most `fragment_payload` content bytes. An empty
/// payload still produces one frame with both `BEGIN` and `END` set. With
/// `ack` set, every frame requests an acknowledgement.
pub fn fragment(
    report_id: u8,
    header: ReportHeader,
    payload: &[u8],
    fragment_payload: usize,
    ack: bool,
) -> Result<Vec<VlpFrame>, VlpError> {
    if fragment_payload == 0 {
        return Err(VlpError::InvalidArgument("the fragment payload size must not be zero"));
    }

    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(fragment_payload).collect()
    };
    if chunks.len() > MAX_FRAMES {
        return Err(VlpError::OutOfMemory {
            frames: chunks.len(),
        });
    }

    let last = chunks.len() - 1;
    let mut seqn = U4::from_lo(0);
    let mut frames = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.into_iter().enumerate() {
        frames.push(VlpFrame {
            report_id,
            header,
            flags: VlpFlags {
                begin: i == 0,
                end: i == last,
                ack,
            },
            seqn,
            content: chunk.to_vec(),
        });
        seqn = seqn.wrapping_next();
    }

    Ok(frames)
}

/// What accepting a frame resulted in.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Progress {
    /// The frame was stored, more frames are expected.
    Pending,

    /// The frame closed the transfer.
    Complete(VlpMessage),
}

/// The state of a transfer in progress.
#[derive(Debug)]
struct Slot {
    report_id: u8,
    header: ReportHeader,
    last_seqn: U4,
    frames: usize,
    payload: Vec<u8>,
    updated: Instant,
}

/// Reassembles inbound transfers, one slot per device and feature index.
#[derive(Debug)]
pub struct Reassembler {
    slots: HashMap<(u8, u8), Slot>,
    timeout: Duration,
}

impl Reassembler {
    /// Creates a reassembler discarding slots idle for longer than `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: HashMap::new(),
            timeout,
        }
    }

    /// Feeds a data frame into its slot.
    ///
    /// Any error discards the slot the frame belongs to, so a failed transfer
    /// never leaves partial state behind.
    pub fn accept(&mut self, frame: &VlpFrame, now: Instant) -> Result<Progress, VlpError> {
        self.expire(now);

        let key = (frame.header.device_index, frame.header.feature_index);

        if frame.flags.begin {
            if self.slots.remove(&key).is_some() {
                tracing::debug!(
                    device_index = key.0,
                    feature_index = key.1,
                    "new transfer discards a partial one"
                );
            }

            if frame.flags.end {
                return Ok(Progress::Complete(VlpMessage {
                    report_id: frame.report_id,
                    header: frame.header,
                    payload: frame.content.clone(),
                }));
            }

            self.slots.insert(key, Slot {
                report_id: frame.report_id,
                header: frame.header,
                last_seqn: frame.seqn,
                frames: 1,
                payload: frame.content.clone(),
                updated: now,
            });
            tracing::debug!(device_index = key.0, feature_index = key.1, "transfer opened");
            return Ok(Progress::Pending);
        }

        let Some(slot) = self.slots.get_mut(&key) else {
            return Err(VlpError::TransactionError {
                device_index: key.0,
                feature_index: key.1,
            });
        };

        if slot.header.function_and_sw_id != frame.header.function_and_sw_id {
            self.slots.remove(&key);
            return Err(VlpError::TransactionError {
                device_index: key.0,
                feature_index: key.1,
            });
        }

        let expected = slot.last_seqn.wrapping_next();
        if frame.seqn != expected {
            self.slots.remove(&key);
            return Err(VlpError::SequenceError {
                expected,
                received: frame.seqn,
            });
        }

        slot.frames += 1;
        if slot.frames > MAX_FRAMES {
            let frames = slot.frames;
            self.slots.remove(&key);
            return Err(VlpError::OutOfMemory { frames });
        }

        slot.last_seqn = frame.seqn;
        slot.updated = now;
        slot.payload.extend_from_slice(&frame.content);

        if !frame.flags.end {
            return Ok(Progress::Pending);
        }

        match self.slots.remove(&key) {
            Some(slot) => {
                tracing::debug!(
                    device_index = key.0,
                    feature_index = key.1,
                    len = slot.payload.len(),
                    "transfer complete"
                );
                Ok(Progress::Complete(VlpMessage {
                    report_id: slot.report_id,
                    header: slot.header,
                    payload: slot.payload,
                }))
            },
            None => Ok(Progress::Pending),
        }
    }

    /// Drops every slot idle for longer than the timeout.
    pub fn expire(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.slots.retain(|key, slot| {
            let alive = now.saturating_duration_since(slot.updated) <= timeout;
            if !alive {
                tracing::debug!(device_index = key.0, feature_index = key.1, "transfer timed out");
            }
            alive
        });
    }

    /// Discards every open slot.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// The number of transfers in progress.
    pub fn open_slots(&self) -> usize {
        self.slots.len()
    }
}

/// Represents an error in a VLP transfer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VlpError {
    /// A frame arrived with a sequence number other than the next one.
    #[error("expected sequence number {expected}, received {received}")]
    SequenceError { expected: U4, received: U4 },

    /// A continuation arrived without an open transfer, or for a different
    /// function than the open one.
    #[error("no matching transfer is open for device {device_index:#04x}, feature {feature_index:#04x}")]
    TransactionError { device_index: u8, feature_index: u8 },

    /// The payload needs more frames than a transfer can carry.
    #[error("a transfer of {frames} frames exceeds the limit of {MAX_FRAMES}")]
    OutOfMemory { frames: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The receiver did not acknowledge a frame in time.
    #[error("frame {seqn} was not acknowledged in time")]
    AckTimeout { seqn: U4 },
}
