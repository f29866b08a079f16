//! Typed error reports sent by devices and receivers.
//!
//! HID++ knows two error frame layouts:
//!
//! - HID++2.0: `11 <dev> FF <feature index> <fn/sw> <code> ...`
//! - HID++1.0: `10 <dev> 8F <sub ID> <address> <code> ...`
//!
//! Both echo the header of the request that failed, which is what correlates
//! an error to the request waiting for it. The two families use overlapping
//! code values with different meanings, so the family is kept alongside the
//! decoded kind.

use std::fmt;

use crate::{
    nibble::U4,
    protocol::{v10, v20},
    report::{HEADER_LENGTH, LONG_REPORT_LENGTH, Report, ReportHeader},
};

/// The protocol family an error report belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ErrorFamily {
    /// Reported with sub ID `0x8F`, mostly by receivers.
    Hidpp10,

    /// Reported with feature index `0xFF`.
    Hidpp20,
}

/// The kind of a device-originated error.
///
/// Codes are mapped through [`v20::ErrorType`] or [`v10::ErrorType`]
/// depending on the family. Codes neither table knows are kept as
/// [`Self::Other`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeviceErrorKind {
    Unknown,
    InvalidArgument,
    OutOfRange,
    HardwareError,
    NotAllowed,
    InvalidFeatureIndex,
    InvalidFunctionId,
    Busy,
    Unsupported,
    OutOfMemory,
    InvalidAddress,

    InvalidSubId,
    InvalidValue,
    ConnectFail,
    TooManyDevices,
    AlreadyExists,
    /// The receiver is busy with another downstream message.
    ReceiverBusy,
    UnknownDevice,
    ResourceError,
    RequestUnavailable,
    InvalidParam,
    WrongPinCode,
    Wireless,

    Other(u8),
}

impl DeviceErrorKind {
    /// Maps a raw code of the given family.
    pub fn from_code(family: ErrorFamily, code: u8) -> Self {
        match family {
            ErrorFamily::Hidpp20 => match v20::ErrorType::try_from(code) {
                Ok(v20::ErrorType::NoError) | Ok(v20::ErrorType::Unknown) => Self::Unknown,
                Ok(v20::ErrorType::InvalidArgument) => Self::InvalidArgument,
                Ok(v20::ErrorType::OutOfRange) => Self::OutOfRange,
                Ok(v20::ErrorType::HardwareError) => Self::HardwareError,
                Ok(v20::ErrorType::NotAllowed) => Self::NotAllowed,
                Ok(v20::ErrorType::InvalidFeatureIndex) => Self::InvalidFeatureIndex,
                Ok(v20::ErrorType::InvalidFunctionId) => Self::InvalidFunctionId,
                Ok(v20::ErrorType::Busy) => Self::Busy,
                Ok(v20::ErrorType::Unsupported) => Self::Unsupported,
                Ok(v20::ErrorType::OutOfMemory) => Self::OutOfMemory,
                Ok(v20::ErrorType::InvalidAddress) => Self::InvalidAddress,
                Err(_) => Self::Other(code),
            },
            ErrorFamily::Hidpp10 => match v10::ErrorType::try_from(code) {
                Ok(v10::ErrorType::Success) => Self::Other(code),
                Ok(v10::ErrorType::InvalidSubId) => Self::InvalidSubId,
                Ok(v10::ErrorType::InvalidAddress) => Self::InvalidAddress,
                Ok(v10::ErrorType::InvalidValue) => Self::InvalidValue,
                Ok(v10::ErrorType::ConnectFail) => Self::ConnectFail,
                Ok(v10::ErrorType::TooManyDevices) => Self::TooManyDevices,
                Ok(v10::ErrorType::AlreadyExists) => Self::AlreadyExists,
                Ok(v10::ErrorType::Busy) => Self::ReceiverBusy,
                Ok(v10::ErrorType::UnknownDevice) => Self::UnknownDevice,
                Ok(v10::ErrorType::ResourceError) => Self::ResourceError,
                Ok(v10::ErrorType::RequestUnavailable) => Self::RequestUnavailable,
                Ok(v10::ErrorType::InvalidParamValue) => Self::InvalidParam,
                Ok(v10::ErrorType::WrongPinCode) => Self::WrongPinCode,
                Ok(v10::ErrorType::Wireless) => Self::Wireless,
                Err(_) => Self::Other(code),
            },
        }
    }

    /// The family this kind is native to.
    ///
    /// `InvalidAddress` exists in both tables and reports [`ErrorFamily::Hidpp20`];
    /// use [`DeviceError::family`] for the family a report actually came with.
    pub fn family(self) -> Option<ErrorFamily> {
        match self {
            Self::Unknown
            | Self::InvalidArgument
            | Self::OutOfRange
            | Self::HardwareError
            | Self::NotAllowed
            | Self::InvalidFeatureIndex
            | Self::InvalidFunctionId
            | Self::Busy
            | Self::Unsupported
            | Self::OutOfMemory
            | Self::InvalidAddress => Some(ErrorFamily::Hidpp20),
            Self::InvalidSubId
            | Self::InvalidValue
            | Self::ConnectFail
            | Self::TooManyDevices
            | Self::AlreadyExists
            | Self::ReceiverBusy
            | Self::UnknownDevice
            | Self::ResourceError
            | Self::RequestUnavailable
            | Self::InvalidParam
            | Self::WrongPinCode
            | Self::Wireless => Some(ErrorFamily::Hidpp10),
            Self::Other(_) => None,
        }
    }
}

/// An error report received from a device or receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceError {
    pub family: ErrorFamily,
    pub kind: DeviceErrorKind,

    /// The raw error code as sent.
    pub code: u8,

    pub device_index: u8,

    /// The feature index (HID++2.0) or sub ID (HID++1.0) of the failed
    /// request.
    pub feature_index: u8,

    /// The function/software ID byte (HID++2.0) or register address (HID++1.0)
    /// of the failed request.
    pub function_and_sw_id: u8,
}

impl DeviceError {
    /// Tries to read an error report, returning [`None`] for any other frame.
    pub fn from_report(report: &Report) -> Option<Self> {
        let header = report.header();

        let family = match header.feature_index {
            v20::ERROR_FEATURE_INDEX => ErrorFamily::Hidpp20,
            sub_id if sub_id == u8::from(v10::MessageType::Error) => ErrorFamily::Hidpp10,
            _ => return None,
        };

        Self::read(family, header, report.payload())
    }

    /// Reads an error from the header of an error frame and the payload
    /// following it.
    ///
    /// The failed request's feature index sits in the fn/sw position of the
    /// error header, its fn/sw byte and the error code open the payload.
    pub fn read(family: ErrorFamily, header: ReportHeader, payload: &[u8]) -> Option<Self> {
        let [function_and_sw_id, code, ..] = *payload else {
            return None;
        };

        Some(Self {
            family,
            kind: DeviceErrorKind::from_code(family, code),
            code,
            device_index: header.device_index,
            feature_index: header.function_and_sw_id,
            function_and_sw_id,
        })
    }

    /// The header of the request this error answers.
    pub fn request_header(&self) -> ReportHeader {
        ReportHeader {
            device_index: self.device_index,
            feature_index: self.feature_index,
            function_and_sw_id: self.function_and_sw_id,
        }
    }

    /// The software ID of the failed request. Only meaningful for HID++2.0.
    pub fn software_id(&self) -> U4 {
        U4::from_lo(self.function_and_sw_id)
    }

    /// The function ID of the failed request. Only meaningful for HID++2.0.
    pub fn function_id(&self) -> U4 {
        U4::from_hi(self.function_and_sw_id)
    }

    /// Builds the report a device would send for this error.
    pub fn to_report(&self) -> Report {
        let tag = match self.family {
            ErrorFamily::Hidpp20 => v20::ERROR_FEATURE_INDEX,
            ErrorFamily::Hidpp10 => v10::MessageType::Error.into(),
        };
        let header = ReportHeader {
            device_index: self.device_index,
            feature_index: tag,
            function_and_sw_id: self.feature_index,
        };

        match self.family {
            ErrorFamily::Hidpp20 => {
                let mut payload = [0u8; LONG_REPORT_LENGTH - HEADER_LENGTH];
                payload[0] = self.function_and_sw_id;
                payload[1] = self.code;
                Report::Long(header, payload)
            },
            ErrorFamily::Hidpp10 => Report::Short(header, [self.function_and_sw_id, self.code, 0x00]),
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} ({:#04x}) from device {:#04x} for {:#04x}/{:#04x}",
            self.kind, self.code, self.device_index, self.feature_index, self.function_and_sw_id
        )
    }
}

impl std::error::Error for DeviceError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_hidpp20_errors() {
        let raw = [
            0x11, 0x01, 0xff, 0x05, 0x70, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let report = Report::read_raw(&raw).unwrap();
        let err = DeviceError::from_report(&report).unwrap();

        assert_eq!(err.family, ErrorFamily::Hidpp20);
        assert_eq!(err.kind, DeviceErrorKind::InvalidFunctionId);
        assert_eq!(err.device_index, 0x01);
        assert_eq!(err.feature_index, 0x05);
        assert_eq!(err.function_id(), U4::from_lo(7));
        assert_eq!(err.software_id(), U4::from_lo(0));
        assert_eq!(err.to_report(), report);
    }

    #[test]
    fn families_keep_overlapping_codes_apart() {
        let v10 = DeviceErrorKind::from_code(ErrorFamily::Hidpp10, 0x07);
        let v20 = DeviceErrorKind::from_code(ErrorFamily::Hidpp20, 0x07);

        assert_eq!(v10, DeviceErrorKind::ReceiverBusy);
        assert_eq!(v20, DeviceErrorKind::InvalidFunctionId);
        assert_eq!(v10.family(), Some(ErrorFamily::Hidpp10));
        assert_eq!(v20.family(), Some(ErrorFamily::Hidpp20));
    }

    #[test]
    fn reads_hidpp10_errors() {
        let report = Report::read_raw(&[0x10, 0xff, 0x8f, 0x81, 0xb5, 0x08, 0x00]).unwrap();
        let err = DeviceError::from_report(&report).unwrap();

        assert_eq!(err.family, ErrorFamily::Hidpp10);
        assert_eq!(err.kind, DeviceErrorKind::UnknownDevice);
        assert_eq!(err.feature_index, 0x81);
        assert_eq!(err.function_and_sw_id, 0xb5);
        assert_eq!(err.to_report(), report);
    }

    #[test]
    fn ignores_regular_reports() {
        let report = Report::read_raw(&[0x10, 0x01, 0x02, 0x11, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(DeviceError::from_report(&report), None);
    }
}
