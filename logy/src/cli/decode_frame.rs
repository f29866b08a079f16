use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use clap::Args;
use hidpp::{
    nibble::U4,
    protocol::error::DeviceError,
    report::{Frame, ReportHeader, ReportKind},
    vlp::VlpFlags,
};
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;

use super::{Cli, parse_hex};

/// Decode the framing of a raw report.
#[derive(Args)]
pub struct DecodeFrameCommand {
    /// The report in hex, starting with its report ID
    report: String,

    /// Report IDs to accept as plain HID traffic
    #[arg(long, value_parser = parse_report_id)]
    hid_report: Vec<u8>,
}

impl DecodeFrameCommand {
    pub fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let raw = parse_hex(&self.report)?;
        let frame = Frame::parse(&raw, &self.hid_report).context("could not frame the report")?;
        let decoded = DecodedFrame::from(&frame);

        if root.json {
            writeln!(stdout, "{}", json!(decoded))?;
            return Ok(());
        }

        writeln!(stdout, "{} ({:#04x})", decoded.kind.green(), decoded.report_id.bright_black())?;

        let mut properties = Vec::new();
        if let Some(header) = decoded.header {
            properties.push(format!("DEVICE: {:#04x}", header.device_index.bright_blue()));
            properties.push(format!("FEATURE INDEX: {:#04x}", header.feature_index.bright_black()));
            properties.push(format!(
                "FUNCTION/SW: {}/{}",
                header.function_id.bright_black(),
                header.software_id.bright_black()
            ));
        }
        if let Some(flags) = decoded.vlp_flags {
            properties.push(format!(
                "VLP: begin={} end={} ack={} seqn={}",
                flags.begin,
                flags.end,
                flags.ack,
                decoded.vlp_seqn.unwrap_or_default()
            ));
        }
        properties.push(format!("PAYLOAD: {}", decoded.payload.bright_black()));
        if let Some(err) = decoded.error {
            properties.push(format!(
                "ERROR: {} ({:?}, {:#04x})",
                format!("{:?}", err.kind).red(),
                err.family,
                err.code
            ));
            properties.push(format!(
                "FAILED REQUEST: {:#04x}/{:#04x}",
                err.feature_index, err.function_and_sw_id
            ));
        }

        let properties_len = properties.len();
        for (property_i, property) in properties.into_iter().enumerate() {
            writeln!(
                stdout,
                " {} {}",
                if property_i == properties_len - 1 {
                    "╰─"
                } else {
                    "├─"
                },
                property
            )?;
        }

        stdout.flush()?;

        Ok(())
    }
}

fn parse_report_id(arg: &str) -> Result<u8, String> {
    let digits = arg.trim_start_matches("0x");
    u8::from_str_radix(digits, 16).map_err(|err| err.to_string())
}

#[derive(Clone, Debug, Serialize)]
struct DecodedFrame {
    kind: &'static str,
    report_id: u8,

    #[serde(skip_serializing_if = "Option::is_none")]
    header: Option<DecodedHeader>,

    #[serde(skip_serializing_if = "Option::is_none")]
    vlp_flags: Option<VlpFlags>,

    #[serde(skip_serializing_if = "Option::is_none")]
    vlp_seqn: Option<u8>,

    payload: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<DeviceError>,
}

#[derive(Clone, Copy, Debug, Serialize)]
struct DecodedHeader {
    device_index: u8,
    feature_index: u8,
    function_id: U4,
    software_id: U4,
}

impl From<ReportHeader> for DecodedHeader {
    fn from(header: ReportHeader) -> Self {
        Self {
            device_index: header.device_index,
            feature_index: header.feature_index,
            function_id: U4::from_hi(header.function_and_sw_id),
            software_id: U4::from_lo(header.function_and_sw_id),
        }
    }
}

impl From<&Frame> for DecodedFrame {
    fn from(frame: &Frame) -> Self {
        match frame {
            Frame::Hidpp(report) => {
                let error = DeviceError::from_report(report);
                Self {
                    kind: match report.kind() {
                        ReportKind::Short => "short",
                        ReportKind::Long => "long",
                        ReportKind::VeryLong => "very long",
                    },
                    report_id: report.report_id(),
                    // Error frames carry the failed request's header, not their own.
                    header: error.is_none().then(|| report.header().into()),
                    vlp_flags: None,
                    vlp_seqn: None,
                    payload: hex::encode(report.payload()),
                    error,
                }
            },
            Frame::Vlp(vlp) => Self {
                kind: "vlp",
                report_id: vlp.report_id,
                header: Some(vlp.header.into()),
                vlp_flags: Some(vlp.flags),
                vlp_seqn: Some(vlp.seqn.get()),
                payload: hex::encode(&vlp.content),
                error: None,
            },
            Frame::Hid { report_id, data } => Self {
                kind: "hid",
                report_id: *report_id,
                header: None,
                vlp_flags: None,
                vlp_seqn: None,
                payload: hex::encode(data),
                error: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use hidpp::protocol::error::{DeviceErrorKind, ErrorFamily};

    use super::*;

    fn decode(hex: &str) -> DecodedFrame {
        let raw = parse_hex(hex).unwrap();
        DecodedFrame::from(&Frame::parse(&raw, &[0x01]).unwrap())
    }

    #[test]
    fn splits_function_and_software_id() {
        let frame = decode("10 01 02 1A 00 00 00");
        assert_eq!(frame.kind, "short");

        let header = frame.header.unwrap();
        assert_eq!(header.device_index, 0x01);
        assert_eq!(header.feature_index, 0x02);
        assert_eq!(header.function_id.get(), 0x1);
        assert_eq!(header.software_id.get(), 0xa);
        assert!(frame.error.is_none());
    }

    #[test]
    fn types_device_errors() {
        let frame = decode("11 01 FF 05 1A 05 0000000000000000000000000000");
        assert!(frame.header.is_none());

        let err = frame.error.unwrap();
        assert_eq!(err.family, ErrorFamily::Hidpp20);
        assert_eq!(err.kind, DeviceErrorKind::NotAllowed);
        assert_eq!(err.feature_index, 0x05);
        assert_eq!(err.function_and_sw_id, 0x1a);
    }

    #[test]
    fn passes_declared_hid_reports() {
        let frame = decode("01 00 05 00");
        assert_eq!(frame.kind, "hid");
        assert_eq!(frame.payload, "000500");
    }
}
