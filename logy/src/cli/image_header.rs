use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use clap::Args;
use hidpp::formats::image::{ImageFlag, ImageHeader, ImageTrailer};
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;

use super::{Cli, read_input};

/// Decode the header and, if present, the signed trailer of a firmware image.
#[derive(Args)]
pub struct ImageHeaderCommand {
    /// A path to the image, or its leading bytes in hex
    input: String,
}

impl ImageHeaderCommand {
    pub fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let bytes = read_input(&self.input)?;
        let inspected = inspect(&bytes)?;

        if root.json {
            writeln!(stdout, "{}", json!(inspected))?;
            return Ok(());
        }

        let header = &inspected.header;
        writeln!(stdout, "Image {}", header.version.to_string().green())?;
        writeln!(stdout, " ├─ LOAD ADDRESS: {:#010x}", header.load_addr.bright_black())?;
        writeln!(stdout, " ├─ HEADER SIZE: {}", header.header_size.bright_black())?;
        writeln!(stdout, " ├─ IMAGE SIZE: {}", header.image_size.bright_black())?;
        writeln!(
            stdout,
            " ├─ PROTECTED TLV SIZE: {}",
            header.protect_tlv_size.bright_black()
        )?;
        writeln!(
            stdout,
            " {} FLAGS: {:#010x} {:?}",
            if inspected.trailer.is_some() {
                "├─"
            } else {
                "╰─"
            },
            header.flags,
            inspected.flags.bright_black()
        )?;

        if let Some(trailer) = &inspected.trailer {
            writeln!(
                stdout,
                " ╰─ TRAILER ({} bytes, {})",
                trailer.tlv_tot,
                if trailer.protected {
                    "protected"
                } else {
                    "unprotected"
                }
            )?;
            writeln!(stdout, "     ├─ SLOT HASH: {}", hex::encode(&trailer.slot_hash).bright_black())?;
            writeln!(stdout, "     ├─ KEY HASH: {}", hex::encode(&trailer.key_hash).bright_black())?;
            writeln!(
                stdout,
                "     ╰─ SIGNATURE: {:?} {}",
                trailer.signature_type.blue(),
                hex::encode(&trailer.signature).bright_black()
            )?;
        }

        stdout.flush()?;

        Ok(())
    }
}

#[derive(Clone, Debug, Serialize)]
struct InspectedImage {
    header: ImageHeader,
    flags: Vec<ImageFlag>,

    #[serde(skip_serializing_if = "Option::is_none")]
    trailer: Option<ImageTrailer>,
}

/// Decodes the header, then the trailer behind the image body if the input
/// reaches that far.
fn inspect(bytes: &[u8]) -> Result<InspectedImage> {
    let header = ImageHeader::parse(bytes).context("could not decode the image header")?;

    let trailer_start = usize::from(header.header_size) + header.image_size as usize;
    let trailer = match bytes.get(trailer_start..) {
        Some(rest) if !rest.is_empty() => {
            Some(ImageTrailer::parse(rest).context("could not decode the image trailer")?)
        },
        _ => None,
    };

    Ok(InspectedImage {
        flags: header.flag_set(),
        header,
        trailer,
    })
}
