use std::io::{BufWriter, Write};

use anyhow::{Result, bail};
use clap::Args;
use hidpp::formats::keyboard::{self, BITMAP_SIZE};
use owo_colors::OwoColorize;
use serde_json::json;

use super::{Cli, parse_hex};

/// List the keys pressed in a 16 byte keyboard bitmap.
#[derive(Args)]
pub struct KeyboardCommand {
    /// The bitmap in hex, as read from the device
    bitmap: String,
}

impl KeyboardCommand {
    pub fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let pressed = pressed_keys(&parse_hex(&self.bitmap)?)?;

        if root.json {
            writeln!(stdout, "{}", json!(pressed))?;
            return Ok(());
        }

        if pressed.is_empty() {
            writeln!(stdout, "{}", "No keys are pressed.".bright_black())?;
        }
        for key in pressed {
            writeln!(stdout, "{}", key.green())?;
        }

        stdout.flush()?;

        Ok(())
    }
}

fn pressed_keys(bytes: &[u8]) -> Result<Vec<&'static str>> {
    if bytes.len() != BITMAP_SIZE {
        bail!("the bitmap must be {BITMAP_SIZE} bytes long, got {}", bytes.len());
    }

    Ok(keyboard::pressed(&keyboard::decode(bytes)?)?)
}
