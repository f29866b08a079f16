mod decode_frame;
mod image_header;
mod key_hierarchy;
mod keyboard;
mod probe;

use std::{fs, path::Path};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use decode_frame::DecodeFrameCommand;
use image_header::ImageHeaderCommand;
use key_hierarchy::KeyHierarchyCommand;
use keyboard::KeyboardCommand;
use probe::ProbeCommand;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    color: colorchoice_clap::Color,

    #[command(subcommand)]
    command: Commands,

    /// Output plain JSON without color and interactivity
    #[arg(short, long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    DecodeFrame(DecodeFrameCommand),
    ImageHeader(ImageHeaderCommand),
    KeyHierarchy(KeyHierarchyCommand),
    Keyboard(KeyboardCommand),
    Probe(ProbeCommand),
}

pub async fn execute() -> Result<()> {
    let cli = Cli::parse();

    cli.color.write_global();

    match &cli.command {
        Commands::DecodeFrame(cmd) => cmd.execute(&cli),
        Commands::ImageHeader(cmd) => cmd.execute(&cli),
        Commands::KeyHierarchy(cmd) => cmd.execute(&cli),
        Commands::Keyboard(cmd) => cmd.execute(&cli),
        Commands::Probe(cmd) => cmd.execute(&cli).await,
    }
}

/// Reads the bytes an argument refers to: the contents of a file if one
/// exists at that path, the hex string itself otherwise.
fn read_input(arg: &str) -> Result<Vec<u8>> {
    let path = Path::new(arg);
    if path.is_file() {
        return fs::read(path).with_context(|| format!("could not read {}", path.display()));
    }

    parse_hex(arg)
}

/// Decodes hex, ignoring whitespace, colons and a leading `0x`.
fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let input = input.trim();
    let input = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);
    let digits: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();

    hex::decode(&digits).with_context(|| format!("{input:?} is neither a file nor valid hex"))
}
