use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use hidpp::{
    codec,
    formats::key_hierarchy::{self, KeyFlavour, KeyHierarchy, X509_KEY_HIERARCHY},
};
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;

use super::{Cli, read_input};

/// Decode a bootloader key hierarchy table.
#[derive(Args)]
pub struct KeyHierarchyCommand {
    /// A path to the table, or the table in hex
    input: String,

    /// The kind of keys the table holds
    #[arg(short, long, value_enum, default_value_t = Flavour::Ec)]
    flavour: Flavour,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
enum Flavour {
    Ec,
    Rsa2048,
    Rsa3072,
    X509,
}

impl KeyHierarchyCommand {
    pub fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let bytes = read_input(&self.input)?;
        let entries = decode(&bytes, self.flavour)?;

        if root.json {
            writeln!(stdout, "{}", json!(entries))?;
            return Ok(());
        }

        writeln!(
            stdout,
            "{:?} key hierarchy, root of trust {}",
            self.flavour.green(),
            entries.root_of_trust_index.bright_blue()
        )?;
        writeln!(stdout, " │")?;

        if entries.entries.is_empty() {
            writeln!(stdout, " ╰─ {}", "No keys were found.".bright_black().italic())?;
            stdout.flush()?;
            return Ok(());
        }

        let entries_len = entries.entries.len();
        for (entry_i, entry) in entries.entries.iter().enumerate() {
            let last = entry_i == entries_len - 1;
            writeln!(
                stdout,
                "{} {}",
                if last { " ╰─" } else { " ├─" },
                format!("#{entry_i}").bright_blue()
            )?;

            let indent = if last { "    " } else { " │  " };
            let parts = entry.parts();
            let parts_len = parts.len();
            for (part_i, (label, data)) in parts.into_iter().enumerate() {
                writeln!(
                    stdout,
                    "{indent} {} {label} ({} bytes): {}",
                    if part_i == parts_len - 1 {
                        "╰─"
                    } else {
                        "├─"
                    },
                    data.len(),
                    hex::encode(data).bright_black()
                )?;
            }
        }

        stdout.flush()?;

        Ok(())
    }
}

#[derive(Clone, Debug, Serialize)]
struct DecodedHierarchy {
    root_of_trust_index: u8,
    entries: Vec<Entry>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
enum Entry {
    Pair {
        #[serde(serialize_with = "as_hex")]
        public_key: Vec<u8>,

        #[serde(serialize_with = "as_hex")]
        signature: Vec<u8>,
    },
    Certificate {
        #[serde(serialize_with = "as_hex")]
        der: Vec<u8>,
    },
}

impl Entry {
    fn parts(&self) -> Vec<(&'static str, &[u8])> {
        match self {
            Self::Pair {
                public_key,
                signature,
            } => vec![("PUBLIC KEY", public_key.as_slice()), ("SIGNATURE", signature.as_slice())],
            Self::Certificate { der } => vec![("CERTIFICATE", der.as_slice())],
        }
    }
}

fn as_hex<S: serde::Serializer>(data: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(data))
}

fn decode(bytes: &[u8], flavour: Flavour) -> Result<DecodedHierarchy> {
    let flavour = match flavour {
        Flavour::Ec => KeyFlavour::Ec,
        Flavour::Rsa2048 => KeyFlavour::Rsa2048,
        Flavour::Rsa3072 => KeyFlavour::Rsa3072,
        Flavour::X509 => {
            let hierarchy = codec::decode_bytes(&X509_KEY_HIERARCHY, bytes)
                .context("could not decode the certificate hierarchy")?;
            return Ok(DecodedHierarchy {
                root_of_trust_index: hierarchy.get_uint("root_of_trust_index")? as u8,
                entries: key_hierarchy::certificates(&hierarchy)?
                    .into_iter()
                    .map(|der| Entry::Certificate { der })
                    .collect(),
            });
        },
    };

    let hierarchy =
        KeyHierarchy::parse(bytes, flavour).context("could not decode the key hierarchy")?;
    Ok(DecodedHierarchy {
        root_of_trust_index: hierarchy.root_of_trust_index,
        entries: hierarchy
            .pairs
            .into_iter()
            .map(|pair| Entry::Pair {
                public_key: pair.public_key,
                signature: pair.signature,
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(count: u8) -> Vec<u8> {
        vec![0x7a, 0xda, 0xfe, 0x5a, 0x02, count, 0x00, 0x00]
    }

    #[test]
    fn decodes_ec_pairs() {
        let mut bytes = header(1);
        bytes.extend([0x04; 65]);
        bytes.extend([0x11; 64]);

        let decoded = decode(&bytes, Flavour::Ec).unwrap();
        assert_eq!(decoded.root_of_trust_index, 2);
        assert_eq!(decoded.entries.len(), 1);

        let parts = decoded.entries[0].parts();
        assert_eq!(parts[0].1.len(), 65);
        assert_eq!(parts[1].1, [0x11; 64]);
    }

    #[test]
    fn decodes_certificates() {
        let mut bytes = header(0);
        bytes.extend([0x30, 0x02, 0xaa, 0xbb, 0x30, 0x01, 0xcc, 0xff, 0xff]);

        let decoded = decode(&bytes, Flavour::X509).unwrap();
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[1].parts()[0].1, [0x30, 0x01, 0xcc]);
    }

    #[test]
    fn reports_short_tables() {
        let mut bytes = header(2);
        bytes.extend([0x04; 65 + 64]);
        assert!(decode(&bytes, Flavour::Ec).is_err());
    }
}
