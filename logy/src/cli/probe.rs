use std::{
    io::{BufWriter, Write},
    sync::Arc,
};

use anyhow::Result;
use clap::Args;
use hidpp::{
    channel::{ChannelError, HidppChannel},
    dispatch::queue::DispatchError,
    feature::{
        self,
        feature_set::FeatureSetFeature,
        map::FeatureEntry,
        registry,
        unified_battery::{BatteryLevel, BatteryStatus, UnifiedBatteryFeature},
    },
    protocol::{self, ProtocolVersion},
    report::RECEIVER_DEVICE_INDEX,
};
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;

use super::Cli;
use crate::async_hid_impl::enumerate_hidpp;

/// The device indices pinged on every interface: the receiver itself, then
/// the paired device slots.
const DEVICE_INDICES: [u8; 7] = [RECEIVER_DEVICE_INDEX, 1, 2, 3, 4, 5, 6];

/// Detect and view general information about connected devices.
#[derive(Args)]
pub struct ProbeCommand {}

impl ProbeCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let interfaces = probe_interfaces().await?;

        if root.json {
            writeln!(stdout, "{}", json!(interfaces))?;
            return Ok(());
        }

        if interfaces.is_empty() {
            writeln!(stdout, "{}", "No HID++ devices were found.".bright_black())?;
            return Ok(());
        }

        for (interface_i, interface) in interfaces.into_iter().enumerate() {
            if interface_i != 0 {
                writeln!(stdout)?;
            }

            writeln!(
                stdout,
                "HID++ interface ({:#06x}:{:#06x})",
                interface.vendor_id.bright_black(),
                interface.product_id.bright_black()
            )?;
            writeln!(stdout, " │")?;

            if interface.devices.is_empty() {
                writeln!(
                    stdout,
                    " ╰─ {}",
                    "No devices were found.".bright_black().italic()
                )?;
                continue;
            }

            let devices_len = interface.devices.len();
            for (device_i, device) in interface.devices.into_iter().enumerate() {
                if device_i != 0 {
                    writeln!(stdout, " │")?;
                }

                writeln!(
                    stdout,
                    "{} {}: {} {}",
                    if device_i == devices_len - 1 {
                        " ╰─"
                    } else {
                        " ├─"
                    },
                    format!("{:#04x}", device.index).bright_blue(),
                    "●".green(),
                    match device.protocol {
                        ProtocolVersion::V10 => "HID++1.0".to_string(),
                        ProtocolVersion::V20 {
                            protocol_num,
                            target_sw,
                        } => format!("HID++2.0 ({protocol_num}, {target_sw:#04x})"),
                    }
                    .green(),
                )?;

                let mut properties = Vec::new();
                if let Some(battery) = device.battery {
                    properties.push(format!(
                        "BATTERY: {} ({}), {:?}",
                        match battery.level {
                            Some(level @ (BatteryLevel::Full | BatteryLevel::Good)) =>
                                format!("{level:?}").green().to_string(),
                            Some(level @ BatteryLevel::Low) => format!("{level:?}").yellow().to_string(),
                            Some(level @ BatteryLevel::Critical) =>
                                format!("{level:?}").bright_red().to_string(),
                            Some(level) => format!("{level:?}"),
                            None => "Unknown".bright_black().to_string(),
                        },
                        format!("{}%", battery.percentage).blue(),
                        battery.status.bright_black()
                    ));
                }
                for feature in &device.features {
                    properties.push(format!(
                        "{:#04x}: {:#06x} {} v{}{}",
                        feature.index.bright_black(),
                        feature.feature_id,
                        feature.name.unwrap_or("Unknown"),
                        feature.version,
                        if feature.hidden {
                            " (hidden)".bright_black().to_string()
                        } else {
                            String::new()
                        }
                    ));
                }

                let properties_len = properties.len();
                for (property_i, property) in properties.into_iter().enumerate() {
                    writeln!(
                        stdout,
                        "{}{} {}",
                        if device_i == devices_len - 1 {
                            "         "
                        } else {
                            " │       "
                        },
                        if property_i == properties_len - 1 {
                            "╰─"
                        } else {
                            "├─"
                        },
                        property
                    )?;
                }
            }
        }

        stdout.flush()?;

        Ok(())
    }
}

async fn probe_interfaces() -> Result<Vec<ProbedInterface>> {
    let channels: Vec<Arc<HidppChannel>> =
        enumerate_hidpp().await?.into_iter().map(Arc::new).collect();

    let mut interfaces = Vec::with_capacity(channels.len());
    for channel in channels {
        channel.set_rotating_sw_id(true);

        let mut devices = Vec::new();
        for index in DEVICE_INDICES {
            let protocol = match protocol::determine_version(&channel, index).await {
                Ok(Some(protocol)) => protocol,
                Ok(None) | Err(ChannelError::Dispatch(DispatchError::Timeout)) => continue,
                Err(err) => return Err(err.into()),
            };
            tracing::debug!(device_index = index, ?protocol, "device answered the ping");

            let mut device = ProbedDevice {
                index,
                protocol,
                features: Vec::new(),
                battery: None,
            };
            if matches!(protocol, ProtocolVersion::V20 { .. }) {
                probe_features(&channel, &mut device).await?;
            }
            devices.push(device);
        }

        interfaces.push(ProbedInterface {
            vendor_id: channel.vendor_id,
            product_id: channel.product_id,
            devices,
        });
    }

    Ok(interfaces)
}

async fn probe_features(channel: &Arc<HidppChannel>, device: &mut ProbedDevice) -> Result<()> {
    let Some(feature_set) = feature::resolve::<FeatureSetFeature>(channel, device.index).await?
    else {
        return Ok(());
    };

    device.features = feature_set
        .enumerate()
        .await?
        .into_iter()
        .map(ProbedFeature::from)
        .collect();

    if let Some(battery) = feature::resolve::<UnifiedBatteryFeature>(channel, device.index).await? {
        let info = battery.get_battery_info().await?;
        device.battery = Some(ProbedBattery {
            percentage: info.charging_percentage,
            level: info.level,
            status: info.status,
        });
    }

    Ok(())
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct ProbedInterface {
    vendor_id: u16,
    product_id: u16,
    devices: Vec<ProbedDevice>,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct ProbedDevice {
    index: u8,
    protocol: ProtocolVersion,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    features: Vec<ProbedFeature>,

    #[serde(skip_serializing_if = "Option::is_none")]
    battery: Option<ProbedBattery>,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct ProbedFeature {
    index: u8,
    feature_id: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'static str>,

    version: u8,
    hidden: bool,
}

impl From<FeatureEntry> for ProbedFeature {
    fn from(entry: FeatureEntry) -> Self {
        Self {
            index: entry.index,
            feature_id: entry.feature_id,
            name: registry::known_feature(entry.feature_id).map(|known| known.name),
            version: entry.version,
            hidden: entry.typ.hidden,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
struct ProbedBattery {
    percentage: u8,

    #[serde(skip_serializing_if = "Option::is_none")]
    level: Option<BatteryLevel>,

    status: BatteryStatus,
}
