//! Implements the `UnifiedBattery` feature (ID `0x1004`) that provides
//! information about the battery status of the device.

use std::{collections::HashSet, sync::Arc};

use lazy_static::lazy_static;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{
    CreatableFeature,
    Feature,
    FeatureCategory,
    registry::{self, BundleBuilder, SchemaBundle},
};
use crate::{
    channel::{ChannelError, HidppChannel},
    codec::CodecError,
    container::{Container, FieldTable, TableBuilder},
    dispatch::{Received, queue::QueueName},
    field::FieldDescriptor,
};

pub const FUNCTION_GET_CAPABILITIES: u8 = 0;
pub const FUNCTION_GET_STATUS: u8 = 1;
pub const EVENT_BATTERY_STATUS: u8 = 0;

lazy_static! {
    static ref NO_PARAMETERS: Arc<FieldTable> = TableBuilder::new("NoParameters")
        .field(FieldDescriptor::bytes(1, "padding", 3).default_uint(0))
        .build();

    static ref GET_CAPABILITIES_RESPONSE: Arc<FieldTable> =
        TableBuilder::new("GetCapabilitiesResponse")
            .field(FieldDescriptor::bits(1, "rfu_1", 4).default_uint(0))
            .field(FieldDescriptor::bits(2, "supported_level_full", 1))
            .field(FieldDescriptor::bits(3, "supported_level_good", 1))
            .field(FieldDescriptor::bits(4, "supported_level_low", 1))
            .field(FieldDescriptor::bits(5, "supported_level_critical", 1))
            .field(FieldDescriptor::bits(6, "rfu_2", 6).default_uint(0))
            .field(FieldDescriptor::bits(7, "soc_capability_flag", 1).alias("state_of_charge_supported"))
            .field(FieldDescriptor::bits(8, "rchg_capability_flag", 1).alias("rechargeable"))
            .build();

    /// Shared by the `GetStatus` response and the `BatteryStatus` event.
    static ref STATUS: Arc<FieldTable> = TableBuilder::new("BatteryStatus")
        .field(FieldDescriptor::bits(1, "state_of_charge", 8).alias("charging_percentage"))
        .field(FieldDescriptor::bits(2, "rfu_1", 4).default_uint(0))
        .field(FieldDescriptor::bits(3, "battery_level_full", 1))
        .field(FieldDescriptor::bits(4, "battery_level_good", 1))
        .field(FieldDescriptor::bits(5, "battery_level_low", 1))
        .field(FieldDescriptor::bits(6, "battery_level_critical", 1))
        .field(FieldDescriptor::bits(7, "charging_status", 8))
        .field(FieldDescriptor::bits(8, "external_power_status", 8))
        .build();
}

/// Versions 0 and 1 share their layouts.
pub fn schemas() -> Vec<SchemaBundle> {
    [0, 1]
        .into_iter()
        .map(|version| {
            BundleBuilder::new(
                UnifiedBatteryFeature::ID,
                version,
                "UnifiedBattery",
                FeatureCategory::Common,
            )
            .function(
                FUNCTION_GET_CAPABILITIES,
                "GetCapabilities",
                &NO_PARAMETERS,
                &GET_CAPABILITIES_RESPONSE,
            )
            .function(FUNCTION_GET_STATUS, "GetStatus", &NO_PARAMETERS, &STATUS)
            .event(
                EVENT_BATTERY_STATUS,
                "BatteryStatusEvent",
                &STATUS,
                Some(QueueName::BatteryEvent),
            )
            .build()
        })
        .collect()
}

/// Implements the `UnifiedBattery` / `0x1004` feature.
///
/// Battery status events are delivered to the
/// [`QueueName::BatteryEvent`] queue of the channel's dispatcher and can be
/// read with [`BatteryInfo::from_event`].
#[derive(Clone)]
pub struct UnifiedBatteryFeature {
    /// The underlying HID++ channel.
    chan: Arc<HidppChannel>,

    /// The index of the device to implement the feature for.
    device_index: u8,

    /// The index of the feature in the feature table.
    feature_index: u8,
}

impl CreatableFeature for UnifiedBatteryFeature {
    const ID: u16 = 0x1004;
    const STARTING_VERSION: u8 = 0;

    fn new(chan: Arc<HidppChannel>, device_index: u8, feature_index: u8) -> Self {
        Self {
            chan,
            device_index,
            feature_index,
        }
    }
}

impl Feature for UnifiedBatteryFeature {
}

impl UnifiedBatteryFeature {
    fn bundle(&self) -> Result<&'static SchemaBundle, ChannelError> {
        let version = self
            .chan
            .dispatcher()
            .feature_map(self.device_index)
            .get(Self::ID)
            .and_then(|lookup| lookup.entry())
            .map_or(0, |entry| entry.version);
        Ok(registry::lookup(Self::ID, version)?)
    }

    async fn call(&self, function: u8) -> Result<Container, ChannelError> {
        let bundle = self.bundle()?;
        let request = bundle.request(function)?.new_container();

        super::invoke(
            &self.chan,
            self.device_index,
            self.feature_index,
            bundle,
            function,
            &request,
        )
        .await
    }

    /// Retrieves the capabilities of this feature and the battery in general.
    pub async fn get_battery_capabilities(&self) -> Result<BatteryCapabilities, ChannelError> {
        let response = self.call(FUNCTION_GET_CAPABILITIES).await?;
        Ok(BatteryCapabilities::try_from(&response)?)
    }

    /// Retrieves the current information about the battery status.
    pub async fn get_battery_info(&self) -> Result<BatteryInfo, ChannelError> {
        let response = self.call(FUNCTION_GET_STATUS).await?;
        BatteryInfo::try_from(&response).map_err(|_| ChannelError::UnsupportedResponse)
    }
}

/// Represents the capabilites of this feature and the battery itself.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[non_exhaustive]
pub struct BatteryCapabilities {
    /// All [`BatteryLevel`] variants the feature supports and reports.
    pub reported_levels: HashSet<BatteryLevel>,

    /// Whether the battery is rechargeable.
    pub rechargeable: bool,

    /// Whether the device supports reporting the current battery charge
    /// percentage in [`BatteryInfo::charging_percentage`].
    pub percentage: bool,
}

impl TryFrom<&Container> for BatteryCapabilities {
    type Error = CodecError;

    fn try_from(response: &Container) -> Result<Self, Self::Error> {
        let mut reported_levels = HashSet::new();
        for (name, level) in [
            ("supported_level_critical", BatteryLevel::Critical),
            ("supported_level_low", BatteryLevel::Low),
            ("supported_level_good", BatteryLevel::Good),
            ("supported_level_full", BatteryLevel::Full),
        ] {
            if response.get_bool(name)? {
                reported_levels.insert(level);
            }
        }

        Ok(Self {
            reported_levels,
            rechargeable: response.get_bool("rchg_capability_flag")?,
            percentage: response.get_bool("soc_capability_flag")?,
        })
    }
}

/// Represents infirmation about the current battery charge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[non_exhaustive]
pub struct BatteryInfo {
    /// The current charge of the battery in percent.
    ///
    /// If [`BatteryCapabilities::percentage`] is set to `false`, this is always
    /// zero.
    pub charging_percentage: u8,

    /// The current (approximate) level of the battery.
    ///
    /// This can only reach values present in
    /// [`BatteryCapabilities::reported_levels`]. [`None`] if the device set no
    /// level bit.
    pub level: Option<BatteryLevel>,

    /// The current charging status of the battery.
    pub status: BatteryStatus,

    pub external_power: ExternalPowerStatus,
}

impl BatteryInfo {
    /// Reads the battery information carried by a routed battery event.
    ///
    /// Returns [`None`] for any other message.
    pub fn from_event(received: &Received) -> Option<Self> {
        let class = received.class?;
        if class.feature_id != UnifiedBatteryFeature::ID
            || class.function_index != EVENT_BATTERY_STATUS
            || class.kind != registry::MessageKind::Event
        {
            return None;
        }
        received.fields.as_ref().and_then(|fields| Self::try_from(fields).ok())
    }
}

impl TryFrom<&Container> for BatteryInfo {
    type Error = BatteryError;

    fn try_from(status: &Container) -> Result<Self, Self::Error> {
        // The highest level bit wins should a device set more than one.
        let mut level = None;
        for (name, candidate) in [
            ("battery_level_critical", BatteryLevel::Critical),
            ("battery_level_low", BatteryLevel::Low),
            ("battery_level_good", BatteryLevel::Good),
            ("battery_level_full", BatteryLevel::Full),
        ] {
            if status.get_bool(name)? {
                level = Some(candidate);
            }
        }

        let raw_status = status.get_uint("charging_status")? as u8;
        let raw_power = status.get_uint("external_power_status")? as u8;

        Ok(Self {
            charging_percentage: status.get_uint("state_of_charge")? as u8,
            level,
            status: BatteryStatus::try_from(raw_status)
                .map_err(|_| BatteryError::UnknownStatus(raw_status))?,
            external_power: ExternalPowerStatus::try_from(raw_power)
                .map_err(|_| BatteryError::UnknownExternalPower(raw_power))?,
        })
    }
}

/// Represents an error reading a battery status.
#[derive(Debug, thiserror::Error)]
pub enum BatteryError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("unknown charging status {0:#04x}")]
    UnknownStatus(u8),

    #[error("unknown external power status {0:#04x}")]
    UnknownExternalPower(u8),
}

/// Represents an approximate level of the battery charge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum BatteryLevel {
    Critical = 1,
    Low = 1 << 1,
    Good = 1 << 2,
    Full = 1 << 3,
}

/// Represents the charging status of the battery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum BatteryStatus {
    Discharging = 0,
    Charging = 1,
    ChargingSlow = 2,
    Full = 3,
    Error = 4,
}

/// Represents the external power source feeding the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum ExternalPowerStatus {
    None = 0,
    Wired = 1,
    Wireless = 2,
}
