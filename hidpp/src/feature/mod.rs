//! HID++2.0 features: the per-device feature map, the schema factory and
//! clients for the built-in features.

use std::{any::Any, sync::Arc};

use registry::SchemaBundle;

use crate::{
    channel::{ChannelError, HidppChannel},
    container::Container,
    dispatch::queue::QueueName,
    nibble::U4,
    protocol::v20,
};

pub mod feature_set;
pub mod map;
pub mod registry;
pub mod root;
pub mod unified_battery;
pub mod vlp_root;

/// Represents a concrete implementation of a HID++2.0 device feature.
pub trait Feature: Any + Send + Sync {}

/// Represents a [`Feature`] that can be instantiated automatically.
pub trait CreatableFeature: Feature + Sized {
    /// The protocol ID of the implemented feature.
    const ID: u16;

    /// The version of the feature the implementation starts to support.
    const STARTING_VERSION: u8;

    /// Creates a new instance of the feature implementation.
    fn new(chan: Arc<HidppChannel>, device_index: u8, feature_index: u8) -> Self;
}

/// Looks up a feature on a device and instantiates its implementation.
///
/// Returns `Ok(None)` if the device does not support the feature or only
/// supports a version older than [`CreatableFeature::STARTING_VERSION`].
pub async fn resolve<F: CreatableFeature>(
    chan: &Arc<HidppChannel>,
    device_index: u8,
) -> Result<Option<F>, ChannelError> {
    let map = chan.dispatcher().feature_map(device_index);
    let map::Lookup::Present(entry) = map.lookup(chan, F::ID).await? else {
        return Ok(None);
    };

    if entry.version < F::STARTING_VERSION {
        return Ok(None);
    }

    Ok(Some(F::new(Arc::clone(chan), device_index, entry.index)))
}

/// Calls a feature function and decodes the response with the bundle's
/// response class.
pub(crate) async fn invoke(
    chan: &HidppChannel,
    device_index: u8,
    feature_index: u8,
    bundle: &SchemaBundle,
    function: u8,
    request: &Container,
) -> Result<Container, ChannelError> {
    let payload = bundle.request(function)?.encode(request)?;
    let header = v20::MessageHeader {
        device_index,
        feature_index,
        function_id: U4::from_lo(function),
        software_id: chan.get_sw_id(),
    };

    let report = chan.build_report(header.into(), &payload)?;
    let response = chan.request(report).await?;
    Ok(bundle.response(function)?.decode(response.payload())?)
}

/// Like [`invoke`], carried by a VLP transfer.
pub(crate) async fn invoke_vlp(
    chan: &HidppChannel,
    device_index: u8,
    feature_index: u8,
    bundle: &SchemaBundle,
    function: u8,
    request: &Container,
) -> Result<Container, ChannelError> {
    let payload = bundle.request(function)?.encode(request)?;
    let header = v20::MessageHeader {
        device_index,
        feature_index,
        function_id: U4::from_lo(function),
        software_id: chan.get_sw_id(),
    };

    let response = chan.request_vlp(header.into(), &payload).await?;
    Ok(bundle.response(function)?.decode(response.payload())?)
}

/// A bitfield describing some properties of a feature.
///
/// Documentation is taken from <https://drive.google.com/file/d/1ULmw9uJL8b8iwwUo5xjSS9F5Zvno-86y/view>.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FeatureType {
    /// An obsolete feature is a feature that has been replaced by a newer one,
    /// but is advertised in order for older SWs to still be able to support the
    /// feature (in case the old SW does not know yet the newer one).
    pub obsolete: bool,

    /// A SW hidden feature is a feature that should not be known/managed/used
    /// by end user configuration SW. The host should ignore this type of
    /// features.
    pub hidden: bool,

    /// A hidden feature that has been disabled for user software. Used for
    /// internal testing and manufacturing.
    pub engineering: bool,

    /// A manufacturing feature that can be permanently deactivated. It is
    /// usually also hidden and engineering.
    pub manufacturing_deactivatable: bool,

    /// A compliance feature that can be permanently deactivated. It is usually
    /// also hidden and engineering.
    pub compliance_deactivatable: bool,
}

impl From<u8> for FeatureType {
    fn from(value: u8) -> Self {
        Self {
            obsolete: value & (1 << 7) != 0,
            hidden: value & (1 << 6) != 0,
            engineering: value & (1 << 5) != 0,
            manufacturing_deactivatable: value & (1 << 4) != 0,
            compliance_deactivatable: value & (1 << 3) != 0,
        }
    }
}

impl From<FeatureType> for u8 {
    fn from(value: FeatureType) -> Self {
        let mut raw = 0;

        if value.obsolete {
            raw |= 1 << 7
        }
        if value.hidden {
            raw |= 1 << 6
        }
        if value.engineering {
            raw |= 1 << 5
        }
        if value.manufacturing_deactivatable {
            raw |= 1 << 4
        }
        if value.compliance_deactivatable {
            raw |= 1 << 3
        }

        raw
    }
}

/// The category a feature belongs to. It selects the queue responses of the
/// feature are delivered to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum FeatureCategory {
    Important,
    Common,
    Mouse,
    Keyboard,
    Touchpad,
    Gaming,
    Peripheral,
}

impl FeatureCategory {
    /// The queue responses of this category are delivered to.
    ///
    /// VLP traffic only distinguishes important from common features.
    pub fn queue(self, vlp: bool) -> QueueName {
        match (self, vlp) {
            (Self::Important, true) => QueueName::VlpImportant,
            (_, true) => QueueName::VlpCommon,
            (Self::Important, false) => QueueName::Important,
            (Self::Common, false) => QueueName::Common,
            (Self::Mouse, false) => QueueName::Mouse,
            (Self::Keyboard, false) => QueueName::Keyboard,
            (Self::Touchpad, false) => QueueName::Touchpad,
            (Self::Gaming, false) => QueueName::Gaming,
            (Self::Peripheral, false) => QueueName::Peripheral,
        }
    }
}

/// Represents information about a specific feature as returned by the root
/// and feature set features.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FeatureInformation {
    /// The protocol ID of the feature.
    pub id: u16,

    /// The index of the feature in the feature table.
    /// This is used for invocations of functions of that feature.
    pub index: u8,

    /// The type of the feature.
    pub typ: FeatureType,

    /// The latest supported version of the feature.
    ///
    /// Multi-version features are always backwards compatible as long as the
    /// feature ID does not change, meaning functions implemented for an older
    /// version of the same feature will behave as expected for every later
    /// version.
    pub version: u8,
}
