//! Maintains a registry of well-known HID++2.0 features and the message
//! schemas of those this crate implements.
//!
//! Schemas are grouped into [`SchemaBundle`]s, one per feature ID and
//! version. Every feature module contributes its bundles through a provider
//! function listed in [`PROVIDERS`]; the resulting map is built once, on first
//! use or through [`init`], and is read-only afterwards.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use lazy_static::lazy_static;
use thiserror::Error;

use super::{FeatureCategory, feature_set, root, unified_battery, vlp_root};
use crate::{
    bits::BitBuffer,
    codec::{self, CodecError, Overflow},
    container::{Container, FieldTable},
    dispatch::queue::QueueName,
};

/// The direction a message class describes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum MessageKind {
    Request,
    Response,
    Event,
}

/// The schema of a single message of a feature.
#[derive(Debug)]
pub struct MessageClass {
    pub name: &'static str,
    pub feature_id: u16,
    pub version: u8,

    /// The function index for requests and responses, the event index for
    /// events.
    pub function_index: u8,
    pub kind: MessageKind,

    /// The layout of the payload following the report header.
    pub table: Arc<FieldTable>,

    /// Overrides the queue selected by the feature category.
    pub queue: Option<QueueName>,
}

impl MessageClass {
    /// Decodes a report payload.
    ///
    /// Payloads are zero-padded to the report length, so trailing bytes are
    /// ignored and a payload ending early is zero-filled.
    pub fn decode(&self, payload: &[u8]) -> Result<Container, CodecError> {
        codec::decode_with(&self.table, &BitBuffer::from_bytes(payload), Overflow::Allow)
    }

    /// Creates an instance with every field at its default.
    pub fn new_container(&self) -> Container {
        Container::new(&self.table)
    }

    /// Encodes an instance into report payload bytes.
    pub fn encode(&self, container: &Container) -> Result<Vec<u8>, CodecError> {
        codec::encode_bytes(container)
    }
}

/// The frozen set of message classes of one feature version.
#[derive(Debug)]
pub struct SchemaBundle {
    pub feature_id: u16,
    pub version: u8,
    pub name: &'static str,
    pub category: FeatureCategory,
    requests: BTreeMap<u8, MessageClass>,
    responses: BTreeMap<u8, MessageClass>,
    events: BTreeMap<u8, MessageClass>,
}

impl SchemaBundle {
    pub fn request(&self, function: u8) -> Result<&MessageClass, SchemaError> {
        self.requests.get(&function).ok_or(SchemaError::UnknownFunction {
            feature_id: self.feature_id,
            version: self.version,
            function,
        })
    }

    pub fn response(&self, function: u8) -> Result<&MessageClass, SchemaError> {
        self.responses.get(&function).ok_or(SchemaError::UnknownFunction {
            feature_id: self.feature_id,
            version: self.version,
            function,
        })
    }

    pub fn event(&self, event: u8) -> Result<&MessageClass, SchemaError> {
        self.events.get(&event).ok_or(SchemaError::UnknownEvent {
            feature_id: self.feature_id,
            version: self.version,
            event,
        })
    }

    /// Picks the class of an inbound message.
    ///
    /// Unsolicited messages (software ID 0) try the event table first and
    /// fall back to responses; everything else is a response.
    pub fn classify(&self, function: u8, software_id: u8) -> Option<&MessageClass> {
        if software_id == 0 {
            self.events
                .get(&function)
                .or_else(|| self.responses.get(&function))
        } else {
            self.responses.get(&function)
        }
    }

    pub fn requests(&self) -> impl Iterator<Item = &MessageClass> {
        self.requests.values()
    }

    pub fn responses(&self) -> impl Iterator<Item = &MessageClass> {
        self.responses.values()
    }

    pub fn events(&self) -> impl Iterator<Item = &MessageClass> {
        self.events.values()
    }
}

/// Assembles a [`SchemaBundle`].
pub struct BundleBuilder {
    bundle: SchemaBundle,
}

impl BundleBuilder {
    pub fn new(
        feature_id: u16,
        version: u8,
        name: &'static str,
        category: FeatureCategory,
    ) -> Self {
        Self {
            bundle: SchemaBundle {
                feature_id,
                version,
                name,
                category,
                requests: BTreeMap::new(),
                responses: BTreeMap::new(),
                events: BTreeMap::new(),
            },
        }
    }

    /// Adds a function with its request and response layouts.
    pub fn function(
        mut self,
        index: u8,
        name: &'static str,
        request: &Arc<FieldTable>,
        response: &Arc<FieldTable>,
    ) -> Self {
        let request = self.class(index, name, MessageKind::Request, request, None);
        let response = self.class(index, name, MessageKind::Response, response, None);
        self.bundle.requests.insert(index, request);
        self.bundle.responses.insert(index, response);
        self
    }

    /// Adds an event, optionally delivered to a dedicated queue.
    pub fn event(
        mut self,
        index: u8,
        name: &'static str,
        table: &Arc<FieldTable>,
        queue: Option<QueueName>,
    ) -> Self {
        let event = self.class(index, name, MessageKind::Event, table, queue);
        self.bundle.events.insert(index, event);
        self
    }

    pub fn build(self) -> SchemaBundle {
        self.bundle
    }

    fn class(
        &self,
        index: u8,
        name: &'static str,
        kind: MessageKind,
        table: &Arc<FieldTable>,
        queue: Option<QueueName>,
    ) -> MessageClass {
        MessageClass {
            name,
            feature_id: self.bundle.feature_id,
            version: self.bundle.version,
            function_index: index,
            kind,
            table: Arc::clone(table),
            queue,
        }
    }
}

/// Produces the bundles of one feature, one per supported version.
pub type SchemaProvider = fn() -> Vec<SchemaBundle>;

/// Every feature module contributing schemas.
pub const PROVIDERS: &[SchemaProvider] = &[
    root::schemas,
    feature_set::schemas,
    unified_battery::schemas,
    vlp_root::schemas,
];

lazy_static! {
    static ref SCHEMAS: HashMap<(u16, u8), SchemaBundle> = {
        let mut map = HashMap::new();
        for provider in PROVIDERS {
            for bundle in provider() {
                let key = (bundle.feature_id, bundle.version);
                if map.insert(key, bundle).is_some() {
                    panic!("feature {:#06x} v{} is registered twice", key.0, key.1);
                }
            }
        }
        map
    };
}

/// Builds the schema map ahead of the first lookup.
pub fn init() {
    lazy_static::initialize(&SCHEMAS);
}

/// Looks up the bundle of an exact feature version.
///
/// Never substitutes another version of the same feature.
pub fn lookup(feature_id: u16, version: u8) -> Result<&'static SchemaBundle, SchemaError> {
    SCHEMAS
        .get(&(feature_id, version))
        .ok_or(SchemaError::UnknownFeature {
            feature_id,
            version,
        })
}

/// All registered versions of a feature, in ascending order.
pub fn versions(feature_id: u16) -> Vec<u8> {
    let mut versions: Vec<u8> = SCHEMAS
        .keys()
        .filter(|(id, _)| *id == feature_id)
        .map(|(_, version)| *version)
        .collect();
    versions.sort_unstable();
    versions
}

/// Represents an error returned by the schema factory.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaError {
    #[error("no schema is registered for feature {feature_id:#06x} v{version}")]
    UnknownFeature { feature_id: u16, version: u8 },

    #[error("feature {feature_id:#06x} v{version} has no function {function}")]
    UnknownFunction {
        feature_id: u16,
        version: u8,
        function: u8,
    },

    #[error("feature {feature_id:#06x} v{version} has no event {event}")]
    UnknownEvent {
        feature_id: u16,
        version: u8,
        event: u8,
    },
}

/// Represents a known HID++2.0 device feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KnownFeature {
    /// The name of the feature.
    /// This is usually a slightly modified version of the name found in
    /// Logitech's documentation.
    pub name: &'static str,

    pub category: FeatureCategory,
}

/// Looks up a feature by its ID.
pub fn known_feature(feature_id: u16) -> Option<KnownFeature> {
    KNOWN_FEATURES.get(&feature_id).copied()
}

/// The category of a feature.
///
/// Root and feature set are important; the rest follows the ID range.
pub fn category_of(feature_id: u16) -> FeatureCategory {
    match feature_id {
        0x0000 | 0x0001 | 0x0102 | 0x0103 => FeatureCategory::Important,
        0x2000..=0x2fff => FeatureCategory::Mouse,
        0x4000..=0x4fff => FeatureCategory::Keyboard,
        0x6000..=0x6fff => FeatureCategory::Touchpad,
        0x8000..=0x8fff => FeatureCategory::Gaming,
        0x9000..=0x9fff => FeatureCategory::Peripheral,
        _ => FeatureCategory::Common,
    }
}

const FEATURE_NAMES: &[(u16, &str)] = &[
    (0x0000, "Root"),
    (0x0001, "FeatureSet"),
    (0x0002, "FeatureInfo"),
    (0x0003, "DeviceInformation"),
    (0x0004, "UnitId"),
    (0x0005, "DeviceTypeAndName"),
    (0x0006, "DeviceGroups"),
    (0x0007, "DeviceFriendlyName"),
    (0x0008, "KeepAlive"),
    (0x0020, "ConfigChange"),
    (0x0021, "UniqueRandomId"),
    (0x0030, "TargetSoftware"),
    (0x0080, "WirelessSignalStrength"),
    (0x0102, "VlpRoot"),
    (0x0103, "VlpFeatureSet"),
    (0x00c0, "DfuControlLegacy"),
    (0x00c1, "DfuControlUnsigned"),
    (0x00c2, "DfuControlSigned"),
    (0x00c3, "DfuControl"),
    (0x00d0, "Dfu"),
    (0x1000, "BatteryStatus"),
    (0x1001, "BatteryVoltage"),
    (0x1004, "UnifiedBattery"),
    (0x1010, "ChargingControl"),
    (0x1300, "LedControl"),
    (0x1800, "GenericTest"),
    (0x1802, "DeviceReset"),
    (0x1805, "OobState"),
    (0x1806, "ConfigDeviceProps"),
    (0x1814, "ChangeHost"),
    (0x1815, "HostsInfo"),
    (0x1981, "Backlight1"),
    (0x1982, "Backlight2"),
    (0x1983, "Backlight3"),
    (0x1990, "Illumination"),
    (0x19a1, "ContextualDisplay"),
    (0x1a00, "PresenterControl"),
    (0x1b04, "ReprogControls5"),
    (0x1d4b, "WirelessDeviceStatus"),
    (0x1f20, "AdcMeasurement"),
    (0x2001, "SwapLeftRightButton"),
    (0x2110, "SmartShiftWheel"),
    (0x2111, "SmartShiftWheelEnhanced"),
    (0x2121, "HiResWheel"),
    (0x2150, "Thumbwheel"),
    (0x2201, "AdjustableDpi"),
    (0x2202, "ExtendedAdjustableDpi"),
    (0x2250, "XyStats"),
    (0x40a3, "FnInversionForMultiHostDevices"),
    (0x4220, "LockKeyState"),
    (0x4521, "DisableKeys"),
    (0x4522, "DisableKeysByUsage"),
    (0x4531, "MultiPlatform"),
    (0x4540, "KeyboardInternationalLayouts"),
    (0x6100, "TouchpadRawXy"),
    (0x6501, "Gestures2"),
    (0x8060, "AdjustableReportRate"),
    (0x8061, "ExtendedAdjustableReportRate"),
    (0x8071, "RgbEffects"),
    (0x8081, "PerKeyLighting2"),
    (0x8100, "OnboardProfiles"),
    (0x8110, "MouseButtonFilter"),
    (0x8300, "Sidetone"),
    (0x8310, "Equalizer"),
];

lazy_static! {
    static ref KNOWN_FEATURES: HashMap<u16, KnownFeature> = FEATURE_NAMES
        .iter()
        .map(|&(id, name)| (id, KnownFeature {
            name,
            category: category_of(id),
        }))
        .collect();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_bundles_are_registered() {
        init();

        assert_eq!(versions(0x0000), vec![0, 1, 2]);
        assert_eq!(versions(0x0001), vec![0, 1, 2]);
        assert_eq!(versions(0x1004), vec![0, 1]);
        assert_eq!(versions(0x0102), vec![0]);
    }

    #[test]
    fn never_substitutes_versions() {
        assert!(lookup(0x0000, 2).is_ok());
        assert_eq!(
            lookup(0x0000, 3).unwrap_err(),
            SchemaError::UnknownFeature {
                feature_id: 0x0000,
                version: 3
            }
        );
        assert!(matches!(
            lookup(0x1234, 0),
            Err(SchemaError::UnknownFeature { feature_id: 0x1234, .. })
        ));
    }

    #[test]
    fn classifies_events_before_responses() {
        let battery = lookup(0x1004, 0).unwrap();

        let event = battery.classify(0, 0).unwrap();
        assert_eq!(event.kind, MessageKind::Event);
        assert_eq!(event.queue, Some(QueueName::BatteryEvent));

        let response = battery.classify(0, 1).unwrap();
        assert_eq!(response.kind, MessageKind::Response);
        assert_eq!(response.name, "GetCapabilities");

        // Function 1 has no event, unsolicited traffic falls back to it.
        assert_eq!(battery.classify(1, 0).unwrap().kind, MessageKind::Response);
        assert!(battery.classify(7, 1).is_none());
    }

    #[test]
    fn every_class_agrees_with_its_bundle() {
        for &(id, _) in FEATURE_NAMES {
            for version in versions(id) {
                let bundle = lookup(id, version).unwrap();
                let classes = bundle
                    .requests()
                    .chain(bundle.responses())
                    .chain(bundle.events());
                for class in classes {
                    assert_eq!(class.feature_id, id);
                    assert_eq!(class.version, version);
                }
            }
        }
    }

    #[test]
    fn known_features_carry_categories() {
        let battery = known_feature(0x1004).unwrap();
        assert_eq!(battery.name, "UnifiedBattery");
        assert_eq!(battery.category, FeatureCategory::Common);

        assert_eq!(known_feature(0x0001).unwrap().category, FeatureCategory::Important);
        assert_eq!(known_feature(0x2121).unwrap().category, FeatureCategory::Mouse);
        assert_eq!(category_of(0x4540), FeatureCategory::Keyboard);
        assert_eq!(category_of(0x8100), FeatureCategory::Gaming);
        assert!(known_feature(0xfffe).is_none());
    }
}
