//! Implements the Root feature (ID `0x0000`) that every device supports by
//! default.

use std::sync::Arc;

use lazy_static::lazy_static;

use super::{
    CreatableFeature,
    Feature,
    FeatureCategory,
    FeatureInformation,
    FeatureType,
    map::DEFAULT_ROOT_VERSION,
    registry::{self, BundleBuilder, SchemaBundle},
};
use crate::{
    channel::{ChannelError, HidppChannel},
    codec::CodecError,
    container::{Container, FieldTable, TableBuilder},
    field::FieldDescriptor,
};

pub const FUNCTION_GET_FEATURE: u8 = 0;
pub const FUNCTION_GET_PROTOCOL_VERSION: u8 = 1;

lazy_static! {
    static ref GET_FEATURE: Arc<FieldTable> = TableBuilder::new("GetFeature")
        .field(FieldDescriptor::bits(1, "feature_id", 16).full_range())
        .field(FieldDescriptor::bits(2, "padding", 8).default_uint(0))
        .build();

    static ref GET_FEATURE_RESPONSE_V0: Arc<FieldTable> = TableBuilder::new("GetFeatureResponse")
        .field(FieldDescriptor::bits(1, "feature_index", 8).alias("feat_index"))
        .field(FieldDescriptor::bits(2, "obsolete", 1).alias("obsl"))
        .field(FieldDescriptor::bits(3, "hidden", 1))
        .field(FieldDescriptor::bits(4, "engineering", 1).alias("eng"))
        .field(FieldDescriptor::bits(5, "reserved", 5).default_uint(0))
        .build();

    static ref GET_FEATURE_RESPONSE_V1: Arc<FieldTable> = GET_FEATURE_RESPONSE_V0
        .derive("GetFeatureResponseV1")
        .field(FieldDescriptor::bits(6, "feature_version", 8).alias("feat_ver"))
        .build();

    static ref GET_FEATURE_RESPONSE_V2: Arc<FieldTable> = TableBuilder::new("GetFeatureResponseV2")
        .field(FieldDescriptor::bits(1, "feature_index", 8).alias("feat_index"))
        .field(FieldDescriptor::bits(2, "obsolete", 1).alias("obsl"))
        .field(FieldDescriptor::bits(3, "hidden", 1))
        .field(FieldDescriptor::bits(4, "engineering", 1).alias("eng"))
        .field(FieldDescriptor::bits(5, "manufacturing_deactivatable", 1).alias("manuf_deact"))
        .field(FieldDescriptor::bits(6, "compliance_deactivatable", 1).alias("compl_deact"))
        .field(FieldDescriptor::bits(7, "reserved", 3).default_uint(0))
        .field(FieldDescriptor::bits(8, "feature_version", 8).alias("feat_ver"))
        .build();

    static ref GET_PROTOCOL_VERSION: Arc<FieldTable> = TableBuilder::new("GetProtocolVersion")
        .field(FieldDescriptor::bits(1, "padding", 16).default_uint(0))
        .field(FieldDescriptor::bits(2, "ping_data", 8).default_uint(0))
        .build();

    static ref GET_PROTOCOL_VERSION_RESPONSE: Arc<FieldTable> =
        TableBuilder::new("GetProtocolVersionResponse")
            .field(FieldDescriptor::bits(1, "protocol_num", 8))
            .field(FieldDescriptor::bits(2, "target_sw", 8))
            .field(FieldDescriptor::bits(3, "ping_data", 8))
            .build();
}

/// The schema bundles of every supported root version.
///
/// Request layouts are shared, responses differ in their flags only.
pub fn schemas() -> Vec<SchemaBundle> {
    [
        (0, &*GET_FEATURE_RESPONSE_V0),
        (1, &*GET_FEATURE_RESPONSE_V1),
        (2, &*GET_FEATURE_RESPONSE_V2),
    ]
    .into_iter()
    .map(|(version, get_feature_response)| {
        BundleBuilder::new(RootFeature::ID, version, "Root", FeatureCategory::Important)
            .function(FUNCTION_GET_FEATURE, "GetFeature", &GET_FEATURE, get_feature_response)
            .function(
                FUNCTION_GET_PROTOCOL_VERSION,
                "GetProtocolVersion",
                &GET_PROTOCOL_VERSION,
                &GET_PROTOCOL_VERSION_RESPONSE,
            )
            .build()
    })
    .collect()
}

/// Reads a decoded `GetFeature` response.
///
/// Returns [`None`] for feature index 0, which marks the feature absent.
/// Versions without a version field report version 0.
pub fn read_feature_information(
    feature_id: u16,
    response: &Container,
) -> Result<Option<FeatureInformation>, CodecError> {
    let index = response.get_uint("feature_index")? as u8;
    if index == 0 {
        return Ok(None);
    }

    let (typ, version) = read_type_and_version(response)?;
    Ok(Some(FeatureInformation {
        id: feature_id,
        index,
        typ,
        version,
    }))
}

/// Reads the type flags and version of a feature information response.
///
/// Flags missing from the layout read as unset, a missing version as 0.
pub(crate) fn read_type_and_version(response: &Container) -> Result<(FeatureType, u8), CodecError> {
    let flag = |name: &str| -> Result<bool, CodecError> {
        match response.table().field(name) {
            Some(_) => response.get_bool(name),
            None => Ok(false),
        }
    };
    let version = match response.table().field("feature_version") {
        Some(_) => response.get_uint("feature_version")? as u8,
        None => 0,
    };

    let typ = FeatureType {
        obsolete: flag("obsolete")?,
        hidden: flag("hidden")?,
        engineering: flag("engineering")?,
        manufacturing_deactivatable: flag("manufacturing_deactivatable")?,
        compliance_deactivatable: flag("compliance_deactivatable")?,
    };
    Ok((typ, version))
}

/// Implements the `Root` / `0x0000` feature that every HID++2.0 device
/// supports by default.
#[derive(Clone)]
pub struct RootFeature {
    /// The underlying HID++ channel.
    chan: Arc<HidppChannel>,

    /// The index of the device to implement the feature for.
    device_index: u8,
}

impl CreatableFeature for RootFeature {
    const ID: u16 = 0x0000;
    const STARTING_VERSION: u8 = 0;

    fn new(chan: Arc<HidppChannel>, device_index: u8, _: u8) -> Self {
        Self {
            chan,
            device_index,
        }
    }
}

impl Feature for RootFeature {
}

impl RootFeature {
    /// The root version the device map assumes.
    fn version(&self) -> u8 {
        self.chan
            .dispatcher()
            .feature_map(self.device_index)
            .by_index(0)
            .map_or(DEFAULT_ROOT_VERSION, |entry| entry.version)
    }

    /// Retrieves information about a specific feature ID, including its index
    /// in the feature table, its type and its version.
    ///
    /// If the feature is not supported by the device, [`None`] is returned.
    ///
    /// If the device only supports the root feature version 0, the
    /// [`FeatureInformation::version`] field will be `0` for all features.
    pub async fn get_feature(&self, id: u16) -> Result<Option<FeatureInformation>, ChannelError> {
        let bundle = registry::lookup(Self::ID, self.version())?;
        let request = bundle
            .request(FUNCTION_GET_FEATURE)?
            .new_container()
            .with_uint("feature_id", id.into())?;

        let response = super::invoke(
            &self.chan,
            self.device_index,
            0,
            bundle,
            FUNCTION_GET_FEATURE,
            &request,
        )
        .await?;

        Ok(read_feature_information(id, &response)?)
    }

    /// Pings the device with an arbitrary data byte. The device will respond
    /// with the same data if communication succeeds.
    ///
    /// The underlying function also reports the protocol version, which
    /// [`crate::protocol::determine_version`] reads in a more general manner.
    pub async fn ping(&self, data: u8) -> Result<u8, ChannelError> {
        let bundle = registry::lookup(Self::ID, self.version())?;
        let request = bundle
            .request(FUNCTION_GET_PROTOCOL_VERSION)?
            .new_container()
            .with_uint("ping_data", data.into())?;

        let response = super::invoke(
            &self.chan,
            self.device_index,
            0,
            bundle,
            FUNCTION_GET_PROTOCOL_VERSION,
            &request,
        )
        .await?;

        Ok(response.get_uint("ping_data")? as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[test]
    fn encodes_the_feature_id_request() {
        let bundle = registry::lookup(0x0000, 2).unwrap();
        let request = bundle
            .request(FUNCTION_GET_FEATURE)
            .unwrap()
            .new_container()
            .with_uint("feature_id", 0x1000)
            .unwrap();

        assert_eq!(codec::encode_bytes(&request).unwrap(), vec![0x10, 0x00, 0x00]);
    }

    #[test]
    fn response_versions_differ_in_flags_only() {
        let payload = [0x05, 0b1001_1000, 0x03, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

        let v2 = registry::lookup(0x0000, 2).unwrap().response(0).unwrap();
        let info = read_feature_information(0x1004, &v2.decode(&payload).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(info.index, 0x05);
        assert_eq!(info.version, 3);
        assert!(info.typ.obsolete);
        assert!(info.typ.manufacturing_deactivatable);
        assert!(info.typ.compliance_deactivatable);

        let v0 = registry::lookup(0x0000, 0).unwrap().response(0).unwrap();
        let info = read_feature_information(0x1004, &v0.decode(&payload).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(info.version, 0);
        assert!(info.typ.obsolete);
        assert!(!info.typ.manufacturing_deactivatable);
    }

    #[test]
    fn index_zero_means_absent() {
        let v1 = registry::lookup(0x0000, 1).unwrap().response(0).unwrap();
        let response = v1.decode(&[0x00, 0x00, 0x00]).unwrap();
        assert_eq!(read_feature_information(0x1234, &response).unwrap(), None);
    }

    #[test]
    fn aliases_resolve_to_the_same_flag() {
        let v2 = registry::lookup(0x0000, 2).unwrap().response(0).unwrap();
        let mut response = v2.new_container();
        response.set_uint("manuf_deact", 1).unwrap();
        assert_eq!(response.get_uint("manufacturing_deactivatable").unwrap(), 1);
        response.set_uint("feat_ver", 4).unwrap();
        assert_eq!(response.get_uint("feature_version").unwrap(), 4);
    }
}
