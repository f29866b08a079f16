//! Implements the FeatureSet feature (ID `0x0001`) that allow enumerating all
//! the features supported by a device.

use std::sync::Arc;

use lazy_static::lazy_static;

use super::{
    CreatableFeature,
    Feature,
    FeatureCategory,
    FeatureInformation,
    map::FeatureEntry,
    registry::{self, BundleBuilder, SchemaBundle},
    root,
};
use crate::{
    channel::{ChannelError, HidppChannel},
    container::{FieldTable, TableBuilder},
    field::FieldDescriptor,
};

pub const FUNCTION_GET_COUNT: u8 = 0;
pub const FUNCTION_GET_FEATURE_ID: u8 = 1;

lazy_static! {
    static ref GET_COUNT: Arc<FieldTable> = TableBuilder::new("GetCount")
        .field(FieldDescriptor::bytes(1, "padding", 3).default_uint(0))
        .build();

    static ref GET_COUNT_RESPONSE: Arc<FieldTable> = TableBuilder::new("GetCountResponse")
        .field(FieldDescriptor::bits(1, "count", 8))
        .build();

    static ref GET_FEATURE_ID: Arc<FieldTable> = TableBuilder::new("GetFeatureId")
        .field(FieldDescriptor::bits(1, "feature_index", 8).full_range())
        .field(FieldDescriptor::bits(2, "padding", 16).default_uint(0))
        .build();

    static ref GET_FEATURE_ID_RESPONSE_V0: Arc<FieldTable> = TableBuilder::new("GetFeatureIdResponse")
        .field(FieldDescriptor::bits(1, "feature_id", 16))
        .field(FieldDescriptor::bits(2, "obsolete", 1).alias("obsl"))
        .field(FieldDescriptor::bits(3, "hidden", 1).alias("sw_hidden"))
        .field(FieldDescriptor::bits(4, "engineering", 1).alias("engineering_hidden"))
        .field(FieldDescriptor::bits(5, "reserved", 5).default_uint(0))
        .build();

    static ref GET_FEATURE_ID_RESPONSE_V1: Arc<FieldTable> = GET_FEATURE_ID_RESPONSE_V0
        .derive("GetFeatureIdResponseV1")
        .field(FieldDescriptor::bits(6, "feature_version", 8))
        .build();

    static ref GET_FEATURE_ID_RESPONSE_V2: Arc<FieldTable> = TableBuilder::new("GetFeatureIdResponseV2")
        .field(FieldDescriptor::bits(1, "feature_id", 16))
        .field(FieldDescriptor::bits(2, "obsolete", 1).alias("obsl"))
        .field(FieldDescriptor::bits(3, "hidden", 1).alias("sw_hidden"))
        .field(FieldDescriptor::bits(4, "engineering", 1).alias("engineering_hidden"))
        .field(FieldDescriptor::bits(5, "manufacturing_deactivatable", 1))
        .field(FieldDescriptor::bits(6, "compliance_deactivatable", 1))
        .field(FieldDescriptor::bits(7, "reserved", 3).default_uint(0))
        .field(FieldDescriptor::bits(8, "feature_version", 8))
        .build();
}

pub fn schemas() -> Vec<SchemaBundle> {
    [
        (0, &*GET_FEATURE_ID_RESPONSE_V0),
        (1, &*GET_FEATURE_ID_RESPONSE_V1),
        (2, &*GET_FEATURE_ID_RESPONSE_V2),
    ]
    .into_iter()
    .map(|(version, get_feature_id_response)| {
        BundleBuilder::new(
            FeatureSetFeature::ID,
            version,
            "FeatureSet",
            FeatureCategory::Important,
        )
        .function(FUNCTION_GET_COUNT, "GetCount", &GET_COUNT, &GET_COUNT_RESPONSE)
        .function(
            FUNCTION_GET_FEATURE_ID,
            "GetFeatureId",
            &GET_FEATURE_ID,
            get_feature_id_response,
        )
        .build()
    })
    .collect()
}

/// Implements the `FeatureSet` / `0x0001` feature.
///
/// This feature is primarily used to collect all features supported by the
/// device. To achieve this, call [`Self::count`] to retrieve the amount of
/// supported features (excluding the root feature). Then call
/// [`Self::get_feature`] for every `i in 1..=count` (1-based, as accessing the
/// root feature is not allowed), or let [`Self::enumerate`] do both.
#[derive(Clone)]
pub struct FeatureSetFeature {
    /// The underlying HID++ channel.
    chan: Arc<HidppChannel>,

    /// The index of the device to implement the feature for.
    device_index: u8,

    /// The index of the feature in the feature table.
    feature_index: u8,
}

impl CreatableFeature for FeatureSetFeature {
    const ID: u16 = 0x0001;
    const STARTING_VERSION: u8 = 0;

    fn new(chan: Arc<HidppChannel>, device_index: u8, feature_index: u8) -> Self {
        Self {
            chan,
            device_index,
            feature_index,
        }
    }
}

impl Feature for FeatureSetFeature {
}

impl FeatureSetFeature {
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

    /// Retrieves the amount of features supported by the device, not including
    /// the root feature.
    pub async fn count(&self) -> Result<u8, ChannelError> {
        let bundle = self.bundle()?;
        let request = bundle.request(FUNCTION_GET_COUNT)?.new_container();

        let response = super::invoke(
            &self.chan,
            self.device_index,
            self.feature_index,
            bundle,
            FUNCTION_GET_COUNT,
            &request,
        )
        .await?;

        Ok(response.get_uint("count")? as u8)
    }

    /// Retrieves the information about a specific feature based on its index in
    /// the feature table.
    ///
    /// Feature index `0` for the root feature is not allowed.
    pub async fn get_feature(&self, index: u8) -> Result<FeatureInformation, ChannelError> {
        let bundle = self.bundle()?;
        let request = bundle
            .request(FUNCTION_GET_FEATURE_ID)?
            .new_container()
            .with_uint("feature_index", index.into())?;

        let response = super::invoke(
            &self.chan,
            self.device_index,
            self.feature_index,
            bundle,
            FUNCTION_GET_FEATURE_ID,
            &request,
        )
        .await?;

        let (typ, version) = root::read_type_and_version(&response)?;
        Ok(FeatureInformation {
            id: response.get_uint("feature_id")? as u16,
            index,
            typ,
            version,
        })
    }

    /// Retrieves every feature of the device and records it in the device's
    /// feature map.
    pub async fn enumerate(&self) -> Result<Vec<FeatureEntry>, ChannelError> {
        let count = self.count().await?;
        let map = self.chan.dispatcher().feature_map(self.device_index);

        let mut entries = Vec::with_capacity(usize::from(count));
        for index in 1..=count {
            let info = self.get_feature(index).await?;
            entries.push(map.insert(info.into()));
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[test]
    fn v2_adds_deactivation_flags() {
        let v2 = registry::lookup(0x0001, 2).unwrap().response(1).unwrap();
        assert_eq!(v2.table.static_bit_length(), Some(32));

        let response = v2.decode(&[0x10, 0x04, 0b0101_1000, 0x02]).unwrap();
        let (typ, version) = root::read_type_and_version(&response).unwrap();
        assert_eq!(response.get_uint("feature_id").unwrap(), 0x1004);
        assert!(typ.hidden);
        assert!(typ.manufacturing_deactivatable);
        assert!(typ.compliance_deactivatable);
        assert_eq!(version, 2);
    }

    #[test]
    fn requests_put_the_index_first() {
        let request = registry::lookup(0x0001, 0)
            .unwrap()
            .request(FUNCTION_GET_FEATURE_ID)
            .unwrap()
            .new_container()
            .with_uint("feature_index", 0x05)
            .unwrap();

        assert_eq!(codec::encode_bytes(&request).unwrap(), vec![0x05, 0x00, 0x00]);
        assert_eq!(request.get_uint("feature_index").unwrap(), 5);
    }
}
