//! Implements the VLP root feature (ID `0x0102`), the VLP counterpart of
//! the HID++2.0 root feature. It always sits at VLP feature index 0.

use std::sync::Arc;

use lazy_static::lazy_static;

use super::{
    CreatableFeature,
    Feature,
    FeatureCategory,
    FeatureInformation,
    FeatureType,
    registry::{self, BundleBuilder, SchemaBundle},
};
use crate::{
    channel::{ChannelError, HidppChannel},
    container::{FieldTable, TableBuilder},
    field::FieldDescriptor,
};

pub const FUNCTION_GET_FEATURE_INDEX: u8 = 0;

lazy_static! {
    static ref GET_FEATURE_INDEX: Arc<FieldTable> = TableBuilder::new("GetFeatureIndex")
        .field(FieldDescriptor::bits(1, "feature_id", 16).full_range())
        .build();

    static ref GET_FEATURE_INDEX_RESPONSE: Arc<FieldTable> =
        TableBuilder::new("GetFeatureIndexResponse")
            .field(FieldDescriptor::bits(1, "feature_id", 16))
            .field(FieldDescriptor::bits(2, "feature_index", 8).alias("feature_idx"))
            .field(FieldDescriptor::bits(3, "reserved_0", 6).default_uint(0))
            .field(FieldDescriptor::bits(4, "hidden", 1))
            .field(FieldDescriptor::bits(5, "reserved_1", 1).default_uint(0))
            .field(FieldDescriptor::bits(6, "feature_version", 8))
            .field(FieldDescriptor::bits(7, "feature_max_memory", 16).optional())
            .build();
}

pub fn schemas() -> Vec<SchemaBundle> {
    vec![
        BundleBuilder::new(VlpRootFeature::ID, 0, "VlpRoot", FeatureCategory::Important)
            .function(
                FUNCTION_GET_FEATURE_INDEX,
                "GetFeatureIndex",
                &GET_FEATURE_INDEX,
                &GET_FEATURE_INDEX_RESPONSE,
            )
            .build(),
    ]
}

/// Implements the `VlpRoot` / `0x0102` feature.
#[derive(Clone)]
pub struct VlpRootFeature {
    chan: Arc<HidppChannel>,
    device_index: u8,
}

impl CreatableFeature for VlpRootFeature {
    const ID: u16 = 0x0102;
    const STARTING_VERSION: u8 = 0;

    fn new(chan: Arc<HidppChannel>, device_index: u8, _: u8) -> Self {
        Self {
            chan,
            device_index,
        }
    }
}

impl Feature for VlpRootFeature {
}

impl VlpRootFeature {
    /// Retrieves the VLP feature index of a feature ID.
    ///
    /// Returns [`None`] if the device does not support the feature over VLP.
    pub async fn get_feature_index(
        &self,
        id: u16,
    ) -> Result<Option<FeatureInformation>, ChannelError> {
        let bundle = registry::lookup(Self::ID, 0)?;
        let request = bundle
            .request(FUNCTION_GET_FEATURE_INDEX)?
            .new_container()
            .with_uint("feature_id", id.into())?;

        let response = super::invoke_vlp(
            &self.chan,
            self.device_index,
            0,
            bundle,
            FUNCTION_GET_FEATURE_INDEX,
            &request,
        )
        .await?;

        let index = response.get_uint("feature_index")? as u8;
        if index == 0 {
            return Ok(None);
        }

        Ok(Some(FeatureInformation {
            id,
            index,
            typ: FeatureType {
                hidden: response.get_bool("hidden")?,
                ..FeatureType::default()
            },
            version: response.get_uint("feature_version")? as u8,
        }))
    }
}
