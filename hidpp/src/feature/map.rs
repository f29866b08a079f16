//! The per-device map from feature ID to feature index and version.
//!
//! Every device keeps two independent maps, one for HID++2.0 feature indices
//! and one for VLP feature indices. The root feature sits at index 0 of both
//! and is present from the start. Other entries are learned by probing the
//! root feature and are never replaced afterwards.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::RwLock;
use tracing::debug;

use super::{CreatableFeature, FeatureInformation, FeatureType, root::RootFeature, vlp_root::VlpRootFeature};
use crate::channel::{ChannelError, HidppChannel};

/// The feature ID of the HID++2.0 root feature.
pub const ROOT_FEATURE_ID: u16 = 0x0000;

/// The feature ID of the VLP root feature.
pub const VLP_ROOT_FEATURE_ID: u16 = 0x0102;

/// The root feature version assumed until told otherwise.
pub const DEFAULT_ROOT_VERSION: u8 = 2;

/// Which index space a map covers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum FeatureFamily {
    Hidpp20,
    Vlp,
}

impl FeatureFamily {
    pub fn root_feature_id(self) -> u16 {
        match self {
            Self::Hidpp20 => ROOT_FEATURE_ID,
            Self::Vlp => VLP_ROOT_FEATURE_ID,
        }
    }
}

/// A feature known to be present on a device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FeatureEntry {
    pub feature_id: u16,
    pub index: u8,
    pub version: u8,
    pub typ: FeatureType,
}

impl From<FeatureInformation> for FeatureEntry {
    fn from(info: FeatureInformation) -> Self {
        Self {
            feature_id: info.id,
            index: info.index,
            version: info.version,
            typ: info.typ,
        }
    }
}

/// The outcome of a feature lookup.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Lookup {
    Present(FeatureEntry),

    /// The device reported feature index 0.
    Absent,
}

impl Lookup {
    pub fn entry(self) -> Option<FeatureEntry> {
        match self {
            Self::Present(entry) => Some(entry),
            Self::Absent => None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    by_id: HashMap<u16, FeatureEntry>,
    by_index: BTreeMap<u8, u16>,
    absent: HashSet<u16>,
}

/// Maps feature IDs to indices for a single device.
#[derive(Debug)]
pub struct FeatureMap {
    device_index: u8,
    family: FeatureFamily,

    /// Whether probes reporting absence are remembered.
    tolerate_absence: AtomicBool,
    inner: RwLock<Inner>,
}

impl FeatureMap {
    /// Creates a map holding only the root feature.
    pub fn new(device_index: u8, family: FeatureFamily) -> Self {
        let map = Self {
            device_index,
            family,
            tolerate_absence: AtomicBool::new(false),
            inner: RwLock::new(Inner::default()),
        };
        map.insert(FeatureEntry {
            feature_id: family.root_feature_id(),
            index: 0,
            version: DEFAULT_ROOT_VERSION,
            typ: FeatureType::default(),
        });
        map
    }

    pub fn device_index(&self) -> u8 {
        self.device_index
    }

    pub fn family(&self) -> FeatureFamily {
        self.family
    }

    /// Overrides the version of the root feature.
    pub fn set_root_version(&self, version: u8) {
        let root = self.family.root_feature_id();
        if let Some(entry) = self.inner.write().by_id.get_mut(&root) {
            entry.version = version;
        }
    }

    /// Makes probes that report absence populate the map, so the same
    /// feature is not probed again.
    pub fn set_tolerate_absence(&self, tolerate: bool) {
        self.tolerate_absence.store(tolerate, Ordering::Relaxed);
    }

    /// The cached state of a feature, without probing.
    pub fn get(&self, feature_id: u16) -> Option<Lookup> {
        let inner = self.inner.read();
        if let Some(entry) = inner.by_id.get(&feature_id) {
            return Some(Lookup::Present(*entry));
        }
        inner.absent.contains(&feature_id).then_some(Lookup::Absent)
    }

    /// The feature at a given index.
    pub fn by_index(&self, index: u8) -> Option<FeatureEntry> {
        let inner = self.inner.read();
        inner
            .by_index
            .get(&index)
            .and_then(|id| inner.by_id.get(id))
            .copied()
    }

    /// Adds an entry and returns the one the map holds afterwards.
    ///
    /// A feature that is already present keeps its first entry.
    pub fn insert(&self, entry: FeatureEntry) -> FeatureEntry {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_id.get(&entry.feature_id) {
            if *existing != entry {
                debug!(
                    device_index = self.device_index,
                    feature_id = entry.feature_id,
                    kept = existing.index,
                    ignored = entry.index,
                    "feature is already mapped"
                );
            }
            return *existing;
        }

        debug!(
            device_index = self.device_index,
            family = ?self.family,
            feature_id = entry.feature_id,
            index = entry.index,
            version = entry.version,
            "mapped feature"
        );
        inner.absent.remove(&entry.feature_id);
        inner.by_index.insert(entry.index, entry.feature_id);
        inner.by_id.insert(entry.feature_id, entry);
        entry
    }

    /// Records that a feature is absent. Does nothing unless absence is
    /// tolerated or the feature is already present.
    pub fn mark_absent(&self, feature_id: u16) {
        if !self.tolerate_absence.load(Ordering::Relaxed) {
            return;
        }
        let mut inner = self.inner.write();
        if !inner.by_id.contains_key(&feature_id) {
            inner.absent.insert(feature_id);
        }
    }

    /// Every present feature ordered by index.
    pub fn entries(&self) -> Vec<FeatureEntry> {
        let inner = self.inner.read();
        inner
            .by_index
            .values()
            .filter_map(|id| inner.by_id.get(id))
            .copied()
            .collect()
    }

    /// Looks up a feature, probing the device through its root feature on a
    /// cache miss.
    pub async fn lookup(
        &self,
        chan: &Arc<HidppChannel>,
        feature_id: u16,
    ) -> Result<Lookup, ChannelError> {
        if let Some(cached) = self.get(feature_id) {
            return Ok(cached);
        }

        let probed = match self.family {
            FeatureFamily::Hidpp20 => {
                RootFeature::new(Arc::clone(chan), self.device_index, 0)
                    .get_feature(feature_id)
                    .await?
            },
            FeatureFamily::Vlp => {
                VlpRootFeature::new(Arc::clone(chan), self.device_index, 0)
                    .get_feature_index(feature_id)
                    .await?
            },
        };

        match probed {
            Some(info) => Ok(Lookup::Present(self.insert(info.into()))),
            None => {
                debug!(device_index = self.device_index, feature_id, "feature is absent");
                self.mark_absent(feature_id);
                Ok(Lookup::Absent)
            },
        }
    }

    /// Like [`Self::lookup`], failing with [`ChannelError::FeatureAbsent`]
    /// instead of returning [`Lookup::Absent`].
    pub async fn lookup_strict(
        &self,
        chan: &Arc<HidppChannel>,
        feature_id: u16,
    ) -> Result<FeatureEntry, ChannelError> {
        self.lookup(chan, feature_id)
            .await?
            .entry()
            .ok_or(ChannelError::FeatureAbsent(feature_id))
    }
}
