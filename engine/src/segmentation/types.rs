//! Segmentation-related types and error definitions

use std::fmt;

use geo::{Point, Polygon};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::experiment::ExperimentError;
use crate::experiment::types::id_type;
use crate::partition::{PartitionError, PartitionKey};

use super::zoom::ZoomThresholds;

/// Errors that can occur when storing or querying segmentations
#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("Mapobject type not found: {0}")]
    MapobjectTypeNotFound(MapobjectTypeId),

    #[error("Duplicate mapobject type: {0}")]
    DuplicateMapobjectType(String),

    #[error("Mapobject not found: {0}")]
    MapobjectNotFound(MapobjectId),

    #[error("Mapobject {mapobject} is of {actual}, layer expects {expected}")]
    MapobjectTypeMismatch {
        mapobject: MapobjectId,
        expected: MapobjectTypeId,
        actual: MapobjectTypeId,
    },

    #[error("Segmentation layer not found: {0}")]
    LayerNotFound(SegmentationLayerKey),

    #[error("Segmentation layer {0} is not finalized")]
    LayerNotFinalized(SegmentationLayerKey),

    #[error("Label {label} already used in partition {partition} of layer {layer}")]
    DuplicateLabel {
        layer: SegmentationLayerKey,
        partition: PartitionKey,
        label: u32,
    },

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Feature not found: {0}")]
    FeatureNotFound(FeatureId),

    #[error("Duplicate feature {name} for {type_id}")]
    DuplicateFeature { type_id: MapobjectTypeId, name: String },

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Experiment(#[from] ExperimentError),
}

id_type!(
    /// Identifier of a mapobject type
    MapobjectTypeId,
    "mapobject_type"
);
id_type!(
    /// Identifier of a mapobject
    MapobjectId,
    "mapobject"
);
id_type!(
    /// Identifier of a feature
    FeatureId,
    "feature"
);

/// Built-in overlay types mirroring the experiment layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StaticKind {
    Plates,
    Wells,
    Sites,
}

impl StaticKind {
    pub const ALL: [StaticKind; 3] = [StaticKind::Plates, StaticKind::Wells, StaticKind::Sites];

    pub fn name(&self) -> &'static str {
        match self {
            StaticKind::Plates => "Plates",
            StaticKind::Wells => "Wells",
            StaticKind::Sites => "Sites",
        }
    }

    /// Nesting depth below the experiment (plates are 0)
    pub fn depth(&self) -> u32 {
        match self {
            StaticKind::Plates => 0,
            StaticKind::Wells => 1,
            StaticKind::Sites => 2,
        }
    }
}

/// Named category of segmented objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapobjectType {
    pub id: MapobjectTypeId,
    pub name: String,
    /// Set for the built-in plate/well/site overlays
    pub static_kind: Option<StaticKind>,
}

impl MapobjectType {
    pub fn is_static(&self) -> bool {
        self.static_kind.is_some()
    }
}

/// One segmented instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapobject {
    pub id: MapobjectId,
    pub type_id: MapobjectTypeId,
    /// External record the object represents (e.g. the site of a Sites overlay)
    pub ref_id: Option<u64>,
    pub partition_key: PartitionKey,
}

/// Identifies one segmentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentationLayerKey {
    pub type_id: MapobjectTypeId,
    pub tpoint: u32,
    pub zplane: u32,
}

impl SegmentationLayerKey {
    pub fn new(type_id: MapobjectTypeId, tpoint: u32, zplane: u32) -> Self {
        Self {
            type_id,
            tpoint,
            zplane,
        }
    }
}

impl fmt::Display for SegmentationLayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/t{}/z{}", self.type_id, self.tpoint, self.zplane)
    }
}

/// Segmentations of one mapobject type at one time point and z-plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentationLayer {
    pub key: SegmentationLayerKey,
    /// Whether outlines should ever be rendered as polygons
    pub polygons_requested: bool,
    /// Set by finalization; queries need them
    pub thresholds: Option<ZoomThresholds>,
}

/// Outline of one mapobject in one layer, in global `(x, -y)` coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct MapobjectSegmentation {
    pub mapobject_id: MapobjectId,
    pub layer: SegmentationLayerKey,
    /// Label of the object in the segmentation image of its site
    pub label: u32,
    pub polygon: Polygon<f64>,
    pub centroid: Point<f64>,
    pub partition_key: PartitionKey,
}

/// Named scalar measured on objects of one type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub type_id: MapobjectTypeId,
    pub name: String,
}

/// Value of a feature for one mapobject at one time point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureValue {
    pub feature_id: FeatureId,
    pub mapobject_id: MapobjectId,
    pub tpoint: u32,
    pub value: f64,
    pub partition_key: PartitionKey,
}

/// Request for the objects visible in one map tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpatialQuery {
    pub type_id: MapobjectTypeId,
    /// Tile column
    pub x: u32,
    /// Tile row
    pub y: u32,
    /// Zoom level
    pub z: u32,
    pub tpoint: u32,
    pub zplane: u32,
}

impl SpatialQuery {
    pub fn layer(&self) -> SegmentationLayerKey {
        SegmentationLayerKey::new(self.type_id, self.tpoint, self.zplane)
    }
}

/// One query result: an object id and its geometry as GeoJSON text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapobjectGeometry {
    pub mapobject_id: MapobjectId,
    pub geometry: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_kind_names() {
        let names: Vec<&str> = StaticKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names, vec!["Plates", "Wells", "Sites"]);
        assert_eq!(StaticKind::Sites.depth(), 2);
    }

    #[test]
    fn test_layer_key_display() {
        let key = SegmentationLayerKey::new(MapobjectTypeId(4), 1, 0);
        assert_eq!(key.to_string(), "mapobject_type#4/t1/z0");
    }
}
