//! Segmented objects and tile-scoped spatial lookups
//!
//! Outlines live in the same global pixel space as the pyramid tiles, with
//! the y axis inverted. Each segmentation layer decides per zoom level
//! whether objects are hidden, drawn as centroids or drawn as outlines.

pub mod geometry;
pub mod ingest;
pub mod integrity;
pub mod query;
pub mod static_objects;
pub mod store;
pub mod types;
pub mod zoom;

pub use geometry::{GeoOps, GeometryOps, tile_bounds};
pub use ingest::{IngestSummary, SegmentationIngestor, SiteObject, SiteSegmentation};
pub use integrity::{IntegrityReport, cleanup, sweep};
pub use query::SpatialQueryEngine;
pub use static_objects::{StaticOverlaySummary, build_static_overlays};
pub use store::{
    InMemorySegmentationStore, PartitionSnapshot, PurgeReport, SegmentationStore, finalize_layers,
};
pub use types::{
    Feature, FeatureId, FeatureValue, Mapobject, MapobjectGeometry, MapobjectId,
    MapobjectSegmentation, MapobjectType, MapobjectTypeId, SegmentationError, SegmentationLayer,
    SegmentationLayerKey, SpatialQuery, StaticKind,
};
pub use zoom::{ZoomMode, ZoomThresholds, simplification_tolerance};
