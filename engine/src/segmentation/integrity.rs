//! Detection and cleanup of broken segmentation records
//!
//! Invalid outlines are stored but never indexed, so queries skip them
//! silently. The sweep finds them, along with mapobjects that have no
//! segmentation in any layer of their type.

use std::collections::HashSet;

use tracing::{info, warn};

use super::geometry::GeometryOps;
use super::store::{PurgeReport, SegmentationStore};
use super::types::{MapobjectId, SegmentationError, SegmentationLayerKey};

/// Findings of an integrity sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Segmentations whose outline fails validation
    pub invalid_geometries: Vec<(SegmentationLayerKey, MapobjectId)>,
    /// Mapobjects without any segmentation
    pub orphaned_mapobjects: Vec<MapobjectId>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.invalid_geometries.is_empty() && self.orphaned_mapobjects.is_empty()
    }
}

pub async fn sweep(
    store: &dyn SegmentationStore,
    ops: &dyn GeometryOps,
) -> Result<IntegrityReport, SegmentationError> {
    let mut report = IntegrityReport::default();
    let layers = store.layers().await;

    let mut segmented = HashSet::new();
    for layer in &layers {
        for segmentation in store.segmentations_of_layer(layer.key).await {
            if let Err(e) = ops.validate(&segmentation.polygon) {
                warn!("{} in {}: {}", segmentation.mapobject_id, layer.key, e);
                report.invalid_geometries.push((layer.key, segmentation.mapobject_id));
            }
            segmented.insert(segmentation.mapobject_id);
        }
    }

    for mapobject_type in store.mapobject_types().await {
        for mapobject in store.mapobjects_of_type(mapobject_type.id).await {
            if !segmented.contains(&mapobject.id) {
                report.orphaned_mapobjects.push(mapobject.id);
            }
        }
    }

    info!(
        "Integrity sweep over {} layers: {} invalid geometries, {} orphaned mapobjects",
        layers.len(),
        report.invalid_geometries.len(),
        report.orphaned_mapobjects.len()
    );
    Ok(report)
}

/// Remove invalid segmentations, then every mapobject left without one
pub async fn cleanup(
    store: &dyn SegmentationStore,
    ops: &dyn GeometryOps,
) -> Result<PurgeReport, SegmentationError> {
    let found = sweep(store, ops).await?;
    let mut removed_segmentations = 0;
    for (layer, mapobject_id) in &found.invalid_geometries {
        if store.delete_segmentation(*layer, *mapobject_id).await? {
            removed_segmentations += 1;
        }
    }

    // Removing invalid outlines can orphan further mapobjects
    let remaining = sweep(store, ops).await?;
    let mut report = store.delete_mapobjects(&remaining.orphaned_mapobjects).await?;
    report.segmentations += removed_segmentations;
    info!(
        "Integrity cleanup removed {} segmentations and {} mapobjects",
        report.segmentations, report.mapobjects
    );
    Ok(report)
}
