//! Built-in overlays outlining plates, wells and sites

use tracing::info;

use crate::experiment::{ExperimentRegistry, PixelRect};
use crate::grid::GridLayout;
use crate::partition::{PartitionKey, PartitionPolicy};

use super::geometry::{GeometryOps, rect_polygon};
use super::store::SegmentationStore;
use super::types::{
    MapobjectSegmentation, MapobjectTypeId, SegmentationError, SegmentationLayerKey, StaticKind,
};

/// Number of outlines written per overlay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticOverlaySummary {
    pub plates: usize,
    pub wells: usize,
    pub sites: usize,
}

/// Create the Plates, Wells and Sites types and outline every registered
/// element at time point 0, z-plane 0.
///
/// Existing overlay types are dropped and rebuilt, so the overlays follow
/// the registry after a plate deletion. Omitted sites get no outline.
pub async fn build_static_overlays(
    registry: &ExperimentRegistry,
    grid: &GridLayout,
    store: &dyn SegmentationStore,
    ops: &dyn GeometryOps,
    policy: &PartitionPolicy,
) -> Result<StaticOverlaySummary, SegmentationError> {
    let mut summary = StaticOverlaySummary::default();

    for kind in StaticKind::ALL {
        if let Some(existing) = store.mapobject_type_by_name(kind.name()).await {
            store.delete_mapobject_type(existing.id).await?;
        }
        let type_id = store.add_mapobject_type(kind.name(), Some(kind)).await?;
        let layer = SegmentationLayerKey::new(type_id, 0, 0);
        store.add_layer(layer, true).await?;

        match kind {
            StaticKind::Plates => {
                for plate in registry.plates() {
                    let key = policy.key_for_static(kind.name(), plate.id.0);
                    let rect = grid.plate_rect(plate.id)?;
                    outline(store, ops, type_id, layer, plate.id.0, key, rect).await?;
                    summary.plates += 1;
                }
            }
            StaticKind::Wells => {
                for well in registry.wells() {
                    let key = policy.key_for_static(kind.name(), well.id.0);
                    let rect = grid.well_rect(well.id)?;
                    outline(store, ops, type_id, layer, well.id.0, key, rect).await?;
                    summary.wells += 1;
                }
            }
            StaticKind::Sites => {
                for site in registry.sites().filter(|s| !s.omitted) {
                    let key = policy.key_for_site(site.id);
                    let rect = grid.site_rect(site.id)?;
                    outline(store, ops, type_id, layer, site.id.0, key, rect).await?;
                    summary.sites += 1;
                }
            }
        }
    }

    info!(
        "Built static overlays: {} plates, {} wells, {} sites",
        summary.plates, summary.wells, summary.sites
    );
    Ok(summary)
}

async fn outline(
    store: &dyn SegmentationStore,
    ops: &dyn GeometryOps,
    type_id: MapobjectTypeId,
    layer: SegmentationLayerKey,
    ref_id: u64,
    partition_key: PartitionKey,
    rect: PixelRect,
) -> Result<(), SegmentationError> {
    let mapobject = store.add_mapobject(type_id, Some(ref_id), partition_key).await?;
    let polygon = rect_polygon(rect.offset, rect.size.height, rect.size.width);
    let centroid = ops
        .centroid(&polygon)
        .ok_or_else(|| SegmentationError::InvalidGeometry(format!("empty outline for {}", mapobject.id)))?;
    store
        .put_segmentation(MapobjectSegmentation {
            mapobject_id: mapobject.id,
            layer,
            // One outline per partition and layer
            label: 1,
            polygon,
            centroid,
            partition_key,
        })
        .await
}
