//! Cascading deletion of plates and whole experiments
//!
//! Dependent records go first: segmentation partitions, then tiles, and the
//! registry entries last. A failure part way leaves the registry intact, so
//! the deletion can simply be retried.

use thiserror::Error;
use tracing::info;

use crate::experiment::{ExperimentError, ExperimentRegistry, PlateId, RemovedPlate};
use crate::partition::{PartitionKey, PartitionPolicy};
use crate::pyramid::{PyramidError, TileStore};
use crate::segmentation::{PurgeReport, SegmentationError, SegmentationStore, StaticKind};

#[derive(Debug, Error)]
pub enum TeardownError {
    #[error(transparent)]
    Experiment(#[from] ExperimentError),

    #[error(transparent)]
    Pyramid(#[from] PyramidError),

    #[error(transparent)]
    Segmentation(#[from] SegmentationError),
}

/// What a deletion removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub removed: RemovedPlate,
    pub records: PurgeReport,
    pub tile_layers: usize,
    pub tiles: u64,
}

/// Partition keys of everything stored for a plate: its sites and the
/// static outlines of the plate and its wells
fn plate_partitions(
    registry: &ExperimentRegistry,
    plate_id: PlateId,
    policy: &PartitionPolicy,
) -> Vec<PartitionKey> {
    let mut keys = vec![policy.key_for_static(StaticKind::Plates.name(), plate_id.0)];
    for well in registry.wells_of(plate_id) {
        keys.push(policy.key_for_static(StaticKind::Wells.name(), well.id.0));
        keys.extend(registry.sites_of(well.id).map(|s| policy.key_for_site(s.id)));
    }
    keys
}

/// Drop every pyramid. Tiles span the whole overview, so they are stale as
/// soon as any plate goes away.
async fn delete_tiles(tiles: &dyn TileStore) -> Result<(usize, u64), PyramidError> {
    let layers = tiles.layers().await;
    let mut removed = 0;
    for layer in &layers {
        removed += tiles.delete_layer(*layer).await?;
    }
    Ok((layers.len(), removed))
}

/// Delete one plate with its wells, sites, mapobjects, segmentations,
/// feature values and all tiles.
///
/// The grid layout and pyramids must be recomputed afterwards.
pub async fn delete_plate(
    registry: &mut ExperimentRegistry,
    plate_id: PlateId,
    segmentations: &dyn SegmentationStore,
    tiles: &dyn TileStore,
    policy: &PartitionPolicy,
) -> Result<TeardownReport, TeardownError> {
    registry.plate(plate_id)?;

    let keys = plate_partitions(registry, plate_id, policy);
    let records = segmentations.delete_partitions(&keys).await?;
    let (tile_layers, tile_count) = delete_tiles(tiles).await?;
    let removed = registry.remove_plate(plate_id)?;

    info!(
        "Deleted {}: {} sites, {} mapobjects, {} tiles",
        plate_id,
        removed.site_ids.len(),
        records.mapobjects,
        tile_count
    );
    Ok(TeardownReport {
        removed,
        records,
        tile_layers,
        tiles: tile_count,
    })
}

/// Delete everything stored for an experiment, consuming its registry
pub async fn delete_experiment(
    registry: ExperimentRegistry,
    segmentations: &dyn SegmentationStore,
    tiles: &dyn TileStore,
) -> Result<TeardownReport, TeardownError> {
    let mut records = PurgeReport::default();
    for mapobject_type in segmentations.mapobject_types().await {
        let purged = segmentations.delete_mapobject_type(mapobject_type.id).await?;
        records.mapobjects += purged.mapobjects;
        records.segmentations += purged.segmentations;
        records.feature_values += purged.feature_values;
    }
    let (tile_layers, tile_count) = delete_tiles(tiles).await?;

    info!(
        "Deleted experiment '{}': {} plates, {} mapobjects, {} tiles",
        registry.name(),
        registry.plate_count(),
        records.mapobjects,
        tile_count
    );
    Ok(TeardownReport {
        removed: RemovedPlate::default(),
        records,
        tile_layers,
        tiles: tile_count,
    })
}
