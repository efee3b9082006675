//! Per-site segmentation ingestion
//!
//! Each unit of work covers one site at one time point: outlines are given in
//! the site's pixel coordinates and moved into the global map space. All
//! records of a unit share the site's partition key, so units never touch
//! each other's partitions and can run in parallel.

use std::collections::{HashMap, HashSet};

use futures_util::{StreamExt, TryStreamExt, stream};
use geo::Point;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::experiment::{ExperimentRegistry, SiteId};
use crate::grid::GridLayout;
use crate::partition::PartitionPolicy;

use super::geometry::{GeometryOps, polygon_from_local};
use super::store::SegmentationStore;
use super::types::{
    FeatureId, FeatureValue, MapobjectId, MapobjectSegmentation, MapobjectTypeId,
    SegmentationError, SegmentationLayerKey,
};

/// One object found in a site's segmentation image
#[derive(Debug, Clone, PartialEq)]
pub struct SiteObject {
    /// Label in the segmentation image, unique within the site
    pub label: u32,
    /// Outline in site pixel coordinates `(x, y)`
    pub outline: Vec<(f64, f64)>,
    pub features: Vec<(FeatureId, f64)>,
}

/// Segmentation result of one site at one time point and z-plane
#[derive(Debug, Clone, PartialEq)]
pub struct SiteSegmentation {
    pub site_id: SiteId,
    pub tpoint: u32,
    pub zplane: u32,
    pub objects: Vec<SiteObject>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub created: usize,
    pub updated: usize,
    /// Objects of a previous ingest whose label is gone from the batch
    pub removed: usize,
    pub invalid: usize,
    pub feature_values: usize,
    /// Omitted sites are not indexed
    pub skipped: bool,
}

/// Writes site segmentations of one mapobject type
pub struct SegmentationIngestor<'a> {
    registry: &'a ExperimentRegistry,
    grid: &'a GridLayout,
    store: &'a dyn SegmentationStore,
    ops: &'a dyn GeometryOps,
    policy: PartitionPolicy,
}

impl<'a> SegmentationIngestor<'a> {
    pub fn new(
        registry: &'a ExperimentRegistry,
        grid: &'a GridLayout,
        store: &'a dyn SegmentationStore,
        ops: &'a dyn GeometryOps,
        policy: PartitionPolicy,
    ) -> Self {
        Self {
            registry,
            grid,
            store,
            ops,
            policy,
        }
    }

    /// Ingest one site. Re-ingesting the same site replaces its
    /// segmentations in the layer: objects are matched by label, and labels
    /// missing from the new batch are removed.
    ///
    /// A batch repeating a label is rejected before anything is written.
    pub async fn ingest_site(
        &self,
        type_id: MapobjectTypeId,
        batch: &SiteSegmentation,
    ) -> Result<IngestSummary, SegmentationError> {
        let site = self.registry.site(batch.site_id)?;
        if site.omitted {
            debug!("Skipping segmentation of omitted {}", site.id);
            return Ok(IngestSummary {
                skipped: true,
                ..Default::default()
            });
        }

        let layer = SegmentationLayerKey::new(type_id, batch.tpoint, batch.zplane);
        self.store.layer(layer).await?;
        let key = self.policy.key_for_site(site.id);
        let offset = self.grid.site_offset(site.id)?;

        let mut labels = HashSet::new();
        if let Some(object) = batch.objects.iter().find(|o| !labels.insert(o.label)) {
            return Err(SegmentationError::DuplicateLabel {
                layer,
                partition: key,
                label: object.label,
            });
        }

        let segmentations = self
            .store
            .partition(key)
            .await
            .map(|p| p.segmentations)
            .unwrap_or_default();
        // Objects already ingested for this site, by label
        let existing: HashMap<u32, MapobjectId> = segmentations
            .iter()
            .filter(|s| s.layer == layer)
            .map(|s| (s.label, s.mapobject_id))
            .collect();

        let mut summary = IngestSummary::default();
        for object in &batch.objects {
            let mapobject_id = match existing.get(&object.label) {
                Some(id) => {
                    summary.updated += 1;
                    *id
                }
                None => {
                    summary.created += 1;
                    self.store.add_mapobject(type_id, None, key).await?.id
                }
            };

            let polygon = polygon_from_local(&object.outline, offset);
            if self.ops.validate(&polygon).is_err() {
                summary.invalid += 1;
            }
            let centroid = self
                .ops
                .centroid(&polygon)
                .unwrap_or_else(|| mean_point(&object.outline, offset.x as f64, offset.y as f64));

            self.store
                .put_segmentation(MapobjectSegmentation {
                    mapobject_id,
                    layer,
                    label: object.label,
                    polygon,
                    centroid,
                    partition_key: key,
                })
                .await?;

            for (feature_id, value) in &object.features {
                self.store
                    .put_feature_value(FeatureValue {
                        feature_id: *feature_id,
                        mapobject_id,
                        tpoint: batch.tpoint,
                        value: *value,
                        partition_key: key,
                    })
                    .await?;
                summary.feature_values += 1;
            }
        }

        summary.removed = self
            .remove_stale(layer, &existing, &labels, &segmentations)
            .await?;

        if summary.invalid > 0 {
            warn!(
                "{} of {} outlines of {} in {} are invalid",
                summary.invalid,
                batch.objects.len(),
                site.id,
                layer
            );
        }
        counter!("tmaps_mapobjects_ingested_total").increment((summary.created + summary.updated) as u64);
        debug!(
            "Ingested {} at t={}: {} created, {} updated, {} removed",
            site.id, batch.tpoint, summary.created, summary.updated, summary.removed
        );
        Ok(summary)
    }

    /// Drop the segmentations of labels a re-ingest no longer contains, and
    /// the mapobjects left without any segmentation
    async fn remove_stale(
        &self,
        layer: SegmentationLayerKey,
        existing: &HashMap<u32, MapobjectId>,
        labels: &HashSet<u32>,
        segmentations: &[MapobjectSegmentation],
    ) -> Result<usize, SegmentationError> {
        let mut removed = 0;
        let mut orphaned = Vec::new();
        for (label, mapobject_id) in existing {
            if labels.contains(label) {
                continue;
            }
            if self.store.delete_segmentation(layer, *mapobject_id).await? {
                removed += 1;
            }
            let elsewhere = segmentations
                .iter()
                .any(|s| s.mapobject_id == *mapobject_id && s.layer != layer);
            if !elsewhere {
                orphaned.push(*mapobject_id);
            }
        }
        if !orphaned.is_empty() {
            self.store.delete_mapobjects(&orphaned).await?;
        }
        Ok(removed)
    }

    /// Ingest many sites concurrently
    pub async fn ingest_all(
        &self,
        type_id: MapobjectTypeId,
        batches: &[SiteSegmentation],
        max_jobs: usize,
    ) -> Result<IngestSummary, SegmentationError> {
        let total = stream::iter(batches.iter())
            .map(|batch| self.ingest_site(type_id, batch))
            .buffer_unordered(max_jobs.max(1))
            .try_fold(IngestSummary::default(), |mut acc, s| async move {
                acc.created += s.created;
                acc.updated += s.updated;
                acc.removed += s.removed;
                acc.invalid += s.invalid;
                acc.feature_values += s.feature_values;
                Ok(acc)
            })
            .await?;
        info!(
            "Ingested {} sites: {} mapobjects created, {} updated, {} removed",
            batches.len(),
            total.created,
            total.updated,
            total.removed
        );
        Ok(total)
    }
}

/// Fallback centroid for outlines without area, in the `(x, -y)` space
fn mean_point(outline: &[(f64, f64)], dx: f64, dy: f64) -> Point<f64> {
    if outline.is_empty() {
        return Point::new(dx, -dy);
    }
    let n = outline.len() as f64;
    let (sx, sy) = outline
        .iter()
        .fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));
    Point::new(sx / n + dx, -(sy / n + dy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionConfig;
    use crate::partition::PartitionKey;
    use crate::segmentation::geometry::GeoOps;
    use crate::segmentation::store::InMemorySegmentationStore;
    use crate::test_utils::{registry_with_wells, square_outline, standard_grid};

    struct Fixture {
        registry: ExperimentRegistry,
        grid: GridLayout,
        store: InMemorySegmentationStore,
        policy: PartitionPolicy,
    }

    fn fixture() -> Fixture {
        let (registry, _) = registry_with_wells(96, (1, 2), (100, 100), &["A01"]);
        let grid = GridLayout::compute(&registry, &standard_grid()).unwrap();
        let policy = PartitionPolicy::new(&PartitionConfig::default());
        Fixture {
            registry,
            grid,
            store: InMemorySegmentationStore::new(policy),
            policy,
        }
    }

    async fn cells_layer(store: &InMemorySegmentationStore) -> MapobjectTypeId {
        let type_id = store.add_mapobject_type("Cells", None).await.unwrap();
        store
            .add_layer(SegmentationLayerKey::new(type_id, 0, 0), true)
            .await
            .unwrap();
        type_id
    }

    #[tokio::test]
    async fn test_ingest_moves_outlines_to_global_space() {
        let f = fixture();
        let type_id = cells_layer(&f.store).await;
        let right_site = f.registry.sites().nth(1).unwrap().id;
        let ingestor = SegmentationIngestor::new(&f.registry, &f.grid, &f.store, &GeoOps, f.policy);

        let batch = SiteSegmentation {
            site_id: right_site,
            tpoint: 0,
            zplane: 0,
            objects: vec![SiteObject {
                label: 1,
                outline: square_outline(10.0, 20.0, 10.0),
                features: vec![],
            }],
        };
        let summary = ingestor.ingest_site(type_id, &batch).await.unwrap();
        assert_eq!(summary.created, 1);

        let snapshot = f.store.partition(PartitionKey::Site(right_site)).await.unwrap();
        let segmentation = &snapshot.segmentations[0];
        // Site (0, 1) starts at x = 100
        assert!((segmentation.centroid.x() - 115.0).abs() < 1e-9);
        assert!((segmentation.centroid.y() + 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reingest_matches_labels() {
        let f = fixture();
        let type_id = cells_layer(&f.store).await;
        let feature = f.store.add_feature(type_id, "area").await.unwrap();
        let site = f.registry.sites().next().unwrap().id;
        let ingestor = SegmentationIngestor::new(&f.registry, &f.grid, &f.store, &GeoOps, f.policy);

        let batch = SiteSegmentation {
            site_id: site,
            tpoint: 0,
            zplane: 0,
            objects: vec![
                SiteObject {
                    label: 1,
                    outline: square_outline(0.0, 0.0, 5.0),
                    features: vec![(feature, 25.0)],
                },
                SiteObject {
                    label: 2,
                    outline: square_outline(50.0, 50.0, 5.0),
                    features: vec![(feature, 25.0)],
                },
            ],
        };
        ingestor.ingest_site(type_id, &batch).await.unwrap();
        let again = ingestor.ingest_site(type_id, &batch).await.unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(again.updated, 2);

        let snapshot = f.store.partition(PartitionKey::Site(site)).await.unwrap();
        assert_eq!(snapshot.mapobjects.len(), 2);
        assert_eq!(snapshot.segmentations.len(), 2);
        assert_eq!(snapshot.feature_values.len(), 2);
    }

    #[tokio::test]
    async fn test_reingest_removes_missing_labels() {
        let f = fixture();
        let type_id = cells_layer(&f.store).await;
        let feature = f.store.add_feature(type_id, "area").await.unwrap();
        let site = f.registry.sites().next().unwrap().id;
        let ingestor = SegmentationIngestor::new(&f.registry, &f.grid, &f.store, &GeoOps, f.policy);

        let object = |label: u32, x: f64| SiteObject {
            label,
            outline: square_outline(x, 0.0, 5.0),
            features: vec![(feature, 25.0)],
        };
        let mut batch = SiteSegmentation {
            site_id: site,
            tpoint: 0,
            zplane: 0,
            objects: vec![object(1, 0.0), object(2, 20.0), object(3, 40.0)],
        };
        ingestor.ingest_site(type_id, &batch).await.unwrap();

        batch.objects = vec![object(2, 20.0), object(4, 60.0)];
        let again = ingestor.ingest_site(type_id, &batch).await.unwrap();
        assert_eq!((again.created, again.updated, again.removed), (1, 1, 2));

        let snapshot = f.store.partition(PartitionKey::Site(site)).await.unwrap();
        let mut labels: Vec<u32> = snapshot.segmentations.iter().map(|s| s.label).collect();
        labels.sort();
        assert_eq!(labels, vec![2, 4]);
        assert_eq!(snapshot.mapobjects.len(), 2);
        assert_eq!(snapshot.feature_values.len(), 2);
    }

    #[tokio::test]
    async fn test_reingest_keeps_objects_segmented_in_other_layers() {
        let f = fixture();
        let type_id = cells_layer(&f.store).await;
        let upper = SegmentationLayerKey::new(type_id, 0, 1);
        f.store.add_layer(upper, true).await.unwrap();
        let site = f.registry.sites().next().unwrap().id;
        let ingestor = SegmentationIngestor::new(&f.registry, &f.grid, &f.store, &GeoOps, f.policy);

        let batch = SiteSegmentation {
            site_id: site,
            tpoint: 0,
            zplane: 0,
            objects: vec![SiteObject {
                label: 1,
                outline: square_outline(0.0, 0.0, 5.0),
                features: vec![],
            }],
        };
        ingestor.ingest_site(type_id, &batch).await.unwrap();
        let snapshot = f.store.partition(PartitionKey::Site(site)).await.unwrap();
        let mapobject_id = snapshot.segmentations[0].mapobject_id;
        f.store
            .put_segmentation(MapobjectSegmentation {
                layer: upper,
                ..snapshot.segmentations[0].clone()
            })
            .await
            .unwrap();

        let empty = SiteSegmentation {
            objects: vec![],
            ..batch
        };
        let summary = ingestor.ingest_site(type_id, &empty).await.unwrap();
        assert_eq!(summary.removed, 1);

        let snapshot = f.store.partition(PartitionKey::Site(site)).await.unwrap();
        assert_eq!(snapshot.segmentations.len(), 1);
        assert_eq!(snapshot.segmentations[0].layer, upper);
        assert!(f.store.mapobject(mapobject_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_label_rejected_before_writing() {
        let f = fixture();
        let type_id = cells_layer(&f.store).await;
        let site = f.registry.sites().next().unwrap().id;
        let ingestor = SegmentationIngestor::new(&f.registry, &f.grid, &f.store, &GeoOps, f.policy);

        let batch = SiteSegmentation {
            site_id: site,
            tpoint: 0,
            zplane: 0,
            objects: vec![
                SiteObject {
                    label: 7,
                    outline: square_outline(0.0, 0.0, 5.0),
                    features: vec![],
                },
                SiteObject {
                    label: 7,
                    outline: square_outline(50.0, 50.0, 5.0),
                    features: vec![],
                },
            ],
        };
        let result = ingestor.ingest_site(type_id, &batch).await;
        assert!(matches!(
            result,
            Err(SegmentationError::DuplicateLabel { label: 7, .. })
        ));
        assert!(f.store.mapobjects_of_type(type_id).await.is_empty());
        assert!(f.store.partition(PartitionKey::Site(site)).await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_outline_counted() {
        let f = fixture();
        let type_id = cells_layer(&f.store).await;
        let site = f.registry.sites().next().unwrap().id;
        let ingestor = SegmentationIngestor::new(&f.registry, &f.grid, &f.store, &GeoOps, f.policy);

        let batch = SiteSegmentation {
            site_id: site,
            tpoint: 0,
            zplane: 0,
            objects: vec![SiteObject {
                label: 7,
                outline: vec![(1.0, 1.0), (4.0, 1.0)],
                features: vec![],
            }],
        };
        let summary = ingestor.ingest_site(type_id, &batch).await.unwrap();
        assert_eq!(summary.invalid, 1);
        let snapshot = f.store.partition(PartitionKey::Site(site)).await.unwrap();
        assert!((snapshot.segmentations[0].centroid.x() - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_omitted_site_skipped() {
        let mut registry = crate::test_utils::empty_registry(96, (1, 1), (100, 100));
        let plate = registry.add_plate("plate").unwrap();
        let well = registry.add_well(plate, "A01").unwrap();
        let site = registry
            .add_site(well, 0, 0, crate::experiment::PixelSize::new(100, 100), true)
            .unwrap();
        let grid = GridLayout::compute(&registry, &standard_grid()).unwrap();
        let policy = PartitionPolicy::new(&PartitionConfig::default());
        let store = InMemorySegmentationStore::new(policy);
        let type_id = cells_layer(&store).await;
        let ingestor = SegmentationIngestor::new(&registry, &grid, &store, &GeoOps, policy);

        let batch = SiteSegmentation {
            site_id: site,
            tpoint: 0,
            zplane: 0,
            objects: vec![SiteObject {
                label: 1,
                outline: square_outline(0.0, 0.0, 5.0),
                features: vec![],
            }],
        };
        let summary = ingestor.ingest_site(type_id, &batch).await.unwrap();
        assert!(summary.skipped);
        assert!(store.partition(PartitionKey::Site(site)).await.is_none());
    }
}
