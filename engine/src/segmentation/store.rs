//! Segmentation persistence and spatial indexing
//!
//! Records are grouped by partition key; everything written for one site
//! lives in one partition and can be read or purged together. Each
//! segmentation layer additionally keeps two R-trees (outline envelopes and
//! centroids) for tile-scoped lookups.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use geo::{BoundingRect, Rect};
use indexmap::IndexMap;
use metrics::counter;
use rstar::{AABB, RTree, RTreeObject};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::partition::{PartitionKey, PartitionPolicy};

use super::geometry::{GeoOps, GeometryOps};
use super::types::{
    Feature, FeatureId, FeatureValue, Mapobject, MapobjectId, MapobjectSegmentation,
    MapobjectType, MapobjectTypeId, SegmentationError, SegmentationLayer, SegmentationLayerKey,
    StaticKind,
};
use super::zoom::{ZoomMode, ZoomThresholds};

/// Records removed by a purge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub mapobjects: usize,
    pub segmentations: usize,
    pub feature_values: usize,
}

impl PurgeReport {
    fn add(&mut self, other: PurgeReport) {
        self.mapobjects += other.mapobjects;
        self.segmentations += other.segmentations;
        self.feature_values += other.feature_values;
    }
}

/// Everything stored under one partition key
#[derive(Debug, Clone, Default)]
pub struct PartitionSnapshot {
    pub mapobjects: Vec<Mapobject>,
    pub segmentations: Vec<MapobjectSegmentation>,
    pub feature_values: Vec<FeatureValue>,
}

/// Storage boundary for mapobjects, segmentations and feature values
#[async_trait]
pub trait SegmentationStore: Send + Sync {
    async fn add_mapobject_type(
        &self,
        name: &str,
        static_kind: Option<StaticKind>,
    ) -> Result<MapobjectTypeId, SegmentationError>;

    async fn mapobject_type(&self, id: MapobjectTypeId) -> Result<MapobjectType, SegmentationError>;

    async fn mapobject_type_by_name(&self, name: &str) -> Option<MapobjectType>;

    async fn mapobject_types(&self) -> Vec<MapobjectType>;

    /// Remove a type with its layers, features and objects
    async fn delete_mapobject_type(&self, id: MapobjectTypeId) -> Result<PurgeReport, SegmentationError>;

    /// Create a layer; creating an existing layer is a no-op
    async fn add_layer(&self, key: SegmentationLayerKey, polygons_requested: bool) -> Result<(), SegmentationError>;

    /// Fix the zoom thresholds of a layer, enabling queries
    async fn finalize_layer(
        &self,
        key: SegmentationLayerKey,
        thresholds: ZoomThresholds,
    ) -> Result<(), SegmentationError>;

    async fn layer(&self, key: SegmentationLayerKey) -> Result<SegmentationLayer, SegmentationError>;

    async fn layers(&self) -> Vec<SegmentationLayer>;

    async fn add_mapobject(
        &self,
        type_id: MapobjectTypeId,
        ref_id: Option<u64>,
        partition_key: PartitionKey,
    ) -> Result<Mapobject, SegmentationError>;

    async fn mapobject(&self, id: MapobjectId) -> Result<Mapobject, SegmentationError>;

    async fn mapobjects_of_type(&self, type_id: MapobjectTypeId) -> Vec<Mapobject>;

    /// Write a segmentation, replacing a previous one of the same mapobject
    /// in the same layer
    async fn put_segmentation(&self, segmentation: MapobjectSegmentation) -> Result<(), SegmentationError>;

    async fn segmentation(
        &self,
        layer: SegmentationLayerKey,
        mapobject_id: MapobjectId,
    ) -> Option<MapobjectSegmentation>;

    async fn segmentations_of_layer(&self, layer: SegmentationLayerKey) -> Vec<MapobjectSegmentation>;

    /// Segmentations whose indexed representation (outline envelope or
    /// centroid, depending on `mode`) intersects `bounds`. Candidates only;
    /// callers refine with an exact test.
    async fn locate(
        &self,
        layer: SegmentationLayerKey,
        bounds: Rect<f64>,
        mode: ZoomMode,
    ) -> Result<Vec<MapobjectSegmentation>, SegmentationError>;

    async fn add_feature(&self, type_id: MapobjectTypeId, name: &str) -> Result<FeatureId, SegmentationError>;

    async fn features_of_type(&self, type_id: MapobjectTypeId) -> Vec<Feature>;

    /// Write a feature value, replacing the previous value for the same
    /// (feature, mapobject, time point)
    async fn put_feature_value(&self, value: FeatureValue) -> Result<(), SegmentationError>;

    async fn feature_values(&self, mapobject_id: MapobjectId) -> Vec<FeatureValue>;

    async fn partition(&self, key: PartitionKey) -> Option<PartitionSnapshot>;

    /// Remove whole partitions
    async fn delete_partitions(&self, keys: &[PartitionKey]) -> Result<PurgeReport, SegmentationError>;

    /// Remove mapobjects with their segmentations and feature values
    async fn delete_mapobjects(&self, ids: &[MapobjectId]) -> Result<PurgeReport, SegmentationError>;

    /// Remove one segmentation, leaving its mapobject in place
    async fn delete_segmentation(
        &self,
        layer: SegmentationLayerKey,
        mapobject_id: MapobjectId,
    ) -> Result<bool, SegmentationError>;
}

/// Fix the thresholds of every layer for a pyramid whose highest level is
/// `max_zoom`. Built-in overlay types get their fixed thresholds.
pub async fn finalize_layers(store: &dyn SegmentationStore, max_zoom: u32) -> Result<usize, SegmentationError> {
    let layers = store.layers().await;
    for layer in &layers {
        let mapobject_type = store.mapobject_type(layer.key.type_id).await?;
        let thresholds = match mapobject_type.static_kind {
            Some(kind) => ZoomThresholds::for_static(kind),
            None => ZoomThresholds::for_segmentation(max_zoom, layer.polygons_requested),
        };
        store.finalize_layer(layer.key, thresholds).await?;
    }
    info!("Finalized {} segmentation layers for max zoom {}", layers.len(), max_zoom);
    Ok(layers.len())
}

#[derive(Debug, Clone, PartialEq)]
struct OutlineEntry {
    mapobject_id: MapobjectId,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for OutlineEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CentroidEntry {
    mapobject_id: MapobjectId,
    point: [f64; 2],
}

impl RTreeObject for CentroidEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.point)
    }
}

/// Index state of one segmentation. Invalid outlines keep their label but
/// have no tree entries.
struct IndexedSegmentation {
    label: (PartitionKey, u32),
    entries: Option<(OutlineEntry, CentroidEntry)>,
}

/// R-trees and label registry of one layer
#[derive(Default)]
struct LayerIndex {
    outlines: RTree<OutlineEntry>,
    centroids: RTree<CentroidEntry>,
    indexed: HashMap<MapobjectId, IndexedSegmentation>,
    labels: HashMap<(PartitionKey, u32), MapobjectId>,
}

impl LayerIndex {
    fn remove(&mut self, mapobject_id: MapobjectId) {
        let Some(previous) = self.indexed.remove(&mapobject_id) else {
            return;
        };
        self.labels.remove(&previous.label);
        if let Some((outline, centroid)) = previous.entries {
            self.outlines.remove(&outline);
            self.centroids.remove(&centroid);
        }
    }

    fn insert(
        &mut self,
        mapobject_id: MapobjectId,
        label: (PartitionKey, u32),
        entries: Option<(OutlineEntry, CentroidEntry)>,
    ) {
        if let Some((outline, centroid)) = &entries {
            self.outlines.insert(outline.clone());
            self.centroids.insert(centroid.clone());
        }
        self.labels.insert(label, mapobject_id);
        self.indexed.insert(mapobject_id, IndexedSegmentation { label, entries });
    }
}

#[derive(Debug, Default)]
struct Partition {
    mapobjects: IndexMap<MapobjectId, Mapobject>,
    segmentations: HashMap<(SegmentationLayerKey, MapobjectId), MapobjectSegmentation>,
    feature_values: HashMap<(FeatureId, MapobjectId, u32), FeatureValue>,
}

impl Partition {
    /// Remove a mapobject and everything attached to it
    fn take_mapobject(&mut self, id: MapobjectId) -> (PurgeReport, Vec<SegmentationLayerKey>) {
        let mut report = PurgeReport::default();
        if self.mapobjects.shift_remove(&id).is_some() {
            report.mapobjects = 1;
        }
        let layers: Vec<SegmentationLayerKey> = self
            .segmentations
            .keys()
            .filter(|(_, m)| *m == id)
            .map(|(layer, _)| *layer)
            .collect();
        for layer in &layers {
            self.segmentations.remove(&(*layer, id));
        }
        report.segmentations = layers.len();
        let before = self.feature_values.len();
        self.feature_values.retain(|(_, m, _), _| *m != id);
        report.feature_values = before - self.feature_values.len();
        (report, layers)
    }
}

/// Segmentation store held in memory
pub struct InMemorySegmentationStore {
    policy: PartitionPolicy,
    ops: Arc<dyn GeometryOps>,
    types: RwLock<IndexMap<MapobjectTypeId, MapobjectType>>,
    layers: DashMap<SegmentationLayerKey, SegmentationLayer>,
    indexes: DashMap<SegmentationLayerKey, Arc<RwLock<LayerIndex>>>,
    features: DashMap<FeatureId, Feature>,
    partitions: DashMap<PartitionKey, Partition>,
    /// Partition of every mapobject
    locations: DashMap<MapobjectId, PartitionKey>,
    next_id: AtomicU64,
}

impl InMemorySegmentationStore {
    pub fn new(policy: PartitionPolicy) -> Self {
        Self::with_geometry_ops(policy, Arc::new(GeoOps))
    }

    pub fn with_geometry_ops(policy: PartitionPolicy, ops: Arc<dyn GeometryOps>) -> Self {
        Self {
            policy,
            ops,
            types: RwLock::new(IndexMap::new()),
            layers: DashMap::new(),
            indexes: DashMap::new(),
            features: DashMap::new(),
            partitions: DashMap::new(),
            locations: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> &PartitionPolicy {
        &self.policy
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn index(&self, layer: SegmentationLayerKey) -> Result<Arc<RwLock<LayerIndex>>, SegmentationError> {
        self.indexes
            .get(&layer)
            .map(|entry| entry.value().clone())
            .ok_or(SegmentationError::LayerNotFound(layer))
    }

    fn lookup_segmentations(
        &self,
        layer: SegmentationLayerKey,
        ids: impl IntoIterator<Item = MapobjectId>,
    ) -> Vec<MapobjectSegmentation> {
        let mut found = Vec::new();
        for id in ids {
            let Some(key) = self.locations.get(&id).map(|e| *e.value()) else {
                continue;
            };
            if let Some(partition) = self.partitions.get(&key)
                && let Some(segmentation) = partition.segmentations.get(&(layer, id))
            {
                found.push(segmentation.clone());
            }
        }
        found.sort_by_key(|s| s.mapobject_id);
        found
    }

    /// Drop index entries of segmentations that were removed from partitions
    async fn unindex(&self, removed: HashMap<SegmentationLayerKey, Vec<MapobjectId>>) {
        for (layer, ids) in removed {
            let Some(index) = self.indexes.get(&layer).map(|e| e.value().clone()) else {
                continue;
            };
            let mut index = index.write().await;
            for id in ids {
                index.remove(id);
            }
        }
    }
}

#[async_trait]
impl SegmentationStore for InMemorySegmentationStore {
    async fn add_mapobject_type(
        &self,
        name: &str,
        static_kind: Option<StaticKind>,
    ) -> Result<MapobjectTypeId, SegmentationError> {
        let mut types = self.types.write().await;
        if types.values().any(|t| t.name == name) {
            return Err(SegmentationError::DuplicateMapobjectType(name.to_string()));
        }
        let id = MapobjectTypeId(self.allocate_id());
        types.insert(
            id,
            MapobjectType {
                id,
                name: name.to_string(),
                static_kind,
            },
        );
        debug!("Added mapobject type {} ({})", name, id);
        Ok(id)
    }

    async fn mapobject_type(&self, id: MapobjectTypeId) -> Result<MapobjectType, SegmentationError> {
        self.types
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SegmentationError::MapobjectTypeNotFound(id))
    }

    async fn mapobject_type_by_name(&self, name: &str) -> Option<MapobjectType> {
        self.types.read().await.values().find(|t| t.name == name).cloned()
    }

    async fn mapobject_types(&self) -> Vec<MapobjectType> {
        self.types.read().await.values().cloned().collect()
    }

    async fn delete_mapobject_type(&self, id: MapobjectTypeId) -> Result<PurgeReport, SegmentationError> {
        self.mapobject_type(id).await?;
        let ids: Vec<MapobjectId> = self.mapobjects_of_type(id).await.into_iter().map(|m| m.id).collect();
        let report = self.delete_mapobjects(&ids).await?;

        self.layers.retain(|key, _| key.type_id != id);
        self.indexes.retain(|key, _| key.type_id != id);
        self.features.retain(|_, feature| feature.type_id != id);
        self.types.write().await.shift_remove(&id);
        info!("Deleted mapobject type {} ({} mapobjects)", id, report.mapobjects);
        Ok(report)
    }

    async fn add_layer(&self, key: SegmentationLayerKey, polygons_requested: bool) -> Result<(), SegmentationError> {
        self.mapobject_type(key.type_id).await?;
        self.layers.entry(key).or_insert_with(|| SegmentationLayer {
            key,
            polygons_requested,
            thresholds: None,
        });
        self.indexes.entry(key).or_default();
        Ok(())
    }

    async fn finalize_layer(
        &self,
        key: SegmentationLayerKey,
        thresholds: ZoomThresholds,
    ) -> Result<(), SegmentationError> {
        let mut layer = self
            .layers
            .get_mut(&key)
            .ok_or(SegmentationError::LayerNotFound(key))?;
        layer.thresholds = Some(thresholds);
        debug!(
            "Finalized layer {}: centroids from zoom {}, polygons from zoom {}",
            key, thresholds.centroid, thresholds.polygon
        );
        Ok(())
    }

    async fn layer(&self, key: SegmentationLayerKey) -> Result<SegmentationLayer, SegmentationError> {
        self.layers
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or(SegmentationError::LayerNotFound(key))
    }

    async fn layers(&self) -> Vec<SegmentationLayer> {
        let mut layers: Vec<SegmentationLayer> = self.layers.iter().map(|e| e.value().clone()).collect();
        layers.sort_by_key(|l| l.key);
        layers
    }

    async fn add_mapobject(
        &self,
        type_id: MapobjectTypeId,
        ref_id: Option<u64>,
        partition_key: PartitionKey,
    ) -> Result<Mapobject, SegmentationError> {
        self.mapobject_type(type_id).await?;
        let mapobject = Mapobject {
            id: MapobjectId(self.allocate_id()),
            type_id,
            ref_id,
            partition_key,
        };
        self.partitions
            .entry(partition_key)
            .or_default()
            .mapobjects
            .insert(mapobject.id, mapobject.clone());
        self.locations.insert(mapobject.id, partition_key);
        Ok(mapobject)
    }

    async fn mapobject(&self, id: MapobjectId) -> Result<Mapobject, SegmentationError> {
        let key = self
            .locations
            .get(&id)
            .map(|e| *e.value())
            .ok_or(SegmentationError::MapobjectNotFound(id))?;
        self.partitions
            .get(&key)
            .and_then(|p| p.mapobjects.get(&id).cloned())
            .ok_or(SegmentationError::MapobjectNotFound(id))
    }

    async fn mapobjects_of_type(&self, type_id: MapobjectTypeId) -> Vec<Mapobject> {
        let mut found: Vec<Mapobject> = self
            .partitions
            .iter()
            .flat_map(|p| {
                p.mapobjects
                    .values()
                    .filter(|m| m.type_id == type_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        found.sort_by_key(|m| m.id);
        found
    }

    async fn put_segmentation(&self, segmentation: MapobjectSegmentation) -> Result<(), SegmentationError> {
        let layer = segmentation.layer;
        if !self.layers.contains_key(&layer) {
            return Err(SegmentationError::LayerNotFound(layer));
        }
        let mapobject = self.mapobject(segmentation.mapobject_id).await?;
        if mapobject.type_id != layer.type_id {
            return Err(SegmentationError::MapobjectTypeMismatch {
                mapobject: mapobject.id,
                expected: layer.type_id,
                actual: mapobject.type_id,
            });
        }
        if let Err(e) = self.policy.check(
            format!("segmentation of {}", mapobject.id),
            mapobject.partition_key,
            segmentation.partition_key,
        ) {
            counter!("tmaps_rejected_writes_total", "reason" => "partition_key").increment(1);
            warn!("Rejected segmentation write: {}", e);
            return Err(e.into());
        }

        let index = self.index(layer)?;
        let mut index = index.write().await;

        let label_key = (segmentation.partition_key, segmentation.label);
        if let Some(owner) = index.labels.get(&label_key)
            && *owner != mapobject.id
        {
            counter!("tmaps_rejected_writes_total", "reason" => "duplicate_label").increment(1);
            return Err(SegmentationError::DuplicateLabel {
                layer,
                partition: segmentation.partition_key,
                label: segmentation.label,
            });
        }

        let entries = match (
            self.ops.validate(&segmentation.polygon),
            segmentation.polygon.bounding_rect(),
        ) {
            (Ok(()), Some(rect)) => Some((
                OutlineEntry {
                    mapobject_id: mapobject.id,
                    envelope: AABB::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                },
                CentroidEntry {
                    mapobject_id: mapobject.id,
                    point: [segmentation.centroid.x(), segmentation.centroid.y()],
                },
            )),
            _ => {
                // Kept for the integrity sweep, never returned by queries
                warn!("Segmentation of {} in {} has invalid geometry", mapobject.id, layer);
                None
            }
        };
        index.remove(mapobject.id);
        index.insert(mapobject.id, label_key, entries);

        self.partitions
            .entry(segmentation.partition_key)
            .or_default()
            .segmentations
            .insert((layer, mapobject.id), segmentation);
        Ok(())
    }

    async fn segmentation(
        &self,
        layer: SegmentationLayerKey,
        mapobject_id: MapobjectId,
    ) -> Option<MapobjectSegmentation> {
        self.lookup_segmentations(layer, [mapobject_id]).into_iter().next()
    }

    async fn segmentations_of_layer(&self, layer: SegmentationLayerKey) -> Vec<MapobjectSegmentation> {
        let mut found: Vec<MapobjectSegmentation> = self
            .partitions
            .iter()
            .flat_map(|p| {
                p.segmentations
                    .values()
                    .filter(|s| s.layer == layer)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        found.sort_by_key(|s| s.mapobject_id);
        found
    }

    async fn locate(
        &self,
        layer: SegmentationLayerKey,
        bounds: Rect<f64>,
        mode: ZoomMode,
    ) -> Result<Vec<MapobjectSegmentation>, SegmentationError> {
        let index = self.index(layer)?;
        let envelope = AABB::from_corners([bounds.min().x, bounds.min().y], [bounds.max().x, bounds.max().y]);
        let ids: Vec<MapobjectId> = {
            let index = index.read().await;
            match mode {
                ZoomMode::Suppressed => Vec::new(),
                ZoomMode::Centroids => index
                    .centroids
                    .locate_in_envelope_intersecting(&envelope)
                    .map(|e| e.mapobject_id)
                    .collect(),
                ZoomMode::Polygons => index
                    .outlines
                    .locate_in_envelope_intersecting(&envelope)
                    .map(|e| e.mapobject_id)
                    .collect(),
            }
        };
        Ok(self.lookup_segmentations(layer, ids))
    }

    async fn add_feature(&self, type_id: MapobjectTypeId, name: &str) -> Result<FeatureId, SegmentationError> {
        self.mapobject_type(type_id).await?;
        if self
            .features
            .iter()
            .any(|f| f.type_id == type_id && f.name == name)
        {
            return Err(SegmentationError::DuplicateFeature {
                type_id,
                name: name.to_string(),
            });
        }
        let id = FeatureId(self.allocate_id());
        self.features.insert(
            id,
            Feature {
                id,
                type_id,
                name: name.to_string(),
            },
        );
        Ok(id)
    }

    async fn features_of_type(&self, type_id: MapobjectTypeId) -> Vec<Feature> {
        let mut features: Vec<Feature> = self
            .features
            .iter()
            .filter(|f| f.type_id == type_id)
            .map(|f| f.value().clone())
            .collect();
        features.sort_by_key(|f| f.id);
        features
    }

    async fn put_feature_value(&self, value: FeatureValue) -> Result<(), SegmentationError> {
        let feature_type = self
            .features
            .get(&value.feature_id)
            .map(|f| f.type_id)
            .ok_or(SegmentationError::FeatureNotFound(value.feature_id))?;
        let mapobject = self.mapobject(value.mapobject_id).await?;
        if mapobject.type_id != feature_type {
            return Err(SegmentationError::MapobjectTypeMismatch {
                mapobject: mapobject.id,
                expected: feature_type,
                actual: mapobject.type_id,
            });
        }
        if let Err(e) = self.policy.check(
            format!("feature value of {}", mapobject.id),
            mapobject.partition_key,
            value.partition_key,
        ) {
            counter!("tmaps_rejected_writes_total", "reason" => "partition_key").increment(1);
            return Err(e.into());
        }

        self.partitions
            .entry(value.partition_key)
            .or_default()
            .feature_values
            .insert((value.feature_id, value.mapobject_id, value.tpoint), value);
        Ok(())
    }

    async fn feature_values(&self, mapobject_id: MapobjectId) -> Vec<FeatureValue> {
        let Some(key) = self.locations.get(&mapobject_id).map(|e| *e.value()) else {
            return Vec::new();
        };
        let mut values: Vec<FeatureValue> = self
            .partitions
            .get(&key)
            .map(|p| {
                p.feature_values
                    .values()
                    .filter(|v| v.mapobject_id == mapobject_id)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        values.sort_by_key(|v| (v.feature_id, v.tpoint));
        values
    }

    async fn partition(&self, key: PartitionKey) -> Option<PartitionSnapshot> {
        let partition = self.partitions.get(&key)?;
        let mut segmentations: Vec<MapobjectSegmentation> = partition.segmentations.values().cloned().collect();
        segmentations.sort_by_key(|s| (s.layer, s.mapobject_id));
        let mut feature_values: Vec<FeatureValue> = partition.feature_values.values().copied().collect();
        feature_values.sort_by_key(|v| (v.mapobject_id, v.feature_id, v.tpoint));
        Some(PartitionSnapshot {
            mapobjects: partition.mapobjects.values().cloned().collect(),
            segmentations,
            feature_values,
        })
    }

    async fn delete_partitions(&self, keys: &[PartitionKey]) -> Result<PurgeReport, SegmentationError> {
        let mut report = PurgeReport::default();
        let mut removed: HashMap<SegmentationLayerKey, Vec<MapobjectId>> = HashMap::new();
        for key in keys {
            let Some((_, partition)) = self.partitions.remove(key) else {
                continue;
            };
            for id in partition.mapobjects.keys() {
                self.locations.remove(id);
            }
            for (layer, id) in partition.segmentations.keys() {
                removed.entry(*layer).or_default().push(*id);
            }
            report.add(PurgeReport {
                mapobjects: partition.mapobjects.len(),
                segmentations: partition.segmentations.len(),
                feature_values: partition.feature_values.len(),
            });
        }
        self.unindex(removed).await;
        debug!(
            "Purged {} partitions: {} mapobjects, {} segmentations, {} feature values",
            keys.len(),
            report.mapobjects,
            report.segmentations,
            report.feature_values
        );
        Ok(report)
    }

    async fn delete_mapobjects(&self, ids: &[MapobjectId]) -> Result<PurgeReport, SegmentationError> {
        let mut report = PurgeReport::default();
        let mut removed: HashMap<SegmentationLayerKey, Vec<MapobjectId>> = HashMap::new();
        for id in ids {
            let Some((_, key)) = self.locations.remove(id) else {
                continue;
            };
            let Some(mut partition) = self.partitions.get_mut(&key) else {
                continue;
            };
            let (taken, layers) = partition.take_mapobject(*id);
            report.add(taken);
            for layer in layers {
                removed.entry(layer).or_default().push(*id);
            }
        }
        self.partitions.retain(|_, p| !p.mapobjects.is_empty() || !p.segmentations.is_empty());
        self.unindex(removed).await;
        Ok(report)
    }

    async fn delete_segmentation(
        &self,
        layer: SegmentationLayerKey,
        mapobject_id: MapobjectId,
    ) -> Result<bool, SegmentationError> {
        let Some(key) = self.locations.get(&mapobject_id).map(|e| *e.value()) else {
            return Ok(false);
        };
        let removed = self
            .partitions
            .get_mut(&key)
            .and_then(|mut p| p.segmentations.remove(&(layer, mapobject_id)))
            .is_some();
        if removed {
            self.unindex(HashMap::from([(layer, vec![mapobject_id])])).await;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionConfig;
    use crate::experiment::{Offset, SiteId};
    use crate::partition::PartitionError;
    use crate::segmentation::geometry::{polygon_from_local, tile_bounds};
    use geo::{Centroid, Point};

    fn store() -> InMemorySegmentationStore {
        InMemorySegmentationStore::new(PartitionPolicy::new(&PartitionConfig::default()))
    }

    fn square_segmentation(
        mapobject: &Mapobject,
        layer: SegmentationLayerKey,
        label: u32,
        x: f64,
        y: f64,
    ) -> MapobjectSegmentation {
        let polygon = polygon_from_local(
            &[(x, y), (x + 10.0, y), (x + 10.0, y + 10.0), (x, y + 10.0)],
            Offset::default(),
        );
        let centroid = polygon.centroid().unwrap_or(Point::new(x, -y));
        MapobjectSegmentation {
            mapobject_id: mapobject.id,
            layer,
            label,
            polygon,
            centroid,
            partition_key: mapobject.partition_key,
        }
    }

    async fn setup(store: &InMemorySegmentationStore) -> SegmentationLayerKey {
        let type_id = store.add_mapobject_type("Cells", None).await.unwrap();
        let layer = SegmentationLayerKey::new(type_id, 0, 0);
        store.add_layer(layer, true).await.unwrap();
        layer
    }

    #[tokio::test]
    async fn test_duplicate_type_rejected() {
        let store = store();
        store.add_mapobject_type("Cells", None).await.unwrap();
        assert!(matches!(
            store.add_mapobject_type("Cells", None).await,
            Err(SegmentationError::DuplicateMapobjectType(_))
        ));
    }

    #[tokio::test]
    async fn test_put_and_locate() {
        let store = store();
        let layer = setup(&store).await;
        let key = PartitionKey::Site(SiteId(1));
        let a = store.add_mapobject(layer.type_id, None, key).await.unwrap();
        let b = store.add_mapobject(layer.type_id, None, key).await.unwrap();
        store.put_segmentation(square_segmentation(&a, layer, 1, 10.0, 10.0)).await.unwrap();
        store.put_segmentation(square_segmentation(&b, layer, 2, 300.0, 10.0)).await.unwrap();

        let found = store
            .locate(layer, tile_bounds(0, 0, 256), ZoomMode::Polygons)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].mapobject_id, a.id);

        let found = store
            .locate(layer, tile_bounds(1, 0, 256), ZoomMode::Centroids)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].mapobject_id, b.id);

        let none = store
            .locate(layer, tile_bounds(0, 0, 256), ZoomMode::Suppressed)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_rewrite_replaces_index_entry() {
        let store = store();
        let layer = setup(&store).await;
        let key = PartitionKey::Site(SiteId(1));
        let a = store.add_mapobject(layer.type_id, None, key).await.unwrap();
        store.put_segmentation(square_segmentation(&a, layer, 1, 10.0, 10.0)).await.unwrap();
        store.put_segmentation(square_segmentation(&a, layer, 1, 300.0, 10.0)).await.unwrap();

        let old = store.locate(layer, tile_bounds(0, 0, 256), ZoomMode::Polygons).await.unwrap();
        assert!(old.is_empty());
        let new = store.locate(layer, tile_bounds(1, 0, 256), ZoomMode::Polygons).await.unwrap();
        assert_eq!(new.len(), 1);
        assert_eq!(store.segmentations_of_layer(layer).await.len(), 1);
    }

    #[tokio::test]
    async fn test_partition_key_mismatch_rejected() {
        let store = store();
        let layer = setup(&store).await;
        let a = store
            .add_mapobject(layer.type_id, None, PartitionKey::Site(SiteId(1)))
            .await
            .unwrap();
        let mut segmentation = square_segmentation(&a, layer, 1, 0.0, 0.0);
        segmentation.partition_key = PartitionKey::Site(SiteId(2));

        let result = store.put_segmentation(segmentation).await;
        assert!(matches!(
            result,
            Err(SegmentationError::Partition(PartitionError::KeyMismatch { .. }))
        ));
        assert!(store.segmentation(layer, a.id).await.is_none());
    }

    #[tokio::test]
    async fn test_labels_unique_per_partition() {
        let store = store();
        let layer = setup(&store).await;
        let site1 = PartitionKey::Site(SiteId(1));
        let site2 = PartitionKey::Site(SiteId(2));
        let a = store.add_mapobject(layer.type_id, None, site1).await.unwrap();
        let b = store.add_mapobject(layer.type_id, None, site1).await.unwrap();
        let c = store.add_mapobject(layer.type_id, None, site2).await.unwrap();

        store.put_segmentation(square_segmentation(&a, layer, 5, 0.0, 0.0)).await.unwrap();
        assert!(matches!(
            store.put_segmentation(square_segmentation(&b, layer, 5, 0.0, 0.0)).await,
            Err(SegmentationError::DuplicateLabel { label: 5, .. })
        ));
        // Same label in another site is fine
        store.put_segmentation(square_segmentation(&c, layer, 5, 0.0, 0.0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_partition_holds_all_records() {
        let store = store();
        let layer = setup(&store).await;
        let key = PartitionKey::Site(SiteId(3));
        let a = store.add_mapobject(layer.type_id, None, key).await.unwrap();
        store.put_segmentation(square_segmentation(&a, layer, 1, 0.0, 0.0)).await.unwrap();
        let feature = store.add_feature(layer.type_id, "area").await.unwrap();
        store
            .put_feature_value(FeatureValue {
                feature_id: feature,
                mapobject_id: a.id,
                tpoint: 0,
                value: 100.0,
                partition_key: key,
            })
            .await
            .unwrap();

        let snapshot = store.partition(key).await.unwrap();
        assert_eq!(snapshot.mapobjects.len(), 1);
        assert_eq!(snapshot.segmentations.len(), 1);
        assert_eq!(snapshot.feature_values.len(), 1);

        let report = store.delete_partitions(&[key]).await.unwrap();
        assert_eq!(
            report,
            PurgeReport {
                mapobjects: 1,
                segmentations: 1,
                feature_values: 1
            }
        );
        assert!(store.partition(key).await.is_none());
        assert!(store.mapobject(a.id).await.is_err());
        let found = store.locate(layer, tile_bounds(0, 0, 256), ZoomMode::Polygons).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_geometry_is_stored_but_not_indexed() {
        let store = store();
        let layer = setup(&store).await;
        let a = store
            .add_mapobject(layer.type_id, None, PartitionKey::Site(SiteId(1)))
            .await
            .unwrap();
        let mut segmentation = square_segmentation(&a, layer, 1, 0.0, 0.0);
        segmentation.polygon = polygon_from_local(&[(0.0, 0.0), (5.0, 0.0)], Offset::default());
        store.put_segmentation(segmentation).await.unwrap();

        assert!(store.segmentation(layer, a.id).await.is_some());
        let found = store.locate(layer, tile_bounds(0, 0, 256), ZoomMode::Centroids).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_delete_mapobject_type_cascades() {
        let store = store();
        let layer = setup(&store).await;
        let a = store
            .add_mapobject(layer.type_id, None, PartitionKey::Site(SiteId(1)))
            .await
            .unwrap();
        store.put_segmentation(square_segmentation(&a, layer, 1, 0.0, 0.0)).await.unwrap();

        let report = store.delete_mapobject_type(layer.type_id).await.unwrap();
        assert_eq!(report.mapobjects, 1);
        assert_eq!(report.segmentations, 1);
        assert!(store.layers().await.is_empty());
        assert!(store.mapobject_types().await.is_empty());
    }
}
