//! Tile-scoped object lookups

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::debug;

use crate::pyramid::PyramidLayout;

use super::geometry::{GeometryOps, tile_bounds};
use super::store::SegmentationStore;
use super::types::{MapobjectGeometry, SegmentationError, SpatialQuery};
use super::zoom::{ZoomMode, simplification_tolerance};

/// Answers "which objects are visible in map tile (x, y, z)"
pub struct SpatialQueryEngine {
    store: Arc<dyn SegmentationStore>,
    ops: Arc<dyn GeometryOps>,
    layout: PyramidLayout,
}

impl SpatialQueryEngine {
    /// `layout` is the pyramid the map tiles refer to
    pub fn new(store: Arc<dyn SegmentationStore>, ops: Arc<dyn GeometryOps>, layout: PyramidLayout) -> Self {
        Self { store, ops, layout }
    }

    pub fn layout(&self) -> &PyramidLayout {
        &self.layout
    }

    /// Objects of the requested layer intersecting the tile, as centroids or
    /// simplified outlines depending on the zoom level.
    ///
    /// Objects crossing tile borders are returned for every tile they touch.
    pub async fn query(&self, request: &SpatialQuery) -> Result<Vec<MapobjectGeometry>, SegmentationError> {
        let start = Instant::now();
        let key = request.layer();
        let layer = self.store.layer(key).await?;
        let thresholds = layer
            .thresholds
            .ok_or(SegmentationError::LayerNotFinalized(key))?;

        let mode = thresholds.mode(request.z);
        let results = match mode {
            ZoomMode::Suppressed => Vec::new(),
            ZoomMode::Centroids | ZoomMode::Polygons => {
                let bounds = tile_bounds(request.x, request.y, self.layout.tile_extent(request.z));
                let candidates = self.store.locate(key, bounds, mode).await?;
                if mode == ZoomMode::Centroids {
                    candidates
                        .iter()
                        .filter(|s| self.ops.point_intersects(&s.centroid, &bounds))
                        .map(|s| MapobjectGeometry {
                            mapobject_id: s.mapobject_id,
                            geometry: self.ops.point_to_exchange_format(&s.centroid),
                        })
                        .collect()
                } else {
                    let tolerance = simplification_tolerance(self.layout.max_zoom(), request.z);
                    candidates
                        .iter()
                        .filter(|s| self.ops.intersects(&s.polygon, &bounds))
                        .map(|s| MapobjectGeometry {
                            mapobject_id: s.mapobject_id,
                            geometry: self
                                .ops
                                .polygon_to_exchange_format(&self.ops.simplify(&s.polygon, tolerance)),
                        })
                        .collect()
                }
            }
        };

        let mode_label = match mode {
            ZoomMode::Suppressed => "suppressed",
            ZoomMode::Centroids => "centroids",
            ZoomMode::Polygons => "polygons",
        };
        counter!("tmaps_spatial_queries_total", "mode" => mode_label).increment(1);
        histogram!("tmaps_spatial_query_duration_seconds").record(start.elapsed());
        debug!(
            "Query {} tile ({}, {}, {}): {} objects as {}",
            key,
            request.x,
            request.y,
            request.z,
            results.len(),
            mode_label
        );
        Ok(results)
    }
}
