//! Zoom-dependent level of detail

use serde::{Deserialize, Serialize};

use super::types::StaticKind;

/// How objects of a layer are represented at a zoom level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoomMode {
    /// Nothing is returned
    Suppressed,
    /// One centroid point per object
    Centroids,
    /// Simplified outlines
    Polygons,
}

/// Zoom levels at which a layer switches representation.
///
/// Below `centroid` nothing is shown, from `centroid` centroids, from
/// `polygon` outlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoomThresholds {
    pub centroid: u32,
    pub polygon: u32,
}

impl ZoomThresholds {
    pub fn new(centroid: u32, polygon: u32) -> Self {
        Self { centroid, polygon }
    }

    /// Fixed thresholds of the built-in overlays; deeper types appear later
    pub fn for_static(kind: StaticKind) -> Self {
        match kind {
            StaticKind::Plates => Self::new(0, 0),
            StaticKind::Wells => Self::new(0, 2),
            StaticKind::Sites => Self::new(2, 4),
        }
    }

    /// Thresholds of a segmentation type for a pyramid with `max_zoom` as
    /// its highest level.
    ///
    /// Without polygon rendering the polygon threshold lies past the highest
    /// level, so outlines are never returned.
    pub fn for_segmentation(max_zoom: u32, polygons_requested: bool) -> Self {
        let polygon = if polygons_requested {
            max_zoom.saturating_sub(4)
        } else {
            max_zoom + 1
        };
        Self::new(polygon.saturating_sub(2), polygon)
    }

    pub fn mode(&self, zoom: u32) -> ZoomMode {
        if zoom < self.centroid {
            ZoomMode::Suppressed
        } else if zoom < self.polygon {
            ZoomMode::Centroids
        } else {
            ZoomMode::Polygons
        }
    }
}

/// Douglas-Peucker tolerance for outlines rendered at `zoom`: 1 at the
/// highest level, growing quadratically below it
pub fn simplification_tolerance(max_zoom: u32, zoom: u32) -> f64 {
    let steps = max_zoom.saturating_sub(zoom) as f64;
    steps * steps + 1.0
}
