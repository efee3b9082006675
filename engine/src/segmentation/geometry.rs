//! Geometry operations behind a capability trait

use geo::line_intersection::{LineIntersection, line_intersection};
use geo::{Area, Centroid, Coord, Intersects, Line, LineString, Point, Polygon, Rect, Simplify};
use serde_json::{Value, json};

use crate::experiment::Offset;

use super::types::SegmentationError;

/// Geometry capability used by the segmentation store and query engine
pub trait GeometryOps: Send + Sync {
    /// Closed-boundary intersection of an outline with a rectangle
    fn intersects(&self, polygon: &Polygon<f64>, bounds: &Rect<f64>) -> bool;

    fn point_intersects(&self, point: &Point<f64>, bounds: &Rect<f64>) -> bool;

    /// Outline simplified for display; never returns an invalid ring
    fn simplify(&self, polygon: &Polygon<f64>, tolerance: f64) -> Polygon<f64>;

    fn centroid(&self, polygon: &Polygon<f64>) -> Option<Point<f64>>;

    /// Check that an outline can be indexed and rendered
    fn validate(&self, polygon: &Polygon<f64>) -> Result<(), SegmentationError>;

    /// Text representation of an outline sent to clients
    fn polygon_to_exchange_format(&self, polygon: &Polygon<f64>) -> String;

    fn point_to_exchange_format(&self, point: &Point<f64>) -> String;
}

/// [`GeometryOps`] backed by the `geo` crate, exchanging GeoJSON
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoOps;

impl GeometryOps for GeoOps {
    fn intersects(&self, polygon: &Polygon<f64>, bounds: &Rect<f64>) -> bool {
        polygon.intersects(bounds)
    }

    fn point_intersects(&self, point: &Point<f64>, bounds: &Rect<f64>) -> bool {
        let (min, max) = (bounds.min(), bounds.max());
        (min.x..=max.x).contains(&point.x()) && (min.y..=max.y).contains(&point.y())
    }

    fn simplify(&self, polygon: &Polygon<f64>, tolerance: f64) -> Polygon<f64> {
        let exterior = polygon.exterior().simplify(&tolerance);
        // Collapsed outlines keep their input shape
        if exterior.0.len() < 4 {
            return polygon.clone();
        }
        let interiors: Vec<LineString<f64>> = polygon
            .interiors()
            .iter()
            .map(|ring| ring.simplify(&tolerance))
            .filter(|ring| ring.0.len() >= 4)
            .collect();
        Polygon::new(exterior, interiors)
    }

    fn centroid(&self, polygon: &Polygon<f64>) -> Option<Point<f64>> {
        polygon.centroid()
    }

    fn validate(&self, polygon: &Polygon<f64>) -> Result<(), SegmentationError> {
        let exterior = polygon.exterior();
        if exterior.0.len() < 4 {
            return Err(SegmentationError::InvalidGeometry(format!(
                "exterior ring has {} coordinates, at least 4 required",
                exterior.0.len()
            )));
        }
        if !exterior.is_closed() {
            return Err(SegmentationError::InvalidGeometry("exterior ring is not closed".to_string()));
        }
        let all_finite = polygon
            .exterior()
            .coords()
            .chain(polygon.interiors().iter().flat_map(|ring| ring.coords()))
            .all(|c| c.x.is_finite() && c.y.is_finite());
        if !all_finite {
            return Err(SegmentationError::InvalidGeometry("non-finite coordinate".to_string()));
        }
        if polygon.unsigned_area() <= 0.0 {
            return Err(SegmentationError::InvalidGeometry("outline has no area".to_string()));
        }
        let crossing = std::iter::once(exterior)
            .chain(polygon.interiors().iter())
            .any(ring_self_intersects);
        if crossing {
            return Err(SegmentationError::InvalidGeometry("ring intersects itself".to_string()));
        }
        Ok(())
    }

    fn polygon_to_exchange_format(&self, polygon: &Polygon<f64>) -> String {
        let rings: Vec<Value> = std::iter::once(polygon.exterior())
            .chain(polygon.interiors().iter())
            .map(ring_coordinates)
            .collect();
        json!({ "type": "Polygon", "coordinates": rings }).to_string()
    }

    fn point_to_exchange_format(&self, point: &Point<f64>) -> String {
        json!({ "type": "Point", "coordinates": [point.x(), point.y()] }).to_string()
    }
}

/// Whether any two segments of a closed ring touch other than at the vertex
/// shared by consecutive segments
fn ring_self_intersects(ring: &LineString<f64>) -> bool {
    let mut coords: Vec<Coord<f64>> = ring.coords().copied().collect();
    coords.dedup();
    let segments: Vec<Line<f64>> = coords.windows(2).map(|w| Line::new(w[0], w[1])).collect();
    let n = segments.len();
    if n < 3 {
        return false;
    }
    for i in 0..n {
        for j in (i + 1)..n {
            let adjacent = j == i + 1 || (i == 0 && j == n - 1);
            match line_intersection(segments[i], segments[j]) {
                None => {}
                // Consecutive segments folding back onto each other
                Some(LineIntersection::Collinear { .. }) => return true,
                Some(LineIntersection::SinglePoint { .. }) if adjacent => {}
                Some(_) => return true,
            }
        }
    }
    false
}

fn ring_coordinates(ring: &LineString<f64>) -> Value {
    Value::Array(ring.coords().map(|c| json!([c.x, c.y])).collect())
}

/// Bounds of map tile `(x, y)` at a zoom level whose tiles span `extent`
/// full-resolution pixels, in the `(x, -y)` space geometries are stored in
pub fn tile_bounds(x: u32, y: u32, extent: u64) -> Rect<f64> {
    let extent = extent as f64;
    let min_x = x as f64 * extent;
    let max_y = -(y as f64 * extent);
    Rect::new(
        Coord { x: min_x, y: max_y - extent },
        Coord { x: min_x + extent, y: max_y },
    )
}

/// Outline given in pixel coordinates of a site image, moved to the global
/// `(x, -y)` space
pub fn polygon_from_local(coords: &[(f64, f64)], offset: Offset) -> Polygon<f64> {
    let (dx, dy) = (offset.x as f64, offset.y as f64);
    let exterior: Vec<Coord<f64>> = coords
        .iter()
        .map(|&(x, y)| Coord { x: x + dx, y: -(y + dy) })
        .collect();
    Polygon::new(LineString::from(exterior), vec![])
}

/// Axis-aligned outline of a pixel rectangle in the global `(x, -y)` space
pub fn rect_polygon(offset: Offset, height: u64, width: u64) -> Polygon<f64> {
    let (x0, y0) = (offset.x as f64, offset.y as f64);
    let (x1, y1) = (x0 + width as f64, y0 + height as f64);
    polygon_from_local(&[(x0, y0), (x1, y0), (x1, y1), (x0, y1), (x0, y0)], Offset::default())
}
