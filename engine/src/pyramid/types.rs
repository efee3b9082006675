//! Pyramid-related types and error definitions

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::experiment::{ChannelId, ExperimentError, PixelSize, SiteId};

/// Errors that can occur while laying out or building a pyramid
#[derive(Debug, Error)]
pub enum PyramidError {
    #[error("Invalid tile size: {0}")]
    InvalidTileSize(u32),

    #[error("Invalid zoom factor: {0}")]
    InvalidZoomFactor(u32),

    #[error("Cannot build a pyramid for an empty image ({0})")]
    EmptyImage(PixelSize),

    #[error("Invalid level: {0}")]
    InvalidLevel(u32),

    #[error("Invalid tile coordinates: level={level}, row={row}, col={col}")]
    InvalidTileCoordinates { level: u32, row: u32, col: u32 },

    #[error("Source image of {site} is {actual}, expected {expected}")]
    SourceImageSize {
        site: SiteId,
        expected: PixelSize,
        actual: PixelSize,
    },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Tile store error: {0}")]
    Store(String),

    #[error("Layout not registered for layer {0}")]
    LayerNotRegistered(ChannelLayerKey),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Experiment(#[from] ExperimentError),
}

/// Identifies one pyramid: a channel at one time point and z-plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelLayerKey {
    pub channel_id: ChannelId,
    pub tpoint: u32,
    pub zplane: u32,
}

impl ChannelLayerKey {
    pub fn new(channel_id: ChannelId, tpoint: u32, zplane: u32) -> Self {
        Self {
            channel_id,
            tpoint,
            zplane,
        }
    }

    /// Directory name used by file-backed stores
    pub fn dir_name(&self) -> String {
        format!(
            "channel_{}_t{:03}_z{:03}",
            self.channel_id.0, self.tpoint, self.zplane
        )
    }
}

impl fmt::Display for ChannelLayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/t{}/z{}", self.channel_id, self.tpoint, self.zplane)
    }
}

/// Intensity window used to map 16-bit source pixels onto 8-bit tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntensityWindow {
    pub lower: u16,
    pub upper: u16,
}

impl Default for IntensityWindow {
    fn default() -> Self {
        Self {
            lower: 0,
            upper: u16::MAX,
        }
    }
}

/// A pyramid to build: its key and how its pixels are scaled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLayer {
    pub key: ChannelLayerKey,
    pub window: IntensityWindow,
}

/// Position of a tile within one pyramid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub level: u32,
    pub row: u32,
    pub col: u32,
}

impl TileCoord {
    pub fn new(level: u32, row: u32, col: u32) -> Self {
        Self { level, row, col }
    }

    /// `{level}-{column}-{row}`
    pub fn file_stem(&self) -> String {
        format!("{}-{}-{}", self.level, self.col, self.row)
    }

    /// Parse a `{level}-{column}-{row}` stem
    pub fn from_file_stem(stem: &str) -> Option<Self> {
        let mut parts = stem.split('-');
        let level = parts.next()?.parse().ok()?;
        let col = parts.next()?.parse().ok()?;
        let row = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { level, row, col })
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_stem())
    }
}

/// Unique key of a stored tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileKey {
    pub layer: ChannelLayerKey,
    pub coord: TileCoord,
}

impl TileKey {
    pub fn new(layer: ChannelLayerKey, coord: TileCoord) -> Self {
        Self { layer, coord }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.layer, self.coord)
    }
}

/// An encoded tile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub key: TileKey,
    pub data: Bytes,
}

/// Pyramid description consumed by rendering clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidMetadata {
    /// Width of the highest-resolution level
    pub width: u64,
    /// Height of the highest-resolution level
    pub height: u64,
    /// Total number of tiles across all levels
    pub num_tiles: u64,
    pub tile_size: u32,
    pub version: String,
}

impl PyramidMetadata {
    pub const ZOOMIFY_VERSION: &'static str = "1.8";

    /// Zoomify `ImageProperties.xml` element
    pub fn to_image_properties_xml(&self) -> String {
        format!(
            "<IMAGE_PROPERTIES WIDTH=\"{}\" HEIGHT=\"{}\" NUMTILES=\"{}\" NUMIMAGES=\"1\" VERSION=\"{}\" TILESIZE=\"{}\" />",
            self.width, self.height, self.num_tiles, self.version, self.tile_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_is_level_col_row() {
        let coord = TileCoord::new(3, 5, 7);
        assert_eq!(coord.file_stem(), "3-7-5");
        assert_eq!(TileCoord::from_file_stem("3-7-5"), Some(coord));
        assert_eq!(TileCoord::from_file_stem("3-7"), None);
        assert_eq!(TileCoord::from_file_stem("3-7-5-1"), None);
        assert_eq!(TileCoord::from_file_stem("a-7-5"), None);
    }

    #[test]
    fn test_image_properties_xml() {
        let metadata = PyramidMetadata {
            width: 1024,
            height: 512,
            num_tiles: 11,
            tile_size: 256,
            version: PyramidMetadata::ZOOMIFY_VERSION.to_string(),
        };
        assert_eq!(
            metadata.to_image_properties_xml(),
            "<IMAGE_PROPERTIES WIDTH=\"1024\" HEIGHT=\"512\" NUMTILES=\"11\" NUMIMAGES=\"1\" VERSION=\"1.8\" TILESIZE=\"256\" />"
        );
    }
}
