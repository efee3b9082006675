//! Experiment-related types and error definitions

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised while describing or laying out an experiment.
///
/// All of these are configuration errors: they surface before any tile or
/// segmentation is processed.
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("Invalid well name: {0}")]
    InvalidWellName(String),

    #[error("Unsupported plate format: {0} wells")]
    UnsupportedPlateFormat(u32),

    #[error("Well {name} at ({row}, {col}) exceeds plate dimensions {rows}x{cols}")]
    WellOutOfBounds {
        name: String,
        row: u32,
        col: u32,
        rows: u32,
        cols: u32,
    },

    #[error("Site at ({row}, {col}) exceeds well site grid {rows}x{cols}")]
    SiteOutOfBounds {
        row: u32,
        col: u32,
        rows: u32,
        cols: u32,
    },

    #[error("Site image size {actual} does not match experiment site size {expected}")]
    InconsistentSiteSize {
        expected: PixelSize,
        actual: PixelSize,
    },

    #[error("Invalid site size: {0}")]
    InvalidSiteSize(PixelSize),

    #[error("Invalid site grid: {0}")]
    InvalidSiteGrid(GridDims),

    #[error("Plate not found: {0}")]
    PlateNotFound(PlateId),

    #[error("Well not found: {0}")]
    WellNotFound(WellId),

    #[error("Site not found: {0}")]
    SiteNotFound(SiteId),

    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelId),

    #[error("Duplicate plate: {0}")]
    DuplicatePlate(String),

    #[error("Duplicate well {name} in plate {plate}")]
    DuplicateWell { plate: PlateId, name: String },

    #[error("Duplicate site ({row}, {col}) in well {well}")]
    DuplicateSite { well: WellId, row: u32, col: u32 },

    #[error("Duplicate channel: {0}")]
    DuplicateChannel(String),

    #[error("Unsupported channel bit depth: {0}")]
    UnsupportedBitDepth(u8),

    #[error("Experiment has no plates")]
    NoPlates,

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            Default,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

pub(crate) use id_type;

id_type!(
    /// Identifier of a registered plate
    PlateId,
    "plate"
);
id_type!(
    /// Identifier of a registered well
    WellId,
    "well"
);
id_type!(
    /// Identifier of a registered site
    SiteId,
    "site"
);
id_type!(
    /// Identifier of a registered channel
    ChannelId,
    "channel"
);

/// Row/column count of a grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridDims {
    pub rows: u32,
    pub cols: u32,
}

impl GridDims {
    pub fn new(rows: u32, cols: u32) -> Self {
        Self { rows, cols }
    }

    /// Whether `(row, col)` addresses a cell of this grid
    pub fn contains(&self, row: u32, col: u32) -> bool {
        row < self.rows && col < self.cols
    }

    pub fn cell_count(&self) -> u64 {
        self.rows as u64 * self.cols as u64
    }
}

impl fmt::Display for GridDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Pixel height/width of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelSize {
    pub height: u64,
    pub width: u64,
}

impl PixelSize {
    pub fn new(height: u64, width: u64) -> Self {
        Self { height, width }
    }

    pub fn is_empty(&self) -> bool {
        self.height == 0 || self.width == 0
    }
}

impl fmt::Display for PixelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// Top-left corner of a grid element in the global pixel space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Offset {
    pub y: u64,
    pub x: u64,
}

impl Offset {
    pub fn new(y: u64, x: u64) -> Self {
        Self { y, x }
    }
}

/// Axis-aligned pixel rectangle in the global pixel space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub offset: Offset,
    pub size: PixelSize,
}

impl PixelRect {
    pub fn bottom(&self) -> u64 {
        self.offset.y + self.size.height
    }

    pub fn right(&self) -> u64 {
        self.offset.x + self.size.width
    }

    /// Half-open overlap test
    pub fn intersects(&self, other: &PixelRect) -> bool {
        self.offset.y < other.bottom()
            && other.offset.y < self.bottom()
            && self.offset.x < other.right()
            && other.offset.x < self.right()
    }
}

/// Multi-well plate layout, identified by its well count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct PlateFormat(u32);

impl PlateFormat {
    pub const SUPPORTED: &'static [u32] = &[1, 6, 12, 24, 48, 96, 384, 1536];

    pub fn from_well_count(wells: u32) -> Result<Self, ExperimentError> {
        if Self::SUPPORTED.contains(&wells) {
            Ok(Self(wells))
        } else {
            Err(ExperimentError::UnsupportedPlateFormat(wells))
        }
    }

    pub fn well_count(&self) -> u32 {
        self.0
    }

    /// Row/column grid of the plate
    pub fn dims(&self) -> GridDims {
        match self.0 {
            1 => GridDims::new(1, 1),
            6 => GridDims::new(2, 3),
            12 => GridDims::new(3, 4),
            24 => GridDims::new(4, 6),
            48 => GridDims::new(6, 8),
            96 => GridDims::new(8, 12),
            384 => GridDims::new(16, 24),
            _ => GridDims::new(32, 48),
        }
    }
}

impl TryFrom<u32> for PlateFormat {
    type Error = ExperimentError;

    fn try_from(wells: u32) -> Result<Self, Self::Error> {
        Self::from_well_count(wells)
    }
}

impl From<PlateFormat> for u32 {
    fn from(format: PlateFormat) -> Self {
        format.0
    }
}

/// Experiment-wide acquisition settings shared by every plate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentSettings {
    pub plate_format: PlateFormat,
    /// Declared site grid of every well
    pub site_grid: GridDims,
    /// Pixel size of every site image
    pub site_size: PixelSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plate {
    pub id: PlateId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Well {
    pub id: WellId,
    pub plate_id: PlateId,
    pub name: String,
    pub row: u32,
    pub col: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub well_id: WellId,
    pub row: u32,
    pub col: u32,
    pub size: PixelSize,
    /// Excluded from the pyramid and from spatial indexing
    pub omitted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    /// Acquisition order within the experiment
    pub index: u32,
    /// 8 or 16
    pub bit_depth: u8,
}

/// Neighbor positions within a well's site grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Above,
    Below,
    Left,
    Right,
    AboveLeft,
    AboveRight,
    BelowLeft,
    BelowRight,
}

impl Direction {
    pub(crate) fn delta(&self) -> (i64, i64) {
        match self {
            Direction::Above => (-1, 0),
            Direction::Below => (1, 0),
            Direction::Left => (0, -1),
            Direction::Right => (0, 1),
            Direction::AboveLeft => (-1, -1),
            Direction::AboveRight => (-1, 1),
            Direction::BelowLeft => (1, -1),
            Direction::BelowRight => (1, 1),
        }
    }
}
