//! Per-level image and tile-grid dimensions of a pyramid

use tracing::debug;

use crate::config::PyramidConfig;
use crate::experiment::{GridDims, PixelSize};
use crate::grid::GridLayout;

use super::types::{PyramidError, PyramidMetadata, TileCoord};

/// Maximum number of tiles in one Zoomify tile group
pub const TILE_GROUP_SIZE: u64 = 256;

/// Immutable layout of one pyramid.
///
/// Level 0 is the lowest resolution and fits in a single tile; level
/// `max_zoom()` is the full-resolution overview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyramidLayout {
    tile_size: u32,
    zoom_factor: u32,
    image_sizes: Vec<PixelSize>,
    grid_dims: Vec<GridDims>,
    /// Number of tiles in all levels below each level
    tiles_before: Vec<u64>,
}

impl PyramidLayout {
    /// Compute the level list by repeatedly dividing by `zoom_factor`,
    /// rounding up, until both dimensions fit in one tile.
    pub fn compute(max_size: PixelSize, tile_size: u32, zoom_factor: u32) -> Result<Self, PyramidError> {
        if tile_size == 0 {
            return Err(PyramidError::InvalidTileSize(tile_size));
        }
        if zoom_factor < 2 {
            return Err(PyramidError::InvalidZoomFactor(zoom_factor));
        }
        if max_size.is_empty() {
            return Err(PyramidError::EmptyImage(max_size));
        }

        let tile = tile_size as u64;
        let factor = zoom_factor as u64;

        let mut image_sizes = vec![max_size];
        let mut current = max_size;
        while current.height > tile || current.width > tile {
            current = PixelSize {
                height: current.height.div_ceil(factor),
                width: current.width.div_ceil(factor),
            };
            image_sizes.push(current);
        }
        image_sizes.reverse();

        let grid_dims: Vec<GridDims> = image_sizes
            .iter()
            .map(|size| {
                GridDims::new(
                    size.height.div_ceil(tile) as u32,
                    size.width.div_ceil(tile) as u32,
                )
            })
            .collect();

        let mut tiles_before = Vec::with_capacity(grid_dims.len());
        let mut total = 0u64;
        for dims in &grid_dims {
            tiles_before.push(total);
            total += dims.cell_count();
        }

        debug!(
            "Pyramid layout for {}: {} levels, {} tiles",
            max_size,
            image_sizes.len(),
            total
        );

        Ok(Self {
            tile_size,
            zoom_factor,
            image_sizes,
            grid_dims,
            tiles_before,
        })
    }

    /// Layout of a channel pyramid spanning the whole experiment overview
    pub fn for_grid(grid: &GridLayout, config: &PyramidConfig) -> Result<Self, PyramidError> {
        Self::compute(grid.overview_size(), config.tile_size, config.zoom_factor)
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn zoom_factor(&self) -> u32 {
        self.zoom_factor
    }

    pub fn level_count(&self) -> u32 {
        self.image_sizes.len() as u32
    }

    /// Index of the highest-resolution level
    pub fn max_zoom(&self) -> u32 {
        self.level_count() - 1
    }

    pub fn image_size(&self, level: u32) -> Result<PixelSize, PyramidError> {
        self.image_sizes
            .get(level as usize)
            .copied()
            .ok_or(PyramidError::InvalidLevel(level))
    }

    pub fn grid_dims(&self, level: u32) -> Result<GridDims, PyramidError> {
        self.grid_dims
            .get(level as usize)
            .copied()
            .ok_or(PyramidError::InvalidLevel(level))
    }

    /// Image sizes from level 0 upwards
    pub fn image_sizes(&self) -> &[PixelSize] {
        &self.image_sizes
    }

    /// Tile grids from level 0 upwards
    pub fn level_grids(&self) -> &[GridDims] {
        &self.grid_dims
    }

    pub fn base_grid(&self) -> GridDims {
        self.grid_dims[self.grid_dims.len() - 1]
    }

    pub fn contains(&self, coord: TileCoord) -> bool {
        self.grid_dims
            .get(coord.level as usize)
            .is_some_and(|dims| dims.contains(coord.row, coord.col))
    }

    fn check(&self, coord: TileCoord) -> Result<GridDims, PyramidError> {
        let dims = self.grid_dims(coord.level)?;
        if !dims.contains(coord.row, coord.col) {
            return Err(PyramidError::InvalidTileCoordinates {
                level: coord.level,
                row: coord.row,
                col: coord.col,
            });
        }
        Ok(dims)
    }

    /// 0-based rank of a tile in level-ascending, row-major order
    pub fn tile_rank(&self, coord: TileCoord) -> Result<u64, PyramidError> {
        let dims = self.check(coord)?;
        Ok(self.tiles_before[coord.level as usize]
            + coord.row as u64 * dims.cols as u64
            + coord.col as u64)
    }

    /// Zoomify tile group holding a tile
    pub fn tile_group(&self, coord: TileCoord) -> Result<u32, PyramidError> {
        Ok((self.tile_rank(coord)? / TILE_GROUP_SIZE) as u32)
    }

    pub fn total_tile_count(&self) -> u64 {
        let last = self.grid_dims.len() - 1;
        self.tiles_before[last] + self.grid_dims[last].cell_count()
    }

    pub fn tile_group_count(&self) -> u32 {
        self.total_tile_count().div_ceil(TILE_GROUP_SIZE) as u32
    }

    /// Tile one level down (lower resolution) covering this tile
    pub fn parent_of(&self, coord: TileCoord) -> Option<TileCoord> {
        if coord.level == 0 || !self.contains(coord) {
            return None;
        }
        Some(TileCoord::new(
            coord.level - 1,
            coord.row / self.zoom_factor,
            coord.col / self.zoom_factor,
        ))
    }

    /// The `zoom_factor x zoom_factor` block of child tiles, row-major.
    ///
    /// Children outside the next level's grid are `None`.
    pub fn children_of(&self, coord: TileCoord) -> Result<Vec<Option<TileCoord>>, PyramidError> {
        self.check(coord)?;
        if coord.level >= self.max_zoom() {
            return Err(PyramidError::InvalidLevel(coord.level + 1));
        }
        let level = coord.level + 1;
        let dims = self.grid_dims[level as usize];
        let f = self.zoom_factor;
        let mut children = Vec::with_capacity((f * f) as usize);
        for i in 0..f {
            for j in 0..f {
                let row = coord.row * f + i;
                let col = coord.col * f + j;
                children.push(dims.contains(row, col).then(|| TileCoord::new(level, row, col)));
            }
        }
        Ok(children)
    }

    /// All tiles of a level, row-major
    pub fn tiles_at_level(&self, level: u32) -> Result<impl Iterator<Item = TileCoord>, PyramidError> {
        let dims = self.grid_dims(level)?;
        Ok((0..dims.rows)
            .flat_map(move |row| (0..dims.cols).map(move |col| TileCoord::new(level, row, col))))
    }

    /// Edge length in full-resolution pixels of a tile at `level`
    pub fn tile_extent(&self, level: u32) -> u64 {
        let levels_from_max = self.max_zoom().saturating_sub(level);
        self.tile_size as u64 * (self.zoom_factor as u64).pow(levels_from_max)
    }

    pub fn metadata(&self) -> PyramidMetadata {
        let top = self.image_sizes[self.image_sizes.len() - 1];
        PyramidMetadata {
            width: top.width,
            height: top.height,
            num_tiles: self.total_tile_count(),
            tile_size: self.tile_size,
            version: PyramidMetadata::ZOOMIFY_VERSION.to_string(),
        }
    }
}
