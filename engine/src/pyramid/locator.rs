//! Mapping between site images and base-level tiles
//!
//! Every base tile that contains site pixels is owned by exactly one site:
//! the last one in row-major order among the present sites intersecting it.
//! Ownership only depends on static metadata (positions and image presence),
//! so site jobs can run in parallel without coordination.

use std::collections::HashSet;
use std::ops::Range;

use crate::experiment::{ExperimentRegistry, Offset, PixelRect, PixelSize, Site, SiteId};
use crate::grid::GridLayout;

use super::layout::PyramidLayout;
use super::types::{PyramidError, TileCoord};

/// A base tile claimed by a site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseTile {
    pub coord: TileCoord,
    /// Top-left corner of the tile in the site's pixel buffer (may be negative)
    pub y_offset: i64,
    pub x_offset: i64,
}

/// Base tiles a site's pixels fall into, and the subset it produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteTiles {
    pub site_id: SiteId,
    pub rect: PixelRect,
    /// Half-open range of base rows the site's pixels fall into
    pub rows: Range<u32>,
    /// Half-open range of base columns the site's pixels fall into
    pub cols: Range<u32>,
    /// Tiles this site produces
    pub tiles: Vec<BaseTile>,
}

/// Half-open range of tile indices covering `[start, start + length)`,
/// truncated to `limit`
pub fn tile_span(start: u64, length: u64, tile_size: u32, limit: u32) -> Range<u32> {
    let tile = tile_size as u64;
    if length == 0 {
        let first = (start / tile).min(limit as u64) as u32;
        return first..first;
    }
    let first = (start / tile).min(limit as u64) as u32;
    let last = (start + length).div_ceil(tile).min(limit as u64) as u32;
    first..last
}

/// Pixel rectangle of a base tile in the global space
pub fn tile_rect(row: u32, col: u32, tile_size: u32) -> PixelRect {
    let tile = tile_size as u64;
    PixelRect {
        offset: Offset::new(row as u64 * tile, col as u64 * tile),
        size: PixelSize::new(tile, tile),
    }
}

/// Resolves tile ownership for one pyramid
pub struct TileLocator<'a> {
    registry: &'a ExperimentRegistry,
    grid: &'a GridLayout,
    layout: &'a PyramidLayout,
}

impl<'a> TileLocator<'a> {
    pub fn new(registry: &'a ExperimentRegistry, grid: &'a GridLayout, layout: &'a PyramidLayout) -> Self {
        Self {
            registry,
            grid,
            layout,
        }
    }

    fn base_level(&self) -> u32 {
        self.layout.max_zoom()
    }

    /// Registered, non-omitted sites of the same well, before or after
    /// `site` in row-major order, whose pixels intersect `bounds`.
    ///
    /// Sites smaller than a tile can share it with sites further away than
    /// the immediate neighbors, so the whole well is searched. Wells never
    /// share tiles because spacers are at least one tile wide.
    fn well_sites(
        &self,
        site: &Site,
        later: bool,
        bounds: &PixelRect,
    ) -> Result<Vec<(SiteId, PixelRect)>, PyramidError> {
        let position = (site.row, site.col);
        let mut found = Vec::new();
        for other in self.registry.sites_of(site.well_id) {
            let other_position = (other.row, other.col);
            let ordered = if later {
                other_position > position
            } else {
                other_position < position
            };
            if !ordered || other.omitted {
                continue;
            }
            let rect = self.grid.site_rect(other.id)?;
            if rect.intersects(bounds) {
                found.push((other.id, rect));
            }
        }
        Ok(found)
    }

    /// Base tiles produced by a site.
    ///
    /// `is_present` answers whether a site has an image for this pyramid; it
    /// must be resolved for the later neighbors before ownership is decided.
    /// Omitted sites produce nothing. A tile extending past the bottom/right
    /// edge is left to any present later site that also intersects it; at
    /// the well border or next to missing sites it stays with this site and
    /// is padded.
    pub fn map_site<F>(&self, site_id: SiteId, is_present: F) -> Result<SiteTiles, PyramidError>
    where
        F: Fn(SiteId) -> bool,
    {
        let site = self.registry.site(site_id)?;
        let rect = self.grid.site_rect(site_id)?;
        let grid = self.layout.base_grid();
        let tile_size = self.layout.tile_size();

        let rows = tile_span(rect.offset.y, rect.size.height, tile_size, grid.rows);
        let cols = tile_span(rect.offset.x, rect.size.width, tile_size, grid.cols);

        if site.omitted {
            return Ok(SiteTiles {
                site_id,
                rect,
                rows,
                cols,
                tiles: Vec::new(),
            });
        }

        let span = PixelRect {
            offset: Offset::new(rows.start as u64 * tile_size as u64, cols.start as u64 * tile_size as u64),
            size: PixelSize::new(
                rows.len() as u64 * tile_size as u64,
                cols.len() as u64 * tile_size as u64,
            ),
        };
        let later: Vec<PixelRect> = self
            .well_sites(site, true, &span)?
            .into_iter()
            .filter(|(id, _)| is_present(*id))
            .map(|(_, r)| r)
            .collect();

        let level = self.base_level();
        let mut tiles = Vec::new();
        for row in rows.clone() {
            for col in cols.clone() {
                let bounds = tile_rect(row, col, tile_size);
                if later.iter().any(|r| r.intersects(&bounds)) {
                    continue;
                }
                tiles.push(BaseTile {
                    coord: TileCoord::new(level, row, col),
                    y_offset: bounds.offset.y as i64 - rect.offset.y as i64,
                    x_offset: bounds.offset.x as i64 - rect.offset.x as i64,
                });
            }
        }

        Ok(SiteTiles {
            site_id,
            rect,
            rows,
            cols,
            tiles,
        })
    }

    /// Sites strictly above or to the left of `site_id` whose pixels
    /// intersect a base tile.
    ///
    /// Image presence is left to the caller (a missing image is padded with
    /// background).
    pub fn contributing_sites(&self, site_id: SiteId, coord: TileCoord) -> Result<Vec<SiteId>, PyramidError> {
        if coord.level != self.base_level() || !self.layout.contains(coord) {
            return Err(PyramidError::InvalidTileCoordinates {
                level: coord.level,
                row: coord.row,
                col: coord.col,
            });
        }
        let site = self.registry.site(site_id)?;
        let bounds = tile_rect(coord.row, coord.col, self.layout.tile_size());
        Ok(self
            .well_sites(site, false, &bounds)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Base tiles no site produces (spacers, gaps, missing sites), row-major
    pub fn empty_base_tiles(&self, mappings: &[SiteTiles]) -> Vec<TileCoord> {
        let claimed: HashSet<TileCoord> = mappings
            .iter()
            .flat_map(|m| m.tiles.iter().map(|t| t.coord))
            .collect();
        let grid = self.layout.base_grid();
        let level = self.base_level();
        (0..grid.rows)
            .flat_map(|row| (0..grid.cols).map(move |col| TileCoord::new(level, row, col)))
            .filter(|coord| !claimed.contains(coord))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridConfig;
    use crate::test_utils::{empty_registry, registry_with_wells, standard_grid};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashMap;

    fn locate_all(
        registry: &ExperimentRegistry,
        grid: &GridLayout,
        layout: &PyramidLayout,
        present: &HashSet<SiteId>,
    ) -> Vec<SiteTiles> {
        let locator = TileLocator::new(registry, grid, layout);
        registry
            .sites()
            .filter(|s| present.contains(&s.id))
            .map(|s| locator.map_site(s.id, |id| present.contains(&id)).unwrap())
            .collect()
    }

    fn claims(mappings: &[SiteTiles]) -> HashMap<(u32, u32), Vec<SiteId>> {
        let mut owners: HashMap<(u32, u32), Vec<SiteId>> = HashMap::new();
        for m in mappings {
            for t in &m.tiles {
                owners.entry((t.coord.row, t.coord.col)).or_default().push(m.site_id);
            }
        }
        owners
    }

    fn setup(
        site_grid: (u32, u32),
        site_size: (u64, u64),
        grid_config: GridConfig,
    ) -> (ExperimentRegistry, GridLayout, PyramidLayout) {
        let (registry, _) = registry_with_wells(96, site_grid, site_size, &["A01"]);
        let grid = GridLayout::compute(&registry, &grid_config).unwrap();
        let layout = PyramidLayout::compute(grid.overview_size(), 256, 2).unwrap();
        (registry, grid, layout)
    }

    fn site_id(registry: &ExperimentRegistry, row: u32, col: u32) -> SiteId {
        let well = registry.wells().next().unwrap().id;
        registry.site_at(well, row, col).unwrap().id
    }

    #[test]
    fn test_tile_span() {
        assert_eq!(tile_span(0, 512, 256, 100), 0..2);
        assert_eq!(tile_span(300, 300, 256, 100), 1..3);
        assert_eq!(tile_span(300, 300, 256, 2), 1..2);
        assert_eq!(tile_span(256, 1, 256, 100), 1..2);
    }

    #[test]
    fn test_two_by_two_sites_aligned_to_tiles() {
        let (registry, grid, layout) = setup((2, 2), (512, 512), standard_grid());
        assert_eq!(layout.base_grid(), crate::experiment::GridDims::new(4, 4));
        let present: HashSet<SiteId> = registry.sites().map(|s| s.id).collect();
        let mappings = locate_all(&registry, &grid, &layout, &present);

        let s00 = mappings.iter().find(|m| m.site_id == site_id(&registry, 0, 0)).unwrap();
        let coords: Vec<(u32, u32)> = s00.tiles.iter().map(|t| (t.coord.row, t.coord.col)).collect();
        assert_eq!(coords, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);

        let s01 = mappings.iter().find(|m| m.site_id == site_id(&registry, 0, 1)).unwrap();
        assert_eq!(s01.cols, 2..4);
        assert_eq!(s01.tiles[0].x_offset, 0);

        let owners = claims(&mappings);
        assert_eq!(owners.len(), 16);
        assert!(owners.values().all(|o| o.len() == 1));
    }

    #[test]
    fn test_straddling_tiles_go_to_later_neighbor() {
        let (registry, grid, layout) = setup((2, 2), (300, 300), standard_grid());
        let present: HashSet<SiteId> = registry.sites().map(|s| s.id).collect();
        let mappings = locate_all(&registry, &grid, &layout, &present);
        let owners = claims(&mappings);

        assert_eq!(owners[&(0, 0)], vec![site_id(&registry, 0, 0)]);
        // Column 1 spans x = 256..512 and straddles the right edge of (0, 0)
        assert_eq!(owners[&(0, 1)], vec![site_id(&registry, 0, 1)]);
        assert_eq!(owners[&(1, 0)], vec![site_id(&registry, 1, 0)]);
        assert_eq!(owners[&(1, 1)], vec![site_id(&registry, 1, 1)]);
        assert_eq!(owners.len(), 9);
        assert!(owners.values().all(|o| o.len() == 1));

        let s11 = mappings.iter().find(|m| m.site_id == site_id(&registry, 1, 1)).unwrap();
        let first = s11.tiles[0];
        assert_eq!(first.coord, TileCoord::new(layout.max_zoom(), 1, 1));
        assert_eq!((first.y_offset, first.x_offset), (-44, -44));
    }

    #[test]
    fn test_missing_neighbor_leaves_tile_with_current_site() {
        let (registry, grid, layout) = setup((2, 2), (300, 300), standard_grid());
        let missing = site_id(&registry, 1, 1);
        let present: HashSet<SiteId> = registry.sites().map(|s| s.id).filter(|id| *id != missing).collect();
        let mappings = locate_all(&registry, &grid, &layout, &present);
        let owners = claims(&mappings);

        assert!(owners.values().all(|o| o.len() == 1));
        // Tile (1, 2) straddles the bottom edge of (0, 1); its lower neighbor is missing
        assert_eq!(owners[&(1, 2)], vec![site_id(&registry, 0, 1)]);
        assert_eq!(owners[&(1, 1)], vec![site_id(&registry, 1, 0)]);

        let locator = TileLocator::new(&registry, &grid, &layout);
        let empty = locator.empty_base_tiles(&mappings);
        assert_eq!(empty, vec![TileCoord::new(layout.max_zoom(), 2, 2)]);
    }

    #[test]
    fn test_omitted_site_treated_as_absent() {
        let mut registry = empty_registry(96, (1, 2), (300, 300));
        let plate = registry.add_plate("plate").unwrap();
        let well = registry.add_well(plate, "A01").unwrap();
        let left = registry.add_site(well, 0, 0, PixelSize::new(300, 300), false).unwrap();
        let right = registry.add_site(well, 0, 1, PixelSize::new(300, 300), true).unwrap();
        let grid = GridLayout::compute(&registry, &standard_grid()).unwrap();
        let layout = PyramidLayout::compute(grid.overview_size(), 256, 2).unwrap();
        let locator = TileLocator::new(&registry, &grid, &layout);

        // The straddling column stays with the left site even if an image exists
        let mapping = locator.map_site(left, |_| true).unwrap();
        assert_eq!(mapping.tiles.len(), 4);
        assert!(locator.map_site(right, |_| true).unwrap().tiles.is_empty());
    }

    #[test]
    fn test_missing_right_neighbor_image() {
        let (registry, grid, layout) = setup((1, 2), (300, 300), standard_grid());
        let left = site_id(&registry, 0, 0);
        let right = site_id(&registry, 0, 1);
        let locator = TileLocator::new(&registry, &grid, &layout);

        let mapping = locator.map_site(left, |id| id != right).unwrap();
        assert_eq!(mapping.tiles.len(), 4);
        let mapping = locator.map_site(left, |_| true).unwrap();
        assert_eq!(mapping.tiles.len(), 2);
    }

    #[test]
    fn test_contributing_sites() {
        let (registry, grid, layout) = setup((2, 2), (300, 300), standard_grid());
        let locator = TileLocator::new(&registry, &grid, &layout);
        let level = layout.max_zoom();

        let mut sites = locator
            .contributing_sites(site_id(&registry, 1, 1), TileCoord::new(level, 1, 1))
            .unwrap();
        sites.sort();
        let mut expected = vec![
            site_id(&registry, 0, 0),
            site_id(&registry, 0, 1),
            site_id(&registry, 1, 0),
        ];
        expected.sort();
        assert_eq!(sites, expected);

        let sites = locator
            .contributing_sites(site_id(&registry, 1, 1), TileCoord::new(level, 2, 2))
            .unwrap();
        assert!(sites.is_empty());

        assert!(
            locator
                .contributing_sites(site_id(&registry, 1, 1), TileCoord::new(0, 0, 0))
                .is_err()
        );
    }

    #[test]
    fn test_well_tiles_claimed_exactly_once() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..40 {
            let site_grid = (rng.random_range(1..5), rng.random_range(1..5));
            let site_size = (rng.random_range(256..900), rng.random_range(256..900));
            let grid_config = GridConfig {
                vertical_site_displacement: rng.random_range(0..40),
                horizontal_site_displacement: rng.random_range(0..40),
                ..standard_grid()
            };
            let (registry, grid, layout) = setup(site_grid, site_size, grid_config);
            let present: HashSet<SiteId> = registry.sites().map(|s| s.id).collect();
            let mappings = locate_all(&registry, &grid, &layout, &present);
            let owners = claims(&mappings);

            assert!(owners.values().all(|o| o.len() == 1), "duplicate tile owner");

            // Every tile holding site pixels has an owner
            for m in &mappings {
                for row in m.rows.clone() {
                    for col in m.cols.clone() {
                        assert!(owners.contains_key(&(row, col)), "tile ({row}, {col}) unclaimed");
                    }
                }
            }

            let locator = TileLocator::new(&registry, &grid, &layout);
            let empty = locator.empty_base_tiles(&mappings);
            assert_eq!(
                empty.len() + owners.len(),
                layout.base_grid().cell_count() as usize
            );
        }
    }

    #[test]
    fn test_small_sites_skip_missing_neighbor() {
        let (registry, grid, layout) = setup((1, 4), (100, 100), standard_grid());
        let missing = site_id(&registry, 0, 1);
        let present: HashSet<SiteId> = registry.sites().map(|s| s.id).filter(|id| *id != missing).collect();
        let mappings = locate_all(&registry, &grid, &layout, &present);
        let owners = claims(&mappings);

        // Tile (0, 0) spans x = 0..256 and holds pixels of sites 0, 1 and 2
        assert_eq!(owners[&(0, 0)], vec![site_id(&registry, 0, 2)]);
        assert_eq!(owners[&(0, 1)], vec![site_id(&registry, 0, 3)]);
        assert_eq!(owners.len(), 2);

        let locator = TileLocator::new(&registry, &grid, &layout);
        let mut sites = locator
            .contributing_sites(site_id(&registry, 0, 2), TileCoord::new(layout.max_zoom(), 0, 0))
            .unwrap();
        sites.sort();
        assert_eq!(sites, vec![site_id(&registry, 0, 0), missing]);
    }

    #[test]
    fn test_small_sites_claimed_exactly_once() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..40 {
            let site_grid = (rng.random_range(1..7), rng.random_range(1..7));
            let site_size = (rng.random_range(20..300), rng.random_range(20..300));
            let grid_config = GridConfig {
                vertical_site_displacement: rng.random_range(0..20),
                horizontal_site_displacement: rng.random_range(0..20),
                ..standard_grid()
            };
            let (registry, grid, layout) = setup(site_grid, site_size, grid_config);
            let present: HashSet<SiteId> = registry
                .sites()
                .map(|s| s.id)
                .filter(|_| rng.random_bool(0.7))
                .collect();
            let mappings = locate_all(&registry, &grid, &layout, &present);
            let owners = claims(&mappings);

            assert!(owners.values().all(|o| o.len() == 1), "duplicate tile owner");
            for m in &mappings {
                for row in m.rows.clone() {
                    for col in m.cols.clone() {
                        assert!(owners.contains_key(&(row, col)), "tile ({row}, {col}) unclaimed");
                    }
                }
            }
        }
    }
}
