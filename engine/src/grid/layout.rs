//! Finalized pixel layout of an experiment in the global coordinate space

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::config::GridConfig;
use crate::experiment::{
    ExperimentError, ExperimentRegistry, GridDims, Offset, PixelRect, PixelSize, PlateId, SiteId,
    WellId,
};

use super::offsets::{
    extent, plate_grid_dims, plate_offset, plate_size, site_offset, slot_index, well_size,
};

/// Immutable record of every plate, well and site offset.
///
/// Computed once from a fully populated registry; recompute after the
/// registry changes (e.g. a plate deletion).
#[derive(Debug, Clone)]
pub struct GridLayout {
    grid: GridConfig,
    site_size: PixelSize,
    well_size: PixelSize,
    plate_size: PixelSize,
    plate_grid: GridDims,
    overview_size: PixelSize,
    plate_offsets: HashMap<PlateId, Offset>,
    well_offsets: HashMap<WellId, Offset>,
    site_offsets: HashMap<SiteId, Offset>,
}

impl GridLayout {
    /// Compute all offsets.
    ///
    /// Plates whose populated well rows/columns differ in count get different
    /// sizes; the largest is used for every plate slot and smaller plates are
    /// bordered by background.
    pub fn compute(registry: &ExperimentRegistry, grid: &GridConfig) -> Result<Self, ExperimentError> {
        if registry.plate_count() == 0 {
            return Err(ExperimentError::NoPlates);
        }

        let settings = registry.settings();
        let site_size = settings.site_size;
        let well_size = well_size(settings.site_grid, site_size, grid);
        let well_spacer = grid.well_spacer_size as u64;
        let plate_spacer = grid.plate_spacer_size as u64;

        // Non-empty rows/columns per plate determine each plate's extent
        let mut slots = HashMap::new();
        let mut plate_sizes = Vec::new();
        for plate in registry.plates() {
            let rows = registry.nonempty_rows(plate.id);
            let cols = registry.nonempty_cols(plate.id);
            let size = plate_size(rows.len(), cols.len(), well_size, well_spacer);
            debug!(
                "Plate {} uses {} row slots and {} column slots ({})",
                plate.name,
                rows.len(),
                cols.len(),
                size
            );
            plate_sizes.push((plate.id, size));
            slots.insert(plate.id, (rows, cols));
        }

        let max_plate = PixelSize {
            height: plate_sizes.iter().map(|(_, s)| s.height).max().unwrap_or(0),
            width: plate_sizes.iter().map(|(_, s)| s.width).max().unwrap_or(0),
        };
        if plate_sizes.iter().any(|(_, s)| *s != max_plate) {
            warn!(
                "Plates of experiment '{}' have different sizes; using the maximum {}",
                registry.name(),
                max_plate
            );
        }

        let plate_grid = plate_grid_dims(registry.plate_count());
        let mut plate_offsets = HashMap::new();
        for (index, (plate_id, _)) in plate_sizes.iter().enumerate() {
            plate_offsets.insert(*plate_id, plate_offset(index, plate_grid, max_plate, plate_spacer));
        }

        let mut well_offsets = HashMap::new();
        for well in registry.wells() {
            let (rows, cols) = &slots[&well.plate_id];
            let plate = plate_offsets[&well.plate_id];
            // Every registered well populates its own row and column
            let row_slot = slot_index(well.row, rows).unwrap_or(0);
            let col_slot = slot_index(well.col, cols).unwrap_or(0);
            well_offsets.insert(
                well.id,
                super::offsets::well_offset(row_slot, col_slot, well_size, well_spacer, plate),
            );
        }

        let mut site_offsets = HashMap::new();
        for site in registry.sites() {
            let well = well_offsets
                .get(&site.well_id)
                .copied()
                .ok_or(ExperimentError::WellNotFound(site.well_id))?;
            site_offsets.insert(site.id, site_offset(site.row, site.col, site.size, grid, well));
        }

        let overview_size = PixelSize {
            height: extent(plate_grid.rows as u64, max_plate.height, plate_spacer),
            width: extent(plate_grid.cols as u64, max_plate.width, plate_spacer),
        };

        info!(
            "Computed grid layout for '{}': {} plates in a {} grid, overview {}",
            registry.name(),
            registry.plate_count(),
            plate_grid,
            overview_size
        );

        Ok(Self {
            grid: *grid,
            site_size,
            well_size,
            plate_size: max_plate,
            plate_grid,
            overview_size,
            plate_offsets,
            well_offsets,
            site_offsets,
        })
    }

    pub fn grid_config(&self) -> &GridConfig {
        &self.grid
    }

    pub fn site_size(&self) -> PixelSize {
        self.site_size
    }

    pub fn well_size(&self) -> PixelSize {
        self.well_size
    }

    /// Size of one plate slot (the largest plate)
    pub fn plate_size(&self) -> PixelSize {
        self.plate_size
    }

    pub fn plate_grid(&self) -> GridDims {
        self.plate_grid
    }

    /// Maximum-resolution size of the whole overview
    pub fn overview_size(&self) -> PixelSize {
        self.overview_size
    }

    pub fn plate_offset(&self, id: PlateId) -> Result<Offset, ExperimentError> {
        self.plate_offsets
            .get(&id)
            .copied()
            .ok_or(ExperimentError::PlateNotFound(id))
    }

    pub fn well_offset(&self, id: WellId) -> Result<Offset, ExperimentError> {
        self.well_offsets
            .get(&id)
            .copied()
            .ok_or(ExperimentError::WellNotFound(id))
    }

    pub fn site_offset(&self, id: SiteId) -> Result<Offset, ExperimentError> {
        self.site_offsets
            .get(&id)
            .copied()
            .ok_or(ExperimentError::SiteNotFound(id))
    }

    pub fn site_rect(&self, id: SiteId) -> Result<PixelRect, ExperimentError> {
        Ok(PixelRect {
            offset: self.site_offset(id)?,
            size: self.site_size,
        })
    }

    pub fn well_rect(&self, id: WellId) -> Result<PixelRect, ExperimentError> {
        Ok(PixelRect {
            offset: self.well_offset(id)?,
            size: self.well_size,
        })
    }

    pub fn plate_rect(&self, id: PlateId) -> Result<PixelRect, ExperimentError> {
        Ok(PixelRect {
            offset: self.plate_offset(id)?,
            size: self.plate_size,
        })
    }
}
