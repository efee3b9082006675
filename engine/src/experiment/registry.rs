//! Experiment registry: plates, wells, sites and channels
//!
//! Children store their parent's id; navigation in the other direction goes
//! through index maps owned by the registry, so there are no reference cycles.

use std::collections::HashMap;

use indexmap::IndexMap;
use tracing::debug;

use super::names::parse_well_name;
use super::types::{
    Channel, ChannelId, Direction, ExperimentError, ExperimentSettings, Plate, PlateId, PixelSize,
    Site, SiteId, Well, WellId,
};

/// Ids removed from the registry by a plate deletion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovedPlate {
    pub plate_id: PlateId,
    pub well_ids: Vec<WellId>,
    pub site_ids: Vec<SiteId>,
}

/// Registry of the experiment's acquisition layout.
///
/// Populated once during setup, then shared read-only. The only mutation
/// after setup is deletion of a whole plate.
#[derive(Debug, Clone)]
pub struct ExperimentRegistry {
    name: String,
    settings: ExperimentSettings,
    plates: IndexMap<PlateId, Plate>,
    wells: IndexMap<WellId, Well>,
    sites: IndexMap<SiteId, Site>,
    channels: IndexMap<ChannelId, Channel>,
    wells_by_plate: HashMap<PlateId, Vec<WellId>>,
    sites_by_well: HashMap<WellId, Vec<SiteId>>,
    site_positions: HashMap<(WellId, u32, u32), SiteId>,
    next_id: u64,
}

impl ExperimentRegistry {
    pub fn new(name: impl Into<String>, settings: ExperimentSettings) -> Result<Self, ExperimentError> {
        if settings.site_size.is_empty() {
            return Err(ExperimentError::InvalidSiteSize(settings.site_size));
        }
        if settings.site_grid.cell_count() == 0 {
            return Err(ExperimentError::InvalidSiteGrid(settings.site_grid));
        }

        Ok(Self {
            name: name.into(),
            settings,
            plates: IndexMap::new(),
            wells: IndexMap::new(),
            sites: IndexMap::new(),
            channels: IndexMap::new(),
            wells_by_plate: HashMap::new(),
            sites_by_well: HashMap::new(),
            site_positions: HashMap::new(),
            next_id: 1,
        })
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &ExperimentSettings {
        &self.settings
    }

    /// Register a plate; plates are laid out in registration order
    pub fn add_plate(&mut self, name: impl Into<String>) -> Result<PlateId, ExperimentError> {
        let name = name.into();
        if self.plates.values().any(|p| p.name == name) {
            return Err(ExperimentError::DuplicatePlate(name));
        }
        let id = PlateId(self.allocate_id());
        self.plates.insert(id, Plate { id, name });
        self.wells_by_plate.insert(id, Vec::new());
        Ok(id)
    }

    /// Register a well by name, e.g. `B07`
    pub fn add_well(&mut self, plate_id: PlateId, name: &str) -> Result<WellId, ExperimentError> {
        if !self.plates.contains_key(&plate_id) {
            return Err(ExperimentError::PlateNotFound(plate_id));
        }
        let (row, col) = parse_well_name(name)?;
        let dims = self.settings.plate_format.dims();
        if !dims.contains(row, col) {
            return Err(ExperimentError::WellOutOfBounds {
                name: name.to_string(),
                row,
                col,
                rows: dims.rows,
                cols: dims.cols,
            });
        }
        let duplicate = self
            .wells_of(plate_id)
            .any(|w| w.row == row && w.col == col);
        if duplicate {
            return Err(ExperimentError::DuplicateWell {
                plate: plate_id,
                name: name.to_string(),
            });
        }

        let id = WellId(self.allocate_id());
        self.wells.insert(
            id,
            Well {
                id,
                plate_id,
                name: name.to_string(),
                row,
                col,
            },
        );
        self.wells_by_plate.entry(plate_id).or_default().push(id);
        self.sites_by_well.insert(id, Vec::new());
        Ok(id)
    }

    /// Register a site at `(row, col)` of the well's site grid
    pub fn add_site(
        &mut self,
        well_id: WellId,
        row: u32,
        col: u32,
        size: PixelSize,
        omitted: bool,
    ) -> Result<SiteId, ExperimentError> {
        if !self.wells.contains_key(&well_id) {
            return Err(ExperimentError::WellNotFound(well_id));
        }
        let grid = self.settings.site_grid;
        if !grid.contains(row, col) {
            return Err(ExperimentError::SiteOutOfBounds {
                row,
                col,
                rows: grid.rows,
                cols: grid.cols,
            });
        }
        if size != self.settings.site_size {
            return Err(ExperimentError::InconsistentSiteSize {
                expected: self.settings.site_size,
                actual: size,
            });
        }
        if self.site_positions.contains_key(&(well_id, row, col)) {
            return Err(ExperimentError::DuplicateSite { well: well_id, row, col });
        }

        let id = SiteId(self.allocate_id());
        self.sites.insert(
            id,
            Site {
                id,
                well_id,
                row,
                col,
                size,
                omitted,
            },
        );
        self.sites_by_well.entry(well_id).or_default().push(id);
        self.site_positions.insert((well_id, row, col), id);
        Ok(id)
    }

    /// Register a channel; its index is its registration order
    pub fn add_channel(
        &mut self,
        name: impl Into<String>,
        bit_depth: u8,
    ) -> Result<ChannelId, ExperimentError> {
        let name = name.into();
        if !matches!(bit_depth, 8 | 16) {
            return Err(ExperimentError::UnsupportedBitDepth(bit_depth));
        }
        if self.channels.values().any(|c| c.name == name) {
            return Err(ExperimentError::DuplicateChannel(name));
        }
        let id = ChannelId(self.allocate_id());
        let index = self.channels.len() as u32;
        self.channels.insert(
            id,
            Channel {
                id,
                name,
                index,
                bit_depth,
            },
        );
        Ok(id)
    }

    pub fn plate(&self, id: PlateId) -> Result<&Plate, ExperimentError> {
        self.plates.get(&id).ok_or(ExperimentError::PlateNotFound(id))
    }

    pub fn well(&self, id: WellId) -> Result<&Well, ExperimentError> {
        self.wells.get(&id).ok_or(ExperimentError::WellNotFound(id))
    }

    pub fn site(&self, id: SiteId) -> Result<&Site, ExperimentError> {
        self.sites.get(&id).ok_or(ExperimentError::SiteNotFound(id))
    }

    pub fn channel(&self, id: ChannelId) -> Result<&Channel, ExperimentError> {
        self.channels.get(&id).ok_or(ExperimentError::ChannelNotFound(id))
    }

    /// Plates in registration order
    pub fn plates(&self) -> impl Iterator<Item = &Plate> {
        self.plates.values()
    }

    pub fn wells(&self) -> impl Iterator<Item = &Well> {
        self.wells.values()
    }

    pub fn sites(&self) -> impl Iterator<Item = &Site> {
        self.sites.values()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn plate_count(&self) -> usize {
        self.plates.len()
    }

    /// Position of the plate in registration order
    pub fn plate_index(&self, id: PlateId) -> Option<usize> {
        self.plates.get_index_of(&id)
    }

    pub fn wells_of(&self, plate_id: PlateId) -> impl Iterator<Item = &Well> {
        self.wells_by_plate
            .get(&plate_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.wells.get(id))
    }

    pub fn sites_of(&self, well_id: WellId) -> impl Iterator<Item = &Site> {
        self.sites_by_well
            .get(&well_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.sites.get(id))
    }

    /// Site registered at `(row, col)` of a well, omitted or not
    pub fn site_at(&self, well_id: WellId, row: u32, col: u32) -> Option<&Site> {
        self.site_positions
            .get(&(well_id, row, col))
            .and_then(|id| self.sites.get(id))
    }

    /// Neighboring site within the same well.
    ///
    /// Returns `None` at the well border or when no site is registered at the
    /// neighboring position. Omitted sites are returned; callers decide how to
    /// treat them.
    pub fn neighbor(&self, site: &Site, direction: Direction) -> Option<&Site> {
        let (dr, dc) = direction.delta();
        let row = site.row as i64 + dr;
        let col = site.col as i64 + dc;
        if row < 0 || col < 0 {
            return None;
        }
        self.site_at(site.well_id, row as u32, col as u32)
    }

    /// Sorted distinct rows of the plate that contain at least one well
    pub fn nonempty_rows(&self, plate_id: PlateId) -> Vec<u32> {
        let mut rows: Vec<u32> = self.wells_of(plate_id).map(|w| w.row).collect();
        rows.sort_unstable();
        rows.dedup();
        rows
    }

    /// Sorted distinct columns of the plate that contain at least one well
    pub fn nonempty_cols(&self, plate_id: PlateId) -> Vec<u32> {
        let mut cols: Vec<u32> = self.wells_of(plate_id).map(|w| w.col).collect();
        cols.sort_unstable();
        cols.dedup();
        cols
    }

    /// Remove a plate together with its wells and sites.
    ///
    /// Callers must purge dependent records (tiles, mapobjects,
    /// segmentations, feature values) first; see [`crate::teardown`].
    pub fn remove_plate(&mut self, plate_id: PlateId) -> Result<RemovedPlate, ExperimentError> {
        if self.plates.shift_remove(&plate_id).is_none() {
            return Err(ExperimentError::PlateNotFound(plate_id));
        }

        let well_ids = self.wells_by_plate.remove(&plate_id).unwrap_or_default();
        let mut site_ids = Vec::new();
        for well_id in &well_ids {
            self.wells.shift_remove(well_id);
            for site_id in self.sites_by_well.remove(well_id).unwrap_or_default() {
                if let Some(site) = self.sites.shift_remove(&site_id) {
                    self.site_positions
                        .remove(&(site.well_id, site.row, site.col));
                }
                site_ids.push(site_id);
            }
        }

        debug!(
            "Removed plate {} with {} wells and {} sites",
            plate_id,
            well_ids.len(),
            site_ids.len()
        );

        Ok(RemovedPlate {
            plate_id,
            well_ids,
            site_ids,
        })
    }
}
