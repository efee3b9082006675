//! Test Utilities Module
//!
//! Fixtures shared by the unit tests: registries with fully imaged wells,
//! synthetic images and outlines. Only compiled when running tests.

#![cfg(test)]

use image::{GrayImage, Luma};

use crate::config::GridConfig;
use crate::experiment::{
    ExperimentRegistry, ExperimentSettings, GridDims, PixelSize, PlateFormat, PlateId,
};

// ============================================================================
// Registries
// ============================================================================

/// Registry without plates
pub fn empty_registry(plate_format: u32, site_grid: (u32, u32), site_size: (u64, u64)) -> ExperimentRegistry {
    let settings = ExperimentSettings {
        plate_format: PlateFormat::from_well_count(plate_format).expect("valid plate format"),
        site_grid: GridDims::new(site_grid.0, site_grid.1),
        site_size: PixelSize::new(site_size.0, site_size.1),
    };
    ExperimentRegistry::new("test", settings).expect("valid settings")
}

/// Registry with one plate holding the named wells, each with a complete
/// site grid and no omitted sites
pub fn registry_with_wells(
    plate_format: u32,
    site_grid: (u32, u32),
    site_size: (u64, u64),
    wells: &[&str],
) -> (ExperimentRegistry, PlateId) {
    let mut registry = empty_registry(plate_format, site_grid, site_size);
    let plate = registry.add_plate("plate01").expect("plate");
    let size = registry.settings().site_size;
    for name in wells {
        let well = registry.add_well(plate, name).expect("well");
        for row in 0..site_grid.0 {
            for col in 0..site_grid.1 {
                registry.add_site(well, row, col, size, false).expect("site");
            }
        }
    }
    (registry, plate)
}

/// Default spacing: no site displacement, 500 px between wells
pub fn standard_grid() -> GridConfig {
    GridConfig {
        vertical_site_displacement: 0,
        horizontal_site_displacement: 0,
        well_spacer_size: 500,
        plate_spacer_size: 2000,
    }
}

// ============================================================================
// Images
// ============================================================================

/// Image whose pixels differ between neighbors in both directions
pub fn gradient_image(height: u32, width: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| Luma([((x * 7 + y * 13) % 256) as u8]))
}

pub fn flat_image(height: u32, width: u32, value: u8) -> GrayImage {
    GrayImage::from_pixel(width, height, Luma([value]))
}

// ============================================================================
// Outlines
// ============================================================================

/// Axis-aligned square in site pixel coordinates, top-left corner at `(x, y)`
pub fn square_outline(x: f64, y: f64, size: f64) -> Vec<(f64, f64)> {
    vec![(x, y), (x + size, y), (x + size, y + size), (x, y + size)]
}
