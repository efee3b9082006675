//! Common Test Utilities for Integration Tests
//!
//! Shared helpers used across integration test modules.

#![allow(dead_code)]

use image::{GrayImage, Luma};
use tmaps_engine::config::{GridConfig, PyramidConfig};
use tmaps_engine::experiment::{
    ExperimentRegistry, ExperimentSettings, GridDims, PixelSize, PlateFormat,
};
use tmaps_engine::pyramid::{
    ChannelLayer, ChannelLayerKey, InMemorySourceImages, IntensityWindow, SourceImage,
    SourceImageKey,
};

/// Experiment with one 96-well plate, the named wells fully imaged with a
/// 2x2 site grid, and one 8-bit channel
pub fn create_test_registry(site_size: u64, wells: &[&str]) -> ExperimentRegistry {
    let settings = ExperimentSettings {
        plate_format: PlateFormat::from_well_count(96).unwrap(),
        site_grid: GridDims::new(2, 2),
        site_size: PixelSize::new(site_size, site_size),
    };
    let mut registry = ExperimentRegistry::new("integration", settings).unwrap();
    registry.add_channel("DAPI", 8).unwrap();
    let plate = registry.add_plate("plate01").unwrap();
    for name in wells {
        let well = registry.add_well(plate, name).unwrap();
        for row in 0..2 {
            for col in 0..2 {
                registry
                    .add_site(well, row, col, settings.site_size, false)
                    .unwrap();
            }
        }
    }
    registry
}

pub fn test_grid_config() -> GridConfig {
    GridConfig {
        vertical_site_displacement: 0,
        horizontal_site_displacement: 0,
        well_spacer_size: 256,
        plate_spacer_size: 512,
    }
}

pub fn test_pyramid_config() -> PyramidConfig {
    PyramidConfig {
        tile_size: 256,
        zoom_factor: 2,
        background: 0,
        jpeg_quality: 90,
        max_jobs: 4,
    }
}

/// Pyramid of the registry's first channel at t=0, z=0
pub fn first_channel_layer(registry: &ExperimentRegistry) -> ChannelLayer {
    let channel = registry.channels().next().unwrap();
    ChannelLayer {
        key: ChannelLayerKey::new(channel.id, 0, 0),
        window: IntensityWindow::default(),
    }
}

/// Uniform image per site, brightness increasing with the site id
pub fn create_test_sources(registry: &ExperimentRegistry, layer: ChannelLayer) -> InMemorySourceImages {
    let sources = InMemorySourceImages::new();
    for site in registry.sites().filter(|s| !s.omitted) {
        let value = 40 + (site.id.0 % 8) as u8 * 25;
        let image = GrayImage::from_pixel(site.size.width as u32, site.size.height as u32, Luma([value]));
        sources.insert(SourceImageKey::new(site.id, layer.key), SourceImage::Gray8(image));
    }
    sources
}

/// Square outline in site pixel coordinates
pub fn square(x: f64, y: f64, size: f64) -> Vec<(f64, f64)> {
    vec![(x, y), (x + size, y), (x + size, y + size), (x, y + size)]
}
