//! Pyramid construction
//!
//! A build runs in three phases:
//! 1. one job per site producing the base-level tiles the site owns,
//! 2. background tiles for base positions no site owns,
//! 3. one batch per level, from `max_zoom - 1` down to 0, downsampling the
//!    level above.
//!
//! Jobs of one phase are independent and run concurrently, bounded by
//! `PyramidConfig::max_jobs`.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt, stream};
use image::GrayImage;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::config::PyramidConfig;
use crate::experiment::{ExperimentRegistry, PixelRect, SiteId};
use crate::grid::GridLayout;

use super::codec::TileCodec;
use super::compositor::{background_tile, composite_tile, downsample};
use super::layout::PyramidLayout;
use super::locator::{SiteTiles, TileLocator, tile_rect};
use super::source::{SourceImageKey, SourceImageProvider};
use super::store::TileStore;
use super::types::{ChannelLayer, PyramidError, Tile, TileCoord, TileKey};

/// Outcome of building one pyramid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub layer: ChannelLayer,
    pub levels: u32,
    pub site_jobs: usize,
    pub base_tiles: u64,
    pub empty_tiles: u64,
    pub parent_tiles: u64,
    pub elapsed: Duration,
}

impl BuildSummary {
    pub fn total_tiles(&self) -> u64 {
        self.base_tiles + self.empty_tiles + self.parent_tiles
    }
}

/// Builds channel pyramids of one experiment into a tile store
pub struct PyramidBuilder<'a> {
    registry: &'a ExperimentRegistry,
    grid: &'a GridLayout,
    config: PyramidConfig,
    store: &'a dyn TileStore,
    sources: &'a dyn SourceImageProvider,
    codec: &'a dyn TileCodec,
}

impl<'a> PyramidBuilder<'a> {
    pub fn new(
        registry: &'a ExperimentRegistry,
        grid: &'a GridLayout,
        config: PyramidConfig,
        store: &'a dyn TileStore,
        sources: &'a dyn SourceImageProvider,
        codec: &'a dyn TileCodec,
    ) -> Self {
        Self {
            registry,
            grid,
            config,
            store,
            sources,
            codec,
        }
    }

    pub fn layout(&self) -> Result<PyramidLayout, PyramidError> {
        PyramidLayout::for_grid(self.grid, &self.config)
    }

    /// Build one pyramid, base level first
    pub async fn build(&self, layer: ChannelLayer) -> Result<BuildSummary, PyramidError> {
        let start = Instant::now();
        self.registry.channel(layer.key.channel_id)?;
        let layout = self.layout()?;
        self.store.register_layer(layer.key, &layout).await?;

        info!(
            "Building pyramid {}: {} levels, {} tiles",
            layer.key,
            layout.level_count(),
            layout.total_tile_count()
        );

        let mappings = self.plan_base_level(layer, &layout).await?;
        let site_jobs = mappings.len();

        let base_tiles: u64 = stream::iter(mappings.iter())
            .map(|mapping| self.run_site_job(layer, &layout, mapping))
            .buffer_unordered(self.config.max_jobs)
            .try_fold(0u64, |acc, n| async move { Ok(acc + n) })
            .await?;

        let locator = TileLocator::new(self.registry, self.grid, &layout);
        let empty = locator.empty_base_tiles(&mappings);
        let empty_tiles = self.write_empty_tiles(layer, &empty).await?;

        let mut parent_tiles = 0;
        for level in (0..layout.max_zoom()).rev() {
            parent_tiles += self.run_level(layer, &layout, level).await?;
        }

        let summary = BuildSummary {
            layer,
            levels: layout.level_count(),
            site_jobs,
            base_tiles,
            empty_tiles,
            parent_tiles,
            elapsed: start.elapsed(),
        };
        info!(
            "Built pyramid {}: {} base, {} empty, {} parent tiles in {:?}",
            layer.key, base_tiles, empty_tiles, parent_tiles, summary.elapsed
        );
        Ok(summary)
    }

    /// Build several pyramids one after the other
    pub async fn build_all(&self, layers: &[ChannelLayer]) -> Result<Vec<BuildSummary>, PyramidError> {
        let mut summaries = Vec::with_capacity(layers.len());
        for layer in layers {
            summaries.push(self.build(*layer).await?);
        }
        Ok(summaries)
    }

    /// Resolve which sites have an image for this layer, then map every
    /// present site to the base tiles it owns.
    pub async fn plan_base_level(
        &self,
        layer: ChannelLayer,
        layout: &PyramidLayout,
    ) -> Result<Vec<SiteTiles>, PyramidError> {
        let mut present = HashSet::new();
        for site in self.registry.sites().filter(|s| !s.omitted) {
            if self.sources.has_image(SourceImageKey::new(site.id, layer.key)).await {
                present.insert(site.id);
            } else {
                debug!("{} has no image for {}", site.id, layer.key);
            }
        }

        let locator = TileLocator::new(self.registry, self.grid, layout);
        let mut mappings = Vec::with_capacity(present.len());
        for site in self.registry.sites().filter(|s| present.contains(&s.id)) {
            mappings.push(locator.map_site(site.id, |id| present.contains(&id))?);
        }
        Ok(mappings)
    }

    /// Load a site image as 8-bit pixels, checking its size
    async fn load_gray(&self, site_id: SiteId, layer: ChannelLayer) -> Result<Option<GrayImage>, PyramidError> {
        let Some(image) = self.sources.load(SourceImageKey::new(site_id, layer.key)).await? else {
            return Ok(None);
        };
        let expected = self.grid.site_size();
        let actual = image.size();
        if actual != expected {
            return Err(PyramidError::SourceImageSize {
                site: site_id,
                expected,
                actual,
            });
        }
        Ok(Some(image.to_gray8(layer.window)))
    }

    /// Composite, encode and store every base tile a site owns
    pub async fn run_site_job(
        &self,
        layer: ChannelLayer,
        layout: &PyramidLayout,
        mapping: &SiteTiles,
    ) -> Result<u64, PyramidError> {
        let start = Instant::now();
        let Some(own) = self.load_gray(mapping.site_id, layer).await? else {
            warn!(
                "Image of {} for {} disappeared after planning, skipping",
                mapping.site_id, layer.key
            );
            return Ok(0);
        };

        let locator = TileLocator::new(self.registry, self.grid, layout);
        let tile_size = layout.tile_size();
        let mut neighbors: HashMap<SiteId, Option<(PixelRect, GrayImage)>> = HashMap::new();

        let mut written = 0;
        for tile in &mapping.tiles {
            let contributors = locator.contributing_sites(mapping.site_id, tile.coord)?;
            for id in &contributors {
                if neighbors.contains_key(id) {
                    continue;
                }
                let loaded = match self.load_gray(*id, layer).await? {
                    Some(image) => Some((self.grid.site_rect(*id)?, image)),
                    None => {
                        debug!("{} has no image for {}, padding", id, layer.key);
                        None
                    }
                };
                neighbors.insert(*id, loaded);
            }

            let mut sources: Vec<(PixelRect, &GrayImage)> = contributors
                .iter()
                .filter_map(|id| neighbors.get(id).and_then(|n| n.as_ref()))
                .map(|(rect, image)| (*rect, image))
                .collect();
            sources.push((mapping.rect, &own));

            let bounds = tile_rect(tile.coord.row, tile.coord.col, tile_size);
            let pixels = composite_tile(bounds, &sources, tile_size, self.config.background);
            self.put_tile(layer, tile.coord, self.codec.encode(&pixels)?).await?;
            written += 1;
        }

        histogram!("tmaps_site_job_duration_seconds").record(start.elapsed());
        counter!("tmaps_tiles_written_total", "kind" => "base").increment(written);
        debug!(
            "{} produced {} tiles for {} in {:?}",
            mapping.site_id,
            written,
            layer.key,
            start.elapsed()
        );
        Ok(written)
    }

    /// Store background tiles at base positions no site owns
    pub async fn write_empty_tiles(&self, layer: ChannelLayer, coords: &[TileCoord]) -> Result<u64, PyramidError> {
        if coords.is_empty() {
            return Ok(0);
        }
        let data = self
            .codec
            .encode(&background_tile(self.config.tile_size, self.config.background))?;

        stream::iter(coords.iter())
            .map(|coord| self.put_tile(layer, *coord, data.clone()))
            .buffer_unordered(self.config.max_jobs)
            .try_collect::<Vec<()>>()
            .await?;

        counter!("tmaps_tiles_written_total", "kind" => "empty").increment(coords.len() as u64);
        debug!("Wrote {} empty tiles for {}", coords.len(), layer.key);
        Ok(coords.len() as u64)
    }

    /// Build every tile of `level` from the already stored tiles of `level + 1`
    pub async fn run_level(&self, layer: ChannelLayer, layout: &PyramidLayout, level: u32) -> Result<u64, PyramidError> {
        let coords: Vec<TileCoord> = layout.tiles_at_level(level)?.collect();
        let count = coords.len() as u64;

        stream::iter(coords)
            .map(|coord| self.parent_tile(layer, layout, coord))
            .buffer_unordered(self.config.max_jobs)
            .try_collect::<Vec<()>>()
            .await?;

        counter!("tmaps_tiles_written_total", "kind" => "parent").increment(count);
        debug!("Level {} of {}: {} tiles", level, layer.key, count);
        Ok(count)
    }

    async fn parent_tile(&self, layer: ChannelLayer, layout: &PyramidLayout, coord: TileCoord) -> Result<(), PyramidError> {
        let mut children = Vec::new();
        for child in layout.children_of(coord)? {
            let pixels = match child {
                Some(child) => match self.store.get(&TileKey::new(layer.key, child)).await? {
                    Some(data) => Some(self.codec.decode(&data)?),
                    None => {
                        warn!("Child tile {} of {} is missing", child, layer.key);
                        None
                    }
                },
                None => None,
            };
            children.push(pixels);
        }

        let pixels = downsample(
            &children,
            layout.zoom_factor(),
            layout.tile_size(),
            self.config.background,
        );
        self.put_tile(layer, coord, self.codec.encode(&pixels)?).await
    }

    async fn put_tile(&self, layer: ChannelLayer, coord: TileCoord, data: Bytes) -> Result<(), PyramidError> {
        self.store
            .put(Tile {
                key: TileKey::new(layer.key, coord),
                data,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pyramid::codec::JpegCodec;
    use crate::pyramid::compositor::SourceImage;
    use crate::pyramid::source::InMemorySourceImages;
    use crate::pyramid::store::InMemoryTileStore;
    use crate::pyramid::types::ChannelLayerKey;
    use crate::test_utils::{flat_image, registry_with_wells, standard_grid};
    use image::Luma;

    struct Fixture {
        registry: ExperimentRegistry,
        grid: GridLayout,
        store: InMemoryTileStore,
        sources: InMemorySourceImages,
        codec: JpegCodec,
        layer: ChannelLayer,
    }

    impl Fixture {
        fn new(site_grid: (u32, u32), site_size: (u64, u64), wells: &[&str]) -> Self {
            let (mut registry, _) = registry_with_wells(96, site_grid, site_size, wells);
            let channel = registry.add_channel("DAPI", 8).unwrap();
            let grid = GridLayout::compute(&registry, &standard_grid()).unwrap();
            Self {
                registry,
                grid,
                store: InMemoryTileStore::new(),
                sources: InMemorySourceImages::new(),
                codec: JpegCodec::new(95),
                layer: ChannelLayer {
                    key: ChannelLayerKey::new(channel, 0, 0),
                    window: Default::default(),
                },
            }
        }

        fn fill(&self, value: u8) {
            let size = self.grid.site_size();
            for site in self.registry.sites() {
                self.sources.insert(
                    SourceImageKey::new(site.id, self.layer.key),
                    SourceImage::Gray8(flat_image(size.height as u32, size.width as u32, value)),
                );
            }
        }

        fn builder(&self) -> PyramidBuilder<'_> {
            PyramidBuilder::new(
                &self.registry,
                &self.grid,
                PyramidConfig::default(),
                &self.store,
                &self.sources,
                &self.codec,
            )
        }

        async fn pixel(&self, coord: TileCoord, x: u32, y: u32) -> u8 {
            let data = self
                .store
                .get(&TileKey::new(self.layer.key, coord))
                .await
                .unwrap()
                .unwrap();
            self.codec.decode(&data).unwrap().get_pixel(x, y)[0]
        }
    }

    #[tokio::test]
    async fn test_build_writes_every_tile_once() {
        let fixture = Fixture::new((2, 2), (300, 300), &["A01", "A02"]);
        fixture.fill(200);
        let builder = fixture.builder();
        let summary = builder.build(fixture.layer).await.unwrap();
        let layout = builder.layout().unwrap();

        assert_eq!(summary.total_tiles(), layout.total_tile_count());
        assert_eq!(
            fixture.store.tile_count(fixture.layer.key).await.unwrap(),
            layout.total_tile_count()
        );
        assert_eq!(summary.site_jobs, 8);
        assert_eq!(summary.levels, layout.level_count());
        for level in 0..layout.level_count() {
            for coord in layout.tiles_at_level(level).unwrap() {
                assert!(
                    fixture
                        .store
                        .exists(&TileKey::new(fixture.layer.key, coord))
                        .await
                        .unwrap()
                );
            }
        }
    }

    #[tokio::test]
    async fn test_straddling_tile_composites_neighbors() {
        let fixture = Fixture::new((1, 2), (300, 300), &["A01"]);
        let size = fixture.grid.site_size();
        let left = fixture.registry.sites().next().unwrap().id;
        for site in fixture.registry.sites() {
            let value = if site.id == left { 50 } else { 250 };
            fixture.sources.insert(
                SourceImageKey::new(site.id, fixture.layer.key),
                SourceImage::Gray8(flat_image(size.height as u32, size.width as u32, value)),
            );
        }
        let builder = fixture.builder();
        let layout = builder.layout().unwrap();
        builder.build(fixture.layer).await.unwrap();

        let base = layout.max_zoom();
        // Tile (0, 1) spans x = 256..512: 44 columns of the left site, then the right one
        let coord = TileCoord::new(base, 0, 1);
        assert!(fixture.pixel(coord, 10, 10).await.abs_diff(50) < 8);
        assert!(fixture.pixel(coord, 100, 10).await.abs_diff(250) < 8);
        // Rows 300.. are below both sites
        let coord = TileCoord::new(base, 1, 0);
        assert!(fixture.pixel(coord, 10, 100).await < 8);
    }

    #[tokio::test]
    async fn test_missing_image_is_padded() {
        let fixture = Fixture::new((1, 2), (300, 300), &["A01"]);
        let size = fixture.grid.site_size();
        let left = fixture.registry.sites().next().unwrap().id;
        fixture.sources.insert(
            SourceImageKey::new(left, fixture.layer.key),
            SourceImage::Gray8(flat_image(size.height as u32, size.width as u32, 180)),
        );
        let builder = fixture.builder();
        let layout = builder.layout().unwrap();
        let summary = builder.build(fixture.layer).await.unwrap();

        assert_eq!(summary.site_jobs, 1);
        assert_eq!(summary.total_tiles(), layout.total_tile_count());
        let coord = TileCoord::new(layout.max_zoom(), 0, 1);
        assert!(fixture.pixel(coord, 10, 10).await.abs_diff(180) < 8);
        assert!(fixture.pixel(coord, 100, 10).await < 8);
    }

    #[tokio::test]
    async fn test_wrong_source_size_is_rejected() {
        let fixture = Fixture::new((1, 1), (300, 300), &["A01"]);
        let site = fixture.registry.sites().next().unwrap().id;
        fixture.sources.insert(
            SourceImageKey::new(site, fixture.layer.key),
            SourceImage::Gray8(GrayImage::from_pixel(10, 10, Luma([1]))),
        );
        let result = fixture.builder().build(fixture.layer).await;
        assert!(matches!(result, Err(PyramidError::SourceImageSize { .. })));
    }

    #[tokio::test]
    async fn test_parent_level_is_downsampled() {
        let fixture = Fixture::new((2, 2), (512, 512), &["A01"]);
        fixture.fill(160);
        let builder = fixture.builder();
        builder.build(fixture.layer).await.unwrap();

        // 1024 x 1024 overview: level 0 is a single tile
        assert!(fixture.pixel(TileCoord::new(0, 0, 0), 128, 128).await.abs_diff(160) < 8);
    }
}
