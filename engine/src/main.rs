use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use image::{GrayImage, ImageBuffer, Luma};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tmaps_engine::config::Config;
use tmaps_engine::experiment::{ExperimentDescription, ExperimentRegistry};
use tmaps_engine::experiment::description::{
    ChannelDescription, PlateDescription, SiteDescription, WellDescription,
};
use tmaps_engine::experiment::{ExperimentSettings, GridDims, PixelSize, PlateFormat};
use tmaps_engine::grid::GridLayout;
use tmaps_engine::partition::PartitionPolicy;
use tmaps_engine::pyramid::{
    CachedTileStore, ChannelLayer, ChannelLayerKey, DirectoryTileStore, InMemorySourceImages,
    IntensityWindow, JpegCodec, PyramidBuilder, PyramidLayout, SourceImage, SourceImageKey,
    TileCodec,
};
use tmaps_engine::segmentation::{
    GeoOps, InMemorySegmentationStore, SegmentationIngestor, SegmentationLayerKey,
    SegmentationStore, SiteObject, SiteSegmentation, SpatialQuery, SpatialQueryEngine,
    build_static_overlays, finalize_layers, sweep,
};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the Prometheus metrics recorder
fn setup_prometheus_metrics() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

/// Small experiment used when no description is given: one plate, three
/// wells of 2x2 sites, one omitted site
fn demo_description() -> anyhow::Result<ExperimentDescription> {
    let sites = |omit: Option<(u32, u32)>| {
        (0..2)
            .flat_map(|row| (0..2).map(move |col| (row, col)))
            .map(|(row, col)| SiteDescription {
                row,
                col,
                omitted: omit == Some((row, col)),
            })
            .collect::<Vec<_>>()
    };
    Ok(ExperimentDescription {
        name: "demo".to_string(),
        settings: ExperimentSettings {
            plate_format: PlateFormat::from_well_count(96)?,
            site_grid: GridDims::new(2, 2),
            site_size: PixelSize::new(300, 300),
        },
        channels: vec![
            ChannelDescription {
                name: "DAPI".to_string(),
                bit_depth: 16,
            },
            ChannelDescription {
                name: "GFP".to_string(),
                bit_depth: 8,
            },
        ],
        plates: vec![PlateDescription {
            name: "plate01".to_string(),
            wells: vec![
                WellDescription {
                    name: "A01".to_string(),
                    sites: sites(None),
                },
                WellDescription {
                    name: "A02".to_string(),
                    sites: sites(Some((1, 1))),
                },
                WellDescription {
                    name: "B01".to_string(),
                    sites: sites(None),
                },
            ],
        }],
    })
}

async fn load_registry(config: &Config) -> anyhow::Result<ExperimentRegistry> {
    let description = match &config.experiment_path {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read experiment description {:?}", path))?;
            ExperimentDescription::from_json(&json)
                .with_context(|| format!("Invalid experiment description {:?}", path))?
        }
        None => {
            info!("TMAPS_EXPERIMENT not set, using the demo experiment");
            demo_description()?
        }
    };
    Ok(description.into_registry()?)
}

/// Nuclei centered in a 3x3 pattern on every site, as circles of 16 vertices
fn synthetic_nuclei(size: PixelSize) -> Vec<(u32, f64, f64, f64)> {
    let (height, width) = (size.height as f64, size.width as f64);
    let radius = width.min(height) / 12.0;
    let mut nuclei = Vec::new();
    for i in 0..3 {
        for j in 0..3 {
            let cx = width * (j as f64 + 0.5) / 3.0;
            let cy = height * (i as f64 + 0.5) / 3.0;
            nuclei.push((i * 3 + j + 1, cx, cy, radius));
        }
    }
    nuclei
}

fn circle(cx: f64, cy: f64, radius: f64) -> Vec<(f64, f64)> {
    (0..16)
        .map(|k| {
            let angle = TAU * k as f64 / 16.0;
            (cx + radius * angle.cos(), cy + radius * angle.sin())
        })
        .collect()
}

/// Synthetic acquisition: dim background with bright nuclei
fn synthetic_image(size: PixelSize, bit_depth: u8, seed: u64) -> SourceImage {
    let nuclei = synthetic_nuclei(size);
    let intensity = |x: u32, y: u32| -> f64 {
        let inside = nuclei.iter().any(|&(_, cx, cy, r)| {
            let (dx, dy) = (x as f64 - cx, y as f64 - cy);
            dx * dx + dy * dy <= r * r
        });
        let base = ((x as u64 + y as u64 + seed * 17) % 64) as f64 / 255.0;
        if inside { 0.8 + base / 4.0 } else { base }
    };
    let (width, height) = (size.width as u32, size.height as u32);
    if bit_depth == 8 {
        SourceImage::Gray8(GrayImage::from_fn(width, height, |x, y| {
            Luma([(intensity(x, y) * u8::MAX as f64) as u8])
        }))
    } else {
        SourceImage::Gray16(ImageBuffer::from_fn(width, height, |x, y| {
            Luma([(intensity(x, y) * u16::MAX as f64) as u16])
        }))
    }
}

fn synthetic_sources(registry: &ExperimentRegistry, layers: &[ChannelLayer]) -> anyhow::Result<InMemorySourceImages> {
    let sources = InMemorySourceImages::new();
    for layer in layers {
        let channel = registry.channel(layer.key.channel_id)?;
        for site in registry.sites().filter(|s| !s.omitted) {
            sources.insert(
                SourceImageKey::new(site.id, layer.key),
                synthetic_image(site.size, channel.bit_depth, site.id.0),
            );
        }
    }
    Ok(sources)
}

fn synthetic_segmentations(registry: &ExperimentRegistry) -> Vec<SiteSegmentation> {
    registry
        .sites()
        .map(|site| SiteSegmentation {
            site_id: site.id,
            tpoint: 0,
            zplane: 0,
            objects: synthetic_nuclei(site.size)
                .into_iter()
                .map(|(label, cx, cy, r)| SiteObject {
                    label,
                    outline: circle(cx, cy, r),
                    features: Vec::new(),
                })
                .collect(),
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let start = Instant::now();

    // Initialize Prometheus metrics recorder (must be done before any metrics are recorded)
    let prometheus_handle = setup_prometheus_metrics()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tmaps=debug,tmaps_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load and check configuration before touching any data
    let config = Config::from_env();
    config.validate()?;
    info!(
        "Loaded configuration: tile_size={}, zoom_factor={}, output_dir={:?}",
        config.pyramid.tile_size, config.pyramid.zoom_factor, config.output_dir
    );

    let registry = load_registry(&config).await?;
    let grid = GridLayout::compute(&registry, &config.grid)?;
    let layout = PyramidLayout::for_grid(&grid, &config.pyramid)?;

    // Pyramids
    let layers: Vec<ChannelLayer> = registry
        .channels()
        .map(|channel| ChannelLayer {
            key: ChannelLayerKey::new(channel.id, 0, 0),
            window: IntensityWindow::default(),
        })
        .collect();
    let sources = synthetic_sources(&registry, &layers)?;
    let codec = JpegCodec::new(config.pyramid.jpeg_quality);
    let tiles = CachedTileStore::new(
        Arc::new(DirectoryTileStore::new(config.output_dir.clone(), codec.extension())),
        &config.tile_cache,
    );
    let builder = PyramidBuilder::new(&registry, &grid, config.pyramid, &tiles, &sources, &codec);
    let summaries = builder.build_all(&layers).await?;
    for summary in &summaries {
        info!(
            "Pyramid {}: {} levels, {} tiles in {:?}",
            summary.layer.key,
            summary.levels,
            summary.total_tiles(),
            summary.elapsed
        );
    }

    // Segmentations
    let policy = PartitionPolicy::new(&config.partition);
    let store = Arc::new(InMemorySegmentationStore::new(policy));
    build_static_overlays(&registry, &grid, store.as_ref(), &GeoOps, &policy).await?;

    let nuclei = store.add_mapobject_type("Nuclei", None).await?;
    store
        .add_layer(SegmentationLayerKey::new(nuclei, 0, 0), true)
        .await?;
    let ingestor = SegmentationIngestor::new(&registry, &grid, store.as_ref(), &GeoOps, policy);
    let ingested = ingestor
        .ingest_all(nuclei, &synthetic_segmentations(&registry), config.pyramid.max_jobs)
        .await?;
    info!("Ingested {} nuclei", ingested.created);

    finalize_layers(store.as_ref(), layout.max_zoom()).await?;
    let report = sweep(store.as_ref(), &GeoOps).await?;
    if !report.is_clean() {
        warn!(
            "Integrity sweep found {} invalid geometries and {} orphaned mapobjects",
            report.invalid_geometries.len(),
            report.orphaned_mapobjects.len()
        );
    }

    // One lookup per zoom level at the top-left corner of the map
    let engine = SpatialQueryEngine::new(store.clone(), Arc::new(GeoOps), layout.clone());
    for z in 0..=layout.max_zoom() {
        let results = engine
            .query(&SpatialQuery {
                type_id: nuclei,
                x: 0,
                y: 0,
                z,
                tpoint: 0,
                zplane: 0,
            })
            .await?;
        debug!("Tile (0, 0, {}): {} nuclei", z, results.len());
    }

    let cache = tiles.cache().stats();
    info!(
        "Done in {:?}: {} pyramids, {} mapobject types, tile cache holds {} tiles ({} bytes)",
        start.elapsed(),
        summaries.len(),
        store.mapobject_types().await.len(),
        cache.entry_count,
        cache.weighted_size
    );
    debug!("Metrics:\n{}", prometheus_handle.render());

    Ok(())
}
