//! Engine configuration
//!
//! Configuration is loaded from environment variables prefixed with `TMAPS_`.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised when a configuration value cannot be used
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Tile size must be positive")]
    ZeroTileSize,

    #[error("Zoom factor must be at least 2, got {0}")]
    InvalidZoomFactor(u32),

    #[error("{name} spacer ({size} px) must be at least one tile edge ({tile_size} px)")]
    SpacerTooSmall {
        name: &'static str,
        size: u32,
        tile_size: u32,
    },

    #[error("JPEG quality must be within 1..=100, got {0}")]
    InvalidJpegQuality(u8),

    #[error("Shard count must be positive")]
    ZeroShardCount,

    #[error("Max jobs must be positive")]
    ZeroMaxJobs,
}

/// Main engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Site/well/plate spacing
    pub grid: GridConfig,

    /// Pyramid construction
    pub pyramid: PyramidConfig,

    /// Encoded tile read cache
    pub tile_cache: TileCacheConfig,

    /// Record collocation
    pub partition: PartitionConfig,

    /// Directory the tile store writes into
    pub output_dir: PathBuf,

    /// Experiment description to load (JSON). A demo experiment is used when unset.
    pub experiment_path: Option<PathBuf>,
}

/// Spacing between sites, wells and plates in the global pixel space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridConfig {
    /// Extra pixels between vertically adjacent sites
    pub vertical_site_displacement: u32,
    /// Extra pixels between horizontally adjacent sites
    pub horizontal_site_displacement: u32,
    /// Gap between non-empty well rows/columns
    pub well_spacer_size: u32,
    /// Gap between plates in the plate grid
    pub plate_spacer_size: u32,
}

/// Pyramid construction settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyramidConfig {
    /// Tile edge length in pixels
    pub tile_size: u32,
    /// Downsampling factor between consecutive levels
    pub zoom_factor: u32,
    /// Pixel value used for padding and empty tiles
    pub background: u8,
    /// JPEG quality for encoded tiles
    pub jpeg_quality: u8,
    /// Maximum concurrent tile jobs
    pub max_jobs: usize,
}

/// Configuration for the tile cache
#[derive(Debug, Clone)]
pub struct TileCacheConfig {
    /// Maximum cache size in bytes
    pub max_size_bytes: u64,
    /// Time-to-live for cache entries
    pub ttl: Duration,
    /// Time-to-idle: evict entries not accessed for this duration
    pub tti: Duration,
}

/// Partitioning settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionConfig {
    /// Number of shards partition keys are distributed over
    pub shard_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grid: GridConfig::default(),
            pyramid: PyramidConfig::default(),
            tile_cache: TileCacheConfig::default(),
            partition: PartitionConfig::default(),
            output_dir: PathBuf::from("./pyramids"),
            experiment_path: None,
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            vertical_site_displacement: 0,
            horizontal_site_displacement: 0,
            well_spacer_size: 500,
            plate_spacer_size: 2000,
        }
    }
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            tile_size: 256,
            zoom_factor: 2,
            background: 0,
            jpeg_quality: 95,
            max_jobs: 8,
        }
    }
}

impl Default for TileCacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 256 * 1024 * 1024, // 256 MB
            ttl: Duration::from_secs(3600),
            tti: Duration::from_secs(1800),
        }
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self { shard_count: 32 }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Grid config
        if let Ok(val) = env::var("TMAPS_VERTICAL_SITE_DISPLACEMENT")
            && let Ok(v) = val.parse()
        {
            config.grid.vertical_site_displacement = v;
        }
        if let Ok(val) = env::var("TMAPS_HORIZONTAL_SITE_DISPLACEMENT")
            && let Ok(v) = val.parse()
        {
            config.grid.horizontal_site_displacement = v;
        }
        if let Ok(val) = env::var("TMAPS_WELL_SPACER_SIZE")
            && let Ok(v) = val.parse()
        {
            config.grid.well_spacer_size = v;
        }
        if let Ok(val) = env::var("TMAPS_PLATE_SPACER_SIZE")
            && let Ok(v) = val.parse()
        {
            config.grid.plate_spacer_size = v;
        }

        // Pyramid config
        if let Ok(val) = env::var("TMAPS_TILE_SIZE")
            && let Ok(v) = val.parse()
        {
            config.pyramid.tile_size = v;
        }
        if let Ok(val) = env::var("TMAPS_ZOOM_FACTOR")
            && let Ok(v) = val.parse()
        {
            config.pyramid.zoom_factor = v;
        }
        if let Ok(val) = env::var("TMAPS_BACKGROUND")
            && let Ok(v) = val.parse()
        {
            config.pyramid.background = v;
        }
        if let Ok(val) = env::var("TMAPS_JPEG_QUALITY")
            && let Ok(v) = val.parse()
        {
            config.pyramid.jpeg_quality = v;
        }
        if let Ok(val) = env::var("TMAPS_MAX_JOBS")
            && let Ok(v) = val.parse()
        {
            config.pyramid.max_jobs = v;
        }

        // Tile cache config
        if let Ok(val) = env::var("TMAPS_TILE_CACHE_MAX_MB")
            && let Ok(mb) = val.parse::<u64>()
        {
            config.tile_cache.max_size_bytes = mb * 1024 * 1024;
        }
        if let Ok(val) = env::var("TMAPS_TILE_CACHE_TTL_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.tile_cache.ttl = Duration::from_secs(secs);
        }

        // Partition config
        if let Ok(val) = env::var("TMAPS_SHARD_COUNT")
            && let Ok(v) = val.parse()
        {
            config.partition.shard_count = v;
        }

        if let Ok(path) = env::var("TMAPS_OUTPUT_DIR")
            && !path.is_empty()
        {
            config.output_dir = PathBuf::from(path);
        }
        if let Ok(path) = env::var("TMAPS_EXPERIMENT")
            && !path.is_empty()
        {
            config.experiment_path = Some(PathBuf::from(path));
        }

        config
    }

    /// Reject settings that would make tiling or partitioning ill-defined.
    ///
    /// Called once before any processing starts; nothing is clamped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pyramid = &self.pyramid;
        if pyramid.tile_size == 0 {
            return Err(ConfigError::ZeroTileSize);
        }
        if pyramid.zoom_factor < 2 {
            return Err(ConfigError::InvalidZoomFactor(pyramid.zoom_factor));
        }
        if !(1..=100).contains(&pyramid.jpeg_quality) {
            return Err(ConfigError::InvalidJpegQuality(pyramid.jpeg_quality));
        }
        if pyramid.max_jobs == 0 {
            return Err(ConfigError::ZeroMaxJobs);
        }
        // A tile must never span two wells or two plates, otherwise two
        // border sites would both claim it.
        if self.grid.well_spacer_size < pyramid.tile_size {
            return Err(ConfigError::SpacerTooSmall {
                name: "Well",
                size: self.grid.well_spacer_size,
                tile_size: pyramid.tile_size,
            });
        }
        if self.grid.plate_spacer_size < pyramid.tile_size {
            return Err(ConfigError::SpacerTooSmall {
                name: "Plate",
                size: self.grid.plate_spacer_size,
                tile_size: pyramid.tile_size,
            });
        }
        if self.partition.shard_count == 0 {
            return Err(ConfigError::ZeroShardCount);
        }
        Ok(())
    }
}
