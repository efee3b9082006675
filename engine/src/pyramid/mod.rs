//! Zoomable image pyramids
//!
//! One pyramid per channel layer (channel, time point, z-plane) covering the
//! whole experiment overview. Tiles are built bottom-up: sites produce the
//! base level, every other level is downsampled from the one above it.

pub mod builder;
pub mod codec;
pub mod compositor;
pub mod layout;
pub mod locator;
pub mod source;
pub mod store;
pub mod tile_cache;
pub mod types;

pub use builder::{BuildSummary, PyramidBuilder};
pub use codec::{JpegCodec, TileCodec};
pub use compositor::SourceImage;
pub use layout::PyramidLayout;
pub use locator::{BaseTile, SiteTiles, TileLocator};
pub use source::{InMemorySourceImages, SourceImageKey, SourceImageProvider};
pub use store::{DirectoryTileStore, IMAGE_PROPERTIES_FILE, InMemoryTileStore, TileStore};
pub use tile_cache::{CachedTileStore, TileCache, TileCacheStats};
pub use types::{
    ChannelLayer, ChannelLayerKey, IntensityWindow, PyramidError, PyramidMetadata, Tile,
    TileCoord, TileKey,
};
