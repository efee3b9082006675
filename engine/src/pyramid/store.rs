//! Tile persistence
//!
//! Tiles are write-once per key: writing the same key again replaces the
//! payload, so retried jobs never create duplicates.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info};

use super::layout::PyramidLayout;
use super::types::{ChannelLayerKey, PyramidError, Tile, TileCoord, TileKey};

/// Zoomify metadata file written next to the tile groups
pub const IMAGE_PROPERTIES_FILE: &str = "ImageProperties.xml";

/// Storage boundary for encoded tiles
#[async_trait]
pub trait TileStore: Send + Sync {
    /// Make a pyramid known to the store; required before tiles are written
    async fn register_layer(&self, key: ChannelLayerKey, layout: &PyramidLayout) -> Result<(), PyramidError>;

    /// Write a tile, replacing any previous payload for the key
    async fn put(&self, tile: Tile) -> Result<(), PyramidError>;

    async fn get(&self, key: &TileKey) -> Result<Option<Bytes>, PyramidError>;

    async fn exists(&self, key: &TileKey) -> Result<bool, PyramidError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Number of tiles stored for a pyramid
    async fn tile_count(&self, layer: ChannelLayerKey) -> Result<u64, PyramidError>;

    /// Remove a pyramid and all of its tiles, returning the number of tiles removed
    async fn delete_layer(&self, layer: ChannelLayerKey) -> Result<u64, PyramidError>;

    /// Registered pyramids
    async fn layers(&self) -> Vec<ChannelLayerKey>;
}

/// Tile store held entirely in memory
#[derive(Default)]
pub struct InMemoryTileStore {
    layouts: DashMap<ChannelLayerKey, PyramidLayout>,
    tiles: DashMap<TileKey, Bytes>,
}

impl InMemoryTileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinates of every stored tile of a pyramid, sorted
    pub fn coords(&self, layer: ChannelLayerKey) -> Vec<TileCoord> {
        let mut coords: Vec<TileCoord> = self
            .tiles
            .iter()
            .filter(|entry| entry.key().layer == layer)
            .map(|entry| entry.key().coord)
            .collect();
        coords.sort();
        coords
    }
}

#[async_trait]
impl TileStore for InMemoryTileStore {
    async fn register_layer(&self, key: ChannelLayerKey, layout: &PyramidLayout) -> Result<(), PyramidError> {
        self.layouts.insert(key, layout.clone());
        Ok(())
    }

    async fn put(&self, tile: Tile) -> Result<(), PyramidError> {
        let layout = self
            .layouts
            .get(&tile.key.layer)
            .ok_or(PyramidError::LayerNotRegistered(tile.key.layer))?;
        let coord = tile.key.coord;
        if !layout.contains(coord) {
            return Err(PyramidError::InvalidTileCoordinates {
                level: coord.level,
                row: coord.row,
                col: coord.col,
            });
        }
        drop(layout);
        self.tiles.insert(tile.key, tile.data);
        Ok(())
    }

    async fn get(&self, key: &TileKey) -> Result<Option<Bytes>, PyramidError> {
        Ok(self.tiles.get(key).map(|entry| entry.value().clone()))
    }

    async fn tile_count(&self, layer: ChannelLayerKey) -> Result<u64, PyramidError> {
        Ok(self.tiles.iter().filter(|entry| entry.key().layer == layer).count() as u64)
    }

    async fn delete_layer(&self, layer: ChannelLayerKey) -> Result<u64, PyramidError> {
        let before = self.tiles.len();
        self.tiles.retain(|key, _| key.layer != layer);
        self.layouts.remove(&layer);
        Ok((before - self.tiles.len()) as u64)
    }

    async fn layers(&self) -> Vec<ChannelLayerKey> {
        let mut layers: Vec<ChannelLayerKey> = self.layouts.iter().map(|e| *e.key()).collect();
        layers.sort();
        layers
    }
}

/// Zoomify directory layout:
/// `{root}/{layer}/TileGroup{g}/{level}-{col}-{row}.{ext}` plus
/// `{root}/{layer}/ImageProperties.xml`
pub struct DirectoryTileStore {
    root: PathBuf,
    extension: &'static str,
    layouts: DashMap<ChannelLayerKey, PyramidLayout>,
}

impl DirectoryTileStore {
    pub fn new(root: impl Into<PathBuf>, extension: &'static str) -> Self {
        Self {
            root: root.into(),
            extension,
            layouts: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layer_dir(&self, layer: ChannelLayerKey) -> PathBuf {
        self.root.join(layer.dir_name())
    }

    /// Location of a tile on disk
    pub fn tile_path(&self, key: &TileKey) -> Result<PathBuf, PyramidError> {
        let layout = self
            .layouts
            .get(&key.layer)
            .ok_or(PyramidError::LayerNotRegistered(key.layer))?;
        let group = layout.tile_group(key.coord)?;
        Ok(self
            .layer_dir(key.layer)
            .join(format!("TileGroup{}", group))
            .join(format!("{}.{}", key.coord.file_stem(), self.extension)))
    }
}

#[async_trait]
impl TileStore for DirectoryTileStore {
    async fn register_layer(&self, key: ChannelLayerKey, layout: &PyramidLayout) -> Result<(), PyramidError> {
        let dir = self.layer_dir(key);
        tokio::fs::create_dir_all(&dir).await?;
        let xml = layout.metadata().to_image_properties_xml();
        tokio::fs::write(dir.join(IMAGE_PROPERTIES_FILE), xml).await?;
        self.layouts.insert(key, layout.clone());
        info!("Registered pyramid {} at {:?}", key, dir);
        Ok(())
    }

    async fn put(&self, tile: Tile) -> Result<(), PyramidError> {
        let path = self.tile_path(&tile.key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &tile.data).await?;
        Ok(())
    }

    async fn get(&self, key: &TileKey) -> Result<Option<Bytes>, PyramidError> {
        let path = self.tile_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn tile_count(&self, layer: ChannelLayerKey) -> Result<u64, PyramidError> {
        count_tiles(&self.layer_dir(layer), self.extension).await
    }

    async fn delete_layer(&self, layer: ChannelLayerKey) -> Result<u64, PyramidError> {
        let dir = self.layer_dir(layer);
        let removed = count_tiles(&dir, self.extension).await?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.layouts.remove(&layer);
        debug!("Removed {} tiles of pyramid {}", removed, layer);
        Ok(removed)
    }

    async fn layers(&self) -> Vec<ChannelLayerKey> {
        let mut layers: Vec<ChannelLayerKey> = self.layouts.iter().map(|e| *e.key()).collect();
        layers.sort();
        layers
    }
}

/// Count `*.{extension}` files inside the `TileGroup*` directories of a layer
async fn count_tiles(dir: &Path, extension: &str) -> Result<u64, PyramidError> {
    let mut groups = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut count = 0;
    while let Some(group) = groups.next_entry().await? {
        if !group.file_type().await?.is_dir() {
            continue;
        }
        let mut files = tokio::fs::read_dir(group.path()).await?;
        while let Some(file) = files.next_entry().await? {
            if file.path().extension().is_some_and(|ext| ext == extension) {
                count += 1;
            }
        }
    }
    Ok(count)
}
