//! Access to raw site images

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::experiment::{ChannelId, SiteId};

use super::compositor::SourceImage;
use super::types::{ChannelLayerKey, PyramidError};

/// Key of one acquired image: a site imaged in one channel layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceImageKey {
    pub site_id: SiteId,
    pub layer: ChannelLayerKey,
}

impl SourceImageKey {
    pub fn new(site_id: SiteId, layer: ChannelLayerKey) -> Self {
        Self { site_id, layer }
    }
}

/// Provides decoded channel images of sites
#[async_trait]
pub trait SourceImageProvider: Send + Sync {
    /// Whether the site has an image for this layer. Used to resolve tile
    /// ownership, so it must not decode anything.
    async fn has_image(&self, key: SourceImageKey) -> bool;

    /// Decoded image, or `None` if the site was not imaged in this layer
    async fn load(&self, key: SourceImageKey) -> Result<Option<Arc<SourceImage>>, PyramidError>;
}

/// Images held in memory, keyed by site and layer
#[derive(Default)]
pub struct InMemorySourceImages {
    images: DashMap<SourceImageKey, Arc<SourceImage>>,
}

impl InMemorySourceImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: SourceImageKey, image: SourceImage) {
        self.images.insert(key, Arc::new(image));
    }

    pub fn remove(&self, key: SourceImageKey) -> Option<Arc<SourceImage>> {
        self.images.remove(&key).map(|(_, image)| image)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Layers with at least one image of the given channel
    pub fn layers_of(&self, channel_id: ChannelId) -> Vec<ChannelLayerKey> {
        let mut layers: Vec<ChannelLayerKey> = self
            .images
            .iter()
            .map(|entry| entry.key().layer)
            .filter(|layer| layer.channel_id == channel_id)
            .collect();
        layers.sort();
        layers.dedup();
        layers
    }
}

#[async_trait]
impl SourceImageProvider for InMemorySourceImages {
    async fn has_image(&self, key: SourceImageKey) -> bool {
        self.images.contains_key(&key)
    }

    async fn load(&self, key: SourceImageKey) -> Result<Option<Arc<SourceImage>>, PyramidError> {
        Ok(self.images.get(&key).map(|entry| entry.value().clone()))
    }
}
