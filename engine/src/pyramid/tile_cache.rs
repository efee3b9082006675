//! Size-bounded cache of encoded tile bytes
//!
//! Sits in front of a [`TileStore`] so repeated reads of hot tiles (low zoom
//! levels, tiles revisited while panning) skip the storage round trip.
//!
//! - Concurrent access without global lock (sharded internally by moka)
//! - Size-based eviction (counts total bytes, not just entry count)
//! - Metrics for hit/miss rates

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, gauge};
use moka::future::Cache;
use tracing::debug;

use crate::config::TileCacheConfig;

use super::layout::PyramidLayout;
use super::store::TileStore;
use super::types::{ChannelLayerKey, PyramidError, Tile, TileKey};

/// Thread-safe tile cache using moka, keyed by layer and tile coordinates
pub struct TileCache {
    cache: Cache<TileKey, Bytes>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TileCache {
    pub fn new(config: &TileCacheConfig) -> Self {
        let cache = Cache::builder()
            // Weigh entries by payload size so max_capacity is in bytes
            .weigher(|_key: &TileKey, value: &Bytes| -> u32 {
                value.len().min(u32::MAX as usize) as u32
            })
            .max_capacity(config.max_size_bytes)
            .time_to_live(config.ttl)
            .time_to_idle(config.tti)
            .support_invalidation_closures()
            .build();

        Self {
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_default_config() -> Self {
        Self::new(&TileCacheConfig::default())
    }

    pub async fn get(&self, key: &TileKey) -> Option<Bytes> {
        let result = self.cache.get(key).await;

        if result.is_some() {
            let hits = self.hits.fetch_add(1, Ordering::Relaxed) + 1;
            counter!("tmaps_tile_cache_hits_total").increment(1);
            if hits % 100 == 0 {
                self.update_gauges();
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!("tmaps_tile_cache_misses_total").increment(1);
        }

        result
    }

    pub async fn insert(&self, key: TileKey, value: Bytes) {
        let size = value.len();
        self.cache.insert(key, value).await;
        counter!("tmaps_tile_cache_bytes_inserted_total").increment(size as u64);
    }

    /// Return the cached tile or load it with `init`.
    ///
    /// `init` returning `None` (tile not stored) is not cached.
    pub async fn get_or_try_insert_with<F, Fut>(&self, key: TileKey, init: F) -> Result<Option<Bytes>, PyramidError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Option<Bytes>, PyramidError>>,
    {
        if let Some(cached) = self.get(&key).await {
            return Ok(Some(cached));
        }

        let value = init().await?;
        if let Some(data) = &value {
            self.insert(key, data.clone()).await;
        }
        Ok(value)
    }

    /// Drop every cached tile of a pyramid
    pub fn invalidate_layer(&self, layer: ChannelLayerKey) -> Result<(), PyramidError> {
        self.cache
            .invalidate_entries_if(move |key, _| key.layer == layer)
            .map_err(|e| PyramidError::Store(format!("Tile cache invalidation failed: {}", e)))?;
        debug!("Invalidated cached tiles of {}", layer);
        Ok(())
    }

    /// Fraction of lookups served from the cache (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn stats(&self) -> TileCacheStats {
        TileCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.cache.entry_count(),
            weighted_size: self.cache.weighted_size(),
        }
    }

    fn update_gauges(&self) {
        gauge!("tmaps_tile_cache_hit_rate").set(self.hit_rate());
        gauge!("tmaps_tile_cache_entry_count").set(self.cache.entry_count() as f64);
        gauge!("tmaps_tile_cache_size_bytes").set(self.cache.weighted_size() as f64);
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct TileCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: u64,
    /// Total size in bytes (approximate)
    pub weighted_size: u64,
}

/// Read-through, write-through cache over another tile store
pub struct CachedTileStore<S> {
    inner: Arc<S>,
    cache: TileCache,
}

impl<S: TileStore> CachedTileStore<S> {
    pub fn new(inner: Arc<S>, config: &TileCacheConfig) -> Self {
        Self {
            inner,
            cache: TileCache::new(config),
        }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }
}

#[async_trait]
impl<S: TileStore + 'static> TileStore for CachedTileStore<S> {
    async fn register_layer(&self, key: ChannelLayerKey, layout: &PyramidLayout) -> Result<(), PyramidError> {
        self.inner.register_layer(key, layout).await
    }

    async fn put(&self, tile: Tile) -> Result<(), PyramidError> {
        let key = tile.key;
        let data = tile.data.clone();
        self.inner.put(tile).await?;
        self.cache.insert(key, data).await;
        Ok(())
    }

    async fn get(&self, key: &TileKey) -> Result<Option<Bytes>, PyramidError> {
        let inner = &self.inner;
        self.cache
            .get_or_try_insert_with(*key, || async move { inner.get(key).await })
            .await
    }

    async fn tile_count(&self, layer: ChannelLayerKey) -> Result<u64, PyramidError> {
        self.inner.tile_count(layer).await
    }

    async fn delete_layer(&self, layer: ChannelLayerKey) -> Result<u64, PyramidError> {
        let removed = self.inner.delete_layer(layer).await?;
        self.cache.invalidate_layer(layer)?;
        Ok(removed)
    }

    async fn layers(&self) -> Vec<ChannelLayerKey> {
        self.inner.layers().await
    }
}
