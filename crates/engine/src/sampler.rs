use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::color::Color;
use crate::host::{HostAdapter, TileBitmap};
use crate::template::TileKey;

/// One tile's live pixels, row-major RGBA.
#[derive(Debug, Clone)]
pub struct TileSample {
    width: usize,
    height: usize,
    rgba: Arc<[u8]>,
}

impl TileSample {
    /// Rasterizes a host bitmap. Returns `None` when the bitmap is truncated.
    pub fn rasterize(bitmap: &TileBitmap) -> Option<Self> {
        let width = bitmap.width as usize;
        let height = bitmap.height as usize;
        let needed = width.checked_mul(height)?.checked_mul(4)?;
        if bitmap.rgba.len() < needed {
            return None;
        }
        Some(Self {
            width,
            height,
            rgba: bitmap.rgba.clone(),
        })
    }

    /// Pixel at a tile-local offset; `None` where the bitmap has no data.
    pub fn pixel(&self, x: usize, y: usize) -> Option<Color> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y * self.width + x) * 4;
        Some(Color::from_rgba_slice(&self.rgba[i..i + 4]))
    }
}

/// Per-pass cache of rasterized tiles.
///
/// The cache must be emptied with [`TileSampler::begin_pass`] before every diff:
/// other painters change the canvas between passes, and a stale sample makes
/// overwritten pixels look correct.
pub struct TileSampler<H> {
    host: Arc<H>,
    cache: HashMap<TileKey, Option<Arc<TileSample>>>,
}

impl<H: HostAdapter> TileSampler<H> {
    pub fn new(host: Arc<H>) -> Self {
        Self {
            host,
            cache: HashMap::new(),
        }
    }

    pub fn begin_pass(&mut self) {
        self.cache.clear();
    }

    pub fn cached_tiles(&self) -> usize {
        self.cache.len()
    }

    /// Samples a tile, or `None` if the host has never loaded it.
    pub async fn sample(&mut self, key: TileKey) -> Option<Arc<TileSample>> {
        if let Some(hit) = self.cache.get(&key) {
            return hit.clone();
        }

        let sample = match self.host.tile_bitmap(&key) {
            Some(bitmap) => {
                let s = TileSample::rasterize(&bitmap);
                if s.is_none() {
                    warn!(tile = %key, "tile bitmap shorter than its dimensions");
                }
                s.map(Arc::new)
            }
            None => {
                debug!(tile = %key, "no bitmap for tile");
                None
            }
        };
        // Rasterizing a full tile is heavy; let other tasks run between tiles.
        tokio::task::yield_now().await;

        self.cache.insert(key, sample.clone());
        sample
    }
}
