//! Template loading: turns a raw top-left-anchored RGBA buffer into the ordered set
//! of pixels the agent is responsible for.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;

use crate::color::{free_color_ids, Color, ColorId};
use crate::error::TemplateError;

/// Edge length of one canvas tile, in grid units.
pub const TILE_SIZE: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridCoord {
    pub x: i64,
    pub y: i64,
}

impl GridCoord {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

/// Origin of the tile a coordinate falls into. Renders as `"x,y"`, the host's cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub x: i64,
    pub y: i64,
}

impl TileKey {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    pub fn containing(c: GridCoord) -> Self {
        Self {
            x: c.x.div_euclid(TILE_SIZE) * TILE_SIZE,
            y: c.y.div_euclid(TILE_SIZE) * TILE_SIZE,
        }
    }

    /// Offset of `c` relative to this tile's origin, if it lies inside the tile.
    pub fn local_offset(&self, c: GridCoord) -> Option<(usize, usize)> {
        let lx = c.x - self.x;
        let ly = c.y - self.y;
        let inside = |v: i64| (0..TILE_SIZE).contains(&v);
        (inside(lx) && inside(ly)).then(|| (lx as usize, ly as usize))
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

impl FromStr for TileKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (x, y) = s
            .split_once(',')
            .ok_or_else(|| format!("tile key {s:?} is not \"x,y\""))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<i64>()
                .map_err(|e| format!("tile key {s:?}: {e}"))
        };
        Ok(Self::new(parse(x)?, parse(y)?))
    }
}

/// The host's template image: RGBA rows from the top-left corner.
#[derive(Debug, Clone)]
pub struct TemplateSource {
    pub rgba: Arc<[u8]>,
    pub top_left: GridCoord,
    pub width: u32,
}

impl TemplateSource {
    pub fn new(rgba: impl Into<Arc<[u8]>>, top_left: GridCoord, width: u32) -> Self {
        Self {
            rgba: rgba.into(),
            top_left,
            width,
        }
    }

    /// Grid position of the `index`-th source pixel. Rows run downward, so y decreases.
    pub fn grid_coord(&self, index: usize) -> GridCoord {
        let w = self.width.max(1) as usize;
        GridCoord {
            x: self.top_left.x + (index % w) as i64,
            y: self.top_left.y - (index / w) as i64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPolicy {
    pub include_transparent: bool,
    pub include_free_colors: bool,
    pub ignored: HashSet<ColorId>,
}

impl FilterPolicy {
    fn admits(&self, color: &Color, available: &HashSet<ColorId>) -> bool {
        let id = color.identity();
        (self.include_transparent || color.a > 0)
            && (self.include_free_colors || !free_color_ids().contains(&id))
            && available.contains(&id)
            && !self.ignored.contains(&id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplatePixel {
    /// Position in the source buffer, in pixels.
    pub index: usize,
    pub grid: GridCoord,
    pub color: Color,
    pub tile: TileKey,
}

#[derive(Debug, Clone, Default)]
pub struct Template {
    pixels: Vec<TemplatePixel>,
}

impl Template {
    pub fn pixels(&self) -> &[TemplatePixel] {
        &self.pixels
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Groups pixels by tile, tiles in first-seen order, pixels in template order.
    pub fn by_tile(&self) -> Vec<(TileKey, Vec<&TemplatePixel>)> {
        let mut groups: Vec<(TileKey, Vec<&TemplatePixel>)> = Vec::new();
        let mut slot = std::collections::HashMap::new();
        for p in &self.pixels {
            let i = *slot.entry(p.tile).or_insert_with(|| {
                groups.push((p.tile, Vec::new()));
                groups.len() - 1
            });
            groups[i].1.push(p);
        }
        groups
    }
}

/// Builds the template from the host's image and color catalog.
///
/// Either input being absent yields [`TemplateError::SourceUnavailable`]. The result
/// is always rebuilt from scratch; there is no incremental patching.
pub fn load_template(
    source: Option<&TemplateSource>,
    policy: &FilterPolicy,
    available: Option<&HashSet<ColorId>>,
) -> Result<Template, TemplateError> {
    let source = source.ok_or(TemplateError::SourceUnavailable("template image not ready"))?;
    let available = available.ok_or(TemplateError::SourceUnavailable("color catalog not ready"))?;

    let row = source.width as usize * 4;
    if row == 0 || source.rgba.len() % row != 0 {
        return Err(TemplateError::InvalidBuffer {
            len: source.rgba.len(),
            width: source.width,
        });
    }

    let pixels: Vec<TemplatePixel> = source
        .rgba
        .chunks_exact(4)
        .enumerate()
        .filter_map(|(index, px)| {
            let color = Color::from_rgba_slice(px);
            if !policy.admits(&color, available) {
                return None;
            }
            let grid = source.grid_coord(index);
            Some(TemplatePixel {
                index,
                grid,
                color,
                tile: TileKey::containing(grid),
            })
        })
        .collect();

    info!(
        total = source.rgba.len() / 4,
        kept = pixels.len(),
        "template loaded"
    );
    Ok(Template { pixels })
}
