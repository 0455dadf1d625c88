use std::collections::HashMap;

use tracing::{debug, warn};

use crate::color::ColorId;
use crate::host::HostAdapter;
use crate::sampler::{TileSample, TileSampler};
use crate::template::{Template, TemplatePixel, TileKey};

/// Template pixels whose live color disagrees with the template, rarest colors first.
#[derive(Debug, Clone, Default)]
pub struct Diff {
    pub pixels: Vec<TemplatePixel>,
    /// Tiles the host had no bitmap for; all their pixels are in `pixels`.
    pub missing_tiles: usize,
    /// Pixels whose tile offset fell outside the tile they were grouped under.
    pub out_of_bounds: usize,
}

impl Diff {
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

/// Compares every template pixel with the sampled canvas.
///
/// The sampler's cache is expected to be fresh for this pass; see
/// [`TileSampler::begin_pass`].
pub async fn compute_diff<H: HostAdapter>(template: &Template, sampler: &mut TileSampler<H>) -> Diff {
    let mut diff = Diff::default();
    let groups = template.by_tile();
    let tile_count = groups.len();

    for (n, (key, pixels)) in groups.into_iter().enumerate() {
        debug!(tile = %key, "processing tile {}/{}", n + 1, tile_count);
        match sampler.sample(key).await {
            Some(sample) => {
                let (wrong, oob) = diff_tile(key, &pixels, &sample);
                diff.out_of_bounds += oob;
                diff.pixels.extend(wrong);
            }
            None => {
                diff.missing_tiles += 1;
                diff.pixels.extend(pixels.into_iter().copied());
            }
        }
    }

    order_by_rarity(&mut diff.pixels);
    debug!(
        remaining = diff.pixels.len(),
        missing_tiles = diff.missing_tiles,
        "diff computed"
    );
    diff
}

/// Pixels of one tile group that need placing, plus how many were out of bounds.
pub fn diff_tile(
    key: TileKey,
    pixels: &[&TemplatePixel],
    sample: &TileSample,
) -> (Vec<TemplatePixel>, usize) {
    let mut wrong = Vec::new();
    let mut out_of_bounds = 0;
    for p in pixels {
        let Some((lx, ly)) = key.local_offset(p.grid) else {
            // Grouping and tile math disagree. Placing the pixel is the safe choice,
            // but this points at a coordinate bug worth chasing.
            warn!(
                tile = %key,
                x = p.grid.x,
                y = p.grid.y,
                "pixel grouped under a tile that does not contain it"
            );
            out_of_bounds += 1;
            wrong.push(**p);
            continue;
        };
        if sample.pixel(lx, ly) != Some(p.color) {
            wrong.push(**p);
        }
    }
    (wrong, out_of_bounds)
}

/// Stable sort by ascending color frequency, ties kept in template order.
pub fn order_by_rarity(pixels: &mut [TemplatePixel]) {
    let mut freq: HashMap<ColorId, usize> = HashMap::new();
    for p in pixels.iter() {
        *freq.entry(p.color.identity()).or_default() += 1;
    }
    pixels.sort_by_key(|p| (freq[&p.color.identity()], p.index));
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::color::Color;
    use crate::template::{load_template, FilterPolicy, GridCoord, TemplateSource};
    use crate::testing::FakeHost;

    const RED: Color = Color::rgb(0xe5, 0, 0);
    const BLUE: Color = Color::rgb(0, 0, 0xea);
    const GREEN: Color = Color::rgb(0, 0xbe, 0);
    const WHITE: Color = Color::rgb(0xff, 0xff, 0xff);

    fn template(colors: &[Color], width: u32, top_left: GridCoord) -> Template {
        let bytes: Vec<u8> = colors.iter().flat_map(|c| [c.r, c.g, c.b, c.a]).collect();
        let src = TemplateSource::new(bytes, top_left, width);
        let available = colors.iter().map(Color::identity).collect();
        let policy = FilterPolicy {
            include_transparent: true,
            include_free_colors: true,
            ..Default::default()
        };
        load_template(Some(&src), &policy, Some(&available)).unwrap()
    }

    fn pixel(index: usize, color: Color) -> TemplatePixel {
        let grid = GridCoord::new(index as i64, 0);
        TemplatePixel {
            index,
            grid,
            color,
            tile: TileKey::containing(grid),
        }
    }

    #[tokio::test]
    async fn two_red_pixels_on_white_tile() {
        let host = Arc::new(FakeHost::new());
        host.fill_tile(TileKey::new(0, 0), 1000, WHITE);
        let t = template(&[RED, RED], 1, GridCoord::new(0, 1));
        let mut sampler = TileSampler::new(host.clone());

        let diff = compute_diff(&t, &mut sampler).await;
        let mut coords: Vec<_> = diff.pixels.iter().map(|p| (p.grid.x, p.grid.y)).collect();
        coords.sort();
        assert_eq!(coords, vec![(0, 0), (0, 1)]);

        host.paint_grid(diff.pixels[0].grid, RED);
        sampler.begin_pass();
        let diff2 = compute_diff(&t, &mut sampler).await;
        assert_eq!(diff2.len(), 1);
        assert_ne!(diff2.pixels[0].grid, diff.pixels[0].grid);
    }

    #[tokio::test]
    async fn matching_canvas_yields_empty_diff() {
        let host = Arc::new(FakeHost::new());
        host.fill_tile(TileKey::new(0, 0), 8, RED);
        let t = template(&[RED; 4], 2, GridCoord::new(3, 3));
        let mut sampler = TileSampler::new(host);
        assert!(compute_diff(&t, &mut sampler).await.is_empty());
    }

    #[tokio::test]
    async fn missing_tile_needs_every_pixel() {
        let host = Arc::new(FakeHost::new());
        host.fill_tile(TileKey::new(0, 0), 1000, RED);
        // Row 0 sits in tile (0,0); row 1 (y = -1) sits in tile (0,-1000), never loaded.
        let t = template(&[RED, RED, RED, RED], 2, GridCoord::new(0, 0));
        let mut sampler = TileSampler::new(host);
        let diff = compute_diff(&t, &mut sampler).await;
        assert_eq!(diff.missing_tiles, 1);
        assert_eq!(diff.len(), 2);
        assert!(diff.pixels.iter().all(|p| p.grid.y == -1));
    }

    #[tokio::test]
    async fn comparison_is_byte_exact_including_alpha() {
        let host = Arc::new(FakeHost::new());
        host.fill_tile(TileKey::new(0, 0), 4, Color::rgba(0xe5, 0, 0, 0x80));
        let t = template(&[RED], 1, GridCoord::new(0, 0));
        let mut sampler = TileSampler::new(host);
        assert_eq!(compute_diff(&t, &mut sampler).await.len(), 1);
    }

    #[tokio::test]
    async fn pixels_beyond_a_small_bitmap_need_placing() {
        let host = Arc::new(FakeHost::new());
        host.fill_tile(TileKey::new(0, 0), 2, RED);
        let t = template(&[RED, RED, RED], 3, GridCoord::new(0, 0));
        let mut sampler = TileSampler::new(host);
        let diff = compute_diff(&t, &mut sampler).await;
        assert_eq!(diff.pixels.iter().map(|p| p.grid.x).collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn diffing_twice_is_identical() {
        let host = Arc::new(FakeHost::new());
        host.fill_tile(TileKey::new(0, 0), 16, WHITE);
        host.paint(TileKey::new(0, 0), 1, 2, BLUE);
        let colors = [RED, BLUE, BLUE, GREEN, RED, RED, BLUE, GREEN, RED];
        let t = template(&colors, 3, GridCoord::new(0, 4));
        let mut sampler = TileSampler::new(host);

        let a = compute_diff(&t, &mut sampler).await;
        sampler.begin_pass();
        let b = compute_diff(&t, &mut sampler).await;
        assert_eq!(a.pixels, b.pixels);
    }

    #[test]
    fn out_of_bounds_pixels_are_flagged_and_kept() {
        let sample = TileSample::rasterize(&crate::host::TileBitmap {
            width: 1,
            height: 1,
            rgba: vec![0xe5, 0, 0, 0xff].into(),
        })
        .unwrap();
        let stray = pixel(1500, RED);
        let (wrong, oob) = diff_tile(TileKey::new(0, 0), &[&stray], &sample);
        assert_eq!(oob, 1);
        assert_eq!(wrong, vec![stray]);
    }

    #[test]
    fn rarer_colors_come_first_ties_in_template_order() {
        let mut px = vec![
            pixel(0, RED),
            pixel(1, BLUE),
            pixel(2, RED),
            pixel(3, GREEN),
            pixel(4, BLUE),
            pixel(5, RED),
        ];
        order_by_rarity(&mut px);
        let order: Vec<_> = px.iter().map(|p| p.index).collect();
        assert_eq!(order, vec![3, 1, 4, 0, 2, 5]);
    }

    #[test]
    fn equally_rare_colors_interleave_by_template_order() {
        let mut px = vec![pixel(0, RED), pixel(1, BLUE), pixel(2, RED), pixel(3, BLUE)];
        order_by_rarity(&mut px);
        assert_eq!(px.iter().map(|p| p.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    proptest! {
        #[test]
        fn every_rarer_color_precedes_every_commoner_one(palette in proptest::collection::vec(0u8..6, 0..120)) {
            let mut px: Vec<_> = palette
                .iter()
                .enumerate()
                .map(|(i, c)| pixel(i, Color::rgb(*c * 40, 0, 0)))
                .collect();
            order_by_rarity(&mut px);

            let mut count: HashMap<ColorId, usize> = HashMap::new();
            for p in &px {
                *count.entry(p.color.identity()).or_default() += 1;
            }
            for w in px.windows(2) {
                let (a, b) = (count[&w[0].color.identity()], count[&w[1].color.identity()]);
                prop_assert!(a <= b);
                if a == b {
                    prop_assert!(w[0].index < w[1].index);
                }
            }
        }
    }
}
