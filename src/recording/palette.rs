//! Per-frame palette reduction.
//!
//! Every frame gets its own palette (stored as a GIF local color table), so palette
//! state never carries across frames and dropped frames cannot disturb it.
//!
//! Encoding runs in three steps:
//! 1. Frames with at most `color_count` distinct colors keep them exactly. Others get a
//!    `color_count` entry palette trained by NeuQuant.
//! 2. Pixels map to the nearest palette entry, optionally with the Floyd-Steinberg
//!    error diffusion of `image::imageops::dither`.
//! 3. For `lossy_level > 0`, palette entries are merged level by level. Each level caps
//!    the palette at `max(2, color_count * (1 - level / 10))` and merges entries closer
//!    than `level * LOSSY_TOLERANCE_STEP`. A level's result is only taken when its
//!    encoded size does not grow and its mean error does not shrink compared to the
//!    previous level, so both move monotonically with the level.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

use color_quant::NeuQuant;
use image::imageops::{self, ColorMap};
use image::{Rgba, RgbaImage};

use crate::capture::Frame;
use crate::config::{effective_color_count, RecordingConfig};
use crate::error::EncodingError;

/// Merge distance added per lossy level, in RGB euclidean units.
const LOSSY_TOLERANCE_STEP: f64 = 6.0;
const MAX_ENCODE_PIXELS: usize = 4096 * 4096;
/// NeuQuant trains on every n-th pixel; 10 is its documented speed/quality balance.
const QUANT_SAMPLE_FACTOR: i32 = 10;

type Rgb = [u8; 3];

/// A palettized frame ready for the GIF container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFrame {
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    pub palette: Vec<Rgb>,
    pub indices: Vec<u8>,
}

impl IndexedFrame {
    pub fn palette_bytes(&self) -> Vec<u8> {
        self.palette.iter().flatten().copied().collect()
    }

    /// Number of distinct palette entries referenced by pixels.
    pub fn used_colors(&self) -> usize {
        let mut seen = [false; 256];
        for &i in &self.indices {
            seen[i as usize] = true;
        }
        seen.iter().filter(|&&s| s).count()
    }

    /// Mean absolute per-channel error against the source pixels.
    pub fn mean_error(&self, original: &RgbaImage) -> f64 {
        mean_error(original, &self.palette, &self.indices)
    }

    pub(crate) fn to_gif_frame(&self) -> gif::Frame<'_> {
        gif::Frame {
            width: self.width as u16,
            height: self.height as u16,
            palette: Some(self.palette_bytes()),
            buffer: Cow::Borrowed(&self.indices),
            ..gif::Frame::default()
        }
    }

    /// Size in bytes of this frame written as a standalone GIF.
    pub fn encoded_size(&self) -> Result<usize, EncodingError> {
        let mut encoder =
            gif::Encoder::new(Vec::new(), self.width as u16, self.height as u16, &[])?;
        encoder.write_frame(&self.to_gif_frame())?;
        let bytes = encoder.into_inner().map_err(gif::EncodingError::from)?;
        Ok(bytes.len())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaletteEncoder {
    color_count: u16,
    dithering: bool,
    lossy_level: u8,
}

impl PaletteEncoder {
    /// `color_count` is expected to be validated (2..=256) by the session config.
    pub fn new(color_count: u16, dithering: bool, lossy_level: u8) -> Self {
        Self {
            color_count,
            dithering,
            lossy_level,
        }
    }

    pub fn from_config(config: &RecordingConfig) -> Self {
        Self::new(config.color_count, config.dithering, config.lossy_level)
    }

    pub fn encode(&self, frame: &Frame) -> Result<IndexedFrame, EncodingError> {
        let image = &frame.image;
        let pixels = image.width() as usize * image.height() as usize;
        if pixels == 0 {
            return Err(EncodingError::EmptyFrame);
        }
        if pixels > MAX_ENCODE_PIXELS
            || image.width() > u32::from(u16::MAX)
            || image.height() > u32::from(u16::MAX)
        {
            return Err(EncodingError::FrameTooLarge { pixels });
        }

        let max_colors = usize::from(self.color_count.clamp(2, 256));
        let palette = match distinct_colors(image, max_colors) {
            Some(colors) => colors,
            None => NeuQuant::new(QUANT_SAMPLE_FACTOR, max_colors, image.as_raw())
                .color_map_rgb()
                .chunks_exact(3)
                .map(|c| [c[0], c[1], c[2]])
                .collect(),
        };

        let indices = remap(image, &palette, self.dithering);

        let base = IndexedFrame {
            seq: frame.seq,
            width: image.width(),
            height: image.height(),
            palette,
            indices,
        };

        if self.lossy_level == 0 {
            return Ok(base);
        }
        self.apply_lossy(image, base)
    }

    fn apply_lossy(
        &self,
        image: &RgbaImage,
        base: IndexedFrame,
    ) -> Result<IndexedFrame, EncodingError> {
        let mut population = vec![0u64; base.palette.len()];
        for &i in &base.indices {
            population[i as usize] += 1;
        }
        let mut clusters: Vec<Cluster> = population
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(entry, &count)| Cluster {
                members: vec![entry],
                rep: entry,
                population: count,
            })
            .collect();

        let mut best_size = base.encoded_size()?;
        let mut best_error = base.mean_error(image);
        let mut best = base.clone();

        for level in 1..=self.lossy_level {
            let cap = usize::from(effective_color_count(self.color_count, level));
            let tolerance = f64::from(level) * LOSSY_TOLERANCE_STEP;
            let tolerance_sq = tolerance * tolerance;

            let mut merged = false;
            while clusters.len() > 2 {
                let Some((a, b, dist_sq)) = closest_pair(&clusters, &base.palette) else {
                    break;
                };
                if clusters.len() <= cap && dist_sq as f64 >= tolerance_sq {
                    break;
                }
                merge(&mut clusters, a, b);
                merged = true;
            }
            // The first level also drops unused entries, so it is always evaluated.
            if !merged && level > 1 {
                continue;
            }

            let candidate = build_from_clusters(&base, &clusters);
            let size = candidate.encoded_size()?;
            let error = candidate.mean_error(image);
            if size <= best_size && error >= best_error {
                best_size = size;
                best_error = error;
                best = candidate;
            }
        }

        tracing::trace!(
            seq = best.seq,
            colors = best.palette.len(),
            size = best_size,
            "lossy palette applied"
        );
        Ok(best)
    }
}

/// The frame's colors in sorted order, or `None` when there are more than `max`.
fn distinct_colors(image: &RgbaImage, max: usize) -> Option<Vec<Rgb>> {
    let mut colors = BTreeSet::new();
    for p in image.pixels() {
        if colors.insert([p[0], p[1], p[2]]) && colors.len() > max {
            return None;
        }
    }
    Some(colors.into_iter().collect())
}

fn distance_sq(a: Rgb, b: Rgb) -> u32 {
    (0..3)
        .map(|c| {
            let d = i32::from(a[c]) - i32::from(b[c]);
            (d * d) as u32
        })
        .sum()
}

fn nearest(palette: &[Rgb], color: Rgb) -> u8 {
    let mut best = (u32::MAX, 0usize);
    for (i, &entry) in palette.iter().enumerate() {
        let d = distance_sq(entry, color);
        if d < best.0 {
            best = (d, i);
            if d == 0 {
                break;
            }
        }
    }
    best.1 as u8
}

fn remap(image: &RgbaImage, palette: &[Rgb], dithering: bool) -> Vec<u8> {
    let map = NearestColor::new(palette);
    // Error diffusion needs a right-hand neighbour on every row.
    if dithering && image.width() > 1 {
        let mut dithered = image.clone();
        imageops::dither(&mut dithered, &map);
        imageops::index_colors(&dithered, &map).into_raw()
    } else {
        imageops::index_colors(image, &map).into_raw()
    }
}

/// Exact nearest-entry lookup over a frame palette, memoized per source color.
struct NearestColor<'a> {
    palette: &'a [Rgb],
    cache: RefCell<HashMap<Rgb, u8>>,
}

impl<'a> NearestColor<'a> {
    fn new(palette: &'a [Rgb]) -> Self {
        Self {
            palette,
            cache: RefCell::new(HashMap::new()),
        }
    }
}

impl ColorMap for NearestColor<'_> {
    type Color = Rgba<u8>;

    fn index_of(&self, color: &Rgba<u8>) -> usize {
        let key = [color[0], color[1], color[2]];
        let index = *self
            .cache
            .borrow_mut()
            .entry(key)
            .or_insert_with(|| nearest(self.palette, key));
        usize::from(index)
    }

    fn lookup(&self, index: usize) -> Option<Rgba<u8>> {
        self.palette.get(index).map(|c| Rgba([c[0], c[1], c[2], 255]))
    }

    fn has_lookup(&self) -> bool {
        true
    }

    fn map_color(&self, color: &mut Rgba<u8>) {
        let entry = self.palette[self.index_of(color)];
        *color = Rgba([entry[0], entry[1], entry[2], 255]);
    }
}

fn mean_error(original: &RgbaImage, palette: &[Rgb], indices: &[u8]) -> f64 {
    let total: u64 = original
        .pixels()
        .zip(indices)
        .map(|(p, &i)| {
            let q = palette[i as usize];
            (0..3).map(|c| u64::from(p[c].abs_diff(q[c]))).sum::<u64>()
        })
        .sum();
    let samples = indices.len().max(1) as f64 * 3.0;
    total as f64 / samples
}

/// A group of base palette entries drawn with one color. The representative is the
/// most used member, so coarser groupings always reuse a color of a finer one.
#[derive(Debug, Clone)]
struct Cluster {
    members: Vec<usize>,
    rep: usize,
    population: u64,
}

fn closest_pair(clusters: &[Cluster], palette: &[Rgb]) -> Option<(usize, usize, u32)> {
    let mut best: Option<(usize, usize, u32)> = None;
    for a in 0..clusters.len() {
        for b in a + 1..clusters.len() {
            let d = distance_sq(palette[clusters[a].rep], palette[clusters[b].rep]);
            if best.map_or(true, |(_, _, bd)| d < bd) {
                best = Some((a, b, d));
            }
        }
    }
    best
}

fn merge(clusters: &mut Vec<Cluster>, a: usize, b: usize) {
    let absorbed = clusters.remove(b);
    let target = &mut clusters[a];
    if absorbed.population > target.population
        || (absorbed.population == target.population && absorbed.rep < target.rep)
    {
        target.rep = absorbed.rep;
    }
    target.population += absorbed.population;
    target.members.extend(absorbed.members);
}

fn build_from_clusters(base: &IndexedFrame, clusters: &[Cluster]) -> IndexedFrame {
    let mut ordinals = [0u8; 256];
    for (ordinal, cluster) in clusters.iter().enumerate() {
        for &member in &cluster.members {
            ordinals[member] = ordinal as u8;
        }
    }
    IndexedFrame {
        seq: base.seq,
        width: base.width,
        height: base.height,
        palette: clusters.iter().map(|c| base.palette[c.rep]).collect(),
        indices: base.indices.iter().map(|&i| ordinals[i as usize]).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::time::Duration;

    fn frame(image: RgbaImage) -> Frame {
        Frame::new(0, Duration::ZERO, image)
    }

    fn gradient(width: u32, height: u32) -> RgbaImage {
        let mut image = RgbaImage::new(width, height);
        for (x, y, p) in image.enumerate_pixels_mut() {
            let r = (x * 255 / (width - 1)) as u8;
            let g = (y * 255 / (height - 1)) as u8;
            let b = ((x + y) * 127 / (width + height - 2)) as u8;
            *p = Rgba([r, g, b, 255]);
        }
        image
    }

    /// Gradient with a checker texture so lossy merging has work to do.
    fn screenshot_like(width: u32, height: u32) -> RgbaImage {
        let mut image = gradient(width, height);
        for (x, y, p) in image.enumerate_pixels_mut() {
            if (x / 4 + y / 4) % 2 == 0 {
                p[2] = p[2].saturating_add(40);
            }
            if x % 17 == 0 {
                *p = Rgba([250, 250, 250, 255]);
            }
        }
        image
    }

    #[test]
    fn test_exact_palette_for_few_colors() {
        let mut image = RgbaImage::from_pixel(6, 2, Rgba([255, 0, 0, 255]));
        image.put_pixel(1, 0, Rgba([0, 255, 0, 255]));
        image.put_pixel(2, 1, Rgba([0, 0, 255, 255]));
        let encoded = PaletteEncoder::new(256, true, 0)
            .encode(&frame(image.clone()))
            .unwrap();
        assert_eq!(encoded.palette.len(), 3);
        assert_eq!(encoded.mean_error(&image), 0.0);
        assert_eq!(encoded.indices.len(), 12);
    }

    #[test]
    fn test_palette_respects_color_count() {
        let image = gradient(64, 64);
        for colors in [2u16, 5, 16, 64, 256] {
            let encoded = PaletteEncoder::new(colors, false, 0)
                .encode(&frame(image.clone()))
                .unwrap();
            assert!(encoded.palette.len() <= colors as usize);
            assert!(encoded.indices.iter().all(|&i| (i as usize) < encoded.palette.len()));
        }
    }

    #[test]
    fn test_two_color_dithered_gradient_is_mixed_not_split() {
        let image = RgbaImage::from_fn(128, 16, |x, _| {
            let v = (x * 2) as u8;
            Rgba([v, v, v, 255])
        });
        let palette = [[0, 0, 0], [255, 255, 255]];

        // Without dithering the row splits once at mid-gray.
        let plain = remap(&image, &palette, false);
        let row = &plain[8 * 128..9 * 128];
        assert!(row[..64].iter().all(|&i| i == 0));
        assert!(row[64..].iter().all(|&i| i == 1));

        // With it both colors alternate across the middle of the ramp.
        let dithered = remap(&image, &palette, true);
        let middle = &dithered[8 * 128 + 40..8 * 128 + 88];
        assert!(middle.contains(&0) && middle.contains(&1));
    }

    #[test]
    fn test_single_column_frame_skips_diffusion() {
        let image = RgbaImage::from_fn(1, 4, |_, y| Rgba([(y * 60) as u8, 0, 0, 255]));
        let indices = remap(&image, &[[0, 0, 0], [255, 0, 0]], true);
        assert_eq!(indices, vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_many_colors_use_the_quantizer() {
        let image = gradient(64, 64);
        let encoded = PaletteEncoder::new(16, true, 0).encode(&frame(image.clone())).unwrap();
        assert_eq!(encoded.palette.len(), 16);
        assert!(encoded.used_colors() > 1);
        assert!(encoded.mean_error(&image) > 0.0);
    }

    #[test]
    fn test_dithering_changes_mapping_not_palette() {
        let image = gradient(96, 32);
        let plain = PaletteEncoder::new(4, false, 0)
            .encode(&frame(image.clone()))
            .unwrap();
        let dithered = PaletteEncoder::new(4, true, 0).encode(&frame(image)).unwrap();
        assert_eq!(plain.palette, dithered.palette);
        assert_ne!(plain.indices, dithered.indices);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let image = screenshot_like(48, 40);
        let encoder = PaletteEncoder::new(32, true, 4);
        let a = encoder.encode(&frame(image.clone())).unwrap();
        let b = encoder.encode(&frame(image)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_size_and_error_monotonic_in_lossy_level() {
        for dithering in [false, true] {
            let image = screenshot_like(80, 60);
            let mut previous: Option<(usize, f64)> = None;
            for level in 0..=10u8 {
                let encoded = PaletteEncoder::new(64, dithering, level)
                    .encode(&frame(image.clone()))
                    .unwrap();
                let size = encoded.encoded_size().unwrap();
                let error = encoded.mean_error(&image);
                if let Some((prev_size, prev_error)) = previous {
                    assert!(size <= prev_size, "level {} grew {} -> {}", level, prev_size, size);
                    assert!(error >= prev_error, "level {} error shrank", level);
                }
                previous = Some((size, error));
            }
        }
    }

    #[test]
    fn test_high_lossy_level_shrinks_palette() {
        let image = screenshot_like(64, 64);
        let lossless = PaletteEncoder::new(128, false, 0)
            .encode(&frame(image.clone()))
            .unwrap();
        let lossy = PaletteEncoder::new(128, false, 10).encode(&frame(image)).unwrap();
        assert!(lossy.palette.len() < lossless.palette.len());
    }

    #[test]
    fn test_empty_frame_is_an_error() {
        let result = PaletteEncoder::new(16, false, 0).encode(&frame(RgbaImage::new(0, 0)));
        assert!(matches!(result, Err(EncodingError::EmptyFrame)));
    }

    #[test]
    fn test_merge_keeps_most_used_representative() {
        let mut clusters = vec![
            Cluster {
                members: vec![0],
                rep: 0,
                population: 5,
            },
            Cluster {
                members: vec![1],
                rep: 1,
                population: 9,
            },
        ];
        merge(&mut clusters, 0, 1);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].rep, 1);
        assert_eq!(clusters[0].population, 14);
        assert_eq!(clusters[0].members, vec![0, 1]);
    }
}
