//! Frame-to-frame similarity.
//!
//! Two fast paths run before the weighted score:
//! - frames whose 8x8 color thumbnails match score 1.0 and are treated as unchanged;
//! - frames whose strong-edge layout on a 16x16 grayscale grid differs score 0.0.
//!
//! Otherwise the score is a weighted mean of four terms, each in [0.0, 1.0]:
//! pixel similarity (0.2), color histogram similarity (0.2), edge map correlation (0.3)
//! and the share of unchanged 8x8 blocks (0.3). The block term keeps small localized
//! edits, like typing, from being averaged away on large regions.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbaImage};

use crate::capture::Frame;

const BLOCK_SIZE: u32 = 8;
/// Mean per-channel change above which an 8x8 block counts as changed.
const BLOCK_CHANGE_THRESHOLD: f64 = 10.0;
const THUMBNAIL_SIZE: u32 = 8;
const LAYOUT_SIZE: u32 = 16;
const EDGE_MAP_SIZE: u32 = 64;
const FLAT_EPSILON: f64 = 1e-9;

const PIXEL_WEIGHT: f64 = 0.2;
const HISTOGRAM_WEIGHT: f64 = 0.2;
const EDGE_WEIGHT: f64 = 0.3;
const BLOCK_WEIGHT: f64 = 0.3;

type Histogram = [[u32; 256]; 3];

/// The parts of a frame that are compared without looking at the other frame.
#[derive(Debug, Clone)]
struct Signature {
    thumbnail: Vec<u8>,
    layout: Vec<bool>,
    edges: Vec<f64>,
    histogram: Histogram,
}

impl Signature {
    /// `image` must not be empty.
    fn of(image: &RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        let thumbnail = RgbaImage::from_fn(THUMBNAIL_SIZE, THUMBNAIL_SIZE, |x, y| {
            *image.get_pixel(
                grid_center(x, width, THUMBNAIL_SIZE),
                grid_center(y, height, THUMBNAIL_SIZE),
            )
        });

        let gray = imageops::grayscale(image);
        let grid = GrayImage::from_fn(LAYOUT_SIZE, LAYOUT_SIZE, |x, y| {
            *gray.get_pixel(
                grid_center(x, width, LAYOUT_SIZE),
                grid_center(y, height, LAYOUT_SIZE),
            )
        });
        let grid_edges = edge_map(&grid);
        let (mean, std) = mean_std(&grid_edges);
        let layout = grid_edges.iter().map(|&e| e > mean + std).collect();

        let small = imageops::resize(&gray, EDGE_MAP_SIZE, EDGE_MAP_SIZE, FilterType::Lanczos3);

        Self {
            thumbnail: thumbnail.into_raw(),
            layout,
            edges: edge_map(&small),
            histogram: channel_histograms(image),
        }
    }
}

/// Pixel sampled for cell `index` of a `cells`-wide grid laid over `extent` pixels.
fn grid_center(index: u32, extent: u32, cells: u32) -> u32 {
    ((2 * u64::from(index) + 1) * u64::from(extent) / (2 * u64::from(cells))) as u32
}

/// Absolute difference to the lower neighbour plus the one to the right, for every
/// pixel that has both.
fn edge_map(gray: &GrayImage) -> Vec<f64> {
    let (width, height) = gray.dimensions();
    let (inner_w, inner_h) = (width.saturating_sub(1), height.saturating_sub(1));
    let mut edges = Vec::with_capacity(inner_w as usize * inner_h as usize);
    for y in 0..inner_h {
        for x in 0..inner_w {
            let here = gray.get_pixel(x, y)[0];
            let below = gray.get_pixel(x, y + 1)[0];
            let right = gray.get_pixel(x + 1, y)[0];
            edges.push(f64::from(here.abs_diff(below)) + f64::from(here.abs_diff(right)));
        }
    }
    edges
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

fn channel_histograms(image: &RgbaImage) -> Histogram {
    let mut histogram = [[0u32; 256]; 3];
    for p in image.pixels() {
        for (channel, bins) in histogram.iter_mut().enumerate() {
            bins[usize::from(p[channel])] += 1;
        }
    }
    histogram
}

/// `1 - chi² / 6` over the normalized RGB histograms. Each channel contributes at most 2.
fn histogram_similarity(a: &Histogram, b: &Histogram) -> f64 {
    let mut distance = 0.0;
    for (bins_a, bins_b) in a.iter().zip(b) {
        let total_a = bins_a.iter().map(|&c| u64::from(c)).sum::<u64>().max(1) as f64;
        let total_b = bins_b.iter().map(|&c| u64::from(c)).sum::<u64>().max(1) as f64;
        for (&count_a, &count_b) in bins_a.iter().zip(bins_b) {
            let p = f64::from(count_a) / total_a;
            let q = f64::from(count_b) / total_b;
            if p + q > 0.0 {
                distance += (p - q).powi(2) / (p + q);
            }
        }
    }
    (1.0 - distance / 6.0).clamp(0.0, 1.0)
}

/// Pearson correlation of two edge maps, mapped from [-1, 1] to [0, 1]. Flat maps have
/// no defined correlation and score 1.0 only when equal.
fn edge_correlation(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mean_a, std_a) = mean_std(a);
    let (mean_b, std_b) = mean_std(b);
    if std_a < FLAT_EPSILON || std_b < FLAT_EPSILON {
        return if a == b { 1.0 } else { 0.0 };
    }
    let covariance = a
        .iter()
        .zip(b)
        .map(|(x, y)| (x - mean_a) * (y - mean_b))
        .sum::<f64>()
        / a.len() as f64;
    ((covariance / (std_a * std_b) + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Pixel similarity (`1 - meanAbsDiff / 255` over RGB) and the fraction of 8x8 blocks
/// whose mean change stays at or below 10. Both images must have the same size.
fn difference_terms(prev: &RgbaImage, curr: &RgbaImage) -> (f64, f64) {
    let (width, height) = prev.dimensions();
    let blocks_x = width / BLOCK_SIZE;
    let blocks_y = height / BLOCK_SIZE;
    let mut block_sums = vec![0u64; (blocks_x * blocks_y) as usize];
    let mut total: u64 = 0;

    for (y, (row_a, row_b)) in prev.rows().zip(curr.rows()).enumerate() {
        let by = y as u32 / BLOCK_SIZE;
        for (x, (a, b)) in row_a.zip(row_b).enumerate() {
            let diff = (0..3)
                .map(|c| u64::from(a[c].abs_diff(b[c])))
                .sum::<u64>();
            total += diff;
            let bx = x as u32 / BLOCK_SIZE;
            if bx < blocks_x && by < blocks_y {
                block_sums[(by * blocks_x + bx) as usize] += diff;
            }
        }
    }

    let samples = f64::from(width) * f64::from(height) * 3.0;
    let pixel = (1.0 - (total as f64 / samples) / 255.0).clamp(0.0, 1.0);

    let block = if block_sums.is_empty() {
        1.0
    } else {
        let block_samples = f64::from(BLOCK_SIZE * BLOCK_SIZE * 3);
        let unchanged = block_sums
            .iter()
            .filter(|&&sum| sum as f64 / block_samples <= BLOCK_CHANGE_THRESHOLD)
            .count();
        unchanged as f64 / block_sums.len() as f64
    };
    (pixel, block)
}

/// Both images must be non-empty and of equal size.
fn compare(
    prev: &RgbaImage,
    prev_sig: &Signature,
    curr: &RgbaImage,
    curr_sig: &Signature,
) -> f64 {
    if prev_sig.thumbnail == curr_sig.thumbnail {
        return 1.0;
    }
    if prev_sig.layout != curr_sig.layout {
        return 0.0;
    }
    let (pixel, block) = difference_terms(prev, curr);
    let score = PIXEL_WEIGHT * pixel
        + HISTOGRAM_WEIGHT * histogram_similarity(&prev_sig.histogram, &curr_sig.histogram)
        + EDGE_WEIGHT * edge_correlation(&prev_sig.edges, &curr_sig.edges)
        + BLOCK_WEIGHT * block;
    score.clamp(0.0, 1.0)
}

/// Similarity in [0.0, 1.0] between two frames. Identical frames score 1.0, frames of
/// different sizes 0.0.
pub fn similarity_score(prev: &RgbaImage, curr: &RgbaImage) -> f64 {
    if prev.dimensions() != curr.dimensions() {
        return 0.0;
    }
    if prev.width() == 0 || prev.height() == 0 {
        return 1.0;
    }
    compare(prev, &Signature::of(prev), curr, &Signature::of(curr))
}

/// Contract form of the filter: drop `curr` when it scores at or above `threshold`
/// against `prev`. Without a previous frame the frame is always kept.
pub fn should_keep(prev: Option<&RgbaImage>, curr: &RgbaImage, threshold: f32) -> bool {
    match prev {
        None => true,
        Some(prev) => similarity_score(prev, curr) < f64::from(threshold),
    }
}

/// Drops frames that are too close to the last frame it kept.
pub struct SimilarityFilter {
    enabled: bool,
    threshold: f32,
    reference: Option<(RgbaImage, Signature)>,
}

impl SimilarityFilter {
    pub fn new(enabled: bool, threshold: f32) -> Self {
        Self {
            enabled,
            threshold,
            reference: None,
        }
    }

    pub fn should_keep(&mut self, frame: &Frame) -> bool {
        let image = &frame.image;
        // Empty frames pass through for the encoder to reject.
        if !self.enabled || image.width() == 0 || image.height() == 0 {
            return true;
        }

        let signature = Signature::of(image);
        let keep = match &self.reference {
            None => true,
            Some((prev, prev_sig)) => {
                let score = if prev.dimensions() == image.dimensions() {
                    compare(prev, prev_sig, image, &signature)
                } else {
                    0.0
                };
                score < f64::from(self.threshold)
            }
        };
        if keep {
            self.reference = Some((image.clone(), signature));
        }
        keep
    }

    pub fn reset(&mut self) {
        self.reference = None;
    }
}
