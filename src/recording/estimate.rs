use crate::config::RecordingConfig;

const HEADER_BYTES: f64 = 1024.0;
const COMPRESSION_RATIO: f64 = 0.7;

/// Rough output size in bytes for `frames` raw captures of a `width` x `height` region.
///
/// Accounts for decimation, scaling and the effective palette. Each frame carries its own
/// local color table. The pixel term assumes LZW saves about 30%, so real files with
/// static content come out much smaller.
pub fn estimate_gif_size(frames: u64, width: u32, height: u32, config: &RecordingConfig) -> u64 {
    let scale = f64::from(config.scale_factor.clamp(f32::MIN_POSITIVE, 1.0));
    let effective_width = (f64::from(width) * scale).floor();
    let effective_height = (f64::from(height) * scale).floor();
    let effective_frames = frames / u64::from(config.skip_value.max(1));

    let colors = config.effective_color_count();
    let bits_per_pixel = match colors {
        0..=2 => 1.0,
        3..=4 => 2.0,
        5..=16 => 4.0,
        _ => 8.0,
    };

    let palette_bytes = f64::from(colors) * 3.0 * effective_frames as f64;
    let pixel_bytes = effective_width * effective_height * (bits_per_pixel / 8.0)
        * effective_frames as f64
        * COMPRESSION_RATIO;

    (HEADER_BYTES + palette_bytes + pixel_bytes) as u64
}
