//! Difference-of-Gaussians interest point detection over one block's
//! detection window.
//!
//! The window's slices are un-warped (stack alignment composed with the
//! camera transform), normalized to `[0, 1]`, blurred with two Gaussians
//! (`sigma` and `sigma * DOG_SIGMA_RATIO`) separably in x, y and z, and
//! subtracted. Strict local maxima of the difference volume above the
//! block's threshold become interest points, localized to sub-pixel
//! precision by a per-axis quadratic fit. Points outside the block's
//! authoritative range are discarded so that overlapping detection windows
//! never produce duplicates across blocks.
//!
//! All work happens on the calling thread; parallelism is at block
//! granularity, one task per block.

use log::{debug, warn};

use crate::block::{Block, IntensityBounds, DOG_SIGMA_RATIO};
use crate::interest_point::InterestPoint;
use crate::slice_image::SliceImage;
use crate::slice_source::{GeometryMetadata, SliceSource, SliceUnavailable};

/// Detects interest points in one block.
///
/// Recoverable conditions are absorbed here: a failed slice read drops the
/// whole block's contribution with a warning, and a block with zero
/// detections is reported but not an error. Returned point ids are local to
/// the block; the aggregation step re-assigns them.
pub fn detect_block<S, G>(
    source: &S,
    geometry: &G,
    block: &Block,
    first_slice: i64,
    last_slice: i64,
) -> Vec<InterestPoint>
where
    S: SliceSource + ?Sized,
    G: GeometryMetadata + ?Sized,
{
    match detect_block_inner(source, geometry, block, first_slice, last_slice) {
        Ok(points) => {
            if points.is_empty() {
                warn!(
                    "block {}..{} of {} (cam={}) has 0 detections",
                    block.from, block.to, block.channel, block.cam
                );
            } else {
                debug!(
                    "block {}..{} of {} (cam={}): {} points",
                    block.from,
                    block.to,
                    block.channel,
                    block.cam,
                    points.len()
                );
            }
            points
        }
        Err(e) => {
            warn!(
                "dropping block {}..{} of {} (cam={}): {}",
                block.from, block.to, block.channel, block.cam, e
            );
            Vec::new()
        }
    }
}

fn detect_block_inner<S, G>(
    source: &S,
    geometry: &G,
    block: &Block,
    first_slice: i64,
    last_slice: i64,
) -> Result<Vec<InterestPoint>, SliceUnavailable>
where
    S: SliceSource + ?Sized,
    G: GeometryMetadata + ?Sized,
{
    let (win_from, win_to) = block.detection_window(first_slice, last_slice);

    let mut window = Vec::with_capacity((win_to - win_from + 1) as usize);
    for slice_index in win_from..=win_to {
        let raw = source.read_slice(&block.channel, &block.cam, slice_index)?;
        let pull = block
            .cam_transform
            .compose(&geometry.alignment_transform(&block.channel, slice_index));
        let warped = raw.warped_by(&pull);
        let normalized = match block.intensity {
            IntensityBounds::Fixed { min, max } => warped.normalized(min, max),
            IntensityBounds::AutoPerSlice => {
                let (min, max) = warped.min_max();
                warped.normalized(min as f64, max as f64)
            }
        };
        window.push(normalized);
    }

    let dog = dog_volume(&window, block.sigma);
    let maxima = local_maxima(&dog, block.threshold as f32);

    let mut points = Vec::new();
    for (id, (x, y, z_local, value)) in maxima.into_iter().enumerate() {
        let z = z_local + win_from as f64;
        if block.owns_z(z) {
            points.push(InterestPoint::with_intensity(id, [x, y, z], value as f64));
        }
    }
    Ok(points)
}

/// Computes the difference-of-Gaussians volume `blur(sigma) -
/// blur(sigma * DOG_SIGMA_RATIO)` of a slice window.
fn dog_volume(window: &[SliceImage], sigma: f64) -> Vec<SliceImage> {
    let narrow = gaussian_blur_3d(window, sigma);
    let wide = gaussian_blur_3d(window, sigma * DOG_SIGMA_RATIO);
    narrow
        .into_iter()
        .zip(wide)
        .map(|(mut n, w)| {
            for (nv, wv) in n.data.iter_mut().zip(&w.data) {
                *nv -= *wv;
            }
            n
        })
        .collect()
}

/// Separable 3-D Gaussian blur with replicate borders: one x pass and one y
/// pass per slice, then one pass along z across slices.
fn gaussian_blur_3d(window: &[SliceImage], sigma: f64) -> Vec<SliceImage> {
    let kernel = gaussian_kernel(sigma);
    let half = kernel.len() / 2;

    let blurred_xy: Vec<SliceImage> = window
        .iter()
        .map(|slice| blur_slice_y(&blur_slice_x(slice, &kernel, half), &kernel, half))
        .collect();

    // z pass, clamping slice indices at the window ends
    let depth = blurred_xy.len();
    let mut out = Vec::with_capacity(depth);
    for s in 0..depth {
        let mut slice = SliceImage::new(blurred_xy[s].width, blurred_xy[s].height);
        for (t, &k) in kernel.iter().enumerate() {
            let src = (s as i64 + t as i64 - half as i64).clamp(0, depth as i64 - 1) as usize;
            for (o, &v) in slice.data.iter_mut().zip(&blurred_xy[src].data) {
                *o += k * v;
            }
        }
        out.push(slice);
    }
    out
}

fn blur_slice_x(slice: &SliceImage, kernel: &[f32], half: usize) -> SliceImage {
    let mut out = SliceImage::new(slice.width, slice.height);
    for y in 0..slice.height {
        for x in 0..slice.width {
            let mut acc = 0.0;
            for (t, &k) in kernel.iter().enumerate() {
                let sx = (x as i64 + t as i64 - half as i64).clamp(0, slice.width as i64 - 1);
                acc += k * slice.data[y * slice.width + sx as usize];
            }
            out.data[y * slice.width + x] = acc;
        }
    }
    out
}

fn blur_slice_y(slice: &SliceImage, kernel: &[f32], half: usize) -> SliceImage {
    let mut out = SliceImage::new(slice.width, slice.height);
    for y in 0..slice.height {
        for x in 0..slice.width {
            let mut acc = 0.0;
            for (t, &k) in kernel.iter().enumerate() {
                let sy = (y as i64 + t as i64 - half as i64).clamp(0, slice.height as i64 - 1);
                acc += k * slice.data[sy as usize * slice.width + x];
            }
            out.data[y * slice.width + x] = acc;
        }
    }
    out
}

/// Normalized 1-D Gaussian kernel with half-width `ceil(3 * sigma)`.
fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    let half = (3.0 * sigma).ceil() as i64;
    let inv_two_sigma_sq = 1.0 / (2.0 * sigma * sigma);
    let mut kernel: Vec<f32> = (-half..=half)
        .map(|t| (-(t * t) as f64 * inv_two_sigma_sq).exp() as f32)
        .collect();
    let sum: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// Finds strict local maxima of the DoG volume over the 26-neighborhood,
/// above `threshold`, refined per axis by quadratic interpolation. Returns
/// `(x, y, z, value)` tuples with z local to the window. Voxels on the
/// volume boundary are skipped since their neighborhood is incomplete.
fn local_maxima(dog: &[SliceImage], threshold: f32) -> Vec<(f64, f64, f64, f32)> {
    let mut maxima = Vec::new();
    if dog.len() < 3 {
        return maxima;
    }
    let width = dog[0].width;
    let height = dog[0].height;

    for s in 1..dog.len() - 1 {
        for y in 1..height - 1 {
            for x in 1..width - 1 {
                let v = dog[s].data[y * width + x];
                if v <= threshold {
                    continue;
                }
                let mut is_max = true;
                'neighbors: for dz in -1i64..=1 {
                    for dy in -1i64..=1 {
                        for dx in -1i64..=1 {
                            if dx == 0 && dy == 0 && dz == 0 {
                                continue;
                            }
                            let n = dog[(s as i64 + dz) as usize].data
                                [((y as i64 + dy) as usize) * width + (x as i64 + dx) as usize];
                            if n >= v {
                                is_max = false;
                                break 'neighbors;
                            }
                        }
                    }
                }
                if !is_max {
                    continue;
                }

                let ox = quadratic_offset(
                    dog[s].data[y * width + x - 1],
                    v,
                    dog[s].data[y * width + x + 1],
                );
                let oy = quadratic_offset(
                    dog[s].data[(y - 1) * width + x],
                    v,
                    dog[s].data[(y + 1) * width + x],
                );
                let oz = quadratic_offset(
                    dog[s - 1].data[y * width + x],
                    v,
                    dog[s + 1].data[y * width + x],
                );
                maxima.push((x as f64 + ox, y as f64 + oy, s as f64 + oz, v));
            }
        }
    }
    maxima
}

/// Sub-pixel offset of a parabola through three samples, clamped to
/// `[-0.5, 0.5]`.
fn quadratic_offset(prev: f32, center: f32, next: f32) -> f64 {
    let denom = prev - 2.0 * center + next;
    if denom.abs() < 1e-12 {
        return 0.0;
    }
    (0.5 * (prev - next) / denom).clamp(-0.5, 0.5) as f64
}
