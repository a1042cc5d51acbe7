use crate::transform_2d::AffineTransform2D;

/// Factor between the two difference-of-Gaussians sigmas.
pub const DOG_SIGMA_RATIO: f64 = 1.6;

/// Spatial support radius of the DoG filter for a given detection sigma, in
/// slices. The wider of the two Gaussians (`sigma * DOG_SIGMA_RATIO`)
/// determines the kernel half-width; one extra slice covers the sub-pixel
/// localization neighborhood.
pub fn dog_radius(sigma: f64) -> i64 {
    (3.0 * sigma * DOG_SIGMA_RATIO).ceil() as i64 + 1
}

/// How pixel intensities are mapped to the detector's `[0, 1]` working
/// range.
///
/// `AutoPerSlice` derives the range from each slice's own minimum and
/// maximum instead of a fixed pair of bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IntensityBounds {
    /// Clip to the fixed range `[min, max]`.
    Fixed { min: f64, max: f64 },
    /// Determine min/max per slice.
    AutoPerSlice,
}

/// Per-channel detection parameters shared by all blocks of one block
/// series.
#[derive(Debug, Clone)]
pub struct ChannelBlockParams {
    /// Channel key, e.g. `Ch488+561+647nm`.
    pub channel: String,
    /// Camera key, e.g. `cam1`.
    pub cam: String,
    /// Pull-back camera un-warp transform applied to every slice before
    /// detection.
    pub cam_transform: AffineTransform2D,
    /// Blob detection scale.
    pub sigma: f64,
    /// Minimum DoG response for a detection.
    pub threshold: f64,
    /// Intensity mapping applied before detection.
    pub intensity: IntensityBounds,
}

/// One unit of detection work: a contiguous chunk of the requested depth
/// range, for one channel and camera.
///
/// The block owns the *authoritative* range `[from, to]` (inclusive slice
/// indices). Its detection window is wider by `gauss_overhead` on each side
/// so blobs near the block boundary are seen with full filter support, but
/// a detected point is kept only if it falls inside the authoritative range
/// (within half a slice of tolerance, see [`Block::owns_z`]). Consecutive
/// blocks therefore overlap in raw pixels while owning disjoint depth
/// ranges, which is what makes the parallel merge a plain union.
#[derive(Debug, Clone)]
pub struct Block {
    /// First slice of the authoritative range (inclusive).
    pub from: i64,
    /// Last slice of the authoritative range (inclusive).
    pub to: i64,
    /// Channel key.
    pub channel: String,
    /// Camera key.
    pub cam: String,
    /// Pull-back camera un-warp transform.
    pub cam_transform: AffineTransform2D,
    /// Blob detection scale.
    pub sigma: f64,
    /// Minimum DoG response for a detection.
    pub threshold: f64,
    /// Intensity mapping applied before detection.
    pub intensity: IntensityBounds,
    /// Extra slices read on each side of the authoritative range, derived
    /// from `sigma`.
    pub gauss_overhead: i64,
}

impl Block {
    pub fn new(from: i64, to: i64, params: &ChannelBlockParams) -> Block {
        assert!(to >= from, "block range must not be empty");
        Block {
            from,
            to,
            channel: params.channel.clone(),
            cam: params.cam.clone(),
            cam_transform: params.cam_transform,
            sigma: params.sigma,
            threshold: params.threshold,
            intensity: params.intensity,
            gauss_overhead: dog_radius(params.sigma),
        }
    }

    /// The slice range actually read for detection: the authoritative range
    /// extended by the Gauss overhead on both sides, clamped to the global
    /// range `[first_slice, last_slice]`.
    pub fn detection_window(&self, first_slice: i64, last_slice: i64) -> (i64, i64) {
        (
            (self.from - self.gauss_overhead).max(first_slice),
            (self.to + self.gauss_overhead).min(last_slice),
        )
    }

    /// Whether a detected z coordinate belongs to this block. Half a slice
    /// of slack on either end tolerates sub-pixel localization jitter at
    /// the block boundaries.
    pub fn owns_z(&self, z: f64) -> bool {
        z > self.from as f64 - 0.5 && z < self.to as f64 + 0.5
    }
}

/// Tiles the depth range `[first_slice, last_slice]` into
/// `ceil(num_slices / block_size)` contiguous blocks of nominally
/// `block_size` slices for one channel.
///
/// The authoritative ranges tile the requested range exactly, with no gaps
/// and no overlap; only the detection windows overlap. A pairwise alignment
/// task plans two independent series, one per channel, since the channels
/// may use different cameras, transforms, and thresholds.
///
/// # Panics
/// Panics if `block_size` is not positive or the range is empty.
pub fn plan_blocks(
    first_slice: i64,
    last_slice: i64,
    block_size: i64,
    params: &ChannelBlockParams,
) -> Vec<Block> {
    assert!(block_size > 0, "block size must be positive");
    assert!(
        last_slice >= first_slice,
        "slice range must not be empty"
    );

    let num_slices = last_slice - first_slice + 1;
    let num_blocks = num_slices / block_size + if num_slices % block_size > 0 { 1 } else { 0 };

    let mut blocks = Vec::with_capacity(num_blocks as usize);
    for i in 0..num_blocks {
        let from = first_slice + i * block_size;
        let to = (from + block_size - 1).min(last_slice);
        blocks.push(Block::new(from, to, params));
    }
    blocks
}
