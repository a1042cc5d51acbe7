use std::collections::HashMap;

use thiserror::Error;

use crate::slice_image::SliceImage;
use crate::transform_2d::AffineTransform2D;

/// Error returned when a slice cannot be read. The pipeline treats this as
/// "slice unavailable": the affected block contributes nothing and the run
/// continues.
#[derive(Debug, Error)]
#[error("slice {slice_index} of {channel}/{cam} unavailable: {reason}")]
pub struct SliceUnavailable {
    pub channel: String,
    pub cam: String,
    pub slice_index: i64,
    pub reason: String,
}

/// Access to the raw per-slice image data of one stack.
///
/// Implementations decode whatever storage backs the stack (image files, a
/// dataset store, memory); the pipeline only sees [`SliceImage`] buffers.
pub trait SliceSource {
    /// Reads one slice of the given channel and camera.
    fn read_slice(
        &self,
        channel: &str,
        cam: &str,
        slice_index: i64,
    ) -> Result<SliceImage, SliceUnavailable>;
}

/// Read-only access to the geometric metadata of one stack: camera un-warp
/// transforms and the per-slice stack-alignment transforms applied before
/// detection.
pub trait GeometryMetadata {
    /// The pull-back un-warp transform of a channel/camera pair, or `None`
    /// if the pair is unknown.
    fn cam_transform(&self, channel: &str, cam: &str) -> Option<AffineTransform2D>;

    /// Number of slices available for a channel/camera pair, or `None` if
    /// the pair is unknown.
    fn num_slices(&self, channel: &str, cam: &str) -> Option<usize>;

    /// The pull-back stack-alignment transform of one slice. Indices
    /// outside the stored sequence return the nearest stored transform
    /// (border extension).
    fn alignment_transform(&self, channel: &str, slice_index: i64) -> AffineTransform2D;
}

/// A stack held entirely in memory, the reference implementation of the
/// collaborator traits. Used by the test suite to synthesize stacks and
/// useful as a template for real backends.
#[derive(Debug, Default)]
pub struct InMemoryStack {
    slices: HashMap<(String, String), Vec<SliceImage>>,
    cam_transforms: HashMap<(String, String), AffineTransform2D>,
    alignment_transforms: HashMap<String, Vec<AffineTransform2D>>,
}

impl InMemoryStack {
    pub fn new() -> InMemoryStack {
        InMemoryStack::default()
    }

    /// Adds a channel/camera stack with the given slices and un-warp
    /// transform. Alignment transforms default to identity.
    pub fn add_stack(
        &mut self,
        channel: &str,
        cam: &str,
        cam_transform: AffineTransform2D,
        slices: Vec<SliceImage>,
    ) {
        let key = (channel.to_string(), cam.to_string());
        self.cam_transforms.insert(key.clone(), cam_transform);
        self.slices.insert(key, slices);
    }

    /// Sets the per-slice alignment transforms of a channel.
    pub fn set_alignment_transforms(&mut self, channel: &str, transforms: Vec<AffineTransform2D>) {
        self.alignment_transforms
            .insert(channel.to_string(), transforms);
    }
}

impl SliceSource for InMemoryStack {
    fn read_slice(
        &self,
        channel: &str,
        cam: &str,
        slice_index: i64,
    ) -> Result<SliceImage, SliceUnavailable> {
        let unavailable = |reason: &str| SliceUnavailable {
            channel: channel.to_string(),
            cam: cam.to_string(),
            slice_index,
            reason: reason.to_string(),
        };
        let stack = self
            .slices
            .get(&(channel.to_string(), cam.to_string()))
            .ok_or_else(|| unavailable("unknown channel/cam"))?;
        if slice_index < 0 || slice_index as usize >= stack.len() {
            return Err(unavailable("index out of range"));
        }
        Ok(stack[slice_index as usize].clone())
    }
}

impl GeometryMetadata for InMemoryStack {
    fn cam_transform(&self, channel: &str, cam: &str) -> Option<AffineTransform2D> {
        self.cam_transforms
            .get(&(channel.to_string(), cam.to_string()))
            .copied()
    }

    fn num_slices(&self, channel: &str, cam: &str) -> Option<usize> {
        self.slices
            .get(&(channel.to_string(), cam.to_string()))
            .map(|s| s.len())
    }

    fn alignment_transform(&self, channel: &str, slice_index: i64) -> AffineTransform2D {
        match self.alignment_transforms.get(channel) {
            Some(transforms) if !transforms.is_empty() => {
                let clamped = slice_index.clamp(0, transforms.len() as i64 - 1);
                transforms[clamped as usize]
            }
            _ => AffineTransform2D::identity(),
        }
    }
}
