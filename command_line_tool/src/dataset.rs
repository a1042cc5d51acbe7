//! File-backed dataset: `metadata.json` at the root describes the stacks,
//! camera transforms, per-slice alignment transforms, and the slice image
//! files, which are decoded with the `image` crate on demand.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use stackalign::slice_image::SliceImage;
use stackalign::slice_source::{GeometryMetadata, SliceSource, SliceUnavailable};
use stackalign::transform_2d::AffineTransform2D;

/// Contents of `metadata.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetMetadata {
    /// Known stack keys.
    stacks: Vec<String>,
    /// channel -> cam -> row-packed pull-back un-warp transform.
    cam_transforms: HashMap<String, HashMap<String, AffineTransform2D>>,
    /// stack id -> channel -> slice group.
    slice_groups: HashMap<String, HashMap<String, ChannelGroup>>,
}

#[derive(Debug, Deserialize)]
struct ChannelGroup {
    /// Per-slice stack-alignment transforms (pull-back, row-packed).
    #[serde(default)]
    transforms: Vec<AffineTransform2D>,
    /// cam -> slice image files, relative to the dataset root.
    cams: HashMap<String, Vec<PathBuf>>,
}

/// One stack of a file-backed dataset, scoped to a stack id at open time.
pub struct FileDataset {
    root: PathBuf,
    stack_id: String,
    metadata: DatasetMetadata,
}

impl FileDataset {
    /// Opens the dataset and checks that `stack_id` exists. Failures here
    /// are fatal to the invocation, before any block work begins.
    pub fn open(root: &Path, stack_id: &str) -> Result<FileDataset, String> {
        let path = root.join("metadata.json");
        let text = fs::read_to_string(&path)
            .map_err(|e| format!("cannot read '{}': {e}", path.display()))?;
        let metadata: DatasetMetadata = serde_json::from_str(&text)
            .map_err(|e| format!("cannot parse '{}': {e}", path.display()))?;
        if !metadata.stacks.iter().any(|s| s == stack_id) {
            return Err(format!(
                "stack '{stack_id}' does not exist in '{}'",
                root.display()
            ));
        }
        if !metadata.slice_groups.contains_key(stack_id) {
            return Err(format!("stack '{stack_id}' has no slice groups"));
        }
        Ok(FileDataset {
            root: root.to_path_buf(),
            stack_id: stack_id.to_string(),
            metadata,
        })
    }

    fn group(&self, channel: &str) -> Option<&ChannelGroup> {
        self.metadata.slice_groups.get(&self.stack_id)?.get(channel)
    }
}

impl SliceSource for FileDataset {
    fn read_slice(
        &self,
        channel: &str,
        cam: &str,
        slice_index: i64,
    ) -> Result<SliceImage, SliceUnavailable> {
        let unavailable = |reason: String| SliceUnavailable {
            channel: channel.to_string(),
            cam: cam.to_string(),
            slice_index,
            reason,
        };
        let group = self
            .group(channel)
            .ok_or_else(|| unavailable("unknown channel".to_string()))?;
        let files = group
            .cams
            .get(cam)
            .ok_or_else(|| unavailable("unknown cam".to_string()))?;
        if slice_index < 0 || slice_index as usize >= files.len() {
            return Err(unavailable("index out of range".to_string()));
        }

        let path = self.root.join(&files[slice_index as usize]);
        let decoded = image::open(&path)
            .map_err(|e| unavailable(format!("cannot decode '{}': {e}", path.display())))?;
        let gray = decoded.to_luma16();
        let data = gray.pixels().map(|p| p.0[0] as f32).collect();
        Ok(SliceImage::from_data(
            gray.width() as usize,
            gray.height() as usize,
            data,
        ))
    }
}

impl GeometryMetadata for FileDataset {
    fn cam_transform(&self, channel: &str, cam: &str) -> Option<AffineTransform2D> {
        self.metadata.cam_transforms.get(channel)?.get(cam).copied()
    }

    fn num_slices(&self, channel: &str, cam: &str) -> Option<usize> {
        self.group(channel)?.cams.get(cam).map(|files| files.len())
    }

    fn alignment_transform(&self, channel: &str, slice_index: i64) -> AffineTransform2D {
        match self.group(channel) {
            Some(group) if !group.transforms.is_empty() => {
                let clamped = slice_index.clamp(0, group.transforms.len() as i64 - 1);
                group.transforms[clamped as usize]
            }
            _ => AffineTransform2D::identity(),
        }
    }
}
