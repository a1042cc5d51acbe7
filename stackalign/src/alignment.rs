//! Pairwise channel alignment: the full pipeline from block planning to the
//! fitted transform.
//!
//! Blocks are mapped over a worker pool (one independent task per block,
//! no communication between tasks), merged per channel into ordered point
//! clouds, optionally persisted and reloaded, then matched, consensus
//! filtered, and fitted. Per-block failures are absorbed with warnings,
//! per-pair failures surface as typed errors that leave other pairs of a
//! batch unaffected, and missing metadata aborts before any block work
//! begins.

use std::collections::HashMap;

use log::{info, warn};
use rayon::prelude::*;
use thiserror::Error;

use crate::block::{plan_blocks, Block, ChannelBlockParams, IntensityBounds};
use crate::consensus_filter::{self, ConsensusParams};
use crate::descriptor_matcher::{extract_correspondence_candidates, MatcherParams};
use crate::dog_detector::detect_block;
use crate::feature_store::FeatureStore;
use crate::interest_point::InterestPoint;
use crate::point_match::PointMatch;
use crate::slice_source::{GeometryMetadata, SliceSource};
use crate::transform_2d::AffineTransform2D;
use crate::transform_model::{mean_residual, FitError, ModelKind, TransformModel};

/// Everything a pairwise alignment invocation needs to know.
#[derive(Debug, Clone)]
pub struct AlignmentParams {
    /// Stack key, used for store keys and log context.
    pub stack_id: String,
    pub channel_a: String,
    pub channel_b: String,
    pub cam_a: String,
    pub cam_b: String,
    /// First slice index of the depth range.
    pub first_slice: i64,
    /// Last slice index; clamped to the shortest stack actually present.
    pub last_slice: i64,
    /// Nominal block size in z for point extraction.
    pub block_size: i64,
    /// Blob detection scale, shared by both channels.
    pub sigma: f64,
    /// Detection threshold of channel A.
    pub threshold_a: f64,
    /// Detection threshold of channel B.
    pub threshold_b: f64,
    /// Intensity mapping applied before detection.
    pub intensity: IntensityBounds,
    /// Try to reuse previously stored points before extracting.
    pub try_loading_points: bool,
    pub matcher: MatcherParams,
    pub consensus: ConsensusParams,
}

impl AlignmentParams {
    /// Parameters with the customary defaults: block size 20, full depth
    /// range, sigma 2.0, threshold 0.005, fixed 12-bit intensity range.
    pub fn new(
        stack_id: &str,
        channel_a: &str,
        cam_a: &str,
        channel_b: &str,
        cam_b: &str,
    ) -> AlignmentParams {
        AlignmentParams {
            stack_id: stack_id.to_string(),
            channel_a: channel_a.to_string(),
            channel_b: channel_b.to_string(),
            cam_a: cam_a.to_string(),
            cam_b: cam_b.to_string(),
            first_slice: 0,
            last_slice: i64::MAX,
            block_size: 20,
            sigma: 2.0,
            threshold_a: 0.005,
            threshold_b: 0.005,
            intensity: IntensityBounds::Fixed {
                min: 0.0,
                max: 4096.0,
            },
            try_loading_points: false,
            matcher: MatcherParams::default(),
            consensus: ConsensusParams::default(),
        }
    }

    fn store_key(&self, channel: &str) -> String {
        format!("{}/{}", self.stack_id, channel)
    }
}

/// Why a pairwise alignment produced no transform.
#[derive(Debug, Error)]
pub enum AlignmentError {
    /// The requested channel/camera pair is not in the stack metadata.
    /// Raised before any block work begins.
    #[error("unknown channel/cam pair {channel}/{cam}")]
    UnknownChannelCam { channel: String, cam: String },
    /// No slices remain after clamping the range to the available stacks.
    #[error("no slices in requested range {first}..{last}")]
    EmptySliceRange { first: i64, last: i64 },
    /// A channel's point cloud is too small to build descriptors from;
    /// the alignment is skipped, not failed.
    #[error("channel {channel} has {found} points, matching needs at least {required}")]
    InsufficientPoints {
        channel: String,
        found: usize,
        required: usize,
    },
    /// The accepted matches could not determine the model.
    #[error(transparent)]
    Fit(#[from] FitError),
}

/// The outcome of one pairwise alignment: the accepted matches, the fitted
/// transform mapping channel A coordinates onto channel B, and the mean
/// residual distance. Ephemeral; persistence is a collaborator concern.
#[derive(Debug, Clone)]
pub struct AlignmentResult {
    pub matches: Vec<PointMatch>,
    pub model: TransformModel,
    pub mean_residual: f64,
}

/// Runs pairwise alignments against one stack's collaborators.
pub struct PairwiseAligner<'a, S, G> {
    source: &'a S,
    geometry: &'a G,
    store: Option<&'a FeatureStore>,
}

impl<'a, S, G> PairwiseAligner<'a, S, G>
where
    S: SliceSource + Sync,
    G: GeometryMetadata + Sync,
{
    pub fn new(source: &'a S, geometry: &'a G) -> PairwiseAligner<'a, S, G> {
        PairwiseAligner {
            source,
            geometry,
            store: None,
        }
    }

    /// Attaches a feature store used to persist extracted points and, when
    /// requested, to reload them instead of re-extracting.
    pub fn with_store(mut self, store: &'a FeatureStore) -> PairwiseAligner<'a, S, G> {
        self.store = Some(store);
        self
    }

    /// Aligns channel A onto channel B.
    pub fn align(&self, params: &AlignmentParams) -> Result<AlignmentResult, AlignmentError> {
        let cam_transform_a = self
            .geometry
            .cam_transform(&params.channel_a, &params.cam_a)
            .ok_or_else(|| AlignmentError::UnknownChannelCam {
                channel: params.channel_a.clone(),
                cam: params.cam_a.clone(),
            })?;
        let cam_transform_b = self
            .geometry
            .cam_transform(&params.channel_b, &params.cam_b)
            .ok_or_else(|| AlignmentError::UnknownChannelCam {
                channel: params.channel_b.clone(),
                cam: params.cam_b.clone(),
            })?;
        let num_slices_a = self
            .geometry
            .num_slices(&params.channel_a, &params.cam_a)
            .ok_or_else(|| AlignmentError::UnknownChannelCam {
                channel: params.channel_a.clone(),
                cam: params.cam_a.clone(),
            })?;
        let num_slices_b = self
            .geometry
            .num_slices(&params.channel_b, &params.cam_b)
            .ok_or_else(|| AlignmentError::UnknownChannelCam {
                channel: params.channel_b.clone(),
                cam: params.cam_b.clone(),
            })?;

        // the usable range ends with the shortest stack involved
        let last_slice = params
            .last_slice
            .min(num_slices_a as i64 - 1)
            .min(num_slices_b as i64 - 1);
        if last_slice < params.first_slice {
            return Err(AlignmentError::EmptySliceRange {
                first: params.first_slice,
                last: last_slice,
            });
        }
        info!(
            "{}: aligning {} (cam={}) onto {} (cam={}), slices {}..{}",
            params.stack_id,
            params.channel_a,
            params.cam_a,
            params.channel_b,
            params.cam_b,
            params.first_slice,
            last_slice
        );

        let (points_a, points_b) =
            self.obtain_points(params, cam_transform_a, cam_transform_b, last_slice);

        info!("channel {}: {} points", params.channel_a, points_a.len());
        info!("channel {}: {} points", params.channel_b, points_b.len());

        // not enough points to build a descriptor
        let required = params.matcher.required_points();
        for (channel, points) in [(&params.channel_a, &points_a), (&params.channel_b, &points_b)] {
            if points.len() < required {
                return Err(AlignmentError::InsufficientPoints {
                    channel: channel.clone(),
                    found: points.len(),
                    required,
                });
            }
        }

        let candidates = extract_correspondence_candidates(&points_a, &points_b, &params.matcher);
        let (min_z, max_z) = match_z_extent(&candidates);
        info!(
            "candidates: {} from(z) {min_z} to(z) {max_z}",
            candidates.len()
        );

        let matches = consensus_filter::filter(&candidates, &params.consensus);
        let (min_z, max_z) = match_z_extent(&matches);
        info!("matches: {} from(z) {min_z} to(z) {max_z}", matches.len());

        let model = TransformModel::fit(params.consensus.model, &matches)?;
        let residual = mean_residual(&model, &matches);
        info!("fitted {:?} model, mean residual {residual:.4}", model.kind());
        if params.consensus.model != ModelKind::Translation {
            // the translation-only fit is a useful sanity figure
            if let Ok(translation) = TransformModel::fit(ModelKind::Translation, &matches) {
                info!(
                    "translation-only fit ({:.4}): {translation:?}",
                    mean_residual(&translation, &matches)
                );
            }
        }

        Ok(AlignmentResult {
            matches,
            model,
            mean_residual: residual,
        })
    }

    /// Loads both channels' point clouds from the store when allowed, and
    /// falls back to extracting (and persisting) them.
    fn obtain_points(
        &self,
        params: &AlignmentParams,
        cam_transform_a: AffineTransform2D,
        cam_transform_b: AffineTransform2D,
        last_slice: i64,
    ) -> (Vec<InterestPoint>, Vec<InterestPoint>) {
        if params.try_loading_points {
            if let Some(store) = self.store {
                info!("trying to load points ...");
                let loaded_a = store.load(&params.store_key(&params.channel_a));
                let loaded_b = store.load(&params.store_key(&params.channel_b));
                if let (Some(a), Some(b)) = (loaded_a, loaded_b) {
                    return (a, b);
                }
                warn!("could not load points, extracting ...");
            }
        }

        info!("extracting points ...");
        let series_a = ChannelBlockParams {
            channel: params.channel_a.clone(),
            cam: params.cam_a.clone(),
            cam_transform: cam_transform_a,
            sigma: params.sigma,
            threshold: params.threshold_a,
            intensity: params.intensity,
        };
        let series_b = ChannelBlockParams {
            channel: params.channel_b.clone(),
            cam: params.cam_b.clone(),
            cam_transform: cam_transform_b,
            sigma: params.sigma,
            threshold: params.threshold_b,
            intensity: params.intensity,
        };
        let mut blocks = plan_blocks(params.first_slice, last_slice, params.block_size, &series_a);
        blocks.extend(plan_blocks(
            params.first_slice,
            last_slice,
            params.block_size,
            &series_b,
        ));

        let mut merged = extract_points(
            self.source,
            self.geometry,
            &blocks,
            params.first_slice,
            last_slice,
        );
        let points_a = merged
            .remove(&(params.channel_a.clone(), params.cam_a.clone()))
            .unwrap_or_default();
        let points_b = merged
            .remove(&(params.channel_b.clone(), params.cam_b.clone()))
            .unwrap_or_default();

        if let Some(store) = self.store {
            info!("saving points ...");
            for (channel, points) in
                [(&params.channel_a, &points_a), (&params.channel_b, &points_b)]
            {
                if let Err(e) = store.save(&params.store_key(channel), points) {
                    warn!("could not persist points for {channel}: {e}");
                }
            }
        }
        (points_a, points_b)
    }
}

/// Extracts interest points for a list of blocks in parallel and merges
/// them per (channel, cam) series.
///
/// Blocks are independent tasks; the merge concatenates their owned points
/// in block order and re-assigns sequential ids per series, so the outcome
/// does not depend on scheduling. Correctness of the union rests solely on
/// the disjoint authoritative ranges, not on any coordination between
/// tasks.
pub fn extract_points<S, G>(
    source: &S,
    geometry: &G,
    blocks: &[Block],
    first_slice: i64,
    last_slice: i64,
) -> HashMap<(String, String), Vec<InterestPoint>>
where
    S: SliceSource + Sync,
    G: GeometryMetadata + Sync,
{
    let results: Vec<(&Block, Vec<InterestPoint>)> = blocks
        .par_iter()
        .map(|block| {
            (
                block,
                detect_block(source, geometry, block, first_slice, last_slice),
            )
        })
        .collect();

    let mut merged: HashMap<(String, String), Vec<InterestPoint>> = HashMap::new();
    for (block, points) in results {
        let series = merged
            .entry((block.channel.clone(), block.cam.clone()))
            .or_default();
        for point in points {
            let id = series.len();
            series.push(point.reindexed(id));
        }
    }
    merged
}

fn match_z_extent(matches: &[PointMatch]) -> (f64, f64) {
    if matches.is_empty() {
        return (0.0, 0.0);
    }
    let mut min_z = f64::INFINITY;
    let mut max_z = f64::NEG_INFINITY;
    for m in matches {
        min_z = min_z.min(m.point_a[2]).min(m.point_b[2]);
        max_z = max_z.max(m.point_a[2]).max(m.point_b[2]);
    }
    (min_z, max_z)
}
