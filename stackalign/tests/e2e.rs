//! End-to-end tests over synthetic stacks: detection through consensus
//! filtering and model fitting, plus the re-tiling and persistence
//! guarantees of the extraction stage.

mod common;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use stackalign::alignment::{extract_points, AlignmentParams, PairwiseAligner};
use stackalign::block::{plan_blocks, ChannelBlockParams, IntensityBounds};
use stackalign::consensus_filter::{self, ConsensusParams};
use stackalign::descriptor_matcher::{extract_correspondence_candidates, MatcherParams};
use stackalign::feature_store::FeatureStore;
use stackalign::interest_point::InterestPoint;
use stackalign::slice_source::InMemoryStack;
use stackalign::transform_2d::AffineTransform2D;
use stackalign::transform_model::{mean_residual, ModelKind, TransformModel};

const WIDTH: usize = 64;
const HEIGHT: usize = 64;
const NUM_SLICES: usize = 100;
const BLOB_SIGMA: f64 = 1.5;
const BLOB_AMPLITUDE: f32 = 1000.0;
const TRANSLATION: [f64; 3] = [3.0, 4.0, 0.0];

/// Authoritative-range boundaries of the 20- and 35-slice tilings of
/// 0..99; synthetic landmarks keep clear of them so ownership is never
/// decided by a coin flip of sub-pixel jitter.
const TILE_BOUNDARIES: [f64; 6] = [19.5, 39.5, 59.5, 79.5, 34.5, 69.5];

/// 50 landmark positions on a jittered grid. Grid spacing bounds the
/// fourth-neighbor distance, so outliers placed far away can never enter a
/// landmark's descriptor neighborhood.
fn base_positions(rng: &mut StdRng) -> Vec<[f64; 3]> {
    let z_levels = [23.0, 31.0, 44.0, 52.0];
    let mut slots = Vec::new();
    for &z in &z_levels {
        for gy in 0..4 {
            for gx in 0..4 {
                slots.push([14.0 + 9.0 * gx as f64, 12.0 + 9.0 * gy as f64, z]);
            }
        }
    }
    slots.shuffle(rng);
    slots
        .into_iter()
        .take(50)
        .map(|[x, y, z]| {
            [
                x + rng.random_range(-1.0..1.0),
                y + rng.random_range(-1.0..1.0),
                z + rng.random_range(-1.0..1.0),
            ]
        })
        .collect()
}

fn outlier_positions(rng: &mut StdRng, avoid: &[[f64; 3]]) -> Vec<[f64; 3]> {
    common::scatter_positions(
        rng,
        10,
        (8.0, 52.0),
        (8.0, 52.0),
        (6.0, 90.0),
        6.0,
        avoid,
        17.0,
        &TILE_BOUNDARIES,
        2.0,
    )
}

fn pipeline_params(stack_id: &str) -> AlignmentParams {
    let mut params = AlignmentParams::new(stack_id, "ChA", "cam0", "ChB", "cam0");
    params.sigma = BLOB_SIGMA;
    params.threshold_a = 0.005;
    params.threshold_b = 0.005;
    params.intensity = IntensityBounds::Fixed {
        min: 0.0,
        max: 4096.0,
    };
    params.block_size = 20;
    params.first_slice = 0;
    params.last_slice = (NUM_SLICES - 1) as i64;
    params.consensus = ConsensusParams {
        model: ModelKind::Affine,
        num_iterations: 10000,
        max_epsilon: 1.0,
        min_num_inliers: 25,
        seed: 0,
    };
    params
}

#[test]
fn full_pipeline_recovers_translation_and_reuses_stored_points() {
    let mut rng = StdRng::seed_from_u64(2020);
    let base = base_positions(&mut rng);
    let translated = common::translated(&base, TRANSLATION);
    let outliers_a = outlier_positions(&mut rng, &base);
    let outliers_b = outlier_positions(&mut rng, &translated);

    let mut positions_a = base.clone();
    positions_a.extend(&outliers_a);
    let mut positions_b = translated.clone();
    positions_b.extend(&outliers_b);

    let mut stack = InMemoryStack::new();
    stack.add_stack(
        "ChA",
        "cam0",
        AffineTransform2D::identity(),
        common::render_stack(WIDTH, HEIGHT, NUM_SLICES, &positions_a, BLOB_SIGMA, BLOB_AMPLITUDE),
    );
    stack.add_stack(
        "ChB",
        "cam0",
        AffineTransform2D::identity(),
        common::render_stack(WIDTH, HEIGHT, NUM_SLICES, &positions_b, BLOB_SIGMA, BLOB_AMPLITUDE),
    );

    let dir = tempfile::tempdir().unwrap();
    let store = FeatureStore::new(dir.path());
    let params = pipeline_params("Pos001");

    let aligner = PairwiseAligner::new(&stack, &stack).with_store(&store);
    let result = aligner.align(&params).unwrap();

    assert!(
        result.matches.len() >= 45,
        "only {} matches accepted",
        result.matches.len()
    );
    // the accepted matches carry the planted translation
    let consistent = result
        .matches
        .iter()
        .filter(|m| {
            let d = m.displacement();
            (d[0] - TRANSLATION[0]).abs() < 0.5
                && (d[1] - TRANSLATION[1]).abs() < 0.5
                && (d[2] - TRANSLATION[2]).abs() < 0.5
        })
        .count();
    assert!(consistent >= 45, "only {consistent} consistent matches");

    // the translation-only fit of the accepted set recovers the offset
    let translation = TransformModel::fit(ModelKind::Translation, &result.matches).unwrap();
    match &translation {
        TransformModel::Translation { offset } => {
            assert!((offset.x - TRANSLATION[0]).abs() < 0.1, "dx = {}", offset.x);
            assert!((offset.y - TRANSLATION[1]).abs() < 0.1, "dy = {}", offset.y);
            assert!((offset.z - TRANSLATION[2]).abs() < 0.1, "dz = {}", offset.z);
        }
        _ => unreachable!(),
    }
    assert!(result.mean_residual < 1.0);

    // extraction persisted both channels
    assert!(store.exists("Pos001/ChA"));
    assert!(store.exists("Pos001/ChB"));

    // a second run reuses the stored points and agrees with the first
    let mut reload_params = params.clone();
    reload_params.try_loading_points = true;
    let reloaded = aligner.align(&reload_params).unwrap();
    assert_eq!(reloaded.matches.len(), result.matches.len());
}

#[test]
fn retiling_with_a_different_block_size_keeps_the_merged_points() {
    let mut rng = StdRng::seed_from_u64(31);
    let mut positions = base_positions(&mut rng);
    positions.extend(outlier_positions(&mut rng, &positions.clone()));

    let mut stack = InMemoryStack::new();
    stack.add_stack(
        "ChA",
        "cam0",
        AffineTransform2D::identity(),
        common::render_stack(WIDTH, HEIGHT, NUM_SLICES, &positions, BLOB_SIGMA, BLOB_AMPLITUDE),
    );

    let series = ChannelBlockParams {
        channel: "ChA".to_string(),
        cam: "cam0".to_string(),
        cam_transform: AffineTransform2D::identity(),
        sigma: BLOB_SIGMA,
        threshold: 0.005,
        intensity: IntensityBounds::Fixed {
            min: 0.0,
            max: 4096.0,
        },
    };
    let last = (NUM_SLICES - 1) as i64;
    let key = ("ChA".to_string(), "cam0".to_string());

    let mut tiled_20 = extract_points(&stack, &stack, &plan_blocks(0, last, 20, &series), 0, last)
        .remove(&key)
        .unwrap();
    let mut tiled_35 = extract_points(&stack, &stack, &plan_blocks(0, last, 35, &series), 0, last)
        .remove(&key)
        .unwrap();

    assert_eq!(tiled_20.len(), positions.len());
    assert_eq!(tiled_20.len(), tiled_35.len());

    let by_position = |a: &InterestPoint, b: &InterestPoint| {
        a.position[2]
            .total_cmp(&b.position[2])
            .then(a.position[1].total_cmp(&b.position[1]))
            .then(a.position[0].total_cmp(&b.position[0]))
    };
    tiled_20.sort_by(by_position);
    tiled_35.sort_by(by_position);
    for (p, q) in tiled_20.iter().zip(&tiled_35) {
        for d in 0..3 {
            assert!(
                (p.position[d] - q.position[d]).abs() < 1e-4,
                "{:?} vs {:?}",
                p.position,
                q.position
            );
        }
    }
}

#[test]
fn point_cloud_pipeline_recovers_a_pure_translation() {
    let mut rng = StdRng::seed_from_u64(404);
    let base = common::scatter_positions(
        &mut rng,
        50,
        (0.0, 40.0),
        (0.0, 40.0),
        (0.0, 40.0),
        5.0,
        &[],
        0.0,
        &[],
        0.0,
    );
    let translated = common::translated(&base, TRANSLATION);
    let outliers_a = common::scatter_positions(
        &mut rng,
        10,
        (0.0, 90.0),
        (0.0, 90.0),
        (0.0, 90.0),
        6.0,
        &base,
        17.0,
        &[],
        0.0,
    );
    let outliers_b = common::scatter_positions(
        &mut rng,
        10,
        (0.0, 90.0),
        (0.0, 90.0),
        (0.0, 90.0),
        6.0,
        &translated,
        17.0,
        &[],
        0.0,
    );

    let cloud = |positions: &[[f64; 3]], extra: &[[f64; 3]]| -> Vec<InterestPoint> {
        positions
            .iter()
            .chain(extra)
            .enumerate()
            .map(|(i, &p)| InterestPoint::new(i, p))
            .collect()
    };
    let cloud_a = cloud(&base, &outliers_a);
    let cloud_b = cloud(&translated, &outliers_b);

    let matcher = MatcherParams::default();
    let candidates = extract_correspondence_candidates(&cloud_a, &cloud_b, &matcher);

    let consensus = ConsensusParams {
        model: ModelKind::Translation,
        num_iterations: 1000,
        max_epsilon: 0.5,
        min_num_inliers: 25,
        seed: 9,
    };
    let matches = consensus_filter::filter(&candidates, &consensus);
    let accepted: std::collections::HashSet<(usize, usize)> =
        matches.iter().map(|m| (m.id_a, m.id_b)).collect();
    assert!(accepted.len() >= 45, "only {} unique matches", accepted.len());

    let model = TransformModel::fit(ModelKind::Translation, &matches).unwrap();
    match &model {
        TransformModel::Translation { offset } => {
            assert!((offset.x - TRANSLATION[0]).abs() < 0.1);
            assert!((offset.y - TRANSLATION[1]).abs() < 0.1);
            assert!((offset.z - TRANSLATION[2]).abs() < 0.1);
        }
        _ => unreachable!(),
    }
    assert!(mean_residual(&model, &matches) < 1e-6);
}
