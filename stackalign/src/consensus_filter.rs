//! Multi-round consensus filtering of candidate matches.
//!
//! A single RANSAC pass silently merges multiple true transforms or fails
//! outright when the outlier ratio is high. This filter instead peels off
//! one well-supported model instance at a time: it searches the candidate
//! pool for the best minimal-sample model, and if that model has enough
//! inlier support it removes the inliers from the pool, records them, and
//! starts over on the remainder. Separate sub-populations consistent with
//! different transforms therefore survive as separate instances; pairwise
//! channel alignment ultimately uses the union of accepted matches, with
//! the largest instance dominating the fit.
//!
//! Sampling is driven by an explicitly seeded generator so runs are
//! reproducible; no global random state is involved.

use log::debug;
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::point_match::PointMatch;
use crate::transform_model::{ModelKind, TransformModel};

/// Parameters of the consensus filter.
#[derive(Debug, Clone, Copy)]
pub struct ConsensusParams {
    /// Transform variant fitted to minimal samples and instances.
    pub model: ModelKind,
    /// Minimal-sample draws per round.
    pub num_iterations: usize,
    /// Inlier distance threshold.
    pub max_epsilon: f64,
    /// Smallest inlier support that makes a model instance acceptable.
    pub min_num_inliers: usize,
    /// Seed of the sampling generator.
    pub seed: u64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        ConsensusParams {
            model: ModelKind::Affine,
            num_iterations: 10000,
            max_epsilon: 5.0,
            min_num_inliers: 25,
            seed: 0,
        }
    }
}

/// One accepted model instance: the fitted transform and the candidates
/// supporting it.
#[derive(Debug, Clone)]
pub struct ConsensusInstance {
    pub model: TransformModel,
    pub inliers: Vec<PointMatch>,
}

/// Runs the multi-round filter and returns every accepted instance, in
/// acceptance order (strongest support first, since each round takes the
/// best remaining model).
///
/// A pool smaller than the model's minimal sample size yields no instances;
/// duplicate candidates are counted like any others. Degenerate minimal
/// samples are discarded and sampling continues.
pub fn filter_multi_consensus(
    candidates: &[PointMatch],
    params: &ConsensusParams,
) -> Vec<ConsensusInstance> {
    let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
    let mut pool: Vec<PointMatch> = candidates.to_vec();
    let mut instances = Vec::new();
    let min_samples = params.model.min_num_matches();

    while pool.len() >= min_samples.max(params.min_num_inliers.max(1)) {
        match best_model_of_round(&pool, params, min_samples, &mut rng) {
            Some((model, inlier_indices)) if inlier_indices.len() >= params.min_num_inliers => {
                let mut inliers = Vec::with_capacity(inlier_indices.len());
                // indices are ascending; remove from the back to keep them
                // valid
                for &i in inlier_indices.iter().rev() {
                    inliers.push(pool.swap_remove(i));
                }
                inliers.reverse();
                debug!(
                    "consensus instance {}: {} inliers, {} candidates left",
                    instances.len(),
                    inliers.len(),
                    pool.len()
                );
                instances.push(ConsensusInstance { model, inliers });
            }
            _ => break,
        }
    }
    instances
}

/// Convenience wrapper returning the union of all accepted instances'
/// matches, in acceptance order.
pub fn filter(candidates: &[PointMatch], params: &ConsensusParams) -> Vec<PointMatch> {
    filter_multi_consensus(candidates, params)
        .into_iter()
        .flat_map(|instance| instance.inliers)
        .collect()
}

/// One round: draws up to `num_iterations` minimal samples, fits each, and
/// returns the model with the largest inlier support together with the
/// ascending indices of its inliers in `pool`. After the search the best
/// model is refitted to its inliers and the support recounted, the usual
/// consensus regression step.
fn best_model_of_round(
    pool: &[PointMatch],
    params: &ConsensusParams,
    min_samples: usize,
    rng: &mut ChaCha8Rng,
) -> Option<(TransformModel, Vec<usize>)> {
    let mut best: Option<(TransformModel, Vec<usize>)> = None;

    for _ in 0..params.num_iterations {
        let sample: Vec<PointMatch> = index::sample(rng, pool.len(), min_samples)
            .iter()
            .map(|i| pool[i])
            .collect();
        // degenerate samples are discarded, never propagated
        let model = match TransformModel::fit(params.model, &sample) {
            Ok(model) => model,
            Err(_) => continue,
        };
        let inliers = inlier_indices(pool, &model, params.max_epsilon);
        if best
            .as_ref()
            .map_or(true, |(_, b)| inliers.len() > b.len())
        {
            best = Some((model, inliers));
        }
    }

    let (model, inliers) = best?;
    if inliers.len() < params.model.min_num_matches() {
        return Some((model, inliers));
    }
    let support: Vec<PointMatch> = inliers.iter().map(|&i| pool[i]).collect();
    match TransformModel::fit(params.model, &support) {
        Ok(refined) => {
            let refined_inliers = inlier_indices(pool, &refined, params.max_epsilon);
            if refined_inliers.len() >= inliers.len() {
                Some((refined, refined_inliers))
            } else {
                Some((model, inliers))
            }
        }
        Err(_) => Some((model, inliers)),
    }
}

fn inlier_indices(pool: &[PointMatch], model: &TransformModel, max_epsilon: f64) -> Vec<usize> {
    pool.iter()
        .enumerate()
        .filter(|(_, m)| model.residual(m) <= max_epsilon)
        .map(|(i, _)| i)
        .collect()
}
