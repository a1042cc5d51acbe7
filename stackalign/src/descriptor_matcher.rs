//! Candidate correspondence generation from local geometric descriptors.
//!
//! Each point is described by the distances to subsets of its nearest
//! neighbors, normalized so the signature is invariant to translation and
//! rotation and insensitive to moderate scale differences. Taking every
//! `num_neighbors`-sized subset of the `num_neighbors + redundancy` nearest
//! neighbors makes the signature robust to a missing or spurious neighbor,
//! at the cost of emitting the same point pair more than once; downstream
//! consensus filtering tolerates such duplicates.
//!
//! Descriptor comparison is all-pairs between the two clouds, which is
//! super-linear in the cloud sizes. That is acceptable because
//! `num_neighbors` is a handful by design and the descriptor vectors are
//! short.

use kd_tree::{KdPoint, KdTree};

use crate::interest_point::InterestPoint;
use crate::point_match::PointMatch;

/// Parameters of the correspondence matcher.
#[derive(Debug, Clone, Copy)]
pub struct MatcherParams {
    /// Neighbors per descriptor subset.
    pub num_neighbors: usize,
    /// Extra neighbors considered when forming subsets.
    pub redundancy: usize,
    /// Best-to-second-best acceptance ratio: a candidate is kept when the
    /// runner-up descriptor (of a different point) is at least this factor
    /// worse than the best.
    pub max_ratio_of_distance: f64,
}

impl Default for MatcherParams {
    fn default() -> Self {
        MatcherParams {
            num_neighbors: 3,
            redundancy: 1,
            max_ratio_of_distance: 3.0,
        }
    }
}

impl MatcherParams {
    /// Smallest cloud size descriptors can be built from: the point itself
    /// plus `num_neighbors + redundancy` neighbors. Callers must check both
    /// clouds against this before matching and treat smaller clouds as
    /// "alignment skipped, insufficient data".
    pub fn required_points(&self) -> usize {
        self.num_neighbors + self.redundancy + 1
    }
}

/// A point position with its index in the source cloud, the kd-tree item
/// for neighbor lookup.
struct IndexedPosition {
    position: [f64; 3],
    index: usize,
}

impl KdPoint for IndexedPosition {
    type Scalar = f64;
    type Dim = typenum::U3;
    fn at(&self, k: usize) -> f64 {
        self.position[k]
    }
}

/// One descriptor: the sorted, normalized neighbor-distance signature of a
/// subset, tagged with the index of the point it describes.
struct Descriptor {
    point_index: usize,
    signature: Vec<f64>,
}

impl Descriptor {
    fn distance_sq(&self, other: &Descriptor) -> f64 {
        self.signature
            .iter()
            .zip(&other.signature)
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}

/// Generates candidate matches between two point clouds.
///
/// The output is unordered; the same point pair may appear more than once
/// when several neighbor subsets agree, and no deduplication is attempted.
/// Points whose clouds are too small to provide `num_neighbors +
/// redundancy` neighbors contribute no descriptors.
pub fn extract_correspondence_candidates(
    cloud_a: &[InterestPoint],
    cloud_b: &[InterestPoint],
    params: &MatcherParams,
) -> Vec<PointMatch> {
    let descriptors_a = build_descriptors(cloud_a, params);
    let descriptors_b = build_descriptors(cloud_b, params);

    let mut candidates = Vec::new();
    for da in &descriptors_a {
        let mut best: Option<(f64, usize)> = None;
        let mut second_best = f64::INFINITY;
        for db in &descriptors_b {
            let d = da.distance_sq(db);
            match best {
                Some((bd, bi)) if d < bd => {
                    // descriptors of the best point itself do not count as
                    // runners-up
                    if db.point_index != bi {
                        second_best = bd;
                    }
                    best = Some((d, db.point_index));
                }
                Some((_, bi)) => {
                    if db.point_index != bi && d < second_best {
                        second_best = d;
                    }
                }
                None => best = Some((d, db.point_index)),
            }
        }
        if let Some((best_d, best_i)) = best {
            // squared distances, so the ratio applies squared as well
            let ratio_sq =
                params.max_ratio_of_distance * params.max_ratio_of_distance;
            if second_best >= best_d * ratio_sq {
                candidates.push(PointMatch::new(
                    &cloud_a[da.point_index],
                    &cloud_b[best_i],
                ));
            }
        }
    }
    candidates
}

/// Builds all subset descriptors of one cloud.
fn build_descriptors(cloud: &[InterestPoint], params: &MatcherParams) -> Vec<Descriptor> {
    let neighborhood = params.num_neighbors + params.redundancy;
    if cloud.len() < neighborhood + 1 {
        return Vec::new();
    }

    let items: Vec<IndexedPosition> = cloud
        .iter()
        .enumerate()
        .map(|(index, p)| IndexedPosition {
            position: p.position,
            index,
        })
        .collect();
    let tree = KdTree::build_by_ordered_float(items);

    let subsets = combinations(neighborhood, params.num_neighbors);
    let mut descriptors = Vec::with_capacity(cloud.len() * subsets.len());

    for (index, point) in cloud.iter().enumerate() {
        let query = IndexedPosition {
            position: point.position,
            index,
        };
        // the query point itself is among the results, so ask for one more
        let mut found = tree.nearests(&query, neighborhood + 1);
        found.sort_by(|a, b| a.squared_distance.total_cmp(&b.squared_distance));
        let neighbor_distances: Vec<f64> = found
            .iter()
            .filter(|n| n.item.index != index)
            .take(neighborhood)
            .map(|n| n.squared_distance.sqrt())
            .collect();
        if neighbor_distances.len() < neighborhood {
            continue;
        }

        for subset in &subsets {
            let mut distances: Vec<f64> =
                subset.iter().map(|&i| neighbor_distances[i]).collect();
            distances.sort_by(|a, b| a.total_cmp(b));
            let smallest = distances[0];
            if smallest <= 0.0 {
                // coincident points give no usable signature
                continue;
            }
            let signature = distances.iter().map(|d| d / smallest).collect();
            descriptors.push(Descriptor {
                point_index: index,
                signature,
            });
        }
    }
    descriptors
}

/// All `k`-element index subsets of `0..n`, in lexicographic order.
fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    let mut current = Vec::with_capacity(k);
    fn recurse(n: usize, k: usize, start: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if current.len() == k {
            out.push(current.clone());
            return;
        }
        for i in start..n {
            current.push(i);
            recurse(n, k, i + 1, current, out);
            current.pop();
        }
    }
    recurse(n, k, 0, &mut current, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_cloud(n: usize, seed: u64) -> Vec<InterestPoint> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                InterestPoint::new(
                    i,
                    [
                        rng.random_range(0.0..100.0),
                        rng.random_range(0.0..100.0),
                        rng.random_range(0.0..100.0),
                    ],
                )
            })
            .collect()
    }

    fn translated(cloud: &[InterestPoint], offset: [f64; 3]) -> Vec<InterestPoint> {
        cloud
            .iter()
            .map(|p| {
                InterestPoint::new(
                    p.id,
                    [
                        p.position[0] + offset[0],
                        p.position[1] + offset[1],
                        p.position[2] + offset[2],
                    ],
                )
            })
            .collect()
    }

    #[test]
    fn combinations_of_four_choose_three() {
        let c = combinations(4, 3);
        assert_eq!(
            c,
            vec![vec![0, 1, 2], vec![0, 1, 3], vec![0, 2, 3], vec![1, 2, 3]]
        );
    }

    #[test]
    fn translated_cloud_matches_its_counterparts() {
        let params = MatcherParams::default();
        let a = random_cloud(25, 7);
        let b = translated(&a, [5.0, -3.0, 2.0]);
        let candidates = extract_correspondence_candidates(&a, &b, &params);

        // every point of A appears in at least one candidate paired with
        // its true counterpart
        for p in &a {
            assert!(
                candidates
                    .iter()
                    .any(|m| m.id_a == p.id && m.id_b == p.id),
                "point {} has no true candidate",
                p.id
            );
        }
    }

    #[test]
    fn duplicate_candidates_are_allowed() {
        let params = MatcherParams::default();
        let a = random_cloud(25, 11);
        let b = translated(&a, [1.0, 1.0, 1.0]);
        let candidates = extract_correspondence_candidates(&a, &b, &params);
        // one descriptor per subset, so identical clouds produce several
        // candidates per point
        assert!(candidates.len() >= a.len());
    }

    #[test]
    fn undersized_cloud_produces_no_candidates() {
        let params = MatcherParams::default();
        let a = random_cloud(params.required_points() - 1, 3);
        let b = random_cloud(30, 4);
        assert!(extract_correspondence_candidates(&a, &b, &params).is_empty());
    }
}
