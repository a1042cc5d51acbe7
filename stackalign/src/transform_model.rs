//! Parametric 3-D transform models fitted to accepted point matches.
//!
//! The three variants share one fit/apply contract and each declares its
//! own minimal sample size, which the consensus filter uses to draw
//! minimal random samples. Fitting is a weighted least-squares solve; the
//! translation model averages displacements, the rigid model solves the
//! Procrustes problem via SVD, and the affine model solves the normal
//! equations of the full 12-parameter system.

use nalgebra::{Matrix3, Matrix4, Vector3, Vector4, SVD};
use thiserror::Error;

use crate::point_match::PointMatch;

/// Relative singular-value cutoff below which fit geometry counts as
/// degenerate.
const DEGENERACY_EPS: f64 = 1e-10;

#[derive(Debug, Error, PartialEq)]
pub enum FitError {
    /// Fewer matches than the model's minimal sample size.
    #[error("not enough data points: {found} matches, model needs {required}")]
    NotEnoughDataPoints { required: usize, found: usize },
    /// The matches are numerically degenerate for this model, e.g.
    /// collinear points for a rigid fit or coplanar points for an affine
    /// fit.
    #[error("ill-defined data points: degenerate match geometry")]
    IllDefinedDataPoints,
}

/// The transform variant to fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Translation,
    Rigid,
    Affine,
}

impl ModelKind {
    /// Smallest number of matches that uniquely determines the model.
    pub fn min_num_matches(&self) -> usize {
        match self {
            ModelKind::Translation => 1,
            ModelKind::Rigid => 3,
            ModelKind::Affine => 4,
        }
    }
}

/// A fitted 3-D transform.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformModel {
    /// Pure translation by `offset`.
    Translation { offset: Vector3<f64> },
    /// Rotation followed by translation.
    Rigid {
        rotation: Matrix3<f64>,
        translation: Vector3<f64>,
    },
    /// General linear map followed by translation.
    Affine {
        matrix: Matrix3<f64>,
        translation: Vector3<f64>,
    },
}

impl TransformModel {
    /// Fits a model of the given kind to the matches, mapping each match's
    /// A position onto its B position in the weighted least-squares sense.
    pub fn fit(kind: ModelKind, matches: &[PointMatch]) -> Result<TransformModel, FitError> {
        let required = kind.min_num_matches();
        if matches.len() < required {
            return Err(FitError::NotEnoughDataPoints {
                required,
                found: matches.len(),
            });
        }
        match kind {
            ModelKind::Translation => Ok(fit_translation(matches)),
            ModelKind::Rigid => fit_rigid(matches),
            ModelKind::Affine => fit_affine(matches),
        }
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            TransformModel::Translation { .. } => ModelKind::Translation,
            TransformModel::Rigid { .. } => ModelKind::Rigid,
            TransformModel::Affine { .. } => ModelKind::Affine,
        }
    }

    pub fn min_num_matches(&self) -> usize {
        self.kind().min_num_matches()
    }

    /// Applies the transform to a point.
    pub fn apply(&self, point: [f64; 3]) -> [f64; 3] {
        let p = Vector3::new(point[0], point[1], point[2]);
        let q = match self {
            TransformModel::Translation { offset } => p + offset,
            TransformModel::Rigid {
                rotation,
                translation,
            } => rotation * p + translation,
            TransformModel::Affine {
                matrix,
                translation,
            } => matrix * p + translation,
        };
        [q.x, q.y, q.z]
    }

    /// Distance between a match's B position and its transformed A
    /// position.
    pub fn residual(&self, m: &PointMatch) -> f64 {
        let t = self.apply(m.point_a);
        let dx = t[0] - m.point_b[0];
        let dy = t[1] - m.point_b[1];
        let dz = t[2] - m.point_b[2];
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Mean residual distance of a match set under a model, the fit quality
/// figure reported with every alignment.
pub fn mean_residual(model: &TransformModel, matches: &[PointMatch]) -> f64 {
    if matches.is_empty() {
        return 0.0;
    }
    matches.iter().map(|m| model.residual(m)).sum::<f64>() / matches.len() as f64
}

fn weighted_centroids(matches: &[PointMatch]) -> (Vector3<f64>, Vector3<f64>, f64) {
    let mut ca = Vector3::zeros();
    let mut cb = Vector3::zeros();
    let mut total = 0.0;
    for m in matches {
        ca += m.weight * Vector3::from(m.point_a);
        cb += m.weight * Vector3::from(m.point_b);
        total += m.weight;
    }
    (ca / total, cb / total, total)
}

fn fit_translation(matches: &[PointMatch]) -> TransformModel {
    let (ca, cb, _) = weighted_centroids(matches);
    TransformModel::Translation { offset: cb - ca }
}

fn fit_rigid(matches: &[PointMatch]) -> Result<TransformModel, FitError> {
    let (ca, cb, _) = weighted_centroids(matches);

    // weighted cross-covariance of the centered point sets
    let mut h = Matrix3::zeros();
    for m in matches {
        let a = Vector3::from(m.point_a) - ca;
        let b = Vector3::from(m.point_b) - cb;
        h += m.weight * a * b.transpose();
    }

    let svd = SVD::new(h, true, true);
    // singular values are not guaranteed to come out ordered
    let mut sv: Vec<(usize, f64)> = svd
        .singular_values
        .iter()
        .copied()
        .enumerate()
        .collect();
    sv.sort_by(|a, b| b.1.total_cmp(&a.1));
    // collinear points leave the rotation about the line unconstrained
    if sv[0].1 <= 0.0 || sv[1].1 <= DEGENERACY_EPS * sv[0].1 {
        return Err(FitError::IllDefinedDataPoints);
    }
    let u = svd.u.ok_or(FitError::IllDefinedDataPoints)?;
    let v_t = svd.v_t.ok_or(FitError::IllDefinedDataPoints)?;

    let mut rotation = v_t.transpose() * u.transpose();
    if rotation.determinant() < 0.0 {
        // reflection correction: flip the direction of least support
        let mut v = v_t.transpose();
        v.column_mut(sv[2].0).scale_mut(-1.0);
        rotation = v * u.transpose();
    }

    let translation = cb - rotation * ca;
    Ok(TransformModel::Rigid {
        rotation,
        translation,
    })
}

fn fit_affine(matches: &[PointMatch]) -> Result<TransformModel, FitError> {
    // normal equations of target_d = row(a) . coeffs_d with row(a) =
    // [ax, ay, az, 1], solved once per output coordinate
    let mut m = Matrix4::zeros();
    let mut rhs = [Vector4::zeros(), Vector4::zeros(), Vector4::zeros()];
    for pm in matches {
        let row = Vector4::new(pm.point_a[0], pm.point_a[1], pm.point_a[2], 1.0);
        m += pm.weight * row * row.transpose();
        for d in 0..3 {
            rhs[d] += pm.weight * pm.point_b[d] * row;
        }
    }

    let svd = SVD::new(m, true, true);
    let max_sv = svd.singular_values.iter().copied().fold(0.0, f64::max);
    let min_sv = svd
        .singular_values
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min);
    // coplanar points make the moment matrix rank deficient
    if max_sv <= 0.0 || min_sv <= DEGENERACY_EPS * max_sv {
        return Err(FitError::IllDefinedDataPoints);
    }

    let mut matrix = Matrix3::zeros();
    let mut translation = Vector3::zeros();
    for d in 0..3 {
        let coeffs = svd
            .solve(&rhs[d], DEGENERACY_EPS)
            .map_err(|_| FitError::IllDefinedDataPoints)?;
        matrix[(d, 0)] = coeffs[0];
        matrix[(d, 1)] = coeffs[1];
        matrix[(d, 2)] = coeffs[2];
        translation[d] = coeffs[3];
    }
    Ok(TransformModel::Affine {
        matrix,
        translation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interest_point::InterestPoint;

    fn matches_under(positions: &[[f64; 3]], f: impl Fn([f64; 3]) -> [f64; 3]) -> Vec<PointMatch> {
        positions
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                PointMatch::new(
                    &InterestPoint::new(i, p),
                    &InterestPoint::new(i, f(p)),
                )
            })
            .collect()
    }

    const CLOUD: [[f64; 3]; 6] = [
        [0.0, 0.0, 0.0],
        [10.0, 0.0, 0.0],
        [0.0, 10.0, 0.0],
        [0.0, 0.0, 10.0],
        [7.0, 3.0, 5.0],
        [2.0, 8.0, 1.0],
    ];

    #[test]
    fn translation_is_recovered_exactly() {
        let matches = matches_under(&CLOUD, |p| [p[0] + 3.0, p[1] + 4.0, p[2]]);
        let model = TransformModel::fit(ModelKind::Translation, &matches).unwrap();
        match &model {
            TransformModel::Translation { offset } => {
                assert!((offset - Vector3::new(3.0, 4.0, 0.0)).norm() < 1e-12);
            }
            _ => unreachable!(),
        }
        assert!(mean_residual(&model, &matches) < 1e-12);
    }

    #[test]
    fn translation_needs_one_match() {
        assert_eq!(
            TransformModel::fit(ModelKind::Translation, &[]),
            Err(FitError::NotEnoughDataPoints {
                required: 1,
                found: 0
            })
        );
    }

    #[test]
    fn rigid_recovers_rotation_and_translation() {
        let angle: f64 = 0.3;
        let (s, c) = angle.sin_cos();
        let rotate = |p: [f64; 3]| [c * p[0] - s * p[1] + 2.0, s * p[0] + c * p[1] - 1.0, p[2] + 4.0];
        let matches = matches_under(&CLOUD, rotate);
        let model = TransformModel::fit(ModelKind::Rigid, &matches).unwrap();
        assert!(mean_residual(&model, &matches) < 1e-9);
        match &model {
            TransformModel::Rigid { rotation, .. } => {
                assert!((rotation.determinant() - 1.0).abs() < 1e-9);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn rigid_rejects_collinear_points() {
        let line: Vec<[f64; 3]> = (0..5).map(|i| [i as f64, 0.0, 0.0]).collect();
        let matches = matches_under(&line, |p| [p[0] + 1.0, p[1], p[2]]);
        assert_eq!(
            TransformModel::fit(ModelKind::Rigid, &matches),
            Err(FitError::IllDefinedDataPoints)
        );
    }

    #[test]
    fn affine_recovers_known_transform() {
        let f = |p: [f64; 3]| {
            [
                1.1 * p[0] + 0.2 * p[1] - 0.1 * p[2] + 5.0,
                -0.3 * p[0] + 0.9 * p[1] + 0.05 * p[2] - 2.0,
                0.02 * p[0] - 0.01 * p[1] + 1.05 * p[2] + 1.0,
            ]
        };
        let matches = matches_under(&CLOUD, f);
        let model = TransformModel::fit(ModelKind::Affine, &matches).unwrap();
        assert!(mean_residual(&model, &matches) < 1e-9);
        let mapped = model.apply([3.0, -2.0, 7.0]);
        let expected = f([3.0, -2.0, 7.0]);
        for d in 0..3 {
            assert!((mapped[d] - expected[d]).abs() < 1e-8);
        }
    }

    #[test]
    fn affine_needs_four_matches() {
        let matches = matches_under(&CLOUD[..3], |p| p);
        assert_eq!(
            TransformModel::fit(ModelKind::Affine, &matches),
            Err(FitError::NotEnoughDataPoints {
                required: 4,
                found: 3
            })
        );
    }

    #[test]
    fn affine_rejects_coplanar_points() {
        let plane: Vec<[f64; 3]> = vec![
            [0.0, 0.0, 0.0],
            [10.0, 0.0, 0.0],
            [0.0, 10.0, 0.0],
            [10.0, 10.0, 0.0],
            [5.0, 5.0, 0.0],
        ];
        let matches = matches_under(&plane, |p| [p[0] + 1.0, p[1], p[2]]);
        assert_eq!(
            TransformModel::fit(ModelKind::Affine, &matches),
            Err(FitError::IllDefinedDataPoints)
        );
    }
}
