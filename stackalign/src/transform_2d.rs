use serde::{Deserialize, Serialize};

/// Represents a 2D affine transformation in row-packed form. It includes:
/// - A 2×2 linear transform matrix (`m00`, `m01`, `m10`, `m11`).
/// - A translation offset (`m02`, `m12`).
///
/// This allows a point `(x, y)` to be transformed into `(X, Y)` by:
///
/// ```text
///   X = (x * m00) + (y * m01) + m02;
///   Y = (x * m10) + (y * m11) + m12;
/// ```
///
/// Camera un-warp and per-slice stack-alignment transforms are stored in
/// this form. By convention both are *pull-back* transforms: they map output
/// (aligned) coordinates to input (sensor) coordinates, so resampling a
/// slice applies them directly without inverting first.
///
/// Serialized as the flat six-element row `[m00, m01, m02, m10, m11, m12]`,
/// the same packing the dataset metadata tables use.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AffineTransform2D {
    /// Row-packed coefficients `[m00, m01, m02, m10, m11, m12]`.
    coeffs: [f64; 6],
}

impl AffineTransform2D {
    /// The identity transform.
    pub fn identity() -> AffineTransform2D {
        AffineTransform2D {
            coeffs: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        }
    }

    /// A pure translation by `(dx, dy)`.
    pub fn translation(dx: f64, dy: f64) -> AffineTransform2D {
        AffineTransform2D {
            coeffs: [1.0, 0.0, dx, 0.0, 1.0, dy],
        }
    }

    /// Builds a transform from a row-packed coefficient array
    /// `[m00, m01, m02, m10, m11, m12]`.
    pub fn from_row_packed(coeffs: [f64; 6]) -> AffineTransform2D {
        AffineTransform2D { coeffs }
    }

    /// Returns the row-packed coefficient array.
    pub fn row_packed(&self) -> [f64; 6] {
        self.coeffs
    }

    /// Applies the transformation to a point `(x, y)`.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let [m00, m01, m02, m10, m11, m12] = self.coeffs;
        (x * m00 + y * m01 + m02, x * m10 + y * m11 + m12)
    }

    /// Returns the composition `self ∘ inner`, the transform that applies
    /// `inner` first and `self` to its result.
    pub fn compose(&self, inner: &AffineTransform2D) -> AffineTransform2D {
        let [a00, a01, a02, a10, a11, a12] = self.coeffs;
        let [b00, b01, b02, b10, b11, b12] = inner.coeffs;
        AffineTransform2D {
            coeffs: [
                a00 * b00 + a01 * b10,
                a00 * b01 + a01 * b11,
                a00 * b02 + a01 * b12 + a02,
                a10 * b00 + a11 * b10,
                a10 * b01 + a11 * b11,
                a10 * b02 + a11 * b12 + a12,
            ],
        }
    }

    /// Returns the inverse transform, or `None` if the linear part is
    /// singular.
    pub fn invert(&self) -> Option<AffineTransform2D> {
        let [m00, m01, m02, m10, m11, m12] = self.coeffs;
        let det = m00 * m11 - m01 * m10;
        if det.abs() < 1e-12 {
            return None;
        }
        let i00 = m11 / det;
        let i01 = -m01 / det;
        let i10 = -m10 / det;
        let i11 = m00 / det;
        Some(AffineTransform2D {
            coeffs: [
                i00,
                i01,
                -(i00 * m02 + i01 * m12),
                i10,
                i11,
                -(i10 * m02 + i11 * m12),
            ],
        })
    }
}

impl Default for AffineTransform2D {
    fn default() -> AffineTransform2D {
        AffineTransform2D::identity()
    }
}
