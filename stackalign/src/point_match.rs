use crate::interest_point::InterestPoint;

/// An ordered pair of interest points, one from each point cloud, proposed
/// as a correspondence.
///
/// Matches reference points by id and carry copies of both positions; they
/// are never mutated after creation. The weight defaults to 1.0 and feeds
/// the weighted least-squares model fits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointMatch {
    /// Id of the point in cloud A.
    pub id_a: usize,
    /// Id of the point in cloud B.
    pub id_b: usize,
    /// Position of the point in cloud A.
    pub point_a: [f64; 3],
    /// Position of the point in cloud B.
    pub point_b: [f64; 3],
    /// Match weight.
    pub weight: f64,
}

impl PointMatch {
    /// Creates a match between two points with the default weight of 1.0.
    pub fn new(a: &InterestPoint, b: &InterestPoint) -> PointMatch {
        PointMatch {
            id_a: a.id,
            id_b: b.id,
            point_a: a.position,
            point_b: b.position,
            weight: 1.0,
        }
    }

    /// Creates a match with an explicit weight.
    pub fn with_weight(a: &InterestPoint, b: &InterestPoint, weight: f64) -> PointMatch {
        PointMatch {
            weight,
            ..PointMatch::new(a, b)
        }
    }

    /// Euclidean distance between the two untransformed positions.
    pub fn distance(&self) -> f64 {
        let dx = self.point_a[0] - self.point_b[0];
        let dy = self.point_a[1] - self.point_b[1];
        let dz = self.point_a[2] - self.point_b[2];
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Displacement vector from A to B.
    pub fn displacement(&self) -> [f64; 3] {
        [
            self.point_b[0] - self.point_a[0],
            self.point_b[1] - self.point_a[1],
            self.point_b[2] - self.point_a[2],
        ]
    }
}
