use serde::{Deserialize, Serialize};

/// A detected 3-D landmark candidate.
///
/// Positions are real-valued; `x` and `y` are in-slice pixel coordinates
/// after un-warping, `z` is a fractional slice-depth coordinate. Points are
/// immutable once created and owned by the per-channel point cloud that
/// produced them; downstream stages refer to them by `id`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InterestPoint {
    /// Sequence id, unique within one channel's merged point cloud.
    pub id: usize,
    /// Position `[x, y, z]` in global stack coordinates.
    pub position: [f64; 3],
    /// Optional detection response, a quality scalar.
    pub intensity: Option<f64>,
}

impl InterestPoint {
    pub fn new(id: usize, position: [f64; 3]) -> InterestPoint {
        InterestPoint {
            id,
            position,
            intensity: None,
        }
    }

    pub fn with_intensity(id: usize, position: [f64; 3], intensity: f64) -> InterestPoint {
        InterestPoint {
            id,
            position,
            intensity: Some(intensity),
        }
    }

    /// Returns a copy with a new sequence id, used when merging per-block
    /// results into one per-channel cloud.
    pub fn reindexed(&self, id: usize) -> InterestPoint {
        InterestPoint { id, ..*self }
    }

    pub fn x(&self) -> f64 {
        self.position[0]
    }

    pub fn y(&self) -> f64 {
        self.position[1]
    }

    pub fn z(&self) -> f64 {
        self.position[2]
    }

    /// Euclidean distance to another point.
    pub fn distance_to(&self, other: &InterestPoint) -> f64 {
        let dx = self.position[0] - other.position[0];
        let dy = self.position[1] - other.position[1];
        let dz = self.position[2] - other.position[2];
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}
