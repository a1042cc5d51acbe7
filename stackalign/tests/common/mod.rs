//! Synthetic stack construction shared by the integration tests.

use rand::rngs::StdRng;
use rand::Rng;

use stackalign::slice_image::SliceImage;

/// Renders Gaussian blobs of the given scale and amplitude at `positions`
/// into a fresh stack of `num_slices` slices.
pub fn render_stack(
    width: usize,
    height: usize,
    num_slices: usize,
    positions: &[[f64; 3]],
    sigma: f64,
    amplitude: f32,
) -> Vec<SliceImage> {
    let mut slices: Vec<SliceImage> = (0..num_slices)
        .map(|_| SliceImage::new(width, height))
        .collect();
    for &[cx, cy, cz] in positions {
        for (s, slice) in slices.iter_mut().enumerate() {
            let dz = s as f64 - cz;
            // beyond 4 sigma the blob contributes nothing visible
            if dz.abs() > 4.0 * sigma {
                continue;
            }
            for y in 0..height {
                let dy = y as f64 - cy;
                for x in 0..width {
                    let dx = x as f64 - cx;
                    let r2 = dx * dx + dy * dy + dz * dz;
                    let v = amplitude * (-r2 / (2.0 * sigma * sigma)).exp() as f32;
                    if v > 1e-4 {
                        let old = slice.get(x, y);
                        slice.set(x, y, old + v);
                    }
                }
            }
        }
    }
    slices
}

/// Draws `n` positions uniformly from the given ranges, keeping a minimum
/// spacing of `min_dist` to each other and of `avoid_dist` to every point
/// in `avoid`, and staying `z_margin` away from each depth in
/// `forbidden_z`.
pub fn scatter_positions(
    rng: &mut StdRng,
    n: usize,
    x_range: (f64, f64),
    y_range: (f64, f64),
    z_range: (f64, f64),
    min_dist: f64,
    avoid: &[[f64; 3]],
    avoid_dist: f64,
    forbidden_z: &[f64],
    z_margin: f64,
) -> Vec<[f64; 3]> {
    let mut positions: Vec<[f64; 3]> = Vec::with_capacity(n);
    let mut attempts = 0;
    while positions.len() < n {
        attempts += 1;
        assert!(attempts < 100_000, "cannot place {n} separated positions");
        let p = [
            rng.random_range(x_range.0..x_range.1),
            rng.random_range(y_range.0..y_range.1),
            rng.random_range(z_range.0..z_range.1),
        ];
        if forbidden_z.iter().any(|&z| (p[2] - z).abs() < z_margin) {
            continue;
        }
        if positions.iter().any(|q| dist(p, *q) < min_dist) {
            continue;
        }
        if avoid.iter().any(|q| dist(p, *q) < avoid_dist) {
            continue;
        }
        positions.push(p);
    }
    positions
}

pub fn translated(positions: &[[f64; 3]], offset: [f64; 3]) -> Vec<[f64; 3]> {
    positions
        .iter()
        .map(|p| [p[0] + offset[0], p[1] + offset[1], p[2] + offset[2]])
        .collect()
}

fn dist(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}
