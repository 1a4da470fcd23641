use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::path::PathBuf;

use crate::io::input::{CanonicalPoint, MeasuredPoint};
use crate::transform::RigidTransform;

/// Per-process scratch file so parallel test binaries do not collide.
pub fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("conecylrs_{}_{}", std::process::id(), name))
}

/// Smooth bump of height `amplitude` centred at θ = 0, z = H/2. Lies exactly
/// in the span of the half-sine basis with m0 >= 5 and n0 >= 5.
pub fn bump_field(theta: f64, z: f64, height: f64, amplitude: f64) -> f64 {
    let circ = ((1.0 + theta.cos()) / 2.0).powi(4);
    let axial = (PI * z / height).sin().powi(5);
    amplitude * circ * axial
}

/// One sample per cell of an n_theta × n_z partition of [-π, π) × [0, H],
/// at the cell centre moved by up to `jitter` cells. Values are zero.
pub fn stratified_canonical_points(
    n_theta: usize,
    n_z: usize,
    height: f64,
    jitter: f64,
    seed: u64,
) -> Vec<CanonicalPoint> {
    let mut rng = StdRng::seed_from_u64(seed);
    let d_theta = 2.0 * PI / n_theta as f64;
    let d_z = height / n_z as f64;
    let mut points = Vec::with_capacity(n_theta * n_z);
    for i in 0..n_theta {
        for j in 0..n_z {
            let (jt, jz) = if jitter > 0.0 {
                (
                    rng.random_range(-0.5..0.5) * jitter,
                    rng.random_range(-0.5..0.5) * jitter,
                )
            } else {
                (0.0, 0.0)
            };
            points.push(CanonicalPoint::new(
                -PI + (i as f64 + 0.5 + jt) * d_theta,
                (j as f64 + 0.5 + jz) * d_z,
                0.0,
            ));
        }
    }
    points
}

/// Uniformly scattered samples over [-π, π) × [0, H] with zero values.
pub fn random_canonical_points(n: usize, height: f64, seed: u64) -> Vec<CanonicalPoint> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            CanonicalPoint::new(
                rng.random_range(-PI..PI),
                rng.random_range(0.0..=height),
                0.0,
            )
        })
        .collect()
}

/// Rings of a cylinder (or cone when `half_angle` is set) around the z axis,
/// from z = 0 to z = height, with optional uniform radial noise.
pub fn synthetic_shell(
    radius: f64,
    height: f64,
    half_angle: Option<f64>,
    n_theta: usize,
    n_z: usize,
    noise: f64,
    seed: u64,
) -> Vec<MeasuredPoint> {
    let mut rng = StdRng::seed_from_u64(seed);
    let tan = half_angle.map(f64::tan).unwrap_or(0.0);
    let mut points = Vec::with_capacity(n_theta * n_z);
    for j in 0..n_z {
        let z = height * j as f64 / (n_z - 1) as f64;
        // stagger alternate rings
        let shift = if j % 2 == 0 { 0.0 } else { 0.5 };
        for i in 0..n_theta {
            let theta = 2.0 * PI * (i as f64 + shift) / n_theta as f64;
            let dr = if noise > 0.0 {
                rng.random_range(-noise..noise)
            } else {
                0.0
            };
            let r = radius + z * tan + dr;
            points.push(MeasuredPoint::new(r * theta.cos(), r * theta.sin(), z));
        }
    }
    points
}

/// Moves local shell points into the world with `pose` (local -> world).
pub fn place_shell(points: &[MeasuredPoint], pose: &RigidTransform) -> Vec<MeasuredPoint> {
    points
        .iter()
        .map(|p| {
            let w = pose.apply(&p.position());
            MeasuredPoint {
                x: w.x,
                y: w.y,
                z: w.z,
                value: p.value,
            }
        })
        .collect()
}

#[cfg(test)]
mod test_utils_tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bump_peak_and_support() {
        let h = 1219.2;
        assert_relative_eq!(bump_field(0.0, h / 2.0, h, 2.0), 2.0);
        assert_relative_eq!(bump_field(1.0, 0.0, h, 2.0), 0.0);
        assert!(bump_field(PI - 0.1, h / 2.0, h, 2.0) < 1e-6);
    }

    #[test]
    fn test_stratified_points_cover_cells() {
        let points = stratified_canonical_points(20, 10, 100.0, 0.5, 1);
        assert_eq!(points.len(), 200);
        assert!(points
            .iter()
            .all(|p| p.theta >= -PI && p.theta < PI && p.z > 0.0 && p.z < 100.0));
    }

    #[test]
    fn test_synthetic_shell_radius() {
        let points = synthetic_shell(10.0, 5.0, None, 8, 3, 0.0, 0);
        assert_eq!(points.len(), 24);
        for p in &points {
            assert_relative_eq!(p.x.hypot(p.y), 10.0, epsilon = 1e-12);
        }
        assert_relative_eq!(points.last().unwrap().z, 5.0);
    }
}
