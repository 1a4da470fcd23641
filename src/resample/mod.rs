use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{DMatrix, Matrix3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::{debug, info};

use crate::best_fit::canonical::CanonicalCloud;
use crate::config::ResampleConfig;
use crate::error::{ImperfectionError, Result};

/// Neighbour count used when a cell has to be filled without distance cutoff
/// and the method does not define one itself.
const FALLBACK_NEIGHBORS: usize = 8;
const FALLBACK_POWER: f64 = 2.0;

/// Largest offset (mm) added to tree keys.
const KEY_DITHER: f64 = 1e-7;
const GOLDEN: f64 = 0.618_033_988_749_894_9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterpolationMethod {
    Nearest,
    /// Weighted least-squares plane through the nearest `neighbors` samples.
    Linear { neighbors: usize },
    InverseDistance { power: f64, neighbors: usize },
}

impl Default for InterpolationMethod {
    fn default() -> Self {
        InterpolationMethod::InverseDistance {
            power: 2.0,
            neighbors: 8,
        }
    }
}

impl InterpolationMethod {
    pub fn neighbors(&self) -> usize {
        match self {
            InterpolationMethod::Nearest => 1,
            InterpolationMethod::Linear { neighbors } => *neighbors,
            InterpolationMethod::InverseDistance { neighbors, .. } => *neighbors,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            InterpolationMethod::Nearest => Ok(()),
            InterpolationMethod::Linear { neighbors } if *neighbors < 3 => Err(
                ImperfectionError::invalid_config("linear interpolation needs at least 3 neighbors"),
            ),
            InterpolationMethod::InverseDistance { power, neighbors }
                if *neighbors == 0 || !(*power > 0.0) =>
            {
                Err(ImperfectionError::invalid_config(format!(
                    "inverse distance needs neighbors > 0 and power > 0, got {} and {}",
                    neighbors, power
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Regular (θ, z) field. `values[(i, j)]` belongs to `thetas[i]`, `zs[j]`.
/// thetas are cell centred over [-π, π); zs are node centred over [0, H].
#[derive(Debug, Clone, PartialEq)]
pub struct GridField {
    pub thetas: Vec<f64>,
    pub zs: Vec<f64>,
    pub values: DMatrix<f64>,
}

impl GridField {
    pub fn theta_coordinates(n_theta: usize) -> Vec<f64> {
        let step = 2.0 * PI / n_theta as f64;
        (0..n_theta)
            .map(|i| -PI + (i as f64 + 0.5) * step)
            .collect()
    }

    pub fn z_coordinates(n_z: usize, height: f64) -> Vec<f64> {
        if n_z < 2 {
            return vec![0.0; n_z];
        }
        (0..n_z)
            .map(|j| height * j as f64 / (n_z - 1) as f64)
            .collect()
    }

    pub fn from_fn(thetas: Vec<f64>, zs: Vec<f64>, f: impl Fn(f64, f64) -> f64) -> Self {
        let values = DMatrix::from_fn(thetas.len(), zs.len(), |i, j| f(thetas[i], zs[j]));
        Self { thetas, zs, values }
    }

    pub fn height(&self) -> f64 {
        self.zs.last().copied().unwrap_or(0.0)
    }

    /// (θ, z, value) triples, θ-major.
    pub fn iter(&self) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
        self.thetas.iter().enumerate().flat_map(move |(i, &t)| {
            self.zs
                .iter()
                .enumerate()
                .map(move |(j, &z)| (t, z, self.values[(i, j)]))
        })
    }
}

/// Samples indexed for neighbour queries in (R·θ, z) space, replicated at
/// θ ± 2π so queries near the seam see both sides.
struct PeriodicIndex {
    tree: KdTree<f64, 2>,
    coords: Vec<[f64; 2]>,
    values: Vec<f64>,
    radius: f64,
}

#[derive(Debug, Clone, Copy)]
struct Neighbour {
    distance: f64,
    index: usize,
}

impl PeriodicIndex {
    fn new(cloud: &CanonicalCloud) -> Self {
        let radius = cloud.radius;
        let period = 2.0 * PI * radius;
        let mut coords = Vec::with_capacity(cloud.points.len() * 3);
        let mut values = Vec::with_capacity(cloud.points.len() * 3);
        for shift in [0.0, -period, period] {
            for p in &cloud.points {
                coords.push([radius * p.theta + shift, p.z]);
                values.push(p.dr);
            }
        }

        // kiddo panics when a bucket overflows with equal values on one axis
        // (scanner rings share z), so keys carry a sub-micron dither. Query
        // distances are recomputed from the exact coordinates.
        let mut tree: KdTree<f64, 2> = KdTree::with_capacity(coords.len());
        for (i, c) in coords.iter().enumerate() {
            let d = KEY_DITHER * (i as f64 * GOLDEN).fract();
            tree.add(&[c[0] + d, c[1] + d], i as u64);
        }
        Self {
            tree,
            coords,
            values,
            radius,
        }
    }

    /// `k` nearest samples sorted by distance, ties broken by index.
    fn nearest(&self, theta: f64, z: f64, k: usize) -> Vec<Neighbour> {
        let query = [self.radius * theta, z];
        let mut found: Vec<Neighbour> = self
            .tree
            .nearest_n::<SquaredEuclidean>(&query, k)
            .into_iter()
            .map(|n| {
                let index = n.item as usize;
                let [u, v] = self.coords[index];
                Neighbour {
                    distance: (u - query[0]).hypot(v - query[1]),
                    index,
                }
            })
            .collect();
        found.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.index.cmp(&b.index))
        });
        found
    }

    /// Weights are `(d_min / d)^power`, so the nearest sample always weighs 1
    /// and large powers cannot underflow the total to zero.
    fn inverse_distance(&self, neighbours: &[Neighbour], power: f64) -> f64 {
        let nearest = match neighbours.first() {
            Some(n) => n,
            None => return 0.0,
        };
        if nearest.distance == 0.0 {
            return self.values[nearest.index];
        }
        let (weighted, total) = neighbours.iter().fold((0.0, 0.0), |(s, w), n| {
            let weight = (nearest.distance / n.distance).powf(power);
            (s + weight * self.values[n.index], w + weight)
        });
        let value = weighted / total;
        if value.is_finite() {
            value
        } else {
            self.values[nearest.index]
        }
    }

    /// Plane `v = a + b·du + c·dz` fitted to the neighbours with inverse
    /// square distance weights, evaluated at the query (du = dz = 0).
    fn local_plane(&self, theta: f64, z: f64, neighbours: &[Neighbour]) -> Option<f64> {
        if let Some(hit) = neighbours.iter().find(|n| n.distance == 0.0) {
            return Some(self.values[hit.index]);
        }
        let u0 = self.radius * theta;
        let scale = neighbours.last().map(|n| n.distance).unwrap_or(1.0).max(1e-12);
        let mut ata = Matrix3::zeros();
        let mut atb = Vector3::zeros();
        for n in neighbours {
            let [u, v] = self.coords[n.index];
            let row = Vector3::new(1.0, (u - u0) / scale, (v - z) / scale);
            let w = 1.0 / (n.distance / scale).powi(2);
            ata += w * row * row.transpose();
            atb += w * row * self.values[n.index];
        }
        let eig = ata.symmetric_eigenvalues();
        let (min, max) = eig
            .iter()
            .fold((f64::INFINITY, 0.0_f64), |(lo, hi), &e| (lo.min(e), hi.max(e)));
        if !(min > max * 1e-10) {
            return None;
        }
        ata.cholesky().map(|c| c.solve(&atb)[0])
    }
}

/// Resamples the canonical cloud onto a regular (θ, z) grid.
pub fn resample(cloud: &CanonicalCloud, config: &ResampleConfig) -> Result<GridField> {
    config.method.validate()?;
    if config.n_theta == 0 || config.n_z < 2 {
        return Err(ImperfectionError::invalid_config(
            "resample grid needs n_theta >= 1 and n_z >= 2",
        ));
    }
    if !(cloud.radius > 0.0) || !(cloud.height > 0.0) {
        return Err(ImperfectionError::invalid_config(format!(
            "resampling needs a positive radius and height, got {} and {}",
            cloud.radius, cloud.height
        )));
    }

    let needed = config.min_points.max(config.method.neighbors()).max(1);
    if cloud.points.len() < needed {
        return Err(ImperfectionError::insufficient(
            "resampling",
            needed,
            cloud.points.len(),
        ));
    }

    let index = PeriodicIndex::new(cloud);
    let thetas = GridField::theta_coordinates(config.n_theta);
    let zs = GridField::z_coordinates(config.n_z, cloud.height);
    let fallback_k = match config.method {
        InterpolationMethod::InverseDistance { neighbors, .. } => neighbors,
        _ => FALLBACK_NEIGHBORS,
    }
    .min(cloud.points.len());
    let fallback_power = match config.method {
        InterpolationMethod::InverseDistance { power, .. } => power,
        _ => FALLBACK_POWER,
    };
    let k = config.method.neighbors().max(fallback_k);

    let cells: Vec<(f64, bool)> = (0..config.n_theta * config.n_z)
        .into_par_iter()
        .map(|cell| {
            let theta = thetas[cell / config.n_z];
            let z = zs[cell % config.n_z];
            let neighbours = index.nearest(theta, z, k);
            let within: Vec<Neighbour> = neighbours
                .iter()
                .copied()
                .filter(|n| config.max_distance.map_or(true, |limit| n.distance <= limit))
                .collect();

            let value = match config.method {
                InterpolationMethod::Nearest => within.first().map(|n| index.values[n.index]),
                InterpolationMethod::Linear { neighbors } => {
                    let local = &within[..within.len().min(neighbors)];
                    if local.len() < 3 {
                        None
                    } else {
                        index
                            .local_plane(theta, z, local)
                            .or_else(|| Some(index.inverse_distance(local, FALLBACK_POWER)))
                    }
                }
                InterpolationMethod::InverseDistance { power, neighbors } => {
                    let local = &within[..within.len().min(neighbors)];
                    if local.is_empty() {
                        None
                    } else {
                        Some(index.inverse_distance(local, power))
                    }
                }
            };

            match value {
                Some(v) if v.is_finite() => (v, false),
                _ => {
                    let all = &neighbours[..neighbours.len().min(fallback_k)];
                    (index.inverse_distance(all, fallback_power), true)
                }
            }
        })
        .collect();

    let filled = cells.iter().filter(|(_, f)| *f).count();
    if filled > 0 {
        debug!(cells = filled, "cells filled without distance cutoff");
    }
    info!(
        n_theta = config.n_theta,
        n_z = config.n_z,
        points = cloud.points.len(),
        fallback_cells = filled,
        "resampled to grid"
    );

    Ok(GridField {
        values: DMatrix::from_row_iterator(
            config.n_theta,
            config.n_z,
            cells.into_iter().map(|(v, _)| v),
        ),
        thetas,
        zs,
    })
}

#[cfg(test)]
mod resample_tests {
    use super::*;
    use crate::io::input::CanonicalPoint;
    use crate::utils::test_utils::random_canonical_points;
    use approx::assert_relative_eq;

    const R: f64 = 250.0;
    const H: f64 = 510.0;

    fn cloud_of(f: impl Fn(f64, f64) -> f64, n: usize, seed: u64) -> CanonicalCloud {
        let points = random_canonical_points(n, H, seed)
            .into_iter()
            .map(|p| CanonicalPoint::new(p.theta, p.z, f(p.theta, p.z)))
            .collect();
        CanonicalCloud::new(points, R, H)
    }

    fn config(method: InterpolationMethod) -> ResampleConfig {
        ResampleConfig {
            n_theta: 72,
            n_z: 20,
            method,
            ..ResampleConfig::default()
        }
    }

    #[test]
    fn test_grid_coordinates() {
        let thetas = GridField::theta_coordinates(4);
        assert_relative_eq!(thetas[0], -0.75 * PI);
        assert_relative_eq!(thetas[3], 0.75 * PI);
        let zs = GridField::z_coordinates(5, H);
        assert_eq!(zs.first(), Some(&0.0));
        assert_relative_eq!(zs[4], H);
    }

    #[test]
    fn test_seam_continuity() {
        let f = |t: f64, z: f64| t.cos() + 0.2 * (PI * z / H).sin();
        let cloud = cloud_of(f, 3000, 11);
        for method in [
            InterpolationMethod::default(),
            InterpolationMethod::Nearest,
            InterpolationMethod::Linear { neighbors: 8 },
        ] {
            let grid = resample(&cloud, &config(method)).unwrap();
            let last = grid.thetas.len() - 1;
            for j in 0..grid.zs.len() {
                let first = grid.values[(0, j)];
                let end = grid.values[(last, j)];
                assert!(
                    (first - end).abs() < 0.1,
                    "{:?}: seam jump {} vs {} at z = {}",
                    method,
                    first,
                    end,
                    grid.zs[j]
                );
            }
        }
    }

    #[test]
    fn test_seam_uses_points_across_the_cut() {
        // every sample sits just below θ = π; cells at θ ≈ -π must still see
        // them at arc distance ~0 instead of ~2πR
        let points: Vec<CanonicalPoint> = (0..40)
            .map(|j| CanonicalPoint::new(PI - 1e-3, H * j as f64 / 39.0, 1.0 + j as f64 * 0.01))
            .collect();
        let cloud = CanonicalCloud::new(points, R, H);
        let cfg = ResampleConfig {
            n_theta: 360,
            n_z: 40,
            method: InterpolationMethod::Nearest,
            ..ResampleConfig::default()
        };
        let grid = resample(&cloud, &cfg).unwrap();
        assert_relative_eq!(grid.values[(0, 10)], grid.values[(359, 10)]);
    }

    #[test]
    fn test_linear_reproduces_planar_field() {
        let f = |t: f64, z: f64| 0.5 + 0.01 * R * t - 0.002 * z;
        let cloud = cloud_of(f, 2000, 3);
        let cfg = ResampleConfig {
            n_theta: 36,
            n_z: 10,
            method: InterpolationMethod::Linear { neighbors: 8 },
            ..ResampleConfig::default()
        };
        let grid = resample(&cloud, &cfg).unwrap();
        // away from the seam the local plane is exact
        for (i, &t) in grid.thetas.iter().enumerate() {
            if t.abs() > 2.5 {
                continue;
            }
            for (j, &z) in grid.zs.iter().enumerate() {
                assert_relative_eq!(grid.values[(i, j)], f(t, z), epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn test_sparse_cells_never_nan() {
        let points = vec![
            CanonicalPoint::new(0.0, 10.0, 1.0),
            CanonicalPoint::new(0.1, 20.0, 2.0),
            CanonicalPoint::new(0.2, 30.0, 3.0),
            CanonicalPoint::new(0.3, 40.0, 4.0),
        ];
        let cloud = CanonicalCloud::new(points, R, H);
        for method in [
            InterpolationMethod::Nearest,
            InterpolationMethod::Linear { neighbors: 3 },
            InterpolationMethod::InverseDistance {
                power: 2.0,
                neighbors: 4,
            },
        ] {
            let cfg = ResampleConfig {
                n_theta: 12,
                n_z: 6,
                method,
                max_distance: Some(5.0),
                ..ResampleConfig::default()
            };
            let grid = resample(&cloud, &cfg).unwrap();
            assert!(grid.values.iter().all(|v| v.is_finite()));
            assert!(grid.values.iter().all(|v| (1.0..=4.0).contains(v)));
        }
    }

    #[test]
    fn test_steep_inverse_distance_stays_finite() {
        let points = vec![
            CanonicalPoint::new(0.0, 10.0, 1.0),
            CanonicalPoint::new(0.1, 20.0, 2.0),
            CanonicalPoint::new(0.2, 30.0, 3.0),
            CanonicalPoint::new(0.3, 40.0, 4.0),
        ];
        let cloud = CanonicalCloud::new(points, R, H);
        let cfg = ResampleConfig {
            n_theta: 8,
            n_z: 4,
            method: InterpolationMethod::InverseDistance {
                power: 120.0,
                neighbors: 4,
            },
            ..ResampleConfig::default()
        };
        let grid = resample(&cloud, &cfg).unwrap();
        assert!(grid.values.iter().all(|v| (1.0..=4.0).contains(v)));

        // θ = 0.39, z = 0: the sample at (0.3, 40) is nearest by a wide margin
        assert_relative_eq!(grid.values[(4, 0)], 4.0, epsilon = 1e-6);
    }

    #[test]
    fn test_insufficient_points() {
        let points = vec![
            CanonicalPoint::new(0.0, 10.0, 1.0),
            CanonicalPoint::new(0.1, 20.0, 2.0),
        ];
        let cloud = CanonicalCloud::new(points, R, H);
        let err = resample(&cloud, &config(InterpolationMethod::Nearest)).unwrap_err();
        assert!(matches!(
            err,
            ImperfectionError::InsufficientData { needed: 4, got: 2, .. }
        ));
    }

    #[test]
    fn test_scanner_rings_share_z() {
        // 400 samples per ring at identical z
        let points: Vec<CanonicalPoint> = (0..6)
            .flat_map(|j| {
                (0..400).map(move |i| {
                    let theta = -PI + 2.0 * PI * i as f64 / 400.0;
                    CanonicalPoint::new(theta, H * j as f64 / 5.0, theta.sin())
                })
            })
            .collect();
        let cloud = CanonicalCloud::new(points, R, H);
        let grid = resample(&cloud, &config(InterpolationMethod::default())).unwrap();
        assert!(grid.values.iter().all(|v| v.is_finite()));
        // first and last z nodes sit on a ring
        for (i, &t) in grid.thetas.iter().enumerate() {
            assert_relative_eq!(grid.values[(i, 0)], t.sin(), epsilon = 0.02);
        }
    }

    #[test]
    fn test_resample_is_deterministic() {
        let cloud = cloud_of(|t, z| (3.0 * t).sin() * z / H, 500, 5);
        let cfg = config(InterpolationMethod::default());
        let a = resample(&cloud, &cfg).unwrap();
        let b = resample(&cloud, &cfg).unwrap();
        assert_eq!(a, b);
    }
}
