pub mod canonical;
pub mod levenberg;

use nalgebra::{DVector, Matrix3, Point3, Vector3};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::BestFitConfig;
use crate::error::{ImperfectionError, Result};
use crate::io::input::MeasuredPoint;
use crate::transform::{frame_from_axis, tilt_rotation, RigidTransform};
use levenberg::{minimize, LmReport, LmSettings};

const DEGENERATE_COVARIANCE: f64 = 1e-10;
const DEGENERATE_NORMAL_MATRIX: f64 = 1e-14;
/// Candidate axes closer than this (|cos|) to an earlier one are skipped.
const PARALLEL_AXES: f64 = 0.99;
/// A fit whose residual rms exceeds this fraction of the radius has not found
/// the shell.
const MAX_RELATIVE_RMS: f64 = 0.1;

/// Geometry recovered by the best fit, in world coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitParameters {
    /// Point on the axis at the lowest inlier axial position.
    pub origin: [f64; 3],
    /// Unit axis direction.
    pub axis: [f64; 3],
    /// Radius at `origin`.
    pub radius: f64,
    /// Cone semi-vertex angle in radians; `None` for cylinders.
    pub half_angle: Option<f64>,
    /// Axial extent of the inliers.
    pub height: f64,
    pub rms: f64,
    pub iterations: usize,
    pub inliers: usize,
    /// Indices of points excluded by the outlier pass, ascending.
    pub outliers: Vec<usize>,
}

impl FitParameters {
    /// Ideal radius at axial distance `s` above the origin.
    pub fn radius_at(&self, s: f64) -> f64 {
        match self.half_angle {
            Some(phi) => self.radius + s * phi.tan(),
            None => self.radius,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BestFit {
    pub params: FitParameters,
    /// World → fit frame (translate, then rotate).
    pub transform: RigidTransform,
    /// Fit frame → world (rotate, then translate).
    pub inverse: RigidTransform,
}

/// Ideal surface profile: radius grows by `tan` per unit axial length and
/// residuals are scaled by `cos` to measure normal distance.
#[derive(Debug, Clone, Copy)]
struct Profile {
    tan: f64,
    cos: f64,
}

impl Profile {
    fn new(half_angle: Option<f64>) -> Self {
        match half_angle {
            Some(phi) => Self {
                tan: phi.tan(),
                cos: phi.cos(),
            },
            None => Self { tan: 0.0, cos: 1.0 },
        }
    }
}

/// Points expressed in the initial frame (centroid + configured axis).
struct InitialFrame {
    rotation: Matrix3<f64>,
    centroid: Point3<f64>,
    local: Vec<Vector3<f64>>,
}

/// Parameters: tilt α, tilt β, axis offsets x0, y0 (initial frame), radius
/// at the initial frame's z = 0 plane.
fn residuals(local: &[Vector3<f64>], params: &DVector<f64>, profile: Profile) -> DVector<f64> {
    let rt = tilt_rotation(params[0], params[1]).transpose();
    let offset = Vector3::new(params[2], params[3], 0.0);
    let radius = params[4];
    let values: Vec<f64> = local
        .par_iter()
        .map(|q| {
            let u = rt * (q - offset);
            let rho = u.x.hypot(u.y);
            (rho - (radius + u.z * profile.tan)) * profile.cos
        })
        .collect();
    DVector::from_vec(values)
}

/// Centroid and principal directions of the cloud, largest variance first.
struct Spread {
    centroid: Point3<f64>,
    directions: Vec<Vector3<f64>>,
}

fn check_spread(points: &[&MeasuredPoint]) -> Result<Spread> {
    let n = points.len() as f64;
    let centroid = points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p.position().coords)
        / n;
    let covariance = points.iter().fold(Matrix3::zeros(), |acc, p| {
        let d = p.position().coords - centroid;
        acc + d * d.transpose()
    }) / n;
    let eig = covariance.symmetric_eigen();
    let max = eig.eigenvalues.max();
    let min = eig.eigenvalues.min();
    if !(max > 0.0) || min / max < DEGENERATE_COVARIANCE {
        return Err(ImperfectionError::ill_conditioned(format!(
            "points are planar or collinear (covariance eigenvalue ratio {:.3e})",
            if max > 0.0 { min / max } else { 0.0 }
        )));
    }

    let mut order = [0, 1, 2];
    order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));
    Ok(Spread {
        centroid: Point3::from(centroid),
        directions: order
            .iter()
            .map(|&i| eig.eigenvectors.column(i).into_owned())
            .collect(),
    })
}

/// Axes to start from: the configured one, then the principal directions not
/// parallel to it. Cones try both senses of each principal direction.
fn candidate_axes(
    initial: &Vector3<f64>,
    spread: &Spread,
    profile: Profile,
) -> Vec<Vector3<f64>> {
    let initial = initial.normalize();
    let mut axes = vec![initial];
    for d in &spread.directions {
        if axes.iter().any(|a| a.dot(d).abs() > PARALLEL_AXES) {
            continue;
        }
        let d = if d.dot(&initial) < 0.0 { -d } else { *d };
        axes.push(d);
        if profile.tan != 0.0 {
            axes.push(-d);
        }
    }
    axes
}

/// Expresses the points in the frame of `axis` and guesses the starting
/// parameters for it.
fn start_from_axis(
    points: &[MeasuredPoint],
    centroid: Point3<f64>,
    axis: &Vector3<f64>,
    profile: Profile,
    config: &BestFitConfig,
) -> (InitialFrame, DVector<f64>) {
    let rotation = frame_from_axis(axis, &Vector3::x());
    let rt = rotation.transpose();
    let local: Vec<Vector3<f64>> = points.iter().map(|p| rt * (p.position() - centroid)).collect();

    let initial_radius = match config.expected_radius {
        // expected radius refers to the bottom edge
        Some(r) => {
            let s_min = local.iter().map(|q| q.z).fold(f64::INFINITY, f64::min);
            r - s_min * profile.tan
        }
        None => {
            local
                .iter()
                .map(|q| q.x.hypot(q.y) - q.z * profile.tan)
                .sum::<f64>()
                / points.len() as f64
        }
    };
    let frame = InitialFrame {
        rotation,
        centroid,
        local,
    };
    (frame, DVector::from_vec(vec![0.0, 0.0, 0.0, 0.0, initial_radius]))
}

/// Same axis, radius replaced by the nominal bottom-edge radius.
fn with_nominal_radius(
    local: &[Vector3<f64>],
    params: &DVector<f64>,
    nominal: f64,
    profile: Profile,
) -> DVector<f64> {
    let rt = tilt_rotation(params[0], params[1]).transpose();
    let offset = Vector3::new(params[2], params[3], 0.0);
    let s_min = local
        .iter()
        .map(|q| (rt * (q - offset)).z)
        .fold(f64::INFINITY, f64::min);
    let mut nominal_params = params.clone();
    nominal_params[4] = nominal - s_min * profile.tan;
    nominal_params
}

fn run_lm(
    frame: &InitialFrame,
    keep: &[usize],
    initial: DVector<f64>,
    profile: Profile,
    config: &BestFitConfig,
) -> Result<LmReport> {
    let local: Vec<Vector3<f64>> = keep.iter().map(|&i| frame.local[i]).collect();
    let scale = initial[4].abs().max(1.0);
    let settings = LmSettings {
        max_iterations: config.max_iterations,
        tolerance: config.tolerance,
        cost_floor: local.len() as f64 * (1e-12 * scale).powi(2),
        initial_lambda: 1e-3,
    };
    let report = minimize(|p| residuals(&local, p, profile), initial, &settings);
    let rms = (report.cost / local.len() as f64).sqrt();

    if !report.converged {
        return Err(ImperfectionError::Convergence {
            iterations: report.iterations,
            rms,
        });
    }
    let radius = report.params[4];
    if !radius.is_finite() || radius <= 0.0 {
        return Err(ImperfectionError::ill_conditioned(format!(
            "fitted radius {} is not positive",
            radius
        )));
    }
    let eig = report.jtj.clone().symmetric_eigenvalues();
    let max = eig.max();
    if !(max > 0.0) || eig.min() / max < DEGENERATE_NORMAL_MATRIX {
        return Err(ImperfectionError::ill_conditioned(
            "normal matrix is singular at the solution",
        ));
    }
    debug!(iterations = report.iterations, rms, "levenberg-marquardt finished");
    Ok(report)
}

/// Fits an ideal cylinder or cone to the measured points.
pub fn best_fit(points: &[MeasuredPoint], config: &BestFitConfig) -> Result<BestFit> {
    let min_points = config.min_points.max(6);
    if points.len() < min_points {
        return Err(ImperfectionError::insufficient(
            "best fit",
            min_points,
            points.len(),
        ));
    }
    let axis = Vector3::from(config.initial_axis);
    if !(axis.norm() > 0.0) {
        return Err(ImperfectionError::invalid_config(
            "best_fit.initial_axis must be non-zero",
        ));
    }

    let all: Vec<&MeasuredPoint> = points.iter().collect();
    let spread = check_spread(&all)?;

    let half_angle = config.shape.half_angle();
    let profile = Profile::new(half_angle);

    // symmetric starts far from the true axis are stationary points of the
    // cost, so the start with the smallest initial cost is refined
    let (frame, initial) = candidate_axes(&axis, &spread, profile)
        .iter()
        .map(|candidate| {
            let (frame, initial) =
                start_from_axis(points, spread.centroid, candidate, profile, config);
            let cost = residuals(&frame.local, &initial, profile).norm_squared();
            debug!(
                axis = ?[candidate.x, candidate.y, candidate.z],
                rms = (cost / points.len() as f64).sqrt(),
                "candidate axis"
            );
            (cost, frame, initial)
        })
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, frame, initial)| (frame, initial))
        .ok_or_else(|| ImperfectionError::ill_conditioned("no candidate axis"))?;

    let everything: Vec<usize> = (0..points.len()).collect();
    let mut report = run_lm(&frame, &everything, initial, profile, config)?;
    let mut keep = everything;
    let mut outliers = Vec::new();
    let mut iterations = report.iterations;

    if let Some(tolerance) = config.outlier_tolerance {
        // judged against the nominal radius when one is known
        let reference = match config.expected_radius {
            Some(nominal) => with_nominal_radius(&frame.local, &report.params, nominal, profile),
            None => report.params.clone(),
        };
        let full = residuals(&frame.local, &reference, profile);
        outliers = full
            .iter()
            .enumerate()
            .filter(|(_, r)| r.abs() > tolerance)
            .map(|(i, _)| i)
            .collect();

        if !outliers.is_empty() {
            keep = (0..points.len())
                .filter(|i| outliers.binary_search(i).is_err())
                .collect();
            if keep.len() < min_points {
                return Err(ImperfectionError::insufficient(
                    "best fit after outlier exclusion",
                    min_points,
                    keep.len(),
                ));
            }
            info!(
                excluded = outliers.len(),
                tolerance, "excluding outliers and refitting"
            );
            report = run_lm(&frame, &keep, report.params.clone(), profile, config)?;
            iterations += report.iterations;
        }
    }

    let p = &report.params;
    let tilt = tilt_rotation(p[0], p[1]);
    let axis_world = (frame.rotation * tilt * Vector3::z()).normalize();
    let foot = frame.centroid + frame.rotation * Vector3::new(p[2], p[3], 0.0);

    let axial: Vec<f64> = keep
        .iter()
        .map(|&i| (points[i].position() - foot).dot(&axis_world))
        .collect();
    let s_min = axial.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = axial.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let origin = foot + axis_world * s_min;
    let radius = p[4] + s_min * profile.tan;
    let height = s_max - s_min;
    let rms = (report.cost / keep.len() as f64).sqrt();
    if rms > MAX_RELATIVE_RMS * radius {
        return Err(ImperfectionError::ill_conditioned(format!(
            "residual rms {:.3} mm is {:.0}% of the fitted radius; no shell axis found",
            rms,
            100.0 * rms / radius
        )));
    }

    if let Some(expected) = config.expected_height {
        if (height - expected).abs() > 0.1 * expected {
            warn!(height, expected, "fitted axial extent differs from nominal height");
        }
    }

    let canonical_rotation = frame_from_axis(&axis_world, &Vector3::x());
    let transform = RigidTransform::world_to_local(&canonical_rotation, &origin);
    let inverse = RigidTransform::local_to_world(&canonical_rotation, &origin);

    info!(
        radius,
        height,
        rms,
        iterations,
        inliers = keep.len(),
        outliers = outliers.len(),
        "best fit converged"
    );

    Ok(BestFit {
        params: FitParameters {
            origin: [origin.x, origin.y, origin.z],
            axis: [axis_world.x, axis_world.y, axis_world.z],
            radius,
            half_angle,
            height,
            rms,
            iterations,
            inliers: keep.len(),
            outliers,
        },
        transform,
        inverse,
    })
}
