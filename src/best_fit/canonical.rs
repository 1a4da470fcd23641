use nalgebra::{Matrix3, Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::BestFit;
use crate::config::CanonicalConfig;
use crate::error::{ImperfectionError, Result};
use crate::io::input::{CanonicalPoint, MeasuredPoint};
use crate::transform::{to_cylindrical, wrap_angle, RigidTransform};

/// Which quantity becomes the imperfection amplitude `dr`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldSource {
    /// Radial distance to the ideal surface (geometric imperfection).
    #[default]
    Radial,
    /// The scan's fourth column minus an optional nominal value, e.g. a
    /// thickness imperfection.
    Value { nominal: Option<f64> },
}

/// Canonical samples of one dataset together with the domain they live on.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalCloud {
    pub points: Vec<CanonicalPoint>,
    /// Nominal radius at z = 0, used to measure arc length.
    pub radius: f64,
    /// Axial extent H; points satisfy 0 <= z <= H.
    pub height: f64,
    /// World -> canonical transform that produced the points.
    pub transform: RigidTransform,
}

impl CanonicalCloud {
    pub fn new(points: Vec<CanonicalPoint>, radius: f64, height: f64) -> Self {
        Self {
            points,
            radius,
            height,
            transform: RigidTransform::identity(),
        }
    }

    /// Builds a cloud from points already offset to z >= 0, taking H from
    /// the highest sample.
    pub fn from_points(points: Vec<CanonicalPoint>, radius: f64) -> Self {
        let height = points.iter().map(|p| p.z).fold(0.0, f64::max);
        Self::new(points, radius, height)
    }

    pub fn with_transform(mut self, transform: RigidTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Maps measured points into the canonical (θ, z, dr) frame of a best fit.
pub fn canonicalize(
    points: &[MeasuredPoint],
    fit: &BestFit,
    config: &CanonicalConfig,
    source: FieldSource,
) -> Result<CanonicalCloud> {
    let offset = config.theta_offset_deg.to_radians();
    let sign = if config.flip_axis { -1.0 } else { 1.0 };
    let nominal_radius_at = |s: f64| match config.nominal_radius {
        Some(r) => r + s * fit.params.half_angle.map_or(0.0, f64::tan),
        None => fit.params.radius_at(s),
    };

    let mut mapped = Vec::with_capacity(points.len());
    for (i, p) in points.iter().enumerate() {
        let c = fit.transform.apply(&p.position());
        let (rho, theta, s) = to_cylindrical(c.x, c.y, c.z);
        let dr = match source {
            FieldSource::Radial => rho - nominal_radius_at(s),
            FieldSource::Value { nominal } => match p.value {
                Some(v) => v - nominal.unwrap_or(0.0),
                None => {
                    return Err(ImperfectionError::invalid_config(format!(
                        "point {} has no value column to use as field",
                        i
                    )))
                }
            },
        };
        // flipping is a half turn about x: z -> -z, theta -> -theta
        mapped.push((wrap_angle(sign * theta + offset), sign * s, dr));
    }

    if mapped.is_empty() {
        return Err(ImperfectionError::insufficient("canonicalize", 1, 0));
    }

    let lo = mapped.iter().map(|m| m.1).fold(f64::INFINITY, f64::min);
    let hi = mapped.iter().map(|m| m.1).fold(f64::NEG_INFINITY, f64::max);
    let bottom = lo + config.clip_bottom;
    let top = hi - config.clip_top;
    if !(top > bottom) {
        return Err(ImperfectionError::invalid_config(format!(
            "clipping {} mm bottom and {} mm top leaves nothing of a {} mm shell",
            config.clip_bottom,
            config.clip_top,
            hi - lo
        )));
    }

    let kept: Vec<CanonicalPoint> = mapped
        .iter()
        .filter(|(_, z, _)| *z >= bottom && *z <= top)
        .map(|&(theta, z, dr)| CanonicalPoint::new(theta, z - bottom, dr))
        .collect();
    if kept.is_empty() {
        return Err(ImperfectionError::insufficient("canonicalize", 1, 0));
    }

    let flip = if config.flip_axis {
        Matrix3::from_diagonal(&Vector3::new(1.0, -1.0, -1.0))
    } else {
        Matrix3::identity()
    };
    let spin = Rotation3::from_axis_angle(&Vector3::z_axis(), offset).into_inner();
    let transform = fit
        .transform
        .then(&RigidTransform::local_to_world(&flip, &Point3::origin()))
        .then(&RigidTransform::local_to_world(&spin, &Point3::origin()))
        .then(&RigidTransform::local_to_world(
            &Matrix3::identity(),
            &Point3::new(0.0, 0.0, -bottom),
        ));

    info!(
        kept = kept.len(),
        dropped = points.len() - kept.len(),
        height = top - bottom,
        "canonicalized points"
    );

    Ok(CanonicalCloud {
        points: kept,
        radius: fit.params.radius_at(sign * bottom),
        height: top - bottom,
        transform,
    })
}

#[cfg(test)]
mod canonical_tests {
    use super::*;
    use crate::best_fit::best_fit;
    use crate::config::BestFitConfig;
    use crate::transform::{frame_from_axis, tilt_rotation};
    use crate::utils::test_utils::{place_shell, synthetic_shell};
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    const R: f64 = 250.0;
    const H: f64 = 510.0;

    fn fitted() -> (Vec<MeasuredPoint>, BestFit) {
        let axis = tilt_rotation(0.02, 0.01) * Vector3::z();
        let pose = RigidTransform::local_to_world(
            &frame_from_axis(&axis, &Vector3::x()),
            &Point3::new(-3.0, 4.0, 20.0),
        );
        let world = place_shell(&synthetic_shell(R, H, None, 36, 9, 0.0, 4), &pose);
        let fit = best_fit(&world, &BestFitConfig::default()).unwrap();
        (world, fit)
    }

    #[test]
    fn test_canonical_ranges() {
        let (world, fit) = fitted();
        let cloud =
            canonicalize(&world, &fit, &CanonicalConfig::default(), FieldSource::Radial).unwrap();
        assert_eq!(cloud.len(), world.len());
        assert_relative_eq!(cloud.height, H, max_relative = 1e-6);
        assert_relative_eq!(cloud.radius, R, max_relative = 1e-6);
        for p in &cloud.points {
            assert!(p.theta >= -PI && p.theta < PI);
            assert!(p.z >= 0.0 && p.z <= cloud.height);
            assert!(p.dr.abs() < 1e-6);
        }
    }

    #[test]
    fn test_transform_matches_points() {
        let (world, fit) = fitted();
        let config = CanonicalConfig {
            theta_offset_deg: 30.0,
            flip_axis: true,
            clip_bottom: 10.0,
            clip_top: 5.0,
            ..CanonicalConfig::default()
        };
        let cloud = canonicalize(&world, &fit, &config, FieldSource::Radial).unwrap();
        assert_relative_eq!(cloud.height, H - 15.0, max_relative = 1e-6);
        assert!(cloud.len() < world.len());

        // every kept point is reproduced by the composed transform
        let mut matched = 0;
        for p in &world {
            let c = cloud.transform.apply(&p.position());
            let (_, theta, z) = to_cylindrical(c.x, c.y, c.z);
            if let Some(q) = cloud
                .points
                .iter()
                .find(|q| (q.z - z).abs() < 1e-9 && (q.theta - wrap_angle(theta)).abs() < 1e-9)
            {
                assert!(q.z >= 0.0);
                matched += 1;
            }
        }
        assert_eq!(matched, cloud.len());
    }

    #[test]
    fn test_value_field_nominal_radius_and_clipping() {
        let (world, fit) = fitted();
        let with_values: Vec<MeasuredPoint> = world
            .iter()
            .map(|p| MeasuredPoint::with_value(p.x, p.y, p.z, 0.13))
            .collect();
        let cloud = canonicalize(
            &with_values,
            &fit,
            &CanonicalConfig::default(),
            FieldSource::Value {
                nominal: Some(0.125),
            },
        )
        .unwrap();
        assert!(cloud.points.iter().all(|p| (p.dr - 0.005).abs() < 1e-12));

        let err = canonicalize(
            &world,
            &fit,
            &CanonicalConfig::default(),
            FieldSource::Value { nominal: None },
        )
        .unwrap_err();
        assert!(matches!(err, ImperfectionError::InvalidConfig(_)));

        let nominal = CanonicalConfig {
            nominal_radius: Some(R - 0.5),
            ..CanonicalConfig::default()
        };
        let cloud = canonicalize(&world, &fit, &nominal, FieldSource::Radial).unwrap();
        assert!(cloud.points.iter().all(|p| (p.dr - 0.5).abs() < 1e-6));

        let clip_all = CanonicalConfig {
            clip_bottom: H / 2.0,
            clip_top: H / 2.0 + 1.0,
            ..CanonicalConfig::default()
        };
        assert!(canonicalize(&world, &fit, &clip_all, FieldSource::Radial).is_err());
    }
}
