//! Explicit configuration for every pipeline stage.
//!
//! Everything deserializes from TOML with per-field defaults, so a config file
//! only needs the values that differ from the defaults:
//!
//! ```toml
//! [best_fit]
//! expected_radius = 406.4
//! outlier_tolerance = 5.0
//!
//! [surface]
//! m0 = 30
//! n0 = 60
//! basis = "half_cosine"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{ImperfectionError, Result};
use crate::io::NumberFormat;
use crate::resample::InterpolationMethod;
use crate::surface::basis::BasisFunction;

/// Idealized shell geometry the best fit is performed against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShellShape {
    #[default]
    Cylinder,
    /// Cone with a fixed semi-vertex angle; the radius grows with the axial
    /// coordinate for positive angles.
    Cone { half_angle_deg: f64 },
}

impl ShellShape {
    pub fn half_angle(&self) -> Option<f64> {
        match self {
            ShellShape::Cylinder => None,
            ShellShape::Cone { half_angle_deg } => Some(half_angle_deg.to_radians()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BestFitConfig {
    pub shape: ShellShape,
    /// Initial radius guess in mm. Falls back to the mean distance of the
    /// points to the initial axis.
    pub expected_radius: Option<f64>,
    /// Nominal axial height in mm, only used to flag suspicious fits.
    pub expected_height: Option<f64>,
    /// Initial guess for the shell axis in world coordinates.
    pub initial_axis: [f64; 3],
    /// Residual magnitude (mm) above which a point is excluded in the single
    /// re-fit pass. `None` disables outlier exclusion.
    pub outlier_tolerance: Option<f64>,
    pub min_points: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for BestFitConfig {
    fn default() -> Self {
        Self {
            shape: ShellShape::Cylinder,
            expected_radius: None,
            expected_height: None,
            initial_axis: [0.0, 0.0, 1.0],
            outlier_tolerance: None,
            min_points: 6,
            max_iterations: 200,
            tolerance: 1e-12,
        }
    }
}

/// Post-processing applied when mapping fitted points into the canonical frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalConfig {
    /// Rigid rotation added to every theta, in degrees.
    pub theta_offset_deg: f64,
    /// Swap bottom and top edge with a half turn about the canonical x axis:
    /// z -> -z and theta -> -theta, then z is re-offset to start at 0.
    pub flip_axis: bool,
    /// Axial band (mm) removed at the bottom edge.
    pub clip_bottom: f64,
    /// Axial band (mm) removed at the top edge.
    pub clip_top: f64,
    /// Nominal design radius (mm) at the bottom edge of the fit. When set,
    /// radial deviations are measured from it instead of the fitted radius.
    pub nominal_radius: Option<f64>,
}

impl Default for CanonicalConfig {
    fn default() -> Self {
        Self {
            theta_offset_deg: 0.0,
            flip_axis: false,
            clip_bottom: 0.0,
            clip_top: 0.0,
            nominal_radius: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResampleConfig {
    pub n_theta: usize,
    pub n_z: usize,
    pub method: InterpolationMethod,
    /// Cells whose nearest sample is farther than this (mm) are filled by
    /// inverse-distance weighting without cutoff.
    pub max_distance: Option<f64>,
    pub min_points: usize,
}

impl Default for ResampleConfig {
    fn default() -> Self {
        Self {
            n_theta: 180,
            n_z: 60,
            method: InterpolationMethod::default(),
            max_distance: None,
            min_points: 4,
        }
    }
}

/// Source data for the surface fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FitMethod {
    /// Fit the resampled regular grid.
    Grid,
    /// Fit the canonical points directly, skipping the resampler.
    #[default]
    Points,
}

/// Restricts the fit to the listed axial mode rows and circumferential orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ModeFilter {
    pub m: Vec<usize>,
    pub n: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceFitConfig {
    pub m0: usize,
    pub n0: usize,
    pub basis: BasisFunction,
    pub method: FitMethod,
    pub mode_filter: Option<ModeFilter>,
    /// Fit a random subset of this many points (`Points` method only).
    pub sample_size: Option<usize>,
    pub seed: u64,
    /// Above this many samples the normal equations are accumulated instead
    /// of factorizing the full design matrix.
    pub svd_row_limit: usize,
}

impl Default for SurfaceFitConfig {
    fn default() -> Self {
        Self {
            m0: 20,
            n0: 30,
            basis: BasisFunction::default(),
            method: FitMethod::default(),
            mode_filter: None,
            sample_size: None,
            seed: 0,
            svd_row_limit: 20_000,
        }
    }
}

/// Thickness imperfection taken from the fourth scan column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ThicknessConfig {
    pub enabled: bool,
    /// Nominal wall thickness subtracted from every measurement.
    pub nominal: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub number_format: NumberFormat,
    pub write_canonical: bool,
    pub write_grid: bool,
    pub write_report: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            number_format: NumberFormat::default(),
            write_canonical: true,
            write_grid: false,
            write_report: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub best_fit: BestFitConfig,
    pub canonical: CanonicalConfig,
    pub resample: ResampleConfig,
    pub surface: SurfaceFitConfig,
    pub thickness: ThicknessConfig,
    pub output: OutputConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Applies the nominal geometry of a specimen as priors.
    pub fn with_specimen(mut self, specimen: &Specimen) -> Self {
        self.best_fit.expected_radius = Some(specimen.radius);
        self.canonical.nominal_radius = Some(specimen.radius);
        self.best_fit.expected_height = Some(specimen.height);
        if let Some(half_angle_deg) = specimen.half_angle_deg {
            self.best_fit.shape = ShellShape::Cone { half_angle_deg };
        }
        if specimen.thickness.is_some() {
            self.thickness.nominal = specimen.thickness;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.best_fit.min_points < 6 {
            return Err(ImperfectionError::invalid_config(
                "best_fit.min_points must be at least 6",
            ));
        }
        if self.best_fit.max_iterations == 0 {
            return Err(ImperfectionError::invalid_config(
                "best_fit.max_iterations must be positive",
            ));
        }
        if let Some(tol) = self.best_fit.outlier_tolerance {
            if !(tol > 0.0) {
                return Err(ImperfectionError::invalid_config(
                    "best_fit.outlier_tolerance must be positive",
                ));
            }
        }
        if let ShellShape::Cone { half_angle_deg } = self.best_fit.shape {
            if !(half_angle_deg.abs() < 89.0) {
                return Err(ImperfectionError::invalid_config(format!(
                    "cone half angle {} deg out of range",
                    half_angle_deg
                )));
            }
        }
        if let Some(radius) = self.canonical.nominal_radius {
            if !(radius > 0.0) {
                return Err(ImperfectionError::invalid_config(
                    "canonical.nominal_radius must be positive",
                ));
            }
        }
        if self.resample.n_theta == 0 || self.resample.n_z < 2 {
            return Err(ImperfectionError::invalid_config(
                "resample grid needs n_theta >= 1 and n_z >= 2",
            ));
        }
        self.resample.method.validate()?;
        if self.surface.m0 == 0 || self.surface.n0 == 0 {
            return Err(ImperfectionError::invalid_config(
                "surface.m0 and surface.n0 must be positive",
            ));
        }
        Ok(())
    }
}

/// Nominal geometry of one physical specimen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specimen {
    pub radius: f64,
    pub height: f64,
    #[serde(default)]
    pub half_angle_deg: Option<f64>,
    #[serde(default)]
    pub thickness: Option<f64>,
}

/// Lookup table of specimens keyed by name, loaded from TOML:
///
/// ```toml
/// [specimens.Z07]
/// radius = 250.0
/// height = 510.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SpecimenTable {
    #[serde(default)]
    pub specimens: BTreeMap<String, Specimen>,
}

impl SpecimenTable {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn get(&self, name: &str) -> Result<&Specimen> {
        self.specimens.get(name).ok_or_else(|| {
            ImperfectionError::invalid_config(format!("unknown specimen '{}'", name))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specimens.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            [best_fit]
            expected_radius = 406.4
            outlier_tolerance = 5.0
            shape = { kind = "cone", half_angle_deg = 35.0 }

            [resample]
            n_theta = 90
            method = { kind = "inverse_distance", power = 2.0, neighbors = 6 }

            [surface]
            m0 = 12
            basis = "half_sine"
            method = "grid"
        "#;
        let config = PipelineConfig::from_toml_str(text).unwrap();
        assert_eq!(config.best_fit.expected_radius, Some(406.4));
        assert_eq!(config.best_fit.max_iterations, 200);
        assert_eq!(
            config.best_fit.shape,
            ShellShape::Cone {
                half_angle_deg: 35.0
            }
        );
        assert_eq!(config.resample.n_theta, 90);
        assert_eq!(config.resample.n_z, 60);
        assert_eq!(
            config.resample.method,
            InterpolationMethod::InverseDistance {
                power: 2.0,
                neighbors: 6
            }
        );
        assert_eq!(config.surface.m0, 12);
        assert_eq!(config.surface.n0, 30);
        assert_eq!(config.surface.basis, BasisFunction::HalfSine);
        assert_eq!(config.surface.method, FitMethod::Grid);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = PipelineConfig::from_toml_str("[surface]\nm0 = 0\n").unwrap_err();
        assert!(matches!(err, ImperfectionError::InvalidConfig(_)));

        let err = PipelineConfig::from_toml_str("[surface]\nm0 = \"ten\"\n").unwrap_err();
        assert!(matches!(err, ImperfectionError::Config(_)));
    }

    #[test]
    fn test_specimen_table() {
        let text = r#"
            [specimens.Z07]
            radius = 250.0
            height = 510.0

            [specimens.C02]
            radius = 400.0
            height = 300.0
            half_angle_deg = 35.0
            thickness = 0.125
        "#;
        let table = SpecimenTable::from_toml_str(text).unwrap();
        let names: Vec<&str> = table.names().collect();
        assert_eq!(names, vec!["C02", "Z07"]);

        let config = PipelineConfig::default().with_specimen(table.get("C02").unwrap());
        assert_eq!(config.best_fit.expected_radius, Some(400.0));
        assert_eq!(config.best_fit.expected_height, Some(300.0));
        assert_eq!(config.canonical.nominal_radius, Some(400.0));
        assert_eq!(
            config.best_fit.shape,
            ShellShape::Cone {
                half_angle_deg: 35.0
            }
        );
        assert_eq!(config.thickness.nominal, Some(0.125));

        assert!(table.get("missing").is_err());
    }
}
