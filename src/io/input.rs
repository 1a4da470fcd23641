use nalgebra::{DMatrix, Matrix4, Point3};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::read_table;
use crate::error::{ImperfectionError, Result};
use crate::surface::basis::BasisFunction;
use crate::surface::FourierCoefficients;
use crate::transform::RigidTransform;

/// Raw scanner sample in world coordinates (mm). `value` is the optional
/// fourth column, e.g. a wall thickness measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasuredPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub value: Option<f64>,
}

impl MeasuredPoint {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            value: None,
        }
    }

    pub fn with_value(x: f64, y: f64, z: f64, value: f64) -> Self {
        Self {
            x,
            y,
            z,
            value: Some(value),
        }
    }

    pub fn position(&self) -> Point3<f64> {
        Point3::new(self.x, self.y, self.z)
    }
}

/// Sample expressed in the shell's own cylindrical frame.
/// theta ∈ [-π, π), z ∈ [0, H], `dr` is the deviation in mm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPoint {
    pub theta: f64,
    pub z: f64,
    pub dr: f64,
}

impl CanonicalPoint {
    pub fn new(theta: f64, z: f64, dr: f64) -> Self {
        Self { theta, z, dr }
    }
}

/// Reads a raw scan file with columns `x y z [value]`.
pub fn read_scan<P: AsRef<Path>>(path: P) -> Result<Vec<MeasuredPoint>> {
    let path = path.as_ref();
    let table = read_table(path)?;

    match table.columns {
        3 => Ok(table
            .rows
            .iter()
            .map(|r| MeasuredPoint::new(r[0], r[1], r[2]))
            .collect()),
        4 => Ok(table
            .rows
            .iter()
            .map(|r| MeasuredPoint::with_value(r[0], r[1], r[2], r[3]))
            .collect()),
        0 => Ok(Vec::new()),
        n => Err(ImperfectionError::malformed(
            path,
            0,
            format!("scan files need 3 or 4 columns, found {}", n),
        )),
    }
}

/// Reads a canonical imperfection file with columns `theta z delta_r`.
pub fn read_canonical<P: AsRef<Path>>(path: P) -> Result<Vec<CanonicalPoint>> {
    let path = path.as_ref();
    let table = read_table(path)?;
    if table.columns != 3 && !table.rows.is_empty() {
        return Err(ImperfectionError::malformed(
            path,
            0,
            format!("canonical files need 3 columns, found {}", table.columns),
        ));
    }
    Ok(table
        .rows
        .iter()
        .map(|r| CanonicalPoint::new(r[0], r[1], r[2]))
        .collect())
}

/// Reads a 4×4 row-major homogeneous transform.
pub fn read_transform<P: AsRef<Path>>(path: P) -> Result<RigidTransform> {
    let path = path.as_ref();
    let table = read_table(path)?;
    if table.columns != 4 || table.rows.len() != 4 {
        return Err(ImperfectionError::malformed(
            path,
            0,
            format!(
                "transform must be 4x4, found {}x{}",
                table.rows.len(),
                table.columns
            ),
        ));
    }
    let matrix = Matrix4::from_row_iterator(table.rows.iter().flatten().copied());
    Ok(RigidTransform::from_matrix(matrix))
}

/// Header written above coefficient blocks:
/// `# basis=half_cosine m0=10 n0=12 height=1219.2`
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CoefficientHeader {
    pub basis: BasisFunction,
    pub m0: usize,
    pub n0: usize,
    pub height: f64,
}

impl CoefficientHeader {
    pub fn parse(line: &str) -> Option<Self> {
        let mut basis = None;
        let mut m0 = None;
        let mut n0 = None;
        let mut height = None;
        for token in line.split_whitespace() {
            let (key, value) = token.split_once('=')?;
            match key {
                "basis" => basis = BasisFunction::from_name(value),
                "m0" => m0 = value.parse().ok(),
                "n0" => n0 = value.parse().ok(),
                "height" => height = value.parse().ok(),
                _ => {}
            }
        }
        Some(Self {
            basis: basis?,
            m0: m0?,
            n0: n0?,
            height: height?,
        })
    }

    pub fn render(&self) -> String {
        format!(
            "basis={} m0={} n0={} height={}",
            self.basis.name(),
            self.m0,
            self.n0,
            self.height
        )
    }
}

/// Reads a coefficient file. The header comment supplies basis, orders and
/// domain height; `fallback` is used for files written without one, in which
/// case m0 is inferred from the row count.
pub fn read_coefficients<P: AsRef<Path>>(
    path: P,
    fallback: Option<(BasisFunction, f64)>,
) -> Result<FourierCoefficients> {
    let path = path.as_ref();
    let table = read_table(path)?;

    let header = table
        .comments
        .iter()
        .find_map(|c| CoefficientHeader::parse(c));

    let (basis, m0, n0, height) = match (header, fallback) {
        (Some(h), _) => (h.basis, h.m0, h.n0, h.height),
        (None, Some((basis, height))) => {
            let components = basis.components().len();
            if table.rows.len() % components != 0 {
                return Err(ImperfectionError::malformed(
                    path,
                    0,
                    format!(
                        "{} rows cannot be split into {} coefficient blocks",
                        table.rows.len(),
                        components
                    ),
                ));
            }
            (basis, table.rows.len() / components, table.columns, height)
        }
        (None, None) => {
            return Err(ImperfectionError::malformed(
                path,
                0,
                "missing coefficient header (basis, m0, n0, height)",
            ))
        }
    };

    let components = basis.components().len();
    if table.rows.len() != components * m0 || table.columns != n0 {
        return Err(ImperfectionError::malformed(
            path,
            0,
            format!(
                "expected {} rows x {} columns for {} basis, found {} x {}",
                components * m0,
                n0,
                basis.name(),
                table.rows.len(),
                table.columns
            ),
        ));
    }

    let blocks = (0..components)
        .map(|c| {
            DMatrix::from_row_iterator(
                m0,
                n0,
                table.rows[c * m0..(c + 1) * m0].iter().flatten().copied(),
            )
        })
        .collect();

    FourierCoefficients::new(basis, height, blocks)
}
