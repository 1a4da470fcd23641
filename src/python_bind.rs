// File: src/python_bind.rs
use pyo3::prelude::*;
use std::path::Path;

use crate::best_fit::FitParameters;
use crate::config::PipelineConfig;
use crate::entry::{process_scan, ImperfectionArtifacts};
use crate::io::input::read_coefficients;
use crate::surface::FourierCoefficients;

fn to_py_err(e: impl std::fmt::Display) -> PyErr {
    pyo3::exceptions::PyRuntimeError::new_err(e.to_string())
}

#[pyclass]
#[derive(Debug, Clone)]
pub struct PyFitParameters {
    #[pyo3(get)]
    pub origin: (f64, f64, f64),
    #[pyo3(get)]
    pub axis: (f64, f64, f64),
    #[pyo3(get)]
    pub radius: f64,
    #[pyo3(get)]
    pub half_angle: Option<f64>,
    #[pyo3(get)]
    pub height: f64,
    #[pyo3(get)]
    pub rms: f64,
    #[pyo3(get)]
    pub inliers: usize,
    #[pyo3(get)]
    pub outliers: Vec<usize>,
}

#[pymethods]
impl PyFitParameters {
    fn __repr__(&self) -> String {
        format!(
            "FitParameters(radius={:.4}, height={:.2}, rms={:.3e}, inliers={}, outliers={})",
            self.radius,
            self.height,
            self.rms,
            self.inliers,
            self.outliers.len()
        )
    }
}

impl From<&FitParameters> for PyFitParameters {
    fn from(p: &FitParameters) -> Self {
        Self {
            origin: (p.origin[0], p.origin[1], p.origin[2]),
            axis: (p.axis[0], p.axis[1], p.axis[2]),
            radius: p.radius,
            half_angle: p.half_angle,
            height: p.height,
            rms: p.rms,
            inliers: p.inliers,
            outliers: p.outliers.clone(),
        }
    }
}

/// Fitted series, evaluable from Python as w0(theta, z).
#[pyclass]
#[derive(Debug, Clone)]
pub struct PyCoefficients {
    inner: FourierCoefficients,
}

#[pymethods]
impl PyCoefficients {
    #[getter]
    fn basis(&self) -> &'static str {
        self.inner.basis.name()
    }

    #[getter]
    fn m0(&self) -> usize {
        self.inner.m0
    }

    #[getter]
    fn n0(&self) -> usize {
        self.inner.n0
    }

    #[getter]
    fn height(&self) -> f64 {
        self.inner.height
    }

    /// Coefficient blocks as nested lists, `[component][m][n]`.
    #[getter]
    fn components(&self) -> Vec<Vec<Vec<f64>>> {
        self.inner
            .components
            .iter()
            .map(|block| {
                block
                    .row_iter()
                    .map(|r| r.iter().copied().collect())
                    .collect()
            })
            .collect()
    }

    fn evaluate(&self, theta: f64, z: f64) -> f64 {
        self.inner.evaluate(theta, z)
    }

    fn evaluate_many(&self, coords: Vec<(f64, f64)>) -> Vec<f64> {
        self.inner.evaluate_many(&coords)
    }

    fn __repr__(&self) -> String {
        format!(
            "Coefficients(basis={}, m0={}, n0={}, height={:.2})",
            self.inner.basis.name(),
            self.inner.m0,
            self.inner.n0,
            self.inner.height
        )
    }
}

impl From<&FourierCoefficients> for PyCoefficients {
    fn from(c: &FourierCoefficients) -> Self {
        Self { inner: c.clone() }
    }
}

#[pyclass]
#[derive(Debug, Clone)]
pub struct PyImperfection {
    #[pyo3(get)]
    pub label: String,
    #[pyo3(get)]
    pub fit: PyFitParameters,
    #[pyo3(get)]
    pub geometric: PyCoefficients,
    #[pyo3(get)]
    pub thickness: Option<PyCoefficients>,
}

#[pymethods]
impl PyImperfection {
    fn __repr__(&self) -> String {
        format!(
            "Imperfection(label={}, radius={:.4}, thickness={})",
            self.label,
            self.fit.radius,
            self.thickness.is_some()
        )
    }
}

impl From<&ImperfectionArtifacts> for PyImperfection {
    fn from(a: &ImperfectionArtifacts) -> Self {
        Self {
            label: a.label.clone(),
            fit: (&a.best_fit.params).into(),
            geometric: (&a.geometric.fit.coefficients).into(),
            thickness: a.thickness.as_ref().map(|t| (&t.fit.coefficients).into()),
        }
    }
}

/// Runs the imperfection pipeline on one scan file.
#[pyfunction]
#[pyo3(signature = (input_path, output_dir = None, config_path = None))]
pub fn process_scan_py(
    input_path: &str,
    output_dir: Option<&str>,
    config_path: Option<&str>,
) -> PyResult<PyImperfection> {
    let config = match config_path {
        Some(path) => PipelineConfig::from_file(path).map_err(to_py_err)?,
        None => PipelineConfig::default(),
    };
    let artifacts = process_scan(Path::new(input_path), output_dir.map(Path::new), &config)
        .map_err(|e| to_py_err(format!("{:#}", e)))?;
    Ok((&artifacts).into())
}

/// Loads a coefficient file written by the pipeline.
#[pyfunction]
pub fn load_coefficients_py(path: &str) -> PyResult<PyCoefficients> {
    let coefficients = read_coefficients(path, None).map_err(to_py_err)?;
    Ok((&coefficients).into())
}
