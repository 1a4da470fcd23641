//! Measured-imperfection pipeline for cylindrical and conical shells.
//!
//! Raw scans are best-fitted to an ideal shell, mapped into the shell's own
//! (θ, z, Δr) frame, optionally regularized onto a grid, and compressed into
//! a periodic double Fourier series that downstream mesh tools evaluate as
//! w0(θ, z).

pub mod best_fit;
pub mod config;
pub mod entry;
pub mod error;
pub mod io;
pub mod resample;
pub mod surface;
pub mod transform;

mod utils;

#[cfg(feature = "python")]
mod python_bind;

pub use best_fit::canonical::{canonicalize, CanonicalCloud, FieldSource};
pub use best_fit::{best_fit, BestFit, FitParameters};
pub use config::{PipelineConfig, Specimen, SpecimenTable};
pub use entry::{process_batch, process_points, process_scan, BatchJob, ImperfectionArtifacts};
pub use error::{ImperfectionError, Result};
pub use resample::{resample, GridField, InterpolationMethod};
pub use surface::basis::BasisFunction;
pub use surface::{fit_grid, fit_points, fit_surface, FitStatistics, FourierCoefficients};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// This is the module importable from Python:
///
/// ```python
/// import conecylrs as cc
/// result = cc.process_scan_py("scans/Z07.txt", "out/Z07", "pipeline.toml")
/// result.geometric.evaluate(0.0, 255.0)
/// ```
#[cfg(feature = "python")]
#[pymodule]
fn conecylrs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    use python_bind::{
        load_coefficients_py, process_scan_py, PyCoefficients, PyFitParameters, PyImperfection,
    };

    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    m.add_function(wrap_pyfunction!(process_scan_py, m)?)?;
    m.add_function(wrap_pyfunction!(load_coefficients_py, m)?)?;

    m.add_class::<PyFitParameters>()?;
    m.add_class::<PyCoefficients>()?;
    m.add_class::<PyImperfection>()?;
    Ok(())
}
