pub mod basis;

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::best_fit::canonical::CanonicalCloud;
use crate::config::{FitMethod, ResampleConfig, SurfaceFitConfig};
use crate::error::{ImperfectionError, Result};
use crate::resample::{resample, GridField};
use basis::{active_terms, BasisFunction, ModeTable, Term};

/// Rows per chunk when accumulating normal equations.
const NORMAL_EQUATION_CHUNK: usize = 4096;

/// Fitted series coefficients. `components[c]` is an m0 × n0 block whose entry
/// (m, n) multiplies `basis.components()[c]` at axial row m and order n.
#[derive(Debug, Clone, PartialEq)]
pub struct FourierCoefficients {
    pub basis: BasisFunction,
    pub m0: usize,
    pub n0: usize,
    /// Axial length of the fitted domain in mm.
    pub height: f64,
    pub components: Vec<DMatrix<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FitStatistics {
    pub samples: usize,
    pub terms: usize,
    pub rank: usize,
    pub sum_squares: f64,
    pub rms: f64,
    pub max_abs: f64,
}

/// Result of one surface fit, with the grid it was fitted to when the grid
/// method was used.
#[derive(Debug, Clone)]
pub struct SurfaceFit {
    pub coefficients: FourierCoefficients,
    pub statistics: FitStatistics,
    pub grid: Option<GridField>,
}

impl FourierCoefficients {
    pub fn new(basis: BasisFunction, height: f64, components: Vec<DMatrix<f64>>) -> Result<Self> {
        if components.len() != basis.components().len() {
            return Err(ImperfectionError::invalid_config(format!(
                "{} basis needs {} coefficient blocks, got {}",
                basis.name(),
                basis.components().len(),
                components.len()
            )));
        }
        let (m0, n0) = components[0].shape();
        if components.iter().any(|c| c.shape() != (m0, n0)) {
            return Err(ImperfectionError::invalid_config(
                "coefficient blocks differ in shape",
            ));
        }
        if !(height > 0.0) {
            return Err(ImperfectionError::invalid_config(format!(
                "domain height must be positive, got {}",
                height
            )));
        }
        Ok(Self {
            basis,
            m0,
            n0,
            height,
            components,
        })
    }

    pub fn zeros(basis: BasisFunction, m0: usize, n0: usize, height: f64) -> Self {
        Self {
            basis,
            m0,
            n0,
            height,
            components: vec![DMatrix::zeros(m0, n0); basis.components().len()],
        }
    }

    /// Evaluates the series w0(θ, z).
    pub fn evaluate(&self, theta: f64, z: f64) -> f64 {
        let table = ModeTable::new(self.m0, self.n0, theta, z, self.height);
        self.basis
            .components()
            .iter()
            .zip(&self.components)
            .map(|(comp, block)| {
                let mut sum = 0.0;
                for m in 0..self.m0 {
                    for n in 0..self.n0 {
                        let c = block[(m, n)];
                        if c != 0.0 {
                            sum += c * table.value(comp, m, n);
                        }
                    }
                }
                sum
            })
            .sum()
    }

    pub fn evaluate_many(&self, coords: &[(f64, f64)]) -> Vec<f64> {
        coords
            .par_iter()
            .map(|&(theta, z)| self.evaluate(theta, z))
            .collect()
    }

    /// Dense reconstruction on a regular grid over the full domain.
    pub fn evaluate_grid(&self, n_theta: usize, n_z: usize) -> GridField {
        let thetas = GridField::theta_coordinates(n_theta);
        let zs = GridField::z_coordinates(n_z, self.height);
        let coords: Vec<(f64, f64)> = thetas
            .iter()
            .flat_map(|&t| zs.iter().map(move |&z| (t, z)))
            .collect();
        let values = self.evaluate_many(&coords);
        GridField {
            values: DMatrix::from_row_iterator(thetas.len(), zs.len(), values),
            thetas,
            zs,
        }
    }

    /// Largest absolute coefficient, handy for quick sanity checks.
    pub fn max_abs(&self) -> f64 {
        self.components
            .iter()
            .flat_map(|c| c.iter())
            .fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }
}

/// Fits the configured series, either through the resampled grid or directly
/// to the canonical points.
pub fn fit_surface(
    cloud: &CanonicalCloud,
    config: &SurfaceFitConfig,
    resample_config: &ResampleConfig,
) -> Result<SurfaceFit> {
    match config.method {
        FitMethod::Points => {
            let (coefficients, statistics) = fit_points(cloud, config)?;
            Ok(SurfaceFit {
                coefficients,
                statistics,
                grid: None,
            })
        }
        FitMethod::Grid => {
            let grid = resample(cloud, resample_config)?;
            let (coefficients, statistics) = fit_grid(&grid, config)?;
            Ok(SurfaceFit {
                coefficients,
                statistics,
                grid: Some(grid),
            })
        }
    }
}

/// Least-squares fit to every cell of a regular grid.
pub fn fit_grid(
    grid: &GridField,
    config: &SurfaceFitConfig,
) -> Result<(FourierCoefficients, FitStatistics)> {
    let samples: Vec<(f64, f64, f64)> = grid.iter().collect();
    fit_samples(&samples, grid.height(), config)
}

/// Least-squares fit straight to scattered canonical points.
pub fn fit_points(
    cloud: &CanonicalCloud,
    config: &SurfaceFitConfig,
) -> Result<(FourierCoefficients, FitStatistics)> {
    let mut samples: Vec<(f64, f64, f64)> = cloud
        .points
        .iter()
        .map(|p| (p.theta, p.z, p.dr))
        .collect();

    if let Some(size) = config.sample_size {
        if size < samples.len() {
            let mut rng = StdRng::seed_from_u64(config.seed);
            let mut picked = rand::seq::index::sample(&mut rng, samples.len(), size).into_vec();
            picked.sort_unstable();
            debug!(from = samples.len(), to = size, "subsampling points");
            samples = picked.into_iter().map(|i| samples[i]).collect();
        }
    }

    fit_samples(&samples, cloud.height, config)
}

fn mode_lists(config: &SurfaceFitConfig) -> Result<(Vec<usize>, Vec<usize>)> {
    let (mut m_modes, mut n_modes): (Vec<usize>, Vec<usize>) = match &config.mode_filter {
        Some(filter) => (filter.m.clone(), filter.n.clone()),
        None => ((0..config.m0).collect(), (0..config.n0).collect()),
    };
    m_modes.sort_unstable();
    m_modes.dedup();
    n_modes.sort_unstable();
    n_modes.dedup();

    if m_modes.is_empty() || n_modes.is_empty() {
        return Err(ImperfectionError::invalid_config("mode filter selects no modes"));
    }
    if m_modes.iter().any(|&m| m >= config.m0) || n_modes.iter().any(|&n| n >= config.n0) {
        return Err(ImperfectionError::invalid_config(format!(
            "mode filter outside m0 = {}, n0 = {}",
            config.m0, config.n0
        )));
    }
    Ok((m_modes, n_modes))
}

fn design_row(terms: &[Term], basis: BasisFunction, table: &ModeTable) -> Vec<f64> {
    let components = basis.components();
    terms
        .iter()
        .map(|t| table.value(&components[t.component], t.m, t.n))
        .collect()
}

fn fit_samples(
    samples: &[(f64, f64, f64)],
    height: f64,
    config: &SurfaceFitConfig,
) -> Result<(FourierCoefficients, FitStatistics)> {
    if config.m0 == 0 || config.n0 == 0 {
        return Err(ImperfectionError::invalid_config(
            "m0 and n0 must be positive",
        ));
    }
    if !(height > 0.0) {
        return Err(ImperfectionError::ill_conditioned(format!(
            "axial extent of the data is {}",
            height
        )));
    }

    let (m_modes, n_modes) = mode_lists(config)?;
    let terms = active_terms(config.basis, &m_modes, &n_modes);
    if samples.len() < terms.len() {
        return Err(ImperfectionError::insufficient(
            "surface fit",
            terms.len(),
            samples.len(),
        ));
    }

    let (m0, n0) = (config.m0, config.n0);
    let rows = |chunk: &[(f64, f64, f64)]| -> Vec<Vec<f64>> {
        chunk
            .iter()
            .map(|&(theta, z, _)| {
                let table = ModeTable::new(m0, n0, theta, z, height);
                design_row(&terms, config.basis, &table)
            })
            .collect()
    };

    let (solution, rank) = if samples.len() <= config.svd_row_limit {
        let design: Vec<Vec<f64>> = samples
            .par_chunks(NORMAL_EQUATION_CHUNK)
            .flat_map_iter(|chunk| rows(chunk))
            .collect();
        let a = DMatrix::from_row_iterator(samples.len(), terms.len(), design.into_iter().flatten());
        let b = DVector::from_iterator(samples.len(), samples.iter().map(|s| s.2));
        solve_svd(a, &b)?
    } else {
        // Partial sums are collected in chunk order, so the total does not
        // depend on how rayon schedules the chunks.
        let partials: Vec<(DMatrix<f64>, DVector<f64>)> = samples
            .par_chunks(NORMAL_EQUATION_CHUNK)
            .map(|chunk| {
                let a = DMatrix::from_row_iterator(
                    chunk.len(),
                    terms.len(),
                    rows(chunk).into_iter().flatten(),
                );
                let b = DVector::from_iterator(chunk.len(), chunk.iter().map(|s| s.2));
                (a.transpose() * &a, a.transpose() * b)
            })
            .collect();
        let mut ata = DMatrix::zeros(terms.len(), terms.len());
        let mut atb = DVector::zeros(terms.len());
        for (pa, pb) in partials {
            ata += pa;
            atb += pb;
        }
        debug!(samples = samples.len(), terms = terms.len(), "solving normal equations");
        solve_svd(ata, &atb)?
    };

    if rank < terms.len() {
        warn!(
            rank,
            terms = terms.len(),
            "surface fit is rank deficient; returning the minimum-norm solution"
        );
    }

    let mut coefficients = FourierCoefficients::zeros(config.basis, m0, n0, height);
    for (term, value) in terms.iter().zip(solution.iter()) {
        coefficients.components[term.component][(term.m, term.n)] = *value;
    }

    let residuals: Vec<f64> = samples
        .par_iter()
        .map(|&(theta, z, value)| value - coefficients.evaluate(theta, z))
        .collect();
    let sum_squares: f64 = residuals.iter().map(|r| r * r).sum();
    let max_abs = residuals.iter().fold(0.0_f64, |acc, r| acc.max(r.abs()));
    let statistics = FitStatistics {
        samples: samples.len(),
        terms: terms.len(),
        rank,
        sum_squares,
        rms: (sum_squares / samples.len() as f64).sqrt(),
        max_abs,
    };

    info!(
        basis = config.basis.name(),
        m0,
        n0,
        samples = statistics.samples,
        terms = statistics.terms,
        rms = statistics.rms,
        "surface fitted"
    );

    Ok((coefficients, statistics))
}

/// Minimum-norm least-squares solution of `a x = b`; returns the numerical rank.
fn solve_svd(a: DMatrix<f64>, b: &DVector<f64>) -> Result<(DVector<f64>, usize)> {
    let (rows, cols) = a.shape();
    let svd = a.svd(true, true);
    let max_sv = svd.singular_values.max();
    if !max_sv.is_finite() || max_sv == 0.0 {
        return Err(ImperfectionError::ill_conditioned(
            "design matrix is zero or not finite",
        ));
    }
    let tol = max_sv * rows.max(cols) as f64 * f64::EPSILON;
    let rank = svd.singular_values.iter().filter(|&&s| s > tol).count();
    let x = svd
        .solve(b, tol)
        .map_err(|e| ImperfectionError::ill_conditioned(e.to_string()))?;
    Ok((x, rank))
}
