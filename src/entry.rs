use anyhow::{anyhow, Context, Result};
use crossbeam::thread;
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::best_fit::canonical::{canonicalize, CanonicalCloud, FieldSource};
use crate::best_fit::{best_fit, BestFit, FitParameters};
use crate::config::PipelineConfig;
use crate::io::input::{read_scan, MeasuredPoint};
use crate::io::output::{
    write_canonical, write_coefficients, write_grid, write_report, write_transform,
};
use crate::surface::{fit_surface, FitStatistics, SurfaceFit};

/// Canonical cloud and fitted series of one imperfection field.
#[derive(Debug, Clone)]
pub struct FieldArtifacts {
    pub cloud: CanonicalCloud,
    pub fit: SurfaceFit,
}

/// Everything produced from one scan.
#[derive(Debug, Clone)]
pub struct ImperfectionArtifacts {
    pub label: String,
    pub best_fit: BestFit,
    pub geometric: FieldArtifacts,
    pub thickness: Option<FieldArtifacts>,
}

#[derive(Debug, Serialize)]
struct DatasetReport<'a> {
    label: &'a str,
    points: usize,
    best_fit: &'a FitParameters,
    basis: &'a str,
    m0: usize,
    n0: usize,
    height: f64,
    geometric: FitStatistics,
    thickness: Option<FitStatistics>,
}

/// One scan of a batch and where its outputs go.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub input: PathBuf,
    pub output_dir: Option<PathBuf>,
}

fn fit_field(
    points: &[MeasuredPoint],
    fit: &BestFit,
    source: FieldSource,
    config: &PipelineConfig,
) -> Result<FieldArtifacts> {
    let cloud = canonicalize(points, fit, &config.canonical, source)?;
    let surface = fit_surface(&cloud, &config.surface, &config.resample)?;
    Ok(FieldArtifacts {
        cloud,
        fit: surface,
    })
}

/// Best fit, canonicalization and surface fit of an in-memory scan. The
/// geometric and thickness fields are fitted side by side.
pub fn process_points(
    label: &str,
    points: &[MeasuredPoint],
    config: &PipelineConfig,
) -> Result<ImperfectionArtifacts> {
    config.validate().context("invalid pipeline configuration")?;

    let fit = best_fit(points, &config.best_fit)
        .with_context(|| format!("best fit of {} failed", label))?;

    let (geometric, thickness) = thread::scope(|s| -> Result<_> {
        let geometric_handle = s.spawn(|_| -> Result<_> {
            fit_field(points, &fit, FieldSource::Radial, config)
                .with_context(|| format!("geometric imperfection of {} failed", label))
        });

        let thickness_handle = s.spawn(|_| -> Result<_> {
            if !config.thickness.enabled {
                return Ok(None);
            }
            let source = FieldSource::Value {
                nominal: config.thickness.nominal,
            };
            fit_field(points, &fit, source, config)
                .map(Some)
                .with_context(|| format!("thickness imperfection of {} failed", label))
        });

        let geometric = geometric_handle
            .join()
            .map_err(|_| anyhow!("geometric fit thread panicked"))??;
        let thickness = thickness_handle
            .join()
            .map_err(|_| anyhow!("thickness fit thread panicked"))??;
        Ok((geometric, thickness))
    })
    .map_err(|panic_payload| anyhow!("Parallel fitting threads panicked: {:?}", panic_payload))??;

    Ok(ImperfectionArtifacts {
        label: label.to_string(),
        best_fit: fit,
        geometric,
        thickness,
    })
}

/// Writes the artifacts of one dataset into `output_dir`:
///
/// - `<label>_coefficients.txt`, `<label>_tinv.txt`
/// - `<label>_canonical.txt` and `<label>_grid.txt` when enabled
/// - `<label>_thickness_*` for the thickness field
/// - `<label>_report.json`
pub fn write_artifacts(
    artifacts: &ImperfectionArtifacts,
    output_dir: &Path,
    config: &PipelineConfig,
) -> Result<()> {
    std::fs::create_dir_all(output_dir)
        .context(format!("Could not create output directory: {:?}", output_dir))?;
    let fmt = &config.output.number_format;
    let label = &artifacts.label;

    let mut fields = vec![(String::new(), &artifacts.geometric)];
    if let Some(thickness) = &artifacts.thickness {
        fields.push(("thickness_".to_string(), thickness));
    }

    for (prefix, field) in fields {
        let file = |name: &str| output_dir.join(format!("{}_{}{}", label, prefix, name));

        write_coefficients(file("coefficients.txt"), &field.fit.coefficients, fmt)
            .context("write_coefficients failed")?;
        if config.output.write_canonical {
            write_canonical(file("canonical.txt"), &field.cloud.points, fmt)
                .context("write_canonical failed")?;
        }
        if config.output.write_grid {
            let grid = match &field.fit.grid {
                Some(grid) => grid.clone(),
                None => field
                    .fit
                    .coefficients
                    .evaluate_grid(config.resample.n_theta, config.resample.n_z),
            };
            write_grid(file("grid.txt"), &grid, fmt).context("write_grid failed")?;
        }
    }

    // canonical -> world, including clipping offsets and flips
    write_transform(
        output_dir.join(format!("{}_tinv.txt", label)),
        &artifacts.geometric.cloud.transform.inverse(),
        fmt,
    )
    .context("write_transform failed")?;

    if config.output.write_report {
        let coefficients = &artifacts.geometric.fit.coefficients;
        let report = DatasetReport {
            label,
            points: artifacts.best_fit.params.inliers + artifacts.best_fit.params.outliers.len(),
            best_fit: &artifacts.best_fit.params,
            basis: coefficients.basis.name(),
            m0: coefficients.m0,
            n0: coefficients.n0,
            height: coefficients.height,
            geometric: artifacts.geometric.fit.statistics,
            thickness: artifacts.thickness.as_ref().map(|t| t.fit.statistics),
        };
        write_report(output_dir.join(format!("{}_report.json", label)), &report)
            .context("write_report failed")?;
    }

    info!(label = label.as_str(), dir = %output_dir.display(), "artifacts written");
    Ok(())
}

/// Runs the full pipeline on one scan file, labelled by its file stem.
pub fn process_scan(
    input: &Path,
    output_dir: Option<&Path>,
    config: &PipelineConfig,
) -> Result<ImperfectionArtifacts> {
    let label = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("scan")
        .to_string();

    let points = read_scan(input).with_context(|| format!("reading {:?} failed", input))?;
    let artifacts = process_points(&label, &points, config)?;

    if let Some(dir) = output_dir {
        write_artifacts(&artifacts, dir, config)?;
    }
    Ok(artifacts)
}

/// Processes independent scans in parallel. One result per job, in job order.
pub fn process_batch(
    jobs: &[BatchJob],
    config: &PipelineConfig,
) -> Vec<Result<ImperfectionArtifacts>> {
    let results: Vec<Result<ImperfectionArtifacts>> = jobs
        .par_iter()
        .map(|job| process_scan(&job.input, job.output_dir.as_deref(), config))
        .collect();

    let success_count = results.iter().filter(|r| r.is_ok()).count();
    for (job, result) in jobs.iter().zip(&results) {
        if let Err(e) = result {
            warn!(input = %job.input.display(), error = %format!("{:#}", e), "scan failed");
        }
    }
    info!(
        succeeded = success_count,
        total = jobs.len(),
        "batch finished"
    );
    results
}

#[cfg(test)]
mod entry_tests {
    use super::*;
    use crate::config::{FitMethod, SurfaceFitConfig};
    use crate::io::input::read_coefficients;
    use crate::transform::{frame_from_axis, tilt_rotation, RigidTransform};
    use crate::utils::test_utils::{bump_field, place_shell, synthetic_shell, temp_path};
    use approx::assert_relative_eq;
    use nalgebra::{Point3, Vector3};
    use std::f64::consts::PI;
    use std::fmt::Write as _;

    const R: f64 = 250.0;
    const H: f64 = 510.0;

    fn scan_text() -> String {
        let mut text = String::from("x y z t\n");
        for p in synthetic_shell(R, H, None, 60, 20, 0.0, 9) {
            let theta = p.y.atan2(p.x);
            let t = 0.125 + 0.01 * (2.0 * theta).cos();
            writeln!(text, "{} {} {} {}", p.x, p.y, p.z, t).unwrap();
        }
        text
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig {
            surface: SurfaceFitConfig {
                m0: 6,
                n0: 8,
                ..SurfaceFitConfig::default()
            },
            ..PipelineConfig::default()
        };
        config.thickness.enabled = true;
        config.thickness.nominal = Some(0.125);
        config.output.write_grid = true;
        config
    }

    #[test]
    fn test_process_scan_writes_artifacts() {
        let input = temp_path("entry_scan.txt");
        std::fs::write(&input, scan_text()).unwrap();
        let out = temp_path("entry_out");

        let config = config();
        let artifacts = process_scan(&input, Some(&out), &config).unwrap();
        assert_eq!(artifacts.label, format!("conecylrs_{}_entry_scan", std::process::id()));
        assert_relative_eq!(artifacts.best_fit.params.radius, R, max_relative = 1e-6);
        assert!(artifacts.geometric.fit.statistics.rms < 1e-6);

        let thickness = artifacts.thickness.as_ref().unwrap();
        // half-cosine: block 1 is cos(kπz/H)·cos(nθ)
        assert_relative_eq!(
            thickness.fit.coefficients.components[1][(0, 2)],
            0.01,
            epsilon = 1e-6
        );

        let label = &artifacts.label;
        for name in [
            "coefficients.txt",
            "canonical.txt",
            "grid.txt",
            "tinv.txt",
            "report.json",
            "thickness_coefficients.txt",
        ] {
            assert!(out.join(format!("{}_{}", label, name)).exists(), "missing {}", name);
        }

        let reloaded = read_coefficients(out.join(format!("{}_thickness_coefficients.txt", label)), None)
            .unwrap();
        for (a, b) in reloaded
            .components
            .iter()
            .zip(&thickness.fit.coefficients.components)
        {
            assert_relative_eq!(a, b, epsilon = 1e-12, max_relative = 1e-6);
        }

        std::fs::remove_file(&input).ok();
        std::fs::remove_dir_all(&out).ok();
    }

    #[test]
    fn test_batch_reports_each_dataset() {
        let good = temp_path("batch_good.txt");
        std::fs::write(&good, scan_text()).unwrap();
        let bad = temp_path("batch_bad.txt");
        std::fs::write(&bad, "1 2 3\n4 5\n").unwrap();

        let jobs = vec![
            BatchJob {
                input: good.clone(),
                output_dir: None,
            },
            BatchJob {
                input: bad.clone(),
                output_dir: None,
            },
        ];
        let results = process_batch(&jobs, &config());
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert!(format!("{:#}", err).contains("malformed"));

        std::fs::remove_file(&good).ok();
        std::fs::remove_file(&bad).ok();
    }

    #[test]
    fn test_grid_method_resamples_before_fitting() {
        let points: Vec<MeasuredPoint> = synthetic_shell(R, H, None, 60, 20, 0.0, 9)
            .into_iter()
            .map(|p| {
                let t = 0.125 + 0.01 * (2.0 * p.y.atan2(p.x)).cos();
                MeasuredPoint::with_value(p.x, p.y, p.z, t)
            })
            .collect();
        let mut config = config();
        config.surface.method = FitMethod::Grid;

        let artifacts = process_points("grid", &points, &config).unwrap();
        let grid = artifacts.geometric.fit.grid.as_ref().unwrap();
        assert_eq!(grid.values.shape(), (config.resample.n_theta, config.resample.n_z));
        assert!(grid.values.iter().all(|v| v.abs() < 1e-6));
        assert!(artifacts.geometric.fit.statistics.rms < 1e-6);

        let thickness = artifacts.thickness.as_ref().unwrap();
        let samples = config.resample.n_theta * config.resample.n_z;
        assert_eq!(thickness.fit.statistics.samples, samples);
        // inverse-distance smoothing damps cos(2θ) only slightly
        assert_relative_eq!(
            thickness.fit.coefficients.components[1][(0, 2)],
            0.01,
            epsilon = 1e-3
        );
    }

    #[test]
    fn test_bump_recovered_from_world_points() {
        // 200 points on a tilted, offset R = 406.4, H = 1219.2 cylinder with a
        // 2 mm bump at (θ = 0, z = H/2)
        let (radius, height) = (406.4, 1219.2);
        let local: Vec<MeasuredPoint> = synthetic_shell(radius, height, None, 20, 10, 0.0, 0)
            .into_iter()
            .map(|p| {
                let theta = p.y.atan2(p.x);
                let r = p.x.hypot(p.y) + bump_field(theta, p.z, height, 2.0);
                MeasuredPoint::new(r * theta.cos(), r * theta.sin(), p.z)
            })
            .collect();
        let axis = tilt_rotation(0.03, -0.02) * Vector3::z();
        let pose = RigidTransform::local_to_world(
            &frame_from_axis(&axis, &Vector3::x()),
            &Point3::new(15.0, -8.0, 4.0),
        );
        let world = place_shell(&local, &pose);
        assert_eq!(world.len(), 200);

        let mut config = PipelineConfig {
            surface: SurfaceFitConfig {
                m0: 10,
                n0: 10,
                ..SurfaceFitConfig::default()
            },
            ..PipelineConfig::default()
        };
        config.best_fit.expected_radius = Some(radius);
        config.best_fit.outlier_tolerance = Some(0.35);
        config.canonical.nominal_radius = Some(radius);

        let artifacts = process_points("bump", &world, &config).unwrap();
        let fit = &artifacts.best_fit.params;
        assert!(!fit.outliers.is_empty());
        assert!((fit.radius - radius).abs() < 0.1, "radius {}", fit.radius);
        assert_eq!(artifacts.geometric.cloud.len(), 200);

        let w = &artifacts.geometric.fit.coefficients;
        let peak = w.evaluate(0.0, height / 2.0);
        assert!((peak - 2.0).abs() < 0.2, "peak {}", peak);
        for &theta in &[PI - 0.1, -PI + 0.1, 2.5, -2.5] {
            for &z in &[0.1 * height, 0.5 * height, 0.9 * height] {
                let value = w.evaluate(theta, z);
                assert!(value.abs() < 0.1, "w({}, {}) = {}", theta, z, value);
            }
        }
    }

    #[test]
    fn test_thickness_requires_value_column() {
        let points = synthetic_shell(R, H, None, 30, 10, 0.0, 1);
        let err = process_points("no_values", &points, &config()).unwrap_err();
        assert!(format!("{:#}", err).contains("thickness"));
    }
}
