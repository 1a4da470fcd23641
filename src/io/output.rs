use csv::WriterBuilder;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

use super::input::{CanonicalPoint, CoefficientHeader};
use super::NumberFormat;
use crate::error::Result;
use crate::resample::GridField;
use crate::surface::FourierCoefficients;
use crate::transform::RigidTransform;

fn create(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(BufWriter::new(File::create(path)?))
}

/// Writes `# header` lines followed by space separated rows.
fn write_rows<I>(path: &Path, header: &[String], rows: I, format: &NumberFormat) -> Result<usize>
where
    I: IntoIterator,
    I::Item: IntoIterator<Item = f64>,
{
    let mut out = create(path)?;
    for line in header {
        writeln!(out, "# {}", line)?;
    }
    let mut wtr = WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .from_writer(out);
    let mut count = 0;
    for row in rows {
        let record: Vec<String> = row.into_iter().map(|v| format.format(v)).collect();
        wtr.write_record(&record).map_err(std::io::Error::from)?;
        count += 1;
    }
    wtr.flush()?;
    debug!(path = %path.display(), rows = count, "file written");
    Ok(count)
}

/// `theta z delta_r`, one point per line.
pub fn write_canonical<P: AsRef<Path>>(
    path: P,
    points: &[CanonicalPoint],
    format: &NumberFormat,
) -> Result<()> {
    write_rows(
        path.as_ref(),
        &["theta z delta_r".to_string()],
        points.iter().map(|p| [p.theta, p.z, p.dr]),
        format,
    )?;
    Ok(())
}

/// `theta z value` triples, θ-major.
pub fn write_grid<P: AsRef<Path>>(path: P, grid: &GridField, format: &NumberFormat) -> Result<()> {
    write_rows(
        path.as_ref(),
        &[format!("theta z value ({} x {})", grid.thetas.len(), grid.zs.len())],
        grid.iter().map(|(t, z, v)| [t, z, v]),
        format,
    )?;
    Ok(())
}

/// Header comment with basis, orders and height, then one m0 × n0 block per
/// basis component.
pub fn write_coefficients<P: AsRef<Path>>(
    path: P,
    coefficients: &FourierCoefficients,
    format: &NumberFormat,
) -> Result<()> {
    let header = CoefficientHeader {
        basis: coefficients.basis,
        m0: coefficients.m0,
        n0: coefficients.n0,
        height: coefficients.height,
    };
    let rows = coefficients
        .components
        .iter()
        .flat_map(|block| block.row_iter().map(|r| r.iter().copied().collect::<Vec<f64>>()));
    write_rows(path.as_ref(), &[header.render()], rows, format)?;
    Ok(())
}

/// 4×4 homogeneous matrix, row-major.
pub fn write_transform<P: AsRef<Path>>(
    path: P,
    transform: &RigidTransform,
    format: &NumberFormat,
) -> Result<()> {
    let m = &transform.matrix;
    write_rows(
        path.as_ref(),
        &[],
        (0..4).map(|i| (0..4).map(move |j| m[(i, j)])),
        format,
    )?;
    Ok(())
}

/// Pretty-printed JSON summary.
pub fn write_report<P: AsRef<Path>, T: Serialize>(path: P, report: &T) -> Result<()> {
    let mut out = create(path.as_ref())?;
    serde_json::to_writer_pretty(&mut out, report).map_err(std::io::Error::from)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}
