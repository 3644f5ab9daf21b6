//! Inspection and comparison of tensor dump files.

use anyhow::{Context, Result, bail};
use lumen_core::{HostTensor, TensorShape, load_dump};
use std::fmt;
use std::path::Path;

/// Value statistics of one dumped tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpStats {
    pub shape: TensorShape,
    pub min: f32,
    pub max: f32,
    pub mean: f64,
    /// NaN and infinite values; excluded from min, max and mean.
    pub non_finite: usize,
}

impl DumpStats {
    pub fn of(tensor: &HostTensor) -> Self {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0f64;
        let mut finite = 0usize;
        for &v in &tensor.data {
            if !v.is_finite() {
                continue;
            }
            min = min.min(v);
            max = max.max(v);
            sum += v as f64;
            finite += 1;
        }

        if finite == 0 {
            min = 0.0;
            max = 0.0;
        }
        Self {
            shape: tensor.shape,
            min,
            max,
            mean: if finite == 0 { 0.0 } else { sum / finite as f64 },
            non_finite: tensor.data.len() - finite,
        }
    }
}

impl fmt::Display for DumpStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "shape:      {} ({} planes)", self.shape, self.shape.planes())?;
        writeln!(f, "min:        {}", self.min)?;
        writeln!(f, "max:        {}", self.max)?;
        writeln!(f, "mean:       {:.6}", self.mean)?;
        write!(f, "non-finite: {}", self.non_finite)
    }
}

/// Load a dump and compute its statistics.
///
/// Without `channels` every plane is treated as four real channels.
pub fn inspect_dump(path: &Path, channels: Option<u32>) -> Result<DumpStats> {
    let tensor = load_dump(path, channels)
        .with_context(|| format!("Failed to load dump {}", path.display()))?;
    Ok(DumpStats::of(&tensor.to_host()))
}

/// First element whose difference exceeds the tolerance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mismatch {
    pub x: u32,
    pub y: u32,
    pub channel: u32,
    pub expected: f32,
    pub actual: f32,
}

/// Result of comparing two dumps element by element.
#[derive(Debug, Clone, PartialEq)]
pub struct CompareReport {
    pub shape: TensorShape,
    pub max_abs_diff: f32,
    pub mismatches: usize,
    pub first_mismatch: Option<Mismatch>,
}

impl CompareReport {
    pub fn is_match(&self) -> bool {
        self.mismatches == 0
    }
}

impl fmt::Display for CompareReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "shape:         {}", self.shape)?;
        writeln!(f, "max abs diff:  {}", self.max_abs_diff)?;
        write!(f, "mismatches:    {}", self.mismatches)?;
        if let Some(m) = self.first_mismatch {
            write!(
                f,
                "\nfirst at ({}, {}, c{}): expected {}, got {}",
                m.x, m.y, m.channel, m.expected, m.actual
            )?;
        }
        Ok(())
    }
}

/// Compare two host tensors of equal shape.
///
/// NaN on either side always counts as a mismatch.
pub fn compare_tensors(
    expected: &HostTensor,
    actual: &HostTensor,
    tolerance: f32,
) -> Result<CompareReport> {
    if expected.shape != actual.shape {
        bail!(
            "Shape mismatch: expected {}, got {}",
            expected.shape,
            actual.shape
        );
    }

    let shape = expected.shape;
    let channels = shape.channels as usize;
    let width = shape.width as usize;
    let mut report = CompareReport {
        shape,
        max_abs_diff: 0.0,
        mismatches: 0,
        first_mismatch: None,
    };

    for (i, (&e, &a)) in expected.data.iter().zip(&actual.data).enumerate() {
        let diff = (e - a).abs();
        if diff.is_nan() || diff > tolerance {
            report.mismatches += 1;
            if report.first_mismatch.is_none() {
                report.first_mismatch = Some(Mismatch {
                    x: ((i / channels) % width) as u32,
                    y: (i / channels / width) as u32,
                    channel: (i % channels) as u32,
                    expected: e,
                    actual: a,
                });
            }
        }
        if !diff.is_nan() {
            report.max_abs_diff = report.max_abs_diff.max(diff);
        }
    }
    Ok(report)
}

/// Load two dumps and compare them.
pub fn compare_dumps(
    expected: &Path,
    actual: &Path,
    channels: Option<u32>,
    tolerance: f32,
) -> Result<CompareReport> {
    let expected = load_dump(expected, channels)
        .with_context(|| format!("Failed to load dump {}", expected.display()))?;
    let actual = load_dump(actual, channels)
        .with_context(|| format!("Failed to load dump {}", actual.display()))?;
    compare_tensors(&expected.to_host(), &actual.to_host(), tolerance)
}
