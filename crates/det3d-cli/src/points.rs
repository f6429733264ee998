//! Plain-text point cloud reader
//!
//! One point per line: `x y z` followed by the feature columns, separated by
//! whitespace. Blank lines and lines starting with `#` are skipped.

use candle_core::{Device, Tensor};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PointFileError {
    #[error("Failed to read point file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line {line}: invalid number '{token}'")]
    InvalidNumber { line: usize, token: String },

    #[error("Line {line}: {found} columns, expected {expected}")]
    ColumnCount {
        line: usize,
        found: usize,
        expected: usize,
    },

    #[error("Line {line}: at least 3 columns (x y z) required")]
    TooFewColumns { line: usize },

    #[error("No points found")]
    Empty,

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Parse point text into a `(N, columns)` row-major buffer
pub fn parse_points(text: &str) -> Result<(Vec<f32>, usize, usize), PointFileError> {
    let mut data = Vec::new();
    let mut columns = None;
    let mut rows = 0;
    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line_no = i + 1;
        let values = line
            .split_whitespace()
            .map(|token| {
                token.parse::<f32>().map_err(|_| PointFileError::InvalidNumber {
                    line: line_no,
                    token: token.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if values.len() < 3 {
            return Err(PointFileError::TooFewColumns { line: line_no });
        }
        let expected = *columns.get_or_insert(values.len());
        if values.len() != expected {
            return Err(PointFileError::ColumnCount {
                line: line_no,
                found: values.len(),
                expected,
            });
        }
        data.extend(values);
        rows += 1;
    }
    match columns {
        Some(cols) => Ok((data, rows, cols)),
        None => Err(PointFileError::Empty),
    }
}

/// Read a point file into a `(N, 3 + C)` tensor
pub fn load_points<P: AsRef<Path>>(path: P, device: &Device) -> Result<Tensor, PointFileError> {
    let text = std::fs::read_to_string(path)?;
    let (data, rows, cols) = parse_points(&text)?;
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}
