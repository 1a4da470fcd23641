pub mod input;
pub mod output;

use csv::{ReaderBuilder, Trim};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{ImperfectionError, Result};

/// How floating point values are rendered in written files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumberFormat {
    /// Digits after the decimal point.
    pub precision: usize,
    pub notation: Notation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Notation {
    #[default]
    Scientific,
    Fixed,
}

impl Default for NumberFormat {
    fn default() -> Self {
        // 8 significant digits, e.g. 4.0640000e+02
        Self {
            precision: 7,
            notation: Notation::Scientific,
        }
    }
}

impl NumberFormat {
    pub fn scientific(precision: usize) -> Self {
        Self {
            precision,
            notation: Notation::Scientific,
        }
    }

    pub fn fixed(precision: usize) -> Self {
        Self {
            precision,
            notation: Notation::Fixed,
        }
    }

    /// Enough digits to reload an f64 without loss.
    pub fn lossless() -> Self {
        Self::scientific(16)
    }

    pub fn format(&self, value: f64) -> String {
        match self.notation {
            Notation::Fixed => format!("{:.*}", self.precision, value),
            Notation::Scientific => {
                // Rust prints `4.064e2`; rewrite the exponent as `e+02`
                let raw = format!("{:.*e}", self.precision, value);
                match raw.split_once('e') {
                    Some((mantissa, exponent)) => {
                        let exp: i32 = exponent.parse().unwrap_or(0);
                        let sign = if exp < 0 { '-' } else { '+' };
                        format!("{}e{}{:02}", mantissa, sign, exp.abs())
                    }
                    None => raw,
                }
            }
        }
    }
}

/// Column separator of a delimited text file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Comma,
    Tab,
    /// One or more spaces (and/or tabs) between columns.
    Whitespace,
}

/// Detect the delimiter from the first data line.
pub fn detect_delimiter(text: &str) -> Delimiter {
    let first_line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .unwrap_or("");

    let commas = first_line.matches(',').count();
    let tabs = first_line.matches('\t').count();
    let spaces = first_line.matches(' ').count();

    if commas > 0 {
        Delimiter::Comma
    } else if tabs > 0 && spaces == 0 {
        Delimiter::Tab
    } else {
        Delimiter::Whitespace
    }
}

/// Numeric table read from a delimited text file.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Table {
    pub rows: Vec<Vec<f64>>,
    pub columns: usize,
    /// Comment lines (`#` stripped, trimmed) in file order.
    pub comments: Vec<String>,
}

/// Reads a numeric table. All data lines must have the same number of
/// columns and every token must be a number; a first line made entirely of
/// non-numeric tokens is treated as a header and skipped.
pub(crate) fn read_table(path: &Path) -> Result<Table> {
    let text = fs::read_to_string(path)?;

    let comments: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter_map(|l| l.strip_prefix('#'))
        .map(|l| l.trim().to_string())
        .collect();

    let raw_rows = match detect_delimiter(&text) {
        Delimiter::Whitespace => split_whitespace_rows(&text),
        Delimiter::Comma => split_csv_rows(path, &text, b',')?,
        Delimiter::Tab => split_csv_rows(path, &text, b'\t')?,
    };

    let mut rows = Vec::with_capacity(raw_rows.len());
    let mut columns: Option<usize> = None;

    for (i, (line, tokens)) in raw_rows.iter().enumerate() {
        if i == 0 && !tokens.is_empty() && tokens.iter().all(|t| t.parse::<f64>().is_err()) {
            continue;
        }

        let expected = *columns.get_or_insert(tokens.len());
        if tokens.len() != expected {
            return Err(ImperfectionError::malformed(
                path,
                *line,
                format!("expected {} columns, found {}", expected, tokens.len()),
            ));
        }

        let mut row = Vec::with_capacity(tokens.len());
        for token in tokens {
            let value: f64 = token.parse().map_err(|_| {
                ImperfectionError::malformed(path, *line, format!("invalid number '{}'", token))
            })?;
            row.push(value);
        }
        rows.push(row);
    }

    Ok(Table {
        rows,
        columns: columns.unwrap_or(0),
        comments,
    })
}

fn split_whitespace_rows(text: &str) -> Vec<(usize, Vec<String>)> {
    text.lines()
        .enumerate()
        .filter_map(|(i, l)| {
            let l = l.trim();
            if l.is_empty() || l.starts_with('#') {
                None
            } else {
                Some((i + 1, l.split_whitespace().map(str::to_string).collect()))
            }
        })
        .collect()
}

fn split_csv_rows(path: &Path, text: &str, delimiter: u8) -> Result<Vec<(usize, Vec<String>)>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .comment(Some(b'#'))
        .trim(Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result.map_err(|e| {
            let line = e.position().map(|p| p.line() as usize).unwrap_or(0);
            ImperfectionError::malformed(path, line, e.to_string())
        })?;
        let line = record.position().map(|p| p.line() as usize).unwrap_or(0);
        // trailing delimiters produce empty fields; ignore them
        let tokens: Vec<String> = record
            .iter()
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if !tokens.is_empty() {
            rows.push((line, tokens));
        }
    }
    Ok(rows)
}
