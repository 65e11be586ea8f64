//! I-V data file reader for TLM analysis.
//!
//! Accepts any plain-text table whose first row is a header, column 0 is voltage (V) and
//! column 1 is current (mA). The delimiter is detected from the header: tab, comma,
//! semicolon, or runs of whitespace. Files written by the measurement pipeline load as-is.

use crate::error::AnalysisError;
use std::path::Path;

/// Voltage and current columns of one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IvData {
    /// Voltages (V)
    pub voltage: Vec<f64>,
    /// Currents (mA)
    pub current_ma: Vec<f64>,
}

/// Read the first two columns of `path`, skipping the header row.
///
/// # Errors
/// [`AnalysisError::Load`] if the file cannot be read, a row has fewer than two columns,
/// or a cell is not a number.
pub fn load_iv_file(path: &Path) -> Result<IvData, AnalysisError> {
    let load_error = |reason: String| AnalysisError::Load {
        path: path.to_path_buf(),
        reason,
    };
    let text = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
    parse_iv_table(&text).map_err(load_error)
}

/// Parse table text; see [`load_iv_file`].
pub fn parse_iv_table(text: &str) -> Result<IvData, String> {
    let header = text
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| "file is empty".to_string())?;

    let rows = match detect_delimiter(header) {
        Some(delimiter) => delimited_rows(text, delimiter)?,
        None => text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .skip(1)
            .map(|line| line.split_whitespace().map(str::to_string).collect())
            .collect(),
    };

    let mut data = IvData::default();
    for (i, row) in rows.iter().enumerate() {
        // Data rows are numbered after the header
        let line = i + 2;
        if row.len() < 2 {
            return Err(format!("row {} has fewer than 2 columns", line));
        }
        data.voltage.push(parse_cell(&row[0], line)?);
        data.current_ma.push(parse_cell(&row[1], line)?);
    }
    Ok(data)
}

fn detect_delimiter(header: &str) -> Option<u8> {
    [b'\t', b',', b';']
        .into_iter()
        .find(|&d| header.contains(char::from(d)))
}

fn delimited_rows(text: &str, delimiter: u8) -> Result<Vec<Vec<String>>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| e.to_string())?;
        if record.iter().all(|cell| cell.is_empty()) {
            continue;
        }
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

fn parse_cell(cell: &str, line: usize) -> Result<f64, String> {
    cell.trim()
        .parse::<f64>()
        .map_err(|_| format!("row {}: '{}' is not a number", line, cell))
}
