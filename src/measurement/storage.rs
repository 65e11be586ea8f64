//! Result file writer.
//!
//! Layout of every file: one tab-separated header line, no comment prefix, then one row
//! per sample in scientific notation.
//!
//! ```text
//! Voltage(V)	Current(mA)	OpticalPower(W)
//! 0.000000000000000000e0	0.000000000000000000e0	0.000000000000000000e0
//! ```
//!
//! Bidirectional runs produce `<base>_upward_sweep.txt` and `<base>_downward_sweep.txt`;
//! unidirectional runs produce `<base>.txt`.

use crate::error::{AppResult, DaqError};
use crate::measurement::sample::{RunResult, SweepBranch, WATTS_TO_MICROWATTS};
use chrono::Local;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

const VOLTAGE_HEADER: &str = "Voltage(V)";
const CURRENT_HEADER: &str = "Current(mA)";
const POWER_HEADER: &str = "OpticalPower(W)";

/// Base file name (without extension) for a run saved into `directory` now.
pub fn base_name(directory: &Path) -> String {
    let folder = directory
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| directory.display().to_string());
    let timestamp = Local::now().format("%Y-%m-%d_%H%M.%S");
    format!("I-V Curve - {} - [{}]", folder, timestamp)
}

/// Write `result` into `directory`, creating it if needed.
///
/// Returns the written paths, forward leg first.
///
/// # Errors
/// [`DaqError::Persistence`] naming the directory or file that could not be written.
pub fn save_run_result(result: &RunResult, directory: &Path) -> AppResult<Vec<PathBuf>> {
    std::fs::create_dir_all(directory).map_err(|e| DaqError::Persistence {
        path: directory.to_path_buf(),
        reason: e.to_string(),
    })?;

    let base = directory.join(base_name(directory));
    let files = if result.spec.is_bidirectional() {
        vec![
            (with_suffix(&base, "_upward_sweep.txt"), &result.forward),
            (with_suffix(&base, "_downward_sweep.txt"), &result.reverse),
        ]
    } else {
        vec![(with_suffix(&base, ".txt"), &result.forward)]
    };

    let mut written = Vec::with_capacity(files.len());
    for (path, branch) in files {
        write_branch(&path, branch).map_err(|reason| DaqError::Persistence {
            path: path.clone(),
            reason,
        })?;
        info!(path = %path.display(), rows = branch.len(), "Saved sweep data");
        written.push(path);
    }
    Ok(written)
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_branch(path: &Path, branch: &SweepBranch) -> Result<(), String> {
    let file = File::create(path).map_err(|e| e.to_string())?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(file);

    let power = branch.optical_power_uw.as_ref();
    let mut header = vec![VOLTAGE_HEADER, CURRENT_HEADER];
    if power.is_some() {
        header.push(POWER_HEADER);
    }
    writer.write_record(&header).map_err(|e| e.to_string())?;

    for (row, (voltage, current)) in branch.voltage.iter().zip(&branch.current_ma).enumerate() {
        let mut record = vec![format_value(*voltage), format_value(*current)];
        if let Some(column) = power {
            let watts = column.get(row).copied().unwrap_or(0.0) / WATTS_TO_MICROWATTS;
            record.push(format_value(watts));
        }
        writer.write_record(&record).map_err(|e| e.to_string())?;
    }
    writer.flush().map_err(|e| e.to_string())
}

fn format_value(value: f64) -> String {
    format!("{:.18e}", value)
}
