//! Configuration System using Figment
//!
//! Settings are layered from:
//! 1. Built-in defaults (including the stock sweep presets)
//! 2. `config/default.toml` (or an explicit file)
//! 3. Environment variables prefixed with `IV_DAQ_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use iv_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Application: {}", settings.application.name);
//! # Ok::<(), iv_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::PowerMeterSettings;
use crate::logging::OutputFormat;
use crate::measurement::sweep::SweepSpec;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the settings file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Acquisition timing
    #[serde(default)]
    pub measurement: MeasurementConfig,
    /// Result file output
    #[serde(default)]
    pub storage: StorageConfig,
    /// Power meter setup used in P-I-V runs
    #[serde(default)]
    pub optical: PowerMeterSettings,
    /// Named sweep presets
    #[serde(default)]
    pub presets: BTreeMap<String, Preset>,
    /// TLM analysis defaults
    #[serde(default)]
    pub tlm: TlmConfig,
    /// RTD fit defaults
    #[serde(default)]
    pub rtd: RtdConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format (pretty, compact, json)
    #[serde(default)]
    pub log_format: OutputFormat,
    /// Colorize pretty and compact log output
    #[serde(default)]
    pub log_ansi: bool,
}

/// Acquisition timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Delay between commanding a voltage and reading it back, in microseconds
    #[serde(default = "default_settle_delay")]
    pub settle_delay_us: u64,
    /// Bounded wait when reclaiming a cancelled run, in milliseconds
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
    /// Pause after energizing the bias source, before the first sweep point, in milliseconds
    #[serde(default = "default_setup_delay")]
    pub setup_delay_ms: u64,
}

/// Result file output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory that receives result files
    pub output_dir: PathBuf,
    /// Whether completed runs are written to disk
    #[serde(default = "default_enabled")]
    pub save_files: bool,
}

/// A stored sweep configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    /// First commanded voltage (V)
    pub start_voltage: f64,
    /// Turnaround voltage (V)
    pub stop_voltage: f64,
    /// Points per sweep leg
    pub num_points: usize,
    /// Current compliance (A)
    pub compliance: f64,
    /// Sweep back down to the start voltage
    pub bidirectional: bool,
}

/// TLM analysis defaults
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TlmConfig {
    /// Voltage floor applied before the per-file regression (V)
    #[serde(default)]
    pub min_voltage: f64,
    /// Distance assigned to the first loaded file
    #[serde(default = "default_start_distance")]
    pub default_start_distance: f64,
    /// Spacing between default distances until a pattern is known
    #[serde(default = "default_increment")]
    pub default_increment: f64,
}

/// RTD Schulman fit defaults
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RtdConfig {
    /// Voltage window searched for the current peak (V)
    #[serde(default = "default_peak_window")]
    pub peak_window: [f64; 2],
    /// Voltage window searched for the valley (V)
    #[serde(default = "default_valley_window")]
    pub valley_window: [f64; 2],
    /// Leave the NDR region between peak and valley out of the fit
    #[serde(default = "default_enabled")]
    pub mask_ndr_region: bool,
    /// Optimizer iteration limit
    #[serde(default = "default_rtd_iterations")]
    pub max_iterations: u64,
}

// Default value functions
fn default_settle_delay() -> u64 {
    100
}

fn default_stop_timeout() -> u64 {
    3000
}

fn default_setup_delay() -> u64 {
    500
}

fn default_enabled() -> bool {
    true
}

fn default_start_distance() -> f64 {
    5.0
}

fn default_increment() -> f64 {
    5.0
}

fn default_peak_window() -> [f64; 2] {
    [0.5, 0.62]
}

fn default_valley_window() -> [f64; 2] {
    [0.66, 0.72]
}

fn default_rtd_iterations() -> u64 {
    20_000
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            settle_delay_us: default_settle_delay(),
            stop_timeout_ms: default_stop_timeout(),
            setup_delay_ms: default_setup_delay(),
        }
    }
}

impl MeasurementConfig {
    /// Settle delay as a `Duration`
    pub fn settle_delay(&self) -> Duration {
        Duration::from_micros(self.settle_delay_us)
    }

    /// Stop timeout as a `Duration`
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Setup delay as a `Duration`
    pub fn setup_delay(&self) -> Duration {
        Duration::from_millis(self.setup_delay_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            save_files: true,
        }
    }
}

impl Default for TlmConfig {
    fn default() -> Self {
        Self {
            min_voltage: 0.0,
            default_start_distance: default_start_distance(),
            default_increment: default_increment(),
        }
    }
}

impl Default for RtdConfig {
    fn default() -> Self {
        Self {
            peak_window: default_peak_window(),
            valley_window: default_valley_window(),
            mask_ndr_region: true,
            max_iterations: default_rtd_iterations(),
        }
    }
}

impl RtdConfig {
    /// Check that both windows are ordered and the iteration limit is usable
    pub fn validate(&self) -> AppResult<()> {
        let windows = [
            ("peak_window", self.peak_window),
            ("valley_window", self.valley_window),
        ];
        for (name, window) in windows {
            if !(window[0] < window[1]) {
                return Err(DaqError::Configuration(format!(
                    "rtd.{} must be [low, high] with low < high, got [{}, {}]",
                    name, window[0], window[1]
                )));
            }
        }
        if self.max_iterations == 0 {
            return Err(DaqError::Configuration(
                "rtd.max_iterations must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Preset {
    /// Build a validated sweep from this preset.
    pub fn to_spec(&self) -> AppResult<SweepSpec> {
        SweepSpec::new(
            self.start_voltage,
            self.stop_voltage,
            self.num_points,
            self.compliance,
            self.bidirectional,
        )
    }
}

/// The presets shipped with the application.
pub fn builtin_presets() -> BTreeMap<String, Preset> {
    let mut presets = BTreeMap::new();
    presets.insert(
        "Standard I-V".to_string(),
        Preset {
            start_voltage: 0.0,
            stop_voltage: 0.8,
            num_points: 100,
            compliance: 0.01,
            bidirectional: true,
        },
    );
    presets.insert(
        "High Resolution".to_string(),
        Preset {
            start_voltage: 0.0,
            stop_voltage: 0.8,
            num_points: 500,
            compliance: 0.01,
            bidirectional: true,
        },
    );
    presets.insert(
        "Quick Test".to_string(),
        Preset {
            start_voltage: 0.0,
            stop_voltage: 0.5,
            num_points: 20,
            compliance: 0.01,
            bidirectional: false,
        },
    );
    presets.insert(
        "Negative Voltage".to_string(),
        Preset {
            start_voltage: -0.8,
            stop_voltage: 0.0,
            num_points: 100,
            compliance: 0.01,
            bidirectional: true,
        },
    );
    presets
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                name: "IV DAQ".to_string(),
                log_level: "info".to_string(),
                log_format: OutputFormat::Compact,
                log_ansi: false,
            },
            measurement: MeasurementConfig::default(),
            storage: StorageConfig::default(),
            optical: PowerMeterSettings::default(),
            presets: builtin_presets(),
            tlm: TlmConfig::default(),
            rtd: RtdConfig::default(),
        }
    }
}

impl Settings {
    /// Load configuration from `config/default.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `IV_DAQ_`.
    /// Example: `IV_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("IV_DAQ_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.measurement.stop_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "stop_timeout_ms must be greater than zero".to_string(),
            ));
        }

        for (name, preset) in &self.presets {
            if name.trim().is_empty() {
                return Err(DaqError::Configuration(
                    "Preset names cannot be empty".to_string(),
                ));
            }
            preset.to_spec().map_err(|e| {
                DaqError::Configuration(format!("Preset '{}' is invalid: {}", name, e))
            })?;
        }

        self.optical.validate()?;
        self.rtd.validate()?;
        Ok(())
    }

    /// Look up a preset by name
    pub fn preset(&self, name: &str) -> AppResult<&Preset> {
        self.presets
            .get(name)
            .ok_or_else(|| DaqError::Configuration(format!("Unknown preset '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.presets.len(), 4);
        assert_eq!(settings.measurement.stop_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_degenerate_preset_rejected() {
        let mut settings = Settings::default();
        settings.presets.insert(
            "Flat".to_string(),
            Preset {
                start_voltage: 0.5,
                stop_voltage: 0.5,
                num_points: 10,
                compliance: 0.01,
                bidirectional: false,
            },
        );
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Flat"));
    }

    #[test]
    fn test_rtd_windows_must_be_ordered() {
        let mut settings = Settings::default();
        settings.rtd.valley_window = [0.72, 0.66];
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("rtd.valley_window"));

        settings.rtd = RtdConfig {
            max_iterations: 0,
            ..RtdConfig::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_log_format_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            r#"
            [application]
            name = "Bench Station"
            log_level = "info"
            log_format = "json"
            "#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.application.log_format, OutputFormat::Json);
        assert!(!settings.application.log_ansi);
    }

    #[test]
    fn test_unknown_log_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "[application]\nname = \"x\"\nlog_level = \"info\"\nlog_format = \"xml\"\n",
        )
        .unwrap();
        assert!(matches!(Settings::load_from(&path), Err(DaqError::Config(_))));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings.application.name, "IV DAQ");
        assert!(settings.presets.contains_key("Quick Test"));
    }

    #[test]
    fn test_file_overrides_and_extends_presets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            r#"
            [application]
            name = "Bench Station"
            log_level = "debug"

            [measurement]
            settle_delay_us = 250

            [presets."Diode Check"]
            start_voltage = -1.0
            stop_voltage = 1.0
            num_points = 41
            compliance = 0.005
            bidirectional = false
            "#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.application.name, "Bench Station");
        assert_eq!(settings.measurement.settle_delay_us, 250);
        assert_eq!(settings.measurement.stop_timeout_ms, 3000);
        assert!(settings.presets.contains_key("Standard I-V"));
        let preset = settings.preset("Diode Check").unwrap();
        assert_eq!(preset.to_spec().unwrap().total_points(), 41);
    }
}
