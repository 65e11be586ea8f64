//! The shipped settings file must load and validate.

use iv_daq::config::{RtdConfig, Settings};
use iv_daq::logging::{LoggingConfig, OutputFormat};
use std::path::Path;

#[test]
fn test_shipped_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
    let settings = Settings::load_from(&path).unwrap();
    settings.validate().unwrap();

    assert_eq!(settings.measurement.settle_delay_us, 100);
    assert_eq!(settings.measurement.stop_timeout_ms, 3000);
    assert_eq!(settings.optical.wavelength_nm, 633.0);
    assert_eq!(settings.rtd, RtdConfig::default());
    assert_eq!(settings.application.log_format, OutputFormat::Compact);
    assert_eq!(
        LoggingConfig::from_settings(&settings).unwrap().format,
        OutputFormat::Compact
    );

    // File presets extend the built-in set
    assert!(settings.presets.contains_key("Standard I-V"));
    let diode = settings.preset("Diode Forward").unwrap();
    assert_eq!(diode.to_spec().unwrap().total_points(), 121);
}

#[test]
fn test_shipped_config_parses_as_plain_toml() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
    let text = std::fs::read_to_string(path).unwrap();
    let table: toml::Table = toml::from_str(&text).unwrap();
    for section in ["application", "measurement", "storage", "optical", "tlm", "rtd", "presets"] {
        assert!(table.contains_key(section), "missing [{}]", section);
    }
}
