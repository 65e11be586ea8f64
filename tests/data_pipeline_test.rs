//! Integration tests for the data path
//!
//! Sweep results are written to tab-separated files, read back by the I-V loader, and
//! fed through TLM and RTD analysis.

use iv_daq::analysis::{
    find_peak_valley, fit_schulman, load_iv_file, mask_ndr_region, FitQuality, RtdFitOptions,
    SchulmanParams, TlmSession,
};
use iv_daq::config::MeasurementConfig;
use iv_daq::error::AnalysisError;
use iv_daq::hardware::{Connection, MockSourceMeter};
use iv_daq::measurement::{
    save_run_result, InstrumentSet, RunMode, RunOrchestrator, RunOutcome, RunRequest, RunResult,
    Sample, SweepSpec,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

// =============================================================================
// Helpers
// =============================================================================

fn sample(index: usize, voltage: f64, current_ma: f64, is_reverse: bool) -> Sample {
    Sample {
        index,
        voltage,
        current_ma,
        optical_power_uw: None,
        is_reverse,
    }
}

fn data_rows(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(str::to_string)
        .collect()
}

/// Run a simulated unidirectional sweep across `ohms` and save it under `directory`.
async fn measure_resistor(ohms: f64, directory: PathBuf) -> Vec<PathBuf> {
    let source = Arc::new(MockSourceMeter::new("smu").with_resistance(ohms));
    source.connect("SIM::SMU").await.unwrap();

    let orchestrator = RunOrchestrator::new(MeasurementConfig {
        settle_delay_us: 0,
        ..Default::default()
    });
    orchestrator
        .start(RunRequest {
            sweep: SweepSpec::new(0.0, 1.0, 11, 0.1, false).unwrap(),
            mode: RunMode::Single,
            instruments: InstrumentSet::single(source),
            save_directory: Some(directory),
        })
        .unwrap();

    match orchestrator.wait().await.unwrap() {
        RunOutcome::Completed {
            saved_files,
            persistence_error: None,
            ..
        } => saved_files,
        other => panic!("run did not save: {:?}", other),
    }
}

// =============================================================================
// Result files
// =============================================================================

#[test]
fn test_unidirectional_file_has_header_and_one_row_per_point() {
    let dir = tempfile::tempdir().unwrap();
    let spec = SweepSpec::new(0.0, 1.0, 2, 0.01, false).unwrap();
    let result = RunResult::from_samples(
        Uuid::new_v4(),
        spec,
        &[sample(0, 0.0, 0.0, false), sample(1, 1.0, 5.0, false)],
    );

    let paths = save_run_result(&result, dir.path()).unwrap();
    assert_eq!(paths.len(), 1);
    let name = paths[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("I-V Curve - "));
    assert!(name.ends_with("].txt"));

    let text = std::fs::read_to_string(&paths[0]).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "Voltage(V)\tCurrent(mA)");
    assert_eq!(lines[2].split('\t').count(), 2);

    let data = load_iv_file(&paths[0]).unwrap();
    assert_eq!(data.voltage, vec![0.0, 1.0]);
    assert_eq!(data.current_ma, vec![0.0, 5.0]);
}

#[test]
fn test_bidirectional_result_splits_into_two_files() {
    let dir = tempfile::tempdir().unwrap();
    let spec = SweepSpec::new(0.0, 1.0, 3, 0.01, true).unwrap();
    let samples = [
        sample(0, 0.0, 0.0, false),
        sample(1, 0.5, 1.0, false),
        sample(2, 1.0, 2.0, false),
        sample(3, 0.5, 0.9, true),
        sample(4, 0.0, 0.0, true),
    ];
    let result = RunResult::from_samples(Uuid::new_v4(), spec, &samples);

    let paths = save_run_result(&result, dir.path()).unwrap();
    assert_eq!(paths.len(), 2);
    assert!(paths[0].to_string_lossy().ends_with("_upward_sweep.txt"));
    assert!(paths[1].to_string_lossy().ends_with("_downward_sweep.txt"));
    assert_eq!(data_rows(&paths[0]).len(), 3);
    assert_eq!(data_rows(&paths[1]).len(), 2);

    let reverse = load_iv_file(&paths[1]).unwrap();
    assert_eq!(reverse.voltage, vec![0.5, 0.0]);
}

// =============================================================================
// TLM analysis
// =============================================================================

#[tokio::test]
async fn test_measured_files_yield_sheet_and_contact_resistance() {
    let dir = tempfile::tempdir().unwrap();
    // 100 Ω of contacts plus 20 Ω per µm of channel, at 5, 10 and 15 µm
    let mut files = Vec::new();
    for (name, ohms) in [("d05", 200.0), ("d10", 300.0), ("d15", 400.0)] {
        files.extend(measure_resistor(ohms, dir.path().join(name)).await);
    }
    assert_eq!(files.len(), 3);

    let mut session = TlmSession::default();
    assert!(session.add_files(&files).is_empty());
    let distances: Vec<_> = session.entries().iter().map(|e| e.distance).collect();
    assert_eq!(distances, vec![Some(5.0), Some(10.0), Some(15.0)]);

    let fit = session.analyze(0.0).unwrap();
    assert!((fit.sheet_resistance - 20.0).abs() < 1e-6);
    assert!((fit.contact_resistance - 50.0).abs() < 1e-6);
    assert_eq!(fit.quality(), FitQuality::Good);

    let resistances: Vec<f64> = session
        .entries()
        .iter()
        .map(|e| e.fit.unwrap().resistance_ohms)
        .collect();
    assert!((resistances[1] - 300.0).abs() < 1e-6);
}

#[test]
fn test_unreadable_files_are_skipped_without_consuming_distances() {
    let dir = tempfile::tempdir().unwrap();
    let good_a = dir.path().join("a.txt");
    let bad = dir.path().join("bad.txt");
    let good_b = dir.path().join("b.txt");
    std::fs::write(&good_a, "Voltage(V)\tCurrent(mA)\n0\t0\n1\t5\n").unwrap();
    std::fs::write(&bad, "Voltage(V)\tCurrent(mA)\n0\tnot-a-number\n").unwrap();
    std::fs::write(&good_b, "Voltage(V),Current(mA)\n0,0\n1,2.5\n").unwrap();
    let missing = dir.path().join("missing.txt");

    let mut session = TlmSession::new(2.0, 4.0);
    let errors = session.add_files(&[&good_a, &bad, &missing, &good_b]);

    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| matches!(e, AnalysisError::Load { .. })));
    let distances: Vec<_> = session.entries().iter().map(|e| e.distance).collect();
    assert_eq!(distances, vec![Some(2.0), Some(6.0)]);

    // A later batch continues the spacing
    let good_c = dir.path().join("c.txt");
    std::fs::write(&good_c, "V I\n0 0\n1 2\n").unwrap();
    assert!(session.add_files(&[&good_c]).is_empty());
    assert_eq!(session.entries()[2].distance, Some(10.0));
}

#[test]
fn test_analysis_reports_failing_file_position() {
    let dir = tempfile::tempdir().unwrap();
    let ohmic = dir.path().join("ohmic.txt");
    let flat = dir.path().join("flat.txt");
    std::fs::write(&ohmic, "V\tI\n0\t0\n0.5\t1\n1\t2\n").unwrap();
    std::fs::write(&flat, "V\tI\n0\t0\n0.5\t0\n1\t0\n").unwrap();

    let mut session = TlmSession::default();
    assert!(session.add_files(&[&ohmic, &flat]).is_empty());

    match session.analyze(0.0) {
        Err(AnalysisError::Entry { index, source }) => {
            assert_eq!(index, 2);
            assert!(matches!(*source, AnalysisError::DegenerateSlope { .. }));
        }
        other => panic!("expected entry error, got {:?}", other),
    }
    assert!(session.entries()[0].fit.is_some());
}

#[test]
fn test_min_voltage_filter_applies_to_every_file() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.txt");
    let b = dir.path().join("b.txt");
    std::fs::write(&a, "V\tI\n0\t0\n0.1\t0.5\n0.2\t1\n0.4\t2\n").unwrap();
    std::fs::write(&b, "V\tI\n0\t0\n0.1\t0.2\n0.2\t0.5\n").unwrap();

    let mut session = TlmSession::default();
    assert!(session.add_files(&[&a, &b]).is_empty());

    match session.analyze(0.15) {
        Err(AnalysisError::Entry { index, source }) => {
            assert_eq!(index, 2);
            assert!(matches!(*source, AnalysisError::InsufficientPoints { .. }));
        }
        other => panic!("expected entry error, got {:?}", other),
    }
}

// =============================================================================
// RTD analysis
// =============================================================================

#[test]
fn test_rtd_file_fit_skips_ndr_region() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rtd.txt");
    let params = SchulmanParams::INITIAL;
    let mut text = String::from("Voltage(V)\tCurrent(mA)\n");
    for i in 0..=100 {
        let v = i as f64 * 0.01;
        text.push_str(&format!("{}\t{}\n", v, params.current(v)));
    }
    std::fs::write(&path, text).unwrap();

    let data = load_iv_file(&path).unwrap();
    let found = find_peak_valley(&data.voltage, &data.current_ma, (0.5, 0.62), (0.66, 0.72))
        .unwrap();
    assert!((found.peak_voltage - 0.61).abs() < 1e-9);
    assert!((found.valley_voltage - 0.72).abs() < 1e-9);

    let (voltage, current) = mask_ndr_region(
        &data.voltage,
        &data.current_ma,
        found.peak_voltage,
        found.valley_voltage,
    );
    // 0.00..=0.64 and 0.72..=1.00
    assert_eq!(voltage.len(), 65 + 29);
    assert!(!voltage.iter().any(|v| *v > 0.645 && *v < 0.715));

    let fit = fit_schulman(&voltage, &current, &RtdFitOptions::default()).unwrap();
    assert_eq!(fit.points_used, 94);
    assert!(fit.r_squared > 0.999);
}
