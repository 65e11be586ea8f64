//! CLI Entry Point for iv_daq
//!
//! Provides command-line access to:
//! - I-V sweeps (single source, DC-biased, or P-I-V) against simulated instruments
//! - TLM analysis of saved I-V files
//! - Schulman fits of resonant tunnelling diode curves
//! - The configured sweep presets
//!
//! # Usage
//!
//! Run a preset sweep:
//! ```bash
//! iv_daq sweep --simulate --preset "Quick Test" --output data/wafer-7
//! ```
//!
//! Analyze TLM files:
//! ```bash
//! iv_daq tlm d5.txt d10.txt d15.txt --distances 5,10,15 --min-voltage 0.2
//! ```
//!
//! Fit an RTD curve:
//! ```bash
//! iv_daq rtd rtd.txt --peak 0.5,0.62 --valley 0.66,0.72
//! ```

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use iv_daq::analysis::{
    find_peak_valley, fit_schulman, load_iv_file, mask_ndr_region, RtdFitOptions, TlmSession,
};
use iv_daq::config::{Preset, Settings};
use iv_daq::hardware::{Connection, MockPowerMeter, MockSourceMeter};
use iv_daq::logging;
use iv_daq::measurement::{
    InstrumentSet, RunEvent, RunMode, RunOrchestrator, RunOutcome, RunRequest,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Light output of the simulated emitter per amp of drive current (W/A)
const SIMULATED_EFFICIENCY: f64 = 0.5;

#[derive(Parser)]
#[command(name = "iv_daq")]
#[command(about = "I-V sweep acquisition and TLM analysis", long_about = None)]
struct Cli {
    /// Settings file (defaults to config/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one I-V sweep
    Sweep(SweepArgs),

    /// Extract sheet and contact resistance from I-V files
    Tlm {
        /// I-V files, one per contact spacing
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Contact spacings in file order, comma separated
        #[arg(long, value_delimiter = ',')]
        distances: Option<Vec<f64>>,

        /// Ignore points below this voltage
        #[arg(long)]
        min_voltage: Option<f64>,
    },

    /// Fit the Schulman model to a resonant tunnelling diode I-V file
    Rtd {
        /// I-V file
        file: PathBuf,

        /// Peak search window as LOW,HIGH (V)
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        peak: Option<Vec<f64>>,

        /// Valley search window as LOW,HIGH (V)
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        valley: Option<Vec<f64>>,

        /// Fit the NDR region too
        #[arg(long)]
        no_mask: bool,
    },

    /// List sweep presets
    Presets,
}

#[derive(Args)]
struct SweepArgs {
    /// Start from a named preset
    #[arg(long)]
    preset: Option<String>,

    /// Start voltage (V)
    #[arg(long, allow_hyphen_values = true)]
    start: Option<f64>,

    /// Stop voltage (V)
    #[arg(long, allow_hyphen_values = true)]
    stop: Option<f64>,

    /// Points per sweep leg
    #[arg(long)]
    points: Option<usize>,

    /// Current compliance (A)
    #[arg(long)]
    compliance: Option<f64>,

    /// Sweep back to the start voltage
    #[arg(long)]
    bidirectional: bool,

    /// Directory for result files
    #[arg(long)]
    output: Option<PathBuf>,

    /// Do not write result files
    #[arg(long)]
    no_save: bool,

    /// Use simulated instruments
    #[arg(long)]
    simulate: bool,

    /// Simulated device resistance (Ω)
    #[arg(long, default_value_t = 1000.0)]
    resistance: f64,

    /// Record optical power at every point
    #[arg(long, conflicts_with = "bias")]
    piv: bool,

    /// Hold a second source at this DC bias during the sweep (V)
    #[arg(long, allow_hyphen_values = true)]
    bias: Option<f64>,

    /// Print the finished result as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    settings.validate()?;
    logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::Sweep(args) => run_sweep(&settings, args).await,
        Commands::Tlm {
            files,
            distances,
            min_voltage,
        } => run_tlm(&settings, &files, distances, min_voltage),
        Commands::Rtd {
            file,
            peak,
            valley,
            no_mask,
        } => run_rtd(&settings, &file, peak, valley, no_mask),
        Commands::Presets => {
            list_presets(&settings);
            Ok(())
        }
    }
}

fn sweep_preset(settings: &Settings, args: &SweepArgs) -> Result<Preset> {
    let mut preset = match &args.preset {
        Some(name) => *settings.preset(name)?,
        None => Preset {
            start_voltage: 0.0,
            stop_voltage: 0.8,
            num_points: 100,
            compliance: 0.01,
            bidirectional: false,
        },
    };
    if let Some(start) = args.start {
        preset.start_voltage = start;
    }
    if let Some(stop) = args.stop {
        preset.stop_voltage = stop;
    }
    if let Some(points) = args.points {
        preset.num_points = points;
    }
    if let Some(compliance) = args.compliance {
        preset.compliance = compliance;
    }
    preset.bidirectional |= args.bidirectional;
    Ok(preset)
}

async fn run_sweep(settings: &Settings, args: SweepArgs) -> Result<()> {
    if !args.simulate {
        bail!("No instrument transport is configured; rerun with --simulate");
    }
    let spec = sweep_preset(settings, &args)?.to_spec()?;

    println!("IV DAQ - {}", settings.application.name);
    println!(
        "Sweep: {} V -> {} V, {} points, compliance {} A{}",
        spec.start_voltage(),
        spec.stop_voltage(),
        spec.total_points(),
        spec.compliance_amps(),
        if spec.is_bidirectional() { ", bidirectional" } else { "" }
    );

    let source = Arc::new(
        MockSourceMeter::new("Keithley 2400 (simulated)").with_resistance(args.resistance),
    );
    source.connect("SIM::SMU::1").await?;
    let mut instruments = InstrumentSet::single(source.clone());

    let mode = if args.piv {
        let meter = Arc::new(MockPowerMeter::tracking(source.clone(), SIMULATED_EFFICIENCY));
        meter.connect("SIM::PM100D::1").await?;
        instruments = instruments.with_power_meter(meter);
        RunMode::Piv {
            meter: settings.optical,
        }
    } else if let Some(bias_voltage) = args.bias {
        let bias = Arc::new(MockSourceMeter::new("Bias source (simulated)"));
        bias.connect("SIM::SMU::2").await?;
        instruments = instruments.with_bias(bias);
        RunMode::DualBias {
            bias_voltage,
            bias_compliance_amps: spec.compliance_amps(),
        }
    } else {
        RunMode::Single
    };

    let save_directory = if args.no_save || !settings.storage.save_files {
        None
    } else {
        Some(
            args.output
                .clone()
                .unwrap_or_else(|| settings.storage.output_dir.clone()),
        )
    };

    let orchestrator = RunOrchestrator::new(settings.measurement.clone());
    let mut events = orchestrator.subscribe();
    orchestrator.start(RunRequest {
        sweep: spec,
        mode,
        instruments,
        save_directory,
    })?;

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if print_event(&event) {
                        break orchestrator.wait().await;
                    }
                }
                None => break orchestrator.wait().await,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping measurement...");
                let outcome = orchestrator.stop().await;
                while let Ok(event) = events.try_recv() {
                    print_event(&event);
                }
                break outcome;
            }
        }
    };

    match outcome {
        Some(RunOutcome::Completed {
            result,
            saved_files,
            ..
        }) => {
            println!("Completed: {} samples", result.len());
            for path in saved_files {
                println!("  saved {}", path.display());
            }
            if args.json {
                println!("{}", serde_json::to_string_pretty(&*result)?);
            }
            Ok(())
        }
        Some(RunOutcome::Cancelled { partial }) => {
            println!("Cancelled after {} samples", partial.len());
            Ok(())
        }
        Some(RunOutcome::Errored { message, partial }) => Err(anyhow!(
            "Measurement failed after {} samples: {}",
            partial.len(),
            message
        )),
        None => {
            warn!("Measurement task did not finish; instrument state is unknown");
            Ok(())
        }
    }
}

/// Print one event; returns `true` for terminal events.
fn print_event(event: &RunEvent) -> bool {
    match event {
        RunEvent::Sample(s) => {
            let power = s
                .optical_power_uw
                .map(|p| format!("  {:>12.4} uW", p))
                .unwrap_or_default();
            println!(
                "{:>5} {} {:>+10.4} V  {:>+12.6} mA{}",
                s.index,
                if s.is_reverse { "<" } else { ">" },
                s.voltage,
                s.current_ma,
                power
            );
            false
        }
        RunEvent::Warning(message) => {
            eprintln!("warning: {}", message);
            false
        }
        RunEvent::PersistenceFailed(message) => {
            eprintln!("could not save data: {}", message);
            false
        }
        RunEvent::Completed(_) | RunEvent::Cancelled { .. } | RunEvent::Error(_) => true,
        _ => false,
    }
}

fn run_tlm(
    settings: &Settings,
    files: &[PathBuf],
    distances: Option<Vec<f64>>,
    min_voltage: Option<f64>,
) -> Result<()> {
    let mut session = TlmSession::new(
        settings.tlm.default_start_distance,
        settings.tlm.default_increment,
    );
    for error in session.add_files(files) {
        eprintln!("skipped: {}", error);
    }
    if session.entries().is_empty() {
        bail!("No files could be loaded");
    }

    if let Some(distances) = distances {
        if distances.len() != session.entries().len() {
            bail!(
                "{} distances given for {} loaded files",
                distances.len(),
                session.entries().len()
            );
        }
        for (index, distance) in distances.into_iter().enumerate() {
            session.set_distance(index, distance);
        }
    }

    let min_voltage = min_voltage.unwrap_or(settings.tlm.min_voltage);
    let fit = session.analyze(min_voltage)?;

    println!("TLM analysis (min voltage {:.2} V)", min_voltage);
    println!("{:<40} {:>10} {:>14} {:>8}", "File", "Distance", "R (kOhm)", "R^2");
    for entry in session.entries() {
        if let (Some(distance), Some(resistance)) = (entry.distance, entry.fit) {
            println!(
                "{:<40} {:>10.1} {:>14.4} {:>8.4}",
                entry.file_name(),
                distance,
                resistance.kilohms(),
                resistance.r_squared
            );
        }
    }
    println!();
    println!(
        "Sheet resistance:   {:.4} kOhm/um",
        fit.sheet_resistance_kilohms()
    );
    println!(
        "Contact resistance: {:.4} kOhm",
        fit.contact_resistance_kilohms()
    );
    println!("R^2:                {:.4} ({} fit)", fit.r_squared, fit.quality());
    Ok(())
}

fn window(values: Option<Vec<f64>>, default: [f64; 2]) -> Result<(f64, f64)> {
    let [low, high] = match values.as_deref() {
        None => default,
        Some(&[low, high]) => [low, high],
        Some(_) => bail!("A window needs exactly two voltages"),
    };
    if !(low < high) {
        bail!("Window [{}, {}] must have low < high", low, high);
    }
    Ok((low, high))
}

fn run_rtd(
    settings: &Settings,
    file: &Path,
    peak: Option<Vec<f64>>,
    valley: Option<Vec<f64>>,
    no_mask: bool,
) -> Result<()> {
    let data = load_iv_file(file)?;
    let peak_window = window(peak, settings.rtd.peak_window)?;
    let valley_window = window(valley, settings.rtd.valley_window)?;

    let found = find_peak_valley(&data.voltage, &data.current_ma, peak_window, valley_window)?;
    println!("RTD analysis of {}", file.display());
    println!(
        "Peak:   {:.4} V  {:.6} mA",
        found.peak_voltage, found.peak_current
    );
    println!(
        "Valley: {:.4} V  {:.6} mA",
        found.valley_voltage, found.valley_current
    );
    println!("PVCR:   {:.3}", found.ratio());

    let (voltage, current) = if settings.rtd.mask_ndr_region && !no_mask {
        mask_ndr_region(
            &data.voltage,
            &data.current_ma,
            found.peak_voltage,
            found.valley_voltage,
        )
    } else {
        (data.voltage.clone(), data.current_ma.clone())
    };

    let options = RtdFitOptions {
        max_iterations: settings.rtd.max_iterations,
        ..Default::default()
    };
    let fit = fit_schulman(&voltage, &current, &options)?;
    let p = fit.params;
    println!();
    println!("Schulman fit ({} points, {} iterations)", fit.points_used, fit.iterations);
    println!("  A  = {:.6e}", p.a);
    println!("  B  = {:.6}", p.b);
    println!("  C  = {:.6}", p.c);
    println!("  D  = {:.6}", p.d);
    println!("  H  = {:.6e}", p.h);
    println!("  N1 = {:.6}", p.n1);
    println!("  N2 = {:.6}", p.n2);
    println!("R^2:  {:.6}", fit.r_squared);
    Ok(())
}

fn list_presets(settings: &Settings) {
    for (name, p) in &settings.presets {
        println!(
            "{:<20} {:>6} V -> {:>6} V  {:>4} pts  {:>7} A  {}",
            name,
            p.start_voltage,
            p.stop_voltage,
            p.num_points,
            p.compliance,
            if p.bidirectional { "bidirectional" } else { "single" }
        );
    }
}
