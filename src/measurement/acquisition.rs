//! Per-point acquisition loop.
//!
//! For every sweep point the loop checks the stop signal, commands the source voltage,
//! reads back current (and voltage), optionally reads optical power, then publishes the
//! sample and a progress tick before moving on. Source faults end the loop; power meter
//! faults are replaced by a zero reading and reported as warnings.
//!
//! Whatever way the loop ends, the samples acquired so far are handed back to the caller.

use crate::error::DaqError;
use crate::hardware::capabilities::{PowerMeter, SourceMeter};
use crate::measurement::events::{EventBus, RunEvent};
use crate::measurement::sample::{Sample, AMPS_TO_MILLIAMPS, WATTS_TO_MICROWATTS};
use crate::measurement::sweep::SweepPoints;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Progress reported once setup is done.
pub const SETUP_PROGRESS: u8 = 10;
/// Share of the progress bar spread over the sweep points.
pub const SWEEP_PROGRESS_SPAN: usize = 80;

/// Acquisition loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// `run` has not been called
    NotStarted,
    /// Iterating sweep points
    Running,
    /// A stop was requested and will be honoured at the next point
    Stopping,
    /// The loop returned
    Done,
}

/// Cooperative cancellation flag shared between a run and its owner.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Create a cleared signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop before its next point.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where optical power comes from during a run.
#[derive(Clone, Copy)]
pub enum OpticalChannel<'a> {
    /// Plain I-V run, no power column
    Off,
    /// P-I-V run with a meter
    Meter(&'a dyn PowerMeter),
    /// P-I-V run without a meter; power is recorded as zero
    Absent,
}

/// Loop ended early. `samples` holds every sample published before the interruption.
#[derive(Debug)]
pub struct Interrupted {
    /// [`DaqError::MeasurementAborted`] for a stop, the source fault otherwise
    pub error: DaqError,
    /// Samples acquired before the interruption, in sweep order
    pub samples: Vec<Sample>,
}

/// Drives one source-meter through a point sequence.
pub struct AcquisitionLoop<'a> {
    source: &'a dyn SourceMeter,
    events: &'a EventBus,
    stop: StopSignal,
    optical: OpticalChannel<'a>,
    settle_delay: Duration,
    state: LoopState,
}

impl<'a> AcquisitionLoop<'a> {
    /// Create a loop for `source`, publishing on `events` and watching `stop`.
    pub fn new(source: &'a dyn SourceMeter, events: &'a EventBus, stop: StopSignal) -> Self {
        Self {
            source,
            events,
            stop,
            optical: OpticalChannel::Off,
            settle_delay: Duration::ZERO,
            state: LoopState::NotStarted,
        }
    }

    /// Record optical power from `optical` at every point.
    pub fn with_optical(mut self, optical: OpticalChannel<'a>) -> Self {
        self.optical = optical;
        self
    }

    /// Wait this long between commanding a voltage and reading it back.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Current state; reports `Stopping` as soon as a stop is requested mid-run.
    pub fn state(&self) -> LoopState {
        if self.state == LoopState::Running && self.stop.is_requested() {
            LoopState::Stopping
        } else {
            self.state
        }
    }

    /// Acquire every point of `sweep` in order.
    ///
    /// # Errors
    /// [`Interrupted`] on a stop request (observed before a point's voltage command) or on
    /// the first source-meter fault.
    pub async fn run(
        &mut self,
        sweep: &SweepPoints,
        bidirectional: bool,
    ) -> Result<Vec<Sample>, Interrupted> {
        self.state = LoopState::Running;
        let total = sweep.len();
        let mut samples = Vec::with_capacity(total);

        for (index, &commanded) in sweep.points.iter().enumerate() {
            if self.stop.is_requested() {
                debug!(acquired = samples.len(), total, "stop observed");
                return Err(self.finish(DaqError::MeasurementAborted, samples));
            }

            let reading = match self.measure_point(commanded).await {
                Ok(reading) => reading,
                Err(error) => return Err(self.finish(error, samples)),
            };
            let optical_power_uw = self.read_optical_power().await;

            let sample = Sample {
                index,
                voltage: reading.0,
                current_ma: reading.1 * AMPS_TO_MILLIAMPS,
                optical_power_uw,
                is_reverse: sweep.is_reverse(index, bidirectional),
            };
            debug!(
                index,
                commanded,
                voltage = sample.voltage,
                current_ma = sample.current_ma,
                "sample"
            );

            self.events.publish(RunEvent::Sample(sample));
            samples.push(sample);
            self.events
                .publish(RunEvent::Progress(point_progress(index, total)));
        }

        self.state = LoopState::Done;
        Ok(samples)
    }

    /// Command `volts` and return `(voltage, current_amps)`.
    async fn measure_point(&self, volts: f64) -> Result<(f64, f64), DaqError> {
        self.source.set_output_voltage(volts).await?;
        if !self.settle_delay.is_zero() {
            sleep(self.settle_delay).await;
        }
        let reading = self.source.read_measurement().await?;
        Ok((reading.voltage_or(volts), reading.current_amps))
    }

    async fn read_optical_power(&self) -> Option<f64> {
        match self.optical {
            OpticalChannel::Off => None,
            OpticalChannel::Absent => Some(0.0),
            OpticalChannel::Meter(meter) => match meter.read_power().await {
                Ok(reading) => Some(reading.watts * WATTS_TO_MICROWATTS),
                Err(e) => {
                    let message = format!("Power meter read failed, recording 0: {}", e);
                    warn!("{}", message);
                    self.events.publish(RunEvent::Warning(message));
                    Some(0.0)
                }
            },
        }
    }

    fn finish(&mut self, error: DaqError, samples: Vec<Sample>) -> Interrupted {
        self.state = LoopState::Done;
        Interrupted { error, samples }
    }
}

/// Progress after point `index` of `total` completes.
pub fn point_progress(index: usize, total: usize) -> u8 {
    let span = (index + 1) * SWEEP_PROGRESS_SPAN / total.max(1);
    SETUP_PROGRESS + span.min(SWEEP_PROGRESS_SPAN) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::Connection;
    use crate::hardware::mock::{MockPowerMeter, MockSourceMeter};
    use crate::measurement::sweep::{generate_sweep_points, SweepSpec};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tracing_test::traced_test;

    async fn ready_source(source: MockSourceMeter) -> MockSourceMeter {
        source.connect("SIM::SMU").await.unwrap();
        source.prepare_for_sweep(0.1).await.unwrap();
        source
    }

    fn drain(rx: &mut UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn samples_are_published_in_order_with_progress() {
        let source = ready_source(MockSourceMeter::new("dut").with_resistance(100.0)).await;
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let spec = SweepSpec::new(0.0, 1.0, 3, 0.1, true).unwrap();

        let mut acquisition = AcquisitionLoop::new(&source, &bus, StopSignal::new());
        let samples = acquisition
            .run(&generate_sweep_points(&spec), true)
            .await
            .unwrap();

        assert_eq!(samples.len(), 5);
        assert_eq!(acquisition.state(), LoopState::Done);
        assert!((samples[2].current_ma - 10.0).abs() < 1e-9);
        assert_eq!(
            samples.iter().map(|s| s.is_reverse).collect::<Vec<_>>(),
            vec![false, false, false, true, true]
        );

        let indices: Vec<usize> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::Sample(s) => Some(s.index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn current_only_readings_use_commanded_voltage() {
        let source = ready_source(MockSourceMeter::new("dut").current_only()).await;
        let bus = EventBus::new();
        let spec = SweepSpec::new(0.0, 0.5, 2, 0.1, false).unwrap();

        let samples = AcquisitionLoop::new(&source, &bus, StopSignal::new())
            .run(&generate_sweep_points(&spec), false)
            .await
            .unwrap();
        assert_eq!(samples[1].voltage, 0.5);
    }

    #[tokio::test]
    async fn requested_stop_prevents_next_command() {
        let source = ready_source(MockSourceMeter::new("dut")).await;
        let bus = EventBus::new();
        let stop = StopSignal::new();
        stop.request();
        let spec = SweepSpec::new(0.0, 1.0, 5, 0.1, false).unwrap();

        let mut acquisition = AcquisitionLoop::new(&source, &bus, stop);
        assert_eq!(acquisition.state(), LoopState::NotStarted);
        let interrupted = acquisition
            .run(&generate_sweep_points(&spec), false)
            .await
            .unwrap_err();

        assert!(interrupted.error.is_abort());
        assert!(interrupted.samples.is_empty());
        assert_eq!(source.count_calls("set:"), 0);
    }

    #[tokio::test]
    async fn source_fault_keeps_earlier_samples() {
        let source = ready_source(MockSourceMeter::new("dut").fail_on_voltage_command(3)).await;
        let bus = EventBus::new();
        let spec = SweepSpec::new(0.0, 1.0, 10, 0.1, false).unwrap();

        let interrupted = AcquisitionLoop::new(&source, &bus, StopSignal::new())
            .run(&generate_sweep_points(&spec), false)
            .await
            .unwrap_err();

        assert!(matches!(interrupted.error, DaqError::InstrumentFault(_)));
        assert_eq!(interrupted.samples.len(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn power_meter_fault_degrades_to_zero() {
        let source = ready_source(MockSourceMeter::new("led")).await;
        let meter = MockPowerMeter::constant(1e-3).failing_reads();
        meter.connect("SIM::PM").await.unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let spec = SweepSpec::new(0.0, 1.0, 3, 0.1, false).unwrap();

        let samples = AcquisitionLoop::new(&source, &bus, StopSignal::new())
            .with_optical(OpticalChannel::Meter(&meter))
            .run(&generate_sweep_points(&spec), false)
            .await
            .unwrap();

        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.optical_power_uw == Some(0.0)));
        let warnings = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, RunEvent::Warning(_)))
            .count();
        assert_eq!(warnings, 3);
        assert!(logs_contain("Power meter read failed"));
    }

    #[tokio::test]
    async fn power_is_recorded_in_microwatts() {
        let source = ready_source(MockSourceMeter::new("led")).await;
        let meter = MockPowerMeter::constant(2e-6);
        meter.connect("SIM::PM").await.unwrap();
        let bus = EventBus::new();
        let spec = SweepSpec::new(0.0, 1.0, 2, 0.1, false).unwrap();

        let samples = AcquisitionLoop::new(&source, &bus, StopSignal::new())
            .with_optical(OpticalChannel::Meter(&meter))
            .run(&generate_sweep_points(&spec), false)
            .await
            .unwrap();
        assert!((samples[0].optical_power_uw.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn progress_spans_ten_to_ninety() {
        assert_eq!(point_progress(0, 4), 30);
        assert_eq!(point_progress(3, 4), 90);
        let ticks: Vec<u8> = (0..7).map(|i| point_progress(i, 7)).collect();
        assert!(ticks.windows(2).all(|w| w[0] <= w[1]));
    }
}
