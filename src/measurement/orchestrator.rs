//! Run orchestration.
//!
//! The [`RunOrchestrator`] owns the single-flight run state and the one background task a
//! run executes on. A run sequences:
//!
//! ```text
//! validate ─> prepare instruments ─> generate points ─> acquire ─> output off
//!                                                                     │
//!            publish result <─ cleanup instruments <─ persist <───────┘
//! ```
//!
//! # State Machine
//!
//! ```text
//! Idle ──start──> Running ──success──> Completed
//!                   │  │
//!                   │  └────fault────> Errored
//!                   └──────stop──────> Cancelled
//! ```
//!
//! Terminal states accept a new `start`; `Running` rejects it with
//! [`DaqError::RunAlreadyInProgress`].
//!
//! Every exit path runs the same best-effort cleanup over the instruments the run engaged,
//! so no source output is left on after a run ends. Cleanup failures are reported as
//! warnings and never replace the run's status. A run task that panics is marked
//! `Errored` and all of its instruments are shut down.

use crate::config::MeasurementConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{PowerMeter, PowerMeterSettings, SourceMeter};
use crate::measurement::acquisition::{
    AcquisitionLoop, Interrupted, OpticalChannel, StopSignal, SETUP_PROGRESS,
};
use crate::measurement::events::{EventBus, RunEvent};
use crate::measurement::sample::{RunResult, Sample};
use crate::measurement::storage::save_run_result;
use crate::measurement::sweep::{generate_sweep_points, SweepSpec, MAX_COMPLIANCE_AMPS};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Lifecycle of the most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No run has been started
    Idle,
    /// A run is executing
    Running,
    /// The last run finished normally
    Completed,
    /// The last run failed
    Errored,
    /// The last run was stopped by the user
    Cancelled,
}

impl RunState {
    /// Whether a new run may start.
    pub fn can_begin(&self) -> bool {
        !matches!(self, RunState::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "Idle"),
            RunState::Running => write!(f, "Running"),
            RunState::Completed => write!(f, "Completed"),
            RunState::Errored => write!(f, "Errored"),
            RunState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Measurement mode of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunMode {
    /// One source-meter sweeps and measures
    Single,
    /// A second source-meter holds a DC bias while the first sweeps
    DualBias {
        /// Bias voltage held during the sweep (V)
        bias_voltage: f64,
        /// Compliance of the bias source (A)
        bias_compliance_amps: f64,
    },
    /// Optical power is recorded at every point
    Piv {
        /// Meter setup applied before the sweep
        meter: PowerMeterSettings,
    },
}

/// Instruments lent to a run for its duration.
#[derive(Clone)]
pub struct InstrumentSet {
    /// Sweeping source-meter
    pub source: Arc<dyn SourceMeter>,
    /// Bias source-meter, required in [`RunMode::DualBias`]
    pub bias: Option<Arc<dyn SourceMeter>>,
    /// Power meter for [`RunMode::Piv`]; when absent power is recorded as zero
    pub power_meter: Option<Arc<dyn PowerMeter>>,
}

impl InstrumentSet {
    /// A set holding only the sweeping source-meter.
    pub fn single(source: Arc<dyn SourceMeter>) -> Self {
        Self {
            source,
            bias: None,
            power_meter: None,
        }
    }

    /// Add a bias source-meter.
    pub fn with_bias(mut self, bias: Arc<dyn SourceMeter>) -> Self {
        self.bias = Some(bias);
        self
    }

    /// Add a power meter.
    pub fn with_power_meter(mut self, meter: Arc<dyn PowerMeter>) -> Self {
        self.power_meter = Some(meter);
        self
    }
}

/// Everything needed to start a run.
#[derive(Clone)]
pub struct RunRequest {
    /// Sweep to execute
    pub sweep: SweepSpec,
    /// Measurement mode
    pub mode: RunMode,
    /// Instruments to drive
    pub instruments: InstrumentSet,
    /// Where to write result files; `None` disables saving
    pub save_directory: Option<PathBuf>,
}

/// How a run ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// All points acquired
    Completed {
        /// Final result
        result: Arc<RunResult>,
        /// Files written, empty when saving was off or failed
        saved_files: Vec<PathBuf>,
        /// Why saving failed, if it did
        persistence_error: Option<String>,
    },
    /// Stopped by the user
    Cancelled {
        /// Samples acquired before the stop
        partial: Arc<RunResult>,
    },
    /// An instrument fault ended the run
    Errored {
        /// Fault description
        message: String,
        /// Samples acquired before the fault
        partial: Arc<RunResult>,
    },
}

impl RunOutcome {
    /// Terminal state matching this outcome.
    pub fn state(&self) -> RunState {
        match self {
            RunOutcome::Completed { .. } => RunState::Completed,
            RunOutcome::Cancelled { .. } => RunState::Cancelled,
            RunOutcome::Errored { .. } => RunState::Errored,
        }
    }

    /// Full or partial data of the run.
    pub fn result(&self) -> &Arc<RunResult> {
        match self {
            RunOutcome::Completed { result, .. } => result,
            RunOutcome::Cancelled { partial } | RunOutcome::Errored { partial, .. } => partial,
        }
    }
}

/// Shared view of one launched run.
///
/// The stop flag stays reachable for the whole run, no matter how many callers are
/// waiting on it; the outcome arrives on a watch channel every waiter reads.
#[derive(Clone)]
struct RunHandle {
    run_id: Uuid,
    stop: StopSignal,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

impl RunHandle {
    /// Resolve once the run task has delivered its outcome; `None` if the task died first.
    async fn finished(mut self) -> Option<RunOutcome> {
        self.outcome
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| (*outcome).clone())
    }
}

/// Starts, stops and tracks measurement runs, one at a time.
///
/// # Example
///
/// ```rust,ignore
/// let orchestrator = RunOrchestrator::new(settings.measurement.clone());
/// let mut events = orchestrator.subscribe();
/// let run_id = orchestrator.start(request)?;
/// while let Some(event) = events.recv().await {
///     if let RunEvent::Sample(s) = event { println!("{} V  {} mA", s.voltage, s.current_ma); }
/// }
/// ```
pub struct RunOrchestrator {
    config: MeasurementConfig,
    events: EventBus,
    state: Arc<Mutex<RunState>>,
    current: Mutex<Option<RunHandle>>,
}

impl RunOrchestrator {
    /// Create an idle orchestrator.
    pub fn new(config: MeasurementConfig) -> Self {
        Self {
            config,
            events: EventBus::new(),
            state: Arc::new(Mutex::new(RunState::Idle)),
            current: Mutex::new(None),
        }
    }

    /// Receive every event of every subsequent run.
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<RunEvent> {
        self.events.subscribe()
    }

    /// State of the current or most recent run.
    pub fn state(&self) -> RunState {
        *lock(&self.state)
    }

    /// Identifier of the run that has not been reclaimed yet.
    pub fn active_run_id(&self) -> Option<Uuid> {
        lock(&self.current).as_ref().map(|run| run.run_id)
    }

    /// Validate `request` and launch it on a background task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// - [`DaqError::RunAlreadyInProgress`] while another run is `Running`
    /// - [`DaqError::Configuration`] / [`DaqError::Connection`] for an unusable request
    ///
    /// Neither changes the state of the orchestrator.
    pub fn start(&self, request: RunRequest) -> AppResult<Uuid> {
        let mut state = lock(&self.state);
        if !state.can_begin() {
            return Err(DaqError::RunAlreadyInProgress);
        }
        validate_request(&request)?;

        let run_id = Uuid::new_v4();
        let stop = StopSignal::new();
        let (done, outcome) = watch::channel(None);
        let context = RunContext {
            run_id,
            request,
            config: self.config.clone(),
            events: self.events.clone(),
            stop: stop.clone(),
            state: Arc::clone(&self.state),
        };
        *state = RunState::Running;
        tokio::spawn(async move {
            let outcome = context.execute().await;
            done.send_replace(Some(outcome));
        });
        *lock(&self.current) = Some(RunHandle {
            run_id,
            stop,
            outcome,
        });
        info!(%run_id, "Measurement run started");
        Ok(run_id)
    }

    /// Ask the active run to stop at its next point without waiting for it.
    ///
    /// Returns `false` when there is no run to stop.
    pub fn request_stop(&self) -> bool {
        match lock(&self.current).as_ref() {
            Some(run) => {
                run.stop.request();
                true
            }
            None => false,
        }
    }

    /// Stop the active run and reclaim it.
    ///
    /// The stop flag is raised even while other tasks are waiting on the same run. Waits
    /// at most the configured stop timeout. If the run does not finish in time it is
    /// detached and `None` is returned; it still cleans up and publishes its terminal
    /// event when it eventually finishes.
    pub async fn stop(&self) -> Option<RunOutcome> {
        let run = lock(&self.current).clone()?;
        run.stop.request();
        info!(run_id = %run.run_id, "Stop requested");

        let run_id = run.run_id;
        match timeout(self.config.stop_timeout(), run.finished()).await {
            Ok(outcome) => self.reclaim(run_id, outcome),
            Err(_) => {
                warn!(
                    %run_id,
                    timeout_ms = self.config.stop_timeout_ms,
                    "Run did not stop in time; detaching its task"
                );
                self.release(run_id);
                None
            }
        }
    }

    /// Wait for the active run to finish on its own and reclaim it.
    pub async fn wait(&self) -> Option<RunOutcome> {
        let run = lock(&self.current).clone()?;
        let run_id = run.run_id;
        let outcome = run.finished().await;
        self.reclaim(run_id, outcome)
    }

    fn reclaim(&self, run_id: Uuid, outcome: Option<RunOutcome>) -> Option<RunOutcome> {
        self.release(run_id);
        if outcome.is_none() {
            error!(%run_id, "Run task ended without an outcome");
        }
        outcome
    }

    /// Forget `run_id` unless a newer run has already replaced it.
    fn release(&self, run_id: Uuid) {
        let mut current = lock(&self.current);
        if current.as_ref().is_some_and(|run| run.run_id == run_id) {
            *current = None;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn validate_request(request: &RunRequest) -> AppResult<()> {
    if !request.instruments.source.is_connected() {
        return Err(DaqError::Connection(
            "Source-meter is not connected".to_string(),
        ));
    }
    match request.mode {
        RunMode::Single => Ok(()),
        RunMode::DualBias {
            bias_voltage,
            bias_compliance_amps,
        } => {
            let bias = request.instruments.bias.as_ref().ok_or_else(|| {
                DaqError::Configuration("Dual-bias mode requires a bias source-meter".to_string())
            })?;
            if !bias.is_connected() {
                return Err(DaqError::Connection(
                    "Bias source-meter is not connected".to_string(),
                ));
            }
            if !bias_voltage.is_finite() {
                return Err(DaqError::Configuration(
                    "Bias voltage must be finite".to_string(),
                ));
            }
            if !(bias_compliance_amps > 0.0 && bias_compliance_amps <= MAX_COMPLIANCE_AMPS) {
                return Err(DaqError::Configuration(format!(
                    "Bias compliance must be in (0, {}] A, got {}",
                    MAX_COMPLIANCE_AMPS, bias_compliance_amps
                )));
            }
            Ok(())
        }
        RunMode::Piv { meter } => meter.validate(),
    }
}

/// Instruments a run has touched and must clean up.
#[derive(Debug, Default)]
struct Engaged {
    source: bool,
    bias: bool,
    power_meter: bool,
}

/// State moved into the background task.
struct RunContext {
    run_id: Uuid,
    request: RunRequest,
    config: MeasurementConfig,
    events: EventBus,
    stop: StopSignal,
    state: Arc<Mutex<RunState>>,
}

impl RunContext {
    async fn execute(self) -> RunOutcome {
        let guard = UnwindGuard {
            run_id: self.run_id,
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            instruments: self.request.instruments.clone(),
            armed: true,
        };
        let outcome = self.run().await;
        guard.dismiss();
        outcome
    }

    async fn run(&self) -> RunOutcome {
        self.events.publish(RunEvent::Started {
            run_id: self.run_id,
        });

        let mut engaged = Engaged::default();
        let acquired = self.acquire(&mut engaged).await;

        match acquired {
            Ok(samples) => self.complete(&engaged, &samples).await,
            Err(Interrupted { error, samples }) => {
                self.cleanup(&engaged).await;
                let partial = Arc::new(self.result_from(&samples));
                if error.is_abort() {
                    info!(
                        run_id = %self.run_id,
                        acquired = samples.len(),
                        "Measurement run cancelled"
                    );
                    self.finish(RunState::Cancelled);
                    self.events.publish(RunEvent::Cancelled {
                        partial: Arc::clone(&partial),
                    });
                    RunOutcome::Cancelled { partial }
                } else {
                    let message = error.to_string();
                    error!(run_id = %self.run_id, "Measurement run failed: {}", message);
                    self.finish(RunState::Errored);
                    self.events.publish(RunEvent::Error(message.clone()));
                    RunOutcome::Errored { message, partial }
                }
            }
        }
    }

    /// Setup, acquisition and primary output off.
    async fn acquire(&self, engaged: &mut Engaged) -> Result<Vec<Sample>, Interrupted> {
        let spec = self.request.sweep;
        let instruments = &self.request.instruments;
        let source = instruments.source.as_ref();

        self.events.publish(RunEvent::Progress(5));
        engaged.source = true;
        source
            .prepare_for_sweep(spec.compliance_amps())
            .await
            .map_err(setup_failure)?;

        if let RunMode::DualBias {
            bias_voltage,
            bias_compliance_amps,
        } = self.request.mode
        {
            let bias = instruments.bias.as_deref().ok_or_else(|| {
                setup_failure(DaqError::Configuration(
                    "Dual-bias mode requires a bias source-meter".to_string(),
                ))
            })?;
            engaged.bias = true;
            bias.prepare_for_sweep(bias_compliance_amps)
                .await
                .map_err(setup_failure)?;
            bias.set_output_voltage(bias_voltage)
                .await
                .map_err(setup_failure)?;
            info!(bias_voltage, "Bias source energized");
            let settle = self.config.setup_delay();
            if !settle.is_zero() {
                sleep(settle).await;
            }
        }

        let optical = match self.request.mode {
            RunMode::Piv { meter: settings } => match instruments.power_meter.as_deref() {
                Some(meter) => {
                    engaged.power_meter = true;
                    if let Err(e) = meter.configure(&settings).await {
                        self.warn(format!("Power meter configuration failed: {}", e));
                    }
                    OpticalChannel::Meter(meter)
                }
                None => {
                    self.warn("No power meter connected; optical power recorded as 0".to_string());
                    OpticalChannel::Absent
                }
            },
            _ => OpticalChannel::Off,
        };
        self.events.publish(RunEvent::Progress(SETUP_PROGRESS));

        let sweep = generate_sweep_points(&spec);
        info!(
            run_id = %self.run_id,
            points = sweep.len(),
            start = spec.start_voltage(),
            stop = spec.stop_voltage(),
            "Sweeping"
        );
        let samples = AcquisitionLoop::new(source, &self.events, self.stop.clone())
            .with_optical(optical)
            .with_settle_delay(self.config.settle_delay())
            .run(&sweep, spec.is_bidirectional())
            .await?;

        if let Err(e) = source.output_off().await {
            return Err(Interrupted {
                error: DaqError::fault(format!("Failed to turn output off: {}", e)),
                samples,
            });
        }
        Ok(samples)
    }

    async fn complete(&self, engaged: &Engaged, samples: &[Sample]) -> RunOutcome {
        self.events.publish(RunEvent::Progress(90));
        let result = Arc::new(self.result_from(samples));

        let mut saved_files = Vec::new();
        let mut persistence_error = None;
        if let Some(directory) = &self.request.save_directory {
            match save_run_result(&result, directory) {
                Ok(paths) => {
                    self.events.publish(RunEvent::Saved(paths.clone()));
                    self.events.publish(RunEvent::SaveRequested {
                        result: Arc::clone(&result),
                        destination: directory.clone(),
                        bidirectional: result.spec.is_bidirectional(),
                    });
                    saved_files = paths;
                }
                Err(e) => {
                    error!(run_id = %self.run_id, "{}", e);
                    self.events.publish(RunEvent::PersistenceFailed(e.to_string()));
                    persistence_error = Some(e.to_string());
                }
            }
        }
        self.events.publish(RunEvent::Progress(95));

        self.cleanup(engaged).await;
        self.events.publish(RunEvent::Progress(100));

        info!(run_id = %self.run_id, samples = result.len(), "Measurement run completed");
        self.finish(RunState::Completed);
        self.events.publish(RunEvent::Completed(Arc::clone(&result)));
        RunOutcome::Completed {
            result,
            saved_files,
            persistence_error,
        }
    }

    /// Best-effort teardown of every engaged instrument.
    async fn cleanup(&self, engaged: &Engaged) {
        let mut failures = Vec::new();
        let instruments = &self.request.instruments;

        if engaged.source {
            shut_down_source(instruments.source.as_ref(), &mut failures).await;
        }
        if engaged.bias {
            if let Some(bias) = instruments.bias.as_deref() {
                shut_down_source(bias, &mut failures).await;
            }
        }
        if engaged.power_meter {
            if let Some(meter) = instruments.power_meter.as_deref() {
                if let Err(e) = meter.cleanup().await {
                    failures.push(e);
                }
            }
        }

        if failures.is_empty() {
            return;
        }
        for e in &failures {
            self.warn(format!("Instrument cleanup failed: {}", e));
        }
        warn!(run_id = %self.run_id, "{}", DaqError::ShutdownFailed(failures));
    }

    fn result_from(&self, samples: &[Sample]) -> RunResult {
        RunResult::from_samples(self.run_id, self.request.sweep, samples)
    }

    fn warn(&self, message: String) {
        warn!(run_id = %self.run_id, "{}", message);
        self.events.publish(RunEvent::Warning(message));
    }

    fn finish(&self, terminal: RunState) {
        *lock(&self.state) = terminal;
    }
}

async fn shut_down_source(source: &dyn SourceMeter, failures: &mut Vec<DaqError>) {
    if let Err(e) = source.output_off().await {
        failures.push(e);
    }
    if let Err(e) = source.shutdown().await {
        failures.push(e);
    }
}

/// Leaves the orchestrator consistent when the run task unwinds instead of returning.
///
/// Async cleanup cannot run inside `Drop`, so the instruments are shut down on a task
/// spawned onto the current runtime.
struct UnwindGuard {
    run_id: Uuid,
    events: EventBus,
    state: Arc<Mutex<RunState>>,
    instruments: InstrumentSet,
    armed: bool,
}

impl UnwindGuard {
    fn dismiss(mut self) {
        self.armed = false;
    }
}

impl Drop for UnwindGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        error!(
            run_id = %self.run_id,
            panicking = std::thread::panicking(),
            "Measurement task ended abnormally; forcing instrument shutdown"
        );
        *lock(&self.state) = RunState::Errored;
        self.events.publish(RunEvent::Error(
            "Measurement task failed unexpectedly".to_string(),
        ));

        let run_id = self.run_id;
        let instruments = self.instruments.clone();
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { force_shutdown(run_id, &instruments).await });
            }
            Err(_) => error!(%run_id, "No runtime left to shut instruments down"),
        }
    }
}

/// Shut down every instrument of the set, whether or not the run reached it.
async fn force_shutdown(run_id: Uuid, instruments: &InstrumentSet) {
    let mut failures = Vec::new();
    shut_down_source(instruments.source.as_ref(), &mut failures).await;
    if let Some(bias) = instruments.bias.as_deref() {
        shut_down_source(bias, &mut failures).await;
    }
    if let Some(meter) = instruments.power_meter.as_deref() {
        if let Err(e) = meter.cleanup().await {
            failures.push(e);
        }
    }
    if !failures.is_empty() {
        warn!(%run_id, "{}", DaqError::ShutdownFailed(failures));
    }
}

fn setup_failure(error: DaqError) -> Interrupted {
    Interrupted {
        error,
        samples: Vec::new(),
    }
}
