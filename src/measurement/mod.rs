//! Measurement pipeline: sweep generation, acquisition, orchestration and result files.
//!
//! ```text
//! RunOrchestrator ──> AcquisitionLoop ──> SourceMeter / PowerMeter
//!        │                  │
//!        │                  └──> EventBus ──> subscribers
//!        └──> storage
//! ```

pub mod acquisition;
pub mod events;
pub mod orchestrator;
pub mod sample;
pub mod storage;
pub mod sweep;

pub use acquisition::{AcquisitionLoop, Interrupted, LoopState, OpticalChannel, StopSignal};
pub use events::{EventBus, RunEvent};
pub use orchestrator::{
    InstrumentSet, RunMode, RunOrchestrator, RunOutcome, RunRequest, RunState,
};
pub use sample::{RunResult, Sample, SweepBranch};
pub use storage::save_run_result;
pub use sweep::{generate_sweep_points, SweepPoints, SweepSpec};
