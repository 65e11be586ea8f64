//! Run events and their fan-out.
//!
//! Every subscriber owns a dedicated unbounded channel, so a slow consumer never causes
//! another consumer to miss or reorder events, and publishing never blocks the acquisition
//! loop.

use crate::measurement::sample::{RunResult, Sample};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Notification published by a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// The background context began executing the run.
    Started {
        /// Run identifier
        run_id: Uuid,
    },
    /// One sample, in sweep-point order.
    Sample(Sample),
    /// Progress percentage (0-100, non-decreasing within a run).
    Progress(u8),
    /// Run finished; final result snapshot.
    Completed(Arc<RunResult>),
    /// Completed data is ready for a plot export by a UI collaborator.
    SaveRequested {
        /// Result to render
        result: Arc<RunResult>,
        /// Directory the data files went to
        destination: PathBuf,
        /// Whether two legs were written
        bidirectional: bool,
    },
    /// Data files written for a completed run.
    Saved(Vec<PathBuf>),
    /// Writing the data files failed; the run itself still completed.
    PersistenceFailed(String),
    /// The user stopped the run. Carries whatever had been acquired.
    Cancelled {
        /// Samples acquired before the stop was observed
        partial: Arc<RunResult>,
    },
    /// The run failed.
    Error(String),
    /// Non-fatal condition (degraded power reads, cleanup failures).
    Warning(String),
}

/// Fan-out distributor for [`RunEvent`]s.
///
/// Cloning yields another handle to the same subscriber list.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<UnboundedSender<RunEvent>>>>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> UnboundedReceiver<RunEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, dropping those whose receiver is gone.
    pub fn publish(&self, event: RunEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<UnboundedSender<RunEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
