//! Runtime trackers observing step execution
//!
//! A tracker is called around every child step. Tracker failures are logged
//! by the interpreter and never abort the run.

use crate::core::error::ExecutionError;
use crate::core::value::Value;
use crate::execution::context::AbortHandle;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

/// Identity of the step a tracker is notified about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRef<'a> {
    pub id: &'a str,
    pub kind: &'static str,
}

/// Observer of step execution
pub trait RuntimeTracker: Send + Sync {
    fn before(&self, step: StepRef<'_>) -> anyhow::Result<()>;

    fn after(&self, step: StepRef<'_>) -> anyhow::Result<()>;

    fn error(&self, step: StepRef<'_>, error: &ExecutionError) -> anyhow::Result<()>;

    /// Receives the evaluated description of a step
    fn describe(&self, _step: StepRef<'_>, _description: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a tracker observed
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEventKind {
    Before,
    After,
    Error(String),
    Describe(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerEvent {
    pub at: DateTime<Utc>,
    pub step_id: String,
    pub step_kind: &'static str,
    pub kind: TrackerEventKind,
}

/// Tracker that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingTracker {
    events: Mutex<Vec<TrackerEvent>>,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn events_mut(&self) -> MutexGuard<'_, Vec<TrackerEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, step: StepRef<'_>, kind: TrackerEventKind) {
        self.events_mut().push(TrackerEvent {
            at: Utc::now(),
            step_id: step.id.to_string(),
            step_kind: step.kind,
            kind,
        });
    }

    pub fn events(&self) -> Vec<TrackerEvent> {
        self.events_mut().clone()
    }

    /// Ids of the steps that started, in order
    pub fn started(&self) -> Vec<String> {
        self.events_mut()
            .iter()
            .filter(|e| e.kind == TrackerEventKind::Before)
            .map(|e| e.step_id.clone())
            .collect()
    }
}

impl RuntimeTracker for RecordingTracker {
    fn before(&self, step: StepRef<'_>) -> anyhow::Result<()> {
        self.record(step, TrackerEventKind::Before);
        Ok(())
    }

    fn after(&self, step: StepRef<'_>) -> anyhow::Result<()> {
        self.record(step, TrackerEventKind::After);
        Ok(())
    }

    fn error(&self, step: StepRef<'_>, error: &ExecutionError) -> anyhow::Result<()> {
        self.record(step, TrackerEventKind::Error(error.to_string()));
        Ok(())
    }

    fn describe(&self, step: StepRef<'_>, description: &Value) -> anyhow::Result<()> {
        self.record(step, TrackerEventKind::Describe(description.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TraceState {
    paused_at: Option<String>,
    resumed: bool,
}

/// Tracker that pauses at breakpoints
///
/// When a step with a breakpoint is about to run, the executing thread waits
/// for [`TraceModeTracker::resume`]. If nobody resumes it within the timeout
/// the run is aborted.
#[derive(Debug)]
pub struct TraceModeTracker {
    breakpoints: Mutex<HashSet<String>>,
    timeout: Duration,
    abort: AbortHandle,
    state: Mutex<TraceState>,
    resumed: Condvar,
}

impl TraceModeTracker {
    pub fn new(abort: AbortHandle, timeout: Duration) -> Self {
        Self {
            breakpoints: Mutex::new(HashSet::new()),
            timeout,
            abort,
            state: Mutex::new(TraceState::default()),
            resumed: Condvar::new(),
        }
    }

    pub fn with_breakpoint(self, step_id: impl Into<String>) -> Self {
        self.add_breakpoint(step_id);
        self
    }

    pub fn add_breakpoint(&self, step_id: impl Into<String>) {
        self.breakpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(step_id.into());
    }

    pub fn remove_breakpoint(&self, step_id: &str) {
        self.breakpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(step_id);
    }

    fn state(&self) -> MutexGuard<'_, TraceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Step the run is currently paused at
    pub fn paused_at(&self) -> Option<String> {
        self.state().paused_at.clone()
    }

    /// Let a paused run continue
    pub fn resume(&self) {
        let mut state = self.state();
        state.resumed = true;
        self.resumed.notify_all();
    }
}

impl RuntimeTracker for TraceModeTracker {
    fn before(&self, step: StepRef<'_>) -> anyhow::Result<()> {
        let hit = self
            .breakpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(step.id);
        if !hit {
            return Ok(());
        }

        info!("Breakpoint hit at step {}", step.id);
        let mut state = self.state();
        state.paused_at = Some(step.id.to_string());
        state.resumed = false;
        let (mut state, timeout) = self
            .resumed
            .wait_timeout_while(state, self.timeout, |s| !s.resumed)
            .unwrap_or_else(|e| e.into_inner());
        state.paused_at = None;
        if timeout.timed_out() && !state.resumed {
            warn!("Breakpoint at step {} was not resumed, aborting", step.id);
            self.abort.abort();
        }
        Ok(())
    }

    fn after(&self, _step: StepRef<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn error(&self, _step: StepRef<'_>, _error: &ExecutionError) -> anyhow::Result<()> {
        Ok(())
    }
}
