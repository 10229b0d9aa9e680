//! Scheduler context
//!
//! [`SchedulerState`] is everything a scheduler instance knows at runtime. It
//! is owned by one [`crate::Scheduler`] and only touched from its control task.

use crate::captured_frames::CapturedFramesTracker;
use crate::constraints::NightWindow;
use crate::execution::StageWatchdog;
use crate::job::{Job, JobId};
use crate::subsystems::WeatherStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SchedulerRunState {
    #[default]
    Idle,
    Startup,
    Running,
    Paused,
    Shutdown,
    Aborted,
    Loading,
}

impl fmt::Display for SchedulerRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SchedulerRunState::Idle => "Idle",
            SchedulerRunState::Startup => "Startup",
            SchedulerRunState::Running => "Running",
            SchedulerRunState::Paused => "Paused",
            SchedulerRunState::Shutdown => "Shutdown",
            SchedulerRunState::Aborted => "Aborted",
            SchedulerRunState::Loading => "Loading",
        };
        write!(f, "{}", text)
    }
}

/// Handler run by the next iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TimerState {
    Wakeup,
    Scheduler,
    JobCheck,
    Shutdown,
    #[default]
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum StartupState {
    #[default]
    Idle,
    Script,
    UnparkDome,
    UnparkingDome,
    UnparkMount,
    UnparkingMount,
    UnparkCap,
    UnparkingCap,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShutdownState {
    #[default]
    Idle,
    WarmCcd,
    ParkCap,
    ParkingCap,
    ParkMount,
    ParkingMount,
    ParkDome,
    ParkingDome,
    Script,
    ScriptRunning,
    Complete,
    Error,
}

/// Parking of the mount while waiting for the next job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParkWaitState {
    #[default]
    Idle,
    Park,
    Parking,
    Parked,
    Unpark,
    Unparking,
    Unparked,
    Error,
}

/// Subsystems with a retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubsystemKind {
    Align,
    Guide,
    Focus,
    Capture,
}

impl fmt::Display for SubsystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SubsystemKind::Align => "alignment",
            SubsystemKind::Guide => "guiding",
            SubsystemKind::Focus => "focusing",
            SubsystemKind::Capture => "capture",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureCounters {
    align: u32,
    guide: u32,
    focus: u32,
    capture: u32,
}

impl FailureCounters {
    fn slot(&mut self, kind: SubsystemKind) -> &mut u32 {
        match kind {
            SubsystemKind::Align => &mut self.align,
            SubsystemKind::Guide => &mut self.guide,
            SubsystemKind::Focus => &mut self.focus,
            SubsystemKind::Capture => &mut self.capture,
        }
    }

    /// Count one more failure, returns whether another attempt is allowed
    pub fn increase(&mut self, kind: SubsystemKind, max_attempts: u32) -> bool {
        let count = self.slot(kind);
        *count += 1;
        *count <= max_attempts
    }

    pub fn count(&self, kind: SubsystemKind) -> u32 {
        match kind {
            SubsystemKind::Align => self.align,
            SubsystemKind::Guide => self.guide,
            SubsystemKind::Focus => self.focus,
            SubsystemKind::Capture => self.capture,
        }
    }

    pub fn reset_kind(&mut self, kind: SubsystemKind) {
        *self.slot(kind) = 0;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Runtime state of one scheduler instance
#[derive(Debug, Default)]
pub struct SchedulerState {
    /// Queue order matters for ranking and for cohort bookkeeping
    pub jobs: Vec<Job>,
    /// Jobs were removed or reordered since the last load or save
    pub queue_dirty: bool,
    pub active_job: Option<JobId>,
    pub run_state: SchedulerRunState,
    pub startup_state: StartupState,
    pub shutdown_state: ShutdownState,
    pub park_wait_state: ParkWaitState,
    pub failures: FailureCounters,
    pub frames: CapturedFramesTracker,
    pub night: Option<NightWindow>,

    pub timer_state: TimerState,
    pub timer_interval: Option<Duration>,
    /// Set by handlers that scheduled their successor
    pub iteration_setup: bool,

    pub watchdog: Option<StageWatchdog>,
    pub autofocus_completed: bool,
    /// Batches captured by the active job since it started
    pub capture_batch: u32,
    pub preemptive_shutdown_wakeup: Option<DateTime<Utc>>,
    pub weather_status: WeatherStatus,

    /// Light frames received since the last in-flight alignment check
    pub frames_since_align_check: u32,
    pub solver_pending: bool,
    /// Full passes over the queue done since start
    pub sequence_execution_counter: u32,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self {
            sequence_execution_counter: 1,
            ..Default::default()
        }
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }

    pub fn active_job(&self) -> Option<&Job> {
        self.active_job.and_then(|id| self.job(id))
    }

    pub fn active_job_mut(&mut self) -> Option<&mut Job> {
        let id = self.active_job?;
        self.job_mut(id)
    }

    /// Choose the handler and delay of the next iteration
    pub fn setup_next_iteration(&mut self, state: TimerState, interval: Duration) {
        self.timer_state = state;
        self.timer_interval = Some(interval);
        self.iteration_setup = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Target;

    #[test]
    fn test_failure_counter_budget() {
        let mut counters = FailureCounters::default();
        for _ in 0..3 {
            assert!(counters.increase(SubsystemKind::Capture, 3));
        }
        assert!(!counters.increase(SubsystemKind::Capture, 3));
        assert_eq!(counters.count(SubsystemKind::Capture), 4);
        assert_eq!(counters.count(SubsystemKind::Guide), 0);

        counters.reset_kind(SubsystemKind::Capture);
        assert_eq!(counters.count(SubsystemKind::Capture), 0);

        counters.increase(SubsystemKind::Align, 1);
        counters.reset();
        assert_eq!(counters, FailureCounters::default());
    }

    #[test]
    fn test_active_job_lookup() {
        let mut state = SchedulerState::new();
        let job = Job::new("M42", Target::new(5.58, -5.39), "/seq/m42.esq");
        let id = job.id;
        state.jobs.push(job);

        assert!(state.active_job().is_none());
        state.active_job = Some(id);
        assert_eq!(state.active_job().map(|j| j.name.as_str()), Some("M42"));

        state.jobs.clear();
        assert!(state.active_job().is_none());
    }

    #[test]
    fn test_setup_next_iteration() {
        let mut state = SchedulerState::new();
        assert_eq!(state.timer_state, TimerState::Nothing);

        state.setup_next_iteration(TimerState::JobCheck, Duration::from_millis(500));
        assert_eq!(state.timer_state, TimerState::JobCheck);
        assert_eq!(state.timer_interval, Some(Duration::from_millis(500)));
        assert!(state.iteration_setup);
    }
}
