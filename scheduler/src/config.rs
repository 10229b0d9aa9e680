//! Scheduler configuration
//!
//! Everything here is plain serde data loaded from JSON. Fields left out of
//! the file fall back to the values of a stock observatory setup.

use crate::constraints::{ArtificialHorizon, ObserverLocation, TwilightSettings};
use crate::error::{Result, SchedulerError};
use crate::state::SubsystemKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What happens to aborted jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorHandlingStrategy {
    /// Aborted jobs stay aborted until the queue is restarted
    DontRestart,
    /// Aborted jobs are retried once the delay has passed
    RestartImmediately,
    /// Aborted jobs are retried only when nothing else can run
    RestartAfterTermination,
}

impl Default for ErrorHandlingStrategy {
    fn default() -> Self {
        Self::RestartAfterTermination
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    #[serde(default)]
    pub strategy: ErrorHandlingStrategy,

    /// Also retry jobs that ended in ERROR
    #[serde(default)]
    pub reschedule_errors: bool,

    /// Delay before an aborted job may run again (seconds)
    #[serde(default)]
    pub delay_secs: u64,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            strategy: ErrorHandlingStrategy::default(),
            reschedule_errors: false,
            delay_secs: 0,
        }
    }
}

/// Inactivity timeouts per pipeline stage (seconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTimeouts {
    #[serde(default = "default_stage_timeout")]
    pub align_secs: u64,
    #[serde(default = "default_stage_timeout")]
    pub capture_secs: u64,
    #[serde(default = "default_stage_timeout")]
    pub focus_secs: u64,
    #[serde(default = "default_guide_timeout")]
    pub guide_secs: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            align_secs: 120,
            capture_secs: 120,
            focus_secs: 120,
            guide_secs: 60,
        }
    }
}

impl StageTimeouts {
    pub fn for_kind(&self, kind: SubsystemKind) -> chrono::Duration {
        let secs = match kind {
            SubsystemKind::Align => self.align_secs,
            SubsystemKind::Capture => self.capture_secs,
            SubsystemKind::Focus => self.focus_secs,
            SubsystemKind::Guide => self.guide_secs,
        };
        chrono::Duration::seconds(secs as i64)
    }
}

fn default_stage_timeout() -> u64 {
    120
}

fn default_guide_timeout() -> u64 {
    60
}

/// Observatory startup and shutdown steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcedureConfig {
    #[serde(default)]
    pub startup_script: Option<PathBuf>,
    #[serde(default)]
    pub shutdown_script: Option<PathBuf>,

    #[serde(default)]
    pub unpark_dome: bool,
    #[serde(default)]
    pub unpark_mount: bool,
    #[serde(default)]
    pub open_cap: bool,

    #[serde(default)]
    pub warm_ccd: bool,
    #[serde(default)]
    pub close_cap: bool,
    #[serde(default)]
    pub park_mount: bool,
    #[serde(default)]
    pub park_dome: bool,

    /// Park the mount while waiting for a job that starts later
    #[serde(default)]
    pub park_mount_while_waiting: bool,

    /// A dome is slaved to the mount
    #[serde(default)]
    pub use_dome: bool,
}

/// Periodic plate solving of captured light frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignCheckConfig {
    /// Solve every Nth light frame, 0 disables the check
    #[serde(default)]
    pub frequency: u32,

    /// Distance above which the target is re-aligned (arcminutes)
    #[serde(default = "default_align_threshold")]
    pub threshold_arcmin: f64,

    /// Lower bound for the solver timeout (seconds)
    #[serde(default = "default_min_solver_secs")]
    pub min_solver_secs: f64,
}

impl Default for AlignCheckConfig {
    fn default() -> Self {
        Self {
            frequency: 0,
            threshold_arcmin: 2.0,
            min_solver_secs: 5.0,
        }
    }
}

fn default_align_threshold() -> f64 {
    2.0
}

fn default_min_solver_secs() -> f64 {
    5.0
}

/// Overheads added to the sequence duration when estimating a job (seconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOverheads {
    #[serde(default = "default_slew_overhead")]
    pub slew_secs: f64,
    #[serde(default = "default_focus_overhead")]
    pub focus_secs: f64,
    #[serde(default = "default_align_overhead")]
    pub align_secs: f64,
    #[serde(default = "default_guide_overhead")]
    pub guide_secs: f64,
}

impl Default for PipelineOverheads {
    fn default() -> Self {
        Self {
            slew_secs: 30.0,
            focus_secs: 300.0,
            align_secs: 60.0,
            guide_secs: 60.0,
        }
    }
}

fn default_slew_overhead() -> f64 {
    30.0
}

fn default_focus_overhead() -> f64 {
    300.0
}

fn default_align_overhead() -> f64 {
    60.0
}

fn default_guide_overhead() -> f64 {
    60.0
}

/// Window search parameters of the greedy scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningConfig {
    /// How many nights ahead an ASAP job may be placed
    #[serde(default = "default_lookahead_nights")]
    pub lookahead_nights: u32,

    /// Sampling step of the window search (seconds)
    #[serde(default = "default_search_step")]
    pub search_step_secs: i64,

    /// Longest span a window must stay open for a job to start (seconds)
    #[serde(default = "default_max_required_window")]
    pub max_required_window_secs: i64,

    #[serde(default)]
    pub overheads: PipelineOverheads,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            lookahead_nights: 2,
            search_step_secs: 300,
            max_required_window_secs: 3600,
            overheads: PipelineOverheads::default(),
        }
    }
}

fn default_lookahead_nights() -> u32 {
    2
}

fn default_search_step() -> i64 {
    300
}

fn default_max_required_window() -> i64 {
    3600
}

/// Repetition of the whole queue once every job is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceRepeat {
    Once,
    Times(u32),
    Forever,
}

impl Default for SequenceRepeat {
    fn default() -> Self {
        Self::Once
    }
}

/// Configuration of one scheduler instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub location: ObserverLocation,

    #[serde(default)]
    pub twilight: TwilightSettings,

    #[serde(default)]
    pub horizon: ArtificialHorizon,

    /// Count frames already on disk towards job completion
    #[serde(default = "default_true")]
    pub remember_job_progress: bool,

    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,

    #[serde(default)]
    pub timeouts: StageTimeouts,

    /// Retries per subsystem before the job is aborted
    #[serde(default = "default_max_failure_attempts")]
    pub max_failure_attempts: u32,

    /// Default delay between two iterations (milliseconds)
    #[serde(default = "default_update_period_ms")]
    pub update_period_ms: u64,

    /// Minimum wait before the scheduler sleeps instead of polling (minutes)
    #[serde(default = "default_lead_time_minutes")]
    pub lead_time_minutes: i64,

    /// Shut the observatory down when the next job is far away
    #[serde(default)]
    pub preemptive_shutdown: bool,

    #[serde(default = "default_preemptive_shutdown_hours")]
    pub preemptive_shutdown_hours: f64,

    #[serde(default)]
    pub procedures: ProcedureConfig,

    /// Re-align before every repetition of a job
    #[serde(default)]
    pub force_alignment_before_job: bool,

    #[serde(default)]
    pub align_check: AlignCheckConfig,

    #[serde(default)]
    pub planning: PlanningConfig,

    #[serde(default)]
    pub repeat_sequence: SequenceRepeat,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            location: ObserverLocation::default(),
            twilight: TwilightSettings::default(),
            horizon: ArtificialHorizon::default(),
            remember_job_progress: true,
            error_handling: ErrorHandlingConfig::default(),
            timeouts: StageTimeouts::default(),
            max_failure_attempts: 5,
            update_period_ms: 1000,
            lead_time_minutes: 5,
            preemptive_shutdown: false,
            preemptive_shutdown_hours: 2.0,
            procedures: ProcedureConfig::default(),
            force_alignment_before_job: false,
            align_check: AlignCheckConfig::default(),
            planning: PlanningConfig::default(),
            repeat_sequence: SequenceRepeat::Once,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_failure_attempts() -> u32 {
    5
}

fn default_update_period_ms() -> u64 {
    1000
}

fn default_lead_time_minutes() -> i64 {
    5
}

fn default_preemptive_shutdown_hours() -> f64 {
    2.0
}

impl SchedulerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SchedulerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SchedulerError::InvalidConfig(msg.to_string()));

        if !(-90.0..=90.0).contains(&self.location.latitude) {
            return invalid("latitude must be within [-90, 90] degrees");
        }
        if !(-180.0..=360.0).contains(&self.location.longitude) {
            return invalid("longitude must be within [-180, 360] degrees");
        }
        if !(-90.0..=0.0).contains(&self.twilight.sun_altitude_threshold) {
            return invalid("twilight sun altitude must be within [-90, 0] degrees");
        }
        if self.update_period_ms == 0 {
            return invalid("update period must be positive");
        }
        if self.max_failure_attempts == 0 {
            return invalid("at least one failure attempt is required");
        }
        if self.lead_time_minutes < 0 {
            return invalid("lead time cannot be negative");
        }
        if self.preemptive_shutdown_hours <= 0.0 {
            return invalid("preemptive shutdown delay must be positive");
        }
        if self.planning.search_step_secs <= 0 {
            return invalid("planning step must be positive");
        }
        if self.planning.max_required_window_secs < 0 {
            return invalid("required window cannot be negative");
        }
        if self.planning.lookahead_nights == 0 {
            return invalid("lookahead must cover at least one night");
        }
        if let SequenceRepeat::Times(0) = self.repeat_sequence {
            return invalid("queue repeat count must be at least 1");
        }
        self.horizon.validate()?;
        Ok(())
    }

    pub fn update_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.update_period_ms)
    }

    pub fn lead_time(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.lead_time_minutes)
    }

    pub fn preemptive_shutdown_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.preemptive_shutdown_hours * 3600.0) as i64)
    }

    pub fn error_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.error_handling.delay_secs as i64)
    }
}
