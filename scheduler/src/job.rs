//! Observation job model
//!
//! A [`Job`] carries what the user asked for (target, sequence, conditions,
//! constraints, pipeline steps) plus the scheduling state derived from it.
//! The derived fields are caches: the greedy scheduler clears and recomputes
//! them on every evaluation pass.

use crate::astro::EquatorialCoords;
use crate::error::{Result, SchedulerError};
use crate::sequence::SequenceJob;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::path::PathBuf;
use uuid::Uuid;

pub type JobId = Uuid;

/// Lifecycle status of a job
///
/// The declaration order matters: everything from `Error` onwards is a
/// finished or aborted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum JobStatus {
    #[default]
    Idle,
    Evaluation,
    Scheduled,
    Busy,
    Error,
    Aborted,
    Invalid,
    Complete,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobStatus::Idle => "Idle",
            JobStatus::Evaluation => "Evaluating",
            JobStatus::Scheduled => "Scheduled",
            JobStatus::Busy => "Running",
            JobStatus::Error => "Error",
            JobStatus::Aborted => "Aborted",
            JobStatus::Invalid => "Invalid",
            JobStatus::Complete => "Complete",
        };
        write!(f, "{}", text)
    }
}

/// Current phase of the capture pipeline of the active job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobStage {
    #[default]
    Idle,
    Slewing,
    SlewComplete,
    Focusing,
    FocusComplete,
    Aligning,
    AlignComplete,
    Reslewing,
    ReslewingComplete,
    PostAlignFocusing,
    PostAlignFocusingComplete,
    Guiding,
    GuidingComplete,
    Capturing,
    Complete,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobStage::Idle => "Idle",
            JobStage::Slewing => "Slewing",
            JobStage::SlewComplete => "Slew complete",
            JobStage::Focusing | JobStage::PostAlignFocusing => "Focusing",
            JobStage::FocusComplete | JobStage::PostAlignFocusingComplete => "Focus complete",
            JobStage::Aligning => "Aligning",
            JobStage::AlignComplete => "Align complete",
            JobStage::Reslewing => "Repositioning",
            JobStage::ReslewingComplete => "Repositioning complete",
            JobStage::Guiding => "Guiding",
            JobStage::GuidingComplete => "Guiding complete",
            JobStage::Capturing => "Capturing",
            JobStage::Complete => "Complete",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StartupCondition {
    #[default]
    Asap,
    At(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompletionCondition {
    #[default]
    Sequence,
    Repeat(u32),
    Loop,
    Until(DateTime<Utc>),
}

/// Optional steps run before capture starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PipelineSteps(u8);

impl PipelineSteps {
    pub const NONE: PipelineSteps = PipelineSteps(0);
    pub const TRACK: PipelineSteps = PipelineSteps(1 << 0);
    pub const FOCUS: PipelineSteps = PipelineSteps(1 << 1);
    pub const ALIGN: PipelineSteps = PipelineSteps(1 << 2);
    pub const GUIDE: PipelineSteps = PipelineSteps(1 << 3);
    pub const ALL: PipelineSteps = PipelineSteps(0b1111);

    pub fn contains(self, other: PipelineSteps) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: PipelineSteps) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PipelineSteps) {
        self.0 &= !other.0;
    }
}

impl BitOr for PipelineSteps {
    type Output = PipelineSteps;

    fn bitor(self, rhs: PipelineSteps) -> PipelineSteps {
        PipelineSteps(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// J2000 right ascension in hours
    pub ra_hours: f64,
    /// J2000 declination in degrees
    pub dec_degrees: f64,
    #[serde(default)]
    pub position_angle: Option<f64>,
    /// Reference frame to solve instead of coordinates
    #[serde(default)]
    pub fits_file: Option<PathBuf>,
}

impl Target {
    pub fn new(ra_hours: f64, dec_degrees: f64) -> Self {
        Self {
            ra_hours,
            dec_degrees,
            position_angle: None,
            fits_file: None,
        }
    }

    pub fn coords(&self) -> EquatorialCoords {
        EquatorialCoords::new(self.ra_hours, self.dec_degrees)
    }

    fn same_position(&self, other: &Target) -> bool {
        const EPSILON: f64 = 1e-6;
        (self.ra_hours - other.ra_hours).abs() < EPSILON
            && (self.dec_degrees - other.dec_degrees).abs() < EPSILON
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConstraints {
    /// Minimum altitude in degrees
    #[serde(default)]
    pub min_altitude: Option<f64>,
    /// Minimum distance to the moon in degrees
    #[serde(default)]
    pub min_moon_separation: Option<f64>,
    #[serde(default)]
    pub enforce_weather: bool,
    #[serde(default)]
    pub enforce_twilight: bool,
    #[serde(default)]
    pub enforce_horizon: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(default = "Uuid::new_v4")]
    pub id: JobId,
    pub name: String,
    #[serde(default)]
    pub group: String,
    pub target: Target,
    pub sequence_file: PathBuf,
    #[serde(default)]
    pub startup: StartupCondition,
    #[serde(default)]
    pub completion: CompletionCondition,
    #[serde(default)]
    pub constraints: JobConstraints,
    #[serde(default)]
    pub steps: PipelineSteps,

    #[serde(skip)]
    status: JobStatus,
    #[serde(skip)]
    stage: JobStage,
    /// Last status change
    #[serde(skip)]
    pub state_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub startup_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub altitude_at_startup: Option<f64>,
    #[serde(skip)]
    pub altitude_at_completion: Option<f64>,
    /// Only meaningful with [`CompletionCondition::Repeat`]
    #[serde(skip)]
    pub repeats_remaining: u32,
    #[serde(skip)]
    pub completed_iterations: u32,
    #[serde(skip)]
    pub completed_count: u32,
    /// Frames the sequence requires over all iterations
    #[serde(skip)]
    pub sequence_count: u32,
    #[serde(skip)]
    pub estimated_duration: Option<Duration>,
    #[serde(skip)]
    pub light_frames_required: bool,
    #[serde(skip)]
    pub in_sequence_focus: bool,
    #[serde(skip)]
    pub sequence_jobs: Vec<SequenceJob>,
    /// First job of the cohort this job duplicates
    #[serde(skip)]
    pub duplicate_of: Option<JobId>,
    /// Edited since the queue was last loaded or saved
    #[serde(skip)]
    pub dirty: bool,
    #[serde(skip)]
    pub stop_reason: String,
    #[serde(skip)]
    pub last_abort_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub last_error_time: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(name: impl Into<String>, target: Target, sequence_file: impl Into<PathBuf>) -> Self {
        let mut job = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            group: String::new(),
            target,
            sequence_file: sequence_file.into(),
            startup: StartupCondition::Asap,
            completion: CompletionCondition::Sequence,
            constraints: JobConstraints::default(),
            steps: PipelineSteps::NONE,
            status: JobStatus::Idle,
            stage: JobStage::Idle,
            state_time: None,
            startup_time: None,
            completion_time: None,
            altitude_at_startup: None,
            altitude_at_completion: None,
            repeats_remaining: 0,
            completed_iterations: 0,
            completed_count: 0,
            sequence_count: 0,
            estimated_duration: None,
            light_frames_required: true,
            in_sequence_focus: false,
            sequence_jobs: Vec::new(),
            duplicate_of: None,
            dirty: false,
            stop_reason: String::new(),
            last_abort_time: None,
            last_error_time: None,
        };
        job.reset();
        job
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_startup(mut self, startup: StartupCondition) -> Self {
        self.startup = startup;
        self
    }

    pub fn with_completion(mut self, completion: CompletionCondition) -> Self {
        self.completion = completion;
        self.repeats_remaining = self.repeats_required();
        self
    }

    pub fn with_constraints(mut self, constraints: JobConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_steps(mut self, steps: PipelineSteps) -> Self {
        self.steps = steps;
        self
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn stage(&self) -> JobStage {
        self.stage
    }

    /// Change the status, returns whether it actually changed
    pub fn set_status(&mut self, status: JobStatus, now: DateTime<Utc>) -> bool {
        if self.status == status {
            return false;
        }
        self.status = status;
        self.state_time = Some(now);
        match status {
            JobStatus::Aborted => self.last_abort_time = Some(now),
            JobStatus::Error => self.last_error_time = Some(now),
            _ => {}
        }
        true
    }

    pub fn set_stage(&mut self, stage: JobStage) -> bool {
        if self.stage == stage {
            return false;
        }
        self.stage = stage;
        true
    }

    pub fn repeats_required(&self) -> u32 {
        match self.completion {
            CompletionCondition::Repeat(n) => n,
            _ => 1,
        }
    }

    pub fn fixed_startup_time(&self) -> Option<DateTime<Utc>> {
        match self.startup {
            StartupCondition::At(time) => Some(time),
            StartupCondition::Asap => None,
        }
    }

    pub fn fixed_completion_time(&self) -> Option<DateTime<Utc>> {
        match self.completion {
            CompletionCondition::Until(time) => Some(time),
            _ => None,
        }
    }

    /// Forget everything learned during previous runs
    pub fn reset(&mut self) {
        self.status = JobStatus::Idle;
        self.stage = JobStage::Idle;
        self.repeats_remaining = self.repeats_required();
        self.completed_iterations = 0;
        self.light_frames_required = true;
        self.stop_reason.clear();
        self.last_abort_time = None;
        self.last_error_time = None;
        self.clear_cache();
    }

    /// Flag an edit and drop the values it invalidates
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.clear_cache();
    }

    /// Drop the values computed by the last evaluation pass
    pub fn clear_cache(&mut self) {
        self.startup_time = None;
        self.completion_time = None;
        self.altitude_at_startup = None;
        self.altitude_at_completion = None;
        self.estimated_duration = None;
    }

    /// Identity of the cohort this job belongs to
    pub fn cohort_root(&self) -> JobId {
        self.duplicate_of.unwrap_or(self.id)
    }

    pub fn is_duplicate_of(&self, other: &Job) -> bool {
        self.id != other.id && self.cohort_root() == other.cohort_root()
    }

    /// Whether both jobs observe the same target with the same sequence
    pub fn shares_work_with(&self, other: &Job) -> bool {
        self.sequence_file == other.sequence_file
            && self.name == other.name
            && self.target.same_position(&other.target)
    }

    /// Reject jobs that cannot be scheduled at all
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| SchedulerError::InvalidJob {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("job has no name"));
        }
        if self.sequence_file.as_os_str().is_empty() {
            return Err(invalid("job has no sequence file"));
        }
        if !self.target.ra_hours.is_finite() || !(0.0..24.0).contains(&self.target.ra_hours) {
            return Err(invalid("right ascension must be within [0, 24) hours"));
        }
        if !self.target.dec_degrees.is_finite() || !(-90.0..=90.0).contains(&self.target.dec_degrees) {
            return Err(invalid("declination must be within [-90, 90] degrees"));
        }
        if let CompletionCondition::Repeat(0) = self.completion {
            return Err(invalid("repeat count must be at least 1"));
        }
        if let (StartupCondition::At(start), CompletionCondition::Until(end)) = (self.startup, self.completion) {
            if end <= start {
                return Err(invalid("completion time is before startup time"));
            }
        }
        Ok(())
    }
}

/// Link every job to the first earlier job it shares work with
pub fn link_duplicates(jobs: &mut [Job]) {
    for i in 0..jobs.len() {
        let root = (0..i)
            .find(|&j| jobs[j].duplicate_of.is_none() && jobs[i].shares_work_with(&jobs[j]))
            .map(|j| jobs[j].id);
        jobs[i].duplicate_of = root;
    }
}
