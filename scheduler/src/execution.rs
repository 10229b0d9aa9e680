//! Pipeline decisions of the job state machine
//!
//! These functions only look at job and scheduler data; issuing the commands
//! is left to the job runner. Keeping them side-effect free makes the
//! transition table testable on its own.

use crate::config::ErrorHandlingStrategy;
use crate::job::{CompletionCondition, Job, JobStage, JobStatus, PipelineSteps};
use crate::state::{FailureCounters, SubsystemKind};
use crate::subsystems::Device;
use chrono::{DateTime, Duration, Utc};

/// Step to start next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NextAction {
    Slew,
    Focus,
    Align,
    Reslew,
    PostAlignFocus,
    Guide,
    Capture,
}

impl NextAction {
    /// Stage the job is in while the action runs
    pub fn stage(self) -> JobStage {
        match self {
            NextAction::Slew => JobStage::Slewing,
            NextAction::Focus => JobStage::Focusing,
            NextAction::Align => JobStage::Aligning,
            NextAction::Reslew => JobStage::Reslewing,
            NextAction::PostAlignFocus => JobStage::PostAlignFocusing,
            NextAction::Guide => JobStage::Guiding,
            NextAction::Capture => JobStage::Capturing,
        }
    }
}

/// Facts about the current run that influence the next step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineContext {
    pub autofocus_completed: bool,
    pub guiding_active: bool,
    pub light_frames_required: bool,
    pub in_sequence_focus: bool,
}

/// Next pipeline step after `stage`, `None` while a step is in progress
pub fn next_action(stage: JobStage, steps: PipelineSteps, ctx: &PipelineContext) -> Option<NextAction> {
    let focus = steps.contains(PipelineSteps::FOCUS) && !ctx.autofocus_completed;
    let align = steps.contains(PipelineSteps::ALIGN);
    let guide = steps.contains(PipelineSteps::GUIDE);

    let action = match stage {
        JobStage::Idle if !ctx.light_frames_required => NextAction::Capture,
        JobStage::Idle => {
            if steps.contains(PipelineSteps::TRACK) {
                NextAction::Slew
            } else if focus {
                NextAction::Focus
            } else if align {
                NextAction::Align
            } else if guide && !ctx.guiding_active {
                NextAction::Guide
            } else {
                NextAction::Capture
            }
        }
        JobStage::SlewComplete => {
            if focus {
                NextAction::Focus
            } else if align {
                NextAction::Align
            } else if guide {
                NextAction::Guide
            } else {
                NextAction::Capture
            }
        }
        JobStage::FocusComplete => {
            if align {
                NextAction::Align
            } else if guide {
                NextAction::Guide
            } else {
                NextAction::Capture
            }
        }
        JobStage::AlignComplete => NextAction::Reslew,
        JobStage::ReslewingComplete => {
            if steps.contains(PipelineSteps::FOCUS) && ctx.in_sequence_focus {
                NextAction::PostAlignFocus
            } else if guide {
                NextAction::Guide
            } else {
                NextAction::Capture
            }
        }
        JobStage::PostAlignFocusingComplete => {
            if guide {
                NextAction::Guide
            } else {
                NextAction::Capture
            }
        }
        JobStage::GuidingComplete => NextAction::Capture,
        JobStage::Slewing
        | JobStage::Focusing
        | JobStage::Aligning
        | JobStage::Reslewing
        | JobStage::PostAlignFocusing
        | JobStage::Guiding
        | JobStage::Capturing
        | JobStage::Complete => return None,
    };
    Some(action)
}

/// Where a repeating job picks up again after an intermediate evaluation
pub fn repeat_restart_action(steps: PipelineSteps, force_alignment: bool) -> NextAction {
    if steps.contains(PipelineSteps::ALIGN) && force_alignment {
        NextAction::Align
    } else if steps.contains(PipelineSteps::GUIDE) {
        NextAction::Capture
    } else if steps.contains(PipelineSteps::ALIGN) {
        NextAction::Align
    } else if steps.contains(PipelineSteps::TRACK) {
        NextAction::Slew
    } else {
        NextAction::Capture
    }
}

/// Where a looping job picks up again
pub fn loop_restart_action(steps: PipelineSteps, force_alignment: bool) -> NextAction {
    if steps.contains(PipelineSteps::ALIGN) && force_alignment {
        NextAction::Align
    } else {
        NextAction::Capture
    }
}

/// Subsystem in charge of a stage, for the watchdog
pub fn watchdog_kind(stage: JobStage) -> Option<SubsystemKind> {
    match stage {
        JobStage::Focusing | JobStage::PostAlignFocusing => Some(SubsystemKind::Focus),
        JobStage::Aligning => Some(SubsystemKind::Align),
        JobStage::Guiding => Some(SubsystemKind::Guide),
        JobStage::Capturing => Some(SubsystemKind::Capture),
        _ => None,
    }
}

/// Device to abort to interrupt a stage
pub fn abort_target(stage: JobStage) -> Option<Device> {
    match stage {
        JobStage::Slewing | JobStage::Reslewing => Some(Device::Mount),
        JobStage::Focusing | JobStage::PostAlignFocusing => Some(Device::Focus),
        JobStage::Aligning => Some(Device::Align),
        JobStage::Capturing => Some(Device::Capture),
        _ => None,
    }
}

/// What a status poll of the stage owner returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsystemPoll {
    Idle,
    Busy,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Still working, wait another period
    Rearm,
    /// Went idle silently, issue the start command again
    Restart,
    /// Retry budget exhausted
    Abort,
    /// Owner vanished
    ConnectionLost,
}

/// Inactivity timer of the running stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageWatchdog {
    pub kind: SubsystemKind,
    pub armed_at: DateTime<Utc>,
    pub timeout: Duration,
}

impl StageWatchdog {
    pub fn arm(kind: SubsystemKind, now: DateTime<Utc>, timeout: Duration) -> Self {
        Self {
            kind,
            armed_at: now,
            timeout,
        }
    }

    pub fn rearm(&mut self, now: DateTime<Utc>) {
        self.armed_at = now;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.armed_at > self.timeout
    }

    /// Decide what to do once the timer expired
    pub fn verdict(&self, poll: SubsystemPoll, failures: &mut FailureCounters, max_attempts: u32) -> WatchdogVerdict {
        match poll {
            SubsystemPoll::Busy => WatchdogVerdict::Rearm,
            SubsystemPoll::Lost => WatchdogVerdict::ConnectionLost,
            SubsystemPoll::Idle => {
                if failures.increase(self.kind, max_attempts) {
                    WatchdogVerdict::Restart
                } else {
                    WatchdogVerdict::Abort
                }
            }
        }
    }
}

/// Branch of the job termination handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationDecision {
    /// Job ended in ERROR or ABORTED
    Failed { restart: bool },
    /// Job went back to IDLE because its constraints broke
    Interrupted,
    SequenceDone,
    /// Last batch of a repeating job, or close to it
    RepeatFinal,
    /// Loop, or more than one batch left
    RepeatAgain,
    DeadlineReached,
    BeforeDeadline,
    /// No branch matches the job
    Inconsistent,
}

pub fn termination_decision(
    job: &Job,
    now: DateTime<Utc>,
    strategy: ErrorHandlingStrategy,
    reschedule_errors: bool,
) -> TerminationDecision {
    match job.status() {
        JobStatus::Aborted => TerminationDecision::Failed {
            restart: strategy == ErrorHandlingStrategy::RestartImmediately,
        },
        JobStatus::Error => TerminationDecision::Failed {
            restart: strategy == ErrorHandlingStrategy::RestartImmediately && reschedule_errors,
        },
        JobStatus::Idle => TerminationDecision::Interrupted,
        JobStatus::Complete => match job.completion {
            CompletionCondition::Sequence => TerminationDecision::SequenceDone,
            CompletionCondition::Repeat(_) if job.repeats_remaining <= 1 => TerminationDecision::RepeatFinal,
            CompletionCondition::Repeat(_) | CompletionCondition::Loop => TerminationDecision::RepeatAgain,
            CompletionCondition::Until(end) if now >= end => TerminationDecision::DeadlineReached,
            CompletionCondition::Until(_) => TerminationDecision::BeforeDeadline,
        },
        _ => TerminationDecision::Inconsistent,
    }
}
