//! Captured frames bookkeeping
//!
//! Frames already on disk count towards the jobs that need them. Counts are
//! keyed by sequence signature so that several jobs (or several lines of one
//! sequence) writing to the same place share them.

use crate::config::PipelineOverheads;
use crate::job::{CompletionCondition, Job, JobId, JobStatus, PipelineSteps};
use crate::sequence::{FrameType, SequenceJob, SequenceSource};
use crate::subsystems::CaptureMetadata;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Seconds two exposures may differ by and still be the same line
const EXPOSURE_EPSILON: f64 = 1e-3;

/// Frames found on disk, by sequence signature
pub type CapturedFramesMap = BTreeMap<String, u32>;

/// Storage lookup for frames captured in earlier runs
pub trait FrameCounter: Send + Sync {
    fn completed_frames(&self, signature: &str) -> u32;
}

pub type SharedFrameCounter = Arc<dyn FrameCounter>;

/// In-memory frame counter
#[derive(Debug, Default)]
pub struct StaticFrameCounter {
    counts: RwLock<HashMap<String, u32>>,
}

impl StaticFrameCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, signature: impl Into<String>, count: u32) {
        match self.counts.write() {
            Ok(mut counts) => {
                counts.insert(signature.into(), count);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(signature.into(), count);
            }
        }
    }

    pub fn add(&self, signature: &str, count: u32) {
        let current = self.completed_frames(signature);
        self.set(signature, current + count);
    }
}

impl FrameCounter for StaticFrameCounter {
    fn completed_frames(&self, signature: &str) -> u32 {
        match self.counts.read() {
            Ok(counts) => counts.get(signature).copied().unwrap_or(0),
            Err(poisoned) => poisoned.into_inner().get(signature).copied().unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapturedFramesTracker {
    counts: CapturedFramesMap,
}

impl CapturedFramesTracker {
    pub fn counts(&self) -> &CapturedFramesMap {
        &self.counts
    }

    pub fn count(&self, signature: &str) -> u32 {
        self.counts.get(signature).copied().unwrap_or(0)
    }

    pub fn record_frame(&mut self, signature: &str) {
        *self.counts.entry(signature.to_string()).or_insert(0) += 1;
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }

    /// Refresh the frame counts and the sequence cache of every job
    ///
    /// Counts from an earlier pass are reused unless `forced` is set or a job
    /// waits for evaluation. Jobs whose sequence cannot be loaded become
    /// INVALID; their ids are returned so the caller can report them.
    pub fn update(
        &mut self,
        jobs: &mut [Job],
        sequences: &dyn SequenceSource,
        counter: &dyn FrameCounter,
        remember_progress: bool,
        forced: bool,
        now: DateTime<Utc>,
    ) -> Vec<JobId> {
        let forced = forced
            || jobs
                .iter()
                .any(|job| matches!(job.status(), JobStatus::Idle | JobStatus::Evaluation));

        let mut fresh = CapturedFramesMap::new();
        let mut invalid = Vec::new();

        for job in jobs.iter_mut() {
            let queue = match sequences.load_sequence_queue(&job.sequence_file) {
                Ok(queue) => queue,
                Err(e) => {
                    tracing::warn!("Sequence of job '{}' is unavailable: {}", job.name, e);
                    job.set_status(JobStatus::Invalid, now);
                    invalid.push(job.id);
                    continue;
                }
            };
            job.sequence_jobs = queue.jobs;
            job.in_sequence_focus = queue.in_sequence_focus;

            for sub in job.sequence_jobs.iter().filter(|sub| sub.counts_on_client()) {
                let signature = sub.signature();
                if fresh.contains_key(&signature) {
                    continue;
                }
                let count = match self.counts.get(&signature) {
                    Some(&count) if !forced => count,
                    _ => counter.completed_frames(&signature),
                };
                fresh.insert(signature, count);
            }

            update_light_frames_required(job, &fresh, remember_progress);
        }

        for (signature, count) in &fresh {
            tracing::debug!("Captured frames: {} = {}", signature, count);
        }
        self.counts = fresh;
        invalid
    }
}

/// Whether frames of this sequence can be counted from here
pub fn can_count_captures(sequence: &[SequenceJob]) -> bool {
    !sequence.is_empty() && sequence.iter().all(SequenceJob::counts_on_client)
}

/// Decide whether a job still needs light frames
pub fn update_light_frames_required(job: &mut Job, counts: &CapturedFramesMap, remember_progress: bool) {
    let repeats = job.repeats_required();
    let mut lights = job
        .sequence_jobs
        .iter()
        .filter(|sub| sub.frame_type == FrameType::Light)
        .peekable();

    job.light_frames_required = if !remember_progress {
        lights.peek().is_some()
    } else {
        lights.any(|sub| {
            let captured = counts.get(&sub.signature()).copied().unwrap_or(0);
            !sub.counts_on_client() || captured < sub.count.saturating_mul(repeats)
        })
    };
}

/// Signature of the sequence line that produced a frame
///
/// The frame must sit below the line's storage folder (directory, frame type
/// and filter). Among several candidates the deepest folder wins, then a
/// matching exposure, then the first line.
pub fn signature_for_frame(job: &Job, metadata: &CaptureMetadata) -> Option<String> {
    job.sequence_jobs
        .iter()
        .filter(|sub| sub.frame_type == metadata.frame_type)
        .filter(|sub| metadata.filename.starts_with(sub.storage_dir()))
        .min_by_key(|sub| {
            let depth = sub.directory.components().count();
            let other_exposure = (sub.exposure_secs - metadata.exposure).abs() > EXPOSURE_EPSILON;
            (Reverse(depth), other_exposure)
        })
        .map(SequenceJob::signature)
}

/// Estimate how long a job still needs
///
/// `available` holds the frames not yet claimed by jobs earlier in the queue;
/// the frames this job uses are taken out of it. Returns `None` when the job
/// has nothing left to capture. Loop and deadline jobs always need one more
/// pass.
pub fn estimate_job_time(
    job: &mut Job,
    available: &mut CapturedFramesMap,
    remember_progress: bool,
    overheads: &PipelineOverheads,
) -> Option<Duration> {
    let open_ended = matches!(job.completion, CompletionCondition::Loop | CompletionCondition::Until(_));
    let repeats = job.repeats_required();

    let mut total_required: u32 = 0;
    let mut total_completed: u32 = 0;
    let mut remaining_secs = 0.0;
    let mut completed_iterations = repeats;

    for sub in &job.sequence_jobs {
        let required = if open_ended { sub.count } else { sub.count.saturating_mul(repeats) };

        let completed = if remember_progress && !open_ended && sub.counts_on_client() {
            let pool = available.entry(sub.signature()).or_insert(0);
            let taken = (*pool).min(required);
            *pool -= taken;
            taken
        } else {
            0
        };

        if sub.count > 0 {
            completed_iterations = completed_iterations.min(completed / sub.count);
        }

        total_required += required;
        total_completed += completed;
        remaining_secs += (required - completed) as f64 * (sub.exposure_secs + sub.delay_secs);
    }

    job.sequence_count = total_required;
    if remember_progress && !open_ended {
        job.completed_count = total_completed;
        if let CompletionCondition::Repeat(_) = job.completion {
            job.completed_iterations = completed_iterations;
            job.repeats_remaining = repeats - completed_iterations;
        }
    } else if let CompletionCondition::Repeat(_) = job.completion {
        // Without progress tracking only the batches still to run count
        remaining_secs *= job.repeats_remaining as f64 / repeats.max(1) as f64;
    }

    let nothing_left = !open_ended
        && (total_required == 0
            || total_completed >= total_required
            || (job.completion != CompletionCondition::Sequence && job.repeats_remaining == 0));
    if nothing_left {
        job.estimated_duration = Some(Duration::zero());
        return None;
    }

    let mut overhead = 0.0;
    if job.steps.contains(PipelineSteps::TRACK) {
        overhead += overheads.slew_secs;
    }
    if job.steps.contains(PipelineSteps::FOCUS) {
        overhead += overheads.focus_secs;
    }
    if job.steps.contains(PipelineSteps::ALIGN) {
        overhead += overheads.align_secs;
    }
    if job.steps.contains(PipelineSteps::GUIDE) {
        overhead += overheads.guide_secs;
    }

    let estimate = Duration::seconds((remaining_secs + overhead).ceil() as i64);
    job.estimated_duration = Some(estimate);
    Some(estimate)
}
