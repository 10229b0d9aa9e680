//! Scheduler control loop
//!
//! [`Scheduler`] owns the job queue and all runtime state. It never spawns
//! anything on its own: a caller (usually [`crate::driver`]) invokes
//! [`Scheduler::run_iteration`] whenever the delay it returned has elapsed,
//! and forwards subsystem notifications through [`Scheduler::handle_event`].
//!
//! One iteration runs exactly one handler, chosen by the [`TimerState`] the
//! previous handler selected:
//!
//! - `Wakeup`: leave a sleep or a preemptive shutdown
//! - `Scheduler`: evaluate the queue and start the selected job
//! - `JobCheck`: re-validate the running job and advance its pipeline
//! - `Shutdown`: step the shutdown procedure

mod align_check;
mod job_runner;
mod process;

use crate::captured_frames::{estimate_job_time, SharedFrameCounter};
use crate::clock::SharedClock;
use crate::config::{ErrorHandlingStrategy, SchedulerConfig, SequenceRepeat};
use crate::constraints::ConstraintEvaluator;
use crate::error::{Result, SchedulerError};
use crate::events::{EventBus, SchedulerEvent};
use crate::greedy::{GreedyParams, GreedyScheduler};
use crate::job::{link_duplicates, CompletionCondition, Job, JobId, JobStage, JobStatus, PipelineSteps};
use crate::queue_file::PersistenceStore;
use crate::sequence::SequenceSource;
use crate::state::{ParkWaitState, SchedulerRunState, SchedulerState, ShutdownState, StartupState, TimerState};
use crate::subsystems::{SharedObservatoryOps, SubsystemEvent};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Delay before the first iteration after [`Scheduler::start`]
const START_DELAY: Duration = Duration::from_millis(10);

pub struct Scheduler {
    state: SchedulerState,
    config: SchedulerConfig,
    ops: SharedObservatoryOps,
    sequences: Arc<dyn SequenceSource>,
    frame_counter: SharedFrameCounter,
    clock: SharedClock,
    greedy: GreedyScheduler,
    evaluator: ConstraintEvaluator,
    events: EventBus,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        ops: SharedObservatoryOps,
        sequences: Arc<dyn SequenceSource>,
        frame_counter: SharedFrameCounter,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: SchedulerState::new(),
            greedy: GreedyScheduler::new(GreedyParams::from_config(&config)),
            evaluator: ConstraintEvaluator::from_config(&config),
            config,
            ops,
            sequences,
            frame_counter,
            clock,
            events: EventBus::new(),
        })
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn run_state(&self) -> SchedulerRunState {
        self.state.run_state
    }

    pub fn timer_state(&self) -> TimerState {
        self.state.timer_state
    }

    pub fn jobs(&self) -> &[Job] {
        &self.state.jobs
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.state.job(id)
    }

    pub fn active_job(&self) -> Option<&Job> {
        self.state.active_job()
    }

    pub fn evaluator(&self) -> &ConstraintEvaluator {
        &self.evaluator
    }

    /// Delay until the pending iteration, `None` when the loop is stopped
    pub fn pending_interval(&self) -> Option<Duration> {
        match self.state.timer_state {
            TimerState::Nothing => None,
            _ => Some(self.state.timer_interval.unwrap_or_else(|| self.config.update_period())),
        }
    }

    /// Replace the configuration; only allowed while idle
    pub fn set_config(&mut self, config: SchedulerConfig) -> Result<()> {
        self.ensure_idle("cannot change the configuration while running")?;
        config.validate()?;
        self.greedy = GreedyScheduler::new(GreedyParams::from_config(&config));
        self.evaluator = ConstraintEvaluator::from_config(&config);
        self.config = config;
        Ok(())
    }

    // =========================================================================
    // QUEUE EDITING
    // =========================================================================

    pub fn add_job(&mut self, mut job: Job) -> Result<JobId> {
        self.ensure_idle("cannot add a job while running")?;
        job.validate()?;
        job.reset();
        job.mark_dirty();

        let id = job.id;
        tracing::info!("Adding job '{}' ({}) to the queue", job.name, id);
        self.state.jobs.push(job);
        link_duplicates(&mut self.state.jobs);
        self.events.emit(SchedulerEvent::JobsUpdated);
        Ok(id)
    }

    pub fn remove_job(&mut self, id: JobId) -> Result<Job> {
        self.ensure_idle("cannot remove a job while running")?;
        let index = self.job_index(id)?;

        let job = self.state.jobs.remove(index);
        link_duplicates(&mut self.state.jobs);
        self.state.queue_dirty = true;
        tracing::info!("Removed job '{}' from the queue", job.name);
        self.events.emit(SchedulerEvent::JobsUpdated);
        Ok(job)
    }

    /// Apply `edit` to a queued job
    ///
    /// The edited job must still validate. It goes back to IDLE and its
    /// cohort links are rebuilt, since the edit may change what it shares
    /// with other jobs.
    pub fn edit_job(&mut self, id: JobId, edit: impl FnOnce(&mut Job)) -> Result<()> {
        self.ensure_idle("cannot edit a job while running")?;
        let index = self.job_index(id)?;

        let mut job = self.state.jobs[index].clone();
        edit(&mut job);
        job.id = id;
        job.validate()?;
        job.reset();
        job.mark_dirty();

        tracing::info!("Edited job '{}'", job.name);
        self.state.jobs[index] = job;
        link_duplicates(&mut self.state.jobs);
        self.events.emit(SchedulerEvent::JobsUpdated);
        Ok(())
    }

    /// Move a job to `index`, clamped to the end of the queue
    ///
    /// Returns false when the queue order did not change.
    pub fn move_job(&mut self, id: JobId, index: usize) -> Result<bool> {
        self.ensure_idle("cannot reorder the queue while running")?;
        let from = self.job_index(id)?;
        let to = index.min(self.state.jobs.len() - 1);
        if from == to {
            return Ok(false);
        }

        let job = self.state.jobs.remove(from);
        self.state.jobs.insert(to, job);
        self.queue_reordered();
        self.evaluate_jobs(true);
        Ok(true)
    }

    /// Put `order` first, keeping the remaining jobs in their current order
    ///
    /// Unknown ids are ignored. Returns false when the queue order did not
    /// change.
    pub fn reorder_jobs(&mut self, order: &[JobId]) -> Result<bool> {
        self.ensure_idle("cannot reorder the queue while running")?;
        let mut remaining = std::mem::take(&mut self.state.jobs);
        let before: Vec<JobId> = remaining.iter().map(|job| job.id).collect();

        let mut reordered = Vec::with_capacity(remaining.len());
        for id in order {
            if let Some(position) = remaining.iter().position(|job| job.id == *id) {
                reordered.push(remaining.remove(position));
            }
        }
        reordered.append(&mut remaining);
        self.state.jobs = reordered;

        if self.state.jobs.iter().map(|job| job.id).eq(before) {
            return Ok(false);
        }
        self.queue_reordered();
        Ok(true)
    }

    /// Sort the queue by decreasing altitude, the first job staying in place
    ///
    /// Altitudes are taken at the startup time of the first job, or now when
    /// it has none. Jobs of equal altitude keep their relative order. When
    /// the order changes, every job is reset and the queue re-evaluated.
    pub fn sort_jobs_per_altitude(&mut self) -> Result<bool> {
        self.ensure_idle("cannot reorder the queue while running")?;
        let Some(first) = self.state.jobs.first() else {
            return Ok(false);
        };

        let reference = first.startup_time.unwrap_or_else(|| self.now());
        let mut rest: Vec<(f64, JobId)> = self.state.jobs[1..]
            .iter()
            .map(|job| (self.evaluator.altitude(&job.target, reference).degrees, job.id))
            .collect();
        rest.sort_by(|a, b| match (a.0.is_nan(), b.0.is_nan()) {
            (false, false) => b.0.total_cmp(&a.0),
            (nan_a, nan_b) => nan_a.cmp(&nan_b),
        });

        let order: Vec<JobId> = std::iter::once(first.id).chain(rest.into_iter().map(|(_, id)| id)).collect();
        if !self.reorder_jobs(&order)? {
            return Ok(false);
        }

        for job in &mut self.state.jobs {
            job.reset();
        }
        self.append_log_text("Jobs sorted per altitude.");
        self.evaluate_jobs(true);
        Ok(true)
    }

    pub fn clear_queue(&mut self) -> Result<()> {
        self.ensure_idle("cannot clear the queue while running")?;
        self.state.queue_dirty |= !self.state.jobs.is_empty();
        self.state.jobs.clear();
        self.state.active_job = None;
        self.state.frames.clear();
        self.events.emit(SchedulerEvent::JobsUpdated);
        Ok(())
    }

    /// Replace the queue with the one held by `store`
    pub fn load_queue(&mut self, store: &dyn PersistenceStore) -> Result<usize> {
        self.ensure_idle("cannot load a queue while running")?;
        self.set_run_state(SchedulerRunState::Loading);

        let loaded = store.load_jobs();
        self.set_run_state(SchedulerRunState::Idle);
        let jobs = loaded?;

        for job in &jobs {
            job.validate()?;
        }
        let count = jobs.len();
        self.state.jobs = jobs;
        self.state.queue_dirty = false;
        self.state.active_job = None;
        self.state.frames.clear();
        link_duplicates(&mut self.state.jobs);

        self.append_log_text(format!("Loaded {} jobs into the scheduler queue.", count));
        self.events.emit(SchedulerEvent::JobsUpdated);
        Ok(count)
    }

    /// Write the queue to `store`; nothing is written when it has no changes
    ///
    /// Returns whether the store was written.
    pub fn save_queue(&mut self, store: &dyn PersistenceStore) -> Result<bool> {
        if !self.has_unsaved_changes() {
            return Ok(false);
        }
        store.save_jobs(&self.state.jobs)?;
        for job in &mut self.state.jobs {
            job.dirty = false;
        }
        self.state.queue_dirty = false;
        tracing::info!("Saved {} jobs", self.state.jobs.len());
        Ok(true)
    }

    /// Whether the queue changed since it was last loaded or saved
    pub fn has_unsaved_changes(&self) -> bool {
        self.state.queue_dirty || self.state.jobs.iter().any(|job| job.dirty)
    }

    fn job_index(&self, id: JobId) -> Result<usize> {
        self.state
            .jobs
            .iter()
            .position(|job| job.id == id)
            .ok_or(SchedulerError::JobNotFound(id))
    }

    fn queue_reordered(&mut self) {
        link_duplicates(&mut self.state.jobs);
        self.state.queue_dirty = true;
        self.events.emit(SchedulerEvent::JobsUpdated);
    }

    fn ensure_idle(&self, reason: &str) -> Result<()> {
        match self.state.run_state {
            SchedulerRunState::Idle | SchedulerRunState::Aborted => Ok(()),
            _ => Err(SchedulerError::Busy(reason.to_string())),
        }
    }

    // =========================================================================
    // CONTROL
    // =========================================================================

    /// Start the scheduler, or resume it when paused
    pub fn start(&mut self) -> Result<()> {
        match self.state.run_state {
            SchedulerRunState::Idle | SchedulerRunState::Aborted => {}
            SchedulerRunState::Paused => return self.execute(),
            _ => return Ok(()),
        }

        self.validate_scripts()?;

        let now = self.now();
        for job in &mut self.state.jobs {
            job.set_stage(JobStage::Idle);
            job.set_status(JobStatus::Idle, now);
        }
        self.state.sequence_execution_counter = 1;
        self.state.autofocus_completed = false;
        self.state.capture_batch = 0;

        // The first wake-up goes through `execute`, exactly like waking from
        // a preemptive shutdown
        self.state.preemptive_shutdown_wakeup = Some(now);
        self.setup_after(TimerState::Wakeup, START_DELAY);
        self.events.emit(SchedulerEvent::JobsUpdated);
        Ok(())
    }

    /// Switch to running, validating the procedure scripts first
    pub fn execute(&mut self) -> Result<()> {
        match self.state.run_state {
            SchedulerRunState::Idle | SchedulerRunState::Aborted => {
                self.validate_scripts()?;
                self.set_run_state(SchedulerRunState::Running);
                self.setup(TimerState::Scheduler);
                tracing::info!("Scheduler is starting...");
                self.append_log_text("Scheduler started.");
            }
            SchedulerRunState::Paused => {
                self.set_run_state(SchedulerRunState::Running);
                self.setup(TimerState::Scheduler);
                self.append_log_text("Scheduler resuming.");
            }
            _ => {}
        }
        Ok(())
    }

    /// Plan a pause; it takes effect once the active job is not busy anymore
    pub fn pause(&mut self) {
        if self.state.run_state != SchedulerRunState::Running {
            return;
        }
        self.set_run_state(SchedulerRunState::Paused);
        self.append_log_text("Scheduler pause planned...");
    }

    pub(crate) fn set_paused(&mut self) {
        self.setup(TimerState::Nothing);
        self.append_log_text("Scheduler paused.");
    }

    /// Stop on user request, cancelling any pending preemptive wake-up
    pub async fn stop(&mut self) {
        self.state.preemptive_shutdown_wakeup = None;
        if self.state.run_state == SchedulerRunState::Idle {
            if self.state.timer_state != TimerState::Nothing {
                self.setup(TimerState::Nothing);
                self.append_log_text("Scheduler wake-up cancelled.");
            }
            return;
        }
        self.stop_scheduler().await;
    }

    /// Bring the scheduler back to idle, or to sleep under preemptive shutdown
    pub(crate) async fn stop_scheduler(&mut self) {
        if self.state.run_state == SchedulerRunState::Idle {
            return;
        }
        tracing::info!("Scheduler is stopping...");
        let preemptive = self.state.preemptive_shutdown_wakeup;

        if preemptive.is_none() {
            self.stop_current_job_action().await;

            let now = self.now();
            let mut aborted = Vec::new();
            for job in &mut self.state.jobs {
                if job.status() <= JobStatus::Busy && job.set_status(JobStatus::Aborted, now) {
                    aborted.push((job.id, job.name.clone()));
                }
            }
            for (id, name) in aborted {
                self.append_log_text(format!(
                    "Job '{}' has not been processed upon scheduler stop, marking aborted.",
                    name
                ));
                self.events.emit(SchedulerEvent::JobStatusChanged {
                    id,
                    name,
                    status: JobStatus::Aborted,
                });
            }
        }

        self.setup(TimerState::Nothing);
        self.set_run_state(SchedulerRunState::Idle);
        self.state.park_wait_state = ParkWaitState::Idle;

        // An interrupted or preempted startup runs again in full, a completed
        // one only replays its unpark phase
        self.state.startup_state = match self.state.startup_state {
            StartupState::Complete if preemptive.is_none() => {
                let procedures = &self.config.procedures;
                if procedures.unpark_dome {
                    StartupState::UnparkDome
                } else if procedures.unpark_mount {
                    StartupState::UnparkMount
                } else if procedures.open_cap {
                    StartupState::UnparkCap
                } else {
                    StartupState::Complete
                }
            }
            _ => StartupState::Idle,
        };

        self.state.shutdown_state = ShutdownState::Idle;
        self.set_active_job(None);
        self.state.failures.reset();
        self.state.autofocus_completed = false;
        self.state.watchdog = None;
        self.state.solver_pending = false;

        if let Some(wakeup) = preemptive {
            let delay = to_std(wakeup - self.now()) + Duration::from_secs(1);
            self.setup_after(TimerState::Wakeup, delay);
            self.append_log_text(format!("Scheduler is sleeping until {}.", wakeup.to_rfc3339()));
            return;
        }

        if let Err(e) = self.ops.set_capture_target_name(None).await {
            tracing::warn!("Failed to clear the capture target name: {}", e);
        }
        self.events.emit(SchedulerEvent::JobsUpdated);
    }

    fn validate_scripts(&mut self) -> Result<()> {
        let procedures = &self.config.procedures;
        if let Some(script) = procedures.startup_script.as_deref().filter(|p| !script_is_valid(p)) {
            let error = SchedulerError::InvalidStartupScript(script.to_path_buf());
            self.append_log_text(format!("Warning: {}", error));
            return Err(error);
        }
        if let Some(script) = procedures.shutdown_script.as_deref().filter(|p| !script_is_valid(p)) {
            let error = SchedulerError::InvalidShutdownScript(script.to_path_buf());
            self.append_log_text(format!("Warning: {}", error));
            return Err(error);
        }
        Ok(())
    }

    // =========================================================================
    // ITERATION LOOP
    // =========================================================================

    /// Run the handler selected by the previous iteration
    ///
    /// Returns the delay before the next iteration, or `None` once the loop
    /// has nothing left to do. A handler that does not select its successor
    /// gets the same phase again after the update period.
    pub async fn run_iteration(&mut self) -> Option<Duration> {
        self.state.iteration_setup = false;

        match self.state.timer_state {
            TimerState::Wakeup => self.wake_up_scheduler().await,
            TimerState::Scheduler => {
                self.check_status().await;
            }
            TimerState::JobCheck => self.check_job_stage().await,
            TimerState::Shutdown => {
                self.check_shutdown_state().await;
            }
            TimerState::Nothing => return None,
        }

        if !self.state.iteration_setup {
            let state = self.state.timer_state;
            self.setup(state);
        }
        self.pending_interval()
    }

    async fn wake_up_scheduler(&mut self) {
        if self.state.preemptive_shutdown_wakeup.take().is_some() {
            self.append_log_text("Scheduler is awake.");
            if self.execute().is_err() {
                self.setup(TimerState::Nothing);
            }
        } else {
            if self.state.run_state == SchedulerRunState::Running {
                self.append_log_text("Scheduler is awake. Jobs shall be started when ready...");
            } else {
                self.append_log_text("Scheduler is awake. Jobs shall be started when scheduler is resumed.");
            }
            self.setup(TimerState::Scheduler);
        }
    }

    /// Returns false when the caller must not go on with the active job
    pub(crate) async fn check_status(&mut self) -> bool {
        if self.state.run_state == SchedulerRunState::Paused {
            match self.state.active_job().map(Job::status) {
                None => {
                    self.set_paused();
                    return false;
                }
                Some(JobStatus::Busy) | Some(JobStatus::Complete) => {}
                Some(_) => self.set_paused(),
            }
        }

        let Some(active) = self.state.active_job else {
            return self.check_status_without_job().await;
        };

        if self.should_scheduler_sleep(active).await {
            return true;
        }

        if self.state.startup_state == StartupState::Error {
            self.stop_scheduler().await;
            self.set_run_state(SchedulerRunState::Aborted);
            return true;
        }

        if (self.state.startup_state == StartupState::Idle && !self.check_startup_state().await)
            || self.state.startup_state == StartupState::Script
        {
            return false;
        }

        let due = self.is_due(active);
        if !self.check_park_wait_state(due).await {
            return false;
        }

        if self.state.startup_state > StartupState::Script
            && self.state.startup_state < StartupState::Error
            && !self.check_startup_state().await
        {
            return false;
        }

        // A job that ended while paused still needs its termination handling
        if matches!(
            self.state.active_job().map(Job::status),
            Some(JobStatus::Complete | JobStatus::Error | JobStatus::Aborted | JobStatus::Idle)
        ) {
            self.find_next_job().await;
        }

        if let Some(active) = self.state.active_job {
            self.execute_job(active).await;
        }
        true
    }

    async fn check_status_without_job(&mut self) -> bool {
        match self.state.shutdown_state {
            ShutdownState::Complete | ShutdownState::Error => return self.complete_shutdown().await,
            ShutdownState::Idle => {}
            _ => {
                self.check_shutdown_state().await;
                return false;
            }
        }

        if !self.check_park_wait_state(false).await {
            return false;
        }

        self.evaluate_jobs(false);

        if self.state.active_job.is_none() && self.check_repeat_sequence() {
            self.reset_jobs();
            self.evaluate_jobs(false);
            if self.state.active_job.is_some() {
                self.state.sequence_execution_counter += 1;
                let counter = self.state.sequence_execution_counter;
                self.append_log_text(format!("Starting job sequence iteration #{}", counter));
                return true;
            }
        }

        if self.state.active_job.is_none() {
            self.check_shutdown_state().await;
            return false;
        }
        true
    }

    // =========================================================================
    // EVALUATION
    // =========================================================================

    /// Re-evaluate every job; selects the next active job unless `evaluate_only`
    pub fn evaluate_jobs(&mut self, evaluate_only: bool) {
        for job in &mut self.state.jobs {
            job.clear_cache();
        }
        if self.state.jobs.is_empty() {
            return;
        }

        let before = self.job_statuses();
        self.update_completed_jobs_count(false);

        let now = self.now();
        self.state.night = self.evaluator.night_window(now);
        self.greedy.set_weather(self.state.weather_status);
        let lines = self
            .greedy
            .schedule_jobs(&mut self.state.jobs, now, self.state.frames.counts(), &self.evaluator);
        for line in lines {
            self.append_log_text(line);
        }
        self.publish_status_changes(&before);

        if !evaluate_only && self.state.run_state == SchedulerRunState::Running {
            self.select_active_job();
        }
        self.events.emit(SchedulerEvent::JobsUpdated);
    }

    fn select_active_job(&mut self) {
        let restartable = self.config.error_handling.strategy != ErrorHandlingStrategy::DontRestart;

        // Aborted jobs only count as pending when they may be restarted
        let nothing_pending = self.state.jobs.iter().all(|job| match job.status() {
            JobStatus::Scheduled => false,
            JobStatus::Aborted => !restartable,
            _ => true,
        });
        if nothing_pending {
            self.append_log_text("No jobs left in the scheduler queue after evaluating.");
            self.set_active_job(None);
            return;
        }

        if restartable && self.state.jobs.iter().all(|job| job.status() >= JobStatus::Error) {
            self.append_log_text("Only aborted jobs left in the scheduler queue after evaluating, rescheduling those.");
            let aborted: Vec<JobId> = self
                .state
                .jobs
                .iter()
                .filter(|job| job.status() == JobStatus::Aborted)
                .map(|job| job.id)
                .collect();
            for id in aborted {
                self.set_job_status(id, JobStatus::Evaluation);
            }
            return;
        }

        match self.greedy.scheduled_job() {
            Some(id) => self.set_active_job(Some(id)),
            None => {
                self.append_log_text("No jobs scheduled.");
                self.set_active_job(None);
            }
        }
    }

    /// Evaluate the queue without starting anything, for display
    pub fn start_job_evaluation(&mut self) {
        if self.state.run_state != SchedulerRunState::Running {
            self.reset_jobs();
        }
        self.state.sequence_execution_counter = 1;
        self.evaluate_jobs(true);
    }

    /// Put every job back to IDLE and forget the captured frames
    pub fn reset_jobs(&mut self) {
        self.set_active_job(None);
        for job in &mut self.state.jobs {
            job.reset();
            job.completed_count = 0;
        }
        self.update_completed_jobs_count(true);
    }

    fn check_repeat_sequence(&self) -> bool {
        match self.config.repeat_sequence {
            SequenceRepeat::Once => false,
            SequenceRepeat::Forever => true,
            SequenceRepeat::Times(limit) => self.state.sequence_execution_counter < limit,
        }
    }

    /// Refresh the captured frame counts and the job sequences
    fn update_completed_jobs_count(&mut self, forced: bool) {
        let now = self.now();
        let before = self.job_statuses();
        self.state.frames.update(
            &mut self.state.jobs,
            self.sequences.as_ref(),
            self.frame_counter.as_ref(),
            self.config.remember_job_progress,
            forced,
            now,
        );

        for (id, status) in before {
            let Some(job) = self.state.job(id) else { continue };
            if status != JobStatus::Invalid && job.status() == JobStatus::Invalid {
                let message = format!("Warning: job '{}' has an inaccessible sequence file, marking invalid.", job.name);
                self.append_log_text(message);
            }
        }
    }

    /// Re-estimate every job from the current frame counts
    fn refresh_estimates(&mut self) {
        let mut available = self.state.frames.counts().clone();
        let overheads = self.config.planning.overheads.clone();
        for job in &mut self.state.jobs {
            estimate_job_time(job, &mut available, self.config.remember_job_progress, &overheads);
        }
    }

    // =========================================================================
    // JOB EXECUTION
    // =========================================================================

    /// Make `id` the active job and start it if it is due
    pub(crate) async fn execute_job(&mut self, id: JobId) -> bool {
        let Some(status) = self.state.job(id).map(Job::status) else {
            return false;
        };
        if self.state.active_job == Some(id) && status == JobStatus::Busy {
            return false;
        }

        self.set_active_job(Some(id));

        if self.should_scheduler_sleep(id).await {
            return false;
        }
        if !self.is_due(id) {
            return false;
        }

        let Some(job) = self.state.job(id) else {
            return false;
        };
        let name = job.name.clone();
        if job.completion == CompletionCondition::Sequence && self.config.remember_job_progress {
            if let Err(e) = self.ops.set_capture_target_name(Some(&name)).await {
                tracing::warn!("Failed to set the capture target name: {}", e);
            }
        }

        let now = self.now();
        self.state.night = self.evaluator.night_window(now);
        self.state.autofocus_completed = false;

        tracing::info!("Executing job '{}'", name);
        self.set_job_status(id, JobStatus::Busy);
        self.events.emit(SchedulerEvent::JobsUpdated);

        self.setup(TimerState::JobCheck);
        true
    }

    /// Decide whether to wait, park or shut down until `id` is due
    async fn should_scheduler_sleep(&mut self, id: JobId) -> bool {
        let now = self.now();
        let Some(job) = self.state.job(id) else {
            return false;
        };
        if !job.light_frames_required {
            return false;
        }
        let Some(startup) = job.startup_time else {
            return false;
        };
        if self.greedy.scheduled_job() != Some(id) {
            return false;
        }

        let until_start = startup - now;
        let lead_time = self.config.lead_time();
        let name = job.name.clone();
        let tracks = job.steps.contains(PipelineSteps::TRACK);
        let startup_complete = self.state.startup_state == StartupState::Complete;

        if startup_complete && self.config.preemptive_shutdown && until_start > self.config.preemptive_shutdown_delay() {
            self.append_log_text(format!(
                "Job '{}' scheduled for execution at {}. Observatory scheduled for shutdown until next job is ready.",
                name,
                startup.to_rfc3339()
            ));
            self.state.preemptive_shutdown_wakeup = Some(startup);
            self.check_shutdown_state().await;
            return true;
        }

        if until_start > lead_time
            && startup_complete
            && self.state.park_wait_state == ParkWaitState::Idle
            && tracks
            && self.config.procedures.park_mount_while_waiting
        {
            self.append_log_text(format!(
                "Job '{}' scheduled for execution at {}. Parking the mount until the job is ready.",
                name,
                startup.to_rfc3339()
            ));
            self.state.park_wait_state = ParkWaitState::Park;
            return false;
        }

        if until_start > lead_time {
            self.append_log_text(format!(
                "Sleeping until observation job {} is ready at {}...",
                name,
                (startup + chrono::Duration::seconds(1)).to_rfc3339()
            ));

            if until_start > lead_time * 12 && !self.config.preemptive_shutdown {
                self.append_log_text(format!(
                    "Warning: Job '{}' is {:.1} hours away from now, you may want to enable Preemptive Shutdown.",
                    name,
                    until_start.num_seconds() as f64 / 3600.0
                ));
            }

            self.setup_after(TimerState::Wakeup, to_std(until_start) + Duration::from_secs(1));
            return true;
        }
        false
    }

    /// Whether the startup time of `id` has come
    fn is_due(&self, id: JobId) -> bool {
        let now = self.now();
        self.state
            .job(id)
            .and_then(|job| job.startup_time)
            .map_or(true, |startup| startup <= now)
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Process a notification coming back from a subsystem
    pub async fn handle_event(&mut self, event: SubsystemEvent) {
        match event {
            SubsystemEvent::CaptureStatus(status) => self.on_capture_status(status).await,
            SubsystemEvent::CaptureComplete(metadata) => self.on_capture_complete(&metadata).await,
            SubsystemEvent::FocusStatus(status) => self.on_focus_status(status).await,
            SubsystemEvent::AlignStatus(status) => self.on_align_status(status).await,
            SubsystemEvent::GuideStatus(status) => self.on_guide_status(status).await,
            SubsystemEvent::MountStatus(status) => self.on_mount_status(status).await,
            SubsystemEvent::WeatherStatus(status) => self.on_weather_status(status).await,
            SubsystemEvent::SolverDone(outcome) => self.on_solver_done(&outcome).await,
            SubsystemEvent::ScriptFinished { exit_code } => self.on_script_finished(exit_code),
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Log a user-facing message and publish it
    pub(crate) fn append_log_text(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.events.emit(SchedulerEvent::Log { message });
    }

    pub(crate) fn set_run_state(&mut self, run_state: SchedulerRunState) {
        if self.state.run_state != run_state {
            self.state.run_state = run_state;
            self.events.emit(SchedulerEvent::StatusChanged(run_state));
        }
    }

    /// Schedule `state` after the update period
    pub(crate) fn setup(&mut self, state: TimerState) {
        let period = self.config.update_period();
        self.state.setup_next_iteration(state, period);
    }

    pub(crate) fn setup_after(&mut self, state: TimerState, delay: Duration) {
        self.state.setup_next_iteration(state, delay);
    }

    pub(crate) fn set_active_job(&mut self, id: Option<JobId>) {
        if self.state.active_job != id {
            self.state.capture_batch = 0;
            self.state.frames_since_align_check = 0;
        }
        self.state.active_job = id;
    }

    pub(crate) fn set_job_status(&mut self, id: JobId, status: JobStatus) {
        let now = self.now();
        let Some(job) = self.state.job_mut(id) else { return };
        if job.set_status(status, now) {
            let name = job.name.clone();
            self.events.emit(SchedulerEvent::JobStatusChanged { id, name, status });
        }
    }

    fn job_statuses(&self) -> Vec<(JobId, JobStatus)> {
        self.state.jobs.iter().map(|job| (job.id, job.status())).collect()
    }

    fn publish_status_changes(&self, before: &[(JobId, JobStatus)]) {
        for job in &self.state.jobs {
            let previous = before.iter().find(|(id, _)| *id == job.id).map(|(_, status)| *status);
            if previous != Some(job.status()) {
                self.events.emit(SchedulerEvent::JobStatusChanged {
                    id: job.id,
                    name: job.name.clone(),
                    status: job.status(),
                });
            }
        }
    }
}

fn script_is_valid(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.exists()
}

/// Negative durations clamp to zero
pub(crate) fn to_std(duration: chrono::Duration) -> Duration {
    duration.to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captured_frames::StaticFrameCounter;
    use crate::clock::ManualClock;
    use crate::job::Target;
    use crate::sequence::{SequenceJob, SequenceQueue, StaticSequenceSource};
    use crate::subsystems::NullObservatoryOps;
    use chrono::TimeZone;

    fn scheduler(config: SchedulerConfig) -> Scheduler {
        let sequences = StaticSequenceSource::new();
        sequences.insert(
            "/seq/m42.esq",
            SequenceQueue {
                jobs: vec![SequenceJob::light("L", 60.0, 5, "/data/M42")],
                in_sequence_focus: false,
            },
        );
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 10, 22, 0, 0).unwrap());
        Scheduler::new(
            config,
            Arc::new(NullObservatoryOps),
            Arc::new(sequences),
            Arc::new(StaticFrameCounter::new()),
            Arc::new(clock),
        )
        .unwrap()
    }

    #[test]
    fn test_iteration_stops_on_nothing() {
        let mut scheduler = scheduler(SchedulerConfig::default());
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        assert_eq!(rt.block_on(scheduler.run_iteration()), None);
        assert_eq!(scheduler.pending_interval(), None);
    }

    #[test]
    fn test_start_goes_through_wakeup() {
        let mut scheduler = scheduler(SchedulerConfig::default());
        scheduler.start().unwrap();
        assert_eq!(scheduler.timer_state(), TimerState::Wakeup);
        assert_eq!(scheduler.pending_interval(), Some(START_DELAY));

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let delay = rt.block_on(scheduler.run_iteration());
        assert_eq!(scheduler.run_state(), SchedulerRunState::Running);
        assert_eq!(scheduler.timer_state(), TimerState::Scheduler);
        assert_eq!(delay, Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_invalid_startup_script_is_rejected() {
        let mut config = SchedulerConfig::default();
        config.procedures.startup_script = Some("/nonexistent/startup.sh".into());
        let mut scheduler = scheduler(config);
        let mut rx = scheduler.subscribe();

        let result = scheduler.start();
        assert!(matches!(result, Err(SchedulerError::InvalidStartupScript(_))));
        assert_eq!(scheduler.run_state(), SchedulerRunState::Idle);
        assert_eq!(scheduler.timer_state(), TimerState::Nothing);
        assert!(matches!(rx.try_recv(), Ok(SchedulerEvent::Log { message }) if message.starts_with("Warning")));
    }

    #[test]
    fn test_queue_edits_rejected_while_running() {
        let mut scheduler = scheduler(SchedulerConfig::default());
        let id = scheduler
            .add_job(Job::new("M42", Target::new(5.58, -5.39), "/seq/m42.esq"))
            .unwrap();
        scheduler.execute().unwrap();

        let result = scheduler.add_job(Job::new("M31", Target::new(0.71, 41.27), "/seq/m42.esq"));
        assert!(matches!(result, Err(SchedulerError::Busy(_))));
        assert!(matches!(scheduler.remove_job(id), Err(SchedulerError::Busy(_))));
    }

    #[test]
    fn test_add_job_links_duplicates() {
        let mut scheduler = scheduler(SchedulerConfig::default());
        let first = scheduler
            .add_job(Job::new("M42", Target::new(5.58, -5.39), "/seq/m42.esq"))
            .unwrap();
        let second = scheduler
            .add_job(Job::new("M42", Target::new(5.58, -5.39), "/seq/m42.esq"))
            .unwrap();

        assert_eq!(scheduler.job(second).and_then(|j| j.duplicate_of), Some(first));

        scheduler.remove_job(first).unwrap();
        assert_eq!(scheduler.job(second).and_then(|j| j.duplicate_of), None);
        assert!(matches!(scheduler.remove_job(first), Err(SchedulerError::JobNotFound(_))));
    }

    #[derive(Default)]
    struct MemoryStore {
        saved: std::sync::Mutex<Vec<Job>>,
        writes: std::sync::atomic::AtomicUsize,
    }

    impl PersistenceStore for MemoryStore {
        fn load_jobs(&self) -> Result<Vec<Job>> {
            Ok(self.saved.lock().unwrap().clone())
        }

        fn save_jobs(&self, jobs: &[Job]) -> Result<()> {
            *self.saved.lock().unwrap() = jobs.to_vec();
            self.writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    fn job(name: &str, ra_hours: f64, dec_degrees: f64) -> Job {
        Job::new(name, Target::new(ra_hours, dec_degrees), "/seq/m42.esq")
    }

    fn names(scheduler: &Scheduler) -> Vec<&str> {
        scheduler.jobs().iter().map(|job| job.name.as_str()).collect()
    }

    #[test]
    fn test_save_only_writes_changes() {
        let mut scheduler = scheduler(SchedulerConfig::default());
        let store = MemoryStore::default();
        assert!(!scheduler.save_queue(&store).unwrap());

        let id = scheduler.add_job(job("M42", 5.58, -5.39)).unwrap();
        assert!(scheduler.job(id).unwrap().dirty);
        assert!(scheduler.save_queue(&store).unwrap());
        assert!(!scheduler.job(id).unwrap().dirty);
        assert!(!scheduler.save_queue(&store).unwrap());
        assert_eq!(store.writes.load(std::sync::atomic::Ordering::SeqCst), 1);

        scheduler.edit_job(id, |job| job.name = "M42 deep".into()).unwrap();
        assert!(scheduler.has_unsaved_changes());
        assert!(scheduler.save_queue(&store).unwrap());
        assert_eq!(store.saved.lock().unwrap()[0].name, "M42 deep");

        scheduler.remove_job(id).unwrap();
        assert!(scheduler.has_unsaved_changes());
        assert!(scheduler.save_queue(&store).unwrap());
        assert!(store.saved.lock().unwrap().is_empty());

        scheduler.load_queue(&store).unwrap();
        assert!(!scheduler.has_unsaved_changes());
    }

    #[test]
    fn test_edit_job_keeps_identity_and_validates() {
        let mut scheduler = scheduler(SchedulerConfig::default());
        let first = scheduler.add_job(job("M42", 5.58, -5.39)).unwrap();
        let second = scheduler.add_job(job("M31", 0.71, 41.27)).unwrap();
        assert_eq!(scheduler.job(second).and_then(|j| j.duplicate_of), None);

        scheduler
            .edit_job(second, |job| {
                job.id = JobId::new_v4();
                job.name = "M42".into();
                job.target = Target::new(5.58, -5.39);
            })
            .unwrap();
        assert_eq!(scheduler.job(second).and_then(|j| j.duplicate_of), Some(first));

        let result = scheduler.edit_job(second, |job| job.name.clear());
        assert!(matches!(result, Err(SchedulerError::InvalidJob { .. })));
        assert_eq!(scheduler.job(second).unwrap().name, "M42");
        assert!(matches!(
            scheduler.edit_job(JobId::new_v4(), |_| {}),
            Err(SchedulerError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_move_job() {
        let mut scheduler = scheduler(SchedulerConfig::default());
        let a = scheduler.add_job(job("A", 5.58, -5.39)).unwrap();
        scheduler.add_job(job("B", 0.71, 41.27)).unwrap();
        let c = scheduler.add_job(job("C", 2.5, 89.0)).unwrap();
        scheduler.save_queue(&MemoryStore::default()).unwrap();

        assert!(!scheduler.move_job(a, 0).unwrap());
        assert!(!scheduler.has_unsaved_changes());

        assert!(scheduler.move_job(c, 0).unwrap());
        assert_eq!(names(&scheduler), ["C", "A", "B"]);
        assert!(scheduler.has_unsaved_changes());

        assert!(scheduler.move_job(c, 99).unwrap());
        assert_eq!(names(&scheduler), ["A", "B", "C"]);

        scheduler.execute().unwrap();
        assert!(matches!(scheduler.move_job(a, 2), Err(SchedulerError::Busy(_))));
    }

    #[test]
    fn test_reorder_jobs_keeps_the_rest_in_place() {
        let mut scheduler = scheduler(SchedulerConfig::default());
        let a = scheduler.add_job(job("A", 5.58, -5.39)).unwrap();
        scheduler.add_job(job("B", 0.71, 41.27)).unwrap();
        let c = scheduler.add_job(job("C", 2.5, 89.0)).unwrap();

        assert!(scheduler.reorder_jobs(&[c, JobId::new_v4()]).unwrap());
        assert_eq!(names(&scheduler), ["C", "A", "B"]);
        assert!(!scheduler.reorder_jobs(&[c, a]).unwrap());
    }

    #[test]
    fn test_sort_jobs_per_altitude() {
        let mut scheduler = scheduler(SchedulerConfig::default());
        assert!(!scheduler.sort_jobs_per_altitude().unwrap());

        // Seen from Greenwich at 22:00 UTC on January 10th
        scheduler.add_job(job("Southern", 5.58, -60.0)).unwrap();
        scheduler.add_job(job("M42", 5.58, -5.39)).unwrap();
        scheduler.add_job(job("Polar", 2.5, 89.0)).unwrap();
        scheduler.add_job(job("M31", 0.71, 41.27)).unwrap();

        assert!(scheduler.sort_jobs_per_altitude().unwrap());
        assert_eq!(names(&scheduler), ["Southern", "Polar", "M31", "M42"]);
        assert!(scheduler.has_unsaved_changes());
    }

    #[test]
    fn test_pause_only_while_running() {
        let mut scheduler = scheduler(SchedulerConfig::default());
        scheduler.pause();
        assert_eq!(scheduler.run_state(), SchedulerRunState::Idle);

        scheduler.execute().unwrap();
        scheduler.pause();
        assert_eq!(scheduler.run_state(), SchedulerRunState::Paused);

        scheduler.execute().unwrap();
        assert_eq!(scheduler.run_state(), SchedulerRunState::Running);
    }

    #[test]
    fn test_repeat_sequence_limit() {
        let mut config = SchedulerConfig::default();
        config.repeat_sequence = SequenceRepeat::Times(2);
        let mut scheduler = scheduler(config);
        assert!(scheduler.check_repeat_sequence());
        scheduler.state.sequence_execution_counter = 2;
        assert!(!scheduler.check_repeat_sequence());
    }
}
