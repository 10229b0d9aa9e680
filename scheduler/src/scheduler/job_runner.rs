//! Execution of the active job
//!
//! Everything here runs on behalf of [`Scheduler::check_job_stage`] or a
//! subsystem callback. Start commands only record the new stage and fire the
//! request; a command that cannot be sent puts the job in ERROR, and the next
//! `JobCheck` iteration runs the termination handling.

use super::Scheduler;
use crate::captured_frames::can_count_captures;
use crate::events::SchedulerEvent;
use crate::execution::{
    abort_target, loop_restart_action, next_action, repeat_restart_action, termination_decision, watchdog_kind,
    NextAction, PipelineContext, StageWatchdog, SubsystemPoll, TerminationDecision, WatchdogVerdict,
};
use crate::job::{CompletionCondition, Job, JobId, JobStage, JobStatus, PipelineSteps};
use crate::state::{SchedulerRunState, SubsystemKind, TimerState};
use crate::subsystems::{
    AlignState, CaptureRequest, CaptureState, Device, FocusState, GuideState, MountStatus,
};
use std::time::Duration;

impl Scheduler {
    // =========================================================================
    // JOB CHECK
    // =========================================================================

    /// Re-validate the active job, then advance its pipeline
    pub(crate) async fn check_job_stage(&mut self) {
        let Some(active) = self.state.active_job else {
            self.setup(TimerState::Scheduler);
            return;
        };

        match self.state.job(active).map(Job::status) {
            None => {
                self.set_active_job(None);
                self.setup(TimerState::Scheduler);
                return;
            }
            Some(JobStatus::Busy) => {}
            // Selected but not started yet
            Some(JobStatus::Scheduled) | Some(JobStatus::Evaluation) => {
                self.setup(TimerState::Scheduler);
                return;
            }
            Some(_) => {
                self.find_next_job().await;
                return;
            }
        }

        let now = self.now();
        self.greedy.set_weather(self.state.weather_status);
        if !self.greedy.check_job(&mut self.state.jobs, now, active, &self.evaluator) {
            if let Some(job) = self.state.job(active) {
                let message = format!("Job '{}' is interrupted: {}.", job.name, job.stop_reason);
                self.append_log_text(message);
            }
            self.set_job_status(active, JobStatus::Idle);
            self.stop_current_job_action().await;
            self.find_next_job().await;
            return;
        }

        self.check_job_stage_epilogue().await;
    }

    async fn check_job_stage_epilogue(&mut self) {
        if !self.check_status().await {
            return;
        }

        let Some(job) = self.state.active_job() else {
            return;
        };
        if job.status() != JobStatus::Busy {
            return;
        }
        let id = job.id;
        let name = job.name.clone();
        let stage = job.stage();

        match stage {
            JobStage::Idle => {
                self.events.emit(SchedulerEvent::JobStarted { id, name });
                self.get_next_action().await;
            }
            JobStage::Aligning
            | JobStage::Capturing
            | JobStage::Focusing
            | JobStage::PostAlignFocusing
            | JobStage::Guiding => self.check_watchdog(id, stage).await,
            JobStage::Slewing | JobStage::Reslewing => match self.ops.mount_status().await {
                Ok(status) => self.on_mount_status(status).await,
                Err(e) => {
                    tracing::warn!("Mount status unavailable: {}", e);
                    self.append_log_text(format!(
                        "Warning: job '{}' lost connection to the mount, attempting to reconnect.",
                        name
                    ));
                    if !self.manage_connection_loss(Device::Mount).await {
                        self.set_job_status(id, JobStatus::Error);
                    }
                }
            },
            JobStage::SlewComplete | JobStage::ReslewingComplete => {
                if self.config.procedures.use_dome {
                    match self.ops.dome_is_moving().await {
                        Ok(true) => {}
                        Ok(false) => self.get_next_action().await,
                        Err(e) => {
                            tracing::warn!("Dome status unavailable: {}", e);
                            self.append_log_text(format!(
                                "Warning: job '{}' lost connection to the dome, attempting to reconnect.",
                                name
                            ));
                            if !self.manage_connection_loss(Device::Dome).await {
                                self.set_job_status(id, JobStatus::Error);
                            }
                        }
                    }
                } else {
                    self.get_next_action().await;
                }
            }
            _ => {}
        }
    }

    async fn check_watchdog(&mut self, id: JobId, stage: JobStage) {
        let now = self.now();
        let Some(watchdog) = self.state.watchdog else {
            return;
        };
        if !watchdog.is_expired(now) {
            return;
        }

        let poll = self.poll_stage_owner(watchdog.kind).await;
        let verdict = watchdog.verdict(poll, &mut self.state.failures, self.config.max_failure_attempts);
        let name = self.state.job(id).map(|job| job.name.clone()).unwrap_or_default();

        match verdict {
            WatchdogVerdict::Rearm => {
                if let Some(watchdog) = self.state.watchdog.as_mut() {
                    watchdog.rearm(now);
                }
            }
            WatchdogVerdict::Restart => {
                tracing::debug!("{} module timed out, restarting request...", watchdog.kind);
                self.restart_stage(stage).await;
            }
            WatchdogVerdict::Abort => {
                self.append_log_text(format!(
                    "Warning: job '{}' {} procedure failed, marking aborted.",
                    name, watchdog.kind
                ));
                self.set_job_status(id, JobStatus::Aborted);
                self.find_next_job().await;
            }
            WatchdogVerdict::ConnectionLost => {
                let device = device_for(watchdog.kind);
                self.append_log_text(format!(
                    "Warning: job '{}' lost connection to the {}, attempting to reconnect.",
                    name, device
                ));
                if self.manage_connection_loss(device).await {
                    if let Some(watchdog) = self.state.watchdog.as_mut() {
                        watchdog.rearm(now);
                    }
                } else {
                    self.set_job_status(id, JobStatus::Error);
                }
            }
        }
    }

    async fn poll_stage_owner(&self, kind: SubsystemKind) -> SubsystemPoll {
        let idle = match kind {
            SubsystemKind::Align => self.ops.align_status().await.map(|s| s == AlignState::Idle),
            SubsystemKind::Capture => self.ops.capture_status().await.map(|s| s == CaptureState::Idle),
            SubsystemKind::Focus => self
                .ops
                .focus_status()
                .await
                .map(|s| matches!(s, FocusState::Idle | FocusState::Waiting)),
            SubsystemKind::Guide => self.ops.guide_status().await.map(GuideState::is_idle),
        };
        match idle {
            Ok(true) => SubsystemPoll::Idle,
            Ok(false) => SubsystemPoll::Busy,
            Err(e) => {
                tracing::warn!("{} status unavailable: {}", kind, e);
                SubsystemPoll::Lost
            }
        }
    }

    /// Issue the start command of `stage` again
    async fn restart_stage(&mut self, stage: JobStage) {
        match stage {
            JobStage::Aligning => self.start_astrometry().await,
            JobStage::Capturing => self.start_capture(false).await,
            JobStage::Focusing | JobStage::PostAlignFocusing => self.start_focusing(stage).await,
            JobStage::Guiding => self.start_guiding(false).await,
            _ => {}
        }
    }

    // =========================================================================
    // PIPELINE
    // =========================================================================

    /// Start the step following the current stage of the active job
    pub(crate) async fn get_next_action(&mut self) {
        let Some(job) = self.state.active_job() else {
            return;
        };
        let name = job.name.clone();
        let stage = job.stage();
        let steps = job.steps;
        let light_frames_required = job.light_frames_required;
        let in_sequence_focus = job.in_sequence_focus;

        let guiding_active = stage == JobStage::Idle
            && light_frames_required
            && steps.contains(PipelineSteps::GUIDE)
            && matches!(self.ops.guide_status().await, Ok(GuideState::Guiding));

        let ctx = PipelineContext {
            autofocus_completed: self.state.autofocus_completed,
            guiding_active,
            light_frames_required,
            in_sequence_focus,
        };
        let Some(action) = next_action(stage, steps, &ctx) else {
            return;
        };
        tracing::debug!("Next action for '{}' at {}: {:?}", name, stage, action);

        if stage == JobStage::Idle {
            if !light_frames_required && !steps.is_empty() {
                self.append_log_text(format!(
                    "Job '{}' is proceeding directly to capture stage because only calibration frames are pending.",
                    name
                ));
            } else if guiding_active && action == NextAction::Capture {
                self.append_log_text("Guiding already running, directly start capturing.");
            }
        }

        self.run_action(action).await;
    }

    async fn run_action(&mut self, action: NextAction) {
        match action {
            NextAction::Slew | NextAction::Reslew => self.start_slew(action.stage()).await,
            NextAction::Focus | NextAction::PostAlignFocus => self.start_focusing(action.stage()).await,
            NextAction::Align => self.start_astrometry().await,
            NextAction::Guide => self.start_guiding(false).await,
            NextAction::Capture => self.start_capture(false).await,
        }
    }

    /// Pick a repeating job up again at `action`
    async fn restart_pipeline(&mut self, action: NextAction) {
        if action == NextAction::Align {
            self.stop_guiding().await;
        }
        self.run_action(action).await;
    }

    async fn start_slew(&mut self, stage: JobStage) {
        let Some(job) = self.state.active_job() else {
            return;
        };
        let target = job.target.clone();
        let name = job.name.clone();

        self.update_job_stage(stage);
        self.append_log_text(format!("Job '{}' is slewing to target.", name));
        if let Err(e) = self.ops.start_slew(&target).await {
            self.command_failed(Device::Mount, e);
        }
    }

    async fn start_focusing(&mut self, stage: JobStage) {
        let Some(name) = self.state.active_job().map(|job| job.name.clone()) else {
            return;
        };

        self.update_job_stage(stage);
        self.append_log_text(format!("Job '{}' is focusing.", name));
        if let Err(e) = self.ops.start_focus().await {
            self.command_failed(Device::Focus, e);
        }
    }

    pub(crate) async fn start_astrometry(&mut self) {
        let Some(job) = self.state.active_job() else {
            return;
        };
        let target = job.target.clone();
        let name = job.name.clone();

        self.update_job_stage(JobStage::Aligning);
        if let Err(e) = self.ops.set_align_target(&target).await {
            tracing::warn!("Failed to set the align target: {}", e);
        }

        match &target.fits_file {
            Some(file) => self.append_log_text(format!("Job '{}' is plate solving {}.", name, file.display())),
            None => self.append_log_text(format!("Job '{}' is capturing and plate solving.", name)),
        }
        if let Err(e) = self.ops.start_alignment(&target).await {
            self.command_failed(Device::Align, e);
        }
    }

    async fn start_guiding(&mut self, reset_calibration: bool) {
        let Some(name) = self.state.active_job().map(|job| job.name.clone()) else {
            return;
        };

        self.update_job_stage(JobStage::Guiding);
        self.append_log_text(format!("Starting guiding procedure for {}...", name));
        if let Err(e) = self.ops.start_guiding(reset_calibration).await {
            self.command_failed(Device::Guide, e);
        }
    }

    async fn start_capture(&mut self, restart: bool) {
        let Some(job) = self.state.active_job() else {
            return;
        };
        let request = CaptureRequest {
            job_name: job.name.clone(),
            sequence_file: job.sequence_file.clone(),
            restart,
        };

        self.update_job_stage(JobStage::Capturing);
        self.state.frames_since_align_check = 0;
        self.append_log_text(format!("Job '{}' capture is in progress...", request.job_name));
        if let Err(e) = self.ops.start_capture(&request).await {
            self.command_failed(Device::Capture, e);
        }
    }

    fn command_failed(&mut self, device: Device, error: String) {
        let Some(job) = self.state.active_job() else {
            return;
        };
        let id = job.id;
        let message = format!(
            "Warning: job '{}' could not command the {} ({}), marking terminated due to errors.",
            job.name, device, error
        );
        self.append_log_text(message);
        self.set_job_status(id, JobStatus::Error);
        self.setup(TimerState::JobCheck);
    }

    /// Move the active job to `stage` and re-arm the stage watchdog
    pub(crate) fn update_job_stage(&mut self, stage: JobStage) {
        let now = self.now();
        self.state.watchdog = watchdog_kind(stage).map(|kind| StageWatchdog::arm(kind, now, self.config.timeouts.for_kind(kind)));

        let Some(job) = self.state.active_job_mut() else {
            return;
        };
        if job.set_stage(stage) {
            let event = SchedulerEvent::JobStageChanged {
                id: job.id,
                name: job.name.clone(),
                stage,
            };
            self.events.emit(event);
        }
    }

    // =========================================================================
    // STOPPING
    // =========================================================================

    /// Abort whatever the active job is doing and stop guiding
    pub(crate) async fn stop_current_job_action(&mut self) {
        if let Some(job) = self.state.active_job() {
            let stage = job.stage();
            tracing::debug!("Job '{}' is stopping current action... {}", job.name, stage);

            if let Some(device) = abort_target(stage) {
                let result = match device {
                    Device::Mount => self.ops.abort_slew().await,
                    Device::Focus => self.ops.abort_focus().await,
                    Device::Align => self.ops.abort_align().await,
                    Device::Capture => self.ops.abort_capture().await,
                    _ => Ok(()),
                };
                if let Err(e) = result {
                    tracing::warn!("Failed to abort the {}: {}", device, e);
                }
            }
            self.update_job_stage(JobStage::Idle);
        }

        self.stop_guiding().await;
    }

    pub(crate) async fn stop_guiding(&mut self) {
        match self.ops.guide_status().await {
            Ok(status) if !status.is_idle() => {
                tracing::info!("Stopping guiding");
                if let Err(e) = self.ops.stop_guiding().await {
                    tracing::warn!("Failed to stop guiding: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Guide status unavailable: {}", e),
        }
    }

    // =========================================================================
    // TERMINATION
    // =========================================================================

    /// Handle the end of the active job and decide what runs next
    pub(crate) async fn find_next_job(&mut self) {
        if self.state.run_state == SchedulerRunState::Paused {
            self.set_paused();
            return;
        }

        let Some(id) = self.state.active_job else {
            self.setup(TimerState::Scheduler);
            return;
        };
        self.state.failures.reset();

        let Some(job) = self.state.job(id) else {
            self.set_active_job(None);
            self.setup(TimerState::Scheduler);
            return;
        };

        let now = self.now();
        let status = job.status();
        let name = job.name.clone();
        let steps = job.steps;
        let completion = job.completion;
        let decision = termination_decision(
            job,
            now,
            self.config.error_handling.strategy,
            self.config.error_handling.reschedule_errors,
        );
        let remember = self.config.remember_job_progress;
        let force_alignment = self.config.force_alignment_before_job;

        match decision {
            TerminationDecision::Failed { restart } => {
                self.emit_job_ended(id);
                self.state.capture_batch = 0;
                self.stop_guiding().await;

                if status == JobStatus::Error {
                    self.append_log_text(format!("Job '{}' is terminated due to errors.", name));
                } else {
                    self.append_log_text(format!("Job '{}' is aborted.", name));
                }
                self.update_job_stage(JobStage::Idle);

                if restart {
                    self.set_job_status(id, JobStatus::Scheduled);
                    let delay = self.config.error_handling.delay_secs;
                    self.append_log_text(format!("Waiting {} seconds to restart job '{}'.", delay, name));
                    self.setup_after(TimerState::Wakeup, Duration::from_secs(delay));
                    return;
                }

                self.set_active_job(None);
                self.setup(TimerState::Scheduler);
            }

            TerminationDecision::Interrupted => {
                self.emit_job_ended(id);
                self.set_active_job(None);
                self.setup(TimerState::Scheduler);
            }

            TerminationDecision::SequenceDone => {
                self.emit_job_ended(id);
                if remember {
                    self.mark_cohort(id, JobStatus::Idle);
                }
                self.state.capture_batch = 0;
                self.stop_guiding().await;
                self.append_log_text(format!("Job '{}' is complete.", name));
                self.update_job_stage(JobStage::Idle);

                // Frames saved elsewhere cannot be counted again later
                if !self.job_can_count_captures(id) {
                    self.set_job_status(id, JobStatus::Complete);
                }
                self.set_active_job(None);
                self.setup(TimerState::Scheduler);
            }

            TerminationDecision::RepeatFinal => {
                if let Some(job) = self.state.job_mut(id) {
                    if job.repeats_remaining > 0 {
                        if !remember {
                            job.repeats_remaining -= 1;
                            job.completed_iterations += 1;
                        }
                        job.startup_time = None;
                    }
                }
                self.mark_cohort(id, JobStatus::Idle);
                self.evaluate_jobs(true);

                let job = self.state.job(id);
                let done = job.map_or(true, |job| job.repeats_remaining == 0);
                let scheduled = job.is_some_and(|job| job.status() == JobStatus::Scheduled);

                if done || !scheduled {
                    self.stop_current_job_action().await;
                    if let Some(job) = self.state.job(id) {
                        let repeats = job.repeats_required();
                        let remaining = job.repeats_remaining;
                        self.emit_job_ended(id);
                        if done {
                            self.append_log_text(format!("Job '{}' is complete after #{} batches.", name, repeats));
                            if !self.job_can_count_captures(id) {
                                self.set_job_status(id, JobStatus::Complete);
                            }
                        } else {
                            self.append_log_text(format!(
                                "Job '{}' cannot continue now, #{} batches remaining.",
                                name, remaining
                            ));
                        }
                    }
                    self.set_active_job(None);
                    self.setup(TimerState::Scheduler);
                    return;
                }

                if !self.execute_job(id).await {
                    self.update_job_stage(JobStage::Idle);
                    return;
                }
                self.restart_pipeline(repeat_restart_action(steps, force_alignment)).await;

                let remaining = self.state.job(id).map_or(0, |job| job.repeats_remaining);
                self.append_log_text(format!("Job '{}' is repeating, #{} batches remaining.", name, remaining));
                self.setup(TimerState::JobCheck);
            }

            TerminationDecision::RepeatAgain => {
                if let Some(job) = self.state.job_mut(id) {
                    if matches!(job.completion, CompletionCondition::Repeat(_)) && job.repeats_remaining > 1 {
                        if !remember {
                            job.repeats_remaining -= 1;
                            job.completed_iterations += 1;
                        }
                        job.startup_time = None;
                    }
                }

                if !self.execute_job(id).await {
                    self.update_job_stage(JobStage::Idle);
                    return;
                }
                self.restart_pipeline(loop_restart_action(steps, force_alignment)).await;
                self.state.capture_batch += 1;

                if let CompletionCondition::Repeat(_) = completion {
                    let remaining = self.state.job(id).map_or(0, |job| job.repeats_remaining);
                    self.append_log_text(format!("Job '{}' is repeating, #{} batches remaining.", name, remaining));
                } else {
                    self.append_log_text(format!("Job '{}' is repeating, looping indefinitely.", name));
                }
                self.setup(TimerState::JobCheck);
            }

            TerminationDecision::DeadlineReached => {
                self.emit_job_ended(id);
                self.mark_cohort(id, JobStatus::Idle);
                self.stop_current_job_action().await;

                self.append_log_text(format!(
                    "Job '{}' stopping, reached completion time with #{} batches done.",
                    name,
                    self.state.capture_batch + 1
                ));
                self.state.capture_batch = 0;
                self.update_job_stage(JobStage::Idle);
                self.set_active_job(None);
                self.setup(TimerState::Scheduler);
            }

            TerminationDecision::BeforeDeadline => {
                if !self.execute_job(id).await {
                    self.update_job_stage(JobStage::Idle);
                    return;
                }
                self.restart_pipeline(loop_restart_action(steps, force_alignment)).await;
                self.state.capture_batch += 1;

                self.append_log_text(format!(
                    "Job '{}' completed #{} batches before completion time, restarted.",
                    name, self.state.capture_batch
                ));
                self.setup(TimerState::JobCheck);
            }

            TerminationDecision::Inconsistent => {
                tracing::warn!("Job '{}' ended in status {} with no termination handling", name, status);
                self.append_log_text(format!(
                    "Warning: job '{}' timer elapsed, but no action to be taken.",
                    name
                ));
                self.update_job_stage(JobStage::Idle);
                self.set_active_job(None);
                self.setup(TimerState::Scheduler);
            }
        }
    }

    /// Set `status` on a job and on every duplicate of it
    fn mark_cohort(&mut self, id: JobId, status: JobStatus) {
        let Some(root) = self.state.job(id).map(Job::cohort_root) else {
            return;
        };
        let members: Vec<JobId> = self
            .state
            .jobs
            .iter()
            .filter(|job| job.cohort_root() == root)
            .map(|job| job.id)
            .collect();
        for member in members {
            self.set_job_status(member, status);
        }
    }

    pub(crate) fn emit_job_ended(&self, id: JobId) {
        if let Some(job) = self.state.job(id) {
            self.events.emit(SchedulerEvent::JobEnded {
                id,
                name: job.name.clone(),
                reason: job.stop_reason.clone(),
            });
        }
    }

    fn job_can_count_captures(&self, id: JobId) -> bool {
        self.state
            .job(id)
            .is_some_and(|job| can_count_captures(&job.sequence_jobs))
    }

    // =========================================================================
    // SUBSYSTEM CALLBACKS
    // =========================================================================

    /// Active job that callbacks apply to; a scheduled job waits for its time
    pub(crate) fn callback_job(&self) -> Option<JobId> {
        let job = self.state.active_job()?;
        if job.status() == JobStatus::Scheduled && job.startup_time.is_some_and(|start| self.now() < start) {
            return None;
        }
        Some(job.id)
    }

    fn active_stage(&self) -> Option<JobStage> {
        self.state.active_job().map(Job::stage)
    }

    fn active_name(&self) -> String {
        self.state.active_job().map(|job| job.name.clone()).unwrap_or_default()
    }

    pub(crate) async fn on_capture_status(&mut self, status: CaptureState) {
        let Some(id) = self.callback_job() else {
            return;
        };
        tracing::debug!("Capture state {:?}", status);
        if self.active_stage() != Some(JobStage::Capturing) {
            return;
        }
        let name = self.active_name();
        let steps = self.state.job(id).map(|job| job.steps).unwrap_or_default();

        match status {
            CaptureState::Progress if steps.contains(PipelineSteps::ALIGN) => {
                // Capture resets the align target to the mount position
                if let Some(target) = self.state.job(id).map(|job| job.target.clone()) {
                    if let Err(e) = self.ops.set_align_target(&target).await {
                        tracing::warn!("Failed to set the align target: {}", e);
                    }
                }
            }
            CaptureState::Aborted => {
                self.append_log_text(format!("Warning: job '{}' failed to capture target.", name));
                let max = self.config.max_failure_attempts;

                if !self.state.failures.increase(SubsystemKind::Capture, max) {
                    self.append_log_text(format!(
                        "Warning: job '{}' failed its capture procedure, marking aborted.",
                        name
                    ));
                    self.set_job_status(id, JobStatus::Aborted);
                    self.find_next_job().await;
                    return;
                }

                if steps.contains(PipelineSteps::GUIDE) {
                    if let Ok(guide) = self.ops.guide_status().await {
                        if guide.is_error() {
                            let attempt = self.state.failures.count(SubsystemKind::Capture);
                            self.append_log_text(format!(
                                "Job '{}' is capturing, is restarting its guiding procedure (attempt #{} of {}).",
                                name, attempt, max
                            ));
                            self.start_guiding(true).await;
                            return;
                        }
                    }
                }

                self.append_log_text(format!(
                    "Warning: job '{}' failed its capture procedure, restarting capture.",
                    name
                ));
                self.start_capture(true).await;
            }
            CaptureState::Complete => {
                self.set_job_status(id, JobStatus::Complete);
                self.find_next_job().await;
            }
            CaptureState::ImageReceived => {
                if self.config.remember_job_progress {
                    self.refresh_estimates();
                } else if let Some(job) = self.state.job_mut(id) {
                    job.completed_count += 1;
                }
                self.state.failures.reset_kind(SubsystemKind::Capture);
                let now = self.now();
                if let Some(watchdog) = self.state.watchdog.as_mut() {
                    watchdog.rearm(now);
                }
            }
            _ => {}
        }
    }

    pub(crate) async fn on_focus_status(&mut self, status: FocusState) {
        let Some(id) = self.callback_job() else {
            return;
        };
        let Some(stage) = self
            .active_stage()
            .filter(|stage| matches!(stage, JobStage::Focusing | JobStage::PostAlignFocusing))
        else {
            return;
        };
        let name = self.active_name();

        match status {
            FocusState::Complete => {
                self.append_log_text(format!("Job '{}' focusing is complete.", name));
                self.state.autofocus_completed = true;
                self.state.failures.reset_kind(SubsystemKind::Focus);
                let done = if stage == JobStage::PostAlignFocusing {
                    JobStage::PostAlignFocusingComplete
                } else {
                    JobStage::FocusComplete
                };
                self.update_job_stage(done);
                self.get_next_action().await;
            }
            FocusState::Failed | FocusState::Aborted => {
                self.append_log_text(format!("Warning: job '{}' focusing failed.", name));
                if self.state.failures.increase(SubsystemKind::Focus, self.config.max_failure_attempts) {
                    self.append_log_text(format!("Job '{}' is restarting its focusing procedure.", name));
                    self.start_focusing(stage).await;
                } else {
                    self.append_log_text(format!(
                        "Warning: job '{}' focusing procedure failed, marking aborted.",
                        name
                    ));
                    self.set_job_status(id, JobStatus::Aborted);
                    self.find_next_job().await;
                }
            }
            _ => {}
        }
    }

    pub(crate) async fn on_align_status(&mut self, status: AlignState) {
        let Some(id) = self.callback_job() else {
            return;
        };
        if self.active_stage() != Some(JobStage::Aligning) {
            return;
        }
        let name = self.active_name();

        match status {
            AlignState::Complete => {
                self.append_log_text(format!("Job '{}' alignment is complete.", name));
                self.state.failures.reset_kind(SubsystemKind::Align);
                self.update_job_stage(JobStage::AlignComplete);
                self.get_next_action().await;
            }
            AlignState::Failed | AlignState::Aborted => {
                self.append_log_text(format!("Warning: job '{}' alignment failed.", name));
                if self.state.failures.increase(SubsystemKind::Align, self.config.max_failure_attempts) {
                    self.append_log_text(format!("Restarting {} alignment procedure...", name));
                    self.start_astrometry().await;
                } else {
                    self.append_log_text(format!(
                        "Warning: job '{}' alignment procedure failed, marking aborted.",
                        name
                    ));
                    self.set_job_status(id, JobStatus::Aborted);
                    self.find_next_job().await;
                }
            }
            _ => {}
        }
    }

    pub(crate) async fn on_guide_status(&mut self, status: GuideState) {
        let Some(id) = self.callback_job() else {
            return;
        };
        if self.active_stage() != Some(JobStage::Guiding) {
            return;
        }
        let name = self.active_name();
        let max = self.config.max_failure_attempts;

        if status == GuideState::Guiding {
            self.append_log_text(format!("Job '{}' guiding is in progress.", name));
            self.state.failures.reset_kind(SubsystemKind::Guide);
            self.update_job_stage(JobStage::GuidingComplete);
            self.get_next_action().await;
        } else if status.is_error() {
            self.append_log_text(format!("Warning: job '{}' guiding failed.", name));
            if !self.state.failures.increase(SubsystemKind::Guide, max) {
                self.append_log_text(format!(
                    "Warning: job '{}' guiding procedure failed, marking aborted.",
                    name
                ));
                self.set_job_status(id, JobStatus::Aborted);
                self.find_next_job().await;
                return;
            }

            let attempt = self.state.failures.count(SubsystemKind::Guide);
            if status == GuideState::CalibrationError {
                self.append_log_text(format!(
                    "Job '{}' failed to calibrate, restarting guiding with calibration reset (attempt #{} of {}).",
                    name, attempt, max
                ));
                self.start_guiding(true).await;
            } else {
                self.append_log_text(format!(
                    "Job '{}' is restarting its guiding procedure (attempt #{} of {}).",
                    name, attempt, max
                ));
                self.start_guiding(false).await;
            }
        }
    }

    pub(crate) async fn on_mount_status(&mut self, status: MountStatus) {
        let Some(id) = self.callback_job() else {
            return;
        };
        let name = self.active_name();

        match (self.active_stage(), status) {
            (Some(JobStage::Slewing), MountStatus::Tracking) => {
                self.append_log_text(format!("Job '{}' slew is complete.", name));
                self.update_job_stage(JobStage::SlewComplete);
            }
            (Some(JobStage::Slewing), MountStatus::Error) => {
                self.append_log_text(format!(
                    "Warning: job '{}' slew failed, marking terminated due to errors.",
                    name
                ));
                self.set_job_status(id, JobStatus::Error);
                self.find_next_job().await;
            }
            (Some(JobStage::Slewing), MountStatus::Idle) => {
                self.append_log_text(format!("Warning: job '{}' found not slewing, restarting.", name));
                self.update_job_stage(JobStage::Idle);
                self.get_next_action().await;
            }
            (Some(JobStage::Reslewing), MountStatus::Tracking) => {
                self.append_log_text(format!("Job '{}' repositioning is complete.", name));
                self.update_job_stage(JobStage::ReslewingComplete);
            }
            (Some(JobStage::Reslewing), MountStatus::Error) => {
                self.append_log_text(format!(
                    "Warning: job '{}' repositioning failed, marking terminated due to errors.",
                    name
                ));
                self.set_job_status(id, JobStatus::Error);
                self.find_next_job().await;
            }
            (Some(JobStage::Reslewing), MountStatus::Idle) => {
                self.append_log_text(format!("Warning: job '{}' found not repositioning, restarting.", name));
                self.start_slew(JobStage::Reslewing).await;
            }
            _ => {}
        }
    }
}

fn device_for(kind: SubsystemKind) -> Device {
    match kind {
        SubsystemKind::Align => Device::Align,
        SubsystemKind::Guide => Device::Guide,
        SubsystemKind::Focus => Device::Focus,
        SubsystemKind::Capture => Device::Capture,
    }
}
