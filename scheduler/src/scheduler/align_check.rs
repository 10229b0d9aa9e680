//! In-flight alignment check
//!
//! While a job with ALIGN captures, every Nth light frame is handed to the
//! solver. A solution too far from the target interrupts the capture and
//! aligns again.

use super::Scheduler;
use crate::astro::{angular_separation, EquatorialCoords};
use crate::captured_frames::signature_for_frame;
use crate::events::SchedulerEvent;
use crate::job::{JobStage, PipelineSteps};
use crate::sequence::FrameType;
use crate::subsystems::{CaptureMetadata, SolveOutcome, SolveRequest};

/// Seconds taken off the exposure time to get the solver timeout
const SOLVER_TIMEOUT_MARGIN_SECS: f64 = 2.0;

impl Scheduler {
    pub(crate) async fn on_capture_complete(&mut self, metadata: &CaptureMetadata) {
        let Some(id) = self.callback_job() else {
            return;
        };
        let Some(job) = self.state.job(id) else {
            return;
        };
        let name = job.name.clone();
        let signature = signature_for_frame(job, metadata);
        let aligns = job.steps.contains(PipelineSteps::ALIGN);
        let capturing = job.stage() == JobStage::Capturing;
        let target = job.target.clone();

        if self.config.remember_job_progress {
            match signature {
                Some(signature) => self.state.frames.record_frame(&signature),
                None => tracing::debug!("No sequence line of '{}' matches {}", name, metadata.filename.display()),
            }
        }

        let frequency = self.config.align_check.frequency;
        if metadata.frame_type != FrameType::Light || frequency == 0 || !aligns || !capturing {
            return;
        }

        self.state.frames_since_align_check += 1;
        if self.state.frames_since_align_check < frequency {
            return;
        }
        if self.state.solver_pending {
            tracing::debug!("Solver still busy, skipping alignment check");
            return;
        }
        self.state.frames_since_align_check = 0;

        let request = SolveRequest {
            filename: metadata.filename.clone(),
            target,
            timeout_secs: (metadata.exposure - SOLVER_TIMEOUT_MARGIN_SECS).max(self.config.align_check.min_solver_secs),
        };
        tracing::debug!("Checking alignment of {}", request.filename.display());
        match self.ops.solve_frame(&request).await {
            Ok(()) => self.state.solver_pending = true,
            Err(e) => tracing::warn!("Failed to start the solver: {}", e),
        }
    }

    pub(crate) async fn on_solver_done(&mut self, outcome: &SolveOutcome) {
        if !self.state.solver_pending {
            return;
        }
        self.state.solver_pending = false;

        if outcome.timed_out {
            self.append_log_text(format!("Solver timed out: {:.1}s", outcome.elapsed_secs));
            return;
        }
        if !outcome.success {
            self.append_log_text(format!("Solver failed: {:.1}s", outcome.elapsed_secs));
            return;
        }

        let Some(job) = self.state.active_job() else {
            return;
        };
        if job.stage() != JobStage::Capturing {
            return;
        }

        let solved = EquatorialCoords::new(outcome.ra_hours, outcome.dec_degrees);
        let arcsec = angular_separation(&job.target.coords(), &solved) * 3600.0;
        tracing::info!("Solver took {:.1}s, target distance {:.1}\"", outcome.elapsed_secs, arcsec);
        self.events.emit(SchedulerEvent::TargetDistance { arcsec });

        let arcmin = arcsec / 60.0;
        if arcmin > self.config.align_check.threshold_arcmin {
            self.append_log_text(format!(
                "Captured frame is {:.1} arcminutes away from target, re-aligning...",
                arcmin
            ));
            self.stop_current_job_action().await;
            self.start_astrometry().await;
        }
    }
}
