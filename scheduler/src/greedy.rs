//! Greedy job selection
//!
//! One pass over the queue: every runnable job gets the earliest window in
//! which all its constraints hold, then the jobs are ranked and the best one
//! becomes the scheduled job. There is no backtracking; the pass is simply
//! run again whenever something changes.

use crate::captured_frames::{estimate_job_time, CapturedFramesMap};
use crate::config::{ErrorHandlingStrategy, PipelineOverheads, SchedulerConfig};
use crate::constraints::{scan_forward, ConstraintEvaluator};
use crate::job::{Job, JobId, JobStatus};
use crate::subsystems::WeatherStatus;
use chrono::{DateTime, Duration, Utc};

/// Longest remaining window that still influences the ranking
const MAX_RANKED_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct GreedyParams {
    pub strategy: ErrorHandlingStrategy,
    pub reschedule_errors: bool,
    pub retry_delay: Duration,
    pub remember_progress: bool,
    pub lookahead_nights: u32,
    pub search_step: Duration,
    pub max_required_window: Duration,
    pub overheads: PipelineOverheads,
}

impl Default for GreedyParams {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl GreedyParams {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            strategy: config.error_handling.strategy,
            reschedule_errors: config.error_handling.reschedule_errors,
            retry_delay: config.error_delay(),
            remember_progress: config.remember_job_progress,
            lookahead_nights: config.planning.lookahead_nights,
            search_step: Duration::seconds(config.planning.search_step_secs),
            max_required_window: Duration::seconds(config.planning.max_required_window_secs),
            overheads: config.planning.overheads.clone(),
        }
    }
}

/// Period during which a job can observe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationWindow {
    pub start: DateTime<Utc>,
    /// First instant at which a constraint fails again
    pub end: DateTime<Utc>,
}

/// How a job enters the evaluation pass
enum Admission {
    Skip,
    /// Running; only claims its frames
    Keep,
    /// Considered only when nothing else is feasible
    Deferred,
    Candidate { not_before: DateTime<Utc> },
}

#[derive(Debug)]
pub struct GreedyScheduler {
    params: GreedyParams,
    scheduled_job: Option<JobId>,
    weather: WeatherStatus,
}

impl GreedyScheduler {
    pub fn new(params: GreedyParams) -> Self {
        Self {
            params,
            scheduled_job: None,
            weather: WeatherStatus::Idle,
        }
    }

    pub fn params(&self) -> &GreedyParams {
        &self.params
    }

    /// Last selection made by [`GreedyScheduler::schedule_jobs`]
    pub fn scheduled_job(&self) -> Option<JobId> {
        self.scheduled_job
    }

    pub fn set_weather(&mut self, weather: WeatherStatus) {
        self.weather = weather;
    }

    /// Evaluate the queue and select the next job
    ///
    /// Updates the cached schedule fields and statuses of the jobs; nothing is
    /// started. Returns the log lines worth showing to the user.
    pub fn schedule_jobs(
        &mut self,
        jobs: &mut [Job],
        now: DateTime<Utc>,
        frames: &CapturedFramesMap,
        evaluator: &ConstraintEvaluator,
    ) -> Vec<String> {
        let mut log = Vec::new();
        self.scheduled_job = None;
        if jobs.is_empty() {
            return log;
        }

        let mut available = frames.clone();
        let mut candidates = Vec::new();
        let mut deferred = Vec::new();

        for index in 0..jobs.len() {
            match self.admission(&jobs[index], now) {
                Admission::Skip => {}
                Admission::Keep => {
                    estimate_job_time(
                        &mut jobs[index],
                        &mut available,
                        self.params.remember_progress,
                        &self.params.overheads,
                    );
                }
                Admission::Deferred => deferred.push(index),
                Admission::Candidate { not_before } => {
                    if self.prepare(&mut jobs[index], now, &mut available, &mut log) {
                        candidates.push((index, not_before));
                    }
                }
            }
        }

        let mut feasible = self.find_windows(jobs, &candidates, now, evaluator, &mut log);

        if feasible.is_empty() && !deferred.is_empty() {
            let mut requeued = Vec::new();
            for index in deferred {
                log.push(format!("Requeuing job '{}' for evaluation.", jobs[index].name));
                let not_before = self.retry_floor(&jobs[index]).map_or(now, |floor| std::cmp::max(now, floor));
                if self.prepare(&mut jobs[index], now, &mut available, &mut log) {
                    requeued.push((index, not_before));
                }
            }
            feasible = self.find_windows(jobs, &requeued, now, evaluator, &mut log);
        }

        let best = feasible
            .iter()
            .min_by_key(|(index, window)| self.rank_key(&jobs[*index], window, now, *index))
            .map(|(index, _)| *index);

        for (index, window) in &feasible {
            let job = &mut jobs[*index];
            let start = std::cmp::max(window.start, now);
            let estimate = job.estimated_duration.unwrap_or_else(Duration::zero);
            let completion = job.fixed_completion_time().unwrap_or(start + estimate);

            job.altitude_at_startup = valid_altitude(evaluator, job, start);
            job.altitude_at_completion = valid_altitude(evaluator, job, completion);
            job.startup_time = Some(start);
            job.completion_time = Some(completion);
            job.set_status(JobStatus::Scheduled, now);
        }

        if let Some(index) = best {
            let job = &jobs[index];
            tracing::info!(
                "Greedy scheduler selected '{}' to start at {}",
                job.name,
                job.startup_time.map(|t| t.to_rfc3339()).unwrap_or_default()
            );
            self.scheduled_job = Some(job.id);
        }

        log
    }

    /// Re-validate the active job
    ///
    /// Returns false when it must be abandoned; `stop_reason` tells why.
    pub fn check_job(
        &self,
        jobs: &mut [Job],
        now: DateTime<Utc>,
        active: JobId,
        evaluator: &ConstraintEvaluator,
    ) -> bool {
        let preempted_by = jobs
            .iter()
            .filter(|other| other.id != active && other.status() == JobStatus::Scheduled)
            .filter(|other| other.fixed_startup_time().is_some())
            .find(|other| other.startup_time.is_some_and(|start| start <= now))
            .map(|other| other.name.clone());

        let Some(job) = jobs.iter_mut().find(|job| job.id == active) else {
            return false;
        };

        let reason = if job.fixed_completion_time().is_some_and(|end| end <= now) {
            Some("reached its completion time".to_string())
        } else if job.constraints.enforce_weather && self.weather == WeatherStatus::Alert {
            Some("weather alert".to_string())
        } else if !evaluator.satisfies_all(job, now) {
            Some("observation constraints are no longer met".to_string())
        } else if job.fixed_startup_time().is_none() {
            preempted_by.map(|name| format!("preempted by scheduled job '{}'", name))
        } else {
            None
        };

        match reason {
            Some(reason) => {
                tracing::info!("Job '{}' must stop: {}", job.name, reason);
                job.stop_reason = reason;
                false
            }
            None => true,
        }
    }

    fn admission(&self, job: &Job, now: DateTime<Utc>) -> Admission {
        // A job that failed before keeps its retry delay even once requeued
        let not_before = self.retry_floor(job).map_or(now, |floor| std::cmp::max(now, floor));

        match job.status() {
            JobStatus::Busy => Admission::Keep,
            JobStatus::Complete | JobStatus::Invalid => Admission::Skip,
            JobStatus::Idle | JobStatus::Evaluation | JobStatus::Scheduled => Admission::Candidate { not_before },
            JobStatus::Error if !self.params.reschedule_errors => Admission::Skip,
            JobStatus::Aborted | JobStatus::Error => match self.params.strategy {
                ErrorHandlingStrategy::DontRestart => Admission::Skip,
                ErrorHandlingStrategy::RestartAfterTermination => Admission::Deferred,
                ErrorHandlingStrategy::RestartImmediately => Admission::Candidate { not_before },
            },
        }
    }

    /// Earliest retry after the last abort or error of `job`
    fn retry_floor(&self, job: &Job) -> Option<DateTime<Utc>> {
        let failed_at = match (job.last_abort_time, job.last_error_time) {
            (Some(aborted), Some(errored)) => Some(std::cmp::max(aborted, errored)),
            (aborted, errored) => aborted.or(errored),
        };
        failed_at.map(|t| t + self.params.retry_delay)
    }

    /// Reset a job for this pass, returns whether it still has work to do
    fn prepare(
        &self,
        job: &mut Job,
        now: DateTime<Utc>,
        available: &mut CapturedFramesMap,
        log: &mut Vec<String>,
    ) -> bool {
        job.clear_cache();
        job.set_status(JobStatus::Evaluation, now);

        if job.fixed_completion_time().is_some_and(|end| end <= now) {
            job.set_status(JobStatus::Complete, now);
            log.push(format!("Job '{}' reached its completion time, marking complete.", job.name));
            return false;
        }

        if estimate_job_time(job, available, self.params.remember_progress, &self.params.overheads).is_none() {
            job.set_status(JobStatus::Complete, now);
            log.push(format!("Job '{}' has no more frames to capture, marking complete.", job.name));
            return false;
        }
        true
    }

    fn find_windows(
        &self,
        jobs: &mut [Job],
        candidates: &[(usize, DateTime<Utc>)],
        now: DateTime<Utc>,
        evaluator: &ConstraintEvaluator,
        log: &mut Vec<String>,
    ) -> Vec<(usize, ObservationWindow)> {
        let mut feasible = Vec::new();
        for &(index, not_before) in candidates {
            let job = &mut jobs[index];
            let from = match job.fixed_startup_time() {
                Some(start) => std::cmp::max(start, not_before),
                None => not_before,
            };
            match self.find_window(job, std::cmp::max(from, now), evaluator) {
                Some(window) => feasible.push((index, window)),
                None => {
                    job.set_status(JobStatus::Invalid, now);
                    log.push(format!(
                        "Job '{}' cannot be scheduled, its constraints are not met within the planning horizon, marking invalid.",
                        job.name
                    ));
                }
            }
        }
        feasible
    }

    /// Earliest window from `from` in which the job can run its required span
    pub fn find_window(
        &self,
        job: &Job,
        from: DateTime<Utc>,
        evaluator: &ConstraintEvaluator,
    ) -> Option<ObservationWindow> {
        let deadline = job.fixed_completion_time();
        let limit = deadline.unwrap_or(from + Duration::days(self.params.lookahead_nights as i64));
        if from >= limit {
            return None;
        }

        let required = job
            .estimated_duration
            .unwrap_or_else(Duration::zero)
            .min(self.params.max_required_window);
        let holds = |t: DateTime<Utc>| {
            let span = match deadline {
                Some(end) => required.min(end - t),
                None => required,
            };
            self.holds_through(job, t, span, evaluator)
        };

        let start = if holds(from) {
            from
        } else {
            scan_forward(from, limit, self.params.search_step, holds)?
        };
        if start >= limit {
            return None;
        }

        let day_later = start + Duration::hours(MAX_RANKED_WINDOW_HOURS);
        let cap = match deadline {
            Some(end) => std::cmp::min(day_later, end),
            None => day_later,
        };
        let end = scan_forward(start, cap, self.params.search_step, |t| !evaluator.satisfies_all(job, t)).unwrap_or(cap);

        Some(ObservationWindow { start, end })
    }

    fn holds_through(&self, job: &Job, start: DateTime<Utc>, span: Duration, evaluator: &ConstraintEvaluator) -> bool {
        let end = start + span;
        let mut t = start;
        loop {
            if !evaluator.satisfies_all(job, t) {
                return false;
            }
            if t >= end {
                return true;
            }
            t = std::cmp::min(t + self.params.search_step, end);
        }
    }

    fn rank_key(
        &self,
        job: &Job,
        window: &ObservationWindow,
        now: DateTime<Utc>,
        index: usize,
    ) -> (DateTime<Utc>, u8, i64, usize) {
        let start = std::cmp::max(window.start, now);
        let class = if job.fixed_startup_time().is_some() { 0 } else { 1 };
        let remaining = (window.end - start)
            .num_seconds()
            .clamp(0, MAX_RANKED_WINDOW_HOURS * 3600);
        (start, class, remaining, index)
    }
}

fn valid_altitude(evaluator: &ConstraintEvaluator, job: &Job, time: DateTime<Utc>) -> Option<f64> {
    let reading = evaluator.altitude(&job.target, time);
    reading.is_valid().then_some(reading.degrees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::astro::{julian_day, local_sidereal_time};
    use crate::constraints::{ArtificialHorizon, ObserverLocation, TwilightSettings};
    use crate::job::{CompletionCondition, JobConstraints, StartupCondition, Target};
    use crate::sequence::SequenceJob;
    use chrono::TimeZone;

    fn evaluator() -> ConstraintEvaluator {
        ConstraintEvaluator::new(
            ObserverLocation::new(45.0, 0.0),
            TwilightSettings::default(),
            ArtificialHorizon::default(),
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 20, 0, 0).unwrap()
    }

    /// Target with the given hour angle at `now()`
    fn target_at_hour_angle(hour_angle: f64, dec: f64) -> Target {
        let lst = local_sidereal_time(julian_day(&now()), 0.0);
        Target::new((lst - hour_angle).rem_euclid(24.0), dec)
    }

    fn job(name: &str, target: Target) -> Job {
        let mut job = Job::new(name, target, format!("/seq/{}.esq", name)).with_constraints(JobConstraints {
            min_altitude: Some(15.0),
            ..Default::default()
        });
        job.sequence_jobs = vec![SequenceJob::light("L", 60.0, 10, format!("/data/{}", name))];
        job
    }

    fn scheduler() -> GreedyScheduler {
        GreedyScheduler::new(GreedyParams::default())
    }

    #[test]
    fn test_empty_queue_is_noop() {
        let mut greedy = scheduler();
        let log = greedy.schedule_jobs(&mut [], now(), &CapturedFramesMap::new(), &evaluator());
        assert!(log.is_empty());
        assert!(greedy.scheduled_job().is_none());
    }

    #[test]
    fn test_schedule_is_idempotent() {
        let mut greedy = scheduler();
        let mut jobs = vec![
            job("A", target_at_hour_angle(-2.0, 30.0)),
            job("B", target_at_hour_angle(2.0, 30.0)),
            job("C", target_at_hour_angle(-8.0, 10.0)),
        ];
        let frames = CapturedFramesMap::new();

        greedy.schedule_jobs(&mut jobs, now(), &frames, &evaluator());
        let first: Vec<_> = jobs.iter().map(|j| (j.status(), j.startup_time, j.completion_time)).collect();
        let selected = greedy.scheduled_job();

        greedy.schedule_jobs(&mut jobs, now(), &frames, &evaluator());
        let second: Vec<_> = jobs.iter().map(|j| (j.status(), j.startup_time, j.completion_time)).collect();

        assert!(selected.is_some());
        assert_eq!(selected, greedy.scheduled_job());
        assert_eq!(first, second);
    }

    #[test]
    fn test_setting_target_goes_first() {
        let mut greedy = scheduler();
        let mut jobs = vec![
            job("Rising", target_at_hour_angle(-3.0, 20.0)),
            job("Setting", target_at_hour_angle(3.0, 20.0)),
        ];
        greedy.schedule_jobs(&mut jobs, now(), &CapturedFramesMap::new(), &evaluator());

        assert_eq!(greedy.scheduled_job(), Some(jobs[1].id));
        assert_eq!(jobs[0].status(), JobStatus::Scheduled);
        assert_eq!(jobs[0].startup_time, Some(now()));
    }

    #[test]
    fn test_fixed_start_before_asap() {
        let mut greedy = scheduler();
        let mut jobs = vec![
            job("Asap", target_at_hour_angle(3.0, 20.0)),
            job("Fixed", target_at_hour_angle(-3.0, 20.0)).with_startup(StartupCondition::At(now())),
        ];
        greedy.schedule_jobs(&mut jobs, now(), &CapturedFramesMap::new(), &evaluator());
        assert_eq!(greedy.scheduled_job(), Some(jobs[1].id));
    }

    #[test]
    fn test_rising_target_is_deferred_to_crossing() {
        let eval = evaluator();
        // Altitude 10 degrees on the eastern side for a target on the equator
        let hour_angle = -(((10.0f64).to_radians().sin() / (45.0f64).to_radians().cos()).acos().to_degrees() / 15.0);
        let mut jobs = vec![job("East", target_at_hour_angle(hour_angle, 0.0))];

        let reading = eval.altitude(&jobs[0].target, now());
        assert!((reading.degrees - 10.0).abs() < 0.1);
        assert!(!reading.is_setting);

        let mut greedy = scheduler();
        greedy.schedule_jobs(&mut jobs, now(), &CapturedFramesMap::new(), &eval);

        let start = jobs[0].startup_time.unwrap();
        assert!(start > now() + Duration::minutes(20));
        assert!(eval.altitude(&jobs[0].target, start).degrees >= 15.0);
        assert!(eval.altitude(&jobs[0].target, start - Duration::seconds(2)).degrees < 15.0);
        assert_eq!(greedy.scheduled_job(), Some(jobs[0].id));
    }

    #[test]
    fn test_unobservable_job_is_invalid() {
        let mut greedy = scheduler();
        let mut jobs = vec![job("South", Target::new(0.0, -80.0))];
        let log = greedy.schedule_jobs(&mut jobs, now(), &CapturedFramesMap::new(), &evaluator());

        assert_eq!(jobs[0].status(), JobStatus::Invalid);
        assert!(greedy.scheduled_job().is_none());
        assert!(log[0].contains("South"));
    }

    #[test]
    fn test_completed_frames_complete_the_job() {
        let mut greedy = scheduler();
        let mut jobs = vec![job("Done", target_at_hour_angle(0.0, 30.0))];
        let mut frames = CapturedFramesMap::new();
        frames.insert("/data/Done/Light/L/1x1".to_string(), 10);

        greedy.schedule_jobs(&mut jobs, now(), &frames, &evaluator());
        assert_eq!(jobs[0].status(), JobStatus::Complete);
        assert!(greedy.scheduled_job().is_none());
    }

    #[test]
    fn test_past_deadline_completes() {
        let mut greedy = scheduler();
        let mut jobs = vec![job("Late", target_at_hour_angle(0.0, 30.0))
            .with_completion(CompletionCondition::Until(now() - Duration::minutes(1)))];
        greedy.schedule_jobs(&mut jobs, now(), &CapturedFramesMap::new(), &evaluator());
        assert_eq!(jobs[0].status(), JobStatus::Complete);
    }

    #[test]
    fn test_aborted_jobs_follow_strategy() {
        let eval = evaluator();
        let mut params = GreedyParams::default();
        params.strategy = ErrorHandlingStrategy::DontRestart;
        let mut greedy = GreedyScheduler::new(params.clone());

        let mut jobs = vec![job("A", target_at_hour_angle(0.0, 30.0))];
        jobs[0].set_status(JobStatus::Aborted, now() - Duration::minutes(1));
        greedy.schedule_jobs(&mut jobs, now(), &CapturedFramesMap::new(), &eval);
        assert_eq!(jobs[0].status(), JobStatus::Aborted);
        assert!(greedy.scheduled_job().is_none());

        params.strategy = ErrorHandlingStrategy::RestartAfterTermination;
        let mut greedy = GreedyScheduler::new(params.clone());
        jobs.push(job("B", target_at_hour_angle(1.0, 30.0)));
        greedy.schedule_jobs(&mut jobs, now(), &CapturedFramesMap::new(), &eval);
        assert_eq!(jobs[0].status(), JobStatus::Aborted);
        assert_eq!(greedy.scheduled_job(), Some(jobs[1].id));

        jobs.pop();
        greedy.schedule_jobs(&mut jobs, now(), &CapturedFramesMap::new(), &eval);
        assert_eq!(jobs[0].status(), JobStatus::Scheduled);
        assert_eq!(greedy.scheduled_job(), Some(jobs[0].id));
    }

    #[test]
    fn test_restart_immediately_waits_for_delay() {
        let mut params = GreedyParams::default();
        params.strategy = ErrorHandlingStrategy::RestartImmediately;
        params.retry_delay = Duration::minutes(10);
        let mut greedy = GreedyScheduler::new(params);

        let aborted_at = now() - Duration::minutes(1);
        let mut jobs = vec![job("A", target_at_hour_angle(0.0, 30.0))];
        jobs[0].set_status(JobStatus::Aborted, aborted_at);
        greedy.schedule_jobs(&mut jobs, now(), &CapturedFramesMap::new(), &evaluator());

        assert_eq!(jobs[0].status(), JobStatus::Scheduled);
        assert_eq!(jobs[0].startup_time, Some(aborted_at + Duration::minutes(10)));
    }

    #[test]
    fn test_retry_delay_survives_reevaluation() {
        let mut params = GreedyParams::default();
        params.strategy = ErrorHandlingStrategy::RestartImmediately;
        params.retry_delay = Duration::minutes(10);
        let mut greedy = GreedyScheduler::new(params);
        let eval = evaluator();

        let aborted_at = now() - Duration::minutes(1);
        let mut jobs = vec![job("A", target_at_hour_angle(0.0, 30.0))];
        jobs[0].set_status(JobStatus::Aborted, aborted_at);

        greedy.schedule_jobs(&mut jobs, now(), &CapturedFramesMap::new(), &eval);
        let first = jobs[0].startup_time;
        greedy.schedule_jobs(&mut jobs, now(), &CapturedFramesMap::new(), &eval);

        assert_eq!(jobs[0].status(), JobStatus::Scheduled);
        assert_eq!(jobs[0].startup_time, first);
        assert_eq!(jobs[0].startup_time, Some(aborted_at + Duration::minutes(10)));
    }

    #[test]
    fn test_errors_need_rescheduling_flag() {
        let mut params = GreedyParams::default();
        params.strategy = ErrorHandlingStrategy::RestartImmediately;
        let mut jobs = vec![job("A", target_at_hour_angle(0.0, 30.0))];
        jobs[0].set_status(JobStatus::Error, now());

        let mut greedy = GreedyScheduler::new(params.clone());
        greedy.schedule_jobs(&mut jobs, now(), &CapturedFramesMap::new(), &evaluator());
        assert_eq!(jobs[0].status(), JobStatus::Error);

        params.reschedule_errors = true;
        let mut greedy = GreedyScheduler::new(params);
        greedy.schedule_jobs(&mut jobs, now(), &CapturedFramesMap::new(), &evaluator());
        assert_eq!(jobs[0].status(), JobStatus::Scheduled);
    }

    #[test]
    fn test_check_job() {
        let eval = evaluator();
        let mut greedy = scheduler();
        let mut jobs = vec![job("Active", target_at_hour_angle(0.5, 30.0))];
        jobs[0].constraints.enforce_weather = true;
        jobs[0].set_status(JobStatus::Busy, now());
        let active = jobs[0].id;

        assert!(greedy.check_job(&mut jobs, now(), active, &eval));

        greedy.set_weather(WeatherStatus::Alert);
        assert!(!greedy.check_job(&mut jobs, now(), active, &eval));
        assert_eq!(jobs[0].stop_reason, "weather alert");
        greedy.set_weather(WeatherStatus::Ok);

        // A fixed start job becoming due takes over
        let mut fixed = job("Fixed", target_at_hour_angle(-1.0, 30.0)).with_startup(StartupCondition::At(now()));
        fixed.startup_time = Some(now());
        fixed.set_status(JobStatus::Scheduled, now());
        jobs.push(fixed);
        assert!(!greedy.check_job(&mut jobs, now(), active, &eval));
        assert!(jobs[0].stop_reason.contains("Fixed"));
        jobs.pop();

        jobs[0].constraints.min_altitude = Some(89.0);
        assert!(!greedy.check_job(&mut jobs, now(), active, &eval));

        assert!(!greedy.check_job(&mut jobs, now(), JobId::new_v4(), &eval));
    }
}
