//! Shared harness for the scheduler integration tests.
//!
//! `MockObservatory` records every command it receives and answers status
//! polls from a scripted `MockStatus`. Park requests take effect at once.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use nightshade_scheduler::sequence::FrameType;
use nightshade_scheduler::subsystems::{
    AlignState, CaptureMetadata, CaptureRequest, CaptureState, Device, DeviceResult, FocusState, GuideState,
    MountStatus, ParkStatus, SolveRequest,
};
use nightshade_scheduler::{
    Job, JobStage, JobStatus, ManualClock, ObservatoryOps, Scheduler, SchedulerConfig, SchedulerEvent, SequenceJob,
    SequenceQueue, StaticFrameCounter, StaticSequenceSource, SubsystemEvent, Target,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const SEQUENCE: &str = "/seq/m42.esq";
pub const FRAMES_DIR: &str = "/data/M42";
pub const FRAMES_PER_BATCH: u32 = 5;
pub const LIGHT_SIGNATURE: &str = "/data/M42/Light/L/1x1";

/// 2024-01-10 22:00 UTC
pub fn night() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 10, 22, 0, 0).unwrap()
}

pub fn m42() -> Job {
    Job::new("M42", Target::new(5.588, -5.391), SEQUENCE)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// MOCK OBSERVATORY
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Slew,
    AbortSlew,
    ParkMount,
    UnparkMount,
    ParkDome,
    UnparkDome,
    ParkCap,
    UnparkCap,
    Focus,
    AbortFocus,
    Align,
    AbortAlign,
    Guide { reset_calibration: bool },
    StopGuiding,
    Capture { restart: bool },
    AbortCapture,
    TargetName(Option<String>),
    Cooler(bool),
    Solve { timeout_secs: f64 },
    Script(PathBuf),
    Reconnect(Device),
}

#[derive(Debug, Clone)]
pub struct MockStatus {
    pub mount: MountStatus,
    pub mount_park: ParkStatus,
    pub dome_park: ParkStatus,
    pub cap_park: ParkStatus,
    pub dome_moving: bool,
    pub focus: FocusState,
    pub align: AlignState,
    pub guide: GuideState,
    pub capture: CaptureState,
    /// Devices whose status polls fail
    pub lost: Vec<Device>,
    pub reconnect_fails: bool,
}

impl Default for MockStatus {
    fn default() -> Self {
        Self {
            mount: MountStatus::Tracking,
            mount_park: ParkStatus::Unparked,
            dome_park: ParkStatus::Unparked,
            cap_park: ParkStatus::Unparked,
            dome_moving: false,
            focus: FocusState::Progress,
            align: AlignState::Progress,
            guide: GuideState::Idle,
            capture: CaptureState::Capturing,
            lost: Vec::new(),
            reconnect_fails: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct MockObservatory {
    commands: Mutex<Vec<Command>>,
    status: Mutex<MockStatus>,
}

impl MockObservatory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count(&self, command: &Command) -> usize {
        self.commands.lock().unwrap().iter().filter(|c| *c == command).count()
    }

    pub fn captures_started(&self) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, Command::Capture { .. }))
            .count()
    }

    pub fn clear(&self) {
        self.commands.lock().unwrap().clear();
    }

    pub fn update(&self, f: impl FnOnce(&mut MockStatus)) {
        f(&mut self.status.lock().unwrap());
    }

    fn record(&self, command: Command) -> DeviceResult<()> {
        self.commands.lock().unwrap().push(command);
        Ok(())
    }

    fn read<T>(&self, device: Device, f: impl FnOnce(&MockStatus) -> T) -> DeviceResult<T> {
        let status = self.status.lock().unwrap();
        if status.lost.contains(&device) {
            return Err(format!("{} is not responding", device));
        }
        Ok(f(&status))
    }
}

#[async_trait]
impl ObservatoryOps for MockObservatory {
    async fn start_slew(&self, _target: &Target) -> DeviceResult<()> {
        self.record(Command::Slew)
    }

    async fn abort_slew(&self) -> DeviceResult<()> {
        self.record(Command::AbortSlew)
    }

    async fn mount_status(&self) -> DeviceResult<MountStatus> {
        self.read(Device::Mount, |s| s.mount)
    }

    async fn park_mount(&self) -> DeviceResult<()> {
        self.update(|s| s.mount_park = ParkStatus::Parked);
        self.record(Command::ParkMount)
    }

    async fn unpark_mount(&self) -> DeviceResult<()> {
        self.update(|s| s.mount_park = ParkStatus::Unparked);
        self.record(Command::UnparkMount)
    }

    async fn mount_park_status(&self) -> DeviceResult<ParkStatus> {
        self.read(Device::Mount, |s| s.mount_park)
    }

    async fn dome_is_moving(&self) -> DeviceResult<bool> {
        self.read(Device::Dome, |s| s.dome_moving)
    }

    async fn park_dome(&self) -> DeviceResult<()> {
        self.update(|s| s.dome_park = ParkStatus::Parked);
        self.record(Command::ParkDome)
    }

    async fn unpark_dome(&self) -> DeviceResult<()> {
        self.update(|s| s.dome_park = ParkStatus::Unparked);
        self.record(Command::UnparkDome)
    }

    async fn dome_park_status(&self) -> DeviceResult<ParkStatus> {
        self.read(Device::Dome, |s| s.dome_park)
    }

    async fn park_cap(&self) -> DeviceResult<()> {
        self.update(|s| s.cap_park = ParkStatus::Parked);
        self.record(Command::ParkCap)
    }

    async fn unpark_cap(&self) -> DeviceResult<()> {
        self.update(|s| s.cap_park = ParkStatus::Unparked);
        self.record(Command::UnparkCap)
    }

    async fn cap_park_status(&self) -> DeviceResult<ParkStatus> {
        self.read(Device::DustCap, |s| s.cap_park)
    }

    async fn start_focus(&self) -> DeviceResult<()> {
        self.record(Command::Focus)
    }

    async fn abort_focus(&self) -> DeviceResult<()> {
        self.record(Command::AbortFocus)
    }

    async fn focus_status(&self) -> DeviceResult<FocusState> {
        self.read(Device::Focus, |s| s.focus)
    }

    async fn start_alignment(&self, _target: &Target) -> DeviceResult<()> {
        self.record(Command::Align)
    }

    async fn abort_align(&self) -> DeviceResult<()> {
        self.record(Command::AbortAlign)
    }

    async fn align_status(&self) -> DeviceResult<AlignState> {
        self.read(Device::Align, |s| s.align)
    }

    async fn set_align_target(&self, _target: &Target) -> DeviceResult<()> {
        Ok(())
    }

    async fn start_guiding(&self, reset_calibration: bool) -> DeviceResult<()> {
        self.record(Command::Guide { reset_calibration })
    }

    async fn stop_guiding(&self) -> DeviceResult<()> {
        self.update(|s| s.guide = GuideState::Connected);
        self.record(Command::StopGuiding)
    }

    async fn guide_status(&self) -> DeviceResult<GuideState> {
        self.read(Device::Guide, |s| s.guide)
    }

    async fn start_capture(&self, request: &CaptureRequest) -> DeviceResult<()> {
        self.record(Command::Capture {
            restart: request.restart,
        })
    }

    async fn abort_capture(&self) -> DeviceResult<()> {
        self.record(Command::AbortCapture)
    }

    async fn capture_status(&self) -> DeviceResult<CaptureState> {
        self.read(Device::Capture, |s| s.capture)
    }

    async fn set_capture_target_name(&self, name: Option<&str>) -> DeviceResult<()> {
        self.record(Command::TargetName(name.map(str::to_string)))
    }

    async fn set_ccd_cooler(&self, enabled: bool) -> DeviceResult<()> {
        self.record(Command::Cooler(enabled))
    }

    async fn solve_frame(&self, request: &SolveRequest) -> DeviceResult<()> {
        self.record(Command::Solve {
            timeout_secs: request.timeout_secs,
        })
    }

    async fn run_script(&self, path: &Path) -> DeviceResult<()> {
        self.record(Command::Script(path.to_path_buf()))
    }

    async fn reconnect(&self, device: Device) -> DeviceResult<()> {
        self.commands.lock().unwrap().push(Command::Reconnect(device));
        let mut status = self.status.lock().unwrap();
        if status.reconnect_fails {
            return Err(format!("{} is gone", device));
        }
        status.lost.retain(|d| *d != device);
        Ok(())
    }
}

// =============================================================================
// HARNESS
// =============================================================================

/// A scheduler wired to a mock observatory and a manual clock
pub struct Harness {
    pub scheduler: Scheduler,
    pub ops: Arc<MockObservatory>,
    pub clock: Arc<ManualClock>,
    pub frames: Arc<StaticFrameCounter>,
    rx: broadcast::Receiver<SchedulerEvent>,
    pub events: Vec<SchedulerEvent>,
    frame_index: u32,
}

impl Harness {
    /// One sequence of five 60 s light frames at [`SEQUENCE`]
    pub fn new(config: SchedulerConfig) -> Self {
        init_tracing();

        let sequences = StaticSequenceSource::new();
        sequences.insert(
            SEQUENCE,
            SequenceQueue {
                jobs: vec![SequenceJob::light("L", 60.0, FRAMES_PER_BATCH, FRAMES_DIR)],
                in_sequence_focus: false,
            },
        );

        let ops = Arc::new(MockObservatory::new());
        let clock = Arc::new(ManualClock::new(night()));
        let frames = Arc::new(StaticFrameCounter::new());
        let scheduler = Scheduler::new(config, ops.clone(), Arc::new(sequences), frames.clone(), clock.clone())
            .expect("valid configuration");
        let rx = scheduler.subscribe();

        Self {
            scheduler,
            ops,
            clock,
            frames,
            rx,
            events: Vec::new(),
            frame_index: 0,
        }
    }

    /// Hand the scheduler over to a control task
    pub fn into_parts(self) -> (Scheduler, Arc<MockObservatory>) {
        (self.scheduler, self.ops)
    }

    pub fn add(&mut self, job: Job) -> nightshade_scheduler::JobId {
        self.scheduler.add_job(job).expect("job accepted")
    }

    pub fn job(&self, id: nightshade_scheduler::JobId) -> &Job {
        self.scheduler.job(id).expect("job in queue")
    }

    pub fn active_stage(&self) -> Option<JobStage> {
        self.scheduler.active_job().map(Job::stage)
    }

    /// Run one iteration and collect the events it published
    pub async fn step(&mut self) -> Option<Duration> {
        let delay = self.scheduler.run_iteration().await;
        self.collect();
        delay
    }

    pub async fn notify(&mut self, event: SubsystemEvent) {
        self.scheduler.handle_event(event).await;
        self.collect();
    }

    /// Step until `done` holds, returns false when it never did
    pub async fn step_until(&mut self, max_iterations: usize, done: impl Fn(&Scheduler) -> bool) -> bool {
        for _ in 0..max_iterations {
            if done(&self.scheduler) {
                return true;
            }
            if self.step().await.is_none() {
                return done(&self.scheduler);
            }
        }
        done(&self.scheduler)
    }

    /// Report the running batch as captured
    ///
    /// With progress remembered, every frame is received and written to
    /// storage before the sequence reports completion.
    pub async fn complete_capture(&mut self) {
        if self.scheduler.config().remember_job_progress {
            for _ in 0..FRAMES_PER_BATCH {
                self.receive_frame(FrameType::Light).await;
            }
        }
        self.notify(SubsystemEvent::CaptureStatus(CaptureState::Complete)).await;
    }

    pub async fn receive_frame(&mut self, frame_type: FrameType) {
        self.frame_index += 1;
        let metadata = CaptureMetadata {
            frame_type,
            filename: PathBuf::from(format!("{}/Light/L/M42_{:04}.fits", FRAMES_DIR, self.frame_index)),
            exposure: 60.0,
            width: 4144,
            height: 2822,
        };
        if frame_type == FrameType::Light {
            self.frames.add(LIGHT_SIGNATURE, 1);
        }
        self.notify(SubsystemEvent::CaptureComplete(metadata)).await;
        self.notify(SubsystemEvent::CaptureStatus(CaptureState::ImageReceived)).await;
    }

    /// Start, then complete every capture until the loop stops by itself
    ///
    /// Returns false when the loop was still running after `max_iterations`.
    pub async fn run_night(&mut self, max_iterations: usize) -> bool {
        self.scheduler.start().expect("scheduler starts");
        for _ in 0..max_iterations {
            let capturing = self
                .scheduler
                .active_job()
                .is_some_and(|job| job.status() == JobStatus::Busy && job.stage() == JobStage::Capturing);
            if capturing {
                self.complete_capture().await;
            } else if self.step().await.is_none() {
                return true;
            }
        }
        false
    }

    pub fn logs(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SchedulerEvent::Log { message } => Some(message.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn logged(&self, text: &str) -> bool {
        self.logs().iter().any(|message| message.contains(text))
    }

    fn collect(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(event) => self.events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }
}
