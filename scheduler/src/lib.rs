//! Observatory Job Scheduler
//!
//! Runs a queue of observation jobs unattended over one or more nights.
//!
//! ## Features
//!
//! - Greedy selection of the next job from altitude, moon, twilight, horizon and weather constraints
//! - Per-job pipeline: slew, focus, align, re-slew, guide, capture
//! - Stage watchdogs with bounded retries and connection loss recovery
//! - Observatory startup, shutdown and park-while-waiting procedures
//! - Captured frame bookkeeping shared between duplicate jobs
//! - In-flight alignment check by plate solving captured frames
//! - JSON job queues and configuration
//!
//! Hardware is reached through [`ObservatoryOps`]; the scheduler itself only
//! keeps state and decides.

pub mod astro;
pub mod captured_frames;
pub mod clock;
pub mod config;
pub mod constraints;
pub mod driver;
pub mod error;
pub mod events;
pub mod execution;
pub mod greedy;
pub mod job;
pub mod queue_file;
pub mod scheduler;
pub mod sequence;
pub mod state;
pub mod subsystems;

pub use captured_frames::{CapturedFramesTracker, FrameCounter, SharedFrameCounter, StaticFrameCounter};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ErrorHandlingStrategy, SchedulerConfig, SequenceRepeat};
pub use constraints::{ConstraintEvaluator, ObserverLocation};
pub use driver::{spawn, SchedulerCommand, SchedulerHandle, SchedulerInput};
pub use error::{Result, SchedulerError};
pub use events::{EventBus, SchedulerEvent};
pub use greedy::GreedyScheduler;
pub use job::{CompletionCondition, Job, JobId, JobStage, JobStatus, PipelineSteps, StartupCondition, Target};
pub use queue_file::{JsonQueueStore, PersistenceStore};
pub use scheduler::Scheduler;
pub use sequence::{SequenceJob, SequenceQueue, SequenceSource, StaticSequenceSource};
pub use state::{SchedulerRunState, TimerState};
pub use subsystems::{NullObservatoryOps, ObservatoryOps, SharedObservatoryOps, SubsystemEvent};
