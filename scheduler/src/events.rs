//! Events published by the scheduler
//!
//! Any number of observers (UI, telemetry, tests) subscribe to the broadcast
//! channel. Nothing in the scheduler waits for them.

use crate::job::{JobId, JobStage, JobStatus};
use crate::state::SchedulerRunState;
use crate::subsystems::WeatherStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerEvent {
    StatusChanged(SchedulerRunState),
    /// The job list was edited or re-evaluated
    JobsUpdated,
    JobStatusChanged { id: JobId, name: String, status: JobStatus },
    JobStageChanged { id: JobId, name: String, stage: JobStage },
    JobStarted { id: JobId, name: String },
    JobEnded { id: JobId, name: String, reason: String },
    Log { message: String },
    WeatherChanged(WeatherStatus),
    /// Distance between the solved frame and the job target
    TargetDistance { arcsec: f64 },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscriber is not an error
    pub fn emit(&self, event: SchedulerEvent) {
        let _ = self.tx.send(event);
    }
}
