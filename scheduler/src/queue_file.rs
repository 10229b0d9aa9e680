//! Job queue persistence
//!
//! Queues are stored as pretty-printed JSON. Only what the user configured is
//! written; runtime state (status, stage, estimates) is rebuilt by the next
//! evaluation pass.

use crate::error::{Result, SchedulerError};
use crate::job::Job;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Format version written by this crate
pub const QUEUE_FILE_VERSION: u32 = 1;

/// Storage for the job queue
pub trait PersistenceStore: Send + Sync {
    fn load_jobs(&self) -> Result<Vec<Job>>;
    fn save_jobs(&self, jobs: &[Job]) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    jobs: Vec<Job>,
}

/// Queue stored in a JSON file
#[derive(Debug, Clone)]
pub struct JsonQueueStore {
    path: PathBuf,
}

impl JsonQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistenceStore for JsonQueueStore {
    /// A missing file is an empty queue
    fn load_jobs(&self) -> Result<Vec<Job>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No queue file at {}", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let file: QueueFile = serde_json::from_slice(&bytes)?;
        if file.version > QUEUE_FILE_VERSION {
            return Err(SchedulerError::InvalidConfig(format!(
                "queue file {} has version {}, this build reads up to {}",
                self.path.display(),
                file.version,
                QUEUE_FILE_VERSION
            )));
        }

        let mut jobs = file.jobs;
        for job in &mut jobs {
            job.reset();
        }
        tracing::info!("Read {} jobs from {}", jobs.len(), self.path.display());
        Ok(jobs)
    }

    fn save_jobs(&self, jobs: &[Job]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = QueueFile {
            version: QUEUE_FILE_VERSION,
            jobs: jobs.to_vec(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}
