//! Imaging sequence interface
//!
//! Sequence files are parsed by the capture side; the scheduler only needs
//! the list of sub-jobs to know how many frames a job requires and where they
//! end up on disk.

use crate::error::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    Light,
    Dark,
    Flat,
    Bias,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Light => write!(f, "Light"),
            FrameType::Dark => write!(f, "Dark"),
            FrameType::Flat => write!(f, "Flat"),
            FrameType::Bias => write!(f, "Bias"),
        }
    }
}

/// Where captured frames are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadMode {
    /// Frames are uploaded to this machine
    Client,
    /// Frames stay on the camera host, they cannot be counted from here
    Remote,
    Both,
}

/// One line of an imaging sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceJob {
    pub frame_type: FrameType,
    #[serde(default)]
    pub filter: Option<String>,
    pub exposure_secs: f64,
    pub count: u32,
    #[serde(default = "default_binning")]
    pub binning: (u32, u32),
    pub directory: PathBuf,
    #[serde(default = "default_upload_mode")]
    pub upload_mode: UploadMode,
    /// Delay between two frames
    #[serde(default)]
    pub delay_secs: f64,
}

fn default_binning() -> (u32, u32) {
    (1, 1)
}

fn default_upload_mode() -> UploadMode {
    UploadMode::Client
}

impl SequenceJob {
    pub fn light(filter: &str, exposure_secs: f64, count: u32, directory: impl Into<PathBuf>) -> Self {
        Self {
            frame_type: FrameType::Light,
            filter: Some(filter.to_string()),
            exposure_secs,
            count,
            binning: default_binning(),
            directory: directory.into(),
            upload_mode: UploadMode::Client,
            delay_secs: 0.0,
        }
    }

    /// Storage signature of the frames this line produces
    ///
    /// Two lines with the same signature write into the same place, so their
    /// captured frames are counted together.
    pub fn signature(&self) -> String {
        let filter = self.filter.as_deref().unwrap_or("NoFilter");
        format!(
            "{}/{}/{}/{}x{}",
            self.directory.display(),
            self.frame_type,
            filter,
            self.binning.0,
            self.binning.1
        )
    }

    /// Folder the frames of this line are written to
    pub fn storage_dir(&self) -> PathBuf {
        let dir = self.directory.join(self.frame_type.to_string());
        match &self.filter {
            Some(filter) => dir.join(filter),
            None => dir,
        }
    }

    /// Time needed to take all frames of this line once
    pub fn duration_secs(&self) -> f64 {
        self.count as f64 * (self.exposure_secs + self.delay_secs)
    }

    pub fn counts_on_client(&self) -> bool {
        self.upload_mode != UploadMode::Remote
    }
}

/// Content of a sequence file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceQueue {
    pub jobs: Vec<SequenceJob>,
    /// The capture module refocuses on its own during the sequence
    #[serde(default)]
    pub in_sequence_focus: bool,
}

pub trait SequenceSource: Send + Sync {
    fn load_sequence_queue(&self, path: &Path) -> Result<SequenceQueue>;
}

/// Sequence source backed by memory, for embedding and simulation
#[derive(Debug, Default)]
pub struct StaticSequenceSource {
    queues: RwLock<HashMap<PathBuf, SequenceQueue>>,
}

impl StaticSequenceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, queue: SequenceQueue) {
        match self.queues.write() {
            Ok(mut queues) => {
                queues.insert(path.into(), queue);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(path.into(), queue);
            }
        }
    }
}

impl SequenceSource for StaticSequenceSource {
    fn load_sequence_queue(&self, path: &Path) -> Result<SequenceQueue> {
        let queues = self.queues.read().map_err(|_| SchedulerError::SequenceUnavailable {
            path: path.to_path_buf(),
            reason: "sequence registry is poisoned".to_string(),
        })?;
        queues
            .get(path)
            .cloned()
            .ok_or_else(|| SchedulerError::SequenceUnavailable {
                path: path.to_path_buf(),
                reason: "unknown sequence".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_combines_storage_attributes() {
        let mut job = SequenceJob::light("Ha", 300.0, 10, "/data/M42");
        assert_eq!(job.signature(), "/data/M42/Light/Ha/1x1");

        job.binning = (2, 2);
        job.frame_type = FrameType::Flat;
        assert_eq!(job.signature(), "/data/M42/Flat/Ha/2x2");

        job.filter = None;
        assert_eq!(job.signature(), "/data/M42/Flat/NoFilter/2x2");
    }

    #[test]
    fn test_duration_includes_delay() {
        let mut job = SequenceJob::light("L", 60.0, 10, "/data");
        job.delay_secs = 5.0;
        assert_eq!(job.duration_secs(), 650.0);
    }

    #[test]
    fn test_static_source() {
        let source = StaticSequenceSource::new();
        source.insert(
            "/seq/m31.esq",
            SequenceQueue {
                jobs: vec![SequenceJob::light("L", 60.0, 5, "/data/M31")],
                in_sequence_focus: true,
            },
        );

        let queue = source.load_sequence_queue(Path::new("/seq/m31.esq")).unwrap();
        assert_eq!(queue.jobs.len(), 1);
        assert!(queue.in_sequence_focus);

        let missing = source.load_sequence_queue(Path::new("/seq/none.esq"));
        assert!(matches!(missing, Err(SchedulerError::SequenceUnavailable { .. })));
    }

    #[test]
    fn test_serde_defaults() {
        let json = r#"{"frame_type":"Light","exposure_secs":120.0,"count":4,"directory":"/d"}"#;
        let job: SequenceJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.binning, (1, 1));
        assert_eq!(job.upload_mode, UploadMode::Client);
        assert!(job.filter.is_none());
    }
}
