//! Observatory subsystem interface
//!
//! The scheduler drives the hardware through [`ObservatoryOps`]. Commands are
//! fire-and-forget: their outcome comes back later as a [`SubsystemEvent`]
//! or is observed by polling the typed status getters. A status getter that
//! returns an error means the subsystem is gone.

use crate::job::Target;
use crate::sequence::FrameType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result type for subsystem operations
pub type DeviceResult<T> = Result<T, String>;

// =============================================================================
// STATUS TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureState {
    Idle,
    Progress,
    Capturing,
    Paused,
    Suspended,
    Aborted,
    ImageReceived,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FocusState {
    Idle,
    Progress,
    Waiting,
    Complete,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlignState {
    Idle,
    Progress,
    Suspended,
    Complete,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuideState {
    Idle,
    Disconnected,
    Connected,
    Calibrating,
    CalibrationError,
    CalibrationSuccess,
    Guiding,
    Dithering,
    DitheringError,
    Aborted,
    Suspended,
}

impl GuideState {
    /// The guider does nothing and waits for a command
    pub fn is_idle(self) -> bool {
        matches!(self, GuideState::Idle | GuideState::Connected | GuideState::Disconnected)
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            GuideState::CalibrationError | GuideState::DitheringError | GuideState::Aborted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MountStatus {
    Idle,
    Moving,
    Slewing,
    Tracking,
    Parking,
    Parked,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParkStatus {
    Unknown,
    Parked,
    Parking,
    Unparking,
    Unparked,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WeatherStatus {
    #[default]
    Idle,
    Ok,
    Warning,
    Alert,
}

impl fmt::Display for WeatherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeatherStatus::Idle => write!(f, "Idle"),
            WeatherStatus::Ok => write!(f, "Ok"),
            WeatherStatus::Warning => write!(f, "Warning"),
            WeatherStatus::Alert => write!(f, "Alert"),
        }
    }
}

/// Devices the scheduler can ask to reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Mount,
    Capture,
    Focus,
    Align,
    Guide,
    Dome,
    DustCap,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Device::Mount => "mount",
            Device::Capture => "capture",
            Device::Focus => "focus",
            Device::Align => "align",
            Device::Guide => "guide",
            Device::Dome => "dome",
            Device::DustCap => "dust cap",
        };
        write!(f, "{}", text)
    }
}

// =============================================================================
// REQUESTS AND EVENT PAYLOADS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub job_name: String,
    pub sequence_file: PathBuf,
    /// Continue an interrupted sequence instead of loading it again
    pub restart: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveRequest {
    pub filename: PathBuf,
    pub target: Target,
    pub timeout_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub frame_type: FrameType,
    pub filename: PathBuf,
    pub exposure: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveOutcome {
    pub timed_out: bool,
    pub success: bool,
    /// Solved right ascension in hours
    pub ra_hours: f64,
    /// Solved declination in degrees
    pub dec_degrees: f64,
    pub elapsed_secs: f64,
}

/// Notifications coming back from the subsystems
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubsystemEvent {
    CaptureStatus(CaptureState),
    CaptureComplete(CaptureMetadata),
    FocusStatus(FocusState),
    AlignStatus(AlignState),
    GuideStatus(GuideState),
    MountStatus(MountStatus),
    WeatherStatus(WeatherStatus),
    SolverDone(SolveOutcome),
    ScriptFinished { exit_code: i32 },
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Trait defining the hardware operations the scheduler needs
#[async_trait]
pub trait ObservatoryOps: Send + Sync {
    // Mount
    async fn start_slew(&self, target: &Target) -> DeviceResult<()>;
    async fn abort_slew(&self) -> DeviceResult<()>;
    async fn mount_status(&self) -> DeviceResult<MountStatus>;
    async fn park_mount(&self) -> DeviceResult<()>;
    async fn unpark_mount(&self) -> DeviceResult<()>;
    async fn mount_park_status(&self) -> DeviceResult<ParkStatus>;

    // Dome
    async fn dome_is_moving(&self) -> DeviceResult<bool>;
    async fn park_dome(&self) -> DeviceResult<()>;
    async fn unpark_dome(&self) -> DeviceResult<()>;
    async fn dome_park_status(&self) -> DeviceResult<ParkStatus>;

    // Dust cap
    async fn park_cap(&self) -> DeviceResult<()>;
    async fn unpark_cap(&self) -> DeviceResult<()>;
    async fn cap_park_status(&self) -> DeviceResult<ParkStatus>;

    // Focus
    async fn start_focus(&self) -> DeviceResult<()>;
    async fn abort_focus(&self) -> DeviceResult<()>;
    async fn focus_status(&self) -> DeviceResult<FocusState>;

    // Align
    async fn start_alignment(&self, target: &Target) -> DeviceResult<()>;
    async fn abort_align(&self) -> DeviceResult<()>;
    async fn align_status(&self) -> DeviceResult<AlignState>;
    async fn set_align_target(&self, target: &Target) -> DeviceResult<()>;

    // Guide
    async fn start_guiding(&self, reset_calibration: bool) -> DeviceResult<()>;
    async fn stop_guiding(&self) -> DeviceResult<()>;
    async fn guide_status(&self) -> DeviceResult<GuideState>;

    // Capture
    async fn start_capture(&self, request: &CaptureRequest) -> DeviceResult<()>;
    /// Returns once the capture module acknowledged the abort
    async fn abort_capture(&self) -> DeviceResult<()>;
    async fn capture_status(&self) -> DeviceResult<CaptureState>;
    async fn set_capture_target_name(&self, name: Option<&str>) -> DeviceResult<()>;
    async fn set_ccd_cooler(&self, enabled: bool) -> DeviceResult<()>;

    // Solver and scripts
    async fn solve_frame(&self, request: &SolveRequest) -> DeviceResult<()>;
    async fn run_script(&self, path: &Path) -> DeviceResult<()>;

    async fn reconnect(&self, device: Device) -> DeviceResult<()>;
}

pub type SharedObservatoryOps = Arc<dyn ObservatoryOps>;

/// Observatory that accepts every command and reports everything as idle
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObservatoryOps;

#[async_trait]
impl ObservatoryOps for NullObservatoryOps {
    async fn start_slew(&self, target: &Target) -> DeviceResult<()> {
        tracing::info!("[NULL] Slew to RA={:.4}h, Dec={:.4}°", target.ra_hours, target.dec_degrees);
        Ok(())
    }

    async fn abort_slew(&self) -> DeviceResult<()> {
        tracing::info!("[NULL] Aborting mount slew");
        Ok(())
    }

    async fn mount_status(&self) -> DeviceResult<MountStatus> {
        Ok(MountStatus::Tracking)
    }

    async fn park_mount(&self) -> DeviceResult<()> {
        tracing::info!("[NULL] Parking mount");
        Ok(())
    }

    async fn unpark_mount(&self) -> DeviceResult<()> {
        tracing::info!("[NULL] Unparking mount");
        Ok(())
    }

    async fn mount_park_status(&self) -> DeviceResult<ParkStatus> {
        Ok(ParkStatus::Unparked)
    }

    async fn dome_is_moving(&self) -> DeviceResult<bool> {
        Ok(false)
    }

    async fn park_dome(&self) -> DeviceResult<()> {
        tracing::info!("[NULL] Parking dome");
        Ok(())
    }

    async fn unpark_dome(&self) -> DeviceResult<()> {
        tracing::info!("[NULL] Unparking dome");
        Ok(())
    }

    async fn dome_park_status(&self) -> DeviceResult<ParkStatus> {
        Ok(ParkStatus::Unparked)
    }

    async fn park_cap(&self) -> DeviceResult<()> {
        tracing::info!("[NULL] Closing dust cap");
        Ok(())
    }

    async fn unpark_cap(&self) -> DeviceResult<()> {
        tracing::info!("[NULL] Opening dust cap");
        Ok(())
    }

    async fn cap_park_status(&self) -> DeviceResult<ParkStatus> {
        Ok(ParkStatus::Unparked)
    }

    async fn start_focus(&self) -> DeviceResult<()> {
        tracing::info!("[NULL] Starting autofocus");
        Ok(())
    }

    async fn abort_focus(&self) -> DeviceResult<()> {
        Ok(())
    }

    async fn focus_status(&self) -> DeviceResult<FocusState> {
        Ok(FocusState::Idle)
    }

    async fn start_alignment(&self, target: &Target) -> DeviceResult<()> {
        tracing::info!("[NULL] Aligning on RA={:.4}h, Dec={:.4}°", target.ra_hours, target.dec_degrees);
        Ok(())
    }

    async fn abort_align(&self) -> DeviceResult<()> {
        Ok(())
    }

    async fn align_status(&self) -> DeviceResult<AlignState> {
        Ok(AlignState::Idle)
    }

    async fn set_align_target(&self, _target: &Target) -> DeviceResult<()> {
        Ok(())
    }

    async fn start_guiding(&self, reset_calibration: bool) -> DeviceResult<()> {
        tracing::info!("[NULL] Starting guiding (reset calibration: {})", reset_calibration);
        Ok(())
    }

    async fn stop_guiding(&self) -> DeviceResult<()> {
        Ok(())
    }

    async fn guide_status(&self) -> DeviceResult<GuideState> {
        Ok(GuideState::Idle)
    }

    async fn start_capture(&self, request: &CaptureRequest) -> DeviceResult<()> {
        tracing::info!(
            "[NULL] Starting capture of {} from {}",
            request.job_name,
            request.sequence_file.display()
        );
        Ok(())
    }

    async fn abort_capture(&self) -> DeviceResult<()> {
        tracing::info!("[NULL] Aborting capture");
        Ok(())
    }

    async fn capture_status(&self) -> DeviceResult<CaptureState> {
        Ok(CaptureState::Idle)
    }

    async fn set_capture_target_name(&self, _name: Option<&str>) -> DeviceResult<()> {
        Ok(())
    }

    async fn set_ccd_cooler(&self, enabled: bool) -> DeviceResult<()> {
        tracing::info!("[NULL] Camera cooler {}", if enabled { "on" } else { "off" });
        Ok(())
    }

    async fn solve_frame(&self, request: &SolveRequest) -> DeviceResult<()> {
        tracing::info!("[NULL] Solving {}", request.filename.display());
        Ok(())
    }

    async fn run_script(&self, path: &Path) -> DeviceResult<()> {
        tracing::info!("[NULL] Running script {}", path.display());
        Ok(())
    }

    async fn reconnect(&self, device: Device) -> DeviceResult<()> {
        tracing::info!("[NULL] Reconnecting {}", device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guide_state_groups() {
        assert!(GuideState::Connected.is_idle());
        assert!(GuideState::Disconnected.is_idle());
        assert!(!GuideState::Guiding.is_idle());
        assert!(GuideState::CalibrationError.is_error());
        assert!(!GuideState::Guiding.is_error());
    }

    #[test]
    fn test_null_ops_accepts_commands() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let ops: SharedObservatoryOps = Arc::new(NullObservatoryOps);
            assert!(ops.start_slew(&Target::new(1.0, 2.0)).await.is_ok());
            assert_eq!(ops.mount_status().await, Ok(MountStatus::Tracking));
            assert_eq!(ops.capture_status().await, Ok(CaptureState::Idle));
            assert!(ops.reconnect(Device::Guide).await.is_ok());
        });
    }

    #[test]
    fn test_event_serde() {
        let event = SubsystemEvent::CaptureComplete(CaptureMetadata {
            frame_type: FrameType::Light,
            filename: PathBuf::from("/data/M42_001.fits"),
            exposure: 120.0,
            width: 4096,
            height: 2048,
        });
        let json = serde_json::to_string(&event).unwrap();
        let back: SubsystemEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }
}
