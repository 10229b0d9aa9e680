//! Observatory procedures
//!
//! Startup, shutdown and park-while-waiting are small state machines stepped
//! once per iteration. Each step either issues a command and moves to the
//! matching "in progress" state, or polls the device until it reports the
//! expected park status. Disabled steps are skipped within the same step.

use super::Scheduler;
use crate::events::SchedulerEvent;
use crate::job::JobStatus;
use crate::state::{ParkWaitState, SchedulerRunState, ShutdownState, StartupState, TimerState};
use crate::subsystems::{Device, DeviceResult, ParkStatus, WeatherStatus};

/// Progress of a park or unpark request
enum ParkProgress {
    Done,
    Waiting,
    Failed,
}

impl Scheduler {
    // =========================================================================
    // STARTUP
    // =========================================================================

    /// Step the startup procedure, returns true once it is complete
    pub(crate) async fn check_startup_state(&mut self) -> bool {
        if self.state.run_state == SchedulerRunState::Paused {
            return false;
        }

        loop {
            let procedures = self.config.procedures.clone();
            match self.state.startup_state {
                StartupState::Idle => {
                    self.append_log_text("Starting startup procedure....");
                    self.set_run_state(SchedulerRunState::Startup);

                    match procedures.startup_script {
                        Some(script) => {
                            self.append_log_text(format!("Executing script {}...", script.display()));
                            self.state.startup_state = StartupState::Script;
                            if let Err(e) = self.ops.run_script(&script).await {
                                self.append_log_text(format!("Startup script failed: {}", e));
                                self.state.startup_state = StartupState::Error;
                            }
                            return false;
                        }
                        None => self.state.startup_state = StartupState::UnparkDome,
                    }
                }
                StartupState::Script | StartupState::Error => return false,

                StartupState::UnparkDome => {
                    if !procedures.unpark_dome {
                        self.state.startup_state = StartupState::UnparkMount;
                        continue;
                    }
                    self.state.startup_state = if self.request_park(Device::Dome, false).await {
                        StartupState::UnparkingDome
                    } else {
                        StartupState::Error
                    };
                    return false;
                }
                StartupState::UnparkingDome => {
                    match self.poll_park(Device::Dome, ParkStatus::Unparked).await {
                        ParkProgress::Done => {
                            self.append_log_text("Dome unparked.");
                            self.state.startup_state = StartupState::UnparkMount;
                            continue;
                        }
                        ParkProgress::Waiting => return false,
                        ParkProgress::Failed => {
                            self.append_log_text("Warning: dome unparking failed.");
                            self.state.startup_state = StartupState::Error;
                            return false;
                        }
                    }
                }

                StartupState::UnparkMount => {
                    if !procedures.unpark_mount {
                        self.state.startup_state = StartupState::UnparkCap;
                        continue;
                    }
                    self.state.startup_state = if self.request_park(Device::Mount, false).await {
                        StartupState::UnparkingMount
                    } else {
                        StartupState::Error
                    };
                    return false;
                }
                StartupState::UnparkingMount => {
                    match self.poll_park(Device::Mount, ParkStatus::Unparked).await {
                        ParkProgress::Done => {
                            self.append_log_text("Mount unparked.");
                            self.state.startup_state = StartupState::UnparkCap;
                            continue;
                        }
                        ParkProgress::Waiting => return false,
                        ParkProgress::Failed => {
                            self.append_log_text("Warning: mount unparking failed.");
                            self.state.startup_state = StartupState::Error;
                            return false;
                        }
                    }
                }

                StartupState::UnparkCap => {
                    if !procedures.open_cap {
                        self.finish_startup();
                        return true;
                    }
                    self.state.startup_state = if self.request_park(Device::DustCap, false).await {
                        StartupState::UnparkingCap
                    } else {
                        StartupState::Error
                    };
                    return false;
                }
                StartupState::UnparkingCap => {
                    match self.poll_park(Device::DustCap, ParkStatus::Unparked).await {
                        ParkProgress::Done => {
                            self.append_log_text("Cap unparked.");
                            self.finish_startup();
                            return true;
                        }
                        ParkProgress::Waiting => return false,
                        ParkProgress::Failed => {
                            self.append_log_text("Warning: cap unparking failed.");
                            self.state.startup_state = StartupState::Error;
                            return false;
                        }
                    }
                }

                StartupState::Complete => {
                    if self.state.run_state == SchedulerRunState::Startup {
                        self.set_run_state(SchedulerRunState::Running);
                    }
                    return true;
                }
            }
        }
    }

    fn finish_startup(&mut self) {
        self.state.startup_state = StartupState::Complete;
        self.append_log_text("Observatory startup is complete.");
        if self.state.run_state == SchedulerRunState::Startup {
            self.set_run_state(SchedulerRunState::Running);
        }
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    /// Start or step the shutdown procedure, returns true once it finished
    pub(crate) async fn check_shutdown_state(&mut self) -> bool {
        if self.state.run_state == SchedulerRunState::Paused {
            return false;
        }

        if self.state.shutdown_state == ShutdownState::Idle {
            tracing::info!("Starting shutdown process...");
            self.append_log_text("Observatory is in the shutdown process.");
            self.set_active_job(None);
            self.set_run_state(SchedulerRunState::Shutdown);
            self.state.shutdown_state = ShutdownState::WarmCcd;
            self.setup(TimerState::Shutdown);
        }

        self.step_shutdown().await
    }

    async fn step_shutdown(&mut self) -> bool {
        loop {
            let procedures = self.config.procedures.clone();
            match self.state.shutdown_state {
                ShutdownState::Idle => return false,

                ShutdownState::WarmCcd => {
                    if procedures.warm_ccd {
                        self.append_log_text("Warming up CCD...");
                        if let Err(e) = self.ops.set_ccd_cooler(false).await {
                            tracing::warn!("Failed to turn the camera cooler off: {}", e);
                        }
                    }
                    self.state.shutdown_state = ShutdownState::ParkCap;
                }

                ShutdownState::ParkCap => {
                    if !procedures.close_cap {
                        self.state.shutdown_state = ShutdownState::ParkMount;
                        continue;
                    }
                    self.state.shutdown_state = if self.request_park(Device::DustCap, true).await {
                        ShutdownState::ParkingCap
                    } else {
                        ShutdownState::Error
                    };
                    return false;
                }
                ShutdownState::ParkingCap => match self.poll_park(Device::DustCap, ParkStatus::Parked).await {
                    ParkProgress::Done => {
                        self.append_log_text("Cap parked.");
                        self.state.shutdown_state = ShutdownState::ParkMount;
                    }
                    ParkProgress::Waiting => return false,
                    ParkProgress::Failed => {
                        self.append_log_text("Warning: cap parking failed.");
                        self.state.shutdown_state = ShutdownState::Error;
                    }
                },

                ShutdownState::ParkMount => {
                    if !procedures.park_mount {
                        self.state.shutdown_state = ShutdownState::ParkDome;
                        continue;
                    }
                    self.state.shutdown_state = if self.request_park(Device::Mount, true).await {
                        ShutdownState::ParkingMount
                    } else {
                        ShutdownState::Error
                    };
                    return false;
                }
                ShutdownState::ParkingMount => match self.poll_park(Device::Mount, ParkStatus::Parked).await {
                    ParkProgress::Done => {
                        self.append_log_text("Mount parked.");
                        self.state.shutdown_state = ShutdownState::ParkDome;
                    }
                    ParkProgress::Waiting => return false,
                    ParkProgress::Failed => {
                        self.append_log_text("Warning: mount parking failed.");
                        self.state.shutdown_state = ShutdownState::Error;
                    }
                },

                ShutdownState::ParkDome => {
                    if !procedures.park_dome {
                        self.state.shutdown_state = ShutdownState::Script;
                        continue;
                    }
                    self.state.shutdown_state = if self.request_park(Device::Dome, true).await {
                        ShutdownState::ParkingDome
                    } else {
                        ShutdownState::Error
                    };
                    return false;
                }
                ShutdownState::ParkingDome => match self.poll_park(Device::Dome, ParkStatus::Parked).await {
                    ParkProgress::Done => {
                        self.append_log_text("Dome parked.");
                        self.state.shutdown_state = ShutdownState::Script;
                    }
                    ParkProgress::Waiting => return false,
                    ParkProgress::Failed => {
                        self.append_log_text("Warning: dome parking failed.");
                        self.state.shutdown_state = ShutdownState::Error;
                    }
                },

                ShutdownState::Script => match procedures.shutdown_script {
                    Some(script) => {
                        self.append_log_text(format!("Executing script {}...", script.display()));
                        self.state.shutdown_state = ShutdownState::ScriptRunning;
                        if let Err(e) = self.ops.run_script(&script).await {
                            self.append_log_text(format!("Shutdown script failed: {}", e));
                            self.state.shutdown_state = ShutdownState::Error;
                            continue;
                        }
                        return false;
                    }
                    None => self.state.shutdown_state = ShutdownState::Complete,
                },
                ShutdownState::ScriptRunning => return false,

                ShutdownState::Complete | ShutdownState::Error => return self.complete_shutdown().await,
            }
        }
    }

    /// Leave the shutdown procedure, going idle or to sleep
    pub(crate) async fn complete_shutdown(&mut self) -> bool {
        let failed = self.state.shutdown_state == ShutdownState::Error;
        if failed {
            self.append_log_text("Shutdown procedure failed, aborting...");
        } else {
            self.append_log_text("Shutdown complete.");
        }

        self.stop_scheduler().await;
        if failed {
            self.set_run_state(SchedulerRunState::Aborted);
        }
        true
    }

    // =========================================================================
    // PARK WHILE WAITING
    // =========================================================================

    /// Step the park-while-waiting procedure
    ///
    /// Returns false while the mount is moving, so that the caller does not
    /// go on with the active job.
    pub(crate) async fn check_park_wait_state(&mut self, job_due: bool) -> bool {
        if self.state.run_state == SchedulerRunState::Paused {
            return false;
        }

        loop {
            match self.state.park_wait_state {
                ParkWaitState::Idle => return true,

                ParkWaitState::Park => {
                    self.state.park_wait_state = if self.request_park(Device::Mount, true).await {
                        ParkWaitState::Parking
                    } else {
                        ParkWaitState::Error
                    };
                    return false;
                }
                ParkWaitState::Parking => match self.poll_park(Device::Mount, ParkStatus::Parked).await {
                    ParkProgress::Done => {
                        self.append_log_text("Mount parked.");
                        self.state.park_wait_state = ParkWaitState::Parked;
                        return false;
                    }
                    ParkProgress::Waiting => return false,
                    ParkProgress::Failed => self.state.park_wait_state = ParkWaitState::Error,
                },

                ParkWaitState::Parked if job_due => self.state.park_wait_state = ParkWaitState::Unpark,
                ParkWaitState::Parked => return true,

                ParkWaitState::Unpark => {
                    self.state.park_wait_state = if self.request_park(Device::Mount, false).await {
                        ParkWaitState::Unparking
                    } else {
                        ParkWaitState::Error
                    };
                    return false;
                }
                ParkWaitState::Unparking => match self.poll_park(Device::Mount, ParkStatus::Unparked).await {
                    ParkProgress::Done => {
                        self.append_log_text("Mount unparked.");
                        self.state.park_wait_state = ParkWaitState::Unparked;
                    }
                    ParkProgress::Waiting => return false,
                    ParkProgress::Failed => self.state.park_wait_state = ParkWaitState::Error,
                },

                ParkWaitState::Unparked => {
                    self.state.park_wait_state = ParkWaitState::Idle;
                    return true;
                }

                ParkWaitState::Error => {
                    self.append_log_text("Warning: mount park or unpark failed while waiting, aborting...");
                    self.stop_scheduler().await;
                    self.set_run_state(SchedulerRunState::Aborted);
                    return false;
                }
            }
        }
    }

    // =========================================================================
    // DEVICES
    // =========================================================================

    /// Ask `device` to park or unpark, returns whether the request was accepted
    async fn request_park(&mut self, device: Device, park: bool) -> bool {
        let verb = if park { "Parking" } else { "Unparking" };
        self.append_log_text(format!("{} {}...", verb, device));

        let result: DeviceResult<()> = match (device, park) {
            (Device::Dome, true) => self.ops.park_dome().await,
            (Device::Dome, false) => self.ops.unpark_dome().await,
            (Device::Mount, true) => self.ops.park_mount().await,
            (Device::Mount, false) => self.ops.unpark_mount().await,
            (Device::DustCap, true) => self.ops.park_cap().await,
            (Device::DustCap, false) => self.ops.unpark_cap().await,
            _ => Ok(()),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                self.append_log_text(format!("Warning: {} request to the {} failed: {}", verb.to_lowercase(), device, e));
                false
            }
        }
    }

    async fn poll_park(&mut self, device: Device, expected: ParkStatus) -> ParkProgress {
        let status = match device {
            Device::Dome => self.ops.dome_park_status().await,
            Device::Mount => self.ops.mount_park_status().await,
            Device::DustCap => self.ops.cap_park_status().await,
            _ => Ok(expected),
        };

        match status {
            Ok(status) if status == expected => ParkProgress::Done,
            Ok(ParkStatus::Error) => ParkProgress::Failed,
            Ok(_) => ParkProgress::Waiting,
            Err(e) => {
                tracing::warn!("{} park status unavailable: {}", device, e);
                if self.manage_connection_loss(device).await {
                    ParkProgress::Waiting
                } else {
                    ParkProgress::Failed
                }
            }
        }
    }

    /// Try to reconnect a device that stopped answering
    pub(crate) async fn manage_connection_loss(&mut self, device: Device) -> bool {
        if !matches!(
            self.state.run_state,
            SchedulerRunState::Running | SchedulerRunState::Startup | SchedulerRunState::Shutdown
        ) {
            return false;
        }

        match self.ops.reconnect(device).await {
            Ok(()) => {
                self.append_log_text(format!("Reconnected to the {}.", device));
                true
            }
            Err(e) => {
                self.append_log_text(format!("Warning: failed to reconnect to the {}: {}", device, e));
                false
            }
        }
    }

    // =========================================================================
    // NOTIFICATIONS
    // =========================================================================

    pub(crate) fn on_script_finished(&mut self, exit_code: i32) {
        if self.state.startup_state == StartupState::Script {
            if exit_code == 0 {
                self.append_log_text("Startup script completed successfully.");
                self.state.startup_state = StartupState::UnparkDome;
            } else {
                self.append_log_text(format!("Startup script failed with exit code {}, aborting...", exit_code));
                self.state.startup_state = StartupState::Error;
            }
        } else if self.state.shutdown_state == ShutdownState::ScriptRunning {
            if exit_code == 0 {
                self.append_log_text("Shutdown script completed successfully.");
                self.state.shutdown_state = ShutdownState::Complete;
            } else {
                self.append_log_text(format!("Shutdown script failed with exit code {}, aborting...", exit_code));
                self.state.shutdown_state = ShutdownState::Error;
            }
        } else {
            tracing::debug!("Ignoring script exit code {} outside of a procedure", exit_code);
        }
    }

    pub(crate) async fn on_weather_status(&mut self, status: WeatherStatus) {
        if status != self.state.weather_status {
            self.state.weather_status = status;
            let message = match status {
                WeatherStatus::Ok => Some("Weather conditions are OK."),
                WeatherStatus::Warning => Some("Warning: weather conditions are in the WARNING zone."),
                WeatherStatus::Alert => Some("Caution: weather conditions are in the DANGER zone!"),
                WeatherStatus::Idle => None,
            };
            if let Some(message) = message {
                self.append_log_text(message);
            }
            self.events.emit(SchedulerEvent::WeatherChanged(status));
        }
        self.greedy.set_weather(status);

        let enforced = self
            .state
            .active_job()
            .is_some_and(|job| job.constraints.enforce_weather);
        if status == WeatherStatus::Alert
            && enforced
            && !matches!(self.state.run_state, SchedulerRunState::Idle | SchedulerRunState::Shutdown)
        {
            self.append_log_text("Starting shutdown procedure due to severe weather.");
            if let Some(id) = self.state.active_job {
                if let Some(job) = self.state.job_mut(id) {
                    job.stop_reason = "severe weather".to_string();
                }
                self.set_job_status(id, JobStatus::Aborted);
                self.stop_current_job_action().await;
                self.emit_job_ended(id);
            }
            self.check_shutdown_state().await;
        }
    }
}
