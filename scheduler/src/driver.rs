//! Control task
//!
//! [`spawn`] moves a [`Scheduler`] onto its own tokio task. The task sleeps
//! until the next iteration is due or until something arrives in its inbox,
//! so every command and every subsystem callback is processed on that one
//! task, in arrival order, between two iterations.
//!
//! Commands carry a reply channel, so the handle reports whether the
//! scheduler accepted them.

use crate::error::{Result, SchedulerError};
use crate::job::{Job, JobId};
use crate::scheduler::Scheduler;
use crate::subsystems::SubsystemEvent;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const INBOX_CAPACITY: usize = 64;

/// Requests from the controlling side
#[derive(Debug, Clone)]
pub enum SchedulerCommand {
    Start,
    Stop,
    Pause,
    /// Evaluate the queue without starting anything
    Evaluate,
    AddJob(Box<Job>),
    RemoveJob(JobId),
    MoveJob { id: JobId, index: usize },
    SortJobsPerAltitude,
}

#[derive(Debug)]
pub enum SchedulerInput {
    Command {
        command: SchedulerCommand,
        reply: oneshot::Sender<Result<()>>,
    },
    Subsystem(SubsystemEvent),
}

/// Sending side of the control task inbox
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerInput>,
}

impl SchedulerHandle {
    pub async fn send(&self, input: SchedulerInput) -> Result<()> {
        self.tx.send(input).await.map_err(|_| SchedulerError::TaskStopped)
    }

    /// Send `command` and wait for the scheduler to apply it
    pub async fn command(&self, command: SchedulerCommand) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerInput::Command { command, reply }).await?;
        rx.await.map_err(|_| SchedulerError::TaskStopped)?
    }

    pub async fn start(&self) -> Result<()> {
        self.command(SchedulerCommand::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.command(SchedulerCommand::Stop).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.command(SchedulerCommand::Pause).await
    }

    pub async fn add_job(&self, job: Job) -> Result<JobId> {
        let id = job.id;
        self.command(SchedulerCommand::AddJob(Box::new(job))).await?;
        Ok(id)
    }

    pub async fn remove_job(&self, id: JobId) -> Result<()> {
        self.command(SchedulerCommand::RemoveJob(id)).await
    }

    pub async fn move_job(&self, id: JobId, index: usize) -> Result<()> {
        self.command(SchedulerCommand::MoveJob { id, index }).await
    }

    /// Forward a subsystem notification
    pub async fn notify(&self, event: SubsystemEvent) -> Result<()> {
        self.send(SchedulerInput::Subsystem(event)).await
    }
}

/// Run `scheduler` on a new task
///
/// The task ends once every handle is dropped and returns the scheduler.
pub fn spawn(scheduler: Scheduler) -> (SchedulerHandle, JoinHandle<Scheduler>) {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    let task = tokio::spawn(run(scheduler, rx));
    (SchedulerHandle { tx }, task)
}

/// Control loop; returns when the inbox is closed
pub async fn run(mut scheduler: Scheduler, mut inbox: mpsc::Receiver<SchedulerInput>) -> Scheduler {
    let mut deadline = scheduler.pending_interval().map(|delay| Instant::now() + delay);

    loop {
        tokio::select! {
            input = inbox.recv() => {
                let Some(input) = input else {
                    tracing::debug!("Scheduler inbox closed, leaving control loop");
                    break;
                };

                let before = (scheduler.timer_state(), scheduler.pending_interval());
                match input {
                    SchedulerInput::Command { command, reply } => {
                        let result = apply_command(&mut scheduler, command).await;
                        if let Err(e) = &result {
                            tracing::warn!("Scheduler command failed: {}", e);
                        }
                        // The caller may have stopped waiting
                        let _ = reply.send(result);
                    }
                    SchedulerInput::Subsystem(event) => scheduler.handle_event(event).await,
                }

                // Only a handler that picked another iteration moves the deadline
                let after = (scheduler.timer_state(), scheduler.pending_interval());
                if after != before {
                    deadline = after.1.map(|delay| Instant::now() + delay);
                }
            }

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = scheduler
                    .run_iteration()
                    .await
                    .map(|delay| Instant::now() + delay);
            }
        }
    }

    scheduler
}

async fn apply_command(scheduler: &mut Scheduler, command: SchedulerCommand) -> Result<()> {
    match command {
        SchedulerCommand::Start => scheduler.start(),
        SchedulerCommand::Stop => {
            scheduler.stop().await;
            Ok(())
        }
        SchedulerCommand::Pause => {
            scheduler.pause();
            Ok(())
        }
        SchedulerCommand::Evaluate => {
            scheduler.start_job_evaluation();
            Ok(())
        }
        SchedulerCommand::AddJob(job) => scheduler.add_job(*job).map(|_| ()),
        SchedulerCommand::RemoveJob(id) => scheduler.remove_job(id).map(|_| ()),
        SchedulerCommand::MoveJob { id, index } => scheduler.move_job(id, index).map(|_| ()),
        SchedulerCommand::SortJobsPerAltitude => scheduler.sort_jobs_per_altitude().map(|_| ()),
    }
}
