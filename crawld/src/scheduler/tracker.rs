//! Status tracker.
//!
//! Consumes launcher events and records them in the store. A slot is given
//! back to the launcher only after the job's terminal state is durable, and
//! only then is the scheduling loop woken.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};
use crate::database::repositories::JobRepository;
use crate::domain::{Job, JobState};
use crate::scheduler::events::{CompletionEvent, JobEvent, LauncherEvent};
use crate::scheduler::launcher::ProcessLauncher;

const EVENT_BROADCAST_CAPACITY: usize = 256;

/// Upper bound on the `await_completion` polling interval.
const MAX_AWAIT_POLL: Duration = Duration::from_millis(200);

pub struct StatusTracker {
    repo: Arc<dyn JobRepository>,
    launcher: Arc<ProcessLauncher>,
    /// Wakes the scheduling loop.
    slot_released: Arc<Notify>,
    job_events: broadcast::Sender<JobEvent>,
    poll_interval: Duration,
    cancellation_token: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl StatusTracker {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        launcher: Arc<ProcessLauncher>,
        slot_released: Arc<Notify>,
        poll_interval: Duration,
    ) -> Self {
        let (job_events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        Self {
            repo,
            launcher,
            slot_released,
            job_events,
            poll_interval: poll_interval.min(MAX_AWAIT_POLL),
            cancellation_token: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Start consuming launcher events.
    pub fn start(self: &Arc<Self>, mut events: mpsc::Receiver<LauncherEvent>) {
        let tracker = Arc::clone(self);
        let token = self.cancellation_token.clone();

        let handle = tokio::spawn(async move {
            debug!("Status tracker started");
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => tracker.apply(event).await,
                        None => break,
                    },
                    _ = token.cancelled() => {
                        // Record whatever the launcher already reported.
                        while let Ok(event) = events.try_recv() {
                            tracker.apply(event).await;
                        }
                        break;
                    }
                }
            }
            debug!("Status tracker stopped");
        });

        *self.task.lock() = Some(handle);
    }

    /// Record one launcher event.
    pub async fn apply(&self, event: LauncherEvent) {
        match event {
            LauncherEvent::Started { job_id, project, .. } => {
                self.publish(JobEvent::new(job_id, project, JobState::Running));
            }
            LauncherEvent::Completed(event) => self.complete(event).await,
            LauncherEvent::Abandoned { job_id, project } => {
                debug!(job_id = %job_id, project = %project, "Admitted job abandoned");
                self.launcher.release(&job_id);
                self.slot_released.notify_one();
            }
        }
    }

    async fn complete(&self, event: CompletionEvent) {
        let patch = event.patch();
        match self.repo.update_job(&event.job_id, &patch).await {
            Ok(_) => {
                info!(
                    job_id = %event.job_id,
                    project = %event.project,
                    state = %patch.to,
                    exit_code = ?patch.exit_code,
                    reason = ?patch.failure_reason,
                    "Job completed"
                );
                self.publish(JobEvent::new(&event.job_id, &event.project, patch.to));
            }
            // Cancelled in the store before the launcher noticed.
            Err(Error::InvalidStateTransition { from, .. }) if from == patch.to.as_str() => {
                debug!(job_id = %event.job_id, state = %patch.to, "Outcome already recorded");
            }
            Err(e) => {
                // The slot is released regardless; a job stuck in Running is
                // failed as orphaned on the next startup.
                error!(
                    job_id = %event.job_id,
                    state = %patch.to,
                    error = %e,
                    "Failed to record job completion"
                );
            }
        }

        self.launcher.release(&event.job_id);
        self.slot_released.notify_one();
    }

    /// Broadcast a state change. Having no subscribers is fine.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.job_events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.job_events.subscribe()
    }

    /// Current state of a job, read from the store.
    pub async fn snapshot(&self, job_id: &str) -> Result<Job> {
        Job::try_from(self.repo.get_job(job_id).await?)
    }

    /// Poll until the job is terminal or `timeout` elapses.
    ///
    /// Returns the last snapshot either way; callers check `is_terminal`.
    pub async fn await_completion(&self, job_id: &str, timeout: Duration) -> Result<Job> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.snapshot(job_id).await?;
            if job.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(job);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    /// Drain pending events and stop.
    pub async fn stop(&self) {
        self.cancellation_token.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Status tracker task ended abnormally");
        }
    }
}
