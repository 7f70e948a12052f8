//! The scheduling loop and the job-level operations built on it.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::database::models::{JobDbModel, JobFilter, JobPatch, PurgeFilter};
use crate::database::repositories::{JobRepository, stream_jobs};
use crate::domain::{Job, JobState, NewJob};
use crate::scheduler::events::{JobEvent, LauncherEvent};
use crate::scheduler::launcher::ProcessLauncher;
use crate::scheduler::queue::QueueManager;
use crate::scheduler::tracker::StatusTracker;
use crate::utils::fs::ensure_dir_all_with_op;
use crate::{Error, Result};

const LAUNCHER_EVENT_CAPACITY: usize = 1024;
const RECOVERY_PAGE_SIZE: u32 = 500;

/// Failure reason given to jobs found Running at startup.
pub const ORPHANED_REASON: &str = "daemon restarted while the job was running";

/// Owns the queue, launcher and tracker, and runs the admission loop.
pub struct Scheduler {
    config: Arc<SchedulerConfig>,
    repo: Arc<dyn JobRepository>,
    queue: QueueManager,
    launcher: Arc<ProcessLauncher>,
    tracker: Arc<StatusTracker>,
    /// Submission, slot release and cancellation all wake the loop here.
    wakeup: Arc<Notify>,
    launcher_events: parking_lot::Mutex<Option<mpsc::Receiver<LauncherEvent>>>,
    cancellation_token: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, repo: Arc<dyn JobRepository>) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let wakeup = Arc::new(Notify::new());
        let (events_tx, events_rx) = mpsc::channel(LAUNCHER_EVENT_CAPACITY);

        let launcher = Arc::new(ProcessLauncher::new(
            Arc::clone(&config),
            Arc::clone(&repo),
            events_tx,
        ));
        let tracker = Arc::new(StatusTracker::new(
            Arc::clone(&repo),
            Arc::clone(&launcher),
            Arc::clone(&wakeup),
            config.poll_interval,
        ));

        Ok(Arc::new(Self {
            config,
            repo,
            queue: QueueManager::new(),
            launcher,
            tracker,
            wakeup,
            launcher_events: parking_lot::Mutex::new(Some(events_rx)),
            cancellation_token: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        }))
    }

    /// Recover state from the store and start the loop.
    ///
    /// Running jobs left over from a previous run cannot be supervised any
    /// more and are marked Failed. Pending jobs are queued again in
    /// submission order.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let events = self
            .launcher_events
            .lock()
            .take()
            .ok_or_else(|| Error::Other("scheduler already started".to_string()))?;

        ensure_dir_all_with_op("creating log directory", &self.config.log_dir).await?;

        let orphaned = self.repo.fail_orphaned_running(ORPHANED_REASON).await?;
        if orphaned > 0 {
            warn!(orphaned, "Marked jobs left running by a previous run as failed");
        }

        let mut pending = std::pin::pin!(stream_jobs(
            Arc::clone(&self.repo),
            JobFilter::default().with_state(JobState::Pending),
            RECOVERY_PAGE_SIZE,
        ));
        let mut recovered = 0usize;
        while let Some(model) = pending.try_next().await? {
            self.queue.push(Job::try_from(model)?);
            recovered += 1;
        }

        self.tracker.start(events);

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move { scheduler.run().await });
        *self.task.lock() = Some(handle);

        info!(
            recovered,
            max_jobs = self.config.max_jobs,
            max_jobs_per_project = self.config.max_jobs_per_project,
            "Scheduler started"
        );
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let admitted = self.admit();
            if admitted > 0 {
                debug!(
                    admitted,
                    queued = self.queue.len(),
                    running = self.launcher.running_total(),
                    "Admitted jobs"
                );
            }

            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = ticker.tick() => {}
            }
        }
        debug!("Scheduling loop stopped");
    }

    /// Launch queued jobs while both the global and their project's slots
    /// allow it. Returns the number of jobs launched.
    pub fn admit(&self) -> usize {
        let mut admitted = 0;
        while self.launcher.running_total() < self.config.max_jobs {
            let next = self.queue.pop_next(|project| {
                self.launcher.running_in(project) < self.config.slots_for(project)
            });
            let Some(entry) = next else {
                break;
            };
            debug!(
                job_id = %entry.job.id,
                project = %entry.job.project,
                waited_ms = (chrono::Utc::now() - entry.enqueued_at).num_milliseconds(),
                "Admitting job"
            );
            self.launcher.launch(entry.job);
            admitted += 1;
        }
        admitted
    }

    /// Persist and queue a new job.
    pub async fn submit(&self, job: NewJob) -> Result<Job> {
        let job = job.validate()?;
        let model = JobDbModel::pending(&job)?;
        let stored = self
            .repo
            .create_job(&model, Some(self.config.queue_ceiling))
            .await?;
        let job = Job::try_from(stored)?;

        info!(
            job_id = %job.id,
            project = %job.project,
            spider = %job.spider,
            priority = job.priority,
            "Job submitted"
        );

        self.queue.push(job.clone());
        self.tracker
            .publish(JobEvent::new(&job.id, &job.project, JobState::Pending));
        self.wakeup.notify_one();
        Ok(job)
    }

    /// Cancel a job, returning the state it was in.
    ///
    /// A job still Pending in the store is cancelled there at once, even if
    /// it has already been picked for launch: its supervisor then fails to
    /// mark it Running and tears down whatever it started. Running jobs are
    /// handed to their supervisor, which sends SIGTERM and escalates after
    /// the grace period; their final state is recorded asynchronously.
    pub async fn cancel(&self, job_id: &str) -> Result<JobState> {
        let job = self.tracker.snapshot(job_id).await?;
        match job.state {
            JobState::Pending => {}
            JobState::Running => return self.cancel_running(job_id, &job.state.to_string()),
            state => {
                return Err(Error::InvalidStateTransition {
                    from: state.to_string(),
                    to: JobState::Cancelled.to_string(),
                });
            }
        }

        let patch = JobPatch::finished(JobState::Pending, JobState::Cancelled);
        match self.repo.update_job(job_id, &patch).await {
            Ok(_) => {
                self.queue.remove(job_id);
                // Stops an admitted supervisor before it spawns anything.
                self.launcher.cancel(job_id);
                self.tracker
                    .publish(JobEvent::new(job_id, &job.project, JobState::Cancelled));
                self.wakeup.notify_one();
                info!(job_id, project = %job.project, "Pending job cancelled");
                Ok(JobState::Pending)
            }
            // Started while we were looking.
            Err(Error::InvalidStateTransition { from, .. }) if from == JobState::Running.as_str() => {
                self.cancel_running(job_id, &from)
            }
            Err(e) => Err(e),
        }
    }

    fn cancel_running(&self, job_id: &str, from: &str) -> Result<JobState> {
        if self.launcher.cancel(job_id) {
            info!(job_id, "Cancellation requested");
            Ok(JobState::Running)
        } else {
            // Its completion is being recorded right now.
            Err(Error::InvalidStateTransition {
                from: from.to_string(),
                to: JobState::Cancelled.to_string(),
            })
        }
    }

    pub async fn status(&self, job_id: &str) -> Result<Job> {
        self.tracker.snapshot(job_id).await
    }

    pub async fn await_completion(&self, job_id: &str, timeout: Duration) -> Result<Job> {
        self.tracker.await_completion(job_id, timeout).await
    }

    /// Delete terminal jobs and their log files.
    pub async fn purge(&self, filter: &PurgeFilter) -> Result<Vec<Job>> {
        let removed = self.repo.purge_jobs(filter).await?;
        let mut jobs = Vec::with_capacity(removed.len());
        for model in removed {
            let job = Job::try_from(model)?;
            if let Some(path) = &job.log_path
                && let Err(e) = tokio::fs::remove_file(path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(job_id = %job.id, path = %path, error = %e, "Failed to remove job log");
            }
            jobs.push(job);
        }
        info!(purged = jobs.len(), "Purged finished jobs");
        Ok(jobs)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repo
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    pub fn launcher(&self) -> &Arc<ProcessLauncher> {
        &self.launcher
    }

    pub fn tracker(&self) -> &Arc<StatusTracker> {
        &self.tracker
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some() && !self.cancellation_token.is_cancelled()
    }

    /// Stop admitting, cancel running jobs, and record their outcomes.
    pub async fn shutdown(&self) {
        info!("Stopping scheduler");
        self.cancellation_token.cancel();

        let handle = self.task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Scheduling loop ended abnormally");
        }

        self.launcher.shutdown().await;
        self.tracker.stop().await;
        info!("Scheduler stopped");
    }
}
