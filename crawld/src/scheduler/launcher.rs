//! Process launcher.
//!
//! Every admitted job runs as its own child process, supervised by one tokio
//! task that owns the [`ProcessHandle`]. The launcher keeps a registry of
//! admitted jobs, which is what the global and per-project slot counts are
//! computed from. Entries are only removed by the tracker, once the store
//! reflects the job's final state.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use process_utils::ExitKind;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{RunnerConfig, SchedulerConfig};
use crate::database::models::JobPatch;
use crate::database::repositories::JobRepository;
use crate::domain::{Job, JobState};
use crate::scheduler::events::{CompletionEvent, ExecutionOutcome, LauncherEvent};
use crate::utils::fs::{ensure_parent_dir_with_op, io_error, read_tail, truncate_tail};
use crate::{Error, Result};

/// Lines of log kept in a failure reason.
const FAILURE_TAIL_LINES: usize = 100;
/// Characters of log kept in a failure reason.
const FAILURE_TAIL_CHARS: usize = 500;

/// Build the crawl command line for a job.
///
/// `<program> <runner args..> crawl <spider> -a k=v .. -a _job=<id>`
pub fn build_command(job: &Job, runner: &RunnerConfig, log_path: &Path) -> Command {
    let mut cmd = process_utils::tokio_command(&runner.program);
    cmd.args(&runner.args).arg("crawl").arg(&job.spider);
    for (key, value) in &job.args {
        cmd.arg("-a").arg(format!("{}={}", key, value));
    }
    cmd.arg("-a").arg(format!("_job={}", job.id));

    if let Some(root) = &runner.projects_dir {
        let project_dir = root.join(&job.project);
        if project_dir.is_dir() {
            cmd.current_dir(project_dir);
        }
    }

    cmd.env("CRAWLD_PROJECT", &job.project)
        .env("CRAWLD_SPIDER", &job.spider)
        .env("CRAWLD_JOB", &job.id)
        .env("CRAWLD_LOG_FILE", log_path)
        .stdin(Stdio::null());
    cmd
}

/// An owned crawl process.
///
/// The raw child never leaves this type; dropping it kills the process.
#[derive(Debug)]
pub struct ProcessHandle {
    job_id: String,
    child: Child,
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Start the job's process with stdout and stderr appended to `log_path`.
    pub async fn spawn(job: &Job, runner: &RunnerConfig, log_path: &Path) -> Result<Self> {
        ensure_parent_dir_with_op("creating job log directory", log_path).await?;
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await
            .map_err(|e| io_error("opening job log", log_path, e))?
            .into_std()
            .await;
        let log_err = log
            .try_clone()
            .map_err(|e| io_error("opening job log", log_path, e))?;

        let mut cmd = build_command(job, runner, log_path);
        cmd.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));

        let child = cmd
            .spawn()
            .map_err(|e| Error::launch_failure(&job.id, format!("{}: {}", runner.program, e)))?;
        let pid = child.id();

        debug!(job_id = %job.id, pid = ?pid, "Crawl process spawned");
        Ok(Self {
            job_id: job.id.clone(),
            child,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the process to stop (SIGTERM).
    pub fn signal(&self) -> std::io::Result<()> {
        match self.pid {
            Some(pid) => process_utils::terminate(pid),
            None => Ok(()),
        }
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> std::io::Result<ExitKind> {
        let status = self.child.wait().await?;
        Ok(ExitKind::from_status(status))
    }

    /// Force-kill the process and reap it.
    pub async fn kill(&mut self) -> std::io::Result<ExitKind> {
        if let Err(e) = self.child.start_kill() {
            // Already exited; fall through to reap it.
            debug!(job_id = %self.job_id, error = %e, "Kill failed");
        }
        self.wait().await
    }
}

struct RunningEntry {
    project: String,
    token: CancellationToken,
    admitted_at: Instant,
}

/// Starts and supervises crawl processes.
pub struct ProcessLauncher {
    config: Arc<SchedulerConfig>,
    repo: Arc<dyn JobRepository>,
    events: mpsc::Sender<LauncherEvent>,
    running: DashMap<String, RunningEntry>,
    /// Parent of every job's cancellation token.
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<JoinSet<()>>,
}

impl ProcessLauncher {
    pub fn new(
        config: Arc<SchedulerConfig>,
        repo: Arc<dyn JobRepository>,
        events: mpsc::Sender<LauncherEvent>,
    ) -> Self {
        Self {
            config,
            repo,
            events,
            running: DashMap::new(),
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(JoinSet::new()),
        }
    }

    /// `<log_dir>/<project>/<spider>/<id>.log`
    pub fn log_path_for(&self, job: &Job) -> PathBuf {
        self.config
            .log_dir
            .join(&job.project)
            .join(&job.spider)
            .join(format!("{}.log", job.id))
    }

    /// Admitted jobs across all projects.
    pub fn running_total(&self) -> usize {
        self.running.len()
    }

    pub fn running_in(&self, project: &str) -> usize {
        self.running
            .iter()
            .filter(|entry| entry.value().project == project)
            .count()
    }

    /// Request cancellation of an admitted job. Returns false if the job is
    /// not admitted.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.running.get(job_id) {
            Some(entry) => {
                entry.value().token.cancel();
                true
            }
            None => false,
        }
    }

    /// Give a job's slot back. Called by the tracker.
    pub fn release(&self, job_id: &str) -> bool {
        match self.running.remove(job_id) {
            Some((_, entry)) => {
                debug!(
                    job_id,
                    project = %entry.project,
                    held_secs = entry.admitted_at.elapsed().as_secs_f64(),
                    "Slot released"
                );
                true
            }
            None => false,
        }
    }

    /// Admit `job` and start supervising it in the background.
    ///
    /// The slot is taken before this returns, so callers can rely on the
    /// running counts immediately.
    pub fn launch(self: &Arc<Self>, job: Job) {
        let token = self.shutdown.child_token();
        self.running.insert(
            job.id.clone(),
            RunningEntry {
                project: job.project.clone(),
                token: token.clone(),
                admitted_at: Instant::now(),
            },
        );

        let launcher = Arc::clone(self);
        self.tasks.lock().spawn(async move {
            let job_id = job.id.clone();
            let event = launcher.supervise(job, token).await;
            if launcher.events.send(event).await.is_err() {
                error!(job_id = %job_id, "Status tracker is gone; releasing slot directly");
                launcher.release(&job_id);
            }
        });

        // Reap finished supervisor tasks so the set does not grow unbounded.
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
    }

    async fn supervise(&self, job: Job, token: CancellationToken) -> LauncherEvent {
        if token.is_cancelled() {
            return CompletionEvent::new(&job.id, &job.project, ExecutionOutcome::CancelledBeforeLaunch)
                .into();
        }

        // Cheap guard against jobs cancelled between queueing and admission.
        match self.repo.get_job(&job.id).await {
            Ok(current) if current.state() == Some(JobState::Pending) => {}
            Ok(current) => {
                debug!(job_id = %job.id, status = %current.status, "Job no longer pending; skipping");
                return LauncherEvent::Abandoned {
                    job_id: job.id,
                    project: job.project,
                };
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to re-read job before launch");
            }
        }

        let log_path = self.log_path_for(&job);
        let mut handle = match ProcessHandle::spawn(&job, &self.config.runner, &log_path).await {
            Ok(handle) => handle,
            Err(e) => {
                let reason = match e {
                    Error::LaunchFailure { reason, .. } => reason,
                    other => other.to_string(),
                };
                warn!(job_id = %job.id, project = %job.project, reason = %reason, "Failed to launch crawl");
                return CompletionEvent::new(&job.id, &job.project, ExecutionOutcome::LaunchFailed(reason))
                    .into();
            }
        };

        if token.is_cancelled() {
            debug!(job_id = %job.id, "Cancelled while launching; killing process");
            if let Err(e) = handle.kill().await {
                warn!(job_id = %job.id, error = %e, "Failed to reap cancelled process");
            }
            return CompletionEvent::new(&job.id, &job.project, ExecutionOutcome::CancelledBeforeLaunch)
                .into();
        }

        let patch = JobPatch::started(handle.pid(), log_path.to_string_lossy());
        if let Err(e) = self.repo.update_job(&job.id, &patch).await {
            warn!(job_id = %job.id, error = %e, "Could not mark job running; killing process");
            if let Err(e) = handle.kill().await {
                warn!(job_id = %job.id, error = %e, "Failed to reap abandoned process");
            }
            return LauncherEvent::Abandoned {
                job_id: job.id,
                project: job.project,
            };
        }

        info!(
            job_id = %job.id,
            project = %job.project,
            spider = %job.spider,
            pid = ?handle.pid(),
            "Job started"
        );
        let started = LauncherEvent::Started {
            job_id: job.id.clone(),
            project: job.project.clone(),
            pid: handle.pid(),
        };
        if self.events.send(started).await.is_err() {
            debug!(job_id = %job.id, "Status tracker is gone");
        }

        let outcome = self.run_to_completion(&job, &mut handle, &token).await;
        let mut event = CompletionEvent::new(&job.id, &job.project, outcome);
        let failed_with_code = matches!(
            event.outcome,
            ExecutionOutcome::Exited(ExitKind::Code(code)) if code != 0
        );
        if failed_with_code {
            match read_tail(&log_path, FAILURE_TAIL_LINES).await {
                Ok(tail) => event = event.with_log_tail(truncate_tail(&tail, FAILURE_TAIL_CHARS)),
                Err(e) => debug!(job_id = %job.id, error = %e, "Could not read log tail"),
            }
        }
        event.into()
    }

    async fn run_to_completion(
        &self,
        job: &Job,
        handle: &mut ProcessHandle,
        token: &CancellationToken,
    ) -> ExecutionOutcome {
        let deadline = self.config.job_timeout.map(|t| tokio::time::Instant::now() + t);
        let timeout = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            status = handle.wait() => match status {
                Ok(kind) => ExecutionOutcome::Exited(kind),
                Err(e) => ExecutionOutcome::WaitFailed(e.to_string()),
            },
            _ = token.cancelled() => self.stop_gracefully(job, handle).await,
            _ = timeout => {
                warn!(job_id = %job.id, "Job exceeded maximum runtime; killing");
                if let Err(e) = handle.kill().await {
                    warn!(job_id = %job.id, error = %e, "Failed to reap timed out process");
                }
                ExecutionOutcome::TimedOut
            }
        }
    }

    /// SIGTERM, then SIGKILL if the grace period runs out.
    async fn stop_gracefully(&self, job: &Job, handle: &mut ProcessHandle) -> ExecutionOutcome {
        let grace = self.config.grace_period;
        info!(job_id = %job.id, grace_ms = grace.as_millis() as u64, "Cancelling running job");

        if let Err(e) = handle.signal() {
            warn!(job_id = %job.id, error = %e, "SIGTERM failed; killing");
            return match handle.kill().await {
                Ok(kind) => ExecutionOutcome::Cancelled(kind),
                Err(e) => ExecutionOutcome::WaitFailed(e.to_string()),
            };
        }

        match tokio::time::timeout(grace, handle.wait()).await {
            Ok(Ok(kind)) => ExecutionOutcome::Cancelled(kind),
            Ok(Err(e)) => ExecutionOutcome::WaitFailed(e.to_string()),
            Err(_) => {
                warn!(job_id = %job.id, "Job ignored SIGTERM; killing");
                if let Err(e) = handle.kill().await {
                    warn!(job_id = %job.id, error = %e, "Failed to reap killed process");
                }
                ExecutionOutcome::CancelTimeout { grace }
            }
        }
    }

    /// Cancel every admitted job and wait for their supervisors to finish.
    pub async fn shutdown(&self) {
        let admitted = self.running.len();
        if admitted > 0 {
            info!(admitted, "Stopping running crawl jobs");
        }
        self.shutdown.cancel();

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while tasks.join_next().await.is_some() {}
        debug!("Process launcher stopped");
    }
}

impl From<CompletionEvent> for LauncherEvent {
    fn from(event: CompletionEvent) -> Self {
        Self::Completed(event)
    }
}
