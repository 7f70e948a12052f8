//! Shared setup for integration tests: a temp SQLite file, a scheduler and
//! a `sh` runner whose behaviour is picked by spider name.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crawld::config::{RunnerConfig, SchedulerConfig};
use crawld::database::repositories::{JobRepository, SqlxJobRepository};
use crawld::database::{init_pool, init_write_pool, run_migrations};
use crawld::domain::{Job, JobState};
use crawld::scheduler::Scheduler;

/// Invoked as `sh -c SCRIPT crawl <spider> -a ...`, so `$1` is the spider.
pub const RUNNER_SCRIPT: &str = r#"
case "$1" in
  ok) echo "crawled $CRAWLD_PROJECT/$CRAWLD_SPIDER" ;;
  hold) sleep 0.4 ;;
  slow) exec sleep 5 ;;
  stubborn) trap '' TERM; exec sleep 5 ;;
  fail) echo "boom"; exit 3 ;;
  *) echo "unknown spider $1"; exit 2 ;;
esac
"#;

pub struct TestDaemon {
    pub dir: TempDir,
    pub repo: Arc<dyn JobRepository>,
    pub scheduler: Arc<Scheduler>,
}

pub async fn open_repo(dir: &TempDir) -> Arc<dyn JobRepository> {
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("crawld.db").display());
    let write_pool = init_write_pool(&url).await.unwrap();
    run_migrations(&write_pool).await.unwrap();
    let pool = init_pool(&url).await.unwrap();
    Arc::new(SqlxJobRepository::new(pool, write_pool))
}

pub fn test_config(dir: &TempDir) -> SchedulerConfig {
    SchedulerConfig {
        max_jobs: 8,
        max_jobs_per_project: 2,
        queue_ceiling: 100,
        grace_period: Duration::from_secs(2),
        job_timeout: None,
        poll_interval: Duration::from_millis(50),
        log_dir: dir.path().join("logs"),
        runner: RunnerConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), RUNNER_SCRIPT.to_string()],
            projects_dir: None,
        },
        ..SchedulerConfig::default()
    }
}

/// Start a scheduler over a fresh database.
pub async fn start_daemon(configure: impl FnOnce(&mut SchedulerConfig)) -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(&dir).await;
    let mut config = test_config(&dir);
    configure(&mut config);

    let scheduler = Scheduler::new(config, Arc::clone(&repo)).unwrap();
    scheduler.start().await.unwrap();
    TestDaemon {
        dir,
        repo,
        scheduler,
    }
}

/// Poll until the job reaches `state`, panicking after `timeout`.
pub async fn wait_for_state(
    scheduler: &Scheduler,
    job_id: &str,
    state: JobState,
    timeout: Duration,
) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = scheduler.status(job_id).await.unwrap();
        if job.state == state {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {} waiting for {}",
            job_id,
            job.state,
            state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait for a terminal state.
pub async fn wait_terminal(scheduler: &Scheduler, job_id: &str) -> Job {
    let job = scheduler
        .await_completion(job_id, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(job.is_terminal(), "job {} still {}", job_id, job.state);
    job
}
