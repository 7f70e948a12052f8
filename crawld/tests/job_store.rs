//! Job store behaviour against a real SQLite file.

mod common;

use std::sync::Arc;

use tokio::task::JoinSet;

use crawld::Error;
use crawld::database::models::{JobDbModel, JobPatch};
use crawld::database::repositories::JobRepository;
use crawld::domain::{JobState, NewJob};

use common::open_repo;

fn pending(project: &str) -> JobDbModel {
    JobDbModel::pending(&NewJob::new(project, "spider").validate().unwrap()).unwrap()
}

#[tokio::test]
async fn migrations_create_job_table() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("crawld.db").display());
    let write_pool = crawld::database::init_write_pool(&url).await.unwrap();
    crawld::database::run_migrations(&write_pool).await.unwrap();

    let tables: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(&write_pool)
            .await
            .unwrap();
    let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
    assert!(names.contains(&"crawl_job"), "crawl_job table missing");

    // Running them twice is harmless.
    crawld::database::run_migrations(&write_pool).await.unwrap();
}

#[tokio::test]
async fn concurrent_submissions_respect_the_ceiling() {
    const CEILING: u64 = 10;
    const ATTEMPTS: usize = 30;

    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(&dir).await;

    let mut tasks = JoinSet::new();
    for i in 0..ATTEMPTS {
        let repo = Arc::clone(&repo);
        tasks.spawn(async move {
            let project = format!("p{}", i % 3);
            repo.create_job(&pending(&project), Some(CEILING)).await
        });
    }

    let mut accepted = 0;
    let mut rejected = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => accepted += 1,
            Err(Error::QueueFull { ceiling, .. }) => {
                assert_eq!(ceiling, CEILING);
                rejected += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(accepted, CEILING as usize);
    assert_eq!(rejected, ATTEMPTS - CEILING as usize);
    assert_eq!(repo.count_active().await.unwrap(), CEILING);
}

#[tokio::test]
async fn racing_transitions_have_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(&dir).await;
    let job = repo.create_job(&pending("p"), None).await.unwrap();

    // Admission and cancellation race for the same Pending job.
    let start = {
        let repo = Arc::clone(&repo);
        let id = job.id.clone();
        tokio::spawn(async move {
            repo.update_job(&id, &JobPatch::started(Some(42), "p.log"))
                .await
        })
    };
    let cancel = {
        let repo = Arc::clone(&repo);
        let id = job.id.clone();
        tokio::spawn(async move {
            repo.update_job(&id, &JobPatch::finished(JobState::Pending, JobState::Cancelled))
                .await
        })
    };

    let results = [start.await.unwrap(), cancel.await.unwrap()];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(Error::InvalidStateTransition { .. })))
    );

    let stored = repo.get_job(&job.id).await.unwrap();
    assert!(matches!(
        stored.state(),
        Some(JobState::Running) | Some(JobState::Cancelled)
    ));
}

#[tokio::test]
async fn terminal_jobs_never_change_state() {
    let dir = tempfile::tempdir().unwrap();
    let repo = open_repo(&dir).await;
    let job = repo.create_job(&pending("p"), None).await.unwrap();

    repo.update_job(&job.id, &JobPatch::finished(JobState::Pending, JobState::Cancelled))
        .await
        .unwrap();

    for (from, to) in [
        (JobState::Pending, JobState::Running),
        (JobState::Running, JobState::Finished),
        (JobState::Cancelled, JobState::Pending),
    ] {
        let err = repo
            .update_job(&job.id, &JobPatch::transition(from, to))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    let stored = repo.get_job(&job.id).await.unwrap();
    assert_eq!(stored.state(), Some(JobState::Cancelled));
}
