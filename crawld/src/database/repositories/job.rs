//! Crawl job repository.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use sqlx::SqlitePool;

use crate::database::models::{
    JobDbModel, JobFilter, JobPage, JobPatch, ProjectCounts, PurgeFilter, StateCounts,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::database::{WritePool, begin_immediate};
use crate::domain::JobState;
use crate::{Error, Result};

const COUNT_ACTIVE_SQL: &str =
    "SELECT COUNT(*) FROM crawl_job WHERE status IN ('PENDING', 'RUNNING')";

const TERMINAL_CONDITION: &str = "status IN ('FINISHED', 'FAILED', 'CANCELLED')";

/// Job store contract.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a Pending job and return it with its assigned `seq`.
    ///
    /// With `active_ceiling` set, the insert is refused with `QueueFull` when
    /// that many jobs are already Pending or Running. The check and the insert
    /// happen in one write transaction.
    async fn create_job(&self, job: &JobDbModel, active_ceiling: Option<u64>)
    -> Result<JobDbModel>;

    async fn get_job(&self, id: &str) -> Result<JobDbModel>;

    /// Apply `patch` only if the job is still in `patch.from`.
    ///
    /// Returns the updated row. Fails with `NotFound` for unknown ids and
    /// `InvalidStateTransition` when the stored state no longer matches.
    async fn update_job(&self, id: &str, patch: &JobPatch) -> Result<JobDbModel>;

    /// One page of jobs in submission order, starting after `after` (a `seq`).
    async fn list_jobs(&self, filter: &JobFilter, after: Option<i64>, limit: u32)
    -> Result<JobPage>;

    async fn count_active(&self) -> Result<u64>;

    async fn count_by_state(&self, project: Option<&str>) -> Result<StateCounts>;

    /// Per-state counts for every project that has at least one job.
    async fn list_projects(&self) -> Result<ProjectCounts>;

    /// Mark every Running job Failed. Used on startup, when no process
    /// from a previous daemon run can still be supervised.
    async fn fail_orphaned_running(&self, reason: &str) -> Result<u64>;

    /// Delete terminal jobs matching `filter`, returning the removed rows.
    async fn purge_jobs(&self, filter: &PurgeFilter) -> Result<Vec<JobDbModel>>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(
        &self,
        job: &JobDbModel,
        active_ceiling: Option<u64>,
    ) -> Result<JobDbModel> {
        retry_on_sqlite_busy("create_job", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;

            if let Some(ceiling) = active_ceiling {
                let (active,): (i64,) = sqlx::query_as(COUNT_ACTIVE_SQL)
                    .fetch_one(&mut *tx)
                    .await?;
                let active = active.max(0) as u64;
                if active >= ceiling {
                    tx.rollback().await?;
                    return Err(Error::QueueFull { active, ceiling });
                }
            }

            let inserted = sqlx::query(
                r#"
                INSERT INTO crawl_job (
                    id, project, spider, args, priority, status,
                    created_at, started_at, finished_at, exit_code,
                    failure_reason, log_path, pid, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.id)
            .bind(&job.project)
            .bind(&job.spider)
            .bind(&job.args)
            .bind(job.priority)
            .bind(&job.status)
            .bind(job.created_at)
            .bind(job.started_at)
            .bind(job.finished_at)
            .bind(job.exit_code)
            .bind(&job.failure_reason)
            .bind(&job.log_path)
            .bind(job.pid)
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await;

            let inserted = match inserted {
                Ok(result) => result,
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    tx.rollback().await?;
                    return Err(Error::DuplicateId(job.id.clone()));
                }
                Err(e) => return Err(e.into()),
            };

            tx.commit().await?;

            Ok(JobDbModel {
                seq: inserted.last_insert_rowid(),
                ..job.clone()
            })
        })
        .await
    }

    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM crawl_job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn update_job(&self, id: &str, patch: &JobPatch) -> Result<JobDbModel> {
        if !patch.from.can_transition_to(patch.to) {
            return Err(Error::InvalidStateTransition {
                from: patch.from.to_string(),
                to: patch.to.to_string(),
            });
        }

        retry_on_sqlite_busy("update_job", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;

            let result = sqlx::query(
                r#"
                UPDATE crawl_job SET
                    status = ?,
                    started_at = COALESCE(?, started_at),
                    finished_at = COALESCE(?, finished_at),
                    exit_code = COALESCE(?, exit_code),
                    failure_reason = COALESCE(?, failure_reason),
                    log_path = COALESCE(?, log_path),
                    pid = COALESCE(?, pid),
                    updated_at = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(patch.to.as_str())
            .bind(patch.started_at)
            .bind(patch.finished_at)
            .bind(patch.exit_code)
            .bind(&patch.failure_reason)
            .bind(&patch.log_path)
            .bind(patch.pid.map(i64::from))
            .bind(now_ms())
            .bind(id)
            .bind(patch.from.as_str())
            .execute(&mut *tx)
            .await?;

            let current =
                sqlx::query_as::<_, JobDbModel>("SELECT * FROM crawl_job WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;

            tx.commit().await?;

            let Some(current) = current else {
                return Err(Error::not_found("Job", id));
            };
            if result.rows_affected() == 0 {
                return Err(Error::InvalidStateTransition {
                    from: current.status,
                    to: patch.to.to_string(),
                });
            }
            Ok(current)
        })
        .await
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        after: Option<i64>,
        limit: u32,
    ) -> Result<JobPage> {
        let limit = limit.max(1);

        let mut conditions = Vec::new();
        if filter.project.is_some() {
            conditions.push("project = ?");
        }
        if filter.state.is_some() {
            conditions.push("status = ?");
        }
        if after.is_some() {
            conditions.push("seq > ?");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        // One extra row tells whether another page exists.
        let sql = format!(
            "SELECT * FROM crawl_job {} ORDER BY seq ASC LIMIT ?",
            where_clause
        );

        let mut query = sqlx::query_as::<_, JobDbModel>(&sql);
        if let Some(project) = &filter.project {
            query = query.bind(project);
        }
        if let Some(state) = filter.state {
            query = query.bind(state.as_str());
        }
        if let Some(after) = after {
            query = query.bind(after);
        }
        query = query.bind(i64::from(limit) + 1);

        let mut jobs = query.fetch_all(&self.pool).await?;
        let next_cursor = if jobs.len() > limit as usize {
            jobs.truncate(limit as usize);
            jobs.last().map(|j| j.seq)
        } else {
            None
        };

        Ok(JobPage { jobs, next_cursor })
    }

    async fn count_active(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(COUNT_ACTIVE_SQL)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_by_state(&self, project: Option<&str>) -> Result<StateCounts> {
        let rows: Vec<(String, i64)> = match project {
            Some(project) => {
                sqlx::query_as(
                    "SELECT status, COUNT(*) FROM crawl_job WHERE project = ? GROUP BY status",
                )
                .bind(project)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT status, COUNT(*) FROM crawl_job GROUP BY status")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut counts = StateCounts::default();
        for (status, n) in rows {
            if let Some(state) = JobState::parse(&status) {
                counts.add(state, n.max(0) as u64);
            }
        }
        Ok(counts)
    }

    async fn list_projects(&self) -> Result<ProjectCounts> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT project, status, COUNT(*) FROM crawl_job GROUP BY project, status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut projects = ProjectCounts::new();
        for (project, status, n) in rows {
            let counts = projects.entry(project).or_default();
            if let Some(state) = JobState::parse(&status) {
                counts.add(state, n.max(0) as u64);
            }
        }
        Ok(projects)
    }

    async fn fail_orphaned_running(&self, reason: &str) -> Result<u64> {
        retry_on_sqlite_busy("fail_orphaned_running", || async {
            let now = now_ms();
            let result = sqlx::query(
                r#"
                UPDATE crawl_job
                SET status = 'FAILED', finished_at = ?, failure_reason = ?, updated_at = ?
                WHERE status = 'RUNNING'
                "#,
            )
            .bind(now)
            .bind(reason)
            .bind(now)
            .execute(&self.write_pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn purge_jobs(&self, filter: &PurgeFilter) -> Result<Vec<JobDbModel>> {
        let mut conditions = vec![TERMINAL_CONDITION];
        if filter.project.is_some() {
            conditions.push("project = ?");
        }
        if filter.finished_before.is_some() {
            conditions.push("finished_at < ?");
        }
        let where_clause = format!("WHERE {}", conditions.join(" AND "));
        let select_sql = format!("SELECT * FROM crawl_job {} ORDER BY seq ASC", where_clause);
        let delete_sql = format!("DELETE FROM crawl_job {}", where_clause);

        retry_on_sqlite_busy("purge_jobs", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;

            let mut select = sqlx::query_as::<_, JobDbModel>(&select_sql);
            let mut delete = sqlx::query(&delete_sql);
            if let Some(project) = &filter.project {
                select = select.bind(project);
                delete = delete.bind(project);
            }
            if let Some(before) = filter.finished_before {
                select = select.bind(before);
                delete = delete.bind(before);
            }

            let removed = select.fetch_all(&mut *tx).await?;
            delete.execute(&mut *tx).await?;
            tx.commit().await?;
            Ok(removed)
        })
        .await
    }
}

/// Every job matching `filter`, in submission order, fetched a page at a
/// time as the stream is polled.
///
/// Each page is a separate query, so rows inserted behind the cursor while
/// the stream is live show up in later pages. An error ends the stream.
pub fn stream_jobs(
    repo: Arc<dyn JobRepository>,
    filter: JobFilter,
    page_size: u32,
) -> impl Stream<Item = Result<JobDbModel>> + Send {
    // `None` once the last page has been yielded.
    let start: Option<Option<i64>> = Some(None);
    stream::unfold(start, move |cursor| {
        let repo = Arc::clone(&repo);
        let filter = filter.clone();
        async move {
            let after = cursor?;
            match repo.list_jobs(&filter, after, page_size).await {
                Ok(page) => {
                    let next = page.next_cursor.map(Some);
                    let items: Vec<Result<JobDbModel>> = page.jobs.into_iter().map(Ok).collect();
                    Some((items, next))
                }
                Err(e) => Some((vec![Err(e)], None)),
            }
        }
    })
    .flat_map(stream::iter)
}
