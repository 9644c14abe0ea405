//! Durable build-job records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, QueryBuilder};

use forgeci_core::job::BuildJobQueueItem;
use forgeci_core::{BuildJobId, BuildStatus};

use crate::{DbError, DbResult};

/// One durable build-job row. Created with status QUEUED before the queue
/// item becomes visible to agents (write-before-publish), updated as the job
/// moves through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildJobRecord {
    pub build_job_id: uuid::Uuid,
    pub name: String,
    pub participation_id: i64,
    pub course_id: i64,
    pub exercise_id: i64,
    pub build_status: String,
    pub retry_count: i32,
    pub priority: i32,
    pub triggered_by_push_to: String,
    pub assignment_commit_hash: String,
    pub test_commit_hash: String,
    pub docker_image: String,
    pub build_agent_name: Option<String>,
    pub submission_id: Option<i64>,
    pub build_submission_date: DateTime<Utc>,
    pub build_start_date: Option<DateTime<Utc>>,
    pub build_completion_date: Option<DateTime<Utc>>,
}

impl BuildJobRecord {
    pub fn job_id(&self) -> BuildJobId {
        BuildJobId::from_uuid(self.build_job_id)
    }

    pub fn status(&self) -> Option<BuildStatus> {
        self.build_status.parse().ok()
    }

    /// Build the initial row for a freshly assembled queue item.
    pub fn queued_from(item: &BuildJobQueueItem) -> Self {
        Self {
            build_job_id: *item.id.as_uuid(),
            name: item.name.clone(),
            participation_id: item.participation_id,
            course_id: item.course_id,
            exercise_id: item.exercise_id,
            build_status: BuildStatus::Queued.as_str().to_string(),
            retry_count: item.retry_count as i32,
            priority: item.priority.value(),
            triggered_by_push_to: item.repository_info.triggered_by_push_to.as_str().to_string(),
            assignment_commit_hash: item.build_config.assignment_commit_hash.clone(),
            test_commit_hash: item.build_config.test_commit_hash.clone(),
            docker_image: item.build_config.docker_image.clone(),
            build_agent_name: item.build_agent.as_ref().map(|agent| agent.name.clone()),
            submission_id: item.submission_id,
            build_submission_date: item.timing_info.submission_date,
            build_start_date: None,
            build_completion_date: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildJobSortColumn {
    SubmissionDate,
    CompletionDate,
    Status,
}

impl BuildJobSortColumn {
    fn column(&self) -> &'static str {
        match self {
            BuildJobSortColumn::SubmissionDate => "build_submission_date",
            BuildJobSortColumn::CompletionDate => "build_completion_date",
            BuildJobSortColumn::Status => "build_status",
        }
    }
}

/// Filter, sort and pagination inputs for the historical search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJobSearchFilter {
    pub build_status: Option<BuildStatus>,
    pub course_id: Option<i64>,
    pub exercise_id: Option<i64>,
    pub participation_id: Option<i64>,
    pub build_agent_name: Option<String>,
    pub submitted_after: Option<DateTime<Utc>>,
    pub submitted_before: Option<DateTime<Utc>>,
    pub sort_by: BuildJobSortColumn,
    pub descending: bool,
    /// Zero-based page index.
    pub page: u32,
    pub page_size: u32,
}

impl Default for BuildJobSearchFilter {
    fn default() -> Self {
        Self {
            build_status: None,
            course_id: None,
            exercise_id: None,
            participation_id: None,
            build_agent_name: None,
            submitted_after: None,
            submitted_before: None,
            sort_by: BuildJobSortColumn::SubmissionDate,
            descending: true,
            page: 0,
            page_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJobSearchPage {
    pub records: Vec<BuildJobRecord>,
    pub total: i64,
}

#[async_trait]
pub trait BuildJobRepo: Send + Sync {
    /// Insert the durable row. Must complete before the matching queue item
    /// is offered to the shared queue.
    async fn create(&self, record: BuildJobRecord) -> DbResult<BuildJobRecord>;

    async fn find_by_job_id(&self, build_job_id: &BuildJobId) -> DbResult<Option<BuildJobRecord>>;

    async fn update_status(
        &self,
        build_job_id: &BuildJobId,
        status: BuildStatus,
        completion_date: Option<DateTime<Utc>>,
    ) -> DbResult<()>;

    /// Transition a QUEUED row to BUILDING when the matching item appears in
    /// the processing map. A no-op for rows already past QUEUED, so late
    /// events cannot regress a terminal status.
    async fn mark_building(
        &self,
        build_job_id: &BuildJobId,
        build_start_date: DateTime<Utc>,
    ) -> DbResult<()>;

    async fn increment_retry_count(&self, build_job_id: &BuildJobId) -> DbResult<()>;

    /// QUEUED/BUILDING jobs submitted before the cutoff: candidates for the
    /// MISSING classification.
    async fn find_in_flight_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> DbResult<Vec<BuildJobRecord>>;

    /// Bounded batch of MISSING jobs submitted after `since`, oldest first.
    async fn find_missing_submitted_after(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<BuildJobRecord>>;

    async fn search(&self, filter: &BuildJobSearchFilter) -> DbResult<BuildJobSearchPage>;
}

/// PostgreSQL implementation of BuildJobRepo.
pub struct PgBuildJobRepo {
    pool: PgPool,
}

impl PgBuildJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn push_filters<'a>(
        builder: &mut QueryBuilder<'a, sqlx::Postgres>,
        filter: &'a BuildJobSearchFilter,
    ) {
        builder.push(" WHERE TRUE");
        if let Some(status) = &filter.build_status {
            builder.push(" AND build_status = ").push_bind(status.as_str());
        }
        if let Some(course_id) = filter.course_id {
            builder.push(" AND course_id = ").push_bind(course_id);
        }
        if let Some(exercise_id) = filter.exercise_id {
            builder.push(" AND exercise_id = ").push_bind(exercise_id);
        }
        if let Some(participation_id) = filter.participation_id {
            builder
                .push(" AND participation_id = ")
                .push_bind(participation_id);
        }
        if let Some(agent) = &filter.build_agent_name {
            builder.push(" AND build_agent_name = ").push_bind(agent);
        }
        if let Some(after) = filter.submitted_after {
            builder
                .push(" AND build_submission_date >= ")
                .push_bind(after);
        }
        if let Some(before) = filter.submitted_before {
            builder
                .push(" AND build_submission_date <= ")
                .push_bind(before);
        }
    }
}

#[async_trait]
impl BuildJobRepo for PgBuildJobRepo {
    async fn create(&self, record: BuildJobRecord) -> DbResult<BuildJobRecord> {
        let created = sqlx::query_as::<_, BuildJobRecord>(
            r#"
            INSERT INTO build_jobs (
                build_job_id, name, participation_id, course_id, exercise_id,
                build_status, retry_count, priority, triggered_by_push_to,
                assignment_commit_hash, test_commit_hash, docker_image,
                build_agent_name, submission_id, build_submission_date,
                build_start_date, build_completion_date
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING *
            "#,
        )
        .bind(record.build_job_id)
        .bind(&record.name)
        .bind(record.participation_id)
        .bind(record.course_id)
        .bind(record.exercise_id)
        .bind(&record.build_status)
        .bind(record.retry_count)
        .bind(record.priority)
        .bind(&record.triggered_by_push_to)
        .bind(&record.assignment_commit_hash)
        .bind(&record.test_commit_hash)
        .bind(&record.docker_image)
        .bind(&record.build_agent_name)
        .bind(record.submission_id)
        .bind(record.build_submission_date)
        .bind(record.build_start_date)
        .bind(record.build_completion_date)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| crate::error::map_insert_error(e, format!("build job {}", record.build_job_id)))?;
        Ok(created)
    }

    async fn find_by_job_id(&self, build_job_id: &BuildJobId) -> DbResult<Option<BuildJobRecord>> {
        let record = sqlx::query_as::<_, BuildJobRecord>(
            "SELECT * FROM build_jobs WHERE build_job_id = $1",
        )
        .bind(build_job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn update_status(
        &self,
        build_job_id: &BuildJobId,
        status: BuildStatus,
        completion_date: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE build_jobs
            SET build_status = $2,
                build_completion_date = COALESCE($3, build_completion_date)
            WHERE build_job_id = $1
            "#,
        )
        .bind(build_job_id.as_uuid())
        .bind(status.as_str())
        .bind(completion_date)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("build job {build_job_id}")));
        }
        Ok(())
    }

    async fn mark_building(
        &self,
        build_job_id: &BuildJobId,
        build_start_date: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE build_jobs
            SET build_status = 'BUILDING', build_start_date = $2
            WHERE build_job_id = $1 AND build_status = 'QUEUED'
            "#,
        )
        .bind(build_job_id.as_uuid())
        .bind(build_start_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_retry_count(&self, build_job_id: &BuildJobId) -> DbResult<()> {
        sqlx::query("UPDATE build_jobs SET retry_count = retry_count + 1 WHERE build_job_id = $1")
            .bind(build_job_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_in_flight_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> DbResult<Vec<BuildJobRecord>> {
        let records = sqlx::query_as::<_, BuildJobRecord>(
            r#"
            SELECT * FROM build_jobs
            WHERE build_status IN ('QUEUED', 'BUILDING')
              AND build_submission_date < $1
            ORDER BY build_submission_date
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn find_missing_submitted_after(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<BuildJobRecord>> {
        let records = sqlx::query_as::<_, BuildJobRecord>(
            r#"
            SELECT * FROM build_jobs
            WHERE build_status = 'MISSING'
              AND build_submission_date >= $1
            ORDER BY build_submission_date
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn search(&self, filter: &BuildJobSearchFilter) -> DbResult<BuildJobSearchPage> {
        let mut count_builder = QueryBuilder::new("SELECT COUNT(*) FROM build_jobs");
        Self::push_filters(&mut count_builder, filter);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        // First page through ids only, then fetch the full rows for exactly
        // those ids. The ANY() fetch does not preserve order, so the rows
        // are reordered to the id page afterwards.
        let mut id_builder = QueryBuilder::new("SELECT build_job_id FROM build_jobs");
        Self::push_filters(&mut id_builder, filter);
        id_builder.push(" ORDER BY ");
        id_builder.push(filter.sort_by.column());
        id_builder.push(if filter.descending { " DESC" } else { " ASC" });
        id_builder
            .push(" LIMIT ")
            .push_bind(filter.page_size as i64)
            .push(" OFFSET ")
            .push_bind(filter.page as i64 * filter.page_size as i64);
        let ids: Vec<uuid::Uuid> = id_builder
            .build_query_scalar()
            .fetch_all(&self.pool)
            .await?;

        if ids.is_empty() {
            return Ok(BuildJobSearchPage {
                records: Vec::new(),
                total,
            });
        }

        let records = sqlx::query_as::<_, BuildJobRecord>(
            "SELECT * FROM build_jobs WHERE build_job_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(BuildJobSearchPage {
            records: reorder_by_ids(records, &ids),
            total,
        })
    }
}

/// Restore the id-query's order on the bulk-fetched rows.
pub fn reorder_by_ids(records: Vec<BuildJobRecord>, ids: &[uuid::Uuid]) -> Vec<BuildJobRecord> {
    let mut by_id: std::collections::HashMap<uuid::Uuid, BuildJobRecord> = records
        .into_iter()
        .map(|record| (record.build_job_id, record))
        .collect();
    ids.iter().filter_map(|id| by_id.remove(id)).collect()
}
