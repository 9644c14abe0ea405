//! Durable submissions.
//!
//! One submission row exists per unique (participation, commit); every
//! container building that commit links to the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::DbResult;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubmissionRecord {
    pub id: i64,
    pub participation_id: i64,
    pub commit_hash: String,
    pub submission_date: DateTime<Utc>,
    /// How many containers are expected to report a result for this
    /// submission.
    pub expected_container_count: i32,
}

#[async_trait]
pub trait SubmissionRepo: Send + Sync {
    async fn find_by_participation_and_commit(
        &self,
        participation_id: i64,
        commit_hash: &str,
    ) -> DbResult<Option<SubmissionRecord>>;

    /// Fails with [`crate::DbError::Duplicate`] when a concurrent creator
    /// won the race; callers resolve that by re-fetching.
    async fn create(
        &self,
        participation_id: i64,
        commit_hash: &str,
        submission_date: DateTime<Utc>,
        expected_container_count: u32,
    ) -> DbResult<SubmissionRecord>;
}

/// PostgreSQL implementation of SubmissionRepo.
pub struct PgSubmissionRepo {
    pool: PgPool,
}

impl PgSubmissionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubmissionRepo for PgSubmissionRepo {
    async fn find_by_participation_and_commit(
        &self,
        participation_id: i64,
        commit_hash: &str,
    ) -> DbResult<Option<SubmissionRecord>> {
        let record = sqlx::query_as::<_, SubmissionRecord>(
            "SELECT * FROM submissions WHERE participation_id = $1 AND commit_hash = $2",
        )
        .bind(participation_id)
        .bind(commit_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn create(
        &self,
        participation_id: i64,
        commit_hash: &str,
        submission_date: DateTime<Utc>,
        expected_container_count: u32,
    ) -> DbResult<SubmissionRecord> {
        let record = sqlx::query_as::<_, SubmissionRecord>(
            r#"
            INSERT INTO submissions (participation_id, commit_hash, submission_date, expected_container_count)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(participation_id)
        .bind(commit_hash)
        .bind(submission_date)
        .bind(expected_container_count as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            crate::error::map_insert_error(
                e,
                format!("submission for participation {participation_id} at {commit_hash}"),
            )
        })?;
        Ok(record)
    }
}
