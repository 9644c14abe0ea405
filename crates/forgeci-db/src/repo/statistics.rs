//! Per-exercise build-duration statistics.
//!
//! Feeds the estimated-completion hint shown while a job is queued. Updated
//! from an async task after successful builds; never read on a scheduling
//! decision path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::DbResult;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildStatisticsRecord {
    pub exercise_id: i64,
    pub average_duration_seconds: i64,
    pub build_count: i64,
}

#[async_trait]
pub trait BuildStatisticsRepo: Send + Sync {
    async fn find_by_exercise(&self, exercise_id: i64)
    -> DbResult<Option<BuildStatisticsRecord>>;

    /// Fold one observed duration into the rolling average.
    async fn record_build_duration(&self, exercise_id: i64, duration_seconds: i64)
    -> DbResult<()>;
}

/// PostgreSQL implementation of BuildStatisticsRepo.
pub struct PgBuildStatisticsRepo {
    pool: PgPool,
}

impl PgBuildStatisticsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildStatisticsRepo for PgBuildStatisticsRepo {
    async fn find_by_exercise(
        &self,
        exercise_id: i64,
    ) -> DbResult<Option<BuildStatisticsRecord>> {
        let record = sqlx::query_as::<_, BuildStatisticsRecord>(
            "SELECT * FROM build_statistics WHERE exercise_id = $1",
        )
        .bind(exercise_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn record_build_duration(
        &self,
        exercise_id: i64,
        duration_seconds: i64,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO build_statistics (exercise_id, average_duration_seconds, build_count)
            VALUES ($1, $2, 1)
            ON CONFLICT (exercise_id) DO UPDATE
            SET average_duration_seconds =
                    (build_statistics.average_duration_seconds * build_statistics.build_count
                     + EXCLUDED.average_duration_seconds)
                    / (build_statistics.build_count + 1),
                build_count = build_statistics.build_count + 1
            "#,
        )
        .bind(exercise_id)
        .bind(duration_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
