use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;

use super::RequestLogStore;
use crate::error::Result;
use crate::models::RequestRecord;

/// Postgres-backed append-only request log
///
/// `upstream_requests` is expected to be a time-partitioned table owned by a
/// collaborator subsystem; retention is enforced there.
#[derive(Clone)]
pub struct RequestLogRepository {
    pool: PgPool,
}

impl RequestLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestLogStore for RequestLogRepository {
    async fn append(&self, record: &RequestRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO upstream_requests
                (upstream_id, timestamp, success, response_time_ms, status_code)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.upstream_id)
        .bind(record.timestamp)
        .bind(record.success)
        .bind(record.response_time_ms)
        .bind(record.status_code)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count_by_upstream(
        &self,
        ids: &[i64],
        window_secs: i64,
        success_only: bool,
    ) -> Result<HashMap<i64, i64>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        // The window is bound through make_interval rather than interpolated
        // into the SQL text, so arbitrary values stay inert.
        let rows = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT upstream_id, COUNT(*)
            FROM upstream_requests
            WHERE upstream_id = ANY($1)
              AND timestamp >= NOW() - make_interval(secs => $2)
              AND ($3 = FALSE OR success = TRUE)
            GROUP BY upstream_id
            "#,
        )
        .bind(ids)
        .bind(window_secs as f64)
        .bind(success_only)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }
}
