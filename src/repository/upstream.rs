use async_trait::async_trait;
use sqlx::PgPool;

use super::UpstreamStore;
use crate::error::Result;
use crate::models::{Upstream, UpstreamStatus};

/// Postgres-backed upstream inventory
#[derive(Clone)]
pub struct UpstreamRepository {
    pool: PgPool,
}

impl UpstreamRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UpstreamStore for UpstreamRepository {
    async fn list_selectable(&self, include_failed: bool) -> Result<Vec<Upstream>> {
        let upstreams = sqlx::query_as::<_, Upstream>(
            r#"
            SELECT id, address, protocol, username, password, status,
                   requests, successful_requests, failed_requests,
                   avg_response_time_ms, last_check_at, last_error,
                   created_at, updated_at
            FROM upstreams
            WHERE status IN ('active', 'idle') OR $1
            ORDER BY address
            "#,
        )
        .bind(include_failed)
        .fetch_all(&self.pool)
        .await?;

        Ok(upstreams)
    }

    async fn record_outcome(
        &self,
        id: i64,
        success: bool,
        latency_ms: i32,
        error: Option<&str>,
    ) -> Result<()> {
        // Counter sums stay exact under concurrency: one SQL statement, no
        // read-modify-write in process. Successful requests promote the
        // upstream back to active; failure status policy belongs to the
        // health subsystem.
        sqlx::query(
            r#"
            UPDATE upstreams
            SET
                requests = requests + 1,
                successful_requests = successful_requests + CASE WHEN $2 THEN 1 ELSE 0 END,
                failed_requests = failed_requests + CASE WHEN $2 THEN 0 ELSE 1 END,
                avg_response_time_ms = CASE
                    WHEN NOT $2 THEN avg_response_time_ms
                    WHEN successful_requests = 0 THEN $3
                    ELSE ((avg_response_time_ms::BIGINT * successful_requests + $3)
                          / (successful_requests + 1))::INTEGER
                END,
                status = CASE WHEN $2 THEN 'active' ELSE status END,
                last_error = CASE WHEN $2 THEN NULL ELSE $4 END,
                last_check_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(success)
        .bind(latency_ms)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_status(
        &self,
        id: i64,
        status: UpstreamStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE upstreams
            SET status = $2, last_error = $3, last_check_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(last_error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
