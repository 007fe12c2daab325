use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use super::SettingsStore;
use crate::error::{GyreError, Result};
use crate::models::{keys, Settings, SettingsRecord};

/// Postgres-backed settings store
///
/// One JSON row per settings section; every write bumps the row version.
/// Missing rows fall back to compiled-in defaults so a fresh database is
/// immediately usable.
#[derive(Clone)]
pub struct SettingsRepository {
    pool: PgPool,
}

impl SettingsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Write one settings section
    pub async fn set<T: serde::Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let json_value = serde_json::to_value(value)
            .map_err(|e| GyreError::Internal(format!("Failed to serialize setting: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO settings (key, value, version)
            VALUES ($1, $2, 1)
            ON CONFLICT (key) DO UPDATE
                SET value = $2, version = settings.version + 1, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(json_value)
        .execute(&self.pool)
        .await?;

        info!(key = key, "Updated setting");
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for SettingsRepository {
    async fn load(&self) -> Result<Settings> {
        let records = sqlx::query_as::<_, SettingsRecord>(
            "SELECT key, value, version, updated_at FROM settings",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut settings = Settings::default();

        for record in records {
            match record.key.as_str() {
                keys::ROTATION => {
                    if let Ok(v) = serde_json::from_value(record.value) {
                        settings.rotation = v;
                    }
                }
                keys::AUTHENTICATION => {
                    if let Ok(v) = serde_json::from_value(record.value) {
                        settings.authentication = v;
                    }
                }
                keys::RATE_LIMIT => {
                    if let Ok(v) = serde_json::from_value(record.value) {
                        settings.rate_limit = v;
                    }
                }
                _ => {}
            }
        }

        Ok(settings)
    }

    async fn save(&self, settings: &Settings) -> Result<()> {
        self.set(keys::ROTATION, &settings.rotation).await?;
        self.set(keys::AUTHENTICATION, &settings.authentication)
            .await?;
        self.set(keys::RATE_LIMIT, &settings.rate_limit).await?;

        info!("Updated all settings");
        Ok(())
    }
}
