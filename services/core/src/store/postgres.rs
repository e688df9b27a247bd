use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ChartStore, NormalizationStore};
use crate::config::DbConfig;
use crate::error::StorageError;
use crate::model::{ChartRecord, NaturalKey, StoredRow};
use crate::normalize::SUBDIVIDED_COUNTRY;

const FIND_BY_KEY_SQL: &str = r#"
    SELECT id, country, COALESCE(state, '') AS state, COALESCE(city, '') AS city,
           COALESCE(source, '') AS source, period, label,
           value::float8 AS value, analysis, external_id,
           created_at::timestamptz AS created_at,
           updated_at::timestamptz AS updated_at
    FROM tb_chart
    WHERE country = $1 AND state = $2 AND period = $3 AND label = $4 AND analysis = $5
    ORDER BY id
    LIMIT 1
"#;

const INSERT_SQL: &str = r#"
    INSERT INTO tb_chart
    (country, state, city, source, period, label, value, analysis, external_id, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
    RETURNING id
"#;

const SAMPLE_SQL: &str = r#"
    SELECT id, country, COALESCE(state, '') AS state, COALESCE(city, '') AS city,
           COALESCE(source, '') AS source, period, label,
           value::float8 AS value, analysis, external_id,
           created_at::timestamptz AS created_at,
           updated_at::timestamptz AS updated_at
    FROM tb_chart
    WHERE label = $1
    ORDER BY id
    LIMIT $2
"#;

const RAW_COUNTRIES_SQL: &str = r#"
    SELECT id, country, COALESCE(state, '') AS state, COALESCE(city, '') AS city,
           COALESCE(source, '') AS source, period, label,
           value::float8 AS value, analysis, external_id,
           created_at::timestamptz AS created_at,
           updated_at::timestamptz AS updated_at
    FROM tb_chart
    WHERE LENGTH(country) > 2 OR country ~ '^[0-9]+$'
    ORDER BY id
"#;

const ROWS_WITH_STATE_SQL: &str = r#"
    SELECT id, country, COALESCE(state, '') AS state, COALESCE(city, '') AS city,
           COALESCE(source, '') AS source, period, label,
           value::float8 AS value, analysis, external_id,
           created_at::timestamptz AS created_at,
           updated_at::timestamptz AS updated_at
    FROM tb_chart
    WHERE state = $1
    ORDER BY id
"#;

/// tb_chart in Postgres, over a single pooled connection.
///
/// The open batch owns that connection as a transaction; dropping the store
/// with a batch still open rolls it back.
pub struct PgChartStore {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgChartStore {
    pub async fn connect(config: &DbConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(config.connect_options()?)
            .await?;
        info!(db = %config.describe(), "connected to chart database");
        Ok(Self { pool, tx: None })
    }

    /// Rolls back any open batch and releases the connection.
    pub async fn close(mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                debug!(error = %e, "rollback on close failed");
            }
        }
        self.pool.close().await;
    }
}

#[async_trait]
impl ChartStore for PgChartStore {
    async fn begin_batch(&mut self) -> Result<(), StorageError> {
        if self.tx.is_some() {
            return Err(StorageError::BatchAlreadyOpen);
        }
        self.tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn commit_batch(&mut self) -> Result<(), StorageError> {
        let tx = self.tx.take().ok_or(StorageError::NoOpenBatch)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback_batch(&mut self) -> Result<(), StorageError> {
        let tx = self.tx.take().ok_or(StorageError::NoOpenBatch)?;
        tx.rollback().await?;
        Ok(())
    }

    async fn find_by_key(&mut self, key: &NaturalKey) -> Result<Option<StoredRow>, StorageError> {
        let query = sqlx::query_as::<_, StoredRow>(FIND_BY_KEY_SQL)
            .bind(&key.country)
            .bind(&key.state)
            .bind(key.period)
            .bind(&key.label)
            .bind(&key.analysis);

        let row = match self.tx.as_mut() {
            Some(tx) => query.fetch_optional(&mut **tx).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        Ok(row)
    }

    async fn insert(
        &mut self,
        record: &ChartRecord,
        external_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i32, StorageError> {
        let query = sqlx::query_as::<_, (i32,)>(INSERT_SQL)
            .bind(&record.country)
            .bind(&record.state)
            .bind(&record.city)
            .bind(&record.source)
            .bind(record.period)
            .bind(&record.label)
            .bind(record.value)
            .bind(&record.analysis)
            .bind(external_id)
            .bind(now);

        let (id,) = match self.tx.as_mut() {
            Some(tx) => query.fetch_one(&mut **tx).await?,
            None => query.fetch_one(&self.pool).await?,
        };
        Ok(id)
    }

    async fn update_value(
        &mut self,
        id: i32,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let query = sqlx::query("UPDATE tb_chart SET value = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(value)
            .bind(now);

        let result = match self.tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        if result.rows_affected() == 0 {
            return Err(StorageError::MissingRow(id));
        }
        Ok(())
    }

    async fn count(&mut self) -> Result<i64, StorageError> {
        let query = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM tb_chart");
        let (count,) = match self.tx.as_mut() {
            Some(tx) => query.fetch_one(&mut **tx).await?,
            None => query.fetch_one(&self.pool).await?,
        };
        Ok(count)
    }

    async fn sample(&mut self, label: &str, limit: i64) -> Result<Vec<StoredRow>, StorageError> {
        let query = sqlx::query_as::<_, StoredRow>(SAMPLE_SQL)
            .bind(label)
            .bind(limit);
        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows)
    }
}

#[async_trait]
impl NormalizationStore for PgChartStore {
    async fn raw_countries(&mut self) -> Result<Vec<StoredRow>, StorageError> {
        let query = sqlx::query_as::<_, StoredRow>(RAW_COUNTRIES_SQL);
        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows)
    }

    async fn set_country(
        &mut self,
        id: i32,
        country: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let query = sqlx::query("UPDATE tb_chart SET country = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(country)
            .bind(now);

        let result = match self.tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        if result.rows_affected() == 0 {
            return Err(StorageError::MissingRow(id));
        }
        Ok(())
    }

    async fn rows_with_state(&mut self, state: &str) -> Result<Vec<StoredRow>, StorageError> {
        let query = sqlx::query_as::<_, StoredRow>(ROWS_WITH_STATE_SQL).bind(state);
        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows)
    }

    async fn set_state(&mut self, id: i32, state: &str) -> Result<(), StorageError> {
        let query = sqlx::query("UPDATE tb_chart SET state = $2 WHERE id = $1")
            .bind(id)
            .bind(state);

        let result = match self.tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        if result.rows_affected() == 0 {
            return Err(StorageError::MissingRow(id));
        }
        Ok(())
    }

    async fn unresolved_states(&mut self) -> Result<Vec<String>, StorageError> {
        let query = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT DISTINCT COALESCE(state, '') AS state
            FROM tb_chart
            WHERE state ~ '^[0-9]+$'
               OR ((state IS NULL OR state = '') AND country = $1)
            ORDER BY 1
            "#,
        )
        .bind(SUBDIVIDED_COUNTRY);

        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows.into_iter().map(|(state,)| state).collect())
    }
}
