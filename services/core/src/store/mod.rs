//! Storage capabilities the loaders depend on
//!
//! `ChartStore` is what the reconciler needs; `NormalizationStore` adds the
//! bulk queries of the stored-row normalization passes. Writes issued while a
//! batch is open become visible to later reads of the same store and are
//! discarded together on rollback. Writes outside a batch apply immediately.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageError;
use crate::model::{ChartRecord, NaturalKey, StoredRow};

pub use memory::MemoryChartStore;
pub use postgres::PgChartStore;

#[async_trait]
pub trait ChartStore: Send {
    async fn begin_batch(&mut self) -> Result<(), StorageError>;
    async fn commit_batch(&mut self) -> Result<(), StorageError>;
    async fn rollback_batch(&mut self) -> Result<(), StorageError>;

    /// First row matching the natural key exactly.
    async fn find_by_key(&mut self, key: &NaturalKey) -> Result<Option<StoredRow>, StorageError>;

    /// Inserts with `created_at = updated_at = now`, returning the new id.
    async fn insert(
        &mut self,
        record: &ChartRecord,
        external_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i32, StorageError>;

    /// Touches only `value` and `updated_at`.
    async fn update_value(
        &mut self,
        id: i32,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn count(&mut self) -> Result<i64, StorageError>;

    /// Up to `limit` rows carrying `label`, oldest first.
    async fn sample(&mut self, label: &str, limit: i64) -> Result<Vec<StoredRow>, StorageError>;
}

#[async_trait]
pub trait NormalizationStore: ChartStore {
    /// Rows whose country is a name (longer than two characters) or a
    /// numeric placeholder, by id.
    async fn raw_countries(&mut self) -> Result<Vec<StoredRow>, StorageError>;

    async fn set_country(
        &mut self,
        id: i32,
        country: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Rows whose state equals `state` exactly, by id.
    async fn rows_with_state(&mut self, state: &str) -> Result<Vec<StoredRow>, StorageError>;

    /// Rewrites one row's state. `updated_at` is left alone.
    async fn set_state(&mut self, id: i32, state: &str) -> Result<(), StorageError>;

    /// Distinct state values still numeric, or missing on a subdivided country.
    async fn unresolved_states(&mut self) -> Result<Vec<String>, StorageError>;
}

#[async_trait]
impl<S: ChartStore + ?Sized> ChartStore for &mut S {
    async fn begin_batch(&mut self) -> Result<(), StorageError> {
        (**self).begin_batch().await
    }

    async fn commit_batch(&mut self) -> Result<(), StorageError> {
        (**self).commit_batch().await
    }

    async fn rollback_batch(&mut self) -> Result<(), StorageError> {
        (**self).rollback_batch().await
    }

    async fn find_by_key(&mut self, key: &NaturalKey) -> Result<Option<StoredRow>, StorageError> {
        (**self).find_by_key(key).await
    }

    async fn insert(
        &mut self,
        record: &ChartRecord,
        external_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i32, StorageError> {
        (**self).insert(record, external_id, now).await
    }

    async fn update_value(
        &mut self,
        id: i32,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        (**self).update_value(id, value, now).await
    }

    async fn count(&mut self) -> Result<i64, StorageError> {
        (**self).count().await
    }

    async fn sample(&mut self, label: &str, limit: i64) -> Result<Vec<StoredRow>, StorageError> {
        (**self).sample(label, limit).await
    }
}

/// Raw-country predicate shared by both stores.
pub(crate) fn is_raw_country(country: &str) -> bool {
    country.chars().count() > 2
        || (!country.is_empty() && country.chars().all(|c| c.is_ascii_digit()))
}
