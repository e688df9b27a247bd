use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{is_raw_country, ChartStore, NormalizationStore};
use crate::error::StorageError;
use crate::model::{ChartRecord, NaturalKey, StoredRow};
use crate::normalize::is_unresolved_state;

/// tb_chart held in memory.
///
/// Used for dry runs and as the storage double in tests. An open batch keeps
/// a copy of the table taken at `begin_batch`; rollback restores it.
#[derive(Debug, Clone, Default)]
pub struct MemoryChartStore {
    rows: Vec<StoredRow>,
    next_id: i32,
    snapshot: Option<(Vec<StoredRow>, i32)>,
}

impl MemoryChartStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[StoredRow] {
        &self.rows
    }

    pub fn in_batch(&self) -> bool {
        self.snapshot.is_some()
    }

    fn row_mut(&mut self, id: i32) -> Result<&mut StoredRow, StorageError> {
        self.rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(StorageError::MissingRow(id))
    }
}

#[async_trait]
impl ChartStore for MemoryChartStore {
    async fn begin_batch(&mut self) -> Result<(), StorageError> {
        if self.snapshot.is_some() {
            return Err(StorageError::BatchAlreadyOpen);
        }
        self.snapshot = Some((self.rows.clone(), self.next_id));
        Ok(())
    }

    async fn commit_batch(&mut self) -> Result<(), StorageError> {
        self.snapshot.take().ok_or(StorageError::NoOpenBatch)?;
        Ok(())
    }

    async fn rollback_batch(&mut self) -> Result<(), StorageError> {
        let (rows, next_id) = self.snapshot.take().ok_or(StorageError::NoOpenBatch)?;
        self.rows = rows;
        self.next_id = next_id;
        Ok(())
    }

    async fn find_by_key(&mut self, key: &NaturalKey) -> Result<Option<StoredRow>, StorageError> {
        Ok(self
            .rows
            .iter()
            .find(|row| {
                row.country == key.country
                    && row.state == key.state
                    && row.period == key.period
                    && row.label == key.label
                    && row.analysis == key.analysis
            })
            .cloned())
    }

    async fn insert(
        &mut self,
        record: &ChartRecord,
        external_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i32, StorageError> {
        self.next_id += 1;
        let id = self.next_id;
        self.rows.push(StoredRow {
            id,
            country: record.country.clone(),
            state: record.state.clone(),
            city: record.city.clone(),
            source: record.source.clone(),
            period: record.period,
            label: record.label.clone(),
            value: record.value,
            analysis: record.analysis.clone(),
            external_id: Some(external_id),
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn update_value(
        &mut self,
        id: i32,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let row = self.row_mut(id)?;
        row.value = value;
        row.updated_at = now;
        Ok(())
    }

    async fn count(&mut self) -> Result<i64, StorageError> {
        Ok(self.rows.len() as i64)
    }

    async fn sample(&mut self, label: &str, limit: i64) -> Result<Vec<StoredRow>, StorageError> {
        Ok(self
            .rows
            .iter()
            .filter(|row| row.label == label)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NormalizationStore for MemoryChartStore {
    async fn raw_countries(&mut self) -> Result<Vec<StoredRow>, StorageError> {
        Ok(self
            .rows
            .iter()
            .filter(|row| is_raw_country(&row.country))
            .cloned()
            .collect())
    }

    async fn set_country(
        &mut self,
        id: i32,
        country: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let row = self.row_mut(id)?;
        row.country = country.to_string();
        row.updated_at = now;
        Ok(())
    }

    async fn rows_with_state(&mut self, state: &str) -> Result<Vec<StoredRow>, StorageError> {
        Ok(self
            .rows
            .iter()
            .filter(|row| row.state == state)
            .cloned()
            .collect())
    }

    async fn set_state(&mut self, id: i32, state: &str) -> Result<(), StorageError> {
        self.row_mut(id)?.state = state.to_string();
        Ok(())
    }

    async fn unresolved_states(&mut self) -> Result<Vec<String>, StorageError> {
        let states: BTreeSet<String> = self
            .rows
            .iter()
            .filter(|row| is_unresolved_state(&row.country, &row.state))
            .map(|row| row.state.clone())
            .collect();
        Ok(states.into_iter().collect())
    }
}
