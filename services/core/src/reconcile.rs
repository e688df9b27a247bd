//! Insert-or-update of chart records keyed by their natural key.
//!
//! Check-then-write is only safe with a single writer. Concurrent loaders need
//! the unique index from `sql/tb_chart.sql` and an ON CONFLICT upsert instead.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{IngestError, StorageError};
use crate::model::{ChartRecord, NaturalKey, Outcome};
use crate::store::ChartStore;

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Counters for everything a reconciler has applied so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub inserted: usize,
    pub updated: usize,
    /// Records whose key was already seen earlier in the same run
    pub repeated_keys: usize,
    pub committed_batches: usize,
    pub committed_records: usize,
}

impl ReconcileStats {
    pub fn applied(&self) -> usize {
        self.inserted + self.updated
    }
}

pub struct Reconciler<S> {
    store: S,
    clock: Clock,
    seen: HashSet<NaturalKey>,
    stats: ReconcileStats,
}

impl<S: ChartStore> Reconciler<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Box::new(Utc::now),
            seen: HashSet::new(),
            stats: ReconcileStats::default(),
        }
    }

    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Box::new(clock);
        self
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Applies one record: update the row holding its natural key, or insert it.
    ///
    /// One lookup and exactly one write. Updates touch `value` and
    /// `updated_at` only.
    pub async fn reconcile(&mut self, record: &ChartRecord) -> Result<Outcome, StorageError> {
        let key = record.natural_key();
        let now = (self.clock)();

        let outcome = match self.store.find_by_key(&key).await? {
            Some(existing) => {
                debug!(id = existing.id, ?key, "record already exists, updating value");
                self.store.update_value(existing.id, record.value, now).await?;
                self.stats.updated += 1;
                Outcome::Updated
            }
            None => {
                let external_id = record.external_id.unwrap_or_else(Uuid::new_v4);
                let id = self.store.insert(record, external_id, now).await?;
                debug!(id, ?key, "record inserted");
                self.stats.inserted += 1;
                Outcome::Inserted
            }
        };

        if !self.seen.insert(key) {
            self.stats.repeated_keys += 1;
        }
        Ok(outcome)
    }

    /// Reconciles `records` in commit batches of at most `batch_size`.
    ///
    /// A storage failure rolls back the batch in flight and stops the run;
    /// batches committed before it stay.
    pub async fn apply_batches(
        &mut self,
        records: &[ChartRecord],
        batch_size: usize,
    ) -> Result<Vec<Outcome>, IngestError> {
        let batch_size = batch_size.max(1);
        let mut outcomes = Vec::with_capacity(records.len());

        for (batch_idx, batch) in records.chunks(batch_size).enumerate() {
            let batch_number = batch_idx + 1;
            let before = self.stats;
            let seen_before = self.seen.clone();

            match self.apply_batch(batch).await {
                Ok(batch_outcomes) => {
                    self.stats.committed_batches += 1;
                    self.stats.committed_records += batch.len();
                    outcomes.extend(batch_outcomes);
                    info!(
                        batch = batch_number,
                        records = batch.len(),
                        committed = self.stats.committed_records,
                        "batch committed"
                    );
                }
                Err(source) => {
                    if let Err(e) = self.store.rollback_batch().await {
                        warn!(batch = batch_number, error = %e, "rollback failed");
                    }
                    // counters describe committed work only
                    self.stats = before;
                    self.seen = seen_before;
                    return Err(IngestError::BatchFailed {
                        batch: batch_number,
                        committed_batches: self.stats.committed_batches,
                        committed_records: self.stats.committed_records,
                        source,
                    });
                }
            }
        }

        Ok(outcomes)
    }

    async fn apply_batch(&mut self, batch: &[ChartRecord]) -> Result<Vec<Outcome>, StorageError> {
        self.store.begin_batch().await?;
        let mut outcomes = Vec::with_capacity(batch.len());
        for record in batch {
            outcomes.push(self.reconcile(record).await?);
        }
        self.store.commit_batch().await?;
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StoredRow;
    use crate::store::MemoryChartStore;
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate, TimeZone};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    fn record(state: &str, label: &str, value: f64) -> ChartRecord {
        ChartRecord {
            country: "BR".to_string(),
            state: state.to_string(),
            city: String::new(),
            source: "ISAgro".to_string(),
            period: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            label: label.to_string(),
            value,
            analysis: "NPK".to_string(),
            external_id: None,
        }
    }

    /// Clock advancing one second per reading.
    fn ticking_clock() -> impl Fn() -> DateTime<Utc> + Send + Sync + 'static {
        let ticks = Arc::new(AtomicI64::new(0));
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        move || start + Duration::seconds(ticks.fetch_add(1, Ordering::SeqCst))
    }

    /// Memory store that fails the Nth write (1-based, counted across the run).
    struct FailingStore {
        inner: MemoryChartStore,
        writes: usize,
        fail_on: usize,
    }

    impl FailingStore {
        fn new(fail_on: usize) -> Self {
            Self {
                inner: MemoryChartStore::new(),
                writes: 0,
                fail_on,
            }
        }

        fn tick(&mut self) -> Result<(), StorageError> {
            self.writes += 1;
            if self.writes == self.fail_on {
                return Err(StorageError::Backend("connection reset".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ChartStore for FailingStore {
        async fn begin_batch(&mut self) -> Result<(), StorageError> {
            self.inner.begin_batch().await
        }
        async fn commit_batch(&mut self) -> Result<(), StorageError> {
            self.inner.commit_batch().await
        }
        async fn rollback_batch(&mut self) -> Result<(), StorageError> {
            self.inner.rollback_batch().await
        }
        async fn find_by_key(
            &mut self,
            key: &NaturalKey,
        ) -> Result<Option<StoredRow>, StorageError> {
            self.inner.find_by_key(key).await
        }
        async fn insert(
            &mut self,
            record: &ChartRecord,
            external_id: Uuid,
            now: DateTime<Utc>,
        ) -> Result<i32, StorageError> {
            self.tick()?;
            self.inner.insert(record, external_id, now).await
        }
        async fn update_value(
            &mut self,
            id: i32,
            value: f64,
            now: DateTime<Utc>,
        ) -> Result<(), StorageError> {
            self.tick()?;
            self.inner.update_value(id, value, now).await
        }
        async fn count(&mut self) -> Result<i64, StorageError> {
            self.inner.count().await
        }
        async fn sample(
            &mut self,
            label: &str,
            limit: i64,
        ) -> Result<Vec<StoredRow>, StorageError> {
            self.inner.sample(label, limit).await
        }
    }

    // -------------------------------------------------------------------------
    // SINGLE RECORD
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_insert_then_update() {
        let mut reconciler =
            Reconciler::new(MemoryChartStore::new()).with_clock(ticking_clock());

        let first = reconciler
            .reconcile(&record("SP", "Fertilizantes Sintéticos", 500.0))
            .await
            .unwrap();
        assert_eq!(first, Outcome::Inserted);
        let created = reconciler.store_mut().rows()[0].clone();

        let second = reconciler
            .reconcile(&record("SP", "Fertilizantes Sintéticos", 750.0))
            .await
            .unwrap();
        assert_eq!(second, Outcome::Updated);

        let rows = reconciler.store_mut().rows().to_vec();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 750.0);
        assert_eq!(rows[0].created_at, created.created_at);
        assert_eq!(rows[0].external_id, created.external_id);
        assert!(rows[0].updated_at > created.updated_at);
    }

    #[tokio::test]
    async fn test_insert_sets_both_timestamps() {
        let mut reconciler =
            Reconciler::new(MemoryChartStore::new()).with_clock(ticking_clock());
        reconciler.reconcile(&record("SP", "A", 1.0)).await.unwrap();
        let row = &reconciler.store_mut().rows()[0];
        assert_eq!(row.created_at, row.updated_at);
        assert!(row.external_id.is_some());
    }

    #[tokio::test]
    async fn test_given_external_id_is_kept() {
        let id = Uuid::new_v4();
        let mut rec = record("SP", "A", 1.0);
        rec.external_id = Some(id);

        let mut reconciler = Reconciler::new(MemoryChartStore::new());
        reconciler.reconcile(&rec).await.unwrap();
        assert_eq!(reconciler.store_mut().rows()[0].external_id, Some(id));
    }

    #[tokio::test]
    async fn test_update_leaves_other_fields_untouched() {
        let mut reconciler = Reconciler::new(MemoryChartStore::new());
        reconciler.reconcile(&record("SP", "A", 1.0)).await.unwrap();

        let mut changed = record("SP", "A", 2.0);
        changed.source = "OCDE".to_string();
        changed.city = "Campinas".to_string();
        reconciler.reconcile(&changed).await.unwrap();

        let row = &reconciler.store_mut().rows()[0];
        assert_eq!(row.value, 2.0);
        assert_eq!(row.source, "ISAgro");
        assert_eq!(row.city, "");
    }

    #[tokio::test]
    async fn test_distinct_keys_insert_separately() {
        let mut reconciler = Reconciler::new(MemoryChartStore::new());
        reconciler.reconcile(&record("SP", "A", 1.0)).await.unwrap();
        reconciler.reconcile(&record("MG", "A", 1.0)).await.unwrap();
        reconciler.reconcile(&record("", "A", 1.0)).await.unwrap();
        reconciler.reconcile(&record("SP", "B", 1.0)).await.unwrap();
        assert_eq!(reconciler.stats().inserted, 4);
        assert_eq!(reconciler.stats().updated, 0);
    }

    #[tokio::test]
    async fn test_repeated_keys_last_value_wins() {
        let mut reconciler = Reconciler::new(MemoryChartStore::new());
        for value in [1.0, 2.0, 3.0] {
            reconciler.reconcile(&record("SP", "A", value)).await.unwrap();
        }
        let stats = reconciler.stats();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.updated, 2);
        assert_eq!(stats.repeated_keys, 2);
        assert_eq!(reconciler.store_mut().rows()[0].value, 3.0);
    }

    // -------------------------------------------------------------------------
    // BATCHES
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_batches_commit_in_chunks() {
        let records: Vec<_> = (0..5)
            .map(|i| record("SP", &format!("label-{i}"), i as f64))
            .collect();
        let mut reconciler = Reconciler::new(MemoryChartStore::new());

        let outcomes = reconciler.apply_batches(&records, 2).await.unwrap();
        assert_eq!(outcomes.len(), 5);
        let stats = reconciler.stats();
        assert_eq!(stats.committed_batches, 3);
        assert_eq!(stats.committed_records, 5);
        assert!(!reconciler.store_mut().in_batch());
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back_entirely() {
        // batch 1 = records 1-2, batch 2 = records 3-5; the 4th write fails
        let records: Vec<_> = (0..5)
            .map(|i| record("SP", &format!("label-{i}"), i as f64))
            .collect();
        let mut reconciler = Reconciler::new(FailingStore::new(4));

        let err = reconciler.apply_batches(&records, 2).await.unwrap_err();
        match &err {
            IngestError::BatchFailed {
                batch,
                committed_batches,
                committed_records,
                ..
            } => {
                assert_eq!(*batch, 2);
                assert_eq!(*committed_batches, 1);
                assert_eq!(*committed_records, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.committed_records(), 2);

        let store = reconciler.into_store();
        let labels: Vec<_> = store.inner.rows().iter().map(|r| r.label.clone()).collect();
        assert_eq!(labels, vec!["label-0", "label-1"]);
        assert!(!store.inner.in_batch());
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_count_rolled_back_work() {
        let records: Vec<_> = (0..3)
            .map(|i| record("SP", &format!("label-{i}"), i as f64))
            .collect();
        let mut reconciler = Reconciler::new(FailingStore::new(3));

        reconciler.apply_batches(&records, 10).await.unwrap_err();
        assert_eq!(reconciler.stats(), ReconcileStats::default());
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let records: Vec<_> = ["SP", "MG", "RJ", "RS"]
            .iter()
            .map(|s| record(s, "Fertilizantes Sintéticos", 10.0))
            .collect();

        let mut reconciler = Reconciler::new(MemoryChartStore::new());
        reconciler.apply_batches(&records, 3).await.unwrap();
        let first: Vec<_> = reconciler
            .store_mut()
            .rows()
            .iter()
            .map(|r| (r.natural_key(), r.value))
            .collect();

        let mut again = Reconciler::new(reconciler.into_store());
        let outcomes = again.apply_batches(&records, 3).await.unwrap();
        assert!(outcomes.iter().all(|o| *o == Outcome::Updated));

        let second: Vec<_> = again
            .store_mut()
            .rows()
            .iter()
            .map(|r| (r.natural_key(), r.value))
            .collect();
        assert_eq!(first, second);

        let keys: HashSet<_> = second.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys.len(), second.len());
    }
}
