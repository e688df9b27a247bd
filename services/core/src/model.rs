use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A normalized observation ready to be reconciled into tb_chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartRecord {
    pub country: String,
    /// UF abbreviation for Brazilian rows, empty when not applicable
    pub state: String,
    pub city: String,
    pub source: String,
    pub period: NaiveDate,
    pub label: String,
    pub value: f64,
    pub analysis: String,
    pub external_id: Option<Uuid>,
}

impl ChartRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            country: self.country.clone(),
            state: self.state.clone(),
            period: self.period,
            label: self.label.clone(),
            analysis: self.analysis.clone(),
        }
    }
}

/// Identity of a logical observation.
///
/// Compared field by field, case-sensitive. An empty `state` is a value like
/// any other, never NULL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NaturalKey {
    pub country: String,
    pub state: String,
    pub period: NaiveDate,
    pub label: String,
    pub analysis: String,
}

/// A row as persisted, with its administrative columns.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct StoredRow {
    pub id: i32,
    pub country: String,
    pub state: String,
    pub city: String,
    pub source: String,
    pub period: NaiveDate,
    pub label: String,
    pub value: f64,
    pub analysis: String,
    pub external_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredRow {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            country: self.country.clone(),
            state: self.state.clone(),
            period: self.period,
            label: self.label.clone(),
            analysis: self.analysis.clone(),
        }
    }
}

/// What `reconcile` did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Inserted,
    Updated,
}
