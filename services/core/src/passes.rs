//! Normalization passes over rows already stored in tb_chart.
//!
//! Each pass writes inside one batch and is idempotent: a normalized row no
//! longer matches any raw pattern, so a second run finds nothing to do.
//! A row is never rewritten onto a natural key another row already holds;
//! such rows stay raw and are reported as conflicts on every run.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::model::{NaturalKey, StoredRow};
use crate::normalize::{CountryTable, StateTable};
use crate::store::NormalizationStore;

/// A rewrite skipped because its target natural key is already taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyConflict {
    pub id: i32,
    pub from: String,
    pub to: String,
    /// Row already holding the rewritten key
    pub existing_id: i32,
}

impl fmt::Display for KeyConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {}: {} -> {} (key held by row {})",
            self.id, self.from, self.to, self.existing_id
        )
    }
}

fn write_conflicts(f: &mut fmt::Formatter<'_>, conflicts: &[KeyConflict]) -> fmt::Result {
    if conflicts.is_empty() {
        return Ok(());
    }
    writeln!(f, "Left untouched, key already taken ({}):", conflicts.len())?;
    for conflict in conflicts {
        writeln!(f, "  - {}", conflict)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CountryPassReport {
    /// Rows whose country was a name or numeric placeholder
    pub examined: usize,
    pub updated: usize,
    /// Distinct raw values that could not be resolved; their rows are untouched
    pub unknown: BTreeSet<String>,
    pub conflicts: Vec<KeyConflict>,
}

impl fmt::Display for CountryPassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Countries: {} examined, {} updated, {} unknown",
            self.examined,
            self.updated,
            self.unknown.len()
        )?;
        for name in &self.unknown {
            writeln!(f, "  - {}", name)?;
        }
        write_conflicts(f, &self.conflicts)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatePassReport {
    /// Rows rewritten through the geocode table
    pub remapped: u64,
    /// Rows rewritten through the manual corrections
    pub corrected: u64,
    pub conflicts: Vec<KeyConflict>,
    pub unresolved: Vec<String>,
}

impl fmt::Display for StatePassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "States: {} remapped, {} corrected",
            self.remapped, self.corrected
        )?;
        write_conflicts(f, &self.conflicts)?;
        write_unresolved(f, &self.unresolved)
    }
}

/// Result of the validation query alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub unresolved: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_unresolved(f, &self.unresolved)
    }
}

fn write_unresolved(f: &mut fmt::Formatter<'_>, states: &[String]) -> fmt::Result {
    if states.is_empty() {
        return writeln!(f, "All states resolved");
    }
    writeln!(f, "Unresolved states ({}):", states.len())?;
    for state in states {
        writeln!(f, "  - {}", if state.is_empty() { "(empty)" } else { state.as_str() })?;
    }
    Ok(())
}

/// Rewrites country names and numeric placeholders to ISO alpha-2 codes.
///
/// Unknown values are collected, never fatal. A storage failure rolls the
/// whole pass back.
pub async fn normalize_stored_countries<S>(
    store: &mut S,
    countries: &CountryTable,
    now: DateTime<Utc>,
) -> Result<CountryPassReport, StorageError>
where
    S: NormalizationStore + ?Sized,
{
    store.begin_batch().await?;
    match country_updates(store, countries, now).await {
        Ok(report) => {
            store.commit_batch().await?;
            info!(
                examined = report.examined,
                updated = report.updated,
                unknown = report.unknown.len(),
                conflicts = report.conflicts.len(),
                "country pass committed"
            );
            Ok(report)
        }
        Err(e) => {
            if let Err(rollback) = store.rollback_batch().await {
                warn!(error = %rollback, "rollback after failed country pass");
            }
            Err(e)
        }
    }
}

async fn country_updates<S>(
    store: &mut S,
    countries: &CountryTable,
    now: DateTime<Utc>,
) -> Result<CountryPassReport, StorageError>
where
    S: NormalizationStore + ?Sized,
{
    let mut report = CountryPassReport::default();
    for row in store.raw_countries().await? {
        report.examined += 1;
        let code = match countries.resolve_code(&row.country) {
            Ok(code) => code,
            Err(e) => {
                debug!(id = row.id, error = %e, "country left as-is");
                report.unknown.insert(e.name().to_string());
                continue;
            }
        };

        let key = NaturalKey {
            country: code.clone(),
            ..row.natural_key()
        };
        if let Some(conflict) = key_conflict(store, &row, &row.country, &code, &key).await? {
            report.conflicts.push(conflict);
            continue;
        }
        store.set_country(row.id, &code, now).await?;
        report.updated += 1;
    }
    Ok(report)
}

/// Maps stored geocodes to state codes, applies the manual corrections to
/// leftovers, then runs the validation query.
pub async fn normalize_stored_states<S>(
    store: &mut S,
    states: &StateTable,
) -> Result<StatePassReport, StorageError>
where
    S: NormalizationStore + ?Sized,
{
    store.begin_batch().await?;
    let mut conflicts = Vec::new();
    let counts = match state_updates(store, states, &mut conflicts).await {
        Ok(counts) => counts,
        Err(e) => {
            if let Err(rollback) = store.rollback_batch().await {
                warn!(error = %rollback, "rollback after failed state pass");
            }
            return Err(e);
        }
    };
    store.commit_batch().await?;

    let (remapped, corrected) = counts;
    info!(
        remapped,
        corrected,
        conflicts = conflicts.len(),
        "state pass committed"
    );

    let unresolved = validate_states(store).await?.unresolved;
    Ok(StatePassReport {
        remapped,
        corrected,
        conflicts,
        unresolved,
    })
}

async fn state_updates<S>(
    store: &mut S,
    states: &StateTable,
    conflicts: &mut Vec<KeyConflict>,
) -> Result<(u64, u64), StorageError>
where
    S: NormalizationStore + ?Sized,
{
    let mut remapped = 0;
    for (geocode, state) in states.geocodes() {
        remapped += rename_state(store, geocode, state, conflicts).await?;
    }

    let mut corrected = 0;
    for (from, to) in states.corrections() {
        corrected += rename_state(store, from, to, conflicts).await?;
    }
    Ok((remapped, corrected))
}

/// Moves every row holding `from` to `to`, one row at a time, skipping rows
/// whose rewritten key is taken. Returns rows moved.
async fn rename_state<S>(
    store: &mut S,
    from: &str,
    to: &str,
    conflicts: &mut Vec<KeyConflict>,
) -> Result<u64, StorageError>
where
    S: NormalizationStore + ?Sized,
{
    if from == to {
        return Ok(0);
    }

    let mut renamed = 0;
    for row in store.rows_with_state(from).await? {
        let key = NaturalKey {
            state: to.to_string(),
            ..row.natural_key()
        };
        if let Some(conflict) = key_conflict(store, &row, from, to, &key).await? {
            conflicts.push(conflict);
            continue;
        }
        store.set_state(row.id, to).await?;
        renamed += 1;
    }
    Ok(renamed)
}

/// Another row already holding `key`, as a conflict record.
async fn key_conflict<S>(
    store: &mut S,
    row: &StoredRow,
    from: &str,
    to: &str,
    key: &NaturalKey,
) -> Result<Option<KeyConflict>, StorageError>
where
    S: NormalizationStore + ?Sized,
{
    let existing = match store.find_by_key(key).await? {
        Some(existing) if existing.id != row.id => existing,
        _ => return Ok(None),
    };
    warn!(
        id = row.id,
        existing_id = existing.id,
        from,
        to,
        "rewrite would duplicate a natural key, row left as-is"
    );
    Ok(Some(KeyConflict {
        id: row.id,
        from: from.to_string(),
        to: to.to_string(),
        existing_id: existing.id,
    }))
}

/// Distinct states still numeric, or missing where a state is required.
pub async fn validate_states<S>(store: &mut S) -> Result<ValidationReport, StorageError>
where
    S: NormalizationStore + ?Sized,
{
    let unresolved = store.unresolved_states().await?;
    if unresolved.is_empty() {
        info!("all states resolved");
    } else {
        warn!(count = unresolved.len(), states = ?unresolved, "unresolved states remain");
    }
    Ok(ValidationReport { unresolved })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChartRecord;
    use crate::store::{ChartStore, MemoryChartStore};
    use chrono::{NaiveDate, TimeZone};
    use std::collections::HashSet;
    use uuid::Uuid;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn seed(rows: &[(&str, &str)]) -> MemoryChartStore {
        let mut store = MemoryChartStore::new();
        for (country, state) in rows {
            let record = ChartRecord {
                country: country.to_string(),
                state: state.to_string(),
                city: String::new(),
                source: "OCDE".to_string(),
                period: NaiveDate::from_ymd_opt(2019, 1, 1).unwrap(),
                label: "Emissão de CO2e".to_string(),
                value: 1.0,
                analysis: "GEE".to_string(),
                external_id: None,
            };
            store.insert(&record, Uuid::new_v4(), at(0)).await.unwrap();
        }
        store
    }

    // -------------------------------------------------------------------------
    // COUNTRY PASS
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_country_pass_resolves_names_and_placeholders() {
        let mut store = seed(&[
            ("Czech Republic", ""),
            ("1", "SP"),
            ("BR", "RJ"),
            ("Atlantis", ""),
            ("FRA", ""),
        ])
        .await;
        let table = CountryTable::bundled().unwrap();

        let report = normalize_stored_countries(&mut store, &table, at(100)).await.unwrap();

        assert_eq!(report.examined, 4);
        assert_eq!(report.updated, 3);
        assert_eq!(report.unknown.iter().collect::<Vec<_>>(), vec!["Atlantis"]);

        let countries: Vec<_> = store.rows().iter().map(|r| r.country.as_str()).collect();
        assert_eq!(countries, vec!["CZ", "BR", "BR", "Atlantis", "FR"]);

        // untouched rows keep their timestamp
        assert_eq!(store.rows()[2].updated_at, at(0));
        assert_eq!(store.rows()[0].updated_at, at(100));
        assert!(!store.in_batch());
    }

    #[tokio::test]
    async fn test_passes_never_duplicate_a_natural_key() {
        let mut store = seed(&[("CZ", ""), ("Czech Republic", ""), ("BR", "SP"), ("BR", "35")]).await;

        let countries = normalize_stored_countries(&mut store, &CountryTable::bundled().unwrap(), at(1))
            .await
            .unwrap();
        let states = normalize_stored_states(&mut store, &StateTable::bundled().unwrap())
            .await
            .unwrap();

        let keys: HashSet<_> = store.rows().iter().map(|r| r.natural_key()).collect();
        assert_eq!(keys.len(), store.rows().len());

        assert_eq!(countries.updated, 0);
        assert_eq!(
            countries.conflicts,
            vec![KeyConflict {
                id: 2,
                from: "Czech Republic".to_string(),
                to: "CZ".to_string(),
                existing_id: 1,
            }]
        );
        assert_eq!(states.remapped, 0);
        assert_eq!(
            states.conflicts,
            vec![KeyConflict {
                id: 4,
                from: "35".to_string(),
                to: "SP".to_string(),
                existing_id: 3,
            }]
        );

        // colliding rows stay raw and keep surfacing
        assert_eq!(store.rows()[1].country, "Czech Republic");
        assert_eq!(store.rows()[1].updated_at, at(0));
        assert_eq!(states.unresolved, vec!["35"]);
        assert!(states.to_string().contains("row 4: 35 -> SP (key held by row 3)"));
    }

    #[tokio::test]
    async fn test_raw_rows_resolving_to_the_same_key() {
        let mut store = seed(&[("Czech Republic", ""), ("CZE", "")]).await;
        let table = CountryTable::bundled().unwrap();

        let report = normalize_stored_countries(&mut store, &table, at(1)).await.unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.updated, 1);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].existing_id, 1);
        assert_eq!(store.rows()[0].country, "CZ");
        assert_eq!(store.rows()[1].country, "CZE");

        // a rerun meets the same conflict and changes nothing
        let again = normalize_stored_countries(&mut store, &table, at(2)).await.unwrap();
        assert_eq!(again.updated, 0);
        assert_eq!(again.conflicts, report.conflicts);
    }

    #[tokio::test]
    async fn test_country_pass_is_idempotent() {
        let mut store = seed(&[("Viet Nam", ""), ("Korea", "")]).await;
        let table = CountryTable::bundled().unwrap();

        normalize_stored_countries(&mut store, &table, at(1)).await.unwrap();
        let second = normalize_stored_countries(&mut store, &table, at(2)).await.unwrap();

        assert_eq!(second, CountryPassReport::default());
        assert!(store.rows().iter().all(|r| r.updated_at == at(1)));
    }

    // -------------------------------------------------------------------------
    // STATE PASS
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_state_pass_remaps_then_corrects() {
        let mut store = seed(&[("BR", "35"), ("AR", "35"), ("BR", "11"), ("PY", "34"), ("BR", "MG")]).await;
        let table = StateTable::bundled().unwrap();

        let report = normalize_stored_states(&mut store, &table).await.unwrap();

        assert_eq!(report.remapped, 3);
        assert_eq!(report.corrected, 1);
        assert!(report.conflicts.is_empty());
        assert!(report.unresolved.is_empty());

        let states: Vec<_> = store.rows().iter().map(|r| r.state.as_str()).collect();
        assert_eq!(states, vec!["SP", "SP", "RO", "SP", "MG"]);
    }

    #[tokio::test]
    async fn test_state_pass_reports_leftovers_and_is_idempotent() {
        let mut store = seed(&[("BR", "99"), ("BR", ""), ("FR", ""), ("BR", "53")]).await;
        let table = StateTable::bundled().unwrap();

        let first = normalize_stored_states(&mut store, &table).await.unwrap();
        assert_eq!(first.remapped, 1);
        assert_eq!(first.unresolved, vec!["".to_string(), "99".to_string()]);

        let second = normalize_stored_states(&mut store, &table).await.unwrap();
        assert_eq!(second.remapped, 0);
        assert_eq!(second.corrected, 0);
        assert_eq!(second.unresolved, first.unresolved);
    }

    #[tokio::test]
    async fn test_validate_only_reads() {
        let mut store = seed(&[("BR", "35")]).await;
        let report = validate_states(&mut store).await.unwrap();

        assert!(!report.is_clean());
        assert_eq!(report.unresolved, vec!["35"]);
        assert_eq!(store.rows()[0].state, "35");
        assert!(report.to_string().contains("Unresolved states (1)"));
    }

    #[test]
    fn test_report_text() {
        let report = StatePassReport {
            remapped: 2,
            corrected: 0,
            conflicts: Vec::new(),
            unresolved: vec![String::new()],
        };
        let text = report.to_string();
        assert!(text.contains("States: 2 remapped, 0 corrected"));
        assert!(text.contains("  - (empty)"));
        assert!(ValidationReport::default().to_string().contains("All states resolved"));
    }
}
