//! Reference-data normalization
//!
//! Two independent lookups:
//! - country: numeric placeholder -> manual override -> ISO 3166-1 table
//! - state: IBGE geocode table, then manual corrections for leftovers
//!
//! Every table is immutable once built. Defaults ship inside the binary
//! (`data/*.csv`); any table can be replaced by an external CSV with the
//! same two-column layout and a header row.

mod country;
mod state;

use std::io::Read;
use std::path::Path;

use crate::error::{ReferenceDataError, UnknownReference};

pub use country::{Country, CountryTable};
pub use state::{is_unresolved_state, StateTable, SUBDIVIDED_COUNTRY};

/// Country and state lookups used together by the loader.
#[derive(Debug, Clone)]
pub struct Normalizer {
    pub countries: CountryTable,
    pub states: StateTable,
}

impl Normalizer {
    pub fn new(countries: CountryTable, states: StateTable) -> Self {
        Self { countries, states }
    }

    /// Bundled tables only.
    pub fn bundled() -> Result<Self, ReferenceDataError> {
        Ok(Self::new(CountryTable::bundled()?, StateTable::bundled()?))
    }

    pub fn normalize_country(&self, raw: &str) -> Result<Country, UnknownReference> {
        self.countries.resolve(raw)
    }

    pub fn normalize_state(&self, raw: &str) -> String {
        self.states.resolve(raw)
    }
}

/// Reads a `key,value` table with a header row.
///
/// Blank keys are rejected so a stray empty line cannot map "" to a code.
pub(crate) fn read_pairs<R: Read>(
    table: &str,
    reader: R,
) -> Result<Vec<(String, String)>, ReferenceDataError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut pairs = Vec::new();
    for (idx, result) in csv_reader.records().enumerate() {
        let line = idx + 2;
        let record = result.map_err(|source| ReferenceDataError::Csv {
            table: table.to_string(),
            source,
        })?;

        let key = record.get(0).unwrap_or("");
        let value = record.get(1).unwrap_or("");
        if key.is_empty() || value.is_empty() {
            return Err(ReferenceDataError::Invalid {
                table: table.to_string(),
                line,
                reason: format!("expected two non-empty fields, found {:?}", record),
            });
        }
        pairs.push((key.to_string(), value.to_string()));
    }
    Ok(pairs)
}

pub(crate) fn read_pairs_file(path: &Path) -> Result<Vec<(String, String)>, ReferenceDataError> {
    let file = std::fs::File::open(path)?;
    read_pairs(&path.display().to_string(), file)
}
