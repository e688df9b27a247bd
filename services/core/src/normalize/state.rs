use std::collections::BTreeMap;
use std::path::Path;

use super::{read_pairs, read_pairs_file};
use crate::error::ReferenceDataError;

const BUNDLED_GEOCODES: &str = include_str!("../../data/ibge_geocodes.csv");
const BUNDLED_CORRECTIONS: &str = include_str!("../../data/state_corrections.csv");

/// Geocode -> state abbreviation lookup.
///
/// `corrections` only apply to values that are still numeric after the
/// geocode mapping, e.g. the `1 -> DF` artifact of earlier malformed loads.
#[derive(Debug, Clone, Default)]
pub struct StateTable {
    geocodes: BTreeMap<String, String>,
    corrections: BTreeMap<String, String>,
}

impl StateTable {
    pub fn bundled() -> Result<Self, ReferenceDataError> {
        Ok(Self {
            geocodes: read_pairs("ibge_geocodes", BUNDLED_GEOCODES.as_bytes())?
                .into_iter()
                .collect(),
            corrections: read_pairs("state_corrections", BUNDLED_CORRECTIONS.as_bytes())?
                .into_iter()
                .collect(),
        })
    }

    /// Replaces the geocode table with an external `geocode,state` file.
    pub fn with_geocodes_file(mut self, path: &Path) -> Result<Self, ReferenceDataError> {
        self.geocodes = read_pairs_file(path)?.into_iter().collect();
        Ok(self)
    }

    pub fn with_corrections_file(mut self, path: &Path) -> Result<Self, ReferenceDataError> {
        self.corrections = read_pairs_file(path)?.into_iter().collect();
        Ok(self)
    }

    pub fn geocodes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.geocodes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn corrections(&self) -> impl Iterator<Item = (&str, &str)> {
        self.corrections.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Maps a geocode to its abbreviation; anything unmapped comes back as-is.
    pub fn resolve(&self, raw: &str) -> String {
        let value = raw.trim();
        if let Some(state) = self.geocodes.get(value) {
            return state.clone();
        }
        if is_numeric(value) {
            if let Some(state) = self.corrections.get(value) {
                return state.clone();
            }
        }
        value.to_string()
    }
}

fn is_numeric(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}

/// Country whose rows are expected to carry a state abbreviation.
pub const SUBDIVIDED_COUNTRY: &str = "BR";

/// A state still needing operator attention: an all-digit geocode, or no
/// state at all on a row of the subdivided country.
pub fn is_unresolved_state(country: &str, state: &str) -> bool {
    let state = state.trim();
    is_numeric(state) || (state.is_empty() && country == SUBDIVIDED_COUNTRY)
}
