use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use super::{read_pairs, read_pairs_file};
use crate::error::{ReferenceDataError, UnknownReference};

const BUNDLED_NUMERIC: &str = include_str!("../../data/country_numeric.csv");
const BUNDLED_OVERRIDES: &str = include_str!("../../data/country_overrides.csv");
const BUNDLED_ISO3166: &str = include_str!("../../data/iso3166.csv");

/// Result of resolving a country locator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Country {
    /// ISO 3166-1 alpha-2 code
    Code(String),
    /// Numeric placeholder absent from the numeric table
    Unknown,
}

impl Country {
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Code(code) => Some(code),
            Self::Unknown => None,
        }
    }
}

/// Layered country lookup.
///
/// Order matters: numeric placeholders first, then manual overrides (they fix
/// spellings the ISO table does not know), then the ISO table.
#[derive(Debug, Clone, Default)]
pub struct CountryTable {
    numeric: HashMap<String, String>,
    overrides: HashMap<String, String>,
    // keyed by upper-cased alpha-2, alpha-3 and official name
    standard: HashMap<String, String>,
}

impl CountryTable {
    pub fn bundled() -> Result<Self, ReferenceDataError> {
        Ok(Self {
            numeric: read_pairs("country_numeric", BUNDLED_NUMERIC.as_bytes())?
                .into_iter()
                .collect(),
            overrides: read_pairs("country_overrides", BUNDLED_OVERRIDES.as_bytes())?
                .into_iter()
                .collect(),
            standard: load_iso3166(BUNDLED_ISO3166)?,
        })
    }

    /// Replaces the manual override table with an external `name,code` file.
    pub fn with_overrides_file(mut self, path: &Path) -> Result<Self, ReferenceDataError> {
        self.overrides = read_pairs_file(path)?.into_iter().collect();
        Ok(self)
    }

    /// Replaces the numeric placeholder table with an external `code,country` file.
    pub fn with_numeric_file(mut self, path: &Path) -> Result<Self, ReferenceDataError> {
        self.numeric = read_pairs_file(path)?.into_iter().collect();
        Ok(self)
    }

    pub fn with_override(mut self, name: &str, code: &str) -> Self {
        self.overrides.insert(name.to_string(), code.to_string());
        self
    }

    pub fn resolve(&self, raw: &str) -> Result<Country, UnknownReference> {
        let name = raw.trim();

        if !name.is_empty() && name.chars().all(|c| c.is_ascii_digit()) {
            return Ok(match self.numeric.get(name) {
                Some(code) => Country::Code(code.clone()),
                None => Country::Unknown,
            });
        }

        if let Some(code) = self.overrides.get(name) {
            return Ok(Country::Code(code.clone()));
        }

        self.standard
            .get(&name.to_uppercase())
            .map(|code| Country::Code(code.clone()))
            .ok_or_else(|| UnknownReference::UnknownCountry(name.to_string()))
    }

    /// Like [`CountryTable::resolve`], folding the numeric sentinel into an error.
    pub fn resolve_code(&self, raw: &str) -> Result<String, UnknownReference> {
        match self.resolve(raw)? {
            Country::Code(code) => Ok(code),
            Country::Unknown => Err(UnknownReference::UnknownNumericCode(raw.trim().to_string())),
        }
    }
}

fn load_iso3166(content: &str) -> Result<HashMap<String, String>, ReferenceDataError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut standard = HashMap::new();
    for (idx, result) in reader.records().enumerate() {
        let record = result.map_err(|source| ReferenceDataError::Csv {
            table: "iso3166".to_string(),
            source,
        })?;
        let (Some(alpha2), Some(alpha3), Some(name)) = (record.get(0), record.get(1), record.get(2))
        else {
            return Err(ReferenceDataError::Invalid {
                table: "iso3166".to_string(),
                line: idx + 2,
                reason: "expected alpha2,alpha3,name".to_string(),
            });
        };
        for key in [alpha2, alpha3, name] {
            standard.insert(key.to_uppercase(), alpha2.to_string());
        }
    }
    Ok(standard)
}
