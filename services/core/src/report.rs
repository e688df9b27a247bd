use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::error::ParseError;
use crate::model::ChartRecord;

/// Rows kept in `RunSummary::sample`.
pub const SAMPLE_SIZE: usize = 10;
/// Parse errors kept verbatim in `RunSummary::parse_errors`.
pub const PARSE_ERROR_SAMPLE: usize = 5;

/// Outcome of one load, for the console or as JSON.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub file: String,
    pub content_hash: String,
    pub encoding: String,
    pub family: String,
    pub dry_run: bool,
    pub rows_read: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Rows dropped because a field could not be coerced
    pub skipped: usize,
    /// Rows dropped because their country could not be resolved
    pub unresolved: usize,
    pub repeated_keys: usize,
    pub batches_committed: usize,
    pub unresolved_names: BTreeSet<String>,
    /// Geocodes loaded unchanged because no table maps them
    pub flagged_states: BTreeSet<String>,
    pub parse_errors: Vec<String>,
    pub sample: Vec<ChartRecord>,
}

impl RunSummary {
    pub fn applied(&self) -> usize {
        self.inserted + self.updated
    }

    pub(crate) fn record_parse_error(&mut self, error: &ParseError) {
        self.skipped += 1;
        if self.parse_errors.len() < PARSE_ERROR_SAMPLE {
            self.parse_errors.push(error.to_string());
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "File: {} ({}, {})", self.file, self.encoding, self.content_hash)?;
        writeln!(f, "Family: {}{}", self.family, if self.dry_run { " (dry run)" } else { "" })?;
        writeln!(f, "Rows read: {}", self.rows_read)?;
        writeln!(
            f,
            "{} applied ({} inserted, {} updated), {} skipped, {} unresolved",
            self.applied(),
            self.inserted,
            self.updated,
            self.skipped,
            self.unresolved
        )?;
        if self.repeated_keys > 0 {
            writeln!(f, "Repeated keys in file: {} (last value kept)", self.repeated_keys)?;
        }
        writeln!(f, "Batches committed: {}", self.batches_committed)?;

        if !self.unresolved_names.is_empty() {
            writeln!(f, "Unresolved countries:")?;
            for name in &self.unresolved_names {
                writeln!(f, "  - {}", name)?;
            }
        }
        if !self.flagged_states.is_empty() {
            writeln!(f, "Unmapped state geocodes (loaded as-is):")?;
            for state in &self.flagged_states {
                writeln!(f, "  - {}", if state.is_empty() { "(empty)" } else { state.as_str() })?;
            }
        }
        if !self.parse_errors.is_empty() {
            writeln!(f, "Parse errors (first {}):", self.parse_errors.len())?;
            for err in &self.parse_errors {
                writeln!(f, "  - {}", err)?;
            }
        }
        if !self.sample.is_empty() {
            writeln!(f, "Sample:")?;
            for (i, r) in self.sample.iter().enumerate() {
                writeln!(
                    f,
                    "  [{}] {} | {} | {} | {} | {} | {}",
                    i + 1,
                    r.country,
                    if r.state.is_empty() { "-" } else { r.state.as_str() },
                    r.period,
                    r.label,
                    r.analysis,
                    r.value
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_text() {
        let mut summary = RunSummary {
            file: "gee.csv".to_string(),
            family: "gee-ocde".to_string(),
            inserted: 3,
            updated: 1,
            unresolved: 1,
            ..Default::default()
        };
        summary.unresolved_names.insert("Atlantis".to_string());

        let text = summary.to_string();
        assert!(text.contains("4 applied (3 inserted, 1 updated), 0 skipped, 1 unresolved"));
        assert!(text.contains("  - Atlantis"));
        assert!(!text.contains("Repeated keys"));
    }

    #[test]
    fn test_parse_error_sample_is_bounded() {
        let mut summary = RunSummary::default();
        for line in 0..(PARSE_ERROR_SAMPLE + 3) {
            summary.record_parse_error(&ParseError {
                line,
                field: "value",
                value: "x".to_string(),
                reason: "invalid float literal".to_string(),
            });
        }
        assert_eq!(summary.skipped, PARSE_ERROR_SAMPLE + 3);
        assert_eq!(summary.parse_errors.len(), PARSE_ERROR_SAMPLE);
    }

    #[test]
    fn test_summary_serializes() {
        let summary = RunSummary {
            inserted: 2,
            ..Default::default()
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["inserted"], 2);
        assert_eq!(json["unresolved_names"], serde_json::json!([]));
    }
}
