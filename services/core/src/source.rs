//! Indicator CSV files
//!
//! Every file carries one header row, then positional fields whose order
//! depends on the indicator family. Rows that cannot be coerced are returned
//! as `ParseError`s; the caller skips them and keeps going.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::ParseError;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Where a family takes the country locator from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountryColumn {
    Column(usize),
    Fixed(&'static str),
}

/// Positional layout of one indicator family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub columns: usize,
    pub country: CountryColumn,
    pub state: Option<usize>,
    pub date: usize,
    pub label: usize,
    pub value: usize,
    pub source: &'static str,
    pub analysis: &'static str,
    /// Values are stored truncated toward zero
    pub integer_values: bool,
}

/// Indicator families with a known file layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Family {
    GeeOcde,
    AreaAgricolaOcde,
    GeeAgropecuaria,
    AmoniaAgro,
    NpkDeposicao,
    NpkProducao,
}

impl Family {
    pub const ALL: [Family; 6] = [
        Family::GeeOcde,
        Family::AreaAgricolaOcde,
        Family::GeeAgropecuaria,
        Family::AmoniaAgro,
        Family::NpkDeposicao,
        Family::NpkProducao,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::GeeOcde => "gee-ocde",
            Family::AreaAgricolaOcde => "area-agricola-ocde",
            Family::GeeAgropecuaria => "gee-agropecuaria",
            Family::AmoniaAgro => "amonia-agro",
            Family::NpkDeposicao => "npk-deposicao",
            Family::NpkProducao => "npk-producao",
        }
    }

    pub fn layout(&self) -> Layout {
        match self {
            // country, date, label, value
            Family::GeeOcde => Layout {
                columns: 4,
                country: CountryColumn::Column(0),
                state: None,
                date: 1,
                label: 2,
                value: 3,
                source: "OCDE",
                analysis: "GEE",
                integer_values: false,
            },
            Family::AreaAgricolaOcde => Layout {
                analysis: "Área Agrícola",
                ..Family::GeeOcde.layout()
            },
            // country id, state, date, label, value
            Family::GeeAgropecuaria => Layout {
                columns: 5,
                country: CountryColumn::Column(0),
                state: Some(1),
                date: 2,
                label: 3,
                value: 4,
                source: "Fonte desconhecida",
                analysis: "GEE",
                integer_values: false,
            },
            // id, state, date, label, value
            Family::AmoniaAgro => Layout {
                country: CountryColumn::Fixed("BR"),
                source: "ISAgro",
                analysis: "NH3",
                ..Family::GeeAgropecuaria.layout()
            },
            // state, date, label, nutrient, value
            Family::NpkDeposicao => Layout {
                columns: 5,
                country: CountryColumn::Fixed("BR"),
                state: Some(0),
                date: 1,
                label: 2,
                value: 4,
                source: "ISAgro",
                analysis: "NPK",
                integer_values: false,
            },
            Family::NpkProducao => Layout {
                source: "Fonte desconhecida",
                integer_values: true,
                ..Family::NpkDeposicao.layout()
            },
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown indicator family '{0}' (expected one of: gee-ocde, area-agricola-ocde, gee-agropecuaria, amonia-agro, npk-deposicao, npk-producao)")]
pub struct UnknownFamily(pub String);

impl FromStr for Family {
    type Err = UnknownFamily;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('_', "-");
        Family::ALL
            .into_iter()
            .find(|family| family.as_str() == wanted)
            .ok_or_else(|| UnknownFamily(s.to_string()))
    }
}

/// A parsed row before normalization. Locators are still raw.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub line: usize,
    pub country: String,
    pub state: String,
    pub period: NaiveDate,
    pub label: String,
    pub value: f64,
}

/// Decodes file bytes: UTF-8 (BOM stripped) or, failing that, Windows-1252.
pub fn decode(bytes: &[u8]) -> (Cow<'_, str>, &'static str) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (
            Cow::Borrowed(text.strip_prefix('\u{feff}').unwrap_or(text)),
            "UTF-8",
        ),
        Err(_) => {
            let (text, encoding, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            (text, encoding.name())
        }
    }
}

/// `sha256:<hex>` digest of the raw file.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// Parses every data row of `content` with `layout`.
///
/// The header row is always skipped. One result per data row, in file order.
pub fn read_observations(
    content: &str,
    layout: &Layout,
    delimiter: u8,
) -> Vec<Result<Observation, ParseError>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut rows = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let fallback_line = idx + 2; // +1 for 0-index, +1 for header
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                let line = e
                    .position()
                    .map(|p| p.line() as usize)
                    .unwrap_or(fallback_line);
                rows.push(Err(ParseError {
                    line,
                    field: "record",
                    value: String::new(),
                    reason: e.to_string(),
                }));
                continue;
            }
        };
        let line = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(fallback_line);

        rows.push(parse_record(&record, layout, line));
    }
    rows
}

fn parse_record(
    record: &csv::StringRecord,
    layout: &Layout,
    line: usize,
) -> Result<Observation, ParseError> {
    if record.len() != layout.columns {
        return Err(ParseError {
            line,
            field: "record",
            value: record.iter().collect::<Vec<_>>().join(","),
            reason: format!("expected {} fields, found {}", layout.columns, record.len()),
        });
    }

    let field = |idx: usize| record.get(idx).unwrap_or("").to_string();

    let country = match layout.country {
        CountryColumn::Column(idx) => field(idx),
        CountryColumn::Fixed(code) => code.to_string(),
    };
    let state = layout.state.map(field).unwrap_or_default();

    let raw_date = field(layout.date);
    let period = NaiveDate::parse_from_str(&raw_date, DATE_FORMAT).map_err(|e| ParseError {
        line,
        field: "date",
        value: raw_date.clone(),
        reason: e.to_string(),
    })?;

    let raw_value = field(layout.value);
    let value = parse_value(&raw_value, layout.integer_values).map_err(|reason| ParseError {
        line,
        field: "value",
        value: raw_value.clone(),
        reason,
    })?;

    Ok(Observation {
        line,
        country,
        state,
        period,
        label: field(layout.label),
        value,
    })
}

fn parse_value(raw: &str, integer: bool) -> Result<f64, String> {
    let value: f64 = raw.parse().map_err(|e: std::num::ParseFloatError| e.to_string())?;
    if !value.is_finite() {
        return Err("value is not a finite number".to_string());
    }
    Ok(if integer { value.trunc() } else { value })
}
