//! File -> tb_chart pipeline: parse, normalize, reconcile in batches.

use tracing::{info, warn};

use crate::config::DEFAULT_BATCH_SIZE;
use crate::error::IngestError;
use crate::model::ChartRecord;
use crate::normalize::{is_unresolved_state, Normalizer};
use crate::reconcile::Reconciler;
use crate::report::{RunSummary, SAMPLE_SIZE};
use crate::source::{content_hash, decode, read_observations, Family};
use crate::store::ChartStore;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub family: Family,
    /// Replaces the family's default provenance label
    pub source: Option<String>,
    /// Replaces the family's default analysis code
    pub analysis: Option<String>,
    pub delimiter: u8,
    pub batch_size: usize,
    pub dry_run: bool,
}

impl IngestOptions {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            source: None,
            analysis: None,
            delimiter: b',',
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
        }
    }
}

/// Records ready for reconciliation plus the per-row bookkeeping so far.
#[derive(Debug, Clone, Default)]
pub struct Prepared {
    pub records: Vec<ChartRecord>,
    pub summary: RunSummary,
}

/// Parses and normalizes `content`. Never fails: bad rows are counted.
pub fn prepare(content: &str, normalizer: &Normalizer, options: &IngestOptions) -> Prepared {
    let layout = options.family.layout();
    let source = options.source.as_deref().unwrap_or(layout.source);
    let analysis = options.analysis.as_deref().unwrap_or(layout.analysis);

    let mut prepared = Prepared::default();
    prepared.summary.family = options.family.to_string();
    prepared.summary.dry_run = options.dry_run;

    for row in read_observations(content, &layout, options.delimiter) {
        let summary = &mut prepared.summary;
        summary.rows_read += 1;

        let observation = match row {
            Ok(o) => o,
            Err(e) => {
                warn!(line = e.line, error = %e, "skipping row");
                summary.record_parse_error(&e);
                continue;
            }
        };

        let country = match normalizer.countries.resolve_code(&observation.country) {
            Ok(code) => code,
            Err(e) => {
                warn!(line = observation.line, error = %e, "skipping row with unresolved country");
                summary.unresolved += 1;
                summary.unresolved_names.insert(e.name().to_string());
                continue;
            }
        };

        let state = normalizer.normalize_state(&observation.state);
        if layout.state.is_some() && is_unresolved_state(&country, &state) {
            summary.flagged_states.insert(state.clone());
        }

        prepared.records.push(ChartRecord {
            country,
            state,
            city: String::new(),
            source: source.to_string(),
            period: observation.period,
            label: observation.label,
            value: observation.value,
            analysis: analysis.to_string(),
            external_id: None,
        });
    }

    prepared
}

/// Loads one file's bytes into `store`.
///
/// Parse and reference failures are counted in the summary. A storage
/// failure aborts with the committed progress in the error.
pub async fn ingest<S: ChartStore>(
    store: &mut S,
    normalizer: &Normalizer,
    file: &str,
    bytes: &[u8],
    options: &IngestOptions,
) -> Result<RunSummary, IngestError> {
    let (content, encoding) = decode(bytes);
    let Prepared {
        records,
        mut summary,
    } = prepare(&content, normalizer, options);

    summary.file = file.to_string();
    summary.content_hash = content_hash(bytes);
    summary.encoding = encoding.to_string();

    info!(
        file,
        family = %options.family,
        rows = summary.rows_read,
        records = records.len(),
        skipped = summary.skipped,
        unresolved = summary.unresolved,
        "file prepared"
    );

    let mut reconciler = Reconciler::new(&mut *store);
    reconciler.apply_batches(&records, options.batch_size).await?;

    let stats = reconciler.stats();
    summary.inserted = stats.inserted;
    summary.updated = stats.updated;
    summary.repeated_keys = stats.repeated_keys;
    summary.batches_committed = stats.committed_batches;
    summary.sample = records.iter().take(SAMPLE_SIZE).cloned().collect();

    info!(
        inserted = summary.inserted,
        updated = summary.updated,
        batches = summary.batches_committed,
        "file loaded"
    );
    Ok(summary)
}
