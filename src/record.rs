//! Input and output record shapes plus aggregate enrichment statistics.

use serde::{Deserialize, Serialize};

/// Unenriched input row. Never mutated by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Stable row identifier.
    pub id: String,
    /// Wallet address used to build lookup requests.
    pub address: String,
    /// Display name already known for the wallet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Avatar URL from a previous enrichment, used as the fallback value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Transaction count from a previous enrichment, used as the fallback value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_count: Option<u64>,
}

impl WorkItem {
    /// Builds an item with only the identifying fields set.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            display_name: None,
            avatar_url: None,
            activity_count: None,
        }
    }
}

/// Where an enrichment field value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    /// The upstream lookup answered. A fetched zero is a real zero.
    Fetched,
    /// The lookup failed and the item's prior value was kept.
    Fallback,
    /// The lookup failed and no prior value existed.
    Missing,
}

/// One enrichment field: its value (if any) and its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field<T> {
    /// Resolved value.
    pub value: Option<T>,
    /// Provenance of `value`.
    pub source: FieldSource,
}

impl<T> Field<T> {
    /// Value returned by the upstream service.
    pub fn fetched(value: T) -> Self {
        Self {
            value: Some(value),
            source: FieldSource::Fetched,
        }
    }

    /// Degraded value after a failed lookup.
    pub fn fallback(prior: Option<T>) -> Self {
        let source = if prior.is_some() {
            FieldSource::Fallback
        } else {
            FieldSource::Missing
        };
        Self {
            value: prior,
            source,
        }
    }

    /// Whether the upstream service supplied this value.
    pub fn is_fetched(&self) -> bool {
        self.source == FieldSource::Fetched
    }
}

/// Output row: the untouched input plus every enrichment field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    /// Original input row.
    #[serde(flatten)]
    pub item: WorkItem,
    /// Profile avatar lookup result.
    pub avatar: Field<String>,
    /// Transaction-count lookup result.
    pub activity: Field<u64>,
}

impl EnrichedRecord {
    /// Record with every field degraded to the item's prior values.
    pub fn fallback(item: &WorkItem) -> Self {
        Self {
            avatar: Field::fallback(item.avatar_url.clone()),
            activity: Field::fallback(item.activity_count),
            item: item.clone(),
        }
    }
}

/// Per-field counters accumulated over a set of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FieldCounts {
    /// Values supplied by the upstream service.
    pub fetched: usize,
    /// Prior values kept after a failed lookup.
    pub fallback: usize,
    /// Failed lookups without a prior value.
    pub missing: usize,
}

impl FieldCounts {
    fn record(&mut self, source: FieldSource) {
        match source {
            FieldSource::Fetched => self.fetched += 1,
            FieldSource::Fallback => self.fallback += 1,
            FieldSource::Missing => self.missing += 1,
        }
    }

    fn merge(&mut self, other: &FieldCounts) {
        self.fetched += other.fetched;
        self.fallback += other.fallback;
        self.missing += other.missing;
    }

    /// Records whose field carries any value.
    pub fn populated(&self) -> usize {
        self.fetched + self.fallback
    }
}

/// Aggregate statistics reported after a run or merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentStats {
    /// Records accounted for.
    pub total: usize,
    /// Avatar field provenance.
    pub avatar: FieldCounts,
    /// Activity field provenance.
    pub activity: FieldCounts,
    /// Sum of every populated activity count.
    pub activity_sum: u64,
}

impl EnrichmentStats {
    /// Computes statistics over a slice of records.
    pub fn from_records(records: &[EnrichedRecord]) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.absorb(record);
        }
        stats
    }

    /// Adds one record to the counters.
    pub fn absorb(&mut self, record: &EnrichedRecord) {
        self.total += 1;
        self.avatar.record(record.avatar.source);
        self.activity.record(record.activity.source);
        if let Some(count) = record.activity.value {
            self.activity_sum = self.activity_sum.saturating_add(count);
        }
    }

    /// Folds another set of counters into this one.
    pub fn merge(&mut self, other: &EnrichmentStats) {
        self.total += other.total;
        self.avatar.merge(&other.avatar);
        self.activity.merge(&other.activity);
        self.activity_sum = self.activity_sum.saturating_add(other.activity_sum);
    }

    /// Mean activity count over records that carry one.
    pub fn activity_average(&self) -> Option<f64> {
        let populated = self.activity.populated();
        (populated > 0).then(|| self.activity_sum as f64 / populated as f64)
    }

    /// Prints the summary block to stdout.
    pub fn report(&self, label: &str) {
        println!("--- enrichment stats ({label}) ---");
        println!("records: {}", self.total);
        println!(
            "avatars: {} fetched, {} fallback, {} missing",
            self.avatar.fetched, self.avatar.fallback, self.avatar.missing
        );
        println!(
            "activity: {} fetched, {} fallback, {} missing",
            self.activity.fetched, self.activity.fallback, self.activity.missing
        );
        match self.activity_average() {
            Some(avg) => println!("activity sum: {} (avg {avg:.2})", self.activity_sum),
            None => println!("activity sum: 0 (no values)"),
        }
    }
}
