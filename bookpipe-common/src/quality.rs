//! Silver-layer quality gates
//!
//! A gate computes a small set of metrics over a table and turns them into a
//! pass/fail verdict. Pipeline control flow only looks at the verdict; the
//! metrics are written out for operators.
//!
//! Two gates exist:
//! - **Item gate**: runs on the cleaned Item Records before enrichment.
//!   Hard rules are non-blank `key` and `title`; the gate fails on too few
//!   rows surviving the hard rules or on any duplicated key.
//! - **Text gate**: runs on the Joined Dataset after enrichment and checks
//!   row count and (optionally) description coverage.

use crate::table::{ItemRecord, ItemRow, JoinedRow};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Why a gate failed
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum GateFailure {
    #[error("only {rows} rows after hard rules, need at least {min_rows}")]
    TooFewRows { rows: usize, min_rows: usize },

    #[error("{groups} keys appear more than once")]
    DuplicateKeys { groups: usize },

    #[error("{pct_missing:.3} of descriptions are missing, limit is {max_pct_missing:.3}")]
    DescriptionCoverage {
        pct_missing: f64,
        max_pct_missing: f64,
    },
}

/// Item gate thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemGateConfig {
    /// Minimum rows that must survive the hard rules
    pub min_rows: usize,
    /// Years outside `[min_year, max_year]` are counted as invalid (soft rule)
    pub min_year: i64,
    pub max_year: i64,
}

impl Default for ItemGateConfig {
    fn default() -> Self {
        Self {
            min_rows: 1000,
            min_year: 1400,
            max_year: 2027,
        }
    }
}

/// Metrics produced by the item gate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetrics {
    pub rows_input: usize,
    pub rows_after_hard_rules: usize,
    pub null_key: usize,
    pub null_title: usize,
    pub null_author: usize,
    pub duplicate_key_groups: usize,
    pub invalid_year_count: usize,
}

/// Item gate verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemGateReport {
    pub metrics: ItemMetrics,
    pub failures: Vec<GateFailure>,
}

impl ItemGateReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// Run the item gate over silver rows
pub fn check_items(rows: &[ItemRow], config: &ItemGateConfig) -> ItemGateReport {
    let mut metrics = ItemMetrics {
        rows_input: rows.len(),
        ..Default::default()
    };

    let mut key_counts: HashMap<&str, usize> = HashMap::new();
    for row in rows {
        if is_blank(&row.key) {
            metrics.null_key += 1;
        }
        if is_blank(&row.title) {
            metrics.null_title += 1;
        }
        if row.author.is_none() {
            metrics.null_author += 1;
        }
        if let Some(key) = row.key.as_deref() {
            *key_counts.entry(key).or_default() += 1;
        }
    }
    metrics.duplicate_key_groups = key_counts.values().filter(|&&c| c > 1).count();

    let validated = rows
        .iter()
        .filter(|r| !is_blank(&r.key) && !is_blank(&r.title));
    for row in validated {
        metrics.rows_after_hard_rules += 1;
        if let Some(year) = row.first_publish_year {
            if year < config.min_year || year > config.max_year {
                metrics.invalid_year_count += 1;
            }
        }
    }

    let mut failures = Vec::new();
    if metrics.rows_after_hard_rules < config.min_rows {
        failures.push(GateFailure::TooFewRows {
            rows: metrics.rows_after_hard_rules,
            min_rows: config.min_rows,
        });
    }
    if metrics.duplicate_key_groups > 0 {
        failures.push(GateFailure::DuplicateKeys {
            groups: metrics.duplicate_key_groups,
        });
    }

    ItemGateReport { metrics, failures }
}

/// Rows that satisfy the hard rules, as validated Item Records
pub fn apply_hard_rules(rows: &[ItemRow]) -> Vec<ItemRecord> {
    rows.iter()
        .filter(|r| !is_blank(&r.title))
        .cloned()
        .filter_map(|r| ItemRecord::try_from(r).ok())
        .collect()
}

/// Text gate thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextGateConfig {
    pub min_rows: usize,
    /// Descriptions shorter than this count as "short"
    pub min_description_len: usize,
    /// Fail when the missing-description fraction exceeds this (None = report only)
    pub max_pct_missing: Option<f64>,
}

impl Default for TextGateConfig {
    fn default() -> Self {
        Self {
            min_rows: 10,
            min_description_len: 30,
            max_pct_missing: None,
        }
    }
}

/// Metrics produced by the text gate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextMetrics {
    pub rows: usize,
    pub pct_missing_description: f64,
    pub pct_short_description: f64,
}

/// Text gate verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextGateReport {
    pub metrics: TextMetrics,
    pub failures: Vec<GateFailure>,
}

impl TextGateReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run the text gate over a Joined Dataset
pub fn check_descriptions(rows: &[JoinedRow], config: &TextGateConfig) -> TextGateReport {
    let total = rows.len();
    let missing = rows
        .iter()
        .filter(|r| r.description.trim().is_empty())
        .count();
    // Missing descriptions are also short
    let short = rows
        .iter()
        .filter(|r| r.description.trim().chars().count() < config.min_description_len)
        .count();

    let fraction = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };
    let metrics = TextMetrics {
        rows: total,
        pct_missing_description: fraction(missing),
        pct_short_description: fraction(short),
    };

    let mut failures = Vec::new();
    if total < config.min_rows {
        failures.push(GateFailure::TooFewRows {
            rows: total,
            min_rows: config.min_rows,
        });
    }
    if let Some(max) = config.max_pct_missing {
        if metrics.pct_missing_description > max {
            failures.push(GateFailure::DescriptionCoverage {
                pct_missing: metrics.pct_missing_description,
                max_pct_missing: max,
            });
        }
    }

    TextGateReport { metrics, failures }
}

/// Write a gate report as pretty JSON
pub fn write_report<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| Error::InvalidInput(format!("report serialisation failed: {}", e)))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, json)?;
    Ok(())
}
