//! Result merging for the enrichment stage
//!
//! Left join of Item Records with Enrichment Results on `key`.
//!
//! **Merge Strategy:**
//! - One output row per item, in item order
//! - `description` is the fetched text for `ok` results, `""` otherwise
//! - `fetch_status` is null for items that were never attempted
//! - Output row count must equal item row count, otherwise
//!   [`EnrichError::RowCountMismatch`]

use std::collections::HashMap;

use bookpipe_common::{ItemRecord, JoinedRow};

use crate::error::{EnrichError, Result};
use crate::models::EnrichmentResult;

/// Join `items` with `results`
///
/// `results` is taken as a plain sequence rather than a key map so that a
/// duplicated result for one key surfaces as a row-count failure instead of
/// being silently collapsed.
pub fn merge<'a, I>(items: &[ItemRecord], results: I) -> Result<Vec<JoinedRow>>
where
    I: IntoIterator<Item = &'a EnrichmentResult>,
{
    let mut by_key: HashMap<&str, Vec<&EnrichmentResult>> = HashMap::new();
    for result in results {
        by_key.entry(result.key.as_str()).or_default().push(result);
    }

    let mut joined = Vec::with_capacity(items.len());
    for item in items {
        match by_key.get(item.key.as_str()) {
            Some(matches) => {
                for result in matches {
                    joined.push(joined_row(item, Some(result)));
                }
            }
            None => joined.push(joined_row(item, None)),
        }
    }

    if joined.len() != items.len() {
        tracing::error!(
            items = items.len(),
            joined = joined.len(),
            "Join changed the row count"
        );
        return Err(EnrichError::RowCountMismatch {
            items: items.len(),
            joined: joined.len(),
        });
    }

    Ok(joined)
}

fn joined_row(item: &ItemRecord, result: Option<&EnrichmentResult>) -> JoinedRow {
    JoinedRow {
        key: item.key.clone(),
        title: item.title.clone(),
        author: item.author.clone(),
        first_publish_year: item.first_publish_year,
        language: item.language.clone(),
        description: result
            .map(|r| r.joined_description().to_string())
            .unwrap_or_default(),
        fetch_status: result.map(|r| r.fetch_status.as_str().to_string()),
    }
}
