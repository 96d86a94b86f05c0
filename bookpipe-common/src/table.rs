//! Item Record and Joined Dataset tables
//!
//! Both tables travel between pipeline stages as Parquet files. Readers are
//! lenient about physical types (any string or integer encoding is cast to
//! the logical type); writers always emit the same schema so downstream
//! stages and repeated runs see identical files.

use crate::{Error, Result};
use arrow::array::{ArrayRef, AsArray, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Int64Type, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One silver-layer row as read from disk, before the key precondition is checked
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemRow {
    pub key: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub first_publish_year: Option<i64>,
    pub language: Option<String>,
}

/// One book's metadata, keyed by its catalog key (e.g. `/works/OL45804W`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub key: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub first_publish_year: Option<i64>,
    pub language: Option<String>,
}

impl ItemRecord {
    /// Record with only a key set
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: None,
            author: None,
            first_publish_year: None,
            language: None,
        }
    }
}

impl TryFrom<ItemRow> for ItemRecord {
    type Error = Error;

    fn try_from(row: ItemRow) -> Result<Self> {
        let key = row
            .key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::InvalidInput("item row has a null or blank key".to_string()))?;
        Ok(Self {
            key,
            title: row.title,
            author: row.author,
            first_publish_year: row.first_publish_year,
            language: row.language,
        })
    }
}

impl From<ItemRecord> for ItemRow {
    fn from(record: ItemRecord) -> Self {
        Self {
            key: Some(record.key),
            title: record.title,
            author: record.author,
            first_publish_year: record.first_publish_year,
            language: record.language,
        }
    }
}

/// One row of the Joined Dataset
///
/// `description` is never null: missing text is the empty string.
/// `fetch_status` is null only for keys that were never attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedRow {
    pub key: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub first_publish_year: Option<i64>,
    pub language: Option<String>,
    pub description: String,
    pub fetch_status: Option<String>,
}

fn item_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, true),
        Field::new("author", DataType::Utf8, true),
        Field::new("first_publish_year", DataType::Int64, true),
        Field::new("language", DataType::Utf8, true),
    ]))
}

fn joined_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, true),
        Field::new("author", DataType::Utf8, true),
        Field::new("first_publish_year", DataType::Int64, true),
        Field::new("language", DataType::Utf8, true),
        Field::new("description", DataType::Utf8, false),
        Field::new("fetch_status", DataType::Utf8, true),
    ]))
}

// ============================================================================
// Readers
// ============================================================================

/// Read silver rows without enforcing the key precondition (quality gate input)
pub fn read_item_rows(path: &Path) -> Result<Vec<ItemRow>> {
    let mut rows = Vec::new();
    for batch in read_batches(path)? {
        let keys = required_strings(&batch, "key", path)?;
        let titles = optional_strings(&batch, "title")?;
        let authors = optional_strings(&batch, "author")?;
        let years = optional_ints(&batch, "first_publish_year")?;
        let languages = optional_strings(&batch, "language")?;

        for (i, key) in keys.into_iter().enumerate() {
            rows.push(ItemRow {
                key,
                title: titles[i].clone(),
                author: authors[i].clone(),
                first_publish_year: years[i],
                language: languages[i].clone(),
            });
        }
    }
    Ok(rows)
}

/// Read Item Records; a null or blank key is an error
pub fn read_items(path: &Path) -> Result<Vec<ItemRecord>> {
    read_item_rows(path)?
        .into_iter()
        .enumerate()
        .map(|(i, row)| {
            ItemRecord::try_from(row).map_err(|_| {
                Error::InvalidInput(format!(
                    "{}: row {} has a null or blank key",
                    path.display(),
                    i
                ))
            })
        })
        .collect()
}

/// Read a Joined Dataset back (quality gate and tests)
pub fn read_joined(path: &Path) -> Result<Vec<JoinedRow>> {
    let mut rows = Vec::new();
    for batch in read_batches(path)? {
        let keys = required_strings(&batch, "key", path)?;
        let descriptions = required_strings(&batch, "description", path)?;
        let titles = optional_strings(&batch, "title")?;
        let authors = optional_strings(&batch, "author")?;
        let years = optional_ints(&batch, "first_publish_year")?;
        let languages = optional_strings(&batch, "language")?;
        let statuses = optional_strings(&batch, "fetch_status")?;

        for (i, key) in keys.into_iter().enumerate() {
            let key = key.ok_or_else(|| {
                Error::Schema(format!("{}: null key at row {}", path.display(), i))
            })?;
            rows.push(JoinedRow {
                key,
                title: titles[i].clone(),
                author: authors[i].clone(),
                first_publish_year: years[i],
                language: languages[i].clone(),
                description: descriptions[i].clone().unwrap_or_default(),
                fetch_status: statuses[i].clone(),
            });
        }
    }
    Ok(rows)
}

fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    reader
        .map(|batch| batch.map_err(Error::from))
        .collect()
}

fn required_strings(batch: &RecordBatch, name: &str, path: &Path) -> Result<Vec<Option<String>>> {
    match batch.column_by_name(name) {
        Some(column) => strings(column),
        None => Err(Error::Schema(format!(
            "{}: missing required column '{}'",
            path.display(),
            name
        ))),
    }
}

fn optional_strings(batch: &RecordBatch, name: &str) -> Result<Vec<Option<String>>> {
    match batch.column_by_name(name) {
        Some(column) => strings(column),
        None => Ok(vec![None; batch.num_rows()]),
    }
}

fn optional_ints(batch: &RecordBatch, name: &str) -> Result<Vec<Option<i64>>> {
    match batch.column_by_name(name) {
        Some(column) => {
            let casted = cast(column, &DataType::Int64)?;
            Ok(casted.as_primitive::<Int64Type>().iter().collect())
        }
        None => Ok(vec![None; batch.num_rows()]),
    }
}

fn strings(column: &ArrayRef) -> Result<Vec<Option<String>>> {
    let casted = cast(column, &DataType::Utf8)?;
    Ok(casted
        .as_string::<i32>()
        .iter()
        .map(|v| v.map(str::to_string))
        .collect())
}

// ============================================================================
// Writers
// ============================================================================

/// Write Item Records with the canonical item schema
pub fn write_items(path: &Path, items: &[ItemRecord]) -> Result<()> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(items.iter().map(|i| i.key.as_str()))),
        Arc::new(StringArray::from_iter(items.iter().map(|i| i.title.as_deref()))),
        Arc::new(StringArray::from_iter(items.iter().map(|i| i.author.as_deref()))),
        Arc::new(Int64Array::from_iter(items.iter().map(|i| i.first_publish_year))),
        Arc::new(StringArray::from_iter(items.iter().map(|i| i.language.as_deref()))),
    ];
    let batch = RecordBatch::try_new(item_schema(), columns)?;
    write_batch_atomic(path, &batch)
}

/// Write the Joined Dataset
///
/// The file is written beside `path` and renamed into place, so readers
/// never observe a half-written dataset.
pub fn write_joined(path: &Path, rows: &[JoinedRow]) -> Result<()> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.key.as_str()))),
        Arc::new(StringArray::from_iter(rows.iter().map(|r| r.title.as_deref()))),
        Arc::new(StringArray::from_iter(rows.iter().map(|r| r.author.as_deref()))),
        Arc::new(Int64Array::from_iter(rows.iter().map(|r| r.first_publish_year))),
        Arc::new(StringArray::from_iter(rows.iter().map(|r| r.language.as_deref()))),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.description.as_str()))),
        Arc::new(StringArray::from_iter(rows.iter().map(|r| r.fetch_status.as_deref()))),
    ];
    let batch = RecordBatch::try_new(joined_schema(), columns)?;
    write_batch_atomic(path, &batch)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "table".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}

fn write_batch_atomic(path: &Path, batch: &RecordBatch) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = temp_path_for(path);
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let file = File::create(&tmp)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    let file = writer.into_inner()?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)?;
    tracing::debug!(path = %path.display(), rows = batch.num_rows(), "Table written");
    Ok(())
}
