//! Incremental merge store: a CSV file keyed by a composite key, rewritten in full on every
//! update with last-write-wins semantics.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use nonempty::NonEmpty;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{EpidataError, EpidataResult};

/// On-disk date format of every store.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Date,
    Int,
    Float,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, ColumnKind::Text)
    }

    pub fn date(name: &str) -> Self {
        Self::new(name, ColumnKind::Date)
    }

    pub fn int(name: &str) -> Self {
        Self::new(name, ColumnKind::Int)
    }

    fn conform(&self, series: &Series) -> Expr {
        let c = col(&self.name);
        match (self.kind, series.dtype()) {
            (ColumnKind::Date, DataType::String) => c.str().to_date(StrptimeOptions {
                format: Some(DATE_FORMAT.into()),
                strict: true,
                exact: true,
                cache: true,
            }),
            (ColumnKind::Date, _) => c.strict_cast(DataType::Date),
            (ColumnKind::Text, _) => c.cast(DataType::String),
            (ColumnKind::Int, _) => c.strict_cast(DataType::Int64),
            (ColumnKind::Float, _) => c.strict_cast(DataType::Float64),
        }
    }
}

/// Column order and types of a store, plus the columns that identify a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    columns: Vec<ColumnSpec>,
    key: NonEmpty<String>,
}

impl StoreSchema {
    pub fn new(columns: Vec<ColumnSpec>, key: NonEmpty<String>) -> EpidataResult<Self> {
        for k in key.iter() {
            if !columns.iter().any(|c| &c.name == k) {
                return Err(EpidataError::InvalidSchema(format!(
                    "key column '{k}' is not a store column"
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = columns.iter().find(|c| !seen.insert(c.name.as_str())) {
            return Err(EpidataError::InvalidSchema(format!(
                "column '{}' is declared twice",
                dup.name
            )));
        }
        Ok(Self { columns, key })
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn key(&self) -> &NonEmpty<String> {
        &self.key
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Select the schema columns in schema order with their declared types. Extra columns are
    /// dropped; a missing column is an error.
    pub fn conform(&self, df: DataFrame) -> PolarsResult<DataFrame> {
        let exprs = self
            .columns
            .iter()
            .map(|spec| Ok(spec.conform(df.column(&spec.name)?)))
            .collect::<PolarsResult<Vec<Expr>>>()?;
        df.lazy().select(exprs).collect()
    }
}

/// Union `existing` and `new`, keep the last row for each key and sort by the key.
///
/// `new` is placed after `existing`, so its rows win on collision. The result is the same
/// whether `new` has been merged once or many times.
pub fn merge_frames(
    existing: Option<DataFrame>,
    new: DataFrame,
    schema: &StoreSchema,
) -> PolarsResult<DataFrame> {
    let new = schema.conform(new)?.lazy();
    let combined = match existing {
        Some(existing) => concat(
            [schema.conform(existing)?.lazy(), new],
            UnionArgs::default(),
        )?,
        None => new,
    };
    let key: Vec<String> = schema.key.iter().cloned().collect();
    combined
        .unique_stable(Some(key.clone()), UniqueKeepStrategy::Last)
        .sort(key, SortMultipleOptions::default())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Nothing new to merge; the store was left untouched.
    Skipped,
    Written { rows: usize },
}

#[derive(Debug, Clone)]
pub struct MergeStore {
    path: PathBuf,
    schema: StoreSchema,
}

impl MergeStore {
    pub fn new(path: impl Into<PathBuf>, schema: StoreSchema) -> Self {
        Self {
            path: path.into(),
            schema,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    /// Read the store, or `None` on the first run.
    pub fn load(&self) -> EpidataResult<Option<DataFrame>> {
        if !self.path.exists() {
            debug!("No store at {:?} yet", self.path);
            return Ok(None);
        }
        let corrupt = |source| EpidataError::CorruptStore {
            path: self.path.clone(),
            source,
        };
        let raw = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(0))
            .try_into_reader_with_file_path(Some(self.path.clone()))
            .and_then(|reader| reader.finish())
            .map_err(corrupt)?;
        let df = self.schema.conform(raw).map_err(corrupt)?;
        Ok(Some(df))
    }

    /// Merge `new` into the store and rewrite it.
    pub fn update(&self, new: DataFrame) -> EpidataResult<MergeOutcome> {
        if new.height() == 0 {
            info!("No new rows for {:?}, leaving it untouched", self.path);
            return Ok(MergeOutcome::Skipped);
        }
        let existing = self.load()?;
        let before = existing.as_ref().map_or(0, DataFrame::height);
        let mut merged = merge_frames(existing, new, &self.schema)?;
        self.write(&mut merged)?;
        info!(
            "Wrote {} rows to {:?} ({} before)",
            merged.height(),
            self.path,
            before
        );
        Ok(MergeOutcome::Written {
            rows: merged.height(),
        })
    }

    /// Write to a sibling temporary file, then rename it over the store.
    fn write(&self, df: &mut DataFrame) -> EpidataResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        CsvWriter::new(tmp.as_file_mut())
            .include_header(true)
            .finish(df)?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}
