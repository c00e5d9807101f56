use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Write};
use std::path::Path;

use anyhow::{anyhow, Result};
use enum_dispatch::enum_dispatch;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

/// Text values of a column, with nulls as empty strings.
fn text_values(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    let series = df.column(name)?.cast(&DataType::String)?;
    Ok(series
        .str()?
        .into_iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect())
}

/// Trait to define different output generators. Defines two
/// functions, format which generates a serialized string of the
/// `DataFrame` and save which writes it to any writer
#[enum_dispatch]
pub trait OutputGenerator {
    fn save(&self, writer: &mut impl Write, df: &mut DataFrame) -> Result<()>;
    fn format(&self, df: &mut DataFrame) -> Result<String> {
        let mut data: Vec<u8> = vec![];
        let mut buff = Cursor::new(&mut data);
        self.save(&mut buff, df)?;

        Ok(String::from_utf8(data)?)
    }
    fn save_file(&self, path: &Path, df: &mut DataFrame) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        self.save(&mut writer, df)?;
        writer.flush()?;
        Ok(())
    }
}

/// Enum of OutputFormatters one for each potential
/// output type
#[enum_dispatch(OutputGenerator)]
#[derive(Serialize, Deserialize, Debug)]
pub enum OutputFormatter {
    Csv(CsvFormatter),
    Timeline(TimelineFormatter),
}

/// Plain CSV with a single header row
#[derive(Serialize, Deserialize, Debug)]
pub struct CsvFormatter {
    pub include_header: bool,
}

impl Default for CsvFormatter {
    fn default() -> Self {
        Self {
            include_header: true,
        }
    }
}

impl OutputGenerator for CsvFormatter {
    fn save(&self, writer: &mut impl Write, df: &mut DataFrame) -> Result<()> {
        CsvWriter::new(writer)
            .include_header(self.include_header)
            .finish(df)?;
        Ok(())
    }
}

/// Pivot a long table into one row per `index` value and one column per pair of `levels`
/// values, written with two header rows. The first cell of each header row holds the level's
/// label, its column name unless `labels` is set. Missing cells are left empty.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimelineFormatter {
    pub index: String,
    pub levels: [String; 2],
    pub value: String,
    #[serde(default)]
    pub labels: Option<[String; 2]>,
}

impl TimelineFormatter {
    pub fn new(index: &str, levels: [&str; 2], value: &str) -> Self {
        Self {
            index: index.into(),
            levels: levels.map(String::from),
            value: value.into(),
            labels: None,
        }
    }

    pub fn with_labels(mut self, labels: [&str; 2]) -> Self {
        self.labels = Some(labels.map(String::from));
        self
    }
}

impl OutputGenerator for TimelineFormatter {
    fn save(&self, writer: &mut impl Write, df: &mut DataFrame) -> Result<()> {
        let index = text_values(df, &self.index)?;
        let upper = text_values(df, &self.levels[0])?;
        let lower = text_values(df, &self.levels[1])?;
        let values = text_values(df, &self.value)?;

        let mut columns = BTreeSet::new();
        let mut rows = BTreeSet::new();
        let mut cells = HashMap::new();
        for i in 0..df.height() {
            let column = (upper[i].as_str(), lower[i].as_str());
            columns.insert(column);
            rows.insert(index[i].as_str());
            if cells
                .insert((index[i].as_str(), column), values[i].as_str())
                .is_some()
            {
                return Err(anyhow!(
                    "Duplicate timeline cell for {} {:?}",
                    index[i],
                    column
                ));
            }
        }

        let mut out = csv::Writer::from_writer(writer);
        let header = |level: &str, pick: fn(&(&str, &str)) -> String| {
            std::iter::once(level.to_string())
                .chain(columns.iter().map(pick))
                .collect::<Vec<_>>()
        };
        let labels = self.labels.as_ref().unwrap_or(&self.levels);
        out.write_record(header(&labels[0], |c| c.0.to_string()))?;
        out.write_record(header(&labels[1], |c| c.1.to_string()))?;
        for row in &rows {
            let record = std::iter::once(*row).chain(
                columns
                    .iter()
                    .map(|column| cells.get(&(*row, *column)).copied().unwrap_or_default()),
            );
            out.write_record(record)?;
        }
        out.flush()?;
        Ok(())
    }
}
