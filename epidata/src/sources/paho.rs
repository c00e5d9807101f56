//! PAHO subnational cases and deaths, from the ArcGIS open data export.
//!
//! The export is merged into a long store keyed by `(iso3_code, adm1_isocode, date)`, from which
//! one timeline per metric is written with a column per subdivision.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use nonempty::nonempty;
use polars::prelude::*;

use crate::column_names::paho as raw;
use crate::formatters::{OutputFormatter, OutputGenerator, TimelineFormatter};
use crate::sources::read_csv_text;
use crate::store::{ColumnSpec, MergeOutcome, MergeStore, StoreSchema};
use crate::transform::{
    Aggregate, Aggregation, Distinct, FilterSuffix, Keep, ParseDate, Pipeline, Rename, Select,
};
use crate::{Epidata, COL};

pub const URL: &str = "https://opendata.arcgis.com/datasets/e88c0055ac1d4176ac25d2f068500749_0.csv";
pub const STORE_DIR: &str = "paho";
pub const STORE_FILE: &str = "paho.subnational.csv";

/// Timeline file written for each metric column.
pub const TIMELINES: [(&str, &str); 2] = [
    (COL::TOTAL_CASES, "confirmed.timeline.csv"),
    (COL::TOTAL_DEATHS, "deaths.timeline.csv"),
];

pub fn pipeline() -> Pipeline {
    let metrics = vec![raw::TOTAL_CASES.to_string(), raw::TOTAL_DEATHS.to_string()];
    Pipeline::new("paho")
        .then(Distinct {
            subset: vec![raw::OBJECTID.into()],
            keep: Keep::First,
        })
        .then(ParseDate {
            column: raw::DATA_DATE.into(),
            format: "%Y/%m/%d".into(),
            exact: false,
        })
        .then(Select {
            columns: [raw::ISO3_CODE, raw::ADM1_ISOCODE, raw::DATA_DATE]
                .into_iter()
                .map(String::from)
                .chain(metrics.iter().cloned())
                .collect(),
        })
        // national aggregates are reported as `<country>-999`
        .then(FilterSuffix {
            column: raw::ADM1_ISOCODE.into(),
            suffix: "999".into(),
        })
        .then(Aggregate {
            by: vec![
                raw::ISO3_CODE.into(),
                raw::ADM1_ISOCODE.into(),
                raw::DATA_DATE.into(),
            ],
            values: metrics,
            agg: Aggregation::Mean,
        })
        .then(Rename::new(raw::ISO3_CODE, COL::ISO3_CODE))
        .then(Rename::new(raw::ADM1_ISOCODE, COL::ADM1_ISOCODE))
        .then(Rename::new(raw::DATA_DATE, COL::DATE))
        .then(Rename::new(raw::TOTAL_CASES, COL::TOTAL_CASES))
        .then(Rename::new(raw::TOTAL_DEATHS, COL::TOTAL_DEATHS))
}

pub fn schema() -> Result<StoreSchema> {
    Ok(StoreSchema::new(
        vec![
            ColumnSpec::text(COL::ISO3_CODE),
            ColumnSpec::text(COL::ADM1_ISOCODE),
            ColumnSpec::date(COL::DATE),
            ColumnSpec::int(COL::TOTAL_CASES),
            ColumnSpec::int(COL::TOTAL_DEATHS),
        ],
        nonempty![
            COL::ISO3_CODE.to_string(),
            COL::ADM1_ISOCODE.to_string(),
            COL::DATE.to_string()
        ],
    )?)
}

pub fn store(data_dir: &Path) -> Result<MergeStore> {
    Ok(MergeStore::new(
        data_dir.join(STORE_DIR).join(STORE_FILE),
        schema()?,
    ))
}

/// Daily subdivision rows from a raw export.
pub fn process(body: Vec<u8>) -> Result<DataFrame> {
    let raw = read_csv_text(body, b',')?;
    pipeline()
        .run(raw)
        .context("Unexpected layout of the PAHO export")
}

/// Write one timeline per metric from the long store, returning the files written.
pub fn write_timelines(df: &DataFrame, dir: &Path) -> Result<Vec<PathBuf>> {
    TIMELINES
        .iter()
        .map(|(metric, file_name)| {
            let path = dir.join(file_name);
            let formatter: OutputFormatter =
                TimelineFormatter::new(COL::DATE, [COL::ISO3_CODE, COL::ADM1_ISOCODE], metric)
                    .with_labels([raw::ISO3_CODE, raw::ADM1_ISOCODE])
                    .into();
            formatter.save_file(&path, &mut df.clone())?;
            info!("Wrote {:?}", path);
            Ok(path)
        })
        .collect()
}

pub async fn update(epidata: &Epidata) -> Result<MergeOutcome> {
    let body = epidata.fetcher.get_bytes(URL).await?;
    let new = process(body)?;
    let store = store(&epidata.config.data_dir)?;
    let outcome = store.update(new)?;
    if let MergeOutcome::Written { .. } = outcome {
        if let Some(merged) = store.load()? {
            write_timelines(&merged, &epidata.config.data_dir.join(STORE_DIR))?;
        }
    }
    Ok(outcome)
}
