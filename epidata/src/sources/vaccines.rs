//! Vaccine deliveries published as PowerBI dashboards: PAHO's COVAX deliveries and UNICEF's
//! donations and supply deals. Each dataset is a snapshot, rewritten on every run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use polars::prelude::*;

use crate::formatters::{CsvFormatter, OutputGenerator};
use crate::powerbi::{Connection, PowerBiClient, Projection};
use crate::update::UpdateReport;
use crate::Epidata;

pub const STORE_DIR: &str = "paho";

pub const PAHO_PAGE_URL: &str = "https://www.paho.org/en/covax-americas";
pub const PAHO_QUERY_URL: &str =
    "https://wabi-south-central-us-api.analysis.windows.net/public/reports/querydata?synchronous=true";
pub const UNICEF_PAGE_URL: &str = "https://www.unicef.org/supply/covid-19-vaccine-market-dashboard";
pub const UNICEF_QUERY_URL: &str =
    "https://wabi-north-europe-api.analysis.windows.net/public/reports/querydata?synchronous=true";

/// How the date column of a dataset is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateEncoding {
    EpochMillis,
    Text,
}

/// One visual of a published report and how to tidy it.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: &'static str,
    pub file_name: &'static str,
    pub connection: Connection,
    pub table: &'static str,
    pub projections: &'static [Projection],
    pub date_column: &'static str,
    pub date_encoding: DateEncoding,
    pub int_columns: &'static [&'static str],
}

pub const COVAX_DELIVERY: Dataset = Dataset {
    name: "PAHO COVAX deliveries",
    file_name: "vaccines.covax.delivery.csv",
    connection: Connection {
        dataset_id: "0f759363-1b4d-483c-b9cc-3e52aacfea34",
        report_id: "ba763b1a-fa9a-4b96-a196-54365d0e4d1e",
        visual_id: "6c9da183a30da72e7144",
        model_id: 3867677,
    },
    table: "Purchase Orders",
    projections: &[
        Projection::column("Country"),
        Projection::column("Supplier"),
        Projection::column("Buyer"),
        Projection::column("New Arrival Date"),
        Projection::column("Hour Status"),
        Projection::sum("Quantity"),
    ],
    date_column: "New Arrival Date",
    date_encoding: DateEncoding::EpochMillis,
    int_columns: &["Quantity"],
};

const UNICEF_DATASET_ID: &str = "9cf2f5a8-f597-4503-ae92-4f4c24f06b80";
const UNICEF_REPORT_ID: &str = "3abfe7a3-785e-4e21-b219-9da3b818669c";
const UNICEF_MODEL_ID: u64 = 12516632;

pub const DONATIONS: Dataset = Dataset {
    name: "UNICEF donations",
    file_name: "vaccines.donations.csv",
    connection: Connection {
        dataset_id: UNICEF_DATASET_ID,
        report_id: UNICEF_REPORT_ID,
        visual_id: "b85e5d3003879b5ad1ca",
        model_id: UNICEF_MODEL_ID,
    },
    table: "mod Donation Deliveries View Table",
    projections: &[
        Projection::column("Recipient"),
        Projection::column("Recipient ISO"),
        Projection::column("Vaccine Name"),
        Projection::column("Manufacturer"),
        Projection::column("Source URL"),
        Projection::column("Vaccine Developer"),
        Projection::column("Donor"),
        Projection::column("Donor ISO"),
        Projection::column("Update Date"),
        Projection::column("Doses"),
    ],
    date_column: "Update Date",
    date_encoding: DateEncoding::EpochMillis,
    int_columns: &[],
};

pub const SUPPLY_DEALS: Dataset = Dataset {
    name: "UNICEF supply deals",
    file_name: "vaccines.supply.deals.csv",
    connection: Connection {
        dataset_id: UNICEF_DATASET_ID,
        report_id: UNICEF_REPORT_ID,
        visual_id: "c97d36445fe8819945d7",
        model_id: UNICEF_MODEL_ID,
    },
    table: "mod Supply Deals View Table",
    projections: &[
        Projection::column("Manufacturer"),
        Projection::column("Recipient"),
        Projection::column("ISO"),
        Projection::column("Source URL"),
        Projection::column("Deal Date"),
        Projection::column("Vaccine Name"),
        Projection::column("Committed $"),
        Projection::column("Secured Doses"),
        Projection::column("Optioned Doses"),
        Projection::column("Status"),
        Projection::column("Vaccine Developer"),
        Projection::column("Deal Type"),
        Projection::column("Distributor"),
    ],
    date_column: "Deal Date",
    date_encoding: DateEncoding::Text,
    int_columns: &[],
};

impl Dataset {
    /// Type the date and count columns and sort by date. Unparseable dates become null.
    pub fn tidy(&self, df: DataFrame) -> Result<DataFrame> {
        let date = match self.date_encoding {
            DateEncoding::EpochMillis => col(self.date_column)
                .cast(DataType::Float64)
                .cast(DataType::Int64)
                .cast(DataType::Datetime(TimeUnit::Milliseconds, None))
                .cast(DataType::Date),
            DateEncoding::Text => col(self.date_column).str().to_date(StrptimeOptions {
                format: None,
                strict: false,
                exact: true,
                cache: true,
            }),
        };
        let ints: Vec<Expr> = self
            .int_columns
            .iter()
            .map(|c| col(c).strict_cast(DataType::Float64).cast(DataType::Int64))
            .collect();
        let df = df
            .lazy()
            .with_column(date)
            .with_columns(ints)
            .sort([self.date_column], SortMultipleOptions::default().with_maintain_order(true))
            .collect()
            .with_context(|| format!("Unexpected values in {}", self.name))?;
        Ok(df)
    }

    pub async fn fetch(&self, client: &PowerBiClient<'_>) -> Result<DataFrame> {
        let df = client
            .query(&self.connection, self.table, self.projections)
            .await?;
        info!("{}: {} rows", self.name, df.height());
        self.tidy(df)
    }

    pub fn save(&self, df: &mut DataFrame, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(self.file_name);
        CsvFormatter::default().save_file(&path, df)?;
        Ok(path)
    }
}

async fn update_datasets(
    epidata: &Epidata,
    page_url: &str,
    query_url: &str,
    datasets: &[Dataset],
    report: &mut UpdateReport,
) {
    let dir = epidata.config.data_dir.join(STORE_DIR);
    let client = report
        .run(page_url, || async move {
            Ok::<_, anyhow::Error>(
                PowerBiClient::connect(&epidata.fetcher, page_url, query_url).await?,
            )
        })
        .await;
    let Some(client) = client else {
        return;
    };
    for dataset in datasets {
        let (client, dir) = (&client, &dir);
        report
            .run(dataset.name, || async move {
                let mut df = dataset.fetch(client).await?;
                dataset.save(&mut df, dir)
            })
            .await;
    }
}

/// Refresh every vaccine dataset. A failure only loses the dataset it happened in.
pub async fn update(epidata: &Epidata) -> UpdateReport {
    let mut report = UpdateReport::default();
    update_datasets(
        epidata,
        UNICEF_PAGE_URL,
        UNICEF_QUERY_URL,
        &[DONATIONS, SUPPLY_DEALS],
        &mut report,
    )
    .await;
    update_datasets(
        epidata,
        PAHO_PAGE_URL,
        PAHO_QUERY_URL,
        &[COVAX_DELIVERY],
        &mut report,
    )
    .await;
    report
}
