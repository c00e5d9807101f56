//! Client for public PowerBI reports ("publish to web").
//!
//! A report embedded in a web page exposes a resource key inside its iframe URL. Queries are
//! POSTed to the cluster's `querydata` endpoint and answered in the compressed DSR format, where
//! each row only carries the values that differ from the previous row.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use log::{debug, info};
use polars::prelude::*;
use reqwest::header::{HeaderMap, HeaderValue};
use scraper::{Html, Selector};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{EpidataError, EpidataResult};
use crate::fetch::Fetcher;

/// Identifies one visual of a published report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub dataset_id: &'static str,
    pub report_id: &'static str,
    pub visual_id: &'static str,
    pub model_id: u64,
}

/// A column to select, optionally wrapped in an aggregate such as `Sum`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub column: &'static str,
    pub aggregate: Option<&'static str>,
}

impl Projection {
    pub const fn column(column: &'static str) -> Self {
        Self {
            column,
            aggregate: None,
        }
    }

    pub const fn sum(column: &'static str) -> Self {
        Self {
            column,
            aggregate: Some("Sum"),
        }
    }
}

fn invalid(msg: impl Into<String>) -> EpidataError {
    EpidataError::PowerBi(msg.into())
}

/// Extract the resource key from the first PowerBI iframe of a page. The key is the `k` field
/// of the base64 JSON passed as the `r` query parameter.
pub fn resource_key(html: &str) -> EpidataResult<String> {
    let document = Html::parse_document(html);
    let selector =
        Selector::parse("iframe[src]").map_err(|err| invalid(format!("selector: {err}")))?;
    let src = document
        .select(&selector)
        .filter_map(|iframe| iframe.value().attr("src"))
        .find(|src| src.contains("powerbi"))
        .ok_or_else(|| invalid("no PowerBI iframe on the page"))?;
    let query = src
        .rsplit_once('?')
        .map(|(_, query)| query)
        .ok_or_else(|| invalid(format!("iframe src has no query: {src}")))?;
    let code = query
        .split('&')
        .find_map(|param| param.strip_prefix("r="))
        .ok_or_else(|| invalid(format!("iframe src has no embed code: {src}")))?;
    let code = code.replace("%3D", "=").replace("%3d", "=");
    let decoded = STANDARD_NO_PAD
        .decode(code.trim_end_matches('='))
        .map_err(|err| invalid(format!("embed code is not base64: {err}")))?;
    let embed: Value = serde_json::from_slice(&decoded)?;
    embed["k"]
        .as_str()
        .map(String::from)
        .ok_or_else(|| invalid("embed code has no resource key"))
}

/// The select clause entry for a column of `table`, aliased the way the report designer does.
pub fn select_column(table: &str, projection: &Projection) -> Value {
    let mut name = format!("{table}.{}", projection.column);
    if let Some(aggregate) = projection.aggregate {
        name = format!("{aggregate}({name})");
    }
    json!({
        "Column": {
            "Expression": {"SourceRef": {"Source": "t"}},
            "Property": projection.column
        },
        "Name": name
    })
}

/// A `querydata` body selecting `projections` from `table`, one group per projection.
pub fn build_query(connection: &Connection, table: &str, projections: &[Projection]) -> Value {
    let select: Vec<Value> = projections
        .iter()
        .map(|p| select_column(table, p))
        .collect();
    json!({
        "version": "1.0.0",
        "queries": [{
            "Query": {
                "Commands": [{
                    "SemanticQueryDataShapeCommand": {
                        "Query": {
                            "Version": 2,
                            "From": [{"Name": "t", "Entity": table, "Type": 0}],
                            "Select": select,
                            "Where": [],
                            "OrderBy": []
                        },
                        "Binding": {
                            "Primary": {
                                "Groupings": [{"Projections": (0..projections.len()).collect::<Vec<_>>()}]
                            },
                            "DataReduction": {
                                "DataVolume": 2,
                                "Primary": {"BinnedLineSample": {}}
                            },
                            "Version": 1
                        }
                    }
                }]
            },
            "CacheKey": format!("query: {}", Uuid::new_v4()),
            "QueryId": "",
            "ApplicationContext": {
                "DatasetId": connection.dataset_id,
                "Sources": [{
                    "ReportId": connection.report_id,
                    "VisualId": connection.visual_id
                }]
            }
        }],
        "cancelQueries": [],
        "modelId": connection.model_id
    })
}

fn bit(mask: u64, n: usize) -> bool {
    n < 64 && mask & (1 << n) != 0
}

/// Expand the compressed rows of a DSR response.
///
/// For each row and column `n`: bit `n` of `R` repeats the previous row's value, bit `n` of `Ø`
/// marks a null, anything else takes the next value from `C`.
pub fn inflate(response: &Value, columns: usize) -> EpidataResult<Vec<Vec<Option<Value>>>> {
    let rows = response["results"][0]["result"]["data"]["dsr"]["DS"][0]["PH"][0]["DM0"]
        .as_array()
        .ok_or_else(|| invalid("response has no DM0 rows"))?;
    let mut inflated: Vec<Vec<Option<Value>>> = Vec::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        let repeat = row["R"].as_u64().unwrap_or(0);
        let null = row["Ø"].as_u64().unwrap_or(0);
        let mut values = row["C"].as_array().into_iter().flatten();
        let previous = inflated.last();
        let mut out = Vec::with_capacity(columns);
        for n in 0..columns {
            let value = if bit(repeat, n) {
                previous.and_then(|prev| prev[n].clone())
            } else if bit(null, n) {
                None
            } else {
                let value = values
                    .next()
                    .ok_or_else(|| invalid(format!("row {idx} is missing column {n}")))?;
                (!value.is_null()).then(|| value.clone())
            };
            out.push(value);
        }
        inflated.push(out);
    }
    debug!("Inflated {} rows of {columns} columns", inflated.len());
    Ok(inflated)
}

/// Replace every null with the last value above it in the same column.
pub fn forward_fill(rows: &mut [Vec<Option<Value>>]) {
    for idx in 1..rows.len() {
        let (above, below) = rows.split_at_mut(idx);
        let previous = &above[idx - 1];
        for (n, cell) in below[0].iter_mut().enumerate() {
            if cell.is_none() {
                *cell = previous.get(n).cloned().flatten();
            }
        }
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A text frame with one column per projection.
pub fn to_frame(projections: &[Projection], rows: &[Vec<Option<Value>>]) -> PolarsResult<DataFrame> {
    let columns = projections
        .iter()
        .enumerate()
        .map(|(n, p)| {
            let values: Vec<Option<String>> = rows
                .iter()
                .map(|row| row.get(n).cloned().flatten().map(|v| text(&v)))
                .collect();
            Series::new(p.column, values)
        })
        .collect();
    DataFrame::new(columns)
}

/// A report cluster plus the resource key of one published report.
pub struct PowerBiClient<'a> {
    fetcher: &'a Fetcher,
    query_url: String,
    resource_key: String,
}

impl<'a> PowerBiClient<'a> {
    pub fn new(fetcher: &'a Fetcher, query_url: &str, resource_key: String) -> Self {
        Self {
            fetcher,
            query_url: query_url.into(),
            resource_key,
        }
    }

    /// Read the resource key from the page embedding the report.
    pub async fn connect(fetcher: &'a Fetcher, page_url: &str, query_url: &str) -> EpidataResult<Self> {
        let html = fetcher.get_text(page_url).await?;
        let key = resource_key(&html)?;
        info!("Found PowerBI resource key on {page_url}");
        Ok(Self::new(fetcher, query_url, key))
    }

    fn headers(&self) -> EpidataResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&self.resource_key)
            .map_err(|err| invalid(format!("resource key is not a header value: {err}")))?;
        headers.insert("X-PowerBI-ResourceKey", key);
        let request_id = HeaderValue::from_str(&Uuid::new_v4().to_string())
            .map_err(|err| invalid(err.to_string()))?;
        headers.insert("RequestId", request_id);
        Ok(headers)
    }

    /// Query a visual and return its rows, inflated and forward filled, as text columns.
    pub async fn query(
        &self,
        connection: &Connection,
        table: &str,
        projections: &[Projection],
    ) -> EpidataResult<DataFrame> {
        let body = build_query(connection, table, projections);
        let response = self
            .fetcher
            .post_json(&self.query_url, &body, &self.headers()?)
            .await?;
        let mut rows = inflate(&response, projections.len())?;
        forward_fill(&mut rows);
        Ok(to_frame(projections, &rows)?)
    }
}
