//! Named, independently testable reshaping steps. Each source describes its layout as a
//! `Pipeline` of these steps instead of inline frame surgery.

use std::collections::BTreeMap;

use enum_dispatch::enum_dispatch;
use log::debug;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;

#[enum_dispatch]
pub trait Transform {
    fn transform(&self, df: DataFrame) -> PolarsResult<DataFrame>;
}

#[enum_dispatch(Transform)]
#[derive(Debug, Clone, Serialize, Deserialize, AsRefStr)]
#[serde(tag = "step", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransformStep {
    Rename(Rename),
    RenameAt(RenameAt),
    Select(Select),
    Drop(DropColumns),
    FilterOut(FilterOut),
    FilterSuffix(FilterSuffix),
    MapValues(MapValues),
    Unpivot(Unpivot),
    ParseDate(ParseDate),
    CastInt(CastInt),
    Distinct(Distinct),
    Aggregate(Aggregate),
}

fn cols(names: &[String]) -> Vec<Expr> {
    names.iter().map(|c| col(c)).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rename {
    pub from: String,
    pub to: String,
}

impl Rename {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl Transform for Rename {
    fn transform(&self, mut df: DataFrame) -> PolarsResult<DataFrame> {
        df.rename(&self.from, &self.to)?;
        Ok(df)
    }
}

/// Rename by position, for exports whose index column has no usable header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameAt {
    pub index: usize,
    pub to: String,
}

impl Transform for RenameAt {
    fn transform(&self, mut df: DataFrame) -> PolarsResult<DataFrame> {
        let from = df
            .get_column_names()
            .get(self.index)
            .map(|name| name.to_string())
            .ok_or_else(|| {
                PolarsError::ColumnNotFound(format!("no column at position {}", self.index).into())
            })?;
        df.rename(&from, &self.to)?;
        Ok(df)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Select {
    pub columns: Vec<String>,
}

impl Transform for Select {
    fn transform(&self, df: DataFrame) -> PolarsResult<DataFrame> {
        df.lazy().select(cols(&self.columns)).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropColumns {
    pub columns: Vec<String>,
}

impl Transform for DropColumns {
    fn transform(&self, mut df: DataFrame) -> PolarsResult<DataFrame> {
        for column in &self.columns {
            df = df.drop(column)?;
        }
        Ok(df)
    }
}

/// Drop rows whose value in `column` is one of `values`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterOut {
    pub column: String,
    pub values: Vec<String>,
}

impl Transform for FilterOut {
    fn transform(&self, df: DataFrame) -> PolarsResult<DataFrame> {
        let values = Series::new("values", self.values.as_slice());
        df.lazy()
            .filter(col(&self.column).is_in(lit(values)).not())
            .collect()
    }
}

/// Drop rows whose value in `column` ends with `suffix`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSuffix {
    pub column: String,
    pub suffix: String,
}

impl Transform for FilterSuffix {
    fn transform(&self, df: DataFrame) -> PolarsResult<DataFrame> {
        df.lazy()
            .filter(
                col(&self.column)
                    .str()
                    .ends_with(lit(self.suffix.as_str()))
                    .not(),
            )
            .collect()
    }
}

/// Whole-value replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapValues {
    pub column: String,
    pub mapping: BTreeMap<String, String>,
}

impl Transform for MapValues {
    fn transform(&self, df: DataFrame) -> PolarsResult<DataFrame> {
        let mut expr = col(&self.column);
        for (from, to) in &self.mapping {
            expr = when(col(&self.column).eq(lit(from.as_str())))
                .then(lit(to.as_str()))
                .otherwise(expr);
        }
        df.lazy().with_column(expr.alias(&self.column)).collect()
    }
}

/// Wide to long: every column not in `index` becomes rows of (`variable`, `value`). Values are
/// read as text so that columns of mixed types stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unpivot {
    pub index: Vec<String>,
    pub variable: String,
    pub value: String,
}

impl Transform for Unpivot {
    fn transform(&self, df: DataFrame) -> PolarsResult<DataFrame> {
        let value_columns: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|name| name.to_string())
            .filter(|name| !self.index.contains(name))
            .collect();
        if value_columns.is_empty() {
            return Err(PolarsError::ComputeError(
                "no columns left to unpivot".into(),
            ));
        }
        let frames: Vec<LazyFrame> = value_columns
            .iter()
            .map(|name| {
                let mut exprs = cols(&self.index);
                exprs.push(lit(name.as_str()).alias(&self.variable));
                exprs.push(col(name).cast(DataType::String).alias(&self.value));
                df.clone().lazy().select(exprs)
            })
            .collect();
        concat(frames, UnionArgs::default())?.collect()
    }
}

/// Parse a text column into dates. With `exact = false` the format may match a prefix, which
/// handles timestamps such as `2021/03/01 00:00:00`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseDate {
    pub column: String,
    pub format: String,
    #[serde(default = "default_exact")]
    pub exact: bool,
}

fn default_exact() -> bool {
    true
}

impl ParseDate {
    pub fn new(column: &str, format: &str) -> Self {
        Self {
            column: column.into(),
            format: format.into(),
            exact: true,
        }
    }
}

impl Transform for ParseDate {
    fn transform(&self, df: DataFrame) -> PolarsResult<DataFrame> {
        if df.column(&self.column)?.dtype() == &DataType::Date {
            return Ok(df);
        }
        let options = StrptimeOptions {
            format: Some(self.format.clone().into()),
            strict: true,
            exact: self.exact,
            cache: true,
        };
        df.lazy()
            .with_column(col(&self.column).str().to_date(options))
            .collect()
    }
}

/// Counts arrive as text and sometimes as `12.0`; go through floats so both parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastInt {
    pub columns: Vec<String>,
}

impl Transform for CastInt {
    fn transform(&self, df: DataFrame) -> PolarsResult<DataFrame> {
        let exprs: Vec<Expr> = self
            .columns
            .iter()
            .map(|c| {
                col(c)
                    .strict_cast(DataType::Float64)
                    .cast(DataType::Int64)
            })
            .collect();
        df.lazy().with_columns(exprs).collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Keep {
    First,
    Last,
}

impl From<Keep> for UniqueKeepStrategy {
    fn from(value: Keep) -> Self {
        match value {
            Keep::First => UniqueKeepStrategy::First,
            Keep::Last => UniqueKeepStrategy::Last,
        }
    }
}

/// One row per `subset`, keeping the first or last occurrence in row order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distinct {
    pub subset: Vec<String>,
    pub keep: Keep,
}

impl Transform for Distinct {
    fn transform(&self, df: DataFrame) -> PolarsResult<DataFrame> {
        df.lazy()
            .unique_stable(Some(self.subset.clone()), self.keep.into())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    /// Mean rounded to the nearest integer
    Mean,
    Count,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregate {
    pub by: Vec<String>,
    pub values: Vec<String>,
    pub agg: Aggregation,
}

/// Round half to even, the way the stored PAHO means have always been rounded.
fn round_half_even(s: Series) -> PolarsResult<Option<Series>> {
    Ok(Some(s.f64()?.apply_values(f64::round_ties_even).into_series()))
}

impl Transform for Aggregate {
    fn transform(&self, df: DataFrame) -> PolarsResult<DataFrame> {
        let aggs: Vec<Expr> = self
            .values
            .iter()
            .map(|v| match self.agg {
                Aggregation::Sum => col(v).sum(),
                Aggregation::Mean => col(v).strict_cast(DataType::Float64).mean(),
                Aggregation::Count => col(v).count().cast(DataType::Int64),
            })
            .collect();
        let grouped = df.lazy().group_by_stable(cols(&self.by)).agg(aggs);
        match self.agg {
            Aggregation::Mean => grouped
                .with_columns(
                    self.values
                        .iter()
                        .map(|v| {
                            col(v)
                                .map(round_half_even, GetOutput::same_type())
                                .cast(DataType::Int64)
                        })
                        .collect::<Vec<_>>(),
                )
                .collect(),
            Aggregation::Sum | Aggregation::Count => grouped.collect(),
        }
    }
}

/// An ordered list of steps for one source layout.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Pipeline {
    pub name: String,
    pub steps: Vec<TransformStep>,
}

impl Pipeline {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            steps: vec![],
        }
    }

    pub fn then<T: Into<TransformStep>>(mut self, step: T) -> Self {
        self.steps.push(step.into());
        self
    }

    pub fn run(&self, mut df: DataFrame) -> PolarsResult<DataFrame> {
        debug!("{}: input shape {:?}", self.name, df.shape());
        for step in &self.steps {
            df = step.transform(df)?;
            debug!("{}: {} -> {:?}", self.name, step.as_ref(), df.shape());
        }
        Ok(df)
    }
}

#[cfg(test)]
mod tests {
    use polars::df;

    use super::*;

    fn strings(df: &DataFrame, name: &str) -> Vec<String> {
        df.column(name)
            .unwrap()
            .cast(&DataType::String)
            .unwrap()
            .str()
            .unwrap()
            .into_no_null_iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn ints(df: &DataFrame, name: &str) -> Vec<i64> {
        df.column(name)
            .unwrap()
            .i64()
            .unwrap()
            .into_no_null_iter()
            .collect()
    }

    fn wide_df() -> DataFrame {
        df!(
            "Region" => &["Ñuble", "Ñuble", "Biobío"],
            "Comuna" => &["Chillán", "Bulnes", "Concepción"],
            "2021-01-01" => &["1", "2", "4"],
            "2021-01-02" => &["0", "3", "5.0"]
        )
        .unwrap()
    }

    #[test]
    fn unpivot_should_stack_value_columns() -> anyhow::Result<()> {
        let step = Unpivot {
            index: vec!["Region".into(), "Comuna".into()],
            variable: "date".into(),
            value: "deaths".into(),
        };
        let long = step.transform(wide_df())?;
        assert_eq!(long.shape(), (6, 4));
        assert_eq!(
            strings(&long, "date"),
            vec![
                "2021-01-01", "2021-01-01", "2021-01-01", "2021-01-02", "2021-01-02",
                "2021-01-02"
            ]
        );
        Ok(())
    }

    #[test]
    fn pipeline_should_reshape_wide_counts() -> anyhow::Result<()> {
        let pipeline = Pipeline::new("chile")
            .then(Unpivot {
                index: vec!["Region".into(), "Comuna".into()],
                variable: "date".into(),
                value: "deaths".into(),
            })
            .then(ParseDate::new("date", "%Y-%m-%d"))
            .then(CastInt {
                columns: vec!["deaths".into()],
            })
            .then(Rename::new("Region", "adm1_name"))
            .then(Aggregate {
                by: vec!["adm1_name".into(), "date".into()],
                values: vec!["deaths".into()],
                agg: Aggregation::Sum,
            });
        let out = pipeline.run(wide_df())?;
        assert_eq!(strings(&out, "adm1_name"), vec!["Ñuble", "Biobío", "Ñuble", "Biobío"]);
        assert_eq!(ints(&out, "deaths"), vec![3, 4, 3, 5]);
        assert_eq!(out.column("date")?.dtype(), &DataType::Date);
        Ok(())
    }

    #[test]
    fn filters_should_drop_rows() -> anyhow::Result<()> {
        let df = df!(
            "provincia" => &["Pichincha", "Otro", "Guayas"],
            "code" => &["EC-P", "EC-999", "EC-G"]
        )?;
        let df = FilterOut {
            column: "provincia".into(),
            values: vec!["Otro".into()],
        }
        .transform(df)?;
        assert_eq!(strings(&df, "provincia"), vec!["Pichincha", "Guayas"]);

        let df = df!("code" => &["EC-P", "EC-999", "EC-G"])?;
        let df = FilterSuffix {
            column: "code".into(),
            suffix: "999".into(),
        }
        .transform(df)?;
        assert_eq!(strings(&df, "code"), vec!["EC-P", "EC-G"]);
        Ok(())
    }

    #[test]
    fn map_values_should_replace_whole_values() -> anyhow::Result<()> {
        let df = df!("lugar" => &["PTE. HAYES", "CAPITAL", "CAPITAL CITY"])?;
        let df = MapValues {
            column: "lugar".into(),
            mapping: BTreeMap::from([
                ("PTE. HAYES".to_string(), "PRESIDENTE HAYES".to_string()),
                ("CAPITAL".to_string(), "ASUNCION".to_string()),
            ]),
        }
        .transform(df)?;
        assert_eq!(
            strings(&df, "lugar"),
            vec!["PRESIDENTE HAYES", "ASUNCION", "CAPITAL CITY"]
        );
        Ok(())
    }

    #[test]
    fn distinct_and_mean_should_follow_the_paho_layout() -> anyhow::Result<()> {
        let df = df!(
            "OBJECTID" => &["1", "1", "2", "3"],
            "ADM1" => &["BO-L", "BO-L", "BO-L", "BO-C"],
            "DATA_DATE" => &["2021/03/01 00:00:00", "2021/03/01 00:00:00", "2021/03/01 12:00:00", "2021/03/02 00:00:00"],
            "TOTAL_CASES" => &["10", "99", "11", "4"]
        )?;
        let out = Pipeline::new("paho")
            .then(Distinct {
                subset: vec!["OBJECTID".into()],
                keep: Keep::First,
            })
            .then(ParseDate {
                column: "DATA_DATE".into(),
                format: "%Y/%m/%d".into(),
                exact: false,
            })
            .then(Aggregate {
                by: vec!["ADM1".into(), "DATA_DATE".into()],
                values: vec!["TOTAL_CASES".into()],
                agg: Aggregation::Mean,
            })
            .run(df)?;
        assert_eq!(strings(&out, "DATA_DATE"), vec!["2021-03-01", "2021-03-02"]);
        // mean of 10 and 11, rounded half to even
        assert_eq!(ints(&out, "TOTAL_CASES"), vec![10, 4]);
        Ok(())
    }

    #[test]
    fn means_should_round_half_to_even() -> anyhow::Result<()> {
        let df = df!(
            "ADM1" => &["A", "A", "B", "B", "C", "C", "D"],
            "TOTAL_CASES" => &[Some("10"), Some("11"), Some("11"), Some("12"), Some("2"), Some("3"), None]
        )?;
        let out = Aggregate {
            by: vec!["ADM1".into()],
            values: vec!["TOTAL_CASES".into()],
            agg: Aggregation::Mean,
        }
        .transform(df)?;
        let means: Vec<Option<i64>> = out.column("TOTAL_CASES")?.i64()?.into_iter().collect();
        assert_eq!(means, vec![Some(10), Some(12), Some(2), None]);
        Ok(())
    }

    #[test]
    fn malformed_counts_should_fail_the_mean() -> anyhow::Result<()> {
        let df = df!("ADM1" => &["A", "A"], "TOTAL_CASES" => &["10", "n/a"])?;
        let result = Aggregate {
            by: vec!["ADM1".into()],
            values: vec!["TOTAL_CASES".into()],
            agg: Aggregation::Mean,
        }
        .transform(df);
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn count_should_skip_nulls() -> anyhow::Result<()> {
        let df = df!(
            "DEPARTAMENTO" => &["LIMA", "LIMA", "CUSCO"],
            "N" => &[Some("1"), Some("2"), None]
        )?;
        let out = Aggregate {
            by: vec!["DEPARTAMENTO".into()],
            values: vec!["N".into()],
            agg: Aggregation::Count,
        }
        .transform(df)?;
        assert_eq!(ints(&out, "N"), vec![2, 0]);
        Ok(())
    }

    #[test]
    fn rename_at_should_use_the_position() -> anyhow::Result<()> {
        let df = df!("Unnamed: 0" => &["2021-01-01"], "La Paz" => &["3"])?;
        let df = RenameAt {
            index: 0,
            to: "date".into(),
        }
        .transform(df)?;
        assert_eq!(strings(&df, "date"), vec!["2021-01-01"]);
        assert!(RenameAt {
            index: 5,
            to: "x".into()
        }
        .transform(df)
        .is_err());
        Ok(())
    }

    #[test]
    fn pipelines_should_load_from_json() {
        let pipeline: Pipeline = serde_json::from_str(
            r#"{
                "name": "ecuador",
                "steps": [
                    {"step": "drop", "columns": ["lat", "lng"]},
                    {"step": "parse_date", "column": "date", "format": "%d/%m/%Y"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(pipeline.steps.len(), 2);
        assert_eq!(pipeline.steps[1].as_ref(), "parse_date");
        assert!(matches!(&pipeline.steps[1], TransformStep::ParseDate(p) if p.exact));
    }
}
