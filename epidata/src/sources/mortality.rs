//! Subnational mortality for South America, merged into a single long store keyed by
//! `(iso_code, adm1_name, date)`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use itertools::Itertools;
use log::info;
use nonempty::nonempty;
use polars::prelude::*;
use strum_macros::Display;

use crate::geocode::{GeocodeResolver, Resolved};
use crate::sources::read_csv_text_after;
use crate::store::{ColumnSpec, MergeOutcome, MergeStore, StoreSchema};
use crate::transform::{
    Aggregate, Aggregation, CastInt, DropColumns, FilterOut, MapValues, ParseDate, Pipeline,
    Rename, RenameAt, Select, Unpivot,
};
use crate::update::UpdateReport;
use crate::{Epidata, COL};

pub const STORE_DIR: &str = "mortality";
pub const STORE_FILE: &str = "south.america.subnational.mortality.csv";

/// Rows on or before this date are dropped.
fn cutoff() -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(2020, 12, 31).ok_or_else(|| anyhow!("invalid cutoff date"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

/// A CSV source whose `pipeline` yields `adm1_name`, `date` and `deaths`. `output` runs on
/// the formatted rows, after geocoding.
#[derive(Debug, Clone)]
pub struct MortalitySource {
    pub iso_code: &'static str,
    pub country_name: &'static str,
    pub frequency: Frequency,
    pub url: String,
    pub separator: u8,
    /// Lines above the header.
    pub skip_rows: usize,
    pub pipeline: Pipeline,
    pub output: Pipeline,
}

pub fn chile() -> MortalitySource {
    MortalitySource {
        iso_code: "CL",
        country_name: "Chile",
        frequency: Frequency::Daily,
        url: "https://github.com/MinCiencia/Datos-COVID19/blob/master/output/producto32/Defunciones.csv?raw=true".into(),
        separator: b',',
        skip_rows: 0,
        pipeline: Pipeline::new("chile")
            .then(DropColumns {
                columns: vec!["Codigo region".into(), "Comuna".into(), "Codigo comuna".into()],
            })
            .then(Unpivot {
                index: vec!["Region".into()],
                variable: COL::DATE.into(),
                value: COL::DEATHS.into(),
            })
            .then(Rename::new("Region", COL::ADM1_NAME))
            .then(ParseDate::new(COL::DATE, "%Y-%m-%d"))
            .then(CastInt {
                columns: vec![COL::DEATHS.into()],
            })
            .then(Aggregate {
                by: vec![COL::ADM1_NAME.into(), COL::DATE.into()],
                values: vec![COL::DEATHS.into()],
                agg: Aggregation::Sum,
            }),
        output: Pipeline::new("chile output"),
    }
}

pub fn ecuador() -> MortalitySource {
    MortalitySource {
        iso_code: "EC",
        country_name: "Ecuador",
        frequency: Frequency::Daily,
        url: "https://github.com/andrab/ecuacovid/raw/master/datos_crudos/defunciones/por_fecha/provincias_por_dia.csv".into(),
        separator: b',',
        skip_rows: 0,
        pipeline: Pipeline::new("ecuador")
            .then(FilterOut {
                column: "provincia".into(),
                values: vec!["Otro".into()],
            })
            .then(DropColumns {
                columns: vec!["lat".into(), "lng".into(), "poblacion".into()],
            })
            .then(Unpivot {
                index: vec!["provincia".into()],
                variable: COL::DATE.into(),
                value: COL::DEATHS.into(),
            })
            .then(Rename::new("provincia", COL::ADM1_NAME))
            .then(ParseDate::new(COL::DATE, "%d/%m/%Y"))
            .then(CastInt {
                columns: vec![COL::DEATHS.into()],
            }),
        output: Pipeline::new("ecuador output"),
    }
}

pub fn bolivia() -> MortalitySource {
    MortalitySource {
        iso_code: "BO",
        country_name: "Bolivia",
        frequency: Frequency::Monthly,
        url: "https://raw.githubusercontent.com/pr0nstar/covid19-data/master/raw/bolivia/sereci/sereci.by.death.date.csv".into(),
        separator: b',',
        skip_rows: 0,
        pipeline: Pipeline::new("bolivia")
            .then(RenameAt {
                index: 0,
                to: COL::DATE.into(),
            })
            .then(Unpivot {
                index: vec![COL::DATE.into()],
                variable: COL::ADM1_NAME.into(),
                value: COL::DEATHS.into(),
            })
            .then(ParseDate::new(COL::DATE, "%Y-%m-%d"))
            .then(CastInt {
                columns: vec![COL::DEATHS.into()],
            }),
        output: Pipeline::new("bolivia output").then(MapValues {
            column: COL::ADM1_NAME.into(),
            mapping: [("El Beni".to_string(), "Beni".to_string())].into(),
        }),
    }
}

/// Federative units by their two-letter code.
const BRAZIL_STATES: [(&str, &str); 27] = [
    ("AC", "Acre"),
    ("AL", "Alagoas"),
    ("AP", "Amapá"),
    ("AM", "Amazonas"),
    ("BA", "Bahia"),
    ("CE", "Ceará"),
    ("DF", "Distrito Federal"),
    ("ES", "Espírito Santo"),
    ("GO", "Goiás"),
    ("MA", "Maranhão"),
    ("MT", "Mato Grosso"),
    ("MS", "Mato Grosso do Sul"),
    ("MG", "Minas Gerais"),
    ("PA", "Pará"),
    ("PB", "Paraíba"),
    ("PR", "Paraná"),
    ("PE", "Pernambuco"),
    ("PI", "Piauí"),
    ("RJ", "Rio de Janeiro"),
    ("RN", "Rio Grande do Norte"),
    ("RS", "Rio Grande do Sul"),
    ("RO", "Rondônia"),
    ("RR", "Roraima"),
    ("SC", "Santa Catarina"),
    ("SP", "São Paulo"),
    ("SE", "Sergipe"),
    ("TO", "Tocantins"),
];

/// Civil registry deaths per state, date and place, one column per cause. All causes and
/// places are summed.
pub fn brazil() -> MortalitySource {
    MortalitySource {
        iso_code: "BR",
        country_name: "Brazil",
        frequency: Frequency::Daily,
        url: "https://github.com/capyvara/brazil-civil-registry-data/blob/master/civil_registry_covid_states.csv?raw=true".into(),
        separator: b',',
        skip_rows: 0,
        pipeline: Pipeline::new("brazil")
            .then(DropColumns {
                columns: vec!["state_ibge_code".into(), "place".into()],
            })
            .then(Unpivot {
                index: vec!["state".into(), COL::DATE.into()],
                variable: "cause".into(),
                value: COL::DEATHS.into(),
            })
            .then(ParseDate::new(COL::DATE, "%Y-%m-%d"))
            .then(CastInt {
                columns: vec![COL::DEATHS.into()],
            })
            .then(Aggregate {
                by: vec!["state".into(), COL::DATE.into()],
                values: vec![COL::DEATHS.into()],
                agg: Aggregation::Sum,
            })
            .then(MapValues {
                column: "state".into(),
                mapping: BRAZIL_STATES
                    .iter()
                    .map(|(code, name)| (code.to_string(), name.to_string()))
                    .collect(),
            })
            .then(Rename::new("state", COL::ADM1_NAME)),
        output: Pipeline::new("brazil output"),
    }
}

/// One row per death with a title block above the header. Rows are counted per department
/// and day.
pub fn peru() -> MortalitySource {
    MortalitySource {
        iso_code: "PE",
        country_name: "Peru",
        frequency: Frequency::Daily,
        url: "https://cloud.minsa.gob.pe/s/nqF2irNbFomCLaa/download".into(),
        separator: b';',
        skip_rows: 2,
        pipeline: Pipeline::new("peru")
            .then(Select {
                columns: vec![
                    "Nº".into(),
                    "DEPARTAMENTO DOMICILIO".into(),
                    "FECHA".into(),
                ],
            })
            .then(FilterOut {
                column: "DEPARTAMENTO DOMICILIO".into(),
                values: vec!["EXTRANJERO".into(), "SIN REGISTRO".into()],
            })
            .then(ParseDate {
                column: "FECHA".into(),
                format: "%Y-%m-%d".into(),
                exact: false,
            })
            .then(Aggregate {
                by: vec!["DEPARTAMENTO DOMICILIO".into(), "FECHA".into()],
                values: vec!["Nº".into()],
                agg: Aggregation::Count,
            })
            .then(Rename::new("DEPARTAMENTO DOMICILIO", COL::ADM1_NAME))
            .then(Rename::new("FECHA", COL::DATE))
            .then(Rename::new("Nº", COL::DEATHS)),
        output: Pipeline::new("peru output"),
    }
}

pub fn all_sources() -> Vec<MortalitySource> {
    vec![chile(), brazil(), ecuador(), peru(), bolivia()]
}

/// Sources by ISO code, all of them when `selected` is empty.
pub fn select_sources(selected: &[String]) -> Result<Vec<MortalitySource>> {
    if selected.is_empty() {
        return Ok(all_sources());
    }
    selected
        .iter()
        .map(|iso| {
            all_sources()
                .into_iter()
                .find(|s| s.iso_code.eq_ignore_ascii_case(iso.trim()))
                .ok_or_else(|| {
                    anyhow!(
                        "Unknown mortality source '{iso}', expected one of {}",
                        all_sources().iter().map(|s| s.iso_code).join(", ")
                    )
                })
        })
        .collect()
}

pub fn schema() -> Result<StoreSchema> {
    Ok(StoreSchema::new(
        vec![
            ColumnSpec::text(COL::ISO_CODE),
            ColumnSpec::text(COL::COUNTRY_NAME),
            ColumnSpec::text(COL::ADM1_ISOCODE),
            ColumnSpec::text(COL::ADM1_NAME),
            ColumnSpec::text(COL::FREQUENCY),
            ColumnSpec::date(COL::DATE),
            ColumnSpec::int(COL::DEATHS),
        ],
        nonempty![
            COL::ISO_CODE.to_string(),
            COL::ADM1_NAME.to_string(),
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

/// Attach country columns, swap free-text region names for their geocode and canonical name,
/// and drop rows up to the cutoff date.
pub fn storage_format(
    df: DataFrame,
    source: &MortalitySource,
    resolver: &GeocodeResolver,
) -> Result<DataFrame> {
    let names = df.column(COL::ADM1_NAME)?.cast(&DataType::String)?;
    let names = names.str()?;

    let mut resolved: HashMap<&str, Option<Resolved>> = HashMap::new();
    for name in names.into_iter().flatten() {
        if !resolved.contains_key(name) {
            resolved.insert(name, resolver.resolve(source.iso_code, name)?);
        }
    }
    let lookup = |name: Option<&str>| name.and_then(|n| resolved.get(n)).and_then(Option::as_ref);
    let codes: Vec<Option<String>> = names
        .into_iter()
        .map(|name| lookup(name).map(|r| r.code.clone()))
        .collect();
    let canonical: Vec<Option<String>> = names
        .into_iter()
        .map(|name| lookup(name).map(|r| r.name.clone()).or(name.map(String::from)))
        .collect();

    let mut df = df;
    df.with_column(Series::new(COL::ADM1_ISOCODE, codes))?;
    df.with_column(Series::new(COL::ADM1_NAME, canonical))?;
    let out = df
        .lazy()
        .with_columns([
            lit(source.iso_code).alias(COL::ISO_CODE),
            lit(source.country_name).alias(COL::COUNTRY_NAME),
            lit(source.frequency.to_string()).alias(COL::FREQUENCY),
        ])
        .filter(col(COL::DATE).gt(lit(cutoff()?)))
        .select([
            col(COL::ISO_CODE),
            col(COL::COUNTRY_NAME),
            col(COL::ADM1_ISOCODE),
            col(COL::ADM1_NAME),
            col(COL::FREQUENCY),
            col(COL::DATE),
            col(COL::DEATHS).cast(DataType::Int64),
        ])
        .collect()?;
    Ok(out)
}

impl MortalitySource {
    /// Reshape a downloaded body into store rows.
    pub fn process(&self, body: Vec<u8>, resolver: &GeocodeResolver) -> Result<DataFrame> {
        let raw = read_csv_text_after(body, self.separator, self.skip_rows)?;
        let long = self
            .pipeline
            .run(raw)
            .with_context(|| format!("Unexpected layout for {}", self.country_name))?;
        let formatted = storage_format(long, self, resolver)?;
        Ok(self.output.run(formatted)?)
    }
}

/// Fetch every source, skipping the ones that fail, and merge what was obtained.
pub async fn update(
    epidata: &Epidata,
    resolver: &GeocodeResolver,
    sources: &[MortalitySource],
) -> Result<(UpdateReport, MergeOutcome)> {
    let mut report = UpdateReport::default();
    let mut frames = vec![];
    for source in sources {
        let frame = report
            .run(source.country_name, || async move {
                let body = epidata.fetcher.get_bytes(&source.url).await?;
                source.process(body, resolver)
            })
            .await;
        frames.extend(frame);
    }
    let outcome = if frames.is_empty() {
        info!("No mortality source produced rows");
        MergeOutcome::Skipped
    } else {
        let new = concat(
            frames.into_iter().map(|df| df.lazy()).collect::<Vec<_>>(),
            UnionArgs::default(),
        )?
        .collect()?;
        store(&epidata.config.data_dir)?.update(new)?
    };
    Ok((report, outcome))
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use tempfile::TempDir;

    use super::*;
    use crate::config::Config;
    use crate::error::EpidataError;
    use crate::geocode::tests::test_resolver;
    use crate::geocode::UnresolvedPolicy;
    use crate::store::merge_frames;

    const CHILE_CSV: &str = "\
Region,Codigo region,Comuna,Codigo comuna,2020-12-31,2021-01-01,2021-01-02
Biobío,8,Concepción,8101,9,1,2
Biobío,8,Talcahuano,8110,9,3,0
Región Metropolitana de Santiago,13,Santiago,13101,9,10,12
";

    fn text(df: &DataFrame, name: &str) -> Vec<Option<String>> {
        df.column(name)
            .unwrap()
            .cast(&DataType::String)
            .unwrap()
            .str()
            .unwrap()
            .into_iter()
            .map(|v| v.map(String::from))
            .collect()
    }

    #[test]
    fn chile_should_sum_comunas_per_region() {
        let resolver = test_resolver(UnresolvedPolicy::Fail);
        let df = chile()
            .process(CHILE_CSV.as_bytes().to_vec(), &resolver)
            .unwrap();
        let merged = merge_frames(None, df, &schema().unwrap()).unwrap();
        assert_eq!(
            merged.get_column_names(),
            vec![
                "iso_code",
                "country_name",
                "adm1_isocode",
                "adm1_name",
                "frequency",
                "date",
                "deaths"
            ]
        );
        assert_eq!(
            text(&merged, COL::ADM1_ISOCODE),
            vec![
                Some("CL-BI".into()),
                Some("CL-BI".into()),
                Some("CL-RM".into()),
                Some("CL-RM".into())
            ]
        );
        assert_eq!(
            text(&merged, COL::ADM1_NAME)[2],
            Some("Santiago Metropolitan".into())
        );
        assert_eq!(
            text(&merged, COL::DATE),
            vec![
                Some("2021-01-01".into()),
                Some("2021-01-02".into()),
                Some("2021-01-01".into()),
                Some("2021-01-02".into())
            ]
        );
        assert_eq!(
            text(&merged, COL::DEATHS),
            vec![
                Some("4".into()),
                Some("2".into()),
                Some("10".into()),
                Some("12".into())
            ]
        );
        assert_eq!(text(&merged, COL::FREQUENCY)[0], Some("daily".into()));
    }

    #[test]
    fn ecuador_should_drop_other_and_resolve_aliases() {
        let csv = "\
provincia,poblacion,lat,lng,01/01/2021,02/01/2021
Pichincha,3228233,-0.2,-78.5,7,8
Sto. Domingo Tsáchilas,458580,-0.2,-79.1,1,2
Otro,0,0,0,5,5
";
        let resolver = test_resolver(UnresolvedPolicy::Fail);
        let df = ecuador().process(csv.as_bytes().to_vec(), &resolver).unwrap();
        assert_eq!(df.height(), 4);
        let codes = text(&df, COL::ADM1_ISOCODE);
        assert!(codes.contains(&Some("EC-SD".into())));
        assert!(!text(&df, COL::ADM1_NAME).contains(&Some("Otro".into())));
    }

    #[test]
    fn bolivia_should_read_departments_as_columns() {
        let csv = "\
fecha,El Beni,La Paz
2020-12-01,4,50
2021-01-01,5,60
";
        let resolver = test_resolver(UnresolvedPolicy::Fail);
        let df = bolivia().process(csv.as_bytes().to_vec(), &resolver).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(
            text(&df, COL::ADM1_NAME),
            vec![Some("Beni".into()), Some("Departamento de La Paz".into())]
        );
        assert_eq!(text(&df, COL::FREQUENCY)[0], Some("monthly".into()));
    }

    #[test]
    fn brazil_should_sum_causes_and_places_per_state() {
        let csv = "\
state,state_ibge_code,date,place,covid,pneumonia,septicemia
SP,35,2020-12-31,HOSPITAL,9,9,9
SP,35,2021-01-01,HOSPITAL,2,1,
SP,35,2021-01-01,HOME,1,0,2
AC,12,2021-01-01,HOSPITAL,0,1,1
";
        let resolver = test_resolver(UnresolvedPolicy::Fail);
        let df = brazil().process(csv.as_bytes().to_vec(), &resolver).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(
            text(&df, COL::ADM1_ISOCODE),
            vec![Some("BR-SP".into()), Some("BR-AC".into())]
        );
        assert_eq!(
            text(&df, COL::ADM1_NAME),
            vec![Some("São Paulo".into()), Some("Acre".into())]
        );
        assert_eq!(
            text(&df, COL::DEATHS),
            vec![Some("6".into()), Some("2".into())]
        );
    }

    #[test]
    fn peru_should_count_deaths_per_department_and_day() {
        let csv = "\
FALLECIDOS SINADEF;;;;
;;;;
Nº;DEPARTAMENTO DOMICILIO;FECHA;EDAD;SEXO
1;LIMA;2021-01-01 00:00:00;70;M
2;LIMA;2021-01-01 00:00:00;64;F
3;CUSCO;2021-01-01 00:00:00;81;F
4;EXTRANJERO;2021-01-01 00:00:00;50;M
5;SIN REGISTRO;2021-01-01 00:00:00;33;F
6;CUSCO;2020-12-31 00:00:00;90;M
";
        // Published as Latin-1
        let body: Vec<u8> = csv.chars().map(|c| c as u8).collect();
        let resolver = test_resolver(UnresolvedPolicy::Fail);
        let df = peru().process(body, &resolver).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(
            text(&df, COL::ADM1_ISOCODE),
            vec![Some("PE-LIM".into()), Some("PE-CUS".into())]
        );
        assert_eq!(
            text(&df, COL::ADM1_NAME),
            vec![Some("Lima".into()), Some("Cusco".into())]
        );
        assert_eq!(
            text(&df, COL::DATE),
            vec![Some("2021-01-01".into()), Some("2021-01-01".into())]
        );
        assert_eq!(
            text(&df, COL::DEATHS),
            vec![Some("2".into()), Some("1".into())]
        );
    }

    #[test]
    fn unresolved_regions_should_fail_by_default() {
        let csv = "\
Region,Codigo region,Comuna,Codigo comuna,2021-01-01
Atlantis,99,Capital,9901,3
";
        let err = chile()
            .process(csv.as_bytes().to_vec(), &test_resolver(UnresolvedPolicy::Fail))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EpidataError>(),
            Some(EpidataError::UnresolvedGeocode { .. })
        ));

        let df = chile()
            .process(csv.as_bytes().to_vec(), &test_resolver(UnresolvedPolicy::Allow))
            .unwrap();
        assert_eq!(text(&df, COL::ADM1_ISOCODE), vec![None]);
        assert_eq!(text(&df, COL::ADM1_NAME), vec![Some("Atlantis".into())]);
    }

    #[test]
    fn sources_should_be_selected_by_iso_code() {
        let selected = select_sources(&["cl".into(), "BO".into()]).unwrap();
        assert_eq!(
            selected.iter().map(|s| s.iso_code).collect::<Vec<_>>(),
            vec!["CL", "BO"]
        );
        assert_eq!(select_sources(&[]).unwrap().len(), 5);
        assert!(select_sources(&["XX".into()]).is_err());
    }

    #[tokio::test]
    async fn update_should_merge_the_sources_that_succeeded() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/chile.csv");
                then.status(200).body(CHILE_CSV);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/ecuador.csv");
                then.status(404);
            })
            .await;

        let dir = TempDir::new().unwrap();
        let epidata = Epidata::new_with_config(Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        })
        .unwrap();
        let mut sources = vec![chile(), ecuador()];
        sources[0].url = server.url("/chile.csv");
        sources[1].url = server.url("/ecuador.csv");

        let resolver = test_resolver(UnresolvedPolicy::Fail);
        let (report, outcome) = update(&epidata, &resolver, &sources).await.unwrap();
        assert_eq!(outcome, MergeOutcome::Written { rows: 4 });
        assert_eq!(report.succeeded, vec!["Chile".to_string()]);
        assert_eq!(report.failed[0].0, "Ecuador");
        assert!(dir.path().join(STORE_DIR).join(STORE_FILE).exists());
    }
}
