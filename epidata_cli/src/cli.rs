use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{command, Args, Parser, Subcommand};
use enum_dispatch::enum_dispatch;
use epidata::{
    config::Config,
    download::Downloader,
    error::EpidataError,
    geocode::Resolved,
    posts::{archive_jobs, archives_in, Platform},
    sources::{mortality, paho, read_csv_text, vaccines},
    store::{ColumnKind, ColumnSpec, MergeStore, StoreSchema},
    update::UpdateReport,
    Epidata,
};
use itertools::Itertools;
use log::{debug, info, warn};
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use spinners::{Spinner, Spinners};
use strum_macros::EnumString;

use crate::display::{display_downloads, display_geocodes, display_outcome, display_report};
use crate::error::EpidataCliResult;

const DEFAULT_PROGRESS_SPINNER: Spinners = Spinners::Dots;
const COMPLETE_PROGRESS_STRING: &str = "✔";
const RUNNING_TAIL_STRING: &str = "...";
const LIST_FILE_SUFFIX: &str = ".lst";

fn spinner(quiet: bool, message: &str) -> Option<Spinner> {
    (!quiet).then(|| {
        Spinner::with_timer(
            DEFAULT_PROGRESS_SPINNER,
            message.to_string() + RUNNING_TAIL_STRING,
        )
    })
}

fn stop(sp: Option<Spinner>) {
    if let Some(mut s) = sp {
        s.stop_with_symbol(COMPLETE_PROGRESS_STRING);
    }
}

/// Replace every `.lst` argument by the non-empty lines of that file.
pub fn expand_lists(args: &[String]) -> EpidataCliResult<Vec<String>> {
    let mut expanded = vec![];
    for arg in args {
        if arg.ends_with(LIST_FILE_SUFFIX) {
            let contents = std::fs::read_to_string(arg)
                .with_context(|| format!("Failed to read list file {arg}"))?;
            expanded.extend(
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from),
            );
        } else {
            expanded.push(arg.clone());
        }
    }
    Ok(expanded)
}

/// Trait that defines what to run when a given subcommand is invoked.
#[enum_dispatch]
pub trait RunCommand {
    async fn run(&self, config: Config) -> EpidataCliResult<()>;
}

/// The `mortality` command refreshes the subnational mortality store.
#[derive(Args, Debug)]
pub struct MortalityCommand {
    #[arg(
        value_name = "SOURCES",
        help = "ISO codes of the sources to update (or a .lst file), all of them when omitted"
    )]
    sources: Vec<String>,
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for MortalityCommand {
    async fn run(&self, config: Config) -> EpidataCliResult<()> {
        info!("Running `mortality` subcommand");
        let sources = mortality::select_sources(&expand_lists(&self.sources)?)?;
        let epidata = Epidata::new_with_config(config)?;
        let sp = spinner(self.quiet, "Downloading the geocode table");
        let resolver = epidata.geocode_resolver().await?;
        stop(sp);

        let sp = spinner(
            self.quiet,
            &format!(
                "Updating {}",
                sources.iter().map(|s| s.country_name).join(", ")
            ),
        );
        let (report, outcome) = mortality::update(&epidata, &resolver, &sources).await?;
        stop(sp);

        display_report(&report);
        let store = mortality::store(&epidata.config.data_dir)?;
        display_outcome(&store.path().to_string_lossy(), &outcome);
        Ok(())
    }
}

/// The `paho` command refreshes PAHO subnational cases and their timelines.
#[derive(Args, Debug)]
pub struct PahoCommand {
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for PahoCommand {
    async fn run(&self, config: Config) -> EpidataCliResult<()> {
        info!("Running `paho` subcommand");
        let epidata = Epidata::new_with_config(config)?;
        let sp = spinner(self.quiet, "Updating PAHO subnational cases");
        let outcome = paho::update(&epidata).await?;
        stop(sp);
        let store = paho::store(&epidata.config.data_dir)?;
        display_outcome(&store.path().to_string_lossy(), &outcome);
        Ok(())
    }
}

/// The `vaccines` command rewrites the vaccine delivery snapshots.
#[derive(Args, Debug)]
pub struct VaccinesCommand {
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for VaccinesCommand {
    async fn run(&self, config: Config) -> EpidataCliResult<()> {
        info!("Running `vaccines` subcommand");
        let epidata = Epidata::new_with_config(config)?;
        let sp = spinner(self.quiet, "Querying vaccine dashboards");
        let report = vaccines::update(&epidata).await;
        stop(sp);
        display_report(&report);
        Ok(())
    }
}

/// The `images` command downloads the photos attached to archived posts.
#[derive(Args, Debug)]
pub struct ImagesCommand {
    #[arg(value_name = "twitter|facebook", help = "Platform the archives come from")]
    platform: Platform,
    #[arg(
        value_name = "ARCHIVES",
        help = "Post archives (or a .lst file), every archive of <data_dir>/<platform>/posts when omitted"
    )]
    archives: Vec<String>,
    #[arg(from_global)]
    quiet: bool,
}

impl ImagesCommand {
    fn archives(&self, platform_dir: &Path) -> EpidataCliResult<Vec<PathBuf>> {
        let archives = expand_lists(&self.archives)?;
        if archives.is_empty() {
            return Ok(archives_in(&platform_dir.join("posts"))?);
        }
        Ok(archives.into_iter().map(PathBuf::from).collect())
    }
}

impl RunCommand for ImagesCommand {
    async fn run(&self, config: Config) -> EpidataCliResult<()> {
        info!("Running `images` subcommand");
        let epidata = Epidata::new_with_config(config)?;
        let platform_dir = epidata.config.data_dir.join(self.platform.dir_name());
        let images_root = platform_dir.join("images");

        let mut report = UpdateReport::default();
        let mut records = vec![];
        for archive in self.archives(&platform_dir)? {
            let jobs = archive_jobs(&archive, self.platform, &images_root);
            if let Some(jobs) = report.record(&archive.to_string_lossy(), jobs.map_err(Into::into))
            {
                records.extend(jobs);
            }
        }
        if !report.failed.is_empty() {
            display_report(&report);
        }

        let sp = spinner(
            self.quiet,
            &format!("Downloading images of {} posts", records.len()),
        );
        let downloads = Downloader::new(&epidata.fetcher, &epidata.config)
            .run(records)
            .await;
        stop(sp);
        display_downloads(&downloads);
        Ok(())
    }
}

/// The `merge` command merges a CSV file into a store keyed by the given columns.
#[derive(Args, Debug)]
pub struct MergeCommand {
    #[arg(long, help = "Store to merge into, created when missing")]
    store: PathBuf,
    #[arg(long, help = "CSV file with the new rows")]
    input: PathBuf,
    #[arg(long, num_args = 1.., required = true, help = "Key columns")]
    key: Vec<String>,
    #[arg(long, num_args = 1.., help = "Columns holding %Y-%m-%d dates")]
    date: Vec<String>,
    #[arg(long, num_args = 1.., help = "Columns holding integers")]
    int: Vec<String>,
}

impl MergeCommand {
    fn schema(&self, columns: &[String]) -> EpidataCliResult<StoreSchema> {
        let specs = columns
            .iter()
            .map(|name| {
                let kind = if self.date.contains(name) {
                    ColumnKind::Date
                } else if self.int.contains(name) {
                    ColumnKind::Int
                } else {
                    ColumnKind::Text
                };
                ColumnSpec::new(name, kind)
            })
            .collect();
        let key = NonEmpty::from_vec(self.key.clone()).ok_or_else(|| anyhow!("No key columns"))?;
        Ok(StoreSchema::new(specs, key)?)
    }
}

impl RunCommand for MergeCommand {
    async fn run(&self, _config: Config) -> EpidataCliResult<()> {
        info!("Running `merge` subcommand");
        let body = std::fs::read(&self.input)?;
        let new = read_csv_text(body, b',')?;
        let columns: Vec<String> = new
            .get_column_names()
            .iter()
            .map(|c| c.to_string())
            .collect();
        debug!("Input columns: {}", columns.iter().join(", "));
        let store = MergeStore::new(&self.store, self.schema(&columns)?);
        let outcome = store.update(new)?;
        display_outcome(&self.store.to_string_lossy(), &outcome);
        Ok(())
    }
}

/// Defines the output formats of the `geocode` command.
#[derive(Clone, Debug, Deserialize, Serialize, EnumString, PartialEq, Eq)]
#[strum(ascii_case_insensitive)]
pub enum GeocodeFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct GeocodeRow<'a> {
    name: &'a str,
    country: &'a str,
    resolved: Option<&'a Resolved>,
}

/// The `geocode` command shows how free-text region names resolve within a country.
#[derive(Args, Debug)]
pub struct GeocodeCommand {
    #[arg(value_name = "COUNTRY", help = "ISO 3166-1 alpha-2 country code")]
    country: String,
    #[arg(
        value_name = "NAMES",
        required = true,
        help = "Region names to resolve (or a .lst file)"
    )]
    names: Vec<String>,
    #[arg(
        short = 'f',
        long,
        value_name = "table|json",
        default_value = "table",
        help = "Output format for the results"
    )]
    output_format: GeocodeFormat,
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for GeocodeCommand {
    async fn run(&self, config: Config) -> EpidataCliResult<()> {
        info!("Running `geocode` subcommand");
        let epidata = Epidata::new_with_config(config)?;
        let sp = spinner(self.quiet, "Downloading the geocode table");
        let resolver = epidata.geocode_resolver().await?;
        stop(sp);

        let country = self.country.to_uppercase();
        let mut rows = vec![];
        for name in expand_lists(&self.names)? {
            let resolved = match resolver.resolve(&country, &name) {
                Ok(resolved) => resolved,
                Err(EpidataError::UnresolvedGeocode { .. }) => None,
                Err(err) => return Err(err.into()),
            };
            if resolved.is_none() {
                warn!("No geocode for '{name}' in {country}");
            }
            rows.push((name, resolved));
        }

        match self.output_format {
            GeocodeFormat::Table => display_geocodes(&country, &rows),
            GeocodeFormat::Json => {
                let rows: Vec<GeocodeRow> = rows
                    .iter()
                    .map(|(name, resolved)| GeocodeRow {
                        name,
                        country: &country,
                        resolved: resolved.as_ref(),
                    })
                    .collect();
                serde_json::to_writer_pretty(std::io::stdout().lock(), &rows)?;
                println!();
            }
        }
        Ok(())
    }
}

/// The entrypoint for the CLI.
#[derive(Parser, Debug)]
#[command(version, about="Epidata keeps flat-file stores of Latin American epidemiological data up to date", long_about = None, name="epidata")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    #[arg(
        short = 'q',
        long = "quiet",
        help = "\
            Do not print progress bar to stdout. Results and logs (when `RUST_LOG`\n\
            is set) will still be printed.",
        global = true
    )]
    quiet: bool,
    #[arg(
        short = 'c',
        long = "config",
        help = "Config file, <config dir>/epidata/config.toml when omitted",
        global = true
    )]
    pub config: Option<PathBuf>,
}

/// Commands contains the list of subcommands available for use in the CLI.
/// Each command should implement the RunCommand trait and specify the list
/// of required args for that command.
#[derive(Subcommand, Debug)]
#[enum_dispatch(RunCommand)]
pub enum Commands {
    /// Update subnational mortality from the national statistics offices
    Mortality(MortalityCommand),
    /// Update PAHO subnational cases and deaths, and their timelines
    Paho(PahoCommand),
    /// Rewrite the PAHO and UNICEF vaccine delivery snapshots
    Vaccines(VaccinesCommand),
    /// Download the photos of archived social-media posts
    Images(ImagesCommand),
    /// Merge a CSV file into a keyed store
    Merge(MergeCommand),
    /// Resolve region names to ISO 3166-2 codes
    Geocode(GeocodeCommand),
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use clap::CommandFactory;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn list_files_should_expand_in_place() {
        let dir = TempDir::new().unwrap();
        let list = dir.path().join("accounts.lst");
        std::fs::write(&list, "minsalud\n\n  msaludbo \n").unwrap();
        let args = vec![
            "first".to_string(),
            list.to_string_lossy().to_string(),
            "last".to_string(),
        ];
        assert_eq!(
            expand_lists(&args).unwrap(),
            vec!["first", "minsalud", "msaludbo", "last"]
        );
        assert!(expand_lists(&["missing.lst".to_string()]).is_err());
    }

    #[test]
    fn images_should_parse_the_platform() {
        let cli = Cli::try_parse_from(["epidata", "-q", "images", "Facebook", "a.json"]).unwrap();
        let Some(Commands::Images(cmd)) = cli.command else {
            panic!("expected the images command");
        };
        assert_eq!(cmd.platform, Platform::Facebook);
        assert_eq!(cmd.archives, vec!["a.json"]);
        assert!(cmd.quiet);
        assert!(Cli::try_parse_from(["epidata", "images", "myspace"]).is_err());
    }

    #[test]
    fn merge_should_require_a_key() {
        assert!(
            Cli::try_parse_from(["epidata", "merge", "--store", "s.csv", "--input", "i.csv"])
                .is_err()
        );
        let cli = Cli::try_parse_from([
            "epidata", "merge", "--store", "s.csv", "--input", "i.csv", "--key", "iso", "date",
            "--date", "date",
        ])
        .unwrap();
        let Some(Commands::Merge(cmd)) = cli.command else {
            panic!("expected the merge command");
        };
        assert_eq!(cmd.key, vec!["iso", "date"]);
        assert_eq!(cmd.date, vec!["date"]);
    }

    #[test]
    fn geocode_format_should_parse_case_insensitively() {
        assert_eq!(GeocodeFormat::from_str("JSON").unwrap(), GeocodeFormat::Json);
        assert!(GeocodeFormat::from_str("yaml").is_err());
    }

    #[tokio::test]
    async fn merge_command_should_keep_the_latest_row_per_key() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("store.csv");
        let input = dir.path().join("input.csv");
        std::fs::write(
            &store,
            "iso,date,deaths\nCL,2021-01-01,5\nCL,2021-01-02,7\n",
        )
        .unwrap();
        std::fs::write(&input, "iso,date,deaths\nCL,2021-01-02,8\nCL,2021-01-03,9\n").unwrap();

        let cmd = MergeCommand {
            store: store.clone(),
            input,
            key: vec!["iso".into(), "date".into()],
            date: vec!["date".into()],
            int: vec!["deaths".into()],
        };
        cmd.run(Config::default()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&store).unwrap(),
            "iso,date,deaths\nCL,2021-01-01,5\nCL,2021-01-02,8\nCL,2021-01-03,9\n"
        );
    }
}
