use anyhow::Result;
use log::debug;

use crate::config::Config;
use crate::fetch::Fetcher;
use crate::geocode::{GeocodeResolver, GeocodeTable};

// Re-exports
pub use column_names as COL;

// Modules
pub mod column_names;
pub mod config;
pub mod download;
pub mod error;
pub mod fetch;
pub mod formatters;
pub mod geocode;
pub mod posts;
pub mod powerbi;
pub mod sources;
pub mod store;
pub mod transform;
pub mod update;

/// Per-run context shared by every update job. Built once, then passed by reference.
pub struct Epidata {
    pub config: Config,
    pub fetcher: Fetcher,
}

impl Epidata {
    /// Setup the Epidata object with default configuration
    pub fn new() -> Result<Self> {
        Self::new_with_config(Config::default())
    }

    /// Setup the Epidata object with custom configuration
    pub fn new_with_config(config: Config) -> Result<Self> {
        debug!("config: {config:?}");
        let fetcher = Fetcher::new(&config)?;
        Ok(Self { config, fetcher })
    }

    /// Downloads the ISO 3166-2 reference table and builds a resolver with the built-in and
    /// configured alias tables.
    pub async fn geocode_resolver(&self) -> Result<GeocodeResolver> {
        let table = GeocodeTable::fetch(&self.fetcher, &self.config.geocode_url).await?;
        Ok(GeocodeResolver::from_config(table, &self.config))
    }
}
