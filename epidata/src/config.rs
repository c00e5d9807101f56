use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fetch::RetryPolicy;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Root directory of every flat-file store.
    pub data_dir: PathBuf,
    pub geocode_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub download_workers: usize,
    pub download_attempts: u32,
    pub user_agent: String,
    /// When set, names missing from the geocode table are kept without a code instead of failing
    /// the source.
    pub allow_unresolved_geocodes: bool,
    /// Extra alias tables, keyed by country ISO code then by free-text alias.
    pub geocode_aliases: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./raw"),
            geocode_url: "https://raw.githubusercontent.com/esosedi/3166/master/data/iso3166-2.json"
                .into(),
            timeout_secs: 90,
            max_retries: 5,
            retry_delay_secs: 2,
            download_workers: 3,
            download_attempts: 3,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64)".into(),
            allow_unresolved_geocodes: false,
            geocode_aliases: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs(self.retry_delay_secs),
        }
    }
}
