//! Resolution of free-text administrative region names to ISO 3166-2 codes.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::config::Config;
use crate::error::{EpidataError, EpidataResult};
use crate::fetch::Fetcher;

const PREFIXES: [&str; 7] = [
    "departamento",
    "departament",
    "provincia",
    "province",
    "estado",
    "state",
    "region",
];

fn prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"\b(?:{})\b", PREFIXES.join("|"))).expect("static regex is valid")
    })
}

fn article_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ *(?:de|del|of) ").expect("static regex is valid"))
}

/// Case-fold, strip diacritics, drop administrative-level prefixes and a leading article.
///
/// ```
/// use epidata::geocode::normalize_name;
/// assert_eq!(normalize_name("Departamento de La Paz"), "la paz");
/// assert_eq!(normalize_name("Ñuble"), "nuble");
/// ```
pub fn normalize_name(name: &str) -> String {
    let ascii: String = name
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();
    let without_prefix = prefix_regex().replace_all(&ascii, "");
    let without_article = article_regex().replace(&without_prefix, "");
    without_article.split_whitespace().join(" ")
}

/// A first-level subdivision as it appears in the reference JSON.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Region {
    #[serde(default)]
    pub name: String,
    pub iso: String,
    #[serde(default)]
    pub names: BTreeMap<String, String>,
}

impl Region {
    /// The display name used when writing stores.
    pub fn canonical_name(&self) -> &str {
        self.names
            .get("geonames")
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.name)
    }

    fn all_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.canonical_name())
            .chain(self.names.values().map(String::as_str))
            .chain(std::iter::once(self.name.as_str()))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CountryEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub names: BTreeMap<String, String>,
    #[serde(default)]
    pub regions: Vec<Region>,
}

/// The parsed reference table: country ISO code to its subdivisions.
pub type ReferenceTable = BTreeMap<String, CountryEntry>;

fn names(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Fix subdivisions that are missing or misnamed upstream.
pub fn apply_patches(reference: &mut ReferenceTable) {
    if let Some(chile) = reference.get_mut("CL") {
        if !chile.regions.iter().any(|r| r.iso == "NB") {
            chile.regions.push(Region {
                name: "Ñuble Region".into(),
                iso: "NB".into(),
                names: names(&[("geonames", "Ñuble")]),
            });
        }
    }

    if let Some(caba) = reference
        .get_mut("AR")
        .and_then(|ar| ar.regions.iter_mut().find(|r| r.iso == "C"))
    {
        caba.names = names(&[
            ("geonames", "CABA"),
            ("es", "Ciudad Autonoma de Buenos Aires"),
            ("en", "Autonomous City of Buenos Aires"),
        ]);
    }

    if let Some(peru) = reference.get_mut("PE") {
        // Lima province goes last so that plain "lima" resolves to the region.
        if let Some(idx) = peru.regions.iter().position(|r| r.iso == "LMA") {
            let mut lima_province = peru.regions.remove(idx);
            lima_province.names = names(&[
                ("geonames", "Lima Metropolitana"),
                ("es", "Provincia de Lima"),
                ("en", "Lima Province"),
            ]);
            peru.regions.push(lima_province);
        }
        if let Some(lima_region) = peru.regions.iter_mut().find(|r| r.iso == "LIM") {
            lima_region
                .names
                .insert("geonames".into(), "Lima".into());
        }
    }
}

/// Flattened name lookup built once per run.
#[derive(Clone, Debug, Default)]
pub struct GeocodeTable {
    /// (country, normalized name) -> ISO 3166-2 code
    lookup: HashMap<(String, String), String>,
    /// ISO 3166-2 code -> canonical display name
    canonical: HashMap<String, String>,
}

impl GeocodeTable {
    pub async fn fetch(fetcher: &Fetcher, url: &str) -> Result<Self> {
        info!("Loading geocodes from {url}");
        let body = fetcher.get_bytes(url).await?;
        Self::from_json(&body).with_context(|| format!("Failed to parse geocodes from {url}"))
    }

    pub fn from_json(body: &[u8]) -> EpidataResult<Self> {
        let mut reference: ReferenceTable = serde_json::from_slice(body)?;
        apply_patches(&mut reference);
        Ok(Self::from_reference(&reference))
    }

    pub fn from_reference(reference: &ReferenceTable) -> Self {
        let mut table = Self::default();
        for (country, entry) in reference {
            for region in &entry.regions {
                let code = format!("{country}-{}", region.iso);
                table
                    .canonical
                    .entry(code.clone())
                    .or_insert_with(|| region.canonical_name().to_string());
                for name in region.all_names() {
                    let cleaned = normalize_name(name);
                    if cleaned.is_empty() {
                        continue;
                    }
                    table
                        .lookup
                        .entry((country.clone(), cleaned))
                        .or_insert_with(|| code.clone());
                }
            }
        }
        debug!(
            "Geocode table with {} names for {} subdivisions",
            table.lookup.len(),
            table.canonical.len()
        );
        table
    }

    pub fn get(&self, country: &str, cleaned_name: &str) -> Option<&str> {
        self.lookup
            .get(&(country.to_string(), cleaned_name.to_string()))
            .map(String::as_str)
    }

    pub fn canonical_name(&self, code: &str) -> Option<&str> {
        self.canonical.get(code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }
}

/// What to do with a name that is neither in the table nor in the alias table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnresolvedPolicy {
    #[default]
    Fail,
    Allow,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Resolved {
    pub code: String,
    pub name: String,
}

/// Built-in alias tables for names the mortality sources are known to spell differently.
pub fn builtin_aliases() -> BTreeMap<String, BTreeMap<String, String>> {
    let table: [(&str, &[(&str, &str)]); 3] = [
        (
            "EC",
            &[("sto. domingo tsachilas", "santo domingo de los tsachilas")],
        ),
        (
            "PY",
            &[("pte. hayes", "presidente hayes"), ("capital", "asuncion")],
        ),
        ("BO", &[("el beni", "beni")]),
    ];
    table
        .into_iter()
        .map(|(country, pairs)| (country.to_string(), names(pairs)))
        .collect()
}

/// Immutable resolver passed by reference to every source needing geocodes.
#[derive(Clone, Debug)]
pub struct GeocodeResolver {
    table: GeocodeTable,
    aliases: HashMap<(String, String), String>,
    policy: UnresolvedPolicy,
}

impl GeocodeResolver {
    pub fn new(table: GeocodeTable, policy: UnresolvedPolicy) -> Self {
        let mut resolver = Self {
            table,
            aliases: HashMap::new(),
            policy,
        };
        resolver.add_aliases(&builtin_aliases());
        resolver
    }

    pub fn from_config(table: GeocodeTable, config: &Config) -> Self {
        let policy = if config.allow_unresolved_geocodes {
            UnresolvedPolicy::Allow
        } else {
            UnresolvedPolicy::Fail
        };
        let mut resolver = Self::new(table, policy);
        resolver.add_aliases(&config.geocode_aliases);
        resolver
    }

    /// Alias keys and targets are normalized, so tables can be written with any casing.
    pub fn add_aliases(&mut self, aliases: &BTreeMap<String, BTreeMap<String, String>>) {
        for (country, pairs) in aliases {
            for (alias, target) in pairs {
                self.aliases.insert(
                    (country.to_uppercase(), normalize_name(alias)),
                    normalize_name(target),
                );
            }
        }
    }

    pub fn policy(&self) -> UnresolvedPolicy {
        self.policy
    }

    pub fn table(&self) -> &GeocodeTable {
        &self.table
    }

    fn lookup(&self, country: &str, name: &str) -> Option<Resolved> {
        let cleaned = normalize_name(name);
        let code = self.table.get(country, &cleaned).or_else(|| {
            self.aliases
                .get(&(country.to_string(), cleaned.clone()))
                .and_then(|target| self.table.get(country, target))
        })?;
        Some(Resolved {
            code: code.to_string(),
            name: self
                .table
                .canonical_name(code)
                .unwrap_or(name)
                .to_string(),
        })
    }

    /// Resolve a name within a country. Under `UnresolvedPolicy::Allow` a miss is `Ok(None)`.
    pub fn resolve(&self, country: &str, name: &str) -> EpidataResult<Option<Resolved>> {
        let country = country.to_uppercase();
        match self.lookup(&country, name) {
            Some(resolved) => Ok(Some(resolved)),
            None if self.policy == UnresolvedPolicy::Allow => {
                warn!("Leaving '{name}' in {country} without a geocode");
                Ok(None)
            }
            None => Err(EpidataError::UnresolvedGeocode {
                country,
                name: name.to_string(),
            }),
        }
    }
}
