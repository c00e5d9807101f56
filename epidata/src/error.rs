//! Error types.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum EpidataError {
    #[error("Wrapped anyhow error: {0}")]
    AnyhowError(#[from] anyhow::Error),
    #[error("Request to {url} failed after {attempts} attempt(s): {source}")]
    FetchExhausted {
        url: String,
        attempts: u32,
        #[source]
        source: Box<EpidataError>,
    },
    #[error("Request to {url} returned status {status}")]
    HttpStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("Unresolved geocode for '{name}' in {country}")]
    UnresolvedGeocode { country: String, name: String },
    #[error("Corrupt store at {path:?}: {source}")]
    CorruptStore {
        path: PathBuf,
        #[source]
        source: polars::error::PolarsError,
    },
    #[error("Invalid store schema: {0}")]
    InvalidSchema(String),
    #[error("Unexpected PowerBI response: {0}")]
    PowerBi(String),
    #[error("Wrapped polars error: {0}")]
    PolarsError(#[from] polars::error::PolarsError),
    #[error("Wrapped IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Wrapped JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type EpidataResult<T> = Result<T, EpidataError>;

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn test_anyhow() {
        let anyhow_error = anyhow!("An anyhow error");
        let epidata_error: EpidataError = anyhow_error.into();
        println!("{}", epidata_error);
    }

    #[test]
    fn unresolved_geocode_should_name_the_location() {
        let err = EpidataError::UnresolvedGeocode {
            country: "PY".into(),
            name: "Pte. Hayes".into(),
        };
        assert_eq!(err.to_string(), "Unresolved geocode for 'Pte. Hayes' in PY");
    }
}
