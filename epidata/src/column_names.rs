//! This module stores the column names of every store written by the update jobs. Note that these
//! must stay in sync with the files already on disk, since renaming a column makes the existing
//! store unreadable!

pub const ISO_CODE: &str = "iso_code";
pub const COUNTRY_NAME: &str = "country_name";
pub const ADM1_ISOCODE: &str = "adm1_isocode";
pub const ADM1_NAME: &str = "adm1_name";
pub const FREQUENCY: &str = "frequency";
pub const DATE: &str = "date";
pub const DEATHS: &str = "deaths";

pub const ISO3_CODE: &str = "iso3_code";
pub const TOTAL_CASES: &str = "total_cases";
pub const TOTAL_DEATHS: &str = "total_deaths";

/// Raw column names of the PAHO ArcGIS export.
pub mod paho {
    pub const OBJECTID: &str = "OBJECTID";
    pub const ISO3_CODE: &str = "ISO3_CODE";
    pub const ADM1_ISOCODE: &str = "ADM1_ISOCODE";
    pub const DATA_DATE: &str = "DATA_DATE";
    pub const TOTAL_CASES: &str = "TOTAL_CASES";
    pub const TOTAL_DEATHS: &str = "TOTAL_DEATHS";
}
