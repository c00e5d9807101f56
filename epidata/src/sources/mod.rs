//! Update jobs, one module per family of sources. Each job fetches, reshapes through a
//! `Pipeline` and merges into its store.

use std::io::Cursor;

use log::debug;
use polars::prelude::*;

pub mod mortality;
pub mod paho;
pub mod vaccines;

/// Parse a CSV body with every column read as text. Typing is left to the pipelines.
pub fn read_csv_text(body: Vec<u8>, separator: u8) -> PolarsResult<DataFrame> {
    read_csv_text_after(body, separator, 0)
}

/// Like `read_csv_text`, with the header on line `skip_rows` (0-based). A body that is not
/// UTF-8 is read as Latin-1.
pub fn read_csv_text_after(
    body: Vec<u8>,
    separator: u8,
    skip_rows: usize,
) -> PolarsResult<DataFrame> {
    let body = match String::from_utf8(body) {
        Ok(text) => text.into_bytes(),
        Err(err) => {
            debug!("Body is not UTF-8, reading it as Latin-1");
            let latin1: String = err.into_bytes().iter().map(|&b| char::from(b)).collect();
            latin1.into_bytes()
        }
    };
    CsvReadOptions::default()
        .with_has_header(true)
        .with_skip_rows(skip_rows)
        .with_infer_schema_length(Some(0))
        .with_parse_options(CsvParseOptions::default().with_separator(separator))
        .into_reader_with_file_handle(Cursor::new(body))
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_should_be_read_as_text() {
        let df = read_csv_text(b"a;b\n1;x\n2;\n".to_vec(), b';').unwrap();
        assert_eq!(df.shape(), (2, 2));
        assert_eq!(df.column("a").unwrap().dtype(), &DataType::String);
        assert_eq!(df.column("b").unwrap().null_count(), 1);
    }

    #[test]
    fn latin1_bodies_should_be_decoded() {
        let body: Vec<u8> = "title;;\nN\u{ba};DEPARTAMENTO;FECHA\n1;HU\u{c1}NUCO;2021-01-01\n"
            .chars()
            .map(|c| c as u8)
            .collect();
        assert!(String::from_utf8(body.clone()).is_err());
        let df = read_csv_text_after(body, b';', 1).unwrap();
        assert_eq!(df.get_column_names(), vec!["Nº", "DEPARTAMENTO", "FECHA"]);
        assert_eq!(
            df.column("DEPARTAMENTO").unwrap().str().unwrap().get(0),
            Some("HUÁNUCO")
        );
    }
}
