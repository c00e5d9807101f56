//! Error boundary around each per-source update. A failing source is logged and contributes
//! nothing; its siblings in the same run carry on.

use std::future::Future;

use log::{error, info};

/// Names of the sources that succeeded or failed during a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl UpdateReport {
    /// Record the result of one source, returning its value on success.
    pub fn record<T>(&mut self, name: &str, result: anyhow::Result<T>) -> Option<T> {
        match result {
            Ok(value) => {
                info!("{name}: done");
                self.succeeded.push(name.to_string());
                Some(value)
            }
            Err(err) => {
                error!("{name}: {err:#}");
                self.failed.push((name.to_string(), format!("{err:#}")));
                None
            }
        }
    }

    /// Run one source inside the boundary.
    pub async fn run<T, F, Fut>(&mut self, name: &str, job: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        info!("{name}: updating");
        let result = job().await;
        self.record(name, result)
    }

    pub fn merge(&mut self, other: UpdateReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use anyhow::Context;
    use nonempty::nonempty;
    use polars::prelude::*;
    use tempfile::TempDir;

    use super::*;
    use crate::store::{ColumnSpec, MergeOutcome, MergeStore, StoreSchema};

    fn parse(body: &str) -> anyhow::Result<DataFrame> {
        let raw = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(0))
            .into_reader_with_file_handle(Cursor::new(body.as_bytes().to_vec()))
            .finish()?;
        let df = raw
            .lazy()
            .with_column(col("deaths").strict_cast(DataType::Int64))
            .collect()
            .context("deaths must be integers")?;
        Ok(df)
    }

    fn store(dir: &TempDir, name: &str) -> MergeStore {
        let schema = StoreSchema::new(
            vec![ColumnSpec::text("adm1_name"), ColumnSpec::int("deaths")],
            nonempty!["adm1_name".to_string()],
        )
        .unwrap();
        MergeStore::new(dir.path().join(name), schema)
    }

    #[tokio::test]
    async fn a_failing_source_should_not_block_its_siblings() {
        let dir = TempDir::new().unwrap();
        let broken = store(&dir, "broken.csv");
        let healthy = store(&dir, "healthy.csv");
        let mut report = UpdateReport::default();
        let (broken_store, healthy_store) = (&broken, &healthy);

        let outcome = report
            .run("broken", || async move {
                let df = parse("adm1_name,deaths\nLa Paz,many\n")?;
                Ok::<_, anyhow::Error>(broken_store.update(df)?)
            })
            .await;
        assert_eq!(outcome, None);

        let outcome = report
            .run("healthy", || async move {
                let df = parse("adm1_name,deaths\nLa Paz,4\n")?;
                Ok::<_, anyhow::Error>(healthy_store.update(df)?)
            })
            .await;
        assert_eq!(outcome, Some(MergeOutcome::Written { rows: 1 }));

        assert!(!broken.path().exists());
        assert!(healthy.path().exists());
        assert_eq!(report.succeeded, vec!["healthy".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("deaths must be integers"));
        assert!(!report.is_success());
    }

    #[test]
    fn record_should_keep_values() {
        let mut report = UpdateReport::default();
        assert_eq!(report.record("a", Ok(3)), Some(3));
        let failed: Option<i32> = report.record("b", Err(anyhow::anyhow!("boom")));
        assert_eq!(failed, None);
        let mut total = UpdateReport::default();
        total.merge(report);
        assert_eq!(total.succeeded, vec!["a".to_string()]);
        assert_eq!(total.failed, vec![("b".to_string(), "boom".to_string())]);
    }
}
