//! Bounded-concurrency batch downloads of byte blobs (post images).

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{stream, StreamExt};
use log::{debug, info, warn};

use crate::config::Config;
use crate::error::EpidataResult;
use crate::fetch::{Fetcher, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub url: String,
    pub dest: PathBuf,
}

/// The downloads belonging to one source record, in artifact order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordJobs {
    pub record: String,
    pub jobs: Vec<DownloadJob>,
}

impl RecordJobs {
    /// A record counts as downloaded when its first artifact is on disk. A partial earlier run
    /// can leave later artifacts missing; those are not refetched.
    pub fn already_downloaded(&self) -> bool {
        self.jobs.first().is_some_and(|job| job.dest.exists())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReport {
    pub downloaded: usize,
    pub failed: usize,
    /// Jobs not attempted because their record was already downloaded
    pub skipped: usize,
}

/// Split records into the jobs still to run and the number of jobs skipped.
pub fn pending(records: Vec<RecordJobs>) -> (Vec<DownloadJob>, usize) {
    let mut skipped = 0;
    let mut jobs = vec![];
    for record in records {
        if record.already_downloaded() {
            debug!("Skipping {}: already downloaded", record.record);
            skipped += record.jobs.len();
            continue;
        }
        jobs.extend(record.jobs);
    }
    (jobs, skipped)
}

/// Run `job` over every item with at most `workers` in flight, in completion order.
pub async fn bounded<T, F, Fut>(items: Vec<T>, workers: usize, job: F) -> Vec<bool>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = bool>,
{
    stream::iter(items)
        .map(job)
        .buffer_unordered(workers.max(1))
        .collect()
        .await
}

pub struct Downloader {
    fetcher: Fetcher,
    workers: usize,
    attempts: u32,
}

impl Downloader {
    pub fn new(fetcher: &Fetcher, config: &Config) -> Self {
        Self::with_limits(
            fetcher.clone(),
            config.download_workers,
            config.download_attempts,
        )
    }

    /// Each job is tried up to `attempts` times whatever the failure, with no delay in between.
    pub fn with_limits(fetcher: Fetcher, workers: usize, attempts: u32) -> Self {
        Self {
            fetcher: fetcher.with_retry_policy(RetryPolicy {
                max_retries: 0,
                base_delay: Duration::ZERO,
            }),
            workers: workers.max(1),
            attempts: attempts.max(1),
        }
    }

    /// Download every pending job with at most `workers` in flight. A job that still fails
    /// after its attempts is logged and counted; it never stops the batch.
    pub async fn run(&self, records: Vec<RecordJobs>) -> DownloadReport {
        let (jobs, skipped) = pending(records);
        info!(
            "Downloading {} file(s) with {} worker(s), {skipped} skipped",
            jobs.len(),
            self.workers
        );
        let results = bounded(jobs, self.workers, move |job| async move {
            match self.download(&job).await {
                Ok(()) => true,
                Err(err) => {
                    warn!("Failed to download {} to {:?}: {err}", job.url, job.dest);
                    false
                }
            }
        })
        .await;
        let downloaded = results.iter().filter(|ok| **ok).count();
        DownloadReport {
            downloaded,
            failed: results.len() - downloaded,
            skipped,
        }
    }

    async fn download(&self, job: &DownloadJob) -> EpidataResult<()> {
        let mut attempt = 1;
        loop {
            match self.try_download(job).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.attempts => {
                    debug!("Attempt {attempt}/{} for {} failed: {err}", self.attempts, job.url);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_download(&self, job: &DownloadJob) -> EpidataResult<()> {
        let bytes = self.fetcher.get_bytes(&job.url).await?;
        if let Some(parent) = job.dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_file(&job.dest, &bytes).await
    }
}

async fn write_file(dest: &Path, bytes: &[u8]) -> EpidataResult<()> {
    tokio::fs::write(dest, bytes).await?;
    debug!("Saved {:?} ({} bytes)", dest, bytes.len());
    Ok(())
}
