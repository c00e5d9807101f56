//! Retry-bounded HTTP requests.

use std::time::Duration;

use log::{debug, error, warn};
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;

use crate::config::Config;
use crate::error::{EpidataError, EpidataResult};

/// Bounded retry with a linearly increasing delay.
///
/// A request is attempted at most `max_retries + 1` times. After the failed attempt with index `n`
/// (starting at zero) the fetcher sleeps `n * base_delay`, so the first retry is immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Config::default().retry_policy()
    }
}

/// Why a single attempt failed, before the retry decision is made.
enum Failure {
    Transient(EpidataError),
    Fatal(EpidataError),
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(config: &Config) -> EpidataResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()?;
        Ok(Self::with_policy(client, config.retry_policy()))
    }

    pub fn with_policy(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Same client, different retry policy.
    pub fn with_retry_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            client: self.client.clone(),
            policy,
        }
    }

    pub async fn get_bytes(&self, url: &str) -> EpidataResult<Vec<u8>> {
        self.send(url, || self.client.get(url)).await
    }

    pub async fn get_text(&self, url: &str) -> EpidataResult<String> {
        let bytes = self.get_bytes(url).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// POST a form-encoded body.
    pub async fn post_form(&self, url: &str, form: &[(String, String)]) -> EpidataResult<Vec<u8>> {
        self.send(url, || self.client.post(url).form(form)).await
    }

    /// POST a JSON body with extra headers and decode the JSON response.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &HeaderMap,
    ) -> EpidataResult<serde_json::Value> {
        let bytes = self
            .send(url, || self.client.post(url).headers(headers.clone()).json(body))
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn send<F>(&self, url: &str, build: F) -> EpidataResult<Vec<u8>>
    where
        F: Fn() -> RequestBuilder,
    {
        let attempts = self.policy.attempts();
        let mut attempt = 0;
        loop {
            debug!("Requesting {url} (attempt {}/{attempts})", attempt + 1);
            let err = match self.try_once(url, build()).await {
                Ok(bytes) => return Ok(bytes),
                Err(Failure::Fatal(err)) => {
                    error!("{err}");
                    return Err(err);
                }
                Err(Failure::Transient(err)) => err,
            };
            if attempt + 1 >= attempts {
                let err = EpidataError::FetchExhausted {
                    url: url.to_string(),
                    attempts,
                    source: Box::new(err),
                };
                error!("{err}");
                return Err(err);
            }
            warn!("Attempt {}/{attempts} for {url} failed: {err}", attempt + 1);
            tokio::time::sleep(self.policy.delay_after(attempt)).await;
            attempt += 1;
        }
    }

    async fn try_once(&self, url: &str, request: RequestBuilder) -> Result<Vec<u8>, Failure> {
        let transport = |err: reqwest::Error| Failure::Transient(err.into());
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let err = EpidataError::HttpStatus {
                url: url.to_string(),
                status,
            };
            return Err(if is_transient_status(status) {
                Failure::Transient(err)
            } else {
                Failure::Fatal(err)
            });
        }
        let bytes = response.bytes().await.map_err(transport)?;
        Ok(bytes.to_vec())
    }
}
