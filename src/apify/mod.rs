//! Scraping provider client.
//!
//! The provider is an opaque actor API: fire a run with a JSON input,
//! poll the run until it reaches a terminal status, then fetch the
//! dataset items. Inputs are built from configured JSON templates with
//! `{handle}` and `{post_url}` placeholders.

pub mod normalize;

use crate::config::Config;
use crate::error::Result;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const API_BASE: &str = "https://api.apify.com/v2";

/// Errors surfaced by the provider client.
///
/// The worker classifies these to drive retry/backoff and the circuit
/// breaker; everything here is a transient-or-protocol upstream failure.
#[derive(Debug, thiserror::Error)]
pub enum ApifyError {
    #[error("actor run timed out after {0:?}")]
    Timeout(Duration),
    #[error("actor run finished with status {0}")]
    RunFailed(String),
    #[error("provider protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// The four configured input template shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryShape {
    Daily,
    Weekly,
    Details,
    PostUrl,
}

/// Provider API client. One instance per process; calls are sequential.
#[derive(Debug)]
pub struct ApifyClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    actor_id: String,
    run_timeout: Duration,
    poll_interval: Duration,
    max_items: i64,
    template_daily: String,
    template_weekly: String,
    template_details: String,
    template_post_url: String,
}

impl ApifyClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .tcp_keepalive(Some(Duration::from_secs(60 * 5)))
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            base_url: API_BASE.to_string(),
            token: config.apify_token.clone(),
            actor_id: config.apify_actor_id.clone(),
            run_timeout: config.apify_run_timeout,
            poll_interval: config.apify_poll_interval,
            max_items: config.apify_max_items,
            template_daily: config.apify_input_template_daily.clone(),
            template_weekly: config.apify_input_template_weekly().to_string(),
            template_details: config.apify_input_template_details.clone(),
            template_post_url: config.apify_input_template_post_url.clone(),
        })
    }

    fn template(&self, shape: QueryShape) -> &str {
        match shape {
            QueryShape::Daily => &self.template_daily,
            QueryShape::Weekly => &self.template_weekly,
            QueryShape::Details => &self.template_details,
            QueryShape::PostUrl => &self.template_post_url,
        }
    }

    /// Substitute placeholders and parse the configured template.
    fn build_input(
        &self,
        shape: QueryShape,
        handle: &str,
        post_url: Option<&str>,
    ) -> std::result::Result<Value, ApifyError> {
        let payload = self
            .template(shape)
            .replace("{handle}", handle)
            .replace("{post_url}", post_url.unwrap_or(""));
        let mut input: Value = serde_json::from_str(&payload)
            .map_err(|e| ApifyError::Protocol(format!("input template is not valid JSON: {e}")))?;
        if let Some(obj) = input.as_object_mut()
            && !obj.contains_key("resultsLimit")
        {
            obj.insert("resultsLimit".to_string(), Value::from(self.max_items));
        }
        Ok(input)
    }

    /// Run the actor for a handle with the given template shape.
    pub async fn run(
        &self,
        handle: &str,
        shape: QueryShape,
    ) -> std::result::Result<Vec<Value>, ApifyError> {
        let input = self.build_input(shape, handle, None)?;
        self.run_payload(input).await
    }

    /// Batched variant: one run covering up to N post URLs.
    ///
    /// Rewrites the post_url template's `directUrls` array and raises
    /// `resultsLimit` to cover the batch.
    pub async fn run_post_urls(
        &self,
        handle: &str,
        post_urls: &[String],
    ) -> std::result::Result<Vec<Value>, ApifyError> {
        let urls: Vec<&str> = post_urls
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .collect();
        if urls.is_empty() {
            return Ok(Vec::new());
        }

        let mut input = self.build_input(QueryShape::PostUrl, handle, Some(urls[0]))?;
        if let Some(obj) = input.as_object_mut() {
            obj.insert("directUrls".to_string(), Value::from(urls.clone()));
            let current = obj.get("resultsLimit").and_then(Value::as_i64).unwrap_or(0);
            obj.insert(
                "resultsLimit".to_string(),
                Value::from(current.max(urls.len() as i64)),
            );
        }
        self.run_payload(input).await
    }

    /// Profile details for a handle: first item of a details-shape run.
    pub async fn run_details(&self, handle: &str) -> std::result::Result<Value, ApifyError> {
        let items = self.run(handle, QueryShape::Details).await?;
        Ok(items.into_iter().next().unwrap_or(Value::Null))
    }

    /// Fire, poll to terminal status, fetch dataset items.
    async fn run_payload(&self, input: Value) -> std::result::Result<Vec<Value>, ApifyError> {
        let run_url = format!(
            "{}/acts/{}/runs?token={}",
            self.base_url, self.actor_id, self.token
        );
        let resp = self
            .client
            .post(&run_url)
            .json(&input)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;
        let run_id = body
            .pointer("/data/id")
            .and_then(Value::as_str)
            .ok_or_else(|| ApifyError::Protocol("run did not return a run id".to_string()))?
            .to_string();

        debug!(run_id = %run_id, "actor run started");

        let start = Instant::now();
        let mut last: Value;
        loop {
            if start.elapsed() > self.run_timeout {
                return Err(ApifyError::Timeout(self.run_timeout));
            }
            tokio::time::sleep(self.poll_interval).await;

            let check_url = format!(
                "{}/actor-runs/{}?token={}",
                self.base_url, run_id, self.token
            );
            last = self
                .client
                .get(&check_url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            let status = last
                .pointer("/data/status")
                .and_then(Value::as_str)
                .unwrap_or("");
            if status != "RUNNING" && status != "READY" {
                if status != "SUCCEEDED" {
                    return Err(ApifyError::RunFailed(status.to_string()));
                }
                break;
            }
        }

        let dataset_id = last
            .pointer("/data/defaultDatasetId")
            .and_then(Value::as_str)
            .ok_or_else(|| ApifyError::Protocol("run is missing a dataset id".to_string()))?;

        let items_url = format!(
            "{}/datasets/{}/items?clean=true&format=json",
            self.base_url, dataset_id
        );
        let items: Value = self
            .client
            .get(&items_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match items {
            Value::Array(list) => Ok(list),
            other => Ok(vec![other]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        use figment::{Figment, providers::Serialized};
        Figment::new()
            .merge(Serialized::defaults(serde_json::json!({
                "database_url": "postgres://localhost/feedpulse_test",
                "spreadsheet_id": "sheet-1",
                "apify_token": "tok",
                "apify_actor_id": "actor",
            })))
            .extract()
            .expect("test config")
    }

    #[test]
    fn build_input_substitutes_handle() {
        let client = ApifyClient::new(&test_config()).unwrap();
        let input = client
            .build_input(QueryShape::Daily, "acme", None)
            .unwrap();
        let urls = input["directUrls"].as_array().unwrap();
        assert_eq!(urls[0].as_str().unwrap(), "https://www.instagram.com/acme/");
        assert_eq!(input["resultsLimit"].as_i64(), Some(100));
    }

    #[test]
    fn build_input_substitutes_post_url() {
        let client = ApifyClient::new(&test_config()).unwrap();
        let input = client
            .build_input(
                QueryShape::PostUrl,
                "acme",
                Some("https://www.instagram.com/p/abc/"),
            )
            .unwrap();
        let urls = input["directUrls"].as_array().unwrap();
        assert_eq!(
            urls[0].as_str().unwrap(),
            "https://www.instagram.com/p/abc/"
        );
    }
}
