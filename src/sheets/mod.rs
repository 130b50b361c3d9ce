//! Spreadsheet values API client.
//!
//! The projection layer (see [`projection`]) is written against the
//! [`SheetsApi`] trait; [`SheetsClient`] is the reqwest implementation
//! over the Google Sheets v4 values endpoints. The store remains the
//! source of truth: projection is one-directional.

pub mod projection;

use crate::config::Config;
use crate::error::Result;
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

/// One A1-range update in a batch write.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeUpdate {
    pub range: String,
    pub values: Vec<Vec<String>>,
}

#[async_trait]
pub trait SheetsApi: Send + Sync {
    /// Tab titles of the spreadsheet, in sheet order.
    async fn list_sheet_titles(&self, spreadsheet_id: &str) -> Result<Vec<String>>;

    /// Cell values for an A1 range; missing trailing cells are absent.
    async fn get_values(&self, spreadsheet_id: &str, range: &str) -> Result<Vec<Vec<String>>>;

    async fn update_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: Vec<Vec<String>>,
    ) -> Result<()>;

    async fn batch_update(&self, spreadsheet_id: &str, updates: Vec<RangeUpdate>) -> Result<()>;

    async fn append_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: Vec<Vec<String>>,
    ) -> Result<()>;

    async fn clear_values(&self, spreadsheet_id: &str, range: &str) -> Result<()>;

    /// Sort the data region (row 3 down) of one tab by a zero-based column.
    async fn sort_range(
        &self,
        spreadsheet_id: &str,
        sheet_title: &str,
        column_index: usize,
        column_count: usize,
        descending: bool,
    ) -> Result<()>;
}

/// Values-API client over HTTP.
#[derive(Debug, Clone)]
pub struct SheetsClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl SheetsClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create sheets HTTP client")?;
        Ok(Self {
            client,
            base_url: config.sheets_base_url.trim_end_matches('/').to_string(),
            token: config.sheets_token.clone(),
        })
    }

    fn url(&self, spreadsheet_id: &str, suffix: &str) -> String {
        format!("{}/{}{}", self.base_url, spreadsheet_id, suffix)
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn sheet_id_by_title(&self, spreadsheet_id: &str, title: &str) -> Result<Option<i64>> {
        let body = self
            .get_json(&self.url(spreadsheet_id, "?fields=sheets.properties"))
            .await?;
        let id = body["sheets"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|s| s["properties"]["title"].as_str() == Some(title))
            .and_then(|s| s["properties"]["sheetId"].as_i64());
        Ok(id)
    }
}

fn values_to_json(values: Vec<Vec<String>>) -> Value {
    json!(values)
}

fn json_to_values(body: &Value) -> Vec<Vec<String>> {
    body["values"]
        .as_array()
        .into_iter()
        .flatten()
        .map(|row| {
            row.as_array()
                .into_iter()
                .flatten()
                .map(|cell| match cell {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                })
                .collect()
        })
        .collect()
}

#[async_trait]
impl SheetsApi for SheetsClient {
    async fn list_sheet_titles(&self, spreadsheet_id: &str) -> Result<Vec<String>> {
        let body = self
            .get_json(&self.url(spreadsheet_id, "?fields=sheets.properties"))
            .await?;
        Ok(body["sheets"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|s| s["properties"]["title"].as_str())
            .map(str::to_string)
            .collect())
    }

    async fn get_values(&self, spreadsheet_id: &str, range: &str) -> Result<Vec<Vec<String>>> {
        let body = self
            .get_json(&self.url(spreadsheet_id, &format!("/values/{range}")))
            .await?;
        Ok(json_to_values(&body))
    }

    async fn update_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: Vec<Vec<String>>,
    ) -> Result<()> {
        let url = self.url(
            spreadsheet_id,
            &format!("/values/{range}?valueInputOption=USER_ENTERED"),
        );
        let body = json!({"range": range, "values": values_to_json(values)});
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        resp.error_for_status()?;
        Ok(())
    }

    async fn batch_update(&self, spreadsheet_id: &str, updates: Vec<RangeUpdate>) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let data: Vec<Value> = updates
            .into_iter()
            .map(|u| json!({"range": u.range, "values": values_to_json(u.values)}))
            .collect();
        let body = json!({"valueInputOption": "USER_ENTERED", "data": data});
        self.post_json(&self.url(spreadsheet_id, "/values:batchUpdate"), &body)
            .await?;
        Ok(())
    }

    async fn append_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: Vec<Vec<String>>,
    ) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let url = self.url(
            spreadsheet_id,
            &format!("/values/{range}:append?valueInputOption=USER_ENTERED"),
        );
        self.post_json(&url, &json!({"values": values_to_json(values)}))
            .await?;
        Ok(())
    }

    async fn clear_values(&self, spreadsheet_id: &str, range: &str) -> Result<()> {
        let url = self.url(spreadsheet_id, &format!("/values/{range}:clear"));
        self.post_json(&url, &json!({})).await?;
        Ok(())
    }

    async fn sort_range(
        &self,
        spreadsheet_id: &str,
        sheet_title: &str,
        column_index: usize,
        column_count: usize,
        descending: bool,
    ) -> Result<()> {
        let sheet_id = self
            .sheet_id_by_title(spreadsheet_id, sheet_title)
            .await?
            .ok_or_else(|| anyhow!("no sheet titled {sheet_title:?}"))?;
        let body = json!({
            "requests": [{
                "sortRange": {
                    "range": {
                        "sheetId": sheet_id,
                        "startRowIndex": 2,
                        "startColumnIndex": 0,
                        "endColumnIndex": column_count,
                    },
                    "sortSpecs": [{
                        "dimensionIndex": column_index,
                        "sortOrder": if descending { "DESCENDING" } else { "ASCENDING" },
                    }],
                }
            }]
        });
        self.post_json(&self.url(spreadsheet_id, ":batchUpdate"), &body)
            .await?;
        Ok(())
    }
}
