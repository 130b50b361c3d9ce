//! Embedding generation for hot posts.
//!
//! Posts whose current signal tag is hot get two text renderings,
//! caption-centric and performance-centric, embedded through an
//! OpenAI-compatible endpoint and stored keyed by `(subscriber, handle,
//! post_url, model, signal_type)`. Per-row failures are logged and
//! skipped; the pass never aborts on one bad post.

use crate::config::Config;
use crate::data::embeddings::{embedding_exists, list_signal_posts_for_embedding, upsert_post_embedding};
use crate::data::feeds::list_subscribers;
use crate::data::models::SignalPost;
use crate::error::Result;
use crate::util::sanitize_error;
use anyhow::{Context, anyhow};
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

pub const SIGNAL_VERSION: &str = "v1";

/// Minimal client for an OpenAI-compatible `/embeddings` endpoint.
#[derive(Debug, Clone)]
pub struct EmbeddingsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    site_url: String,
    app_name: String,
}

impl EmbeddingsClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create embeddings HTTP client")?;
        Ok(Self {
            client,
            base_url: config.embedding_base_url.trim_end_matches('/').to_string(),
            api_key: config.embedding_api_key.clone(),
            model: config.embedding_model.clone(),
            site_url: config.embedding_site_url.clone(),
            app_name: config.embedding_app_name.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embed one text. Router headers are only sent to routed providers.
    pub async fn get_embedding(&self, text: &str) -> Result<Vec<f64>> {
        if self.api_key.is_empty() {
            return Err(anyhow!("embedding API key is not configured"));
        }
        if text.trim().is_empty() {
            return Err(anyhow!("embedding text is empty"));
        }

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({"model": self.model, "input": text}));
        if self.base_url.contains("openrouter.ai") {
            if !self.site_url.is_empty() {
                request = request.header("HTTP-Referer", &self.site_url);
            }
            if !self.app_name.is_empty() {
                request = request.header("X-Title", &self.app_name);
            }
        }

        let body: serde_json::Value = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let embedding: Vec<f64> = body["data"][0]["embedding"]
            .as_array()
            .map(|arr| arr.iter().filter_map(serde_json::Value::as_f64).collect())
            .unwrap_or_default();
        if embedding.is_empty() {
            return Err(anyhow!("empty embedding response"));
        }
        Ok(embedding)
    }
}

/// The embeddable text variants for one signal row, keyed by signal type.
pub fn build_signal_texts(row: &SignalPost) -> HashMap<&'static str, String> {
    let handle = row.handle.as_str();
    let media_type = row.media_type.as_deref().unwrap_or("");
    let velocity_tag = row.velocity_tag.as_deref().unwrap_or("");
    let velocity_stage = row.velocity_stage.as_deref().unwrap_or("");
    let velocity_percentile = row.velocity_percentile.as_deref().unwrap_or("");

    let caption_text = format!(
        "handle: {handle}\nmedia_type: {media_type}\nvelocity_tag: {velocity_tag}\nvelocity_stage: {velocity_stage}\nvelocity_percentile: {velocity_percentile}\ncaption: {}",
        row.caption.as_deref().unwrap_or("")
    )
    .trim()
    .to_string();

    let performance_text = format!(
        "handle: {handle}\nmedia_type: {media_type}\nviews: {}\nlikes: {}\ncomments: {}\nvelocity_tag: {velocity_tag}\nvelocity_stage: {velocity_stage}\nvelocity_percentile: {velocity_percentile}",
        row.views, row.likes, row.comments
    )
    .trim()
    .to_string();

    HashMap::from([
        ("caption_semantic", caption_text),
        ("performance_semantic", performance_text),
    ])
}

/// Embed every not-yet-embedded hot post, per subscriber.
pub async fn run_embeddings(
    pool: &PgPool,
    config: &Config,
    subscriber_id: Option<i64>,
) -> Result<()> {
    let client = EmbeddingsClient::new(config)?;
    let tags = config.embed_only_tags();
    let signal_types = config.embed_signal_types();

    for sub in list_subscribers(pool)
        .await?
        .into_iter()
        .filter(|s| subscriber_id.is_none_or(|id| s.id == id))
    {
        let rows =
            list_signal_posts_for_embedding(pool, sub.id, &tags, config.embed_batch_limit).await?;
        let mut embedded = 0usize;

        for row in &rows {
            let texts = build_signal_texts(row);
            for signal_type in &signal_types {
                let Some(text) = texts.get(signal_type.as_str()) else {
                    continue;
                };
                let outcome = embed_one(pool, &client, row, signal_type, text).await;
                match outcome {
                    Ok(true) => embedded += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            handle = %row.handle,
                            post_url = %row.post_url,
                            signal_type = %signal_type,
                            error = %sanitize_error(&format!("{e:#}"), &config.embedding_api_key),
                            "embedding skipped"
                        );
                    }
                }
            }
        }
        info!(
            subscriber_id = sub.id,
            candidates = rows.len(),
            embedded,
            "embedding pass complete"
        );
    }
    Ok(())
}

async fn embed_one(
    pool: &PgPool,
    client: &EmbeddingsClient,
    row: &SignalPost,
    signal_type: &str,
    text: &str,
) -> Result<bool> {
    if embedding_exists(
        pool,
        row.subscriber_id,
        &row.handle,
        &row.post_url,
        client.model(),
        signal_type,
    )
    .await?
    {
        return Ok(false);
    }

    let embedding = client.get_embedding(text).await?;
    upsert_post_embedding(
        pool,
        row.subscriber_id,
        &row.handle,
        &row.post_url,
        client.model(),
        signal_type,
        SIGNAL_VERSION,
        json!({
            "velocity_tag": row.velocity_tag,
            "velocity_stage": row.velocity_stage,
            "velocity_percentile": row.velocity_percentile,
        }),
        text,
        &embedding,
    )
    .await?;
    Ok(true)
}
