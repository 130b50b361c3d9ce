//! Queue worker: drains the handle queue, then the post checkpoint queue.
//!
//! One worker processes one job (or one post batch) at a time; horizontal
//! scaling is by process count. The provider circuit breaker is consulted
//! before any work is consumed, and jobs bounced by an active cooldown
//! are retried at the pause boundary without spending an attempt.

use crate::apify::{ApifyClient, ApifyError};
use crate::config::Config;
use crate::data::models::{Checkpoint, HandleJob, PostJob};
use crate::data::{feeds, health, posts, queue};
use crate::error::Result;
use crate::sheets::SheetsApi;
use crate::sync::{SyncContext, sync_handle, sync_post_checkpoint_batch};
use crate::util::sanitize_error;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn};

const COOLDOWN_MESSAGE: &str = "provider cooldown active";
const MISSING_IN_BATCH_MESSAGE: &str = "post missing in batch result";
const D21_GATE_MESSAGE: &str = "D7 not hot; D21 skipped by gate";

pub struct Worker {
    pool: PgPool,
    apify: Arc<ApifyClient>,
    sheets: Arc<dyn SheetsApi>,
    config: Config,
}

impl Worker {
    pub fn new(
        pool: PgPool,
        apify: Arc<ApifyClient>,
        sheets: Arc<dyn SheetsApi>,
        config: Config,
    ) -> Self {
        Self {
            pool,
            apify,
            sheets,
            config,
        }
    }

    fn sync_context(&self) -> SyncContext<'_> {
        SyncContext {
            pool: &self.pool,
            apify: self.apify.as_ref(),
            sheets: self.sheets.as_ref(),
            config: &self.config,
        }
    }

    /// Runs the worker's main loop. Never returns under normal operation.
    pub async fn run(&self) -> Result<()> {
        info!("worker started");
        loop {
            if let Err(e) = self.tick().await {
                // Wait before retrying to avoid spamming errors.
                warn!(error = ?e, "worker iteration failed");
                time::sleep(Duration::from_secs(10)).await;
            }
        }
    }

    /// One scheduling round: the handle queue takes precedence, the post
    /// queue is drained in same-key batches when the handle queue is idle.
    async fn tick(&self) -> Result<()> {
        let pause_until = health::get_pause_until(&self.pool).await?;

        if let Some(job) = queue::fetch_next_handle_job(&self.pool).await? {
            self.process_handle_job(job, pause_until).await;
            time::sleep(Duration::from_secs(1)).await;
            return Ok(());
        }

        let jobs =
            queue::fetch_next_post_job_batch(&self.pool, self.config.post_batch_size).await?;
        if jobs.is_empty() {
            time::sleep(Duration::from_secs(5)).await;
            return Ok(());
        }
        self.process_post_batch(jobs, pause_until).await;
        time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    fn sanitized(&self, err: &anyhow::Error) -> String {
        sanitize_error(&format!("{err:#}"), &self.config.apify_token)
    }

    async fn process_handle_job(&self, job: HandleJob, pause_until: Option<DateTime<Utc>>) {
        let spreadsheet_id = job.spreadsheet_id.clone().unwrap_or_default();
        let run_log_id = match posts::log_run_start(
            &self.pool,
            job.subscriber_id,
            &spreadsheet_id,
            &job.handle,
            &job.run_type,
        )
        .await
        {
            Ok(id) => id,
            Err(e) => {
                error!(job_id = job.id, error = ?e, "failed to open run log");
                return;
            }
        };

        // Respect the provider cooldown without consuming retries.
        if let Some(pause) = pause_until
            && pause > Utc::now()
        {
            debug!(job_id = job.id, pause_until = %pause, "cooldown active, parking handle job");
            if let Err(e) =
                queue::mark_handle_job_retry(&self.pool, job.id, job.attempt, pause, COOLDOWN_MESSAGE)
                    .await
            {
                error!(job_id = job.id, error = ?e, "failed to park job for cooldown");
            }
            let _ = posts::log_run_finish(
                &self.pool,
                run_log_id,
                "retry",
                0,
                0,
                0,
                Some(COOLDOWN_MESSAGE),
            )
            .await;
            return;
        }

        let ctx = self.sync_context();
        let result = sync_handle(
            &ctx,
            job.subscriber_id,
            &spreadsheet_id,
            &job.handle,
            &job.handle,
            &job.run_type,
        )
        .await;

        match result {
            Ok(outcome) => {
                let finish = async {
                    health::record_success(&self.pool).await?;
                    posts::upsert_handle_state(
                        &self.pool,
                        job.subscriber_id,
                        &job.handle,
                        &job.handle,
                        "success",
                        outcome.latest_post_url.as_deref(),
                        None,
                    )
                    .await?;
                    queue::mark_handle_job_success(&self.pool, job.id).await?;
                    posts::log_run_finish(
                        &self.pool,
                        run_log_id,
                        "success",
                        outcome.items_returned as i32,
                        outcome.inserted as i32,
                        outcome.updated as i32,
                        None,
                    )
                    .await?;
                    if let Some(feed) =
                        feeds::get_feed_by_subscriber(&self.pool, job.subscriber_id).await?
                    {
                        feeds::refresh_feeder_pair_metrics(&self.pool, feed.id, 30).await?;
                    }
                    Ok::<_, anyhow::Error>(())
                };
                if let Err(e) = finish.await {
                    error!(job_id = job.id, error = ?e, "failed to finalize handle job");
                }
            }
            Err(e) => {
                if e.downcast_ref::<ApifyError>().is_some() {
                    warn!(job_id = job.id, handle = %job.handle, error = %e, "provider call failed");
                } else {
                    error!(job_id = job.id, handle = %job.handle, error = ?e, "handle sync failed");
                }
                let safe_error = self.sanitized(&e);
                if let Err(e) = self.fail_handle_job(&job, run_log_id, &safe_error).await {
                    error!(job_id = job.id, error = ?e, "failed to record handle job failure");
                }
            }
        }
    }

    async fn fail_handle_job(
        &self,
        job: &HandleJob,
        run_log_id: i64,
        safe_error: &str,
    ) -> Result<()> {
        let (_, new_pause) = health::record_failure(
            &self.pool,
            safe_error,
            self.config.apify_cooldown_trigger_failures,
            self.config.apify_cooldown_hours,
        )
        .await?;

        let backoff = self.config.retry_backoff();
        let attempt = job.attempt + 1;
        if attempt as usize <= backoff.len() {
            let mut next_time = queue::next_retry_at(&backoff, attempt);
            if let Some(pause) = new_pause
                && pause > next_time
            {
                next_time = pause;
            }
            queue::mark_handle_job_retry(&self.pool, job.id, attempt, next_time, safe_error)
                .await?;
            posts::upsert_handle_state(
                &self.pool,
                job.subscriber_id,
                &job.handle,
                &job.handle,
                "retry",
                None,
                Some(safe_error),
            )
            .await?;
            posts::log_run_finish(&self.pool, run_log_id, "retry", 0, 0, 0, Some(safe_error))
                .await?;
        } else {
            queue::mark_handle_job_failed(&self.pool, job.id, safe_error).await?;
            posts::upsert_handle_state(
                &self.pool,
                job.subscriber_id,
                &job.handle,
                &job.handle,
                "failed",
                None,
                Some(safe_error),
            )
            .await?;
            posts::log_run_finish(&self.pool, run_log_id, "failed", 0, 0, 0, Some(safe_error))
                .await?;
        }
        Ok(())
    }

    async fn process_post_batch(&self, jobs: Vec<PostJob>, pause_until: Option<DateTime<Utc>>) {
        // The claim guarantees every job shares (subscriber, handle,
        // checkpoint); the first row anchors the provider call.
        let anchor = jobs[0].clone();

        if let Some(pause) = pause_until
            && pause > Utc::now()
        {
            debug!(batch = jobs.len(), pause_until = %pause, "cooldown active, parking post batch");
            for job in &jobs {
                if let Err(e) = queue::mark_post_job_retry(
                    &self.pool,
                    job.id,
                    job.attempt,
                    pause,
                    COOLDOWN_MESSAGE,
                )
                .await
                {
                    error!(job_id = job.id, error = ?e, "failed to park job for cooldown");
                }
            }
            return;
        }

        let Some(checkpoint) = Checkpoint::parse(&anchor.checkpoint) else {
            warn!(checkpoint = %anchor.checkpoint, "batch with unknown checkpoint");
            for job in &jobs {
                let _ =
                    queue::mark_post_job_failed(&self.pool, job.id, "unknown checkpoint").await;
            }
            return;
        };

        let spreadsheet_id = anchor.spreadsheet_id.clone().unwrap_or_default();
        let urls: Vec<String> = jobs.iter().map(|j| j.post_url.clone()).collect();

        let ctx = self.sync_context();
        let result = sync_post_checkpoint_batch(
            &ctx,
            anchor.subscriber_id,
            &spreadsheet_id,
            &anchor.handle,
            &anchor.handle,
            checkpoint,
            &urls,
        )
        .await;

        match result {
            Ok(covered) => {
                if let Err(e) = health::record_success(&self.pool).await {
                    error!(error = ?e, "failed to record provider success");
                }
                for job in &jobs {
                    if let Err(e) = self.resolve_post_job(job, &covered).await {
                        error!(job_id = job.id, error = ?e, "failed to resolve post job");
                    }
                }
            }
            Err(e) => {
                if e.downcast_ref::<ApifyError>().is_some() {
                    warn!(batch = jobs.len(), handle = %anchor.handle, error = %e, "provider call failed");
                } else {
                    error!(batch = jobs.len(), handle = %anchor.handle, error = ?e, "post batch failed");
                }
                let safe_error = self.sanitized(&e);
                if let Err(e) = self.fail_post_batch(&jobs, &safe_error).await {
                    error!(error = ?e, "failed to record batch failure");
                }
            }
        }
    }

    /// Per-job resolution after a successful batch scrape: the D21 gate
    /// first, then coverage of the provider response.
    async fn resolve_post_job(
        &self,
        job: &PostJob,
        covered: &std::collections::HashSet<String>,
    ) -> Result<()> {
        if job.checkpoint == "d21"
            && job.requires_d7_hot
            && !posts::is_d7_hot(&self.pool, job.subscriber_id, &job.handle, &job.post_url).await?
        {
            info!(job_id = job.id, post_url = %job.post_url, "d21 gate closed, skipping");
            queue::mark_post_job_skipped(&self.pool, job.id, D21_GATE_MESSAGE).await?;
            return Ok(());
        }

        if !covered.contains(&job.post_url) {
            let backoff = self.config.retry_backoff();
            let attempt = job.attempt + 1;
            if attempt as usize <= backoff.len() {
                let next_time = queue::next_retry_at(&backoff, attempt);
                queue::mark_post_job_retry(
                    &self.pool,
                    job.id,
                    attempt,
                    next_time,
                    MISSING_IN_BATCH_MESSAGE,
                )
                .await?;
            } else {
                queue::mark_post_job_failed(&self.pool, job.id, MISSING_IN_BATCH_MESSAGE).await?;
            }
            return Ok(());
        }

        queue::mark_post_job_success(&self.pool, job.id).await?;
        Ok(())
    }

    /// Batch fate sharing: a failed scrape retries or fails every job.
    async fn fail_post_batch(&self, jobs: &[PostJob], safe_error: &str) -> Result<()> {
        let (_, new_pause) = health::record_failure(
            &self.pool,
            safe_error,
            self.config.apify_cooldown_trigger_failures,
            self.config.apify_cooldown_hours,
        )
        .await?;

        let backoff = self.config.retry_backoff();
        for job in jobs {
            let attempt = job.attempt + 1;
            if attempt as usize <= backoff.len() {
                let mut next_time = queue::next_retry_at(&backoff, attempt);
                if let Some(pause) = new_pause
                    && pause > next_time
                {
                    next_time = pause;
                }
                queue::mark_post_job_retry(&self.pool, job.id, attempt, next_time, safe_error)
                    .await?;
            } else {
                queue::mark_post_job_failed(&self.pool, job.id, safe_error).await?;
            }
        }
        Ok(())
    }
}
