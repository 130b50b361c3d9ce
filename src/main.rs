use clap::Parser;
use figment::{Figment, providers::Env};
use std::sync::Arc;
use tracing::{error, info};

use feedpulse::apify::ApifyClient;
use feedpulse::cli::{Args, Mode};
use feedpulse::config::Config;
use feedpulse::data::{self, aggregates, init, retention};
use feedpulse::error::Result;
use feedpulse::logging::setup_logging;
use feedpulse::sheets::SheetsClient;
use feedpulse::worker::Worker;
use feedpulse::{alerts, embeddings, repair, scheduler};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config: Config = Figment::new()
        .merge(Env::raw())
        .extract()
        .expect("Failed to load config");

    setup_logging(&config, args.tracing.clone());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?args.mode,
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting feedpulse"
    );

    let pool = data::connect(&config.database_url)
        .await
        .expect("Failed to create database pool");

    if let Err(e) = init::init_db(&pool, &config.spreadsheet_id).await {
        error!(error = ?e, "database bootstrap failed");
        std::process::exit(1);
    }

    let outcome = run_mode(&args, &config, pool).await;
    match outcome {
        Ok(()) => {
            info!(mode = ?args.mode, "run complete");
        }
        Err(e) => {
            error!(mode = ?args.mode, error = ?e, "run failed");
            std::process::exit(1);
        }
    }
}

async fn run_mode(args: &Args, config: &Config, pool: sqlx::PgPool) -> Result<()> {
    match args.mode {
        Mode::Schedule => {
            let apify = ApifyClient::new(config)?;
            let sheets = SheetsClient::new(config)?;
            scheduler::schedule(&pool, &apify, &sheets, config, args.run_type).await
        }
        Mode::Worker => {
            let apify = Arc::new(ApifyClient::new(config)?);
            let sheets = Arc::new(SheetsClient::new(config)?);
            let worker = Worker::new(pool, apify, sheets, config.clone());
            worker.run().await
        }
        Mode::Embeddings => embeddings::run_embeddings(&pool, config, args.subscriber_id).await,
        Mode::Alerts => {
            aggregates::rebuild_for_subscriber(&pool, args.subscriber_id, 30).await?;
            alerts::generate_alert_candidates(&pool, args.subscriber_id, 3).await?;
            Ok(())
        }
        Mode::Aggregates => aggregates::rebuild_for_subscriber(&pool, args.subscriber_id, 30).await,
        Mode::Retention => retention::run_retention_cleanup(&pool).await,
        Mode::RepairVelocity => {
            let sheets = SheetsClient::new(config)?;
            repair::repair_velocity(&pool, &sheets, config, args.subscriber_id).await
        }
    }
}
