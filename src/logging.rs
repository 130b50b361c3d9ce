use crate::cli::TracingFormat;
use crate::config::Config;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Configure and initialize logging for the application.
///
/// The configured `LOG_LEVEL` applies to this crate's target; noisy
/// infrastructure crates stay at warn unless `RUST_LOG` overrides the
/// whole filter.
pub fn setup_logging(config: &Config, tracing_format: TracingFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let base_level = &config.log_level;
        EnvFilter::new(format!(
            "warn,feedpulse={base_level},sqlx=warn,hyper=warn,reqwest=warn"
        ))
    });

    let use_pretty = match tracing_format {
        TracingFormat::Pretty => true,
        TracingFormat::Json => false,
    };

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if use_pretty {
        Box::new(
            FmtSubscriber::builder()
                .with_target(true)
                .with_env_filter(filter)
                .pretty()
                .finish(),
        )
    } else {
        Box::new(
            FmtSubscriber::builder()
                .with_target(true)
                .with_env_filter(filter)
                .json()
                .finish(),
        )
    };

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}
