use clap::Parser;

/// Feedpulse worker - social post performance tracking
///
/// One binary, dispatched by `--mode`:
/// - schedule: enumerate subscribers and enqueue handle work
/// - worker: drain the handle and post checkpoint queues
/// - embeddings / alerts / aggregates: analytics passes
/// - retention / repair-velocity: maintenance passes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Which pipeline entry point to run
    #[arg(long, value_enum)]
    pub mode: Mode,

    /// Scheduling cycle for `--mode schedule`
    #[arg(long, value_enum, default_value_t = RunType::Daily)]
    pub run_type: RunType,

    /// Restrict analytics modes to a single subscriber
    #[arg(long)]
    pub subscriber_id: Option<i64>,

    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum Mode {
    /// Enumerate active subscribers and enqueue handle jobs
    Schedule,
    /// Infinite loop draining the handle queue, then the post queue
    Worker,
    /// Embed captions/performance texts for hot posts
    Embeddings,
    /// Rebuild signal aggregates, then generate alert candidates
    Alerts,
    /// Rebuild signal aggregates only
    Aggregates,
    /// Delete aged rows per the retention policy
    Retention,
    /// Normalize historical stage labels and reproject tags
    RepairVelocity,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum RunType {
    /// Post scrapes for every tracked handle
    Daily,
    /// Profile/details refresh only
    Weekly,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Daily => "daily",
            RunType::Weekly => "weekly",
        }
    }
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum TracingFormat {
    /// Use pretty formatter (default in debug mode)
    Pretty,
    /// Use JSON formatter (default in release mode)
    Json,
}

#[cfg(debug_assertions)]
const DEFAULT_TRACING_FORMAT: TracingFormat = TracingFormat::Pretty;
#[cfg(not(debug_assertions))]
const DEFAULT_TRACING_FORMAT: TracingFormat = TracingFormat::Json;

fn default_tracing_format() -> TracingFormat {
    DEFAULT_TRACING_FORMAT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_type_as_str() {
        assert_eq!(RunType::Daily.as_str(), "daily");
        assert_eq!(RunType::Weekly.as_str(), "weekly");
    }
}
