//! Tracing subscriber setup
//!
//! The base level comes from `log_level`. `log_targets` raises or lowers
//! individual modules, e.g. `saga_transfer::outbox: debug` to follow the
//! publisher without drowning in request logs.

use anyhow::{Context, bail};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::AppConfig;

fn rotation(name: &str) -> Option<Rotation> {
    match name {
        "minutely" => Some(Rotation::MINUTELY),
        "hourly" => Some(Rotation::HOURLY),
        "daily" => Some(Rotation::DAILY),
        "never" => Some(Rotation::NEVER),
        _ => None,
    }
}

/// Filter directives for the configured levels. sqlx logs every statement
/// at info, so it is held at warn unless a target entry says otherwise.
pub fn filter_directives(config: &AppConfig) -> String {
    let mut directives = vec![config.log_level.clone()];
    if !config.log_targets.contains_key("sqlx") {
        directives.push("sqlx=warn".to_string());
    }
    directives.extend(
        config
            .log_targets
            .iter()
            .map(|(target, level)| format!("{}={}", target, level)),
    );
    directives.join(",")
}

fn build_filter(config: &AppConfig) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = filter_directives(config);
    EnvFilter::try_new(&directives).with_context(|| format!("Invalid log filter: {}", directives))
}

/// Install the global subscriber. RUST_LOG replaces the configured filter.
/// Keep the returned guard alive for the life of the process.
pub fn init_logging(config: &AppConfig) -> anyhow::Result<WorkerGuard> {
    let Some(rotation) = rotation(&config.rotation) else {
        bail!("Unknown log rotation: {}", config.rotation);
    };
    let filter = build_filter(config)?;

    let appender = RollingFileAppender::new(rotation, &config.log_dir, &config.log_file);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let registry = tracing_subscriber::registry().with(filter);
    if config.use_json {
        // event fields such as tx_id sit at the top level of each record
        let file_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_writer(writer)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
        let stdout_layer = fmt::layer().with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    Ok(guard)
}
