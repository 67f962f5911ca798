use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::models::LoggingSettings;

fn ensure_log_dir(log_dir: &str) -> Result<()> {
    let log_path = Utf8PathBuf::from(log_dir);
    if !log_path.exists() {
        fs::create_dir_all(&log_path)
            .with_context(|| format!("Failed to create log directory: {}", log_dir))?;
    }
    Ok(())
}

fn level_filter(debug_mode: bool) -> EnvFilter {
    if debug_mode {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    }
}

/// Setup logging with a daily rotating file appender.
///
/// # Returns
/// A guard that must be held for the duration of the program to keep logging active
pub fn setup_logging(settings: &LoggingSettings) -> Result<WorkerGuard> {
    setup_logging_with_console(settings, settings.console)
}

/// Setup logging with optional console output.
///
/// The file layer writes plain text, or one JSON object per line when
/// `settings.json` is set. Perception match records are `debug` events, so they
/// only reach the file with `settings.debug`.
///
/// # Arguments
/// * `settings` - Log directory, file prefix and level
/// * `console_output` - If true, also log to the terminal with ANSI colors
pub fn setup_logging_with_console(
    settings: &LoggingSettings,
    console_output: bool,
) -> Result<WorkerGuard> {
    ensure_log_dir(&settings.dir)?;

    let file_appender = rolling::daily(&settings.dir, &settings.prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = if settings.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false) // No ANSI codes in log files
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    let console_layer = console_output.then(|| {
        tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(level_filter(settings.debug))
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    tracing::info!(
        "Logging initialized: dir={}, prefix={}, debug={}, console={}, json={}",
        settings.dir,
        settings.prefix,
        settings.debug,
        console_output,
        settings.json
    );

    Ok(guard)
}
