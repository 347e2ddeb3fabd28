//! Structured logging setup using the tracing crate
//!
//! The link layer logs through `tracing`; this module wires a subscriber for
//! applications that do not install their own. Diagnostic volume is driven
//! by a verbosity level in the spirit of a `-v` flag:
//!
//! - `0` — fatal errors only
//! - `1` — plus disconnects and other warnings
//! - `2` — plus per-message traffic
//! - `3` — plus publish acknowledgements and housekeeping events
//!
//! ## Environment variables
//!
//! - `MQTTLINK_VERBOSE`: verbosity 0-3 - defaults to 1
//! - `LOG_FORMAT`: output format (json, pretty, compact) - defaults to json
//! - `RUST_LOG`: overrides the verbosity-derived filter entirely

use std::env;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format options
#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json, // Default to JSON for production
        }
    }
}

/// Map a verbosity level (0-3) to a tracing level.
///
/// Values above 3 clamp to the most verbose level.
pub fn level_for_verbosity(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialize logging with manual configuration
pub fn init_logging(verbosity: u8, format: LogFormat) {
    let level = level_for_verbosity(verbosity);
    let mut filter = EnvFilter::new(level.to_string())
        // Reduce noise from dependencies
        .add_directive("rumqttc=warn".parse().unwrap())
        .add_directive("tokio=warn".parse().unwrap());

    // Allow RUST_LOG to override
    if let Ok(rust_log) = env::var("RUST_LOG") {
        filter = EnvFilter::new(rust_log);
    }

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => {
            subscriber.with(fmt::layer().json()).init();
        }
        LogFormat::Pretty => {
            subscriber.with(fmt::layer().pretty().with_ansi(true)).init();
        }
        LogFormat::Compact => {
            subscriber
                .with(fmt::layer().compact().with_ansi(true).with_target(false))
                .init();
        }
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    let verbosity = env::var("MQTTLINK_VERBOSE")
        .ok()
        .and_then(|v| v.parse::<u8>().ok())
        .unwrap_or(1);

    let format = env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    init_logging(verbosity, LogFormat::parse(&format));
}
