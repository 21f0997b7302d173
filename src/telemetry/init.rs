// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subscriber setup for the runtime binary.

use std::io;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Configuration for telemetry initialization.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Default log level if RUST_LOG is not set.
    pub default_level: Level,

    /// Whether to log span close events with timings.
    pub include_span_events: bool,

    /// Whether to include file/line information.
    pub include_file_line: bool,

    /// Whether to include the target module path.
    pub include_target: bool,

    pub ansi_colors: bool,

    pub compact: bool,

    /// Custom filter directive (overrides RUST_LOG and default_level).
    pub filter_directive: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            include_span_events: false,
            include_file_line: false,
            include_target: true,
            ansi_colors: true,
            compact: true,
            filter_directive: None,
        }
    }
}

impl TelemetryConfig {
    /// Map a `-v` count from the command line to a config.
    ///
    /// 0 keeps INFO, 1 is DEBUG for this crate only, 2 or more traces
    /// everything with span timings.
    pub fn from_verbosity(verbose: u8) -> Self {
        match verbose {
            0 => Self::default(),
            1 => Self::default().with_filter("foreman=debug,info"),
            _ => Self {
                default_level: Level::TRACE,
                include_span_events: true,
                include_file_line: true,
                compact: false,
                ..Self::default()
            },
        }
    }

    /// Long-running service output: no colors, no target noise.
    pub fn service() -> Self {
        Self {
            ansi_colors: false,
            include_target: false,
            ..Self::default()
        }
    }

    /// Trace-level output for tests.
    pub fn testing() -> Self {
        Self {
            default_level: Level::TRACE,
            include_span_events: true,
            include_file_line: true,
            include_target: true,
            ansi_colors: false,
            compact: false,
            filter_directive: Some("foreman=trace".to_string()),
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_directive = Some(filter.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi_colors = ansi;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.default_level.to_string());
        match &self.filter_directive {
            Some(directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Keeps the subscriber alive for the lifetime of the process.
pub struct TelemetryGuard {
    _private: (),
}

/// Install the global subscriber.
///
/// Fails if a subscriber was already installed, which happens when tests
/// call this more than once.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<TelemetryGuard> {
    let span_events = if config.include_span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let fmt_layer = fmt::layer()
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_file(config.include_file_line)
        .with_line_number(config.include_file_line)
        .with_span_events(span_events)
        .with_writer(io::stderr);

    let registry = tracing_subscriber::registry().with(config.env_filter());
    let result = if config.compact {
        registry.with(fmt_layer.compact()).try_init()
    } else {
        registry.with(fmt_layer).try_init()
    };
    result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    Ok(TelemetryGuard { _private: () })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.default_level, Level::INFO);
        assert!(config.compact);
        assert!(config.filter_directive.is_none());
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(TelemetryConfig::from_verbosity(0).default_level, Level::INFO);
        assert_eq!(
            TelemetryConfig::from_verbosity(1).filter_directive.as_deref(),
            Some("foreman=debug,info")
        );
        let trace = TelemetryConfig::from_verbosity(3);
        assert_eq!(trace.default_level, Level::TRACE);
        assert!(trace.include_span_events);
    }

    #[test]
    fn test_service_config() {
        let config = TelemetryConfig::service();
        assert!(!config.ansi_colors);
        assert!(!config.include_target);
    }

    #[test]
    fn test_builder() {
        let config = TelemetryConfig::default()
            .with_level(Level::DEBUG)
            .with_filter("foreman=trace")
            .with_ansi(false);

        assert_eq!(config.default_level, Level::DEBUG);
        assert_eq!(config.filter_directive, Some("foreman=trace".to_string()));
        assert!(!config.ansi_colors);
    }
}
