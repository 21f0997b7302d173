// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Logging and metrics for the runtime.
//!
//! - **Tracing**: structured logs through `tracing-subscriber`, filtered by
//!   `RUST_LOG` or an explicit directive
//! - **Metrics**: in-process counters and latency histograms, recorded only
//!   when the `telemetry` feature is enabled
//!
//! # Usage
//!
//! ```rust,ignore
//! use foreman::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```
//!
//! Runtime code logs with `task_id` as a structured field so one task's
//! history can be grepped out of a busy worker pool.

mod init;
pub mod metrics;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use metrics::{
    AgentMetrics, LatencyHistogram, Metrics, MetricsSnapshot, OperationMetrics, GLOBAL_METRICS,
};
