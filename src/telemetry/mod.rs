// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tracing and metrics infrastructure.
//!
//! - **Tracing**: structured logging to stderr, optionally mirrored to a file
//! - **Metrics**: operation latency, event delivery counters, agent spend
//!
//! Initialize once at daemon startup:
//!
//! ```rust,ignore
//! use afk::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::production())?;
//! ```
//!
//! Timed operations follow the same shape throughout the crate:
//!
//! ```rust,ignore
//! #[cfg(feature = "telemetry")]
//! let start = std::time::Instant::now();
//! // ...
//! #[cfg(feature = "telemetry")]
//! GLOBAL_METRICS.record_operation("workspace.create", start.elapsed());
//! ```

mod init;
pub mod metrics;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use metrics::{EventCounters, Histogram, Metrics, MetricsSnapshot, OperationMetrics, GLOBAL_METRICS};
