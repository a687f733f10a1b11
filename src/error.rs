// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types for the metrics acquisition and retention core.

use thiserror::Error;

/// Errors surfaced by the store, scraper, controller and metrics sources.
///
/// All failure modes here are non-fatal to the process: callers decide to
/// retry, degrade, or display a placeholder.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// A `SourceConfig` or `DirectScrapeConfig` failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A source method was called before `start` (or after `stop`).
    #[error("metrics source is not running")]
    SourceNotRunning,

    /// `start` was called while the collector was already running.
    #[error("collector is already running")]
    AlreadyRunning,

    /// The direct-scrape source has no healthy component.
    #[error("metrics source is unhealthy")]
    SourceUnhealthy,

    /// A query was issued against a store that was never initialized.
    #[error("store is not initialized")]
    StoreUninitialized,

    /// `query_latest` / `query_range` found no series under the given name.
    #[error("metric not found: {0}")]
    MetricAbsent(String),

    /// A query's matcher set excluded every series under the metric name.
    #[error("no series matched {metric} with the given labels")]
    NoMatchingSeries {
        /// Metric name that was queried.
        metric: String,
    },

    /// A rate computation had fewer than two samples, or every candidate
    /// series had a non-positive time delta.
    #[error("not enough samples to compute a rate for {0}")]
    InsufficientSamplesForRate(String),

    /// A scrape request failed at the transport layer.
    #[error("transport error scraping {target}: {source}")]
    TransportError {
        /// The target endpoint that failed.
        target: String,
        /// Underlying transport error.
        #[source]
        source: anyhow::Error,
    },

    /// The exposition text body could not be parsed.
    #[error("failed to parse exposition body: {0}")]
    ParseError(String),

    /// The orchestrator denied the request (RBAC).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Target discovery failed for one or more component categories.
    ///
    /// This is a best-effort category: a discovery failure for one category
    /// does not prevent the others from functioning, so this variant is
    /// normally swallowed internally (logged, not propagated) rather than
    /// returned from public APIs.
    #[error("target discovery failed: {0}")]
    TargetDiscoveryFailure(String),

    /// Wraps `reqwest`'s error type directly for `?`-propagation inside the
    /// scrape client.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Escape hatch for collaborator glue (health callbacks, adapters).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CollectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        let err = CollectorError::MetricAbsent("container_cpu_usage_seconds_total".into());
        assert_eq!(
            err.to_string(),
            "metric not found: container_cpu_usage_seconds_total"
        );

        let err = CollectorError::NoMatchingSeries {
            metric: "container_memory_working_set_bytes".into(),
        };
        assert!(err.to_string().contains("no series matched"));
    }
}
