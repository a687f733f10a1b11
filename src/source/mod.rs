// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The pluggable [`MetricsSource`] abstraction and its two concrete
//! backends.

pub mod aggregated;
pub mod direct;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SourceKind;
use crate::error::Result;

/// One container's resource usage within a pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetrics {
    /// Container name.
    pub name: String,
    /// CPU usage in millicores.
    pub cpu_usage_millicores: u64,
    /// Memory working-set usage in bytes.
    pub memory_usage_bytes: u64,
    /// Cumulative CPU-throttled seconds. Zero when the source cannot
    /// report it (the aggregated-API source never populates this; only
    /// direct-scrape can, via `container_cpu_cfs_throttled_seconds_total`).
    pub cpu_throttled_seconds: f64,
    /// The container's CPU limit, if one is set.
    pub cpu_limit_millicores: Option<u64>,
    /// The container's memory limit, if one is set.
    pub memory_limit_bytes: Option<u64>,
    /// Restart count as last observed.
    pub restart_count: u32,
}

/// A pod's resource usage.
///
/// `cpu_usage_millicores`/`memory_usage_bytes` are the pod's authoritative
/// totals: for the direct-scrape source these follow the memory acquisition
/// policy (workload containers summed, falling back to the pod-level
/// cgroup aggregate for static pods that never get split per-container);
/// for the aggregated-API source they are the sum over `containers`, which
/// the upstream API always reports per-container. `containers` is the
/// per-container breakdown for drill-down views and may be empty even when
/// the totals above are nonzero (the static-pod fallback case).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodMetrics {
    /// Pod namespace.
    pub namespace: String,
    /// Pod name.
    pub name: String,
    /// CPU usage in millicores.
    pub cpu_usage_millicores: u64,
    /// Memory working-set usage in bytes.
    pub memory_usage_bytes: u64,
    /// Per-container usage.
    pub containers: Vec<ContainerMetrics>,
    /// When this snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

/// A node's resource usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// Node name.
    pub name: String,
    /// CPU usage in millicores.
    pub cpu_usage_millicores: u64,
    /// Memory working-set usage in bytes.
    pub memory_usage_bytes: u64,
    /// Network receive rate, bytes/sec.
    pub network_rx_bytes_per_sec: f64,
    /// Network transmit rate, bytes/sec.
    pub network_tx_bytes_per_sec: f64,
    /// Disk I/O rate, bytes/sec.
    pub disk_usage_bytes_per_sec: f64,
    /// 1-minute load average. Neither source can query this from
    /// container-level metrics, so it is always `0.0`; callers should not
    /// treat a zero here as "idle".
    pub load_1m: f64,
    /// 5-minute load average. See `load_1m`.
    pub load_5m: f64,
    /// 15-minute load average. See `load_1m`.
    pub load_15m: f64,
    /// Pods currently scheduled on this node.
    pub pod_count: u32,
    /// Containers currently running on this node.
    pub container_count: u32,
    /// When this snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

/// Static information about a configured source, for display/diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Which backend is in use.
    pub kind: SourceKind,
    /// Whether the source currently considers itself healthy.
    pub healthy: bool,
    /// Human-readable description (e.g. which components are active).
    pub description: String,
}

/// One point in a resource history series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourcePoint {
    /// When this point was observed (or, for a downsampled bucket, the
    /// newest source point folded into it).
    pub timestamp: DateTime<Utc>,
    /// The value at this point.
    pub value: f64,
}

/// Which resource series a history query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// CPU usage, in millicores.
    Cpu,
    /// Memory working-set usage, in bytes.
    Memory,
}

/// A request for historical resource usage.
#[derive(Debug, Clone, Copy)]
pub struct HistoryQuery {
    /// Which series to return.
    pub resource: ResourceKind,
    /// Start of the requested window, inclusive.
    pub start: DateTime<Utc>,
    /// End of the requested window, inclusive.
    pub end: DateTime<Utc>,
    /// Upper bound on the number of points returned. A source with more raw
    /// points than this downsamples by averaging into `max_points`
    /// equal-width buckets.
    pub max_points: usize,
}

/// A (possibly downsampled) resource history series.
#[derive(Debug, Clone, Default)]
pub struct ResourceHistory {
    /// Points in chronological order.
    pub points: Vec<ResourcePoint>,
}

impl ResourceHistory {
    /// Build a history from raw points, downsampling to at most
    /// `max_points` buckets if necessary.
    ///
    /// Each bucket's value is the average of the raw points folded into it;
    /// its timestamp is the newest raw point in the bucket, so the series
    /// still ends at (approximately) the query's actual end time rather
    /// than at a bucket midpoint.
    pub fn from_points(mut points: Vec<ResourcePoint>, max_points: usize) -> Self {
        points.sort_by_key(|p| p.timestamp);

        if max_points == 0 || points.len() <= max_points {
            return Self { points };
        }

        let n = points.len();
        let mut buckets: Vec<Vec<ResourcePoint>> = vec![Vec::new(); max_points];
        for (i, point) in points.into_iter().enumerate() {
            let bucket = ((i * max_points) / n).min(max_points - 1);
            buckets[bucket].push(point);
        }

        let downsampled = buckets
            .into_iter()
            .filter(|bucket| !bucket.is_empty())
            .map(|bucket| {
                let newest = bucket.iter().map(|p| p.timestamp).max().unwrap();
                let avg = bucket.iter().map(|p| p.value).sum::<f64>() / bucket.len() as f64;
                ResourcePoint { timestamp: newest, value: avg }
            })
            .collect();

        Self { points: downsampled }
    }
}

/// The pluggable metrics backend UI-facing consumers query against. Two
/// implementations ship: [`aggregated::AggregatedSource`] (delegates to an
/// external aggregated metrics API) and [`direct::DirectScrapeSource`]
/// (runs the scraper/store/controller in-process).
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Current usage for one node.
    async fn get_node_metrics(&self, node: &str) -> Result<NodeMetrics>;

    /// Current usage for one pod.
    async fn get_pod_metrics(&self, namespace: &str, pod: &str) -> Result<PodMetrics>;

    /// Current usage for every pod in a namespace.
    async fn get_all_pod_metrics(&self, namespace: &str) -> Result<Vec<PodMetrics>>;

    /// Names of metrics this source can currently serve (diagnostics).
    async fn get_available_metrics(&self) -> Result<Vec<String>>;

    /// Whether the source currently considers itself healthy.
    fn is_healthy(&self) -> bool;

    /// A snapshot of this source's static/health information.
    fn get_source_info(&self) -> SourceInfo;

    /// Register a callback invoked on every healthy/unhealthy transition
    /// (not on every check — only when the boolean actually changes), with
    /// the new health flag and a snapshot of this source's info at the
    /// moment of the transition.
    fn set_health_callback(&self, callback: Box<dyn Fn(bool, SourceInfo) + Send + Sync>);

    /// Historical CPU/memory usage for one node, if [`Self::supports_history`].
    async fn get_node_history(&self, node: &str, query: HistoryQuery) -> Result<ResourceHistory>;

    /// Historical CPU/memory usage for one pod, if [`Self::supports_history`].
    async fn get_pod_history(&self, namespace: &str, pod: &str, query: HistoryQuery) -> Result<ResourceHistory>;

    /// Whether this source can serve history queries at all.
    fn supports_history(&self) -> bool;
}

/// The external collaborator an [`aggregated::AggregatedSource`] delegates
/// to: a pre-aggregated metrics API (e.g. the orchestrator's metrics
/// aggregator), as opposed to scraping components directly.
#[async_trait]
pub trait AggregatedMetricsClient: Send + Sync {
    /// Fetch one node's usage.
    async fn fetch_node_metrics(&self, node: &str) -> Result<RawNodeMetrics>;

    /// Fetch every node's usage in one call.
    async fn fetch_all_node_metrics(&self) -> Result<Vec<RawNodeMetrics>>;

    /// Fetch one pod's usage.
    async fn fetch_pod_metrics(&self, namespace: &str, pod: &str) -> Result<RawPodMetrics>;

    /// Fetch every pod's usage in a namespace in one call, rather than
    /// requiring the caller to cross-product namespaces and pod names.
    async fn fetch_all_pod_metrics(&self, namespace: &str) -> Result<Vec<RawPodMetrics>>;
}

/// The aggregated API's native container usage shape (nanocores, as the
/// upstream metrics API reports CPU usage).
#[derive(Debug, Clone, PartialEq)]
pub struct RawContainerMetrics {
    /// Container name.
    pub name: String,
    /// CPU usage in nanocores.
    pub cpu_usage_nanocores: u64,
    /// Memory working-set usage in bytes.
    pub memory_usage_bytes: u64,
}

/// The aggregated API's native node usage shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNodeMetrics {
    /// Node name.
    pub name: String,
    /// CPU usage in nanocores.
    pub cpu_usage_nanocores: u64,
    /// Memory working-set usage in bytes.
    pub memory_usage_bytes: u64,
    /// When the aggregated API captured this sample.
    pub timestamp: DateTime<Utc>,
}

/// The aggregated API's native pod usage shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPodMetrics {
    /// Pod namespace.
    pub namespace: String,
    /// Pod name.
    pub name: String,
    /// Per-container usage.
    pub containers: Vec<RawContainerMetrics>,
    /// When the aggregated API captured this sample.
    pub timestamp: DateTime<Utc>,
}

fn nanocores_to_millicores(nanocores: u64) -> u64 {
    nanocores / 1_000_000
}
