// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A [`MetricsSource`] backed by the in-process scraper/store/controller.
//!
//! Unlike the aggregated source, health here is per-component: a single
//! unreachable kubelet should not mark the whole source unhealthy while
//! the apiserver and etcd are still being scraped successfully. The source
//! as a whole is healthy iff at least one component is.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::component::Component;
use crate::config::SourceKind;
use crate::controller::Collector;
use crate::error::{CollectorError, Result};
use crate::rate::{
    self, compute_latest_sum, compute_rate, extract_label_value, pod_aggregate_memory_filter,
    pod_matchers, workload_container_cpu_total_filter, workload_container_memory_filter, SeriesFilter,
};
use crate::source::{
    ContainerMetrics, HistoryQuery, MetricsSource, NodeMetrics, PodMetrics, ResourceHistory, ResourceKind,
    ResourcePoint, SourceInfo,
};
use crate::store::{Matchers, Sample};

/// How recent a window to derive a rate over for "current" CPU usage.
const CPU_RATE_WINDOW: Duration = Duration::from_secs(40);
/// How far back to look for "current" memory usage (a gauge, so this is
/// really just "don't use a sample so old it's gone stale").
const MEMORY_LOOKBACK_WINDOW: Duration = Duration::from_secs(300);

const CONTAINER_CPU_METRIC: &str = "container_cpu_usage_seconds_total";
const CONTAINER_MEMORY_METRIC: &str = "container_memory_working_set_bytes";
const CONTAINER_THROTTLE_METRIC: &str = "container_cpu_cfs_throttled_seconds_total";
const NETWORK_RX_METRIC: &str = "container_network_receive_bytes_total";
const NETWORK_TX_METRIC: &str = "container_network_transmit_bytes_total";
const DISK_METRIC: &str = "container_fs_writes_bytes_total";

struct HealthState {
    collector: Arc<Collector>,
    components: RwLock<HashSet<Component>>,
    callback: RwLock<Option<Box<dyn Fn(bool, SourceInfo) + Send + Sync>>>,
}

impl HealthState {
    fn new(collector: Arc<Collector>) -> Self {
        Self {
            collector,
            components: RwLock::new(HashSet::new()),
            callback: RwLock::new(None),
        }
    }

    fn mark(&self, component: Component, healthy: bool) {
        let mut set = self.components.write();
        let was_healthy = !set.is_empty();
        if healthy {
            set.insert(component);
        } else {
            set.remove(&component);
        }
        let is_healthy = !set.is_empty();
        drop(set);

        if was_healthy != is_healthy {
            if let Some(callback) = self.callback.read().as_ref() {
                callback(is_healthy, self.source_info(is_healthy));
            }
        }
    }

    fn is_healthy(&self) -> bool {
        !self.components.read().is_empty()
    }

    fn source_info(&self, healthy: bool) -> SourceInfo {
        let components = self.collector.available_components();
        SourceInfo {
            kind: SourceKind::DirectScrape,
            healthy,
            description: format!("direct scrape over {} component(s)", components.len()),
        }
    }
}

/// A [`MetricsSource`] over the scraper/store/controller this crate owns
/// directly, rather than delegating to an external aggregated API.
pub struct DirectScrapeSource {
    collector: Arc<Collector>,
    health: Arc<HealthState>,
}

impl DirectScrapeSource {
    /// Wrap an already-constructed (but not necessarily started) collector.
    /// Registers health-tracking callbacks on it; any callbacks the caller
    /// set beforehand are replaced.
    pub fn new(collector: Arc<Collector>) -> Self {
        let health = Arc::new(HealthState::new(collector.clone()));

        let health_ok = health.clone();
        collector.set_on_metrics_collected(move |component, _scraped| {
            health_ok.mark(component, true);
        });

        let health_err = health.clone();
        collector.set_on_error(move |component, _err| {
            health_err.mark(component, false);
        });

        Self { collector, health }
    }

    /// Start the underlying collector, if not already running.
    pub async fn start(&self) -> Result<()> {
        self.collector.start().await
    }

    /// Stop the underlying collector.
    pub async fn stop(&self) -> Result<()> {
        self.collector.stop().await
    }

    fn require_running(&self) -> Result<()> {
        if !self.collector.is_running() {
            return Err(CollectorError::SourceNotRunning);
        }
        Ok(())
    }

    fn node_container_counts(&self, node: &str) -> (u32, u32) {
        let store = self.collector.store();
        let matchers = rate::node_only_matchers(node);
        let end = Utc::now().timestamp_millis();
        let Ok(per_series) = store.query_range_per_series(CONTAINER_MEMORY_METRIC, &matchers, 0, end) else {
            return (0, 0);
        };

        let real_container = workload_container_memory_filter();
        let mut pods = HashSet::new();
        let mut containers = HashSet::new();
        for key in per_series.keys() {
            if let Some(pod) = extract_label_value(key, "pod") {
                pods.insert(pod);
            }
            if real_container(key) {
                if let Some(container) = extract_label_value(key, "container") {
                    containers.insert(container);
                }
            }
        }
        (pods.len() as u32, containers.len() as u32)
    }

    fn rate_or_zero(&self, metric: &str, matchers: &Matchers, filter: Option<&SeriesFilter>) -> f64 {
        compute_rate(&self.collector.store(), metric, matchers, CPU_RATE_WINDOW, filter).unwrap_or(0.0)
    }

    fn containers_for_pod(&self, namespace: &str, pod: &str) -> Vec<ContainerMetrics> {
        let store = self.collector.store();
        let matchers = pod_matchers(namespace, pod);
        let end = Utc::now().timestamp_millis();
        let start = end - CPU_RATE_WINDOW.as_millis() as i64;

        let mut by_container: HashMap<String, ContainerMetrics> = HashMap::new();

        // Per-container breakdown always excludes the pod-level cgroup
        // aggregate, for both resources: `workload_container_cpu_total`
        // accepts `container=""` for the pod-level rate computed
        // elsewhere, which would otherwise leak a spurious `""`-named
        // entry into this array.
        let cpu_filter = workload_container_memory_filter();
        if let Ok(per_series) = store.query_range_per_series(CONTAINER_CPU_METRIC, &matchers, start, end) {
            for (key, mut samples) in per_series {
                if !cpu_filter(&key) {
                    continue;
                }
                let Some(container) = extract_label_value(&key, "container") else { continue };
                samples.sort_by_key(|s| s.timestamp_ms);
                if let Some(rate) = series_rate(&samples) {
                    let entry = by_container.entry(container.clone()).or_insert_with(|| blank_container(&container));
                    entry.cpu_usage_millicores = rate::cores_to_millicores(rate);
                }
            }
        }

        let memory_filter = workload_container_memory_filter();
        let memory_start = end - MEMORY_LOOKBACK_WINDOW.as_millis() as i64;
        if let Ok(per_series) = store.query_range_per_series(CONTAINER_MEMORY_METRIC, &matchers, memory_start, end) {
            for (key, samples) in per_series {
                if !memory_filter(&key) {
                    continue;
                }
                let Some(container) = extract_label_value(&key, "container") else { continue };
                if let Some(newest) = samples.iter().max_by_key(|s| s.timestamp_ms) {
                    let entry = by_container.entry(container.clone()).or_insert_with(|| blank_container(&container));
                    entry.memory_usage_bytes = newest.value as u64;
                }
            }
        }

        if let Ok(per_series) = store.query_range_per_series(CONTAINER_THROTTLE_METRIC, &matchers, start, end) {
            for (key, mut samples) in per_series {
                let Some(container) = extract_label_value(&key, "container") else { continue };
                samples.sort_by_key(|s| s.timestamp_ms);
                if let Some(rate) = series_rate(&samples) {
                    if let Some(entry) = by_container.get_mut(&container) {
                        entry.cpu_throttled_seconds = rate;
                    }
                }
            }
        }

        by_container.into_values().collect()
    }

    fn pod_metrics_for(&self, namespace: &str, pod: &str) -> PodMetrics {
        let store = self.collector.store();
        let matchers = pod_matchers(namespace, pod);
        let cpu_filter = workload_container_cpu_total_filter();
        let cpu_usage_millicores = rate::cores_to_millicores(
            compute_rate(&store, CONTAINER_CPU_METRIC, &matchers, CPU_RATE_WINDOW, Some(&cpu_filter))
                .unwrap_or(0.0),
        );
        let memory_usage_bytes = pod_memory_with_fallback(&store, namespace, pod).unwrap_or(0.0) as u64;

        PodMetrics {
            namespace: namespace.to_string(),
            name: pod.to_string(),
            cpu_usage_millicores,
            memory_usage_bytes,
            containers: self.containers_for_pod(namespace, pod),
            timestamp: Utc::now(),
        }
    }

    fn history_metric(resource: ResourceKind) -> (&'static str, bool) {
        match resource {
            ResourceKind::Cpu => (CONTAINER_CPU_METRIC, true),
            ResourceKind::Memory => (CONTAINER_MEMORY_METRIC, false),
        }
    }

    fn build_history(
        &self,
        metric: &str,
        matchers: &Matchers,
        filter: Option<&SeriesFilter>,
        query: HistoryQuery,
        is_counter: bool,
    ) -> ResourceHistory {
        let store = self.collector.store();
        let start_ms = query.start.timestamp_millis();
        let end_ms = query.end.timestamp_millis();

        let Ok(per_series) = store.query_range_per_series(metric, matchers, start_ms, end_ms) else {
            return ResourceHistory::default();
        };

        // Accumulate per-second buckets so multiple containers' rates sum
        // into one pod-level series instead of interleaving as if from one
        // timeline.
        let mut buckets: BTreeMap<i64, f64> = BTreeMap::new();
        for (key, mut samples) in per_series {
            if let Some(f) = filter {
                if !f(&key) {
                    continue;
                }
            }
            samples.sort_by_key(|s| s.timestamp_ms);

            if is_counter {
                for window in samples.windows(2) {
                    let (a, b) = (window[0], window[1]);
                    let delta_t = (b.timestamp_ms - a.timestamp_ms) as f64 / 1000.0;
                    if delta_t <= 0.0 {
                        continue;
                    }
                    let delta_v = if b.value < a.value { b.value } else { b.value - a.value };
                    let bucket = b.timestamp_ms / 1000 * 1000;
                    *buckets.entry(bucket).or_insert(0.0) += delta_v / delta_t;
                }
            } else {
                for sample in &samples {
                    let bucket = sample.timestamp_ms / 1000 * 1000;
                    *buckets.entry(bucket).or_insert(0.0) += sample.value;
                }
            }
        }

        let points: Vec<ResourcePoint> = buckets
            .into_iter()
            .map(|(ts, value)| ResourcePoint { timestamp: ms_to_datetime(ts), value })
            .collect();
        ResourceHistory::from_points(points, query.max_points)
    }
}

fn blank_container(name: &str) -> ContainerMetrics {
    ContainerMetrics {
        name: name.to_string(),
        cpu_usage_millicores: 0,
        memory_usage_bytes: 0,
        cpu_throttled_seconds: 0.0,
        // Neither cAdvisor's usage metrics nor the components this crate
        // scrapes carry container limits or restart counts; those live on
        // the pod spec/status, which is outside this crate's concerns.
        cpu_limit_millicores: None,
        memory_limit_bytes: None,
        restart_count: 0,
    }
}

fn series_rate(sorted_samples: &[Sample]) -> Option<f64> {
    let first = sorted_samples.first()?;
    let last = sorted_samples.last()?;
    let delta_t = (last.timestamp_ms - first.timestamp_ms) as f64 / 1000.0;
    if delta_t <= 0.0 {
        return None;
    }
    let delta_v = if last.value < first.value { last.value } else { last.value - first.value };
    Some(delta_v / delta_t)
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

#[async_trait]
impl MetricsSource for DirectScrapeSource {
    async fn get_node_metrics(&self, node: &str) -> Result<NodeMetrics> {
        self.require_running()?;
        let store = self.collector.store();

        let cpu_matchers = rate::node_matchers(node);
        let cpu_millicores = rate::cores_to_millicores(
            compute_rate(&store, CONTAINER_CPU_METRIC, &cpu_matchers, CPU_RATE_WINDOW, None).unwrap_or(0.0),
        );
        let memory_usage_bytes = store.query_latest(CONTAINER_MEMORY_METRIC, &cpu_matchers).unwrap_or(0.0) as u64;

        let node_only = rate::node_only_matchers(node);
        let network_rx_bytes_per_sec = self.rate_or_zero(NETWORK_RX_METRIC, &node_only, None);
        let network_tx_bytes_per_sec = self.rate_or_zero(NETWORK_TX_METRIC, &node_only, None);
        let disk_usage_bytes_per_sec = self.rate_or_zero(DISK_METRIC, &node_only, None);

        let (pod_count, container_count) = self.node_container_counts(node);

        Ok(NodeMetrics {
            name: node.to_string(),
            cpu_usage_millicores: cpu_millicores,
            memory_usage_bytes,
            network_rx_bytes_per_sec,
            network_tx_bytes_per_sec,
            disk_usage_bytes_per_sec,
            load_1m: 0.0,
            load_5m: 0.0,
            load_15m: 0.0,
            pod_count,
            container_count,
            timestamp: Utc::now(),
        })
    }

    async fn get_pod_metrics(&self, namespace: &str, pod: &str) -> Result<PodMetrics> {
        self.require_running()?;
        Ok(self.pod_metrics_for(namespace, pod))
    }

    async fn get_all_pod_metrics(&self, namespace: &str) -> Result<Vec<PodMetrics>> {
        self.require_running()?;
        let store = self.collector.store();
        let matchers = Matchers::new();
        let end = Utc::now().timestamp_millis();
        let per_series = store.query_range_per_series(CONTAINER_MEMORY_METRIC, &matchers, 0, end)?;

        let mut pods = HashSet::new();
        for key in per_series.keys() {
            if extract_label_value(key, "namespace").as_deref() != Some(namespace) {
                continue;
            }
            if let Some(pod) = extract_label_value(key, "pod") {
                pods.insert(pod);
            }
        }

        let mut result = Vec::with_capacity(pods.len());
        for pod in pods {
            result.push(self.pod_metrics_for(namespace, &pod));
        }
        Ok(result)
    }

    async fn get_available_metrics(&self) -> Result<Vec<String>> {
        Ok(self.collector.store().get_metric_names())
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    fn get_source_info(&self) -> SourceInfo {
        self.health.source_info(self.is_healthy())
    }

    fn set_health_callback(&self, callback: Box<dyn Fn(bool, SourceInfo) + Send + Sync>) {
        *self.health.callback.write() = Some(callback);
    }

    async fn get_node_history(&self, node: &str, query: HistoryQuery) -> Result<ResourceHistory> {
        self.require_running()?;
        let (metric, is_counter) = Self::history_metric(query.resource);
        let matchers = match query.resource {
            ResourceKind::Cpu | ResourceKind::Memory => rate::node_matchers(node),
        };
        Ok(self.build_history(metric, &matchers, None, query, is_counter))
    }

    async fn get_pod_history(&self, namespace: &str, pod: &str, query: HistoryQuery) -> Result<ResourceHistory> {
        self.require_running()?;
        let (metric, is_counter) = Self::history_metric(query.resource);
        let matchers = pod_matchers(namespace, pod);
        let filter: SeriesFilter = match query.resource {
            ResourceKind::Cpu => workload_container_cpu_total_filter(),
            ResourceKind::Memory => workload_container_memory_filter(),
        };
        Ok(self.build_history(metric, &matchers, Some(&filter), query, is_counter))
    }

    fn supports_history(&self) -> bool {
        true
    }
}

/// Sum a pod's container memory, falling back to the pod-level cgroup
/// aggregate when no per-container series are present yet (a pod scraped
/// before cAdvisor has split its cgroup tree out, or a static pod whose
/// containers never get individually labeled).
pub fn pod_memory_with_fallback(
    store: &crate::store::Store,
    namespace: &str,
    pod: &str,
) -> Result<f64> {
    let matchers = pod_matchers(namespace, pod);
    let workload = workload_container_memory_filter();
    match compute_latest_sum(store, CONTAINER_MEMORY_METRIC, &matchers, MEMORY_LOOKBACK_WINDOW, Some(&workload)) {
        Ok(value) => Ok(value),
        Err(_) => {
            let aggregate = pod_aggregate_memory_filter();
            compute_latest_sum(store, CONTAINER_MEMORY_METRIC, &matchers, MEMORY_LOOKBACK_WINDOW, Some(&aggregate))
        }
    }
}
