// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! End-to-end scenarios driving the public API: a node's CPU rate over a
//! scrape window, a pod's memory total with and without per-container
//! breakdown, counter-reset handling, retention eviction, and health
//! transitions on a direct-scrape source.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use cluster_metrics_core::component::Component;
use cluster_metrics_core::config::DirectScrapeConfig;
use cluster_metrics_core::controller::Collector;
use cluster_metrics_core::error::{CollectorError, Result};
use cluster_metrics_core::labels::{LabelSet, NAME_LABEL};
use cluster_metrics_core::scrape::target::{NodeInfo, PodInfo};
use cluster_metrics_core::scrape::{ClusterInventory, ProxyClient};
use cluster_metrics_core::source::direct::DirectScrapeSource;
use cluster_metrics_core::source::MetricsSource;
use cluster_metrics_core::store::{
    FamilySeries, MetricFamily, MetricKind, Sample, ScrapedMetrics, Store, StoreConfig,
};

struct EmptyInventory;

#[async_trait]
impl ClusterInventory for EmptyInventory {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(Vec::new())
    }
    async fn list_pods(&self, _namespace: &str, _selector: &str) -> Result<Vec<PodInfo>> {
        Ok(Vec::new())
    }
}

struct SilentProxy;

#[async_trait]
impl ProxyClient for SilentProxy {
    async fn get_node_proxy(&self, _node: &str, _path: &str, _timeout: Duration) -> Result<String> {
        Ok(String::new())
    }
    async fn get_pod_proxy(
        &self,
        _namespace: &str,
        _pod: &str,
        _port: u16,
        _path: &str,
        _timeout: Duration,
    ) -> Result<String> {
        Ok(String::new())
    }
    async fn get_root(&self, _path: &str, _timeout: Duration) -> Result<String> {
        Ok(String::new())
    }
}

/// A direct-scrape source wrapping a collector that never runs its own
/// background loops far enough to matter within a test: samples are pushed
/// straight into the store, and the collector is only started so that
/// `require_running` checks pass.
async fn direct_source_over(store_config: StoreConfig) -> (DirectScrapeSource, Arc<Store>) {
    let config = DirectScrapeConfig {
        scrape_interval: Duration::from_secs(30),
        retention: store_config.retention,
        max_samples_per_series: store_config.max_samples_per_series,
        components: vec![Component::Cadvisor],
    };
    let collector = Arc::new(Collector::new(Arc::new(EmptyInventory), Arc::new(SilentProxy), config).unwrap());
    collector.start().await.unwrap();
    let store = collector.store();
    let source = DirectScrapeSource::new(collector);
    (source, store)
}

fn push_sample(store: &Store, name: &str, labels: &[(&str, &str)], ts_ms: i64, value: f64) {
    let mut label_set = LabelSet::new();
    label_set.insert(NAME_LABEL, name);
    for (k, v) in labels {
        label_set.insert(*k, *v);
    }
    let mut family = MetricFamily::new(name, MetricKind::Counter);
    family.series.push(FamilySeries { labels: label_set, samples: vec![Sample::new(ts_ms, value)] });
    let mut scraped = ScrapedMetrics::new(Component::Cadvisor, "http://n1/metrics/cadvisor");
    scraped.families.insert(name.to_string(), family);
    store.add_metrics(scraped).unwrap();
}

/// A node's CPU usage over a 40s window: two counter samples 40s apart,
/// rising by 4.0 core-seconds, yields a flat 100 millicores.
#[tokio::test]
async fn node_cpu_rate_over_forty_seconds() {
    let (source, store) = direct_source_over(StoreConfig::default()).await;
    let t0 = chrono::Utc::now().timestamp_millis() - 40_000;
    push_sample(&store, "container_cpu_usage_seconds_total", &[("id", "/"), ("node", "n1")], t0, 100.0);
    push_sample(
        &store,
        "container_cpu_usage_seconds_total",
        &[("id", "/"), ("node", "n1")],
        t0 + 40_000,
        104.0,
    );

    let metrics = source.get_node_metrics("n1").await.unwrap();
    assert_eq!(metrics.cpu_usage_millicores, 100);
}

/// A pod with two workload containers at 128 MiB each, plus a pod-level
/// cgroup aggregate at 300 MiB: the pod's total sums the real containers
/// (256 MiB) and excludes the aggregate, while the aggregate's presence
/// does not leak a spurious entry into the per-container breakdown.
#[tokio::test]
async fn pod_memory_sums_workload_containers_and_excludes_aggregate() {
    let (source, store) = direct_source_over(StoreConfig::default()).await;
    const MIB: f64 = 1024.0 * 1024.0;
    let t0 = chrono::Utc::now().timestamp_millis();

    push_sample(
        &store,
        "container_memory_working_set_bytes",
        &[("namespace", "ns"), ("pod", "p1"), ("container", "app")],
        t0,
        128.0 * MIB,
    );
    push_sample(
        &store,
        "container_memory_working_set_bytes",
        &[("namespace", "ns"), ("pod", "p1"), ("container", "sidecar")],
        t0,
        128.0 * MIB,
    );
    push_sample(
        &store,
        "container_memory_working_set_bytes",
        &[("namespace", "ns"), ("pod", "p1"), ("container", "")],
        t0,
        300.0 * MIB,
    );

    let metrics = source.get_pod_metrics("ns", "p1").await.unwrap();
    assert_eq!(metrics.memory_usage_bytes, (256.0 * MIB) as u64);
    assert_eq!(metrics.containers.len(), 2);
    assert!(metrics.containers.iter().all(|c| !c.name.is_empty()));
}

/// A static pod scraped before cAdvisor has split its cgroup into
/// individual containers: only the pod-level aggregate series exists, so
/// the pod's total falls back to it even though `containers` is empty.
#[tokio::test]
async fn static_pod_falls_back_to_aggregate_when_no_containers_exist() {
    let (source, store) = direct_source_over(StoreConfig::default()).await;
    const MIB: f64 = 1024.0 * 1024.0;
    let t0 = chrono::Utc::now().timestamp_millis();

    push_sample(
        &store,
        "container_memory_working_set_bytes",
        &[("namespace", "kube-system"), ("pod", "static-web"), ("container", "")],
        t0,
        300.0 * MIB,
    );

    let metrics = source.get_pod_metrics("kube-system", "static-web").await.unwrap();
    assert_eq!(metrics.memory_usage_bytes, (300.0 * MIB) as u64);
    assert!(metrics.containers.is_empty());
}

/// A counter that drops between two samples (container restart, cgroup
/// reset) is treated as a reset: the rate uses the newer value as the
/// delta rather than going negative.
#[tokio::test]
async fn counter_reset_uses_newer_value_as_delta() {
    let (source, store) = direct_source_over(StoreConfig::default()).await;
    let t0 = chrono::Utc::now().timestamp_millis() - 40_000;

    push_sample(&store, "container_cpu_usage_seconds_total", &[("id", "/"), ("node", "n1")], t0, 500.0);
    push_sample(
        &store,
        "container_cpu_usage_seconds_total",
        &[("id", "/"), ("node", "n1")],
        t0 + 40_000,
        10.0,
    );

    let metrics = source.get_node_metrics("n1").await.unwrap();
    // 10 core-seconds over 40s = 0.25 cores = 250 millicores.
    assert_eq!(metrics.cpu_usage_millicores, 250);
}

/// A sample well outside the retention window is evicted by `cleanup`, and
/// a subsequent query for that metric reports it absent rather than
/// silently returning stale data.
#[test]
fn retention_evicts_samples_older_than_the_configured_window() {
    let store = Store::new(StoreConfig {
        retention: Duration::from_secs(3600),
        max_samples_per_series: 1000,
    });
    let two_hours_ago = chrono::Utc::now().timestamp_millis() - Duration::from_secs(7200).as_millis() as i64;
    push_sample(&store, "container_memory_working_set_bytes", &[("node", "n1")], two_hours_ago, 4096.0);

    store.cleanup();

    let err = store
        .query_latest("container_memory_working_set_bytes", &Default::default())
        .unwrap_err();
    assert!(matches!(err, CollectorError::MetricAbsent(_)));
}

struct ToggleableProxy {
    fail: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl ProxyClient for ToggleableProxy {
    async fn get_node_proxy(&self, _node: &str, _path: &str, _timeout: Duration) -> Result<String> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CollectorError::TransportError {
                target: "n1".to_string(),
                source: anyhow::anyhow!("connection refused"),
            });
        }
        Ok("container_cpu_usage_seconds_total{id=\"/\"} 1.0\n".to_string())
    }
    async fn get_pod_proxy(
        &self,
        _namespace: &str,
        _pod: &str,
        _port: u16,
        _path: &str,
        _timeout: Duration,
    ) -> Result<String> {
        Ok(String::new())
    }
    async fn get_root(&self, _path: &str, _timeout: Duration) -> Result<String> {
        Ok(String::new())
    }
}

/// A direct-scrape source starts unhealthy (no component has reported
/// yet). A successful scrape of one component flips it healthy exactly
/// once; a subsequent failure of that same component flips it back exactly
/// once, rather than firing on every check.
#[tokio::test]
async fn health_transitions_fire_once_per_actual_flip() {
    let inventory = Arc::new(SingleNodeInventory);
    let proxy = Arc::new(ToggleableProxy { fail: std::sync::atomic::AtomicBool::new(false) });
    let config = DirectScrapeConfig {
        scrape_interval: Duration::from_secs(5),
        retention: Duration::from_secs(3600),
        max_samples_per_series: 1000,
        components: vec![Component::Kubelet],
    };
    let collector = Arc::new(Collector::new(inventory, proxy.clone(), config).unwrap());
    let source = DirectScrapeSource::new(collector.clone());

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let recorded = transitions.clone();
    source.set_health_callback(Box::new(move |healthy, _info| {
        recorded.lock().unwrap().push(healthy);
    }));

    assert!(!source.is_healthy());

    // `start` runs discovery synchronously, then the scrape loop's first
    // tick fires immediately — no need to wait out a full interval for the
    // first transition.
    source.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(source.is_healthy());

    proxy.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(5_300)).await;
    assert!(!source.is_healthy());

    source.stop().await.unwrap();
    assert_eq!(*transitions.lock().unwrap(), vec![true, false]);
}

struct SingleNodeInventory;

#[async_trait]
impl ClusterInventory for SingleNodeInventory {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(vec![NodeInfo { name: "n1".into() }])
    }
    async fn list_pods(&self, _namespace: &str, _selector: &str) -> Result<Vec<PodInfo>> {
        Ok(Vec::new())
    }
}
