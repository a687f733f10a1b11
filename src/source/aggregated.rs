// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A [`MetricsSource`] backed by a pre-aggregated metrics API.
//!
//! Enhanced fields (CPU throttling, limits, load averages) are left at
//! their zero value: the aggregated API this source queries reports only
//! usage, not the cgroup-level detail direct scraping exposes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::config::SourceKind;
use crate::error::Result;
use crate::ringbuffer::RingBuffer;
use crate::source::{
    nanocores_to_millicores, AggregatedMetricsClient, ContainerMetrics, HistoryQuery, MetricsSource,
    NodeMetrics, PodMetrics, RawContainerMetrics, RawNodeMetrics, RawPodMetrics, ResourceHistory,
    ResourceKind, ResourcePoint, SourceInfo,
};

/// How many recent samples are retained per node/pod resource series for
/// history queries.
const HISTORY_CAPACITY: usize = 120;

type HealthCallback = Box<dyn Fn(bool, SourceInfo) + Send + Sync>;

/// A [`MetricsSource`] that delegates to an [`AggregatedMetricsClient`].
/// Health toggles per call: a successful fetch marks the source healthy, a
/// failed one marks it unhealthy. History is served from ring buffers
/// populated as a side effect of successful fetches, not fetched directly.
pub struct AggregatedSource {
    client: Arc<dyn AggregatedMetricsClient>,
    healthy: AtomicBool,
    health_callback: RwLock<Option<HealthCallback>>,
    node_cpu: RwLock<HashMap<String, RingBuffer<ResourcePoint>>>,
    node_memory: RwLock<HashMap<String, RingBuffer<ResourcePoint>>>,
    pod_cpu: RwLock<HashMap<String, RingBuffer<ResourcePoint>>>,
    pod_memory: RwLock<HashMap<String, RingBuffer<ResourcePoint>>>,
}

impl AggregatedSource {
    /// Construct a source over the given collaborator. Starts unhealthy;
    /// the first successful fetch flips it healthy and fires the callback
    /// if one is registered by then.
    pub fn new(client: Arc<dyn AggregatedMetricsClient>) -> Self {
        Self {
            client,
            healthy: AtomicBool::new(false),
            health_callback: RwLock::new(None),
            node_cpu: RwLock::new(HashMap::new()),
            node_memory: RwLock::new(HashMap::new()),
            pod_cpu: RwLock::new(HashMap::new()),
            pod_memory: RwLock::new(HashMap::new()),
        }
    }

    fn set_health(&self, healthy: bool) {
        let previous = self.healthy.swap(healthy, Ordering::SeqCst);
        if previous != healthy {
            if let Some(callback) = self.health_callback.read().as_ref() {
                callback(healthy, self.source_info(healthy));
            }
        }
    }

    fn source_info(&self, healthy: bool) -> SourceInfo {
        SourceInfo { kind: SourceKind::AggregatedApi, healthy, description: "aggregated metrics API".to_string() }
    }

    fn record(history: &RwLock<HashMap<String, RingBuffer<ResourcePoint>>>, key: String, point: ResourcePoint) {
        let mut map = history.write();
        map.entry(key).or_insert_with(|| RingBuffer::new(HISTORY_CAPACITY)).add(point);
    }

    fn query(
        history: &RwLock<HashMap<String, RingBuffer<ResourcePoint>>>,
        key: &str,
        query: HistoryQuery,
    ) -> ResourceHistory {
        let map = history.read();
        let Some(buffer) = map.get(key) else {
            return ResourceHistory::default();
        };
        let mut points = Vec::new();
        buffer.range(|point| {
            if point.timestamp >= query.start && point.timestamp <= query.end {
                points.push(*point);
            }
            true
        });
        ResourceHistory::from_points(points, query.max_points)
    }

    fn node_to_metrics(&self, raw: RawNodeMetrics) -> NodeMetrics {
        let cpu_millicores = nanocores_to_millicores(raw.cpu_usage_nanocores);
        Self::record(
            &self.node_cpu,
            raw.name.clone(),
            ResourcePoint { timestamp: raw.timestamp, value: cpu_millicores as f64 },
        );
        Self::record(
            &self.node_memory,
            raw.name.clone(),
            ResourcePoint { timestamp: raw.timestamp, value: raw.memory_usage_bytes as f64 },
        );
        NodeMetrics {
            name: raw.name,
            cpu_usage_millicores: cpu_millicores,
            memory_usage_bytes: raw.memory_usage_bytes,
            network_rx_bytes_per_sec: 0.0,
            network_tx_bytes_per_sec: 0.0,
            disk_usage_bytes_per_sec: 0.0,
            load_1m: 0.0,
            load_5m: 0.0,
            load_15m: 0.0,
            pod_count: 0,
            container_count: 0,
            timestamp: raw.timestamp,
        }
    }

    fn pod_to_metrics(&self, raw: RawPodMetrics) -> PodMetrics {
        let cpu_key = format!("{}/{}", raw.namespace, raw.name);
        let total_cpu: u64 = raw.containers.iter().map(|c| nanocores_to_millicores(c.cpu_usage_nanocores)).sum();
        let total_memory: u64 = raw.containers.iter().map(|c| c.memory_usage_bytes).sum();
        Self::record(
            &self.pod_cpu,
            cpu_key.clone(),
            ResourcePoint { timestamp: raw.timestamp, value: total_cpu as f64 },
        );
        Self::record(
            &self.pod_memory,
            cpu_key,
            ResourcePoint { timestamp: raw.timestamp, value: total_memory as f64 },
        );

        PodMetrics {
            namespace: raw.namespace,
            name: raw.name,
            cpu_usage_millicores: total_cpu,
            memory_usage_bytes: total_memory,
            containers: raw
                .containers
                .into_iter()
                .map(raw_container_to_metrics)
                .collect(),
            timestamp: raw.timestamp,
        }
    }
}

fn raw_container_to_metrics(raw: RawContainerMetrics) -> ContainerMetrics {
    ContainerMetrics {
        name: raw.name,
        cpu_usage_millicores: nanocores_to_millicores(raw.cpu_usage_nanocores),
        memory_usage_bytes: raw.memory_usage_bytes,
        cpu_throttled_seconds: 0.0,
        cpu_limit_millicores: None,
        memory_limit_bytes: None,
        restart_count: 0,
    }
}

#[async_trait]
impl MetricsSource for AggregatedSource {
    async fn get_node_metrics(&self, node: &str) -> Result<NodeMetrics> {
        match self.client.fetch_node_metrics(node).await {
            Ok(raw) => {
                self.set_health(true);
                Ok(self.node_to_metrics(raw))
            }
            Err(err) => {
                self.set_health(false);
                Err(err)
            }
        }
    }

    async fn get_pod_metrics(&self, namespace: &str, pod: &str) -> Result<PodMetrics> {
        match self.client.fetch_pod_metrics(namespace, pod).await {
            Ok(raw) => {
                self.set_health(true);
                Ok(self.pod_to_metrics(raw))
            }
            Err(err) => {
                self.set_health(false);
                Err(err)
            }
        }
    }

    async fn get_all_pod_metrics(&self, namespace: &str) -> Result<Vec<PodMetrics>> {
        match self.client.fetch_all_pod_metrics(namespace).await {
            Ok(raws) => {
                self.set_health(true);
                Ok(raws.into_iter().map(|raw| self.pod_to_metrics(raw)).collect())
            }
            Err(err) => {
                self.set_health(false);
                Err(err)
            }
        }
    }

    async fn get_available_metrics(&self) -> Result<Vec<String>> {
        Ok(vec![
            "cpu_usage_millicores".to_string(),
            "memory_usage_bytes".to_string(),
        ])
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn get_source_info(&self) -> SourceInfo {
        self.source_info(self.is_healthy())
    }

    fn set_health_callback(&self, callback: Box<dyn Fn(bool, SourceInfo) + Send + Sync>) {
        *self.health_callback.write() = Some(callback);
    }

    async fn get_node_history(&self, node: &str, query: HistoryQuery) -> Result<ResourceHistory> {
        let history = match query.resource {
            ResourceKind::Cpu => &self.node_cpu,
            ResourceKind::Memory => &self.node_memory,
        };
        Ok(Self::query(history, node, query))
    }

    async fn get_pod_history(&self, namespace: &str, pod: &str, query: HistoryQuery) -> Result<ResourceHistory> {
        let key = format!("{namespace}/{pod}");
        let history = match query.resource {
            ResourceKind::Cpu => &self.pod_cpu,
            ResourceKind::Memory => &self.pod_memory,
        };
        Ok(Self::query(history, &key, query))
    }

    fn supports_history(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollectorError;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex as StdMutex;

    struct FakeClient {
        fail: AtomicBool,
    }

    #[async_trait]
    impl AggregatedMetricsClient for FakeClient {
        async fn fetch_node_metrics(&self, node: &str) -> Result<RawNodeMetrics> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CollectorError::TransportError {
                    target: node.to_string(),
                    source: anyhow::anyhow!("unreachable"),
                });
            }
            Ok(RawNodeMetrics {
                name: node.to_string(),
                cpu_usage_nanocores: 500_000_000,
                memory_usage_bytes: 1024,
                timestamp: Utc::now(),
            })
        }

        async fn fetch_all_node_metrics(&self) -> Result<Vec<RawNodeMetrics>> {
            Ok(Vec::new())
        }

        async fn fetch_pod_metrics(&self, namespace: &str, pod: &str) -> Result<RawPodMetrics> {
            Ok(RawPodMetrics {
                namespace: namespace.to_string(),
                name: pod.to_string(),
                containers: vec![RawContainerMetrics {
                    name: "app".to_string(),
                    cpu_usage_nanocores: 250_000_000,
                    memory_usage_bytes: 512,
                }],
                timestamp: Utc::now(),
            })
        }

        async fn fetch_all_pod_metrics(&self, _namespace: &str) -> Result<Vec<RawPodMetrics>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn initially_unhealthy_then_healthy_after_first_success() {
        let source = AggregatedSource::new(Arc::new(FakeClient { fail: AtomicBool::new(false) }));
        assert!(!source.is_healthy());
        source.get_node_metrics("n1").await.unwrap();
        assert!(source.is_healthy());
    }

    #[tokio::test]
    async fn health_transition_fires_callback_exactly_once() {
        let source = AggregatedSource::new(Arc::new(FakeClient { fail: AtomicBool::new(false) }));
        let transitions = Arc::new(StdMutex::new(Vec::new()));
        let transitions_clone = transitions.clone();
        source.set_health_callback(Box::new(move |healthy, _info| {
            transitions_clone.lock().unwrap().push(healthy);
        }));

        source.get_node_metrics("n1").await.unwrap();
        source.get_node_metrics("n1").await.unwrap();
        source.get_node_metrics("n1").await.unwrap();

        assert_eq!(*transitions.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn cpu_conversion_uses_nanocores_to_millicores() {
        let source = AggregatedSource::new(Arc::new(FakeClient { fail: AtomicBool::new(false) }));
        let metrics = source.get_node_metrics("n1").await.unwrap();
        assert_eq!(metrics.cpu_usage_millicores, 500);
    }

    #[tokio::test]
    async fn history_is_populated_as_a_side_effect_of_fetches() {
        let source = AggregatedSource::new(Arc::new(FakeClient { fail: AtomicBool::new(false) }));
        for _ in 0..5 {
            source.get_node_metrics("n1").await.unwrap();
        }

        let history = source
            .get_node_history(
                "n1",
                HistoryQuery {
                    resource: ResourceKind::Cpu,
                    start: Utc::now() - ChronoDuration::minutes(5),
                    end: Utc::now() + ChronoDuration::minutes(1),
                    max_points: 100,
                },
            )
            .await
            .unwrap();
        assert_eq!(history.points.len(), 5);
    }
}
