// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Target discovery and parallel scraping.

pub mod client;
pub mod target;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, warn};

pub use client::{ProxyClient, ReqwestProxyClient};
pub use target::{discover_targets, ClusterInventory, NodeInfo, PodInfo, ScrapeTarget};

use crate::component::Component;
use crate::error::{CollectorError, Result};
use crate::parser;
use crate::store::{MetricFamily, ScrapedMetrics};

/// Scrape-level configuration: the per-request timeout applied to every GET.
#[derive(Debug, Clone, Copy)]
pub struct ScrapeConfig {
    /// Per-request timeout, derived by wrapping the caller context.
    pub timeout: Duration,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

/// Discovers scrape targets and performs the HTTP GETs against them.
pub struct Scraper {
    inventory: Arc<dyn ClusterInventory>,
    proxy: Arc<dyn ProxyClient>,
    targets: RwLock<HashMap<Component, Vec<ScrapeTarget>>>,
    config: ScrapeConfig,
}

impl Scraper {
    /// Construct a scraper over the given collaborators.
    pub fn new(
        inventory: Arc<dyn ClusterInventory>,
        proxy: Arc<dyn ProxyClient>,
        config: ScrapeConfig,
    ) -> Self {
        Self {
            inventory,
            proxy,
            targets: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Rediscover targets for every component in `components`. Best-effort:
    /// a discovery failure for one component is logged and that
    /// component's previous target set is left untouched; the others are
    /// still replaced wholesale.
    pub async fn discover(&self, components: &[Component]) {
        for &component in components {
            match discover_targets(self.inventory.as_ref(), component).await {
                Ok(targets) => {
                    debug!(component = %component, count = targets.len(), "discovered targets");
                    self.targets.write().insert(component, targets);
                }
                Err(err) => {
                    warn!(component = %component, error = %err, "target discovery failed, keeping previous targets");
                }
            }
        }
    }

    /// The current target set for one component.
    pub fn targets_for(&self, component: Component) -> Vec<ScrapeTarget> {
        self.targets.read().get(&component).cloned().unwrap_or_default()
    }

    /// Scrape every enabled target for `component` in parallel and merge
    /// the results.
    ///
    /// For per-node components (`kubelet`, `cadvisor`) a `node="<name>"`
    /// label is appended to every series before merging, so series from
    /// different nodes never collide. The same disambiguation is applied
    /// to control-plane pod components (`pod`/`namespace` labels), since
    /// more than one pod can back a single component (e.g. a highly
    /// available etcd cluster) and their raw exposition text carries no
    /// such label on its own.
    ///
    /// Only when every target failed is an error returned; partial success
    /// yields a merged result with the last error dropped.
    pub async fn scrape_component(&self, component: Component) -> Result<ScrapedMetrics> {
        let targets: Vec<ScrapeTarget> = self
            .targets_for(component)
            .into_iter()
            .filter(|t| t.enabled)
            .collect();

        if targets.is_empty() {
            return Err(CollectorError::NoMatchingSeries {
                metric: format!("no enabled targets for {component}"),
            });
        }

        let futures = targets.iter().map(|target| self.scrape_one(target));
        let results: Vec<Result<ScrapedMetrics>> = join_all(futures).await;

        merge_results(component, results)
    }

    /// Scrape a single target, parse its body, and wrap it as
    /// [`ScrapedMetrics`]. Any transport, HTTP-status, or parse error is
    /// both returned and reflected in the `error` field of the value a
    /// caller may separately construct via [`ScrapedMetrics::failed`].
    pub async fn scrape_one(&self, target: &ScrapeTarget) -> Result<ScrapedMetrics> {
        let start = Instant::now();
        let endpoint = target_endpoint(target);

        let body = match target {
            ScrapeTarget { node_name: Some(node), path, .. } => {
                self.proxy.get_node_proxy(node, path, self.config.timeout).await
            }
            ScrapeTarget { pod_name: Some(pod), namespace: Some(ns), port: Some(port), path, .. } => {
                self.proxy
                    .get_pod_proxy(ns, pod, *port, path, self.config.timeout)
                    .await
            }
            ScrapeTarget { path, .. } => self.proxy.get_root(path, self.config.timeout).await,
        };

        let body = body?;
        let mut families = parser::parse(&body);
        inject_disambiguating_label(target, &mut families);

        Ok(ScrapedMetrics {
            component: target.component,
            endpoint,
            families,
            scraped_at: Utc::now(),
            duration: start.elapsed(),
            error: None,
        })
    }
}

fn target_endpoint(target: &ScrapeTarget) -> String {
    if let Some(node) = &target.node_name {
        format!("node/{node}/{}", target.path)
    } else if let (Some(ns), Some(pod), Some(port)) = (&target.namespace, &target.pod_name, target.port) {
        format!("pod/{ns}/{pod}:{port}/{}", target.path)
    } else {
        target.path.clone()
    }
}

fn inject_disambiguating_label(target: &ScrapeTarget, families: &mut HashMap<String, MetricFamily>) {
    let (label, value) = if let Some(node) = &target.node_name {
        ("node", node.clone())
    } else if let Some(pod) = &target.pod_name {
        ("pod", pod.clone())
    } else {
        return;
    };

    for family in families.values_mut() {
        for series in family.series.iter_mut() {
            series.labels.insert(label, value.clone());
        }
    }

    if let Some(ns) = &target.namespace {
        if target.node_name.is_none() {
            for family in families.values_mut() {
                for series in family.series.iter_mut() {
                    series.labels.insert("namespace", ns.clone());
                }
            }
        }
    }
}

fn merge_results(component: Component, results: Vec<Result<ScrapedMetrics>>) -> Result<ScrapedMetrics> {
    let mut merged: HashMap<String, MetricFamily> = HashMap::new();
    let mut last_error: Option<CollectorError> = None;
    let mut successes = 0usize;
    let mut total_duration = Duration::default();

    for result in results {
        match result {
            Ok(scraped) => {
                successes += 1;
                total_duration += scraped.duration;
                for (name, family) in scraped.families {
                    match merged.remove(&name) {
                        Some(mut existing) => {
                            existing.series.extend(family.series);
                            merged.insert(name, existing);
                        }
                        None => {
                            merged.insert(name, family);
                        }
                    }
                }
            }
            Err(err) => {
                warn!(component = %component, error = %err, "scrape target failed");
                last_error = Some(err);
            }
        }
    }

    if successes == 0 {
        return Err(last_error.unwrap_or_else(|| CollectorError::TransportError {
            target: component.to_string(),
            source: anyhow::anyhow!("no targets scraped successfully"),
        }));
    }

    Ok(ScrapedMetrics {
        component,
        endpoint: format!("merged:{component}"),
        families: merged,
        scraped_at: Utc::now(),
        duration: total_duration,
        error: None,
    })
}
