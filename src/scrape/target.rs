// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Scrape targets and the external cluster-inventory collaborator contract.

use async_trait::async_trait;

use crate::component::Component;
use crate::error::Result;

/// A concrete endpoint to scrape, derived from discovery. Targets are
/// replaced wholesale at each rediscovery.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeTarget {
    /// Which component this target belongs to.
    pub component: Component,
    /// The path to GET, relative to the proxy root (e.g. `metrics`,
    /// `metrics/cadvisor`).
    pub path: String,
    /// Listener port, for control-plane pod targets addressed via
    /// `pod:<port>`.
    pub port: Option<u16>,
    /// Node name, for per-node targets.
    pub node_name: Option<String>,
    /// Pod name, for control-plane pod targets.
    pub pod_name: Option<String>,
    /// Namespace, for control-plane pod targets.
    pub namespace: Option<String>,
    /// Whether this target is currently scraped. Disabled targets are kept
    /// out of scrape cycles without needing to be re-discovered back in.
    pub enabled: bool,
}

impl ScrapeTarget {
    /// The single synthetic apiserver target.
    pub fn apiserver() -> Self {
        Self {
            component: Component::ApiServer,
            path: "/metrics".to_string(),
            port: None,
            node_name: None,
            pod_name: None,
            namespace: None,
            enabled: true,
        }
    }

    /// A per-node kubelet or cAdvisor target.
    pub fn for_node(component: Component, node_name: impl Into<String>) -> Self {
        let path = match component {
            Component::Cadvisor => "metrics/cadvisor",
            _ => "metrics",
        };
        Self {
            component,
            path: path.to_string(),
            port: None,
            node_name: Some(node_name.into()),
            pod_name: None,
            namespace: None,
            enabled: true,
        }
    }

    /// A control-plane pod target (etcd, scheduler, controller-manager,
    /// kube-proxy), addressed `pod:<port>`.
    pub fn for_pod(
        component: Component,
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            component,
            path: "metrics".to_string(),
            port: Some(port),
            node_name: None,
            pod_name: Some(pod_name.into()),
            namespace: Some(namespace.into()),
            enabled: true,
        }
    }
}

/// A node as seen by the cluster inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// The node's name.
    pub name: String,
}

/// A pod as seen by the cluster inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    /// The pod's name.
    pub name: String,
    /// The pod's namespace.
    pub namespace: String,
    /// The pod's phase (e.g. `Running`).
    pub phase: String,
}

impl PodInfo {
    /// Whether the pod is in the `Running` phase — only Running pods become
    /// scrape targets.
    pub fn is_running(&self) -> bool {
        self.phase == "Running"
    }
}

/// The external collaborator that lists nodes and pods for target
/// discovery. A production implementation wraps the orchestrator's
/// resource listers/informers; that wrapper is out of scope for this
/// crate, which depends only on this trait.
#[async_trait]
pub trait ClusterInventory: Send + Sync {
    /// List every node in the cluster.
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// List pods in `namespace` matching `label_selector`.
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodInfo>>;
}

/// The infrastructure namespace control-plane pods live in.
pub const INFRA_NAMESPACE: &str = "kube-system";

/// The label selector and published listener port for each control-plane
/// pod component. Only components addressed via the pod-proxy path appear
/// here.
pub fn control_plane_pod_spec(component: Component) -> Option<(&'static str, u16)> {
    match component {
        Component::Etcd => Some(("component=etcd", 2379)),
        Component::Scheduler => Some(("component=kube-scheduler", 10259)),
        Component::ControllerManager => Some(("component=kube-controller-manager", 10257)),
        Component::KubeProxy => Some(("k8s-app=kube-proxy", 10249)),
        _ => None,
    }
}

/// Discover the current target set for one component. Best-effort: a
/// failure to list nodes/pods for this component is returned to the
/// caller, which swallows it (target discovery is a best-effort category —
/// failure for one category does not prevent the others from functioning).
pub async fn discover_targets(
    inventory: &dyn ClusterInventory,
    component: Component,
) -> Result<Vec<ScrapeTarget>> {
    match component {
        Component::ApiServer => Ok(vec![ScrapeTarget::apiserver()]),
        Component::Kubelet | Component::Cadvisor => {
            let nodes = inventory.list_nodes().await?;
            Ok(nodes
                .into_iter()
                .map(|n| ScrapeTarget::for_node(component, n.name))
                .collect())
        }
        _ => {
            let Some((selector, port)) = control_plane_pod_spec(component) else {
                return Ok(Vec::new());
            };
            let pods = inventory.list_pods(INFRA_NAMESPACE, selector).await?;
            Ok(pods
                .into_iter()
                .filter(|p| p.is_running())
                .map(|p| ScrapeTarget::for_pod(component, p.namespace.clone(), p.name.clone(), port))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeInventory {
        nodes: Vec<NodeInfo>,
        pods: Vec<PodInfo>,
    }

    #[async_trait]
    impl ClusterInventory for FakeInventory {
        async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
            Ok(self.nodes.clone())
        }

        async fn list_pods(&self, _namespace: &str, _selector: &str) -> Result<Vec<PodInfo>> {
            Ok(self.pods.clone())
        }
    }

    #[tokio::test]
    async fn apiserver_discovery_is_a_single_synthetic_target() {
        let inventory = FakeInventory { nodes: vec![], pods: vec![] };
        let targets = discover_targets(&inventory, Component::ApiServer).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].path, "/metrics");
    }

    #[tokio::test]
    async fn per_node_discovery_emits_one_target_per_node() {
        let inventory = FakeInventory {
            nodes: vec![NodeInfo { name: "n1".into() }, NodeInfo { name: "n2".into() }],
            pods: vec![],
        };
        let targets = discover_targets(&inventory, Component::Cadvisor).await.unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.path == "metrics/cadvisor"));
    }

    #[tokio::test]
    async fn control_plane_pod_discovery_filters_non_running() {
        let inventory = FakeInventory {
            nodes: vec![],
            pods: vec![
                PodInfo { name: "etcd-1".into(), namespace: "kube-system".into(), phase: "Running".into() },
                PodInfo { name: "etcd-2".into(), namespace: "kube-system".into(), phase: "Pending".into() },
            ],
        };
        let targets = discover_targets(&inventory, Component::Etcd).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].pod_name.as_deref(), Some("etcd-1"));
        assert_eq!(targets[0].port, Some(2379));
    }
}
