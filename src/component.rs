// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The closed enumeration of scrapeable cluster components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A tagged origin for scraped metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    /// The cluster's API server.
    ApiServer,
    /// Per-node kubelet.
    Kubelet,
    /// Per-node cAdvisor, proxied through the kubelet.
    Cadvisor,
    /// Control-plane etcd pods.
    Etcd,
    /// Control-plane scheduler pods.
    Scheduler,
    /// Control-plane controller-manager pods.
    ControllerManager,
    /// kube-proxy pods.
    KubeProxy,
}

impl Component {
    /// All components in the closed set, in a stable order.
    pub const ALL: [Component; 7] = [
        Component::ApiServer,
        Component::Kubelet,
        Component::Cadvisor,
        Component::Etcd,
        Component::Scheduler,
        Component::ControllerManager,
        Component::KubeProxy,
    ];

    /// Whether this component is discovered via the control-plane pod path
    /// (as opposed to the single apiserver target or the per-node path).
    pub fn is_control_plane_pod(self) -> bool {
        matches!(
            self,
            Component::Etcd | Component::Scheduler | Component::ControllerManager | Component::KubeProxy
        )
    }

    /// Whether this component is discovered via the per-node proxy path.
    pub fn is_per_node(self) -> bool {
        matches!(self, Component::Kubelet | Component::Cadvisor)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Component::ApiServer => "apiserver",
            Component::Kubelet => "kubelet",
            Component::Cadvisor => "cadvisor",
            Component::Etcd => "etcd",
            Component::Scheduler => "scheduler",
            Component::ControllerManager => "controller-manager",
            Component::KubeProxy => "kube-proxy",
        };
        f.write_str(s)
    }
}

impl FromStr for Component {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "apiserver" => Ok(Component::ApiServer),
            "kubelet" => Ok(Component::Kubelet),
            "cadvisor" => Ok(Component::Cadvisor),
            "etcd" => Ok(Component::Etcd),
            "scheduler" => Ok(Component::Scheduler),
            "controller-manager" => Ok(Component::ControllerManager),
            "kube-proxy" => Ok(Component::KubeProxy),
            other => Err(format!("unknown component: {other}")),
        }
    }
}
