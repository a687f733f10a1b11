// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The proxy-client collaborator contract and its `reqwest`-backed
//! implementation.
//!
//! Listing nodes/pods is out of scope (that belongs to the orchestrator
//! client wrapper); issuing the GET itself against the node-proxy /
//! pod-proxy / root resources is in scope, as those are the exact
//! outbound calls a scrape makes.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CollectorError, Result};

/// The external collaborator that performs one scrape GET. A production
/// implementation wraps the orchestrator's proxy sub-resources; this trait
/// is the seam the [`crate::scrape::Scraper`] depends on.
#[async_trait]
pub trait ProxyClient: Send + Sync {
    /// GET `nodes/<node>/proxy/<path>`.
    async fn get_node_proxy(&self, node: &str, path: &str, timeout: Duration) -> Result<String>;

    /// GET `namespaces/<namespace>/pods/<pod>:<port>/proxy/<path>`.
    async fn get_pod_proxy(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
        path: &str,
        timeout: Duration,
    ) -> Result<String>;

    /// GET `<path>` against the cluster root (used for the apiserver's own
    /// `/metrics`).
    async fn get_root(&self, path: &str, timeout: Duration) -> Result<String>;
}

/// A `reqwest`-backed [`ProxyClient`] talking to a cluster API server.
pub struct ReqwestProxyClient {
    http: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl ReqwestProxyClient {
    /// Build a client against `base_url` (the cluster API server root),
    /// optionally authenticating with a bearer token.
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            bearer_token,
        }
    }

    async fn get(&self, url: String, timeout: Duration) -> Result<String> {
        let mut request = self.http.get(&url).timeout(timeout);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| CollectorError::TransportError {
            target: url.clone(),
            source: anyhow::anyhow!(e),
        })?;

        let status = response.status();
        if !status.is_success() {
            if status.as_u16() == 403 {
                return Err(CollectorError::PermissionDenied(url));
            }
            return Err(CollectorError::TransportError {
                target: url,
                source: anyhow::anyhow!("unexpected status {status}"),
            });
        }

        response
            .text()
            .await
            .map_err(|e| CollectorError::TransportError {
                target: url,
                source: anyhow::anyhow!(e),
            })
    }
}

#[async_trait]
impl ProxyClient for ReqwestProxyClient {
    async fn get_node_proxy(&self, node: &str, path: &str, timeout: Duration) -> Result<String> {
        let url = format!("{}/api/v1/nodes/{node}/proxy/{path}", self.base_url);
        self.get(url, timeout).await
    }

    async fn get_pod_proxy(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
        path: &str,
        timeout: Duration,
    ) -> Result<String> {
        let url = format!(
            "{}/api/v1/namespaces/{namespace}/pods/{pod}:{port}/proxy/{path}",
            self.base_url
        );
        self.get(url, timeout).await
    }

    async fn get_root(&self, path: &str, timeout: Duration) -> Result<String> {
        let url = format!("{}{path}", self.base_url);
        self.get(url, timeout).await
    }
}
