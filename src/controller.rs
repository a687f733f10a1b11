// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The collector controller: owns the scrape/cleanup/rediscovery loops and
//! their lifecycle.
//!
//! Rust has no ambient per-request `Context` to carry cancellation, so loop
//! shutdown is wired explicitly with a `tokio::sync::watch` channel cloned
//! into every spawned task.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::component::Component;
use crate::config::DirectScrapeConfig;
use crate::error::{CollectorError, Result};
use crate::scrape::{ClusterInventory, ProxyClient, ScrapeConfig, Scraper};
use crate::store::{ScrapedMetrics, Store, StoreConfig};

const REDISCOVERY_INTERVAL: Duration = Duration::from_secs(300);
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

type MetricsCallback = Arc<dyn Fn(Component, &ScrapedMetrics) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(Component, &CollectorError) + Send + Sync>;

/// Owns the store and scraper, and drives the periodic scrape, retention
/// cleanup, and rediscovery loops while running.
pub struct Collector {
    store: Arc<Store>,
    scraper: Arc<Scraper>,
    config: RwLock<DirectScrapeConfig>,
    running: AtomicBool,
    cancel_tx: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    on_metrics: RwLock<Option<MetricsCallback>>,
    on_error: RwLock<Option<ErrorCallback>>,
    available: Arc<RwLock<HashSet<Component>>>,
}

impl Collector {
    /// Construct a collector over the given collaborators. The config is
    /// validated up front; an invalid config never produces a collector.
    pub fn new(
        inventory: Arc<dyn ClusterInventory>,
        proxy: Arc<dyn ProxyClient>,
        config: DirectScrapeConfig,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(Store::new(StoreConfig {
            retention: config.retention,
            max_samples_per_series: config.max_samples_per_series,
        }));
        let scraper = Arc::new(Scraper::new(
            inventory,
            proxy,
            ScrapeConfig {
                timeout: config.scrape_interval.min(Duration::from_secs(10)),
            },
        ));

        Ok(Self {
            store,
            scraper,
            config: RwLock::new(config),
            running: AtomicBool::new(false),
            cancel_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            on_metrics: RwLock::new(None),
            on_error: RwLock::new(None),
            available: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    /// Shared handle to the retention-bounded store this collector fills.
    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    /// Whether the scrape/cleanup/rediscovery loops are currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Components discovery found at least one enabled target for, as of
    /// the last discovery pass.
    pub fn available_components(&self) -> Vec<Component> {
        let mut v: Vec<Component> = self.available.read().iter().copied().collect();
        v.sort();
        v
    }

    /// Register the callback invoked after each successful component
    /// scrape, with no locks held.
    pub fn set_on_metrics_collected(&self, callback: impl Fn(Component, &ScrapedMetrics) + Send + Sync + 'static) {
        *self.on_metrics.write() = Some(Arc::new(callback));
    }

    /// Register the callback invoked when a component scrape or store merge
    /// fails, with no locks held.
    pub fn set_on_error(&self, callback: impl Fn(Component, &CollectorError) + Send + Sync + 'static) {
        *self.on_error.write() = Some(Arc::new(callback));
    }

    /// Replace the scrape configuration. Only legal while stopped, since the
    /// running loops close over a snapshot taken at `start`.
    pub fn set_config(&self, config: DirectScrapeConfig) -> Result<()> {
        if self.is_running() {
            return Err(CollectorError::ConfigInvalid(
                "cannot reconfigure a running collector; call stop first".to_string(),
            ));
        }
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    /// Start the collector: run one synchronous discovery pass, then launch
    /// the scrape, cleanup, and rediscovery loops in the background.
    ///
    /// Rejects if already running.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CollectorError::AlreadyRunning);
        }

        let config = self.config.read().clone();

        self.scraper.discover(&config.components).await;
        self.refresh_available(&config.components);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        *self.cancel_tx.lock() = Some(cancel_tx);

        let scrape_handle = tokio::spawn(Self::scrape_loop(
            self.store.clone(),
            self.scraper.clone(),
            config.components.clone(),
            config.scrape_interval,
            self.on_metrics.read().clone(),
            self.on_error.read().clone(),
            cancel_rx.clone(),
        ));

        let cleanup_period = (config.retention / 4).max(MIN_CLEANUP_INTERVAL);
        let cleanup_handle = tokio::spawn(Self::cleanup_loop(self.store.clone(), cleanup_period, cancel_rx.clone()));

        let rediscovery_handle = tokio::spawn(Self::rediscovery_loop(
            self.scraper.clone(),
            self.available.clone(),
            config.components.clone(),
            cancel_rx,
        ));

        *self.tasks.lock() = vec![scrape_handle, cleanup_handle, rediscovery_handle];

        info!(components = ?config.components, "collector started");
        Ok(())
    }

    /// Stop the collector: signal cancellation and await every loop task.
    ///
    /// Rejects if not running.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(CollectorError::SourceNotRunning);
        }

        if let Some(tx) = self.cancel_tx.lock().take() {
            let _ = tx.send(true);
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        join_all(handles).await;

        info!("collector stopped");
        Ok(())
    }

    fn refresh_available(&self, components: &[Component]) {
        let mut available = self.available.write();
        available.clear();
        for &component in components {
            if !self.scraper.targets_for(component).is_empty() {
                available.insert(component);
            }
        }
    }

    async fn scrape_loop(
        store: Arc<Store>,
        scraper: Arc<Scraper>,
        components: Vec<Component>,
        interval: Duration,
        on_metrics: Option<MetricsCallback>,
        on_error: Option<ErrorCallback>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let jobs = components.iter().map(|&component| {
                        let store = store.clone();
                        let scraper = scraper.clone();
                        let on_metrics = on_metrics.clone();
                        let on_error = on_error.clone();
                        async move {
                            match scraper.scrape_component(component).await {
                                Ok(scraped) => {
                                    if let Some(cb) = &on_metrics {
                                        cb(component, &scraped);
                                    }
                                    if let Err(err) = store.add_metrics(scraped) {
                                        warn!(component = %component, error = %err, "failed to merge scrape into store");
                                        if let Some(cb) = &on_error {
                                            cb(component, &err);
                                        }
                                    }
                                }
                                Err(err) => {
                                    debug!(component = %component, error = %err, "scrape failed");
                                    if let Some(cb) = &on_error {
                                        cb(component, &err);
                                    }
                                }
                            }
                        }
                    });
                    join_all(jobs).await;
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn cleanup_loop(store: Arc<Store>, period: Duration, mut cancel_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // swallow the immediate first tick; nothing to clean up yet
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    store.cleanup();
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn rediscovery_loop(
        scraper: Arc<Scraper>,
        available: AvailableHandle,
        components: Vec<Component>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(REDISCOVERY_INTERVAL);
        ticker.tick().await; // the initial pass already ran synchronously in `start`
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    scraper.discover(&components).await;
                    let mut set = available.write();
                    set.clear();
                    for &component in &components {
                        if !scraper.targets_for(component).is_empty() {
                            set.insert(component);
                        }
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// A cloneable handle to the `available` set, so the rediscovery loop can
/// update it without the `Collector` itself needing to be `Clone`.
type AvailableHandle = Arc<RwLock<HashSet<Component>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrape::target::{NodeInfo, PodInfo};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FakeInventory;

    #[async_trait]
    impl ClusterInventory for FakeInventory {
        async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
            Ok(vec![NodeInfo { name: "n1".into() }])
        }
        async fn list_pods(&self, _ns: &str, _sel: &str) -> Result<Vec<PodInfo>> {
            Ok(Vec::new())
        }
    }

    struct FakeProxy;

    #[async_trait]
    impl ProxyClient for FakeProxy {
        async fn get_node_proxy(&self, _node: &str, _path: &str, _timeout: Duration) -> Result<String> {
            Ok("container_cpu_usage_seconds_total{id=\"/\"} 1\n".to_string())
        }
        async fn get_pod_proxy(
            &self,
            _ns: &str,
            _pod: &str,
            _port: u16,
            _path: &str,
            _timeout: Duration,
        ) -> Result<String> {
            Ok(String::new())
        }
        async fn get_root(&self, _path: &str, _timeout: Duration) -> Result<String> {
            Ok("up 1\n".to_string())
        }
    }

    fn fast_config() -> DirectScrapeConfig {
        DirectScrapeConfig {
            scrape_interval: Duration::from_secs(5),
            retention: Duration::from_secs(300),
            max_samples_per_series: 100,
            components: vec![Component::ApiServer],
        }
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let collector = Collector::new(Arc::new(FakeInventory), Arc::new(FakeProxy), fast_config()).unwrap();
        collector.start().await.unwrap();
        let err = collector.start().await.unwrap_err();
        assert!(matches!(err, CollectorError::AlreadyRunning));
        collector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_before_start_is_rejected() {
        let collector = Collector::new(Arc::new(FakeInventory), Arc::new(FakeProxy), fast_config()).unwrap();
        let err = collector.stop().await.unwrap_err();
        assert!(matches!(err, CollectorError::SourceNotRunning));
    }

    #[tokio::test]
    async fn reconfigure_while_running_is_rejected() {
        let collector = Collector::new(Arc::new(FakeInventory), Arc::new(FakeProxy), fast_config()).unwrap();
        collector.start().await.unwrap();
        assert!(collector.set_config(fast_config()).is_err());
        collector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn metrics_callback_fires_after_start() {
        let collector = Collector::new(Arc::new(FakeInventory), Arc::new(FakeProxy), fast_config()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        collector.set_on_metrics_collected(move |_component, _scraped| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        collector.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        collector.stop().await.unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
