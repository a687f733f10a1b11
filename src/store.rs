// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The in-memory, retention-bounded time-series store.
//!
//! A single `parking_lot::RwLock` protects every index: mutations (add,
//! cleanup) take the write lock, queries take the read lock, and scrape
//! workers may call `add_metrics` concurrently.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::component::Component;
use crate::error::{CollectorError, Result};
use crate::labels::{LabelSet, NAME_LABEL};
use crate::ringbuffer::RingBuffer;

/// A single `(timestamp, value)` observation. Copy-cheap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// The observed value.
    pub value: f64,
}

impl Sample {
    /// Construct a sample at the given timestamp.
    pub fn new(timestamp_ms: i64, value: f64) -> Self {
        Self { timestamp_ms, value }
    }

    /// A sample timestamped `now`.
    pub fn now(value: f64) -> Self {
        Self::new(Utc::now().timestamp_millis(), value)
    }
}

/// The exposition-format metric kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonically non-decreasing cumulative value.
    Counter,
    /// Instantaneous value.
    Gauge,
    /// Distribution; only the scalar sample count is retained.
    Histogram,
    /// Distribution with quantiles; only the scalar sample count is retained.
    Summary,
    /// No `# TYPE` line was present for this metric.
    Untyped,
}

/// One series as produced transiently by the scraper, before it is merged
/// into the store's owned [`TimeSeries`].
#[derive(Debug, Clone)]
pub struct FamilySeries {
    /// The series' label set, including the synthetic `__name__` label.
    pub labels: LabelSet,
    /// Samples produced by this one scrape (usually exactly one).
    pub samples: Vec<Sample>,
}

/// A family of series sharing one metric name, as produced by one parse or
/// scrape merge. Ownership transfers to the [`Store`] on `add_metrics`.
#[derive(Debug, Clone)]
pub struct MetricFamily {
    /// The metric name.
    pub name: String,
    /// The exposition-format kind.
    pub kind: MetricKind,
    /// `# HELP` text, if present.
    pub help: Option<String>,
    /// The series observed in this family.
    pub series: Vec<FamilySeries>,
    /// When this family was produced.
    pub last_updated: chrono::DateTime<Utc>,
}

impl MetricFamily {
    /// An empty family shell for the given name/kind, ready to accept
    /// series as the parser or scraper merge discovers them.
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            kind,
            help: None,
            series: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

/// The output of one scrape invocation.
#[derive(Debug, Clone)]
pub struct ScrapedMetrics {
    /// Which component this scrape targeted.
    pub component: Component,
    /// The endpoint that was scraped.
    pub endpoint: String,
    /// Parsed families, keyed by metric name.
    pub families: HashMap<String, MetricFamily>,
    /// When the scrape completed.
    pub scraped_at: chrono::DateTime<Utc>,
    /// Wall-clock duration of the scrape.
    pub duration: Duration,
    /// Set if the scrape failed; `add_metrics` rejects scrapes with this set.
    pub error: Option<String>,
}

impl ScrapedMetrics {
    /// A successful, empty scrape result ready to be filled in by a parser.
    pub fn new(component: Component, endpoint: impl Into<String>) -> Self {
        Self {
            component,
            endpoint: endpoint.into(),
            families: HashMap::new(),
            scraped_at: Utc::now(),
            duration: Duration::default(),
            error: None,
        }
    }

    /// A failed scrape result carrying the error, no families.
    pub fn failed(component: Component, endpoint: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            component,
            endpoint: endpoint.into(),
            families: HashMap::new(),
            scraped_at: Utc::now(),
            duration: Duration::default(),
            error: Some(error.into()),
        }
    }
}

/// A series owned exclusively by the store once added.
#[derive(Debug, Clone)]
struct TimeSeries {
    labels: LabelSet,
    samples: RingBuffer<Sample>,
}

/// Label-equality / simple-glob matchers used by every query.
pub type Matchers = HashMap<String, String>;

fn matcher_accepts(labels: &LabelSet, matchers: &Matchers) -> bool {
    matchers.iter().all(|(name, want)| match labels.get(name) {
        None => false,
        Some(actual) => {
            if want.contains('*') {
                actual.contains(&want.replace('*', ""))
            } else {
                actual == want
            }
        }
    })
}

/// Store configuration: retention window and per-series sample cap.
#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Samples older than `now - retention` are dropped by `cleanup`.
    pub retention: Duration,
    /// Per-series ring-buffer capacity.
    pub max_samples_per_series: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            max_samples_per_series: 1000,
        }
    }
}

struct StoreInner {
    // metric name -> series key -> series
    series: HashMap<String, HashMap<String, TimeSeries>>,
    label_names: HashSet<String>,
    label_values: HashMap<String, HashSet<String>>,
    total_series: u64,
    add_calls: u64,
}

impl StoreInner {
    fn new() -> Self {
        Self {
            series: HashMap::new(),
            label_names: HashSet::new(),
            label_values: HashMap::new(),
            total_series: 0,
            add_calls: 0,
        }
    }

    fn index_labels(&mut self, labels: &LabelSet) {
        for (name, value) in labels.iter() {
            self.label_names.insert(name.to_string());
            self.label_values
                .entry(name.to_string())
                .or_default()
                .insert(value.to_string());
        }
    }

    /// Rebuild `label_values` from scratch after an eviction. Cheap enough
    /// for a retention-cleanup pass, which is already O(total series).
    fn reindex_label_values(&mut self) {
        self.label_names.clear();
        self.label_values.clear();
        for series_map in self.series.values() {
            for series in series_map.values() {
                for (name, value) in series.labels.iter() {
                    self.label_names.insert(name.to_string());
                    self.label_values
                        .entry(name.to_string())
                        .or_default()
                        .insert(value.to_string());
                }
            }
        }
    }
}

/// The retention-bounded in-memory time-series store.
pub struct Store {
    inner: RwLock<StoreInner>,
    config: StoreConfig,
}

impl Store {
    /// Create an empty store with the given retention/cap configuration.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: RwLock::new(StoreInner::new()),
            config,
        }
    }

    /// Merge one scrape's families into the store.
    ///
    /// Rejects (returns `Err`, touches nothing) if `scraped.error` is set.
    /// Every Nth call — governed by `retention / 10` — triggers a cleanup
    /// pass after the merge completes.
    pub fn add_metrics(&self, scraped: ScrapedMetrics) -> Result<()> {
        if let Some(err) = scraped.error {
            return Err(CollectorError::TransportError {
                target: scraped.endpoint,
                source: anyhow::anyhow!(err),
            });
        }

        let mut inner = self.inner.write();
        for family in scraped.families.into_values() {
            let metric_series = inner.series.entry(family.name.clone()).or_default();
            for incoming in family.series {
                let key = incoming.labels.series_key();
                let cap = self.config.max_samples_per_series;
                let entry = metric_series.entry(key).or_insert_with(|| {
                    TimeSeries {
                        labels: incoming.labels.clone(),
                        samples: RingBuffer::new(cap),
                    }
                });
                for sample in incoming.samples {
                    entry.samples.add(sample);
                }
            }
        }

        // total_series / indexes reflect the post-merge state.
        inner.total_series = inner.series.values().map(|m| m.len() as u64).sum();
        let snapshot: Vec<LabelSet> = inner
            .series
            .values()
            .flat_map(|m| m.values().map(|s| s.labels.clone()))
            .collect();
        for labels in &snapshot {
            inner.index_labels(labels);
        }

        inner.add_calls += 1;
        let cleanup_every = (self.config.retention.as_secs() / 10).max(1);
        if inner.add_calls % cleanup_every == 0 {
            drop(inner);
            self.cleanup();
        }
        Ok(())
    }

    /// The sample with the greatest timestamp across every series matching
    /// `name`/`matchers`.
    pub fn query_latest(&self, name: &str, matchers: &Matchers) -> Result<f64> {
        let inner = self.inner.read();
        let Some(series_map) = inner.series.get(name) else {
            return Err(CollectorError::MetricAbsent(name.to_string()));
        };

        let mut best: Option<Sample> = None;
        for series in series_map.values() {
            if !matcher_accepts(&series.labels, matchers) {
                continue;
            }
            if let Some(last) = series.samples.last() {
                if best.map(|b| last.timestamp_ms > b.timestamp_ms).unwrap_or(true) {
                    best = Some(*last);
                }
            }
        }

        best.map(|s| s.value).ok_or_else(|| CollectorError::NoMatchingSeries {
            metric: name.to_string(),
        })
    }

    /// Every in-range sample across every matching series, flattened and
    /// sorted by timestamp.
    pub fn query_range(
        &self,
        name: &str,
        matchers: &Matchers,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Sample>> {
        let per_series = self.query_range_per_series(name, matchers, start_ms, end_ms)?;
        let mut flattened: Vec<Sample> = per_series.into_values().flatten().collect();
        flattened.sort_by_key(|s| s.timestamp_ms);
        Ok(flattened)
    }

    /// In-range samples per matching series, keyed by series key. The only
    /// correct input for rate derivation when several series share a name.
    pub fn query_range_per_series(
        &self,
        name: &str,
        matchers: &Matchers,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<HashMap<String, Vec<Sample>>> {
        let inner = self.inner.read();
        let Some(series_map) = inner.series.get(name) else {
            return Err(CollectorError::MetricAbsent(name.to_string()));
        };

        let mut result = HashMap::new();
        for (key, series) in series_map.iter() {
            if !matcher_accepts(&series.labels, matchers) {
                continue;
            }
            let mut in_range = Vec::new();
            series.samples.range(|s| {
                if s.timestamp_ms >= start_ms && s.timestamp_ms <= end_ms {
                    in_range.push(*s);
                }
                true
            });
            if !in_range.is_empty() {
                result.insert(key.clone(), in_range);
            }
        }
        Ok(result)
    }

    /// Sorted view of every metric name currently stored.
    pub fn get_metric_names(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner.series.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted view of every distinct value observed for label `name`.
    pub fn get_label_values(&self, name: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut values: Vec<String> = inner
            .label_values
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        values.sort();
        values
    }

    /// Evict samples older than `now - retention`; drop series and metric
    /// names emptied as a result.
    pub fn cleanup(&self) {
        let mut inner = self.inner.write();
        let cutoff_ms = Utc::now().timestamp_millis() - self.config.retention.as_millis() as i64;

        let mut empty_names = Vec::new();
        for (name, series_map) in inner.series.iter_mut() {
            let mut empty_keys = Vec::new();
            for (key, series) in series_map.iter_mut() {
                let survivors: Vec<Sample> = series
                    .samples
                    .slice()
                    .into_iter()
                    .filter(|s| s.timestamp_ms >= cutoff_ms)
                    .collect();
                series.samples.clear();
                for s in survivors {
                    series.samples.add(s);
                }
                if series.samples.is_empty() {
                    empty_keys.push(key.clone());
                }
            }
            for key in empty_keys {
                series_map.remove(&key);
            }
            if series_map.is_empty() {
                empty_names.push(name.clone());
            }
        }
        for name in empty_names {
            inner.series.remove(&name);
        }

        inner.total_series = inner.series.values().map(|m| m.len() as u64).sum();
        inner.reindex_label_values();
    }
}
