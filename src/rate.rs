// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Counter-to-rate derivation, windowed latest-sum aggregation, and the
//! series-key filter predicates the direct-scrape source binds its UI
//! concepts through.

use std::time::Duration;

use chrono::Utc;

use crate::component::Component;
use crate::error::{CollectorError, Result};
use crate::store::{Matchers, Sample, Store};

/// A predicate over a canonical series key, used to select which series of
/// a family contribute to a rate or sum. Boxed so callers can build one from
/// a closure or reuse one of the named predicates below.
pub type SeriesFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Matches series eligible for a pod's total CPU rate: rejects the `POD`
/// pause container and any per-CPU-core breakdown (a `cpu="…"` label whose
/// value is not `"total"`), to avoid double-counting per-core samples.
/// Unlike the memory filters below, this does not reject the pod-level
/// cgroup aggregate (`container=""`) — cAdvisor only emits a `cpu` label
/// on the aggregate's per-core breakdown, so individual containers (which
/// never carry one) and the aggregate's `cpu="total"` row are both valid
/// contributions.
pub fn workload_container_cpu_total(key: &str) -> bool {
    if key.contains(r#"container="POD""#) {
        return false;
    }
    match extract_label_value(key, "cpu") {
        Some(cpu) => cpu == "total",
        None => true,
    }
}

/// Matches individual workload container memory series: rejects the `POD`
/// pause container and the pod-level cgroup aggregate (`container=""`), so
/// summing every matching series gives the pod's memory usage without
/// double-counting against the aggregate.
pub fn workload_container_memory(key: &str) -> bool {
    !key.contains(r#"container="POD""#) && !key.contains(r#"container="""#)
}

/// Matches only the pod-level cgroup aggregate series (`container=""`).
/// Used as the memory fallback when no per-container series are present
/// (static pods scraped before cAdvisor has split out their containers).
pub fn pod_aggregate_memory(key: &str) -> bool {
    !key.contains(r#"container="POD""#) && key.contains(r#"container="""#)
}

fn make_filter(f: fn(&str) -> bool) -> SeriesFilter {
    Box::new(f)
}

/// The three named filters as boxed predicates, for callers that want to
/// store one in a binding table alongside a metric name.
pub fn workload_container_cpu_total_filter() -> SeriesFilter {
    make_filter(workload_container_cpu_total)
}

/// See [`workload_container_memory`].
pub fn workload_container_memory_filter() -> SeriesFilter {
    make_filter(workload_container_memory)
}

/// See [`pod_aggregate_memory`].
pub fn pod_aggregate_memory_filter() -> SeriesFilter {
    make_filter(pod_aggregate_memory)
}

/// Convert a CPU value in cores to millicores, rounding up. A
/// fractional-core sample (e.g. `0.1234` cores) should never report as `0m`
/// just because it truncated, so this always rounds toward more use rather
/// than less.
pub fn cores_to_millicores(cores: f64) -> u64 {
    (cores * 1000.0).ceil().max(0.0) as u64
}

/// Derive a counter's per-second rate over `window`, summing across every
/// series matching `metric`/`matchers` (and `filter`, if given).
///
/// For each series the rate is `(last.value - first.value) / Δt` using the
/// oldest and newest sample in the window. A negative delta is treated as a
/// counter reset: the process restarted and the counter began again from
/// zero, so the contribution becomes `last.value / Δt` instead. A series
/// with fewer than two samples in the window, or whose Δt is not positive,
/// contributes nothing. If no series contributes at all, the metric has
/// insufficient samples to produce a rate and an error is returned rather
/// than a misleading zero.
pub fn compute_rate(
    store: &Store,
    metric: &str,
    matchers: &Matchers,
    window: Duration,
    filter: Option<&SeriesFilter>,
) -> Result<f64> {
    let end_ms = Utc::now().timestamp_millis();
    let start_ms = end_ms - window.as_millis() as i64;

    let per_series = store.query_range_per_series(metric, matchers, start_ms, end_ms)?;

    let mut total = 0.0;
    let mut contributed = 0usize;

    for (key, mut samples) in per_series {
        if let Some(f) = filter {
            if !f(&key) {
                continue;
            }
        }
        if samples.len() < 2 {
            continue;
        }
        samples.sort_by_key(|s| s.timestamp_ms);

        let first = samples.first().copied().unwrap();
        let last = samples.last().copied().unwrap();
        let delta_t = (last.timestamp_ms - first.timestamp_ms) as f64 / 1000.0;
        if delta_t <= 0.0 {
            continue;
        }

        let delta_v = if last.value < first.value {
            last.value
        } else {
            last.value - first.value
        };

        total += delta_v / delta_t;
        contributed += 1;
    }

    if contributed == 0 {
        return Err(CollectorError::InsufficientSamplesForRate(metric.to_string()));
    }

    Ok(total)
}

/// Sum the newest sample of every series matching `metric`/`matchers`
/// (and `filter`, if given) within the trailing `window`. Used for gauges
/// where per-container samples need summing into a pod-level total, such
/// as memory working-set bytes across containers.
pub fn compute_latest_sum(
    store: &Store,
    metric: &str,
    matchers: &Matchers,
    window: Duration,
    filter: Option<&SeriesFilter>,
) -> Result<f64> {
    let end_ms = Utc::now().timestamp_millis();
    let start_ms = end_ms - window.as_millis() as i64;

    let per_series = store.query_range_per_series(metric, matchers, start_ms, end_ms)?;

    let mut total = 0.0;
    let mut matched = 0usize;

    for (key, samples) in per_series {
        if let Some(f) = filter {
            if !f(&key) {
                continue;
            }
        }
        if let Some(newest) = newest_sample(&samples) {
            total += newest.value;
            matched += 1;
        }
    }

    if matched == 0 {
        return Err(CollectorError::NoMatchingSeries {
            metric: metric.to_string(),
        });
    }

    Ok(total)
}

fn newest_sample(samples: &[Sample]) -> Option<Sample> {
    samples.iter().copied().max_by_key(|s| s.timestamp_ms)
}

/// A matcher set scoped to the whole-node cgroup (`id="/"`) on one node,
/// for node-level rate/sum queries.
pub fn node_matchers(node: &str) -> Matchers {
    let mut m = Matchers::new();
    m.insert("id".to_string(), "/".to_string());
    m.insert("node".to_string(), node.to_string());
    m
}

/// A matcher set scoped to one node without the whole-node-cgroup
/// restriction, for metrics that never carry an `id` label (e.g. network
/// and disk counters, which are per-device rather than per-cgroup).
pub fn node_only_matchers(node: &str) -> Matchers {
    let mut m = Matchers::new();
    m.insert("node".to_string(), node.to_string());
    m
}

/// A matcher set scoped to one pod, for container-level rate/sum queries.
pub fn pod_matchers(namespace: &str, pod: &str) -> Matchers {
    let mut m = Matchers::new();
    m.insert("namespace".to_string(), namespace.to_string());
    m.insert("pod".to_string(), pod.to_string());
    m
}

/// Whether `component` is the source component for CPU/memory cgroup
/// metrics (cAdvisor, proxied through the kubelet). Kept here rather than
/// on [`Component`] since it is a rate-layer concern, not a discovery one.
pub fn cgroup_source_component() -> Component {
    Component::Cadvisor
}

/// Pull `label`'s value out of a canonical series key (`name{a="1",b="2"}`)
/// without re-parsing it into a [`crate::labels::LabelSet`]. Assumes the
/// value contains no unescaped `"`, true for every label this crate reads
/// out of a series key (`pod`, `namespace`, `container`, `node`).
pub fn extract_label_value(series_key: &str, label: &str) -> Option<String> {
    let needle = format!("{label}=\"");
    let start = series_key.find(&needle)? + needle.len();
    let rest = &series_key[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::labels::{LabelSet, NAME_LABEL};
    use crate::store::{FamilySeries, MetricFamily, MetricKind, ScrapedMetrics, StoreConfig};

    fn push_sample(store: &Store, name: &str, labels: &[(&str, &str)], ts: i64, value: f64) {
        let mut label_set = LabelSet::new();
        label_set.insert(NAME_LABEL, name);
        for (k, v) in labels {
            label_set.insert(*k, *v);
        }
        let mut family = MetricFamily::new(name, MetricKind::Counter);
        family.series.push(FamilySeries {
            labels: label_set,
            samples: vec![Sample::new(ts, value)],
        });
        let mut scraped = ScrapedMetrics::new(Component::Cadvisor, "http://n/metrics/cadvisor");
        scraped.families.insert(name.to_string(), family);
        store.add_metrics(scraped).unwrap();
    }

    #[test]
    fn simple_rate_over_two_samples() {
        let store = Store::new(StoreConfig::default());
        push_sample(&store, "cpu_seconds_total", &[("node", "n1")], 0, 10.0);
        push_sample(&store, "cpu_seconds_total", &[("node", "n1")], 40_000, 14.0);

        let rate = compute_rate(
            &store,
            "cpu_seconds_total",
            &node_only_matchers("n1"),
            Duration::from_secs(600),
            None,
        )
        .unwrap();
        assert!((rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn counter_reset_uses_last_value_as_delta() {
        let store = Store::new(StoreConfig::default());
        push_sample(&store, "restarts_total", &[("node", "n1")], 0, 100.0);
        push_sample(&store, "restarts_total", &[("node", "n1")], 10_000, 3.0);

        let rate = compute_rate(
            &store,
            "restarts_total",
            &node_only_matchers("n1"),
            Duration::from_secs(600),
            None,
        )
        .unwrap();
        assert!((rate - 0.3).abs() < 1e-9);
    }

    #[test]
    fn insufficient_samples_errors_instead_of_returning_zero() {
        let store = Store::new(StoreConfig::default());
        push_sample(&store, "lonely_total", &[("node", "n1")], 0, 1.0);

        let err = compute_rate(
            &store,
            "lonely_total",
            &node_only_matchers("n1"),
            Duration::from_secs(600),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CollectorError::InsufficientSamplesForRate(_)));
    }

    #[test]
    fn cpu_total_rejects_pause_and_per_core_breakdown_but_accepts_aggregate() {
        let real = r#"container_cpu_usage_seconds_total{container="app",namespace="ns",pod="p"}"#;
        let pause = r#"container_cpu_usage_seconds_total{container="POD",namespace="ns",pod="p"}"#;
        let per_core = r#"container_cpu_usage_seconds_total{container="",cpu="0",namespace="ns",pod="p"}"#;
        let aggregate_total = r#"container_cpu_usage_seconds_total{container="",cpu="total",namespace="ns",pod="p"}"#;
        let no_cpu_label = r#"container_cpu_usage_seconds_total{container="",namespace="ns",pod="p"}"#;

        assert!(workload_container_cpu_total(real));
        assert!(!workload_container_cpu_total(pause));
        assert!(!workload_container_cpu_total(per_core));
        assert!(workload_container_cpu_total(aggregate_total));
        assert!(workload_container_cpu_total(no_cpu_label));
    }

    #[test]
    fn memory_filters_partition_individual_containers_from_the_aggregate() {
        let real = r#"container_memory_working_set_bytes{container="app",namespace="ns",pod="p"}"#;
        let pause = r#"container_memory_working_set_bytes{container="POD",namespace="ns",pod="p"}"#;
        let aggregate = r#"container_memory_working_set_bytes{container="",namespace="ns",pod="p"}"#;

        assert!(workload_container_memory(real));
        assert!(!workload_container_memory(pause));
        assert!(!workload_container_memory(aggregate));

        assert!(!pod_aggregate_memory(real));
        assert!(!pod_aggregate_memory(pause));
        assert!(pod_aggregate_memory(aggregate));
    }

    #[test]
    fn latest_sum_adds_newest_sample_per_container() {
        let store = Store::new(StoreConfig::default());
        push_sample(
            &store,
            "container_memory_working_set_bytes",
            &[("namespace", "ns"), ("pod", "p"), ("container", "c1")],
            0,
            100.0,
        );
        push_sample(
            &store,
            "container_memory_working_set_bytes",
            &[("namespace", "ns"), ("pod", "p"), ("container", "c2")],
            0,
            50.0,
        );

        let filter = workload_container_memory_filter();
        let sum = compute_latest_sum(
            &store,
            "container_memory_working_set_bytes",
            &pod_matchers("ns", "p"),
            Duration::from_secs(300),
            Some(&filter),
        )
        .unwrap();
        assert_eq!(sum, 150.0);
    }

    #[test]
    fn extracts_label_value_from_canonical_key() {
        let key = r#"container_cpu_usage_seconds_total{container="app",namespace="ns",pod="p"}"#;
        assert_eq!(extract_label_value(key, "container"), Some("app".to_string()));
        assert_eq!(extract_label_value(key, "pod"), Some("p".to_string()));
        assert_eq!(extract_label_value(key, "missing"), None);
    }

    #[test]
    fn cores_round_up_to_millicores() {
        assert_eq!(cores_to_millicores(0.1234), 124);
        assert_eq!(cores_to_millicores(0.0), 0);
        assert_eq!(cores_to_millicores(2.0), 2000);
    }
}
