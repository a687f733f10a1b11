// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A small, hand-rolled parser for the Prometheus text exposition format.
//!
//! Per the design notes this stays intentionally minimal: histogram and
//! summary decomposition (buckets, quantiles) is out of scope — the sample
//! count is taken as the family's scalar value. The parser is stateless and
//! reentrant; a line that fails to parse is skipped rather than aborting
//! the rest of the body, since real exposition bodies are large and a
//! single malformed line should not blank out everything else.

use std::collections::HashMap;

use crate::labels::{LabelSet, NAME_LABEL};
use crate::store::{FamilySeries, MetricFamily, MetricKind, Sample};

/// Parse one exposition-format text body into a map of metric name to
/// family. Unparseable lines are skipped; a family's series are keyed by
/// their rendered label set so repeated identical label sets within one
/// body accumulate into one series.
pub fn parse(body: &str) -> HashMap<String, MetricFamily> {
    let mut families: HashMap<String, MetricFamily> = HashMap::new();
    let mut help: HashMap<String, String> = HashMap::new();
    let mut kinds: HashMap<String, MetricKind> = HashMap::new();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("# HELP ") {
            if let Some((name, text)) = rest.split_once(' ') {
                help.insert(name.to_string(), text.to_string());
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("# TYPE ") {
            if let Some((name, kind)) = rest.split_once(' ') {
                kinds.insert(name.to_string(), parse_kind(kind.trim()));
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let Some((name, labels, value)) = parse_sample_line(line) else {
            continue;
        };

        let family_name = base_metric_name(&name);
        let declared_kind = kinds.get(&family_name).copied();
        let is_decomposed = matches!(declared_kind, Some(MetricKind::Histogram) | Some(MetricKind::Summary));
        // Buckets and sums of a histogram/summary are decomposition detail
        // this core doesn't keep; only the `_count` sample survives, as the
        // family's scalar value.
        if is_decomposed && (name.ends_with("_bucket") || name.ends_with("_sum")) {
            continue;
        }

        let family = families
            .entry(family_name.clone())
            .or_insert_with(|| MetricFamily::new(&family_name, MetricKind::Untyped));
        if let Some(k) = declared_kind {
            family.kind = k;
        }
        if let Some(h) = help.get(&family_name) {
            family.help = Some(h.clone());
        }

        let mut label_set = LabelSet::new();
        label_set.insert(NAME_LABEL, family_name.clone());
        for (k, v) in labels {
            label_set.insert(k, v);
        }

        family.series.push(FamilySeries {
            labels: label_set,
            samples: vec![Sample::new(chrono::Utc::now().timestamp_millis(), value)],
        });
    }

    families
}

fn parse_kind(raw: &str) -> MetricKind {
    match raw {
        "counter" => MetricKind::Counter,
        "gauge" => MetricKind::Gauge,
        "histogram" => MetricKind::Histogram,
        "summary" => MetricKind::Summary,
        _ => MetricKind::Untyped,
    }
}

// `# TYPE` lines declare the family name; individual histogram/summary
// samples carry suffixes (`_bucket`, `_sum`, `_count`) that this core does
// not decompose, so we fold them back to the family name for lookup
// purposes.
fn base_metric_name(name: &str) -> String {
    for suffix in ["_bucket", "_sum", "_count"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    name.to_string()
}

/// Parse one `name{labels} value` line (labels optional).
fn parse_sample_line(line: &str) -> Option<(String, Vec<(String, String)>, f64)> {
    let (name_and_labels, rest) = line.rsplit_once(' ')?;
    let value: f64 = rest.trim().parse().ok()?;

    if let Some(open) = name_and_labels.find('{') {
        let name = name_and_labels[..open].trim().to_string();
        if name.is_empty() {
            return None;
        }
        let close = name_and_labels.rfind('}')?;
        let label_body = &name_and_labels[open + 1..close];
        let labels = parse_label_body(label_body);
        Some((name, labels, value))
    } else {
        let name = name_and_labels.trim().to_string();
        if name.is_empty() {
            return None;
        }
        Some((name, Vec::new(), value))
    }
}

fn parse_label_body(body: &str) -> Vec<(String, String)> {
    let mut labels = Vec::new();
    let mut start = 0usize;

    while start < body.len() {
        // name
        let eq = match body[start..].find('=') {
            Some(i) => start + i,
            None => break,
        };
        let name = body[start..eq].trim().to_string();

        // value: "..." possibly containing escaped quotes
        let mut i = eq + 1;
        let bytes = body.as_bytes();
        if i >= bytes.len() || bytes[i] != b'"' {
            break;
        }
        i += 1;
        let value_start = i;
        let mut escaped = String::new();
        let mut raw_has_escape = false;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' if i + 1 < bytes.len() => {
                    raw_has_escape = true;
                    escaped.push(bytes[i + 1] as char);
                    i += 2;
                }
                b'"' => break,
                c => {
                    escaped.push(c as char);
                    i += 1;
                }
            }
        }
        let value = if raw_has_escape {
            escaped
        } else {
            body[value_start..i].to_string()
        };
        labels.push((name, value));

        i += 1; // closing quote
        while i < bytes.len() && (bytes[i] == b',' || bytes[i] == b' ') {
            i += 1;
        }
        start = i;
    }

    labels
}
