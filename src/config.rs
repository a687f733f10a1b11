// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Source selection and direct-scrape configuration.
//!
//! Validation here is hand-rolled rather than derived: the interesting
//! constraints are cross-field (a `direct-scrape` source requires a
//! populated `components` list; an `aggregated-api` source requires none of
//! the scrape knobs) rather than per-attribute range checks a derive macro
//! handles well.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::component::Component;
use crate::error::{CollectorError, Result};

const MIN_SCRAPE_INTERVAL: Duration = Duration::from_secs(5);
const MIN_RETENTION: Duration = Duration::from_secs(300);
const MIN_MAX_SAMPLES_PER_SERIES: usize = 100;

/// Which [`crate::source::MetricsSource`] backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Query a pre-aggregated metrics API (e.g. the orchestrator's metrics
    /// aggregator) rather than scraping directly.
    AggregatedApi,
    /// Run the in-process scraper/store/controller directly.
    DirectScrape,
    /// No metrics source configured.
    None,
}

/// Top-level source selection, carrying the configuration relevant to
/// whichever [`SourceKind`] is selected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Which backend to construct.
    pub kind: SourceKind,
    /// Required, and only meaningful, when `kind` is `direct-scrape`.
    pub direct_scrape: Option<DirectScrapeConfig>,
}

impl SourceConfig {
    /// A `none` source, carrying no further configuration.
    pub fn none() -> Self {
        Self {
            kind: SourceKind::None,
            direct_scrape: None,
        }
    }

    /// An `aggregated-api` source, carrying no further configuration (the
    /// aggregated client itself is supplied separately as a collaborator).
    pub fn aggregated_api() -> Self {
        Self {
            kind: SourceKind::AggregatedApi,
            direct_scrape: None,
        }
    }

    /// A `direct-scrape` source over the given scrape configuration.
    pub fn direct_scrape(config: DirectScrapeConfig) -> Self {
        Self {
            kind: SourceKind::DirectScrape,
            direct_scrape: Some(config),
        }
    }

    /// Check that `direct_scrape` is present iff `kind` requires it, and
    /// that it is internally well-formed.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            SourceKind::DirectScrape => {
                let cfg = self.direct_scrape.as_ref().ok_or_else(|| {
                    CollectorError::ConfigInvalid(
                        "direct-scrape source requires direct_scrape configuration".to_string(),
                    )
                })?;
                cfg.validate()
            }
            SourceKind::AggregatedApi | SourceKind::None => {
                if self.direct_scrape.is_some() {
                    return Err(CollectorError::ConfigInvalid(
                        "direct_scrape configuration is only meaningful for the direct-scrape source"
                            .to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Configuration for the direct-scrape [`crate::controller::Collector`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectScrapeConfig {
    /// How often each enabled component is scraped.
    #[serde(with = "duration_secs")]
    pub scrape_interval: Duration,
    /// How long samples are retained before eviction.
    #[serde(with = "duration_secs")]
    pub retention: Duration,
    /// Per-series ring-buffer capacity.
    pub max_samples_per_series: usize,
    /// Which components to scrape. Must be non-empty.
    pub components: Vec<Component>,
}

impl Default for DirectScrapeConfig {
    fn default() -> Self {
        Self {
            scrape_interval: Duration::from_secs(15),
            retention: Duration::from_secs(3600),
            max_samples_per_series: 1000,
            components: Component::ALL.to_vec(),
        }
    }
}

impl DirectScrapeConfig {
    /// Reject configurations that would make the collector spin too fast,
    /// retain too little history, or have nothing to scrape.
    pub fn validate(&self) -> Result<()> {
        if self.scrape_interval < MIN_SCRAPE_INTERVAL {
            return Err(CollectorError::ConfigInvalid(format!(
                "scrape_interval must be at least {MIN_SCRAPE_INTERVAL:?}, got {:?}",
                self.scrape_interval
            )));
        }
        if self.retention < MIN_RETENTION {
            return Err(CollectorError::ConfigInvalid(format!(
                "retention must be at least {MIN_RETENTION:?}, got {:?}",
                self.retention
            )));
        }
        if self.max_samples_per_series < MIN_MAX_SAMPLES_PER_SERIES {
            return Err(CollectorError::ConfigInvalid(format!(
                "max_samples_per_series must be at least {MIN_MAX_SAMPLES_PER_SERIES}, got {}",
                self.max_samples_per_series
            )));
        }
        if self.components.is_empty() {
            return Err(CollectorError::ConfigInvalid(
                "components must name at least one component to scrape".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
