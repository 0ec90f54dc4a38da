//! Prometheus client for node telemetry lookups.
//!
//! Used by the action selector to check whether a CPU breach is sustained
//! before deciding between diagnostics and an advisory no-op.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Default Prometheus URL (node-exporter scrape target on the monitoring host)
const DEFAULT_PROMETHEUS_URL: &str = "http://localhost:9090";

/// Configuration for the Prometheus client
#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    /// Base URL for the Prometheus API
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Label that carries the node id on node-exporter series
    pub node_label: String,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PROMETHEUS_URL.to_string(),
            timeout_secs: 30,
            node_label: "instance".to_string(),
        }
    }
}

/// `/api/v1/query_range` envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum RangeResponse {
    Success {
        data: Matrix,
    },
    Error {
        #[serde(rename = "errorType", default)]
        error_type: String,
        #[serde(default)]
        error: String,
    },
}

#[derive(Debug, Deserialize)]
struct Matrix {
    result: Vec<Series>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    metric: HashMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

impl Series {
    /// Samples with a parseable value; `NaN` and garbage are skipped.
    fn into_samples(self) -> impl Iterator<Item = MetricSample> {
        let labels = self.metric;
        self.values.into_iter().filter_map(move |(ts, raw)| {
            let value = raw.parse::<f64>().ok().filter(|v| v.is_finite())?;
            Some(MetricSample {
                labels: labels.clone(),
                value,
                timestamp: DateTime::from_timestamp(ts as i64, 0).unwrap_or_else(Utc::now),
            })
        })
    }
}

/// A metric sample from Prometheus
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    /// Labels associated with this metric
    pub labels: HashMap<String, String>,
    /// The metric value
    pub value: f64,
    /// Timestamp of the sample
    pub timestamp: DateTime<Utc>,
}

/// Recent-samples lookup used by the selector.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricsLookup: Send + Sync {
    /// Samples of `metric` for `node_id` over the trailing `window`.
    async fn recent_samples(
        &self,
        node_id: &str,
        metric: &str,
        window: Duration,
    ) -> Result<Vec<MetricSample>>;
}

/// Prometheus client for querying metrics
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    config: PrometheusConfig,
    client: reqwest::Client,
}

impl PrometheusClient {
    /// Create a new Prometheus client with the given configuration.
    #[must_use]
    pub fn new(config: PrometheusConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client for Prometheus");
                reqwest::Client::new()
            });

        Self { config, client }
    }

    /// Create a client for `base_url` with default settings.
    #[must_use]
    pub fn with_url(base_url: impl Into<String>) -> Self {
        Self::new(PrometheusConfig {
            base_url: base_url.into(),
            ..PrometheusConfig::default()
        })
    }

    /// Run a range query and flatten every returned series.
    pub async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<MetricSample>> {
        let url = format!("{}/api/v1/query_range", self.config.base_url.trim_end_matches('/'));
        let step = format!("{}s", step.as_secs().max(1));
        debug!(%query, %start, %end, %step, "Prometheus range query");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("query", query),
                ("start", &start.timestamp().to_string()),
                ("end", &end.timestamp().to_string()),
                ("step", &step),
            ])
            .send()
            .await
            .context("Prometheus unreachable")?;

        let status = response.status();
        let body = response.text().await.context("Failed to read Prometheus response")?;
        match serde_json::from_str::<RangeResponse>(&body) {
            Ok(RangeResponse::Success { data }) => {
                Ok(data.result.into_iter().flat_map(Series::into_samples).collect())
            }
            Ok(RangeResponse::Error { error_type, error }) => {
                bail!("Prometheus rejected query ({status}, {error_type}): {error}")
            }
            Err(_) if !status.is_success() => bail!("Prometheus returned {status}: {body}"),
            Err(e) => Err(e).context("Malformed Prometheus range response"),
        }
    }

    /// Build the `PromQL` expression for a node metric.
    #[must_use]
    pub fn promql_for(&self, node_id: &str, metric: &str) -> String {
        let label = &self.config.node_label;
        let node = escape_label_value(node_id);
        let sel = format!(r#"{label}=~"{node}(:.*)?""#);

        match metric.to_lowercase().as_str() {
            "cpuutilization" => format!(
                r#"100 - (avg by ({label}) (rate(node_cpu_seconds_total{{mode="idle",{sel}}}[5m])) * 100)"#
            ),
            "memoryutilization" => format!(
                "(1 - node_memory_MemAvailable_bytes{{{sel}}} / node_memory_MemTotal_bytes{{{sel}}}) * 100"
            ),
            "diskutilization" => format!(
                r#"(1 - node_filesystem_avail_bytes{{mountpoint="/",{sel}}} / node_filesystem_size_bytes{{mountpoint="/",{sel}}}) * 100"#
            ),
            _ => format!("{metric}{{{sel}}}"),
        }
    }
}

#[async_trait]
impl MetricsLookup for PrometheusClient {
    async fn recent_samples(
        &self,
        node_id: &str,
        metric: &str,
        window: Duration,
    ) -> Result<Vec<MetricSample>> {
        let end = Utc::now();
        let start = end - chrono::Duration::from_std(window).context("Window out of range")?;
        let query = self.promql_for(node_id, metric);
        self.query_range(&query, start, end, step_for(window)).await
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', r"\\").replace('"', r#"\""#)
}

/// Roughly fifteen points per window, never finer than the scrape interval.
fn step_for(window: Duration) -> Duration {
    Duration::from_secs((window.as_secs() / 15).max(15))
}
