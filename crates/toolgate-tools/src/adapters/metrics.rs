use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use toolgate_protocol::{AdapterContext, AdapterError, AdapterResult, ToolAdapter};
use tracing::{debug, instrument, warn};

use super::{dry_run_result, parse_args};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeWindow {
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "24h")]
    OneDay,
}

impl TimeWindow {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FiveMinutes => "5m",
            Self::OneHour => "1h",
            Self::OneDay => "24h",
        }
    }

    pub fn duration(self) -> Duration {
        match self {
            Self::FiveMinutes => Duration::from_secs(5 * 60),
            Self::OneHour => Duration::from_secs(60 * 60),
            Self::OneDay => Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sample spacing that keeps every window around 60 to 300 points.
    pub fn step(self) -> Duration {
        match self {
            Self::FiveMinutes => Duration::from_secs(5),
            Self::OneHour => Duration::from_secs(30),
            Self::OneDay => Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Unix seconds.
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

impl MetricSummary {
    /// Summarise finite values; statistics are `None` for an empty series.
    pub fn from_points(points: &[MetricPoint]) -> Self {
        let mut values: Vec<f64> = points
            .iter()
            .map(|point| point.value)
            .filter(|value| value.is_finite())
            .collect();
        values.sort_by(f64::total_cmp);

        let count = values.len();
        if count == 0 {
            return Self {
                count,
                min: None,
                max: None,
                avg: None,
                p50: None,
                p95: None,
                p99: None,
            };
        }
        Self {
            count,
            min: values.first().copied(),
            max: values.last().copied(),
            avg: Some(values.iter().sum::<f64>() / count as f64),
            p50: nearest_rank(&values, 50.0),
            p95: nearest_rank(&values, 95.0),
            p99: nearest_rank(&values, 99.0),
        }
    }
}

fn nearest_rank(sorted: &[f64], percentile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted.get(rank.clamp(1, sorted.len()) - 1).copied()
}

/// Source of metric series.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn fetch(&self, metric: &str, window: TimeWindow)
    -> Result<Vec<MetricPoint>, AdapterError>;
}

/// In-process series, keyed by metric name.
#[derive(Debug, Clone, Default)]
pub struct StaticMetricsBackend {
    series: HashMap<String, Vec<MetricPoint>>,
}

impl StaticMetricsBackend {
    pub fn with_series(mut self, metric: impl Into<String>, points: Vec<MetricPoint>) -> Self {
        self.series.insert(metric.into(), points);
        self
    }
}

#[async_trait]
impl MetricsBackend for StaticMetricsBackend {
    async fn fetch(
        &self,
        metric: &str,
        window: TimeWindow,
    ) -> Result<Vec<MetricPoint>, AdapterError> {
        let since = Utc::now().timestamp() - window.duration().as_secs() as i64;
        Ok(self
            .series
            .get(metric)
            .map(|points| {
                points
                    .iter()
                    .filter(|point| point.timestamp >= since)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Prometheus HTTP API backend (`/api/v1/query_range`).
#[derive(Debug, Clone)]
pub struct PrometheusBackend {
    client: reqwest::Client,
    base_url: String,
}

impl PrometheusBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    #[serde(default)]
    data: Option<PrometheusData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    #[serde(default)]
    result: Vec<PrometheusSeries>,
}

#[derive(Debug, Deserialize)]
struct PrometheusSeries {
    #[serde(default)]
    values: Vec<(f64, String)>,
}

fn points_from_prometheus(body: PrometheusResponse) -> Result<Vec<MetricPoint>, AdapterError> {
    if body.status != "success" {
        return Err(AdapterError::Backend(format!(
            "prometheus query failed: {}",
            body.error.unwrap_or(body.status)
        )));
    }
    let mut points: Vec<MetricPoint> = body
        .data
        .map(|data| data.result)
        .unwrap_or_default()
        .into_iter()
        .flat_map(|series| series.values)
        .filter_map(|(timestamp, value)| {
            value.parse::<f64>().ok().map(|value| MetricPoint {
                timestamp: timestamp as i64,
                value,
            })
        })
        .collect();
    points.sort_by_key(|point| point.timestamp);
    Ok(points)
}

#[async_trait]
impl MetricsBackend for PrometheusBackend {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn fetch(
        &self,
        metric: &str,
        window: TimeWindow,
    ) -> Result<Vec<MetricPoint>, AdapterError> {
        let end = Utc::now().timestamp();
        let start = end - window.duration().as_secs() as i64;
        let response = self
            .client
            .get(format!("{}/api/v1/query_range", self.base_url))
            .query(&[
                ("query", metric.to_owned()),
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("step", format!("{}s", window.step().as_secs())),
            ])
            .send()
            .await
            .map_err(|err| AdapterError::Backend(err.to_string()))?;

        let status = response.status();
        let body: PrometheusResponse = response
            .json()
            .await
            .map_err(|err| AdapterError::Backend(format!("status {status}: {err}")))?;
        points_from_prometheus(body)
    }
}

#[derive(Debug, Deserialize)]
struct QueryMetricArgs {
    metric_name: String,
    window: TimeWindow,
}

pub struct MetricsQueryAdapter {
    backend: Arc<dyn MetricsBackend>,
    allowed_metrics: Vec<String>,
}

impl MetricsQueryAdapter {
    pub fn new(backend: Arc<dyn MetricsBackend>, allowed_metrics: Vec<String>) -> Self {
        Self {
            backend,
            allowed_metrics,
        }
    }

    #[instrument(skip(self, args, ctx), fields(request_id = %ctx.request_id))]
    async fn query_metric(
        &self,
        args: &Value,
        ctx: &AdapterContext,
    ) -> Result<AdapterResult, AdapterError> {
        let QueryMetricArgs {
            metric_name,
            window,
        } = parse_args(args)?;
        if !self.allowed_metrics.iter().any(|allowed| allowed == &metric_name) {
            warn!(metric = %metric_name, "metric refused by allow-list");
            return Err(AdapterError::not_allowed(format!(
                "metric not allowed: {metric_name}"
            )));
        }

        if ctx.dry_run {
            let mut extra = Map::new();
            extra.insert("metric_name".to_owned(), json!(metric_name));
            extra.insert("window".to_owned(), json!(window.as_str()));
            return Ok(dry_run_result(
                format!("Would query {metric_name} over {}", window.as_str()),
                extra,
            ));
        }

        let points: Vec<MetricPoint> = self
            .backend
            .fetch(&metric_name, window)
            .await?
            .into_iter()
            .filter(|point| point.value.is_finite())
            .collect();
        let summary = MetricSummary::from_points(&points);
        debug!(metric = %metric_name, points = summary.count, "metric fetched");

        Ok(AdapterResult::success(json!({
            "metric_name": metric_name,
            "window": window.as_str(),
            "points": points,
            "summary": summary,
        })))
    }
}

#[async_trait]
impl ToolAdapter for MetricsQueryAdapter {
    async fn run(
        &self,
        function: &str,
        args: &Value,
        ctx: &AdapterContext,
    ) -> Result<AdapterResult, AdapterError> {
        match function {
            "query_metric" => self.query_metric(args, ctx).await,
            other => Err(AdapterError::UnknownFunction(other.to_owned())),
        }
    }
}
