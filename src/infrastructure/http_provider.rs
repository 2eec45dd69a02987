// HTTP data provider - Query-template backend returning series JSON
use crate::application::data_provider::{DataProvider, ProviderError};
use crate::domain::{Decimation, FetchRequest, FetchResult};
use crate::infrastructure::config::{ProviderSettings, prepare_query};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct HttpDataProvider {
    host: String,
    token: String,
    query_template: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    results: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    series: Option<Vec<Series>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    columns: Vec<String>,
    values: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    tags: Option<HashMap<String, String>>,
}

impl HttpDataProvider {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            host: settings.host.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            query_template: settings.query_template.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn render_query(&self, request: &FetchRequest) -> String {
        let optional = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
        let vars: HashMap<String, String> = [
            ("source", request.source_id.clone()),
            ("variable", request.variable.clone()),
            ("start", optional(request.time_start)),
            ("end", optional(request.time_end)),
            ("pulse", request.pulse_id.map(|p| p.to_string()).unwrap_or_default()),
            ("max_samples", request.max_samples.to_string()),
            (
                "decimation",
                request.decimation.unwrap_or(Decimation::Mean).as_str().to_string(),
            ),
            ("time_format", request.time_format.as_str().to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        prepare_query(&self.query_template, &vars)
    }

    async fn execute_query(&self, query: &str, request: &FetchRequest) -> Result<QueryResponse, ProviderError> {
        let url = format!("{}/query?q={}", self.host, urlencoding::encode(query));

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(request, Some(status), &body));
        }

        let data = response
            .json::<QueryResponse>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        if let Some(error) = data.results.first().and_then(|r| r.error.as_deref()) {
            return Err(classify_failure(request, None, error));
        }

        Ok(data)
    }
}

#[async_trait]
impl DataProvider for HttpDataProvider {
    fn name(&self) -> &str {
        &self.host
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResult, ProviderError> {
        let query = self.render_query(request);
        tracing::debug!("Executing signal query for '{}': {}", request.variable, query);
        let response = self.execute_query(&query, request).await?;

        let (points, y_unit) = collect_points(&response)?;
        if points.is_empty() {
            return Err(ProviderError::Rejected {
                code: 404,
                message: format!("no data for '{}'", request.variable),
            });
        }

        let downsampled = points.len() > request.max_samples;
        let points = downsample_points(points, request.max_samples);
        let (x, y) = points.into_iter().unzip();

        let mut result = FetchResult::new(x, y, "s", y_unit);
        result.is_downsampled = downsampled;
        Ok(result)
    }
}

fn classify_failure(request: &FetchRequest, status: Option<StatusCode>, body: &str) -> ProviderError {
    if status == Some(StatusCode::PAYLOAD_TOO_LARGE) || body.to_lowercase().contains("sample limit") {
        return ProviderError::SampleLimitExceeded {
            variable: request.variable.clone(),
            requested: request.max_samples,
        };
    }
    let code = status.map_or(-1, |s| i32::from(s.as_u16()));
    let message = if body.is_empty() {
        format!("query for '{}' failed with status {}", request.variable, code)
    } else {
        body.trim().to_string()
    };
    ProviderError::Rejected { code, message }
}

/// Time column as seconds: numbers pass through, RFC 3339 strings are converted.
fn parse_time(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.timestamp_micros() as f64 / 1e6),
        _ => None,
    }
}

fn collect_points(response: &QueryResponse) -> Result<(Vec<(f64, f64)>, String), ProviderError> {
    let mut points = Vec::new();
    let mut unit = String::new();

    let Some(series) = response.results.first().and_then(|r| r.series.as_ref()) else {
        return Ok((points, unit));
    };

    for s in series {
        let time_idx = s.columns.iter().position(|c| c == "time").unwrap_or(0);
        let value_idx = s
            .columns
            .iter()
            .position(|c| c == "value" || c == "mean" || c == "min" || c == "max")
            .unwrap_or(1);
        if time_idx == value_idx {
            return Err(ProviderError::Decode("series has no value column".to_string()));
        }
        if let Some(u) = s.tags.as_ref().and_then(|t| t.get("unit")) {
            unit = u.clone();
        }

        for row in &s.values {
            let time = row.get(time_idx).and_then(parse_time);
            let value = row.get(value_idx).and_then(serde_json::Value::as_f64);
            if let (Some(time), Some(value)) = (time, value) {
                points.push((time, value));
            }
        }
    }

    points.sort_by(|a, b| a.0.total_cmp(&b.0));
    Ok((points, unit))
}

/// Downsample (time, value) points using bucket averaging
fn downsample_points(points: Vec<(f64, f64)>, max_points: usize) -> Vec<(f64, f64)> {
    if points.is_empty() || max_points == 0 || points.len() <= max_points {
        return points;
    }

    let bucket_size = (points.len() as f64 / max_points as f64).ceil() as usize;
    let mut downsampled = Vec::with_capacity(max_points);

    for chunk in points.chunks(bucket_size) {
        // Middle point's timestamp with the bucket's average value
        let mid = chunk[chunk.len() / 2].0;
        let avg = chunk.iter().map(|p| p.1).sum::<f64>() / chunk.len() as f64;
        downsampled.push((mid, avg));
    }

    downsampled
}
