use super::{http_client, AnalyticsProvider, MetricWindowRow};
use crate::contracts::{ToolError, ToolResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

const REQUEST_TIMEOUT_SECS: u64 = 15;
const GA4_API_BASE: &str = "https://analyticsdata.googleapis.com/v1beta";

/// # NDOC
/// component: `subsystems::change_tracking::providers::ga4`
/// purpose: Adapter over the GA4 Data API `runReport` endpoint.
pub struct Ga4Provider {
    property_id: String,
    access_token: String,
}

impl Ga4Provider {
    pub fn new(property_id: String, access_token: String) -> Self {
        Self {
            property_id,
            access_token,
        }
    }

    fn run_report_url(&self) -> String {
        format!("{GA4_API_BASE}/properties/{}:runReport", self.property_id)
    }

    async fn total_for_window(
        &self,
        client: &reqwest::Client,
        url: &str,
        metric: &str,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> ToolResult<f64> {
        let body = json!({
            "dateRanges": [{
                "startDate": window.0.format("%Y-%m-%d").to_string(),
                "endDate": window.1.format("%Y-%m-%d").to_string(),
            }],
            "dimensionFilter": {
                "filter": {
                    "fieldName": "pagePath",
                    "stringFilter": { "matchType": "EXACT", "value": url }
                }
            },
            "metrics": [{ "name": metric }],
        });

        let response = client
            .post(self.run_report_url())
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|err| ToolError::provider(format!("ga4 request failed: {err}"), true))?;

        if !response.status().is_success() {
            let retryable = response.status().is_server_error();
            return Err(ToolError::provider(
                format!("ga4 responded with status {}", response.status()),
                retryable,
            ));
        }

        let parsed: Ga4RunReportResponse = response
            .json()
            .await
            .map_err(|err| ToolError::provider(format!("ga4 response malformed: {err}"), false))?;

        let total = parsed
            .rows
            .into_iter()
            .filter_map(|row| row.metric_values.into_iter().next())
            .filter_map(|value| value.value.parse::<f64>().ok())
            .sum();
        Ok(total)
    }
}

#[derive(Debug, Deserialize, Default)]
struct Ga4RunReportResponse {
    #[serde(default)]
    rows: Vec<Ga4ReportRow>,
}

#[derive(Debug, Deserialize)]
struct Ga4ReportRow {
    #[serde(rename = "metricValues", default)]
    metric_values: Vec<Ga4MetricValue>,
}

#[derive(Debug, Deserialize)]
struct Ga4MetricValue {
    value: String,
}

#[async_trait]
impl AnalyticsProvider for Ga4Provider {
    fn label(&self) -> &'static str {
        "ga4"
    }

    async fn metrics_for_window(
        &self,
        url: &str,
        metric: &str,
        before_window: (DateTime<Utc>, DateTime<Utc>),
        after_window: (DateTime<Utc>, DateTime<Utc>),
    ) -> ToolResult<Vec<MetricWindowRow>> {
        let client = http_client(REQUEST_TIMEOUT_SECS)?;
        let before = self
            .total_for_window(&client, url, metric, before_window)
            .await?;
        let after = self
            .total_for_window(&client, url, metric, after_window)
            .await?;

        let change_percent = if before.abs() < f64::EPSILON {
            if after.abs() < f64::EPSILON {
                0.0
            } else {
                100.0
            }
        } else {
            ((after - before) / before) * 100.0
        };

        Ok(vec![MetricWindowRow {
            name: super::friendly_metric_name(metric),
            before,
            after,
            change_percent,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_report_url_is_scoped_to_property() {
        let provider = Ga4Provider::new("properties/123".to_string(), "token".to_string());
        assert!(provider.run_report_url().contains("properties/123"));
    }
}
